use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Commands a client (through the mux) sends on the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ClientCommand {
    Prepare = 1,
    BindName = 2,
    BindValue = 3,
    Execute = 4,
    Rows = 5,
    Cols = 6,
    Fetch = 7,
    Commit = 8,
    Rollback = 9,
    BindType = 10,
    ClientInfo = 11,
    Backtrace = 12,
    BindOutName = 13,
    PrepareSpecial = 14,
    TransStart = 15,
    TransTimeout = 16,
    TransRole = 17,
    TransPrepare = 18,
    BindNum = 19,
    BindValueMaxSize = 20,
    SqlStmtCaching = 21,
    ColsInfo = 22,
    PrepareV2 = 25,
    IntClientInfo = 26,
    ShardKey = 27,

    // server/handshake plane
    Ping = 1008,
    ClientInfoHandshake = 2007,
    CalCorrelationId = 2006,
    ProtocolVersion = 2008,
}

impl ClientCommand {
    /// Commands that may reach the database and therefore go through the
    /// host/SQL/table markdown gate.
    pub fn is_db_bound(self) -> bool {
        matches!(
            self,
            ClientCommand::PrepareSpecial
                | ClientCommand::BindName
                | ClientCommand::BindOutName
                | ClientCommand::Execute
                | ClientCommand::Rows
                | ClientCommand::Cols
                | ClientCommand::ColsInfo
                | ClientCommand::Fetch
                | ClientCommand::Commit
                | ClientCommand::Rollback
                | ClientCommand::TransPrepare
                | ClientCommand::TransStart
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ClientCommand::Prepare => "PREPARE",
            ClientCommand::BindName => "BIND_NAME",
            ClientCommand::BindValue => "BIND_VALUE",
            ClientCommand::Execute => "EXECUTE",
            ClientCommand::Rows => "ROWS",
            ClientCommand::Cols => "COLS",
            ClientCommand::Fetch => "FETCH",
            ClientCommand::Commit => "COMMIT",
            ClientCommand::Rollback => "ROLLBACK",
            ClientCommand::BindType => "BIND_TYPE",
            ClientCommand::ClientInfo => "CLIENT_INFO",
            ClientCommand::Backtrace => "BACKTRACE",
            ClientCommand::BindOutName => "BIND_OUT_NAME",
            ClientCommand::PrepareSpecial => "PREPARE_SPECIAL",
            ClientCommand::TransStart => "TRANS_START",
            ClientCommand::TransTimeout => "TRANS_TIMEOUT",
            ClientCommand::TransRole => "TRANS_ROLE",
            ClientCommand::TransPrepare => "TRANS_PREPARE",
            ClientCommand::BindNum => "BIND_NUM",
            ClientCommand::BindValueMaxSize => "BIND_VALUE_MAX_SIZE",
            ClientCommand::SqlStmtCaching => "SQL_STMT_CACHING",
            ClientCommand::ColsInfo => "COLS_INFO",
            ClientCommand::PrepareV2 => "PREPARE_V2",
            ClientCommand::IntClientInfo => "INT_CLIENT_INFO",
            ClientCommand::ShardKey => "SHARD_KEY",
            ClientCommand::Ping => "PING",
            ClientCommand::ClientInfoHandshake => "CLIENT_INFO",
            ClientCommand::CalCorrelationId => "SET_CAL_CORRELATION_ID",
            ClientCommand::ProtocolVersion => "PROTOCOL_VERSION",
        }
    }
}

/// Responses the worker writes on the data channel.
pub mod response {
    pub const SQL_ERROR: u32 = 1;
    pub const ERROR: u32 = 2;
    pub const VALUE: u32 = 3;
    pub const OK: u32 = 5;
    pub const NO_MORE_DATA: u32 = 6;
    pub const STILL_EXECUTING: u32 = 7;
    pub const MARKDOWN: u32 = 8;
}

/// Server-plane codes shared with the connection handshake.
pub mod server {
    pub const UNEXPECTED_COMMAND: u32 = 1006;
    pub const ALIVE: u32 = 1009;
    pub const INFO: u32 = 1011;
    pub const INT_INFO: u32 = 1012;
}

/// Worker <-> mux plane.
pub mod mux {
    pub const CONTROL_MSG: u32 = 501;
    pub const EOR: u32 = 502;
    pub const INTERRUPT: u32 = 503;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_round_trip() {
        for code in [1u32, 7, 14, 25, 27, 1008, 2006] {
            let cmd = ClientCommand::try_from(code).unwrap();
            let back: u32 = cmd.into();
            assert_eq!(back, code);
        }
        assert!(ClientCommand::try_from(9999u32).is_err());
    }

    #[test]
    fn db_bound_classification() {
        assert!(ClientCommand::Execute.is_db_bound());
        assert!(ClientCommand::Commit.is_db_bound());
        assert!(!ClientCommand::Prepare.is_db_bound()); // gated separately
        assert!(!ClientCommand::Backtrace.is_db_bound());
    }
}
