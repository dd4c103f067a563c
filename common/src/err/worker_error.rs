use std::io;
use std::num::ParseIntError;
use std::str::Utf8Error;
use std::string::FromUtf8Error;

use thiserror::Error;

/// Workspace-wide error type.
///
/// `Protocol` means the framing on the data channel is broken beyond
/// recovery; the connection has to be dropped. `Internal` errors are
/// reported to the client and the session continues.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A malformed frame, bad length, or truncation on the data channel.
    /// There is no resynchronization.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A command arrived out of the expected sequence (e.g. a bind value
    /// without a preceding bind name).
    #[error("out of sync: {0}")]
    OutOfSync(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// The peer closed the channel.
    #[error("connection closed")]
    Disconnected,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Utf8(#[from] Utf8Error),

    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),

    #[error(transparent)]
    ParseInt(#[from] ParseIntError),
}

impl WorkerError {
    pub fn is_disconnect(&self) -> bool {
        match self {
            WorkerError::Disconnected => true,
            WorkerError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }

    /// True for read timeouts on a channel configured with a read timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            WorkerError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timeout_classification() {
        let e = WorkerError::from(io::Error::new(io::ErrorKind::WouldBlock, "t"));
        assert!(e.is_timeout());
        assert!(!e.is_disconnect());

        let e = WorkerError::from(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(e.is_disconnect());
    }

    #[test]
    fn display_carries_detail() {
        let e = WorkerError::OutOfSync("BIND_VALUE".to_string());
        assert_eq!(e.to_string(), "out of sync: BIND_VALUE");
    }
}
