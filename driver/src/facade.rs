use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bind::{BindSlot, OutBindSlot};
use crate::define::{DateTimeId, DefineSlot, LobId};
use crate::error::DResult;
use crate::types::{
    ColumnInfo, ServerInfo, SessionAttr, StatementKind, TransCoupling, Xid,
};

pub type StmtId = u64;

/// Outcome of an execute call.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    /// Rows affected (DML) or fetched so far (SELECT).
    pub row_count: u64,
    /// Set when the driver reported success-with-info; the worker logs it
    /// and proceeds.
    pub warning: Option<crate::DriverError>,
}

/// Outcome of one block fetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOutcome {
    pub rows_in_block: usize,
    /// Cumulative rows fetched for this statement.
    pub total_rows: u64,
    pub no_more_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransPrepareOutcome {
    Prepared,
    /// The driver had nothing to prepare (read-only branch).
    NoEffect,
}

/// Cancellation handle for a blocked driver call. The only driver surface
/// that may be touched from another thread.
#[derive(Debug, Clone)]
pub struct DriverBreaker {
    flag: Arc<AtomicBool>,
}

impl DriverBreaker {
    pub fn new() -> Self {
        DriverBreaker {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes the in-flight call return with the cancellation code.
    pub fn break_call(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_broken(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl Default for DriverBreaker {
    fn default() -> Self {
        DriverBreaker::new()
    }
}

/// Typed wrapper over the native database driver. One session per worker
/// process; all calls happen on the main thread except `DriverBreaker`.
pub trait SqlDriver: Send {
    fn connect(&mut self, username: &str, password: &str) -> DResult<()>;
    fn disconnect(&mut self);
    fn server_info(&self) -> &ServerInfo;

    fn prepare(&mut self, sql: &str) -> DResult<(StmtId, StatementKind)>;
    fn free_statement(&mut self, stmt: StmtId);

    fn bind(&mut self, stmt: StmtId, slot: &BindSlot) -> DResult<()>;
    fn bind_out(&mut self, stmt: StmtId, slot: &OutBindSlot) -> DResult<()>;

    /// `iterations` > 1 runs an array-bound batch; on partial failure the
    /// per-row offsets are retrievable with `batch_errors`.
    fn execute(&mut self, stmt: StmtId, iterations: u32) -> DResult<ExecOutcome>;

    /// `(row_offset, error_code)` pairs from the last partially failed
    /// batch execute of `stmt`.
    fn batch_errors(&mut self, _stmt: StmtId) -> Vec<(u32, i32)> {
        Vec::new()
    }

    /// Column metadata after the first successful execute of a SELECT.
    fn column_info(&mut self, stmt: StmtId) -> DResult<Vec<ColumnInfo>>;
    fn row_count(&mut self, stmt: StmtId) -> DResult<u64>;

    fn fetch_block(
        &mut self,
        stmt: StmtId,
        defines: &mut [DefineSlot],
        block_rows: usize,
    ) -> DResult<FetchOutcome>;

    /// Populates the OUT slots after a DML/PLSQL execute.
    fn read_out_binds(&mut self, stmt: StmtId, slots: &mut [OutBindSlot]) -> DResult<()>;

    /// Writes a piecewise LOB bind value after execute.
    fn lob_write(&mut self, stmt: StmtId, bind_name: &str, value: &[u8]) -> DResult<()>;
    fn lob_length(&mut self, lob: LobId) -> DResult<u64>;
    /// Reads up to `buf_size` bytes; `by_chars` selects character
    /// counting for CLOBs.
    fn lob_read(&mut self, lob: LobId, buf_size: usize, by_chars: bool) -> DResult<Vec<u8>>;
    fn datetime_text(&mut self, dt: DateTimeId) -> DResult<String>;

    fn commit(&mut self, two_phase: bool) -> DResult<()>;
    fn rollback(&mut self) -> DResult<()>;
    fn set_xid(&mut self, xid: &Xid) -> DResult<()>;
    fn trans_start(&mut self, timeout: u32, coupling: TransCoupling) -> DResult<()>;
    fn trans_prepare(&mut self) -> DResult<TransPrepareOutcome>;
    /// Deletes the pending-transaction record for the current XID.
    fn trans_forget(&mut self) -> DResult<()>;
    /// Re-associates a fresh transaction state with the session after a
    /// global transaction ended.
    fn reset_transaction(&mut self) -> DResult<()>;

    /// Session-attribute read; the source of truth for transaction state.
    fn in_transaction(&mut self) -> DResult<bool>;

    fn set_session_attr(&mut self, attr: SessionAttr, value: &str) -> DResult<()>;

    fn breaker(&self) -> DriverBreaker;
    /// Returns the session to a clean blocking state after a break.
    fn reset_after_break(&mut self) -> DResult<()>;

    /// Cheap liveness probe.
    fn heartbeat(&mut self) -> DResult<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn breaker_is_shared() {
        let b = DriverBreaker::new();
        let b2 = b.clone();
        assert!(!b.is_broken());
        b2.break_call();
        assert!(b.is_broken());
        b.reset();
        assert!(!b2.is_broken());
    }
}
