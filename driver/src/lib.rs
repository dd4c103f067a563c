pub mod bind;
pub mod define;
pub mod error;
pub mod facade;
pub mod mem;
pub mod types;

pub use error::{DResult, DriverError};
pub use facade::{DriverBreaker, ExecOutcome, FetchOutcome, SqlDriver, StmtId};

/// Hard cap on array-bind rows; exceeding it closes the connection.
pub const MAX_ARRAY_ROW_NUM: usize = 100;
/// Per-element cap for array binds.
pub const MAX_ARRAY_DATA_SIZE: usize = 32 * 1024;
/// One shared arena for the string/raw output columns of a statement.
pub const COL_DATA_BUF_SIZE: usize = 100 * 1024;
/// Buffer for an out-bound placeholder when config does not override it.
pub const MAX_OUT_BIND_VAR_SIZE: usize = 64;
/// Rows accepted from an out-bound placeholder.
pub const MAX_DYNAMIC_BIND_ROWS: usize = 1;
/// Longest accepted bind name, including the colon sigil.
pub const MAX_BIND_NAME_LEN: usize = 31;
