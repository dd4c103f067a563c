pub mod finder;
pub mod rewriter;
pub mod shard_key;

pub use rewriter::{RewriteOutcome, RewriteReason, SqlRewriter};
pub use shard_key::{compute_scuttle_id, parse_shard_key, process_bind_name, ShardingAlgo};

/// Word characters for the SQL scanner: alphanumerics and underscore.
pub(crate) fn is_word_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}
