use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::err::{WResult, WorkerError};

/// Static worker configuration, loaded once at process start.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 0 disables the global statement cache.
    pub max_cache_size: usize,
    /// Seconds a cached statement may stay unused before expiry.
    pub max_statement_age: i64,
    /// Minimum seconds between cache expiry sweeps.
    pub cache_expire_frequency: i64,
    /// Cache statements per session even when the global cache is off.
    pub enable_session_cache: bool,

    /// Collapse newlines in query text before caching/logging.
    pub enable_query_replace_nl: bool,

    /// What a NULL column is rendered as on the wire.
    pub null_value: String,

    /// Max rows the server allows in one fetch block.
    pub max_fetch_block_size: u32,
    /// LOB prefetch size handed to the define layer; 0 disables.
    pub lob_prefetch_size: u32,
    /// Buffer size for an OUT bind placeholder.
    pub max_out_bind_var_size: usize,

    /// Seconds between keepalive pings to the client while a call blocks.
    pub ping_interval: i64,
    /// Seconds between cheap liveness probes against the database.
    pub db_heartbeat_frequency: i64,

    pub max_requests_per_worker: u32,
    pub max_lifespan_seconds: i64,
    /// Back-off ceiling (seconds) after a failed construction.
    pub child_failure_delay: u64,

    pub default_trans_timeout: u32,

    /// Directory scanned for markdown rule files; empty disables.
    pub markdown_directory: String,

    pub enable_sharding: bool,
    pub enable_sql_rewrite: bool,
    pub shard_key_name: String,
    pub scuttle_attr_name: String,
    pub max_scuttle_buckets: u32,
    /// "hash" or "mod".
    pub sharding_algo: String,
    pub shard_key_value_type_string: bool,

    /// Log level name understood by tracing (error|warn|info|debug|trace).
    pub log_level: String,
    pub log_dir: String,

    /// Pre-declared read-only queries whose results are cached with a TTL.
    /// Keys look like `special_query_<id>_text` / `special_query_<id>_max_age`.
    #[serde(flatten)]
    pub extra: HashMap<String, toml::Value>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            max_cache_size: 128,
            max_statement_age: 900,
            cache_expire_frequency: 60,
            enable_session_cache: false,
            enable_query_replace_nl: true,
            null_value: String::new(),
            max_fetch_block_size: 512,
            lob_prefetch_size: 4096,
            max_out_bind_var_size: 64,
            ping_interval: 10,
            db_heartbeat_frequency: 120,
            max_requests_per_worker: 0,
            max_lifespan_seconds: 0,
            child_failure_delay: 20,
            default_trans_timeout: 60,
            markdown_directory: String::new(),
            enable_sharding: false,
            enable_sql_rewrite: false,
            shard_key_name: String::new(),
            scuttle_attr_name: "scuttle_id".to_string(),
            max_scuttle_buckets: 1024,
            sharding_algo: "hash".to_string(),
            shard_key_value_type_string: false,
            log_level: "info".to_string(),
            log_dir: String::new(),
            extra: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn load(path: &Path) -> WResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| WorkerError::Config(format!("{}: {}", path.display(), e)))?;
        let cfg: WorkerConfig = toml::from_str(&raw)
            .map_err(|e| WorkerError::Config(format!("{}: {}", path.display(), e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> WResult<()> {
        if self.max_scuttle_buckets == 0 || self.max_scuttle_buckets > 1024 {
            return Err(WorkerError::Config(format!(
                "max_scuttle_buckets {} out of range (1..=1024)",
                self.max_scuttle_buckets
            )));
        }
        if self.enable_sharding && self.shard_key_name.is_empty() {
            return Err(WorkerError::Config(
                "enable_sharding requires shard_key_name".to_string(),
            ));
        }
        match self.sharding_algo.as_str() {
            "hash" | "mod" => Ok(()),
            other => Err(WorkerError::Config(format!(
                "unknown sharding_algo {:?}",
                other
            ))),
        }
    }

    /// String lookup in the free-form key space.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.extra.get(key) {
            Some(toml::Value::String(s)) => Some(s.clone()),
            Some(v) => Some(v.to_string()),
            None => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.extra.get(key) {
            Some(toml::Value::Integer(i)) => Some(*i),
            Some(toml::Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.scuttle_attr_name, "scuttle_id");
        assert_eq!(cfg.max_scuttle_buckets, 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_with_special_queries() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
max_cache_size = 4
shard_key_name = "party_id"
enable_sharding = true
sharding_algo = "mod"
special_query_7_text = "SELECT host FROM hosts"
special_query_7_max_age = 30
"#
        )
        .unwrap();
        let cfg = WorkerConfig::load(f.path()).unwrap();
        assert_eq!(cfg.max_cache_size, 4);
        assert_eq!(
            cfg.get_str("special_query_7_text").unwrap(),
            "SELECT host FROM hosts"
        );
        assert_eq!(cfg.get_int("special_query_7_max_age"), Some(30));
    }

    #[test]
    fn sharding_without_key_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "enable_sharding = true").unwrap();
        assert!(WorkerConfig::load(f.path()).is_err());
    }
}
