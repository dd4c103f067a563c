use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Hot-tunable key/value overlay, re-read from disk at most every
/// `RECHECK_INTERVAL`. Keys are `name = value` lines; unknown lines are
/// skipped. Missing file means no overrides.
#[derive(Debug)]
pub struct OpsConfig {
    path: Option<PathBuf>,
    values: HashMap<String, String>,
    next_check: Instant,
}

const RECHECK_INTERVAL: Duration = Duration::from_secs(30);

impl OpsConfig {
    pub fn new(path: Option<PathBuf>) -> Self {
        let mut cfg = OpsConfig {
            path,
            values: HashMap::new(),
            next_check: Instant::now(),
        };
        cfg.refresh();
        cfg
    }

    /// Re-reads the file if the recheck interval elapsed. Returns true if
    /// the value set may have changed.
    pub fn refresh(&mut self) -> bool {
        if Instant::now() < self.next_check {
            return false;
        }
        self.next_check = Instant::now() + RECHECK_INTERVAL;

        let Some(path) = &self.path else {
            return false;
        };
        let Ok(raw) = fs::read_to_string(path) else {
            return false;
        };
        self.values.clear();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                self.values
                    .insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key)?.parse().ok()
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key)?.parse().ok()
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_key_value_lines() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# comment\nlog_level = debug\nmax_requests_per_worker=500").unwrap();
        let cfg = OpsConfig::new(Some(f.path().to_path_buf()));
        assert_eq!(cfg.get("log_level"), Some("debug"));
        assert_eq!(cfg.get_u32("max_requests_per_worker"), Some(500));
    }

    #[test]
    fn missing_file_is_empty() {
        let cfg = OpsConfig::new(Some(PathBuf::from("/nonexistent/ops.cfg")));
        assert!(cfg.get("log_level").is_none());
    }
}
