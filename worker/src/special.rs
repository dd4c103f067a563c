use tracing::{debug, warn};

use common::config::WorkerConfig;
use common::time_util;

/// TTL-bounded result cache for one pre-declared read-only query.
/// Entries persist for the life of the process; results are dumped and
/// repopulated when the TTL lapses.
#[derive(Debug)]
pub struct SpecialEntry {
    pub query_id: u32,
    pub sql: String,
    /// Seconds the results stay valid; 0 disables caching for the query.
    pub max_age: i64,
    populated_at: i64,
    pub num_columns: u32,
    pub num_rows: u32,
    pub values: Vec<Vec<u8>>,
}

impl SpecialEntry {
    pub fn enabled(&self) -> bool {
        self.max_age > 0
    }

    pub fn valid(&self) -> bool {
        self.enabled()
            && self.populated_at > 0
            && time_util::now_secs() - self.populated_at < self.max_age
    }

    /// Clears the results ahead of repopulation.
    pub fn expire(&mut self) {
        self.populated_at = 0;
        self.values.clear();
        self.num_columns = 0;
        self.num_rows = 0;
    }

    /// Marks the just-captured results live.
    pub fn validate(&mut self) {
        self.populated_at = time_util::now_secs();
    }

    pub fn add_result(&mut self, value: &[u8]) {
        self.values.push(value.to_vec());
    }
}

/// All special-query entries, keyed by the id the client sends with
/// PREPARE_SPECIAL. Query text and TTL come from config
/// (`special_query_<id>_text` / `special_query_<id>_max_age`).
#[derive(Debug, Default)]
pub struct SpecialQueryCache {
    entries: Vec<SpecialEntry>,
}

impl SpecialQueryCache {
    /// Index of the entry for `query_id`, creating it from config on
    /// first use. None when the query is not declared.
    pub fn get_or_create(&mut self, query_id: u32, cfg: &WorkerConfig) -> Option<usize> {
        if let Some(idx) = self.entries.iter().position(|e| e.query_id == query_id) {
            return Some(idx);
        }

        let text_key = format!("special_query_{}_text", query_id);
        let Some(sql) = cfg.get_str(&text_key) else {
            warn!("{} undefined or invalid", text_key);
            return None;
        };
        let age_key = format!("special_query_{}_max_age", query_id);
        let Some(max_age) = cfg.get_int(&age_key) else {
            warn!("{} undefined or invalid", age_key);
            return None;
        };

        debug!("special query {} declared, ttl {}s", query_id, max_age);
        self.entries.push(SpecialEntry {
            query_id,
            sql,
            max_age,
            populated_at: 0,
            num_columns: 0,
            num_rows: 0,
            values: Vec::new(),
        });
        Some(self.entries.len() - 1)
    }

    pub fn get(&self, idx: usize) -> &SpecialEntry {
        &self.entries[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut SpecialEntry {
        &mut self.entries[idx]
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn config_with_query() -> WorkerConfig {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
special_query_3_text = "SELECT status FROM nodes"
special_query_3_max_age = 60
special_query_4_text = "SELECT x FROM y"
special_query_4_max_age = 0
"#
        )
        .unwrap();
        WorkerConfig::load(f.path()).unwrap()
    }

    #[test]
    fn entry_created_from_config() {
        let cfg = config_with_query();
        let mut cache = SpecialQueryCache::default();
        let idx = cache.get_or_create(3, &cfg).unwrap();
        assert_eq!(cache.get(idx).sql, "SELECT status FROM nodes");
        assert!(cache.get(idx).enabled());
        assert!(!cache.get(idx).valid());

        // same id returns the same entry
        assert_eq!(cache.get_or_create(3, &cfg).unwrap(), idx);
    }

    #[test]
    fn undeclared_query_is_none() {
        let cfg = config_with_query();
        let mut cache = SpecialQueryCache::default();
        assert!(cache.get_or_create(99, &cfg).is_none());
    }

    #[test]
    fn ttl_zero_disables_caching() {
        let cfg = config_with_query();
        let mut cache = SpecialQueryCache::default();
        let idx = cache.get_or_create(4, &cfg).unwrap();
        assert!(!cache.get(idx).enabled());
        cache.get_mut(idx).validate();
        assert!(!cache.get(idx).valid());
    }

    #[test]
    fn populate_and_expire() {
        let cfg = config_with_query();
        let mut cache = SpecialQueryCache::default();
        let idx = cache.get_or_create(3, &cfg).unwrap();
        {
            let e = cache.get_mut(idx);
            e.num_columns = 2;
            e.num_rows = 1;
            e.add_result(b"a");
            e.add_result(b"b");
            e.validate();
        }
        assert!(cache.get(idx).valid());
        assert_eq!(cache.get(idx).values.len(), 2);

        cache.get_mut(idx).expire();
        assert!(!cache.get(idx).valid());
        assert!(cache.get(idx).values.is_empty());
    }
}
