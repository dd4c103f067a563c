use tracing::{debug, info, warn};

use common::time_util;
use driver::define::DefineSlot;
use driver::types::{ApiVersion, ColumnInfo, StatementKind};
use driver::StmtId;

/// One prepared statement. Identity is `(text, version)`; everything else
/// is mutable statement state reused across executions.
#[derive(Debug)]
pub struct StmtCacheEntry {
    pub text: String,
    pub version: ApiVersion,
    pub stmt: StmtId,
    pub kind: StatementKind,
    pub columns: Option<Vec<ColumnInfo>>,
    pub defines: Option<Vec<DefineSlot>>,
    /// Rows per fetch block the defines were sized for.
    pub block_rows: usize,
    pub last_used: i64,
    pub exec_count: u64,
    /// A DATE/TIMESTAMP column or bind forces distinct v1/v2 cache
    /// entries, because the versions decode temporals differently.
    pub has_datetime: bool,
}

impl StmtCacheEntry {
    pub fn new(text: String, version: ApiVersion, stmt: StmtId, kind: StatementKind) -> Self {
        StmtCacheEntry {
            text,
            version,
            stmt,
            kind,
            columns: None,
            defines: None,
            block_rows: 0,
            last_used: time_util::now_secs(),
            exec_count: 0,
            has_datetime: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmtKey {
    pub text: String,
    pub version: ApiVersion,
}

/// Sorted-by-text statement cache with binary-search lookup.
///
/// Versions only produce distinct entries when `has_datetime` forces them;
/// a plain lookup adopts the caller's version. Eviction picks the oldest
/// entry, tie-broken by the lowest execution count. With caching disabled
/// a single reusable slot stands in.
#[derive(Debug)]
pub struct StatementCache {
    entries: Vec<StmtCacheEntry>,
    one_stmt: Option<StmtCacheEntry>,
    enabled: bool,
    max_size: usize,
    max_age: i64,
    expire_frequency: i64,
    next_expire: i64,

    pub hits: u64,
    pub misses: u64,
    pub expires: u64,
    pub dumps: u64,
    pub size_peak: usize,
}

fn version_rank(v: ApiVersion) -> u8 {
    match v {
        ApiVersion::V1 => 1,
        ApiVersion::V2 => 2,
    }
}

impl StatementCache {
    pub fn new(max_size: usize, max_age: i64, expire_frequency: i64) -> Self {
        StatementCache {
            entries: Vec::new(),
            one_stmt: None,
            enabled: max_size > 0,
            max_size,
            max_age,
            expire_frequency,
            next_expire: 0,
            hits: 0,
            misses: 0,
            expires: 0,
            dumps: 0,
            size_peak: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary-search position for `(text, version)`. `Ok` carries the
    /// index of a usable entry, `Err` the insertion point.
    fn search(&self, text: &str, version: ApiVersion) -> Result<usize, usize> {
        let mut lo = 0isize;
        let mut hi = self.entries.len() as isize - 1;
        while lo <= hi {
            let mid = ((lo + hi) / 2) as usize;
            let entry = &self.entries[mid];
            let mut cmp = entry.text.as_str().cmp(text);
            if cmp == std::cmp::Ordering::Equal {
                if entry.has_datetime && entry.version != version {
                    cmp = version_rank(entry.version).cmp(&version_rank(version));
                } else {
                    return Ok(mid);
                }
            }
            match cmp {
                std::cmp::Ordering::Greater => hi = mid as isize - 1,
                _ => lo = mid as isize + 1,
            }
        }
        Err(lo as usize)
    }

    /// Looks up a statement, adopting the caller's version on a
    /// non-datetime entry. Returns the key to address the entry with.
    pub fn find(&mut self, text: &str, version: ApiVersion) -> Option<StmtKey> {
        if !self.enabled {
            let one = self.one_stmt.as_mut()?;
            if one.text == text && (!one.has_datetime || one.version == version) {
                one.version = version;
                self.hits += 1;
                return Some(StmtKey {
                    text: text.to_string(),
                    version,
                });
            }
            return None;
        }
        match self.search(text, version) {
            Ok(idx) => {
                let entry = &mut self.entries[idx];
                entry.version = version;
                self.hits += 1;
                Some(StmtKey {
                    text: entry.text.clone(),
                    version,
                })
            }
            Err(_) => None,
        }
    }

    pub fn get_mut(&mut self, key: &StmtKey) -> Option<&mut StmtCacheEntry> {
        if !self.enabled {
            return self
                .one_stmt
                .as_mut()
                .filter(|e| e.text == key.text);
        }
        match self.search(&key.text, key.version) {
            Ok(idx) => Some(&mut self.entries[idx]),
            Err(_) => None,
        }
    }

    /// Inserts a fresh entry, returning any evicted entry whose driver
    /// statement the caller must free.
    pub fn insert(&mut self, entry: StmtCacheEntry) -> Option<StmtCacheEntry> {
        self.misses += 1;
        if !self.enabled {
            let old = self.one_stmt.take();
            self.one_stmt = Some(entry);
            return old;
        }

        let mut evicted = None;
        if self.entries.len() >= self.max_size {
            let now = time_util::now_secs();
            let mut victim = 0usize;
            let mut oldest = i64::MAX;
            let mut least_exec = u64::MAX;
            for (i, e) in self.entries.iter().enumerate() {
                if now - e.last_used > self.max_age {
                    victim = i;
                    break;
                }
                if e.last_used < oldest
                    || (e.last_used == oldest && e.exec_count < least_exec)
                {
                    victim = i;
                    oldest = e.last_used;
                    least_exec = e.exec_count;
                }
            }
            evicted = Some(self.entries.remove(victim));
            self.dumps += 1;
        }

        match self.search(&entry.text, entry.version) {
            Ok(_) => {
                warn!("internal error: attempt to insert duplicate statement");
                evicted
            }
            Err(pos) => {
                self.entries.insert(pos, entry);
                if self.entries.len() > self.size_peak {
                    self.size_peak = self.entries.len();
                }
                evicted
            }
        }
    }

    /// Age-based sweep, rate-limited to once per `expire_frequency`
    /// seconds unless forced. Returns the expired entries for driver
    /// cleanup.
    pub fn expire(&mut self, force: bool) -> Vec<StmtCacheEntry> {
        if !self.enabled || self.max_age <= 0 {
            return Vec::new();
        }
        let now = time_util::now_secs();
        if !force && now < self.next_expire {
            return Vec::new();
        }
        self.next_expire = now + self.expire_frequency;

        let max_age = self.max_age;
        let mut kept = Vec::with_capacity(self.entries.len());
        let mut expired = Vec::new();
        for e in self.entries.drain(..) {
            if now - e.last_used >= max_age {
                expired.push(e);
            } else {
                kept.push(e);
            }
        }
        self.entries = kept;
        self.expires += expired.len() as u64;
        if !expired.is_empty() {
            debug!("expired {} statements", expired.len());
        }
        expired
    }

    /// Drops every entry, returning them for driver cleanup, and logs the
    /// session stats.
    pub fn dump_all(&mut self) -> Vec<StmtCacheEntry> {
        if self.hits > 0 || self.misses > 0 {
            info!(
                "statement cache stats: hits = {}, misses = {}, hit ratio = {:.2}%, dumps = {}, expires = {}, peak size = {}",
                self.hits,
                self.misses,
                100.0 * self.hits as f64 / (self.hits + self.misses) as f64,
                self.dumps,
                self.expires,
                self.size_peak
            );
        }
        self.hits = 0;
        self.misses = 0;
        self.dumps = 0;
        self.expires = 0;
        self.size_peak = 0;

        let mut all: Vec<StmtCacheEntry> = self.entries.drain(..).collect();
        if let Some(one) = self.one_stmt.take() {
            all.push(one);
        }
        if !all.is_empty() {
            debug!("dumping {} statements from cache", all.len());
        }
        all
    }

    /// Debug-build invariant: the linear scan and the binary search agree.
    #[cfg(test)]
    pub fn linear_find(&self, text: &str, version: ApiVersion) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.text == text && (!e.has_datetime || e.version == version)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(text: &str, stmt: StmtId) -> StmtCacheEntry {
        StmtCacheEntry::new(
            text.to_string(),
            ApiVersion::V1,
            stmt,
            StatementKind::Select,
        )
    }

    #[test]
    fn insert_find_round_trip() {
        let mut cache = StatementCache::new(8, 900, 60);
        cache.insert(entry("SELECT b FROM t", 2));
        cache.insert(entry("SELECT a FROM t", 1));
        cache.insert(entry("SELECT c FROM t", 3));

        let key = cache.find("SELECT a FROM t", ApiVersion::V1).unwrap();
        assert_eq!(cache.get_mut(&key).unwrap().stmt, 1);
        assert!(cache.find("SELECT z FROM t", ApiVersion::V1).is_none());
    }

    #[test]
    fn binary_search_matches_linear_search() {
        let mut cache = StatementCache::new(32, 900, 60);
        let texts = [
            "DELETE FROM t WHERE id = :id",
            "INSERT INTO t (a) VALUES (:a)",
            "SELECT a FROM t",
            "SELECT b FROM t WHERE x = :x",
            "UPDATE t SET a = :a",
        ];
        for (i, t) in texts.iter().enumerate() {
            cache.insert(entry(t, i as StmtId));
        }
        for t in &texts {
            let via_linear = cache.linear_find(t, ApiVersion::V1);
            let via_search = cache.search(t, ApiVersion::V1).ok();
            assert_eq!(via_linear, via_search, "text {:?}", t);
        }
    }

    #[test]
    fn version_adopts_without_datetime() {
        let mut cache = StatementCache::new(8, 900, 60);
        cache.insert(entry("SELECT a FROM t", 1));
        let key = cache.find("SELECT a FROM t", ApiVersion::V2).unwrap();
        assert_eq!(cache.get_mut(&key).unwrap().version, ApiVersion::V2);
    }

    #[test]
    fn datetime_forces_second_entry() {
        let mut cache = StatementCache::new(8, 900, 60);
        let mut e = entry("SELECT ts FROM t", 1);
        e.has_datetime = true;
        cache.insert(e);

        // v2 lookup must miss; a distinct entry gets inserted
        assert!(cache.find("SELECT ts FROM t", ApiVersion::V2).is_none());
        let mut e2 = StmtCacheEntry::new(
            "SELECT ts FROM t".to_string(),
            ApiVersion::V2,
            2,
            StatementKind::Select,
        );
        e2.has_datetime = true;
        assert!(cache.insert(e2).is_none());
        assert_eq!(cache.len(), 2);

        let k1 = cache.find("SELECT ts FROM t", ApiVersion::V1).unwrap();
        assert_eq!(cache.get_mut(&k1).unwrap().stmt, 1);
        let k2 = cache.find("SELECT ts FROM t", ApiVersion::V2).unwrap();
        assert_eq!(cache.get_mut(&k2).unwrap().stmt, 2);
    }

    #[test]
    fn eviction_prefers_oldest_then_least_executed() {
        let mut cache = StatementCache::new(2, 900, 60);
        let mut a = entry("A", 1);
        a.last_used = 100;
        a.exec_count = 50;
        let mut b = entry("B", 2);
        b.last_used = 100;
        b.exec_count = 1;
        cache.insert(a);
        cache.insert(b);

        let evicted = cache.insert(entry("C", 3)).unwrap();
        // same timestamp, so the lower exec count goes
        assert_eq!(evicted.stmt, 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn age_expiry_sweep() {
        let mut cache = StatementCache::new(8, 10, 0);
        let mut old = entry("OLD", 1);
        old.last_used = time_util::now_secs() - 100;
        cache.insert(old);
        cache.insert(entry("NEW", 2));

        let expired = cache.expire(true);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].stmt, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn disabled_cache_uses_single_slot() {
        let mut cache = StatementCache::new(0, 900, 60);
        let old = cache.insert(entry("A", 1));
        assert!(old.is_none());
        let replaced = cache.insert(entry("B", 2)).unwrap();
        assert_eq!(replaced.stmt, 1);
        assert!(cache.find("A", ApiVersion::V1).is_none());
        assert!(cache.find("B", ApiVersion::V1).is_some());
    }

    #[test]
    fn dump_all_returns_everything() {
        let mut cache = StatementCache::new(8, 900, 60);
        cache.insert(entry("A", 1));
        cache.insert(entry("B", 2));
        cache.find("A", ApiVersion::V1);
        let all = cache.dump_all();
        assert_eq!(all.len(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.hits, 0);
    }
}
