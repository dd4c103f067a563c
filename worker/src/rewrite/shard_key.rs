use once_cell::sync::Lazy;
use regex::Regex;

use common::hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardingAlgo {
    /// MurmurHash3 of the key, then modulo the bucket count.
    HashMod,
    /// Key value modulo the bucket count.
    ModOnly,
}

impl ShardingAlgo {
    pub fn from_config(name: &str) -> ShardingAlgo {
        match name {
            "mod" => ShardingAlgo::ModOnly,
            _ => ShardingAlgo::HashMod,
        }
    }
}

/// Bucket for a numeric shard key.
pub fn compute_scuttle_id(value: u64, algo: ShardingAlgo, max_buckets: u32) -> u32 {
    match algo {
        ShardingAlgo::ModOnly => (value % max_buckets as u64) as u32,
        ShardingAlgo::HashMod => hash::murmur3_shard_key(value) % max_buckets,
    }
}

/// Bucket for a string-typed shard key.
pub fn compute_scuttle_id_str(value: &str, algo: ShardingAlgo, max_buckets: u32) -> u32 {
    match algo {
        ShardingAlgo::ModOnly => value
            .trim()
            .parse::<u64>()
            .map(|v| (v % max_buckets as u64) as u32)
            .unwrap_or(0),
        ShardingAlgo::HashMod => hash::murmur3_shard_key_str(value) % max_buckets,
    }
}

/// Parses a `name=value[;value]*` shard-key hint. The key name is
/// lowercased; values use `\` as an escape for `;` and `\`.
pub fn parse_shard_key(hint: &str) -> Option<(String, Vec<String>)> {
    let (name, values_raw) = hint.split_once('=')?;
    let name = name.to_ascii_lowercase();

    let mut values = Vec::new();
    let mut current = String::new();
    let mut escape = false;
    for c in values_raw.chars() {
        if escape {
            current.push(c);
            escape = false;
        } else if c == '\\' {
            escape = true;
        } else if c == ';' {
            values.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if escape {
        // dangling escape
        return None;
    }
    values.push(current);
    Some((name, values))
}

static BIND_NAME_TRIM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^:)|(_\d+$)").expect("bind name regex"));

/// Canonical bind name: the colon sigil and a trailing `_<digits>`
/// suffix are stripped, and the result lowercased, so `:party_id_0`
/// compares equal to the configured `party_id`.
pub fn process_bind_name(name: &str) -> String {
    BIND_NAME_TRIM.replace_all(name, "").to_ascii_lowercase()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scuttle_id_is_stable_and_bounded() {
        for v in [0u64, 1, 2050, 999_999_999] {
            let a = compute_scuttle_id(v, ShardingAlgo::HashMod, 1024);
            assert_eq!(a, compute_scuttle_id(v, ShardingAlgo::HashMod, 1024));
            assert!(a < 1024);
        }
    }

    #[test]
    fn mod_only_is_plain_modulo() {
        assert_eq!(compute_scuttle_id(2050, ShardingAlgo::ModOnly, 1024), 2);
        assert_eq!(compute_scuttle_id_str("2050", ShardingAlgo::ModOnly, 1024), 2);
    }

    #[test]
    fn hint_parsing() {
        let (name, values) = parse_shard_key("Party_Id=2050").unwrap();
        assert_eq!(name, "party_id");
        assert_eq!(values, vec!["2050"]);

        let (_, values) = parse_shard_key("k=a;b;c").unwrap();
        assert_eq!(values, vec!["a", "b", "c"]);

        // escaped separator stays in the value
        let (_, values) = parse_shard_key(r"k=a\;b;c").unwrap();
        assert_eq!(values, vec!["a;b", "c"]);

        assert!(parse_shard_key("novalue").is_none());
        assert!(parse_shard_key(r"k=dangling\").is_none());
    }

    #[test]
    fn bind_name_canonicalization() {
        assert_eq!(process_bind_name(":party_id"), "party_id");
        assert_eq!(process_bind_name(":party_id_0"), "party_id");
        assert_eq!(process_bind_name("PARTY_ID_12"), "party_id");
        // a non-numeric suffix is part of the name
        assert_eq!(process_bind_name(":party_id_x"), "party_id_x");
    }
}
