use std::hash::Hasher;

use fnv::FnvHasher;

use crate::string_util;

/// Seed fixed by the sharding scheme; changing it re-buckets every shard
/// key in existence.
const SHARDING_SEED: u32 = 0x183d_1db4;

/// 32-bit hash of a SQL text, used to name telemetry events. FNV-1a 64
/// folded to 32 by xoring the halves.
pub fn sql_hash(sql: &str) -> u32 {
    let mut h = FnvHasher::default();
    h.write(sql.as_bytes());
    let h64 = h.finish();
    ((h64 >> 32) as u32) ^ (h64 as u32)
}

/// Like `sql_hash` but over the normalized statement text, so logically
/// identical statements hash alike.
pub fn sql_cal_hash(sql: &str) -> u32 {
    sql_hash(&string_util::normalize_sql(sql))
}

/// MurmurHash3 x86 32-bit over the little-endian bytes of the shard key.
pub fn murmur3_shard_key(key: u64) -> u32 {
    murmur3_32(&key.to_le_bytes())
}

pub fn murmur3_shard_key_str(key: &str) -> u32 {
    murmur3_32(key.as_bytes())
}

fn murmur3_32(data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1: u32 = SHARDING_SEED;
    let nblocks = data.len() / 4;

    for i in 0..nblocks {
        let k = u32::from_le_bytes([
            data[i * 4],
            data[i * 4 + 1],
            data[i * 4 + 2],
            data[i * 4 + 3],
        ]);
        let mut k1 = k.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);

        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = &data[nblocks * 4..];
    let mut k1: u32 = 0;
    if tail.len() >= 3 {
        k1 ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k1 ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k1 ^= tail[0] as u32;
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sql_hash_is_stable() {
        let a = sql_hash("SELECT 1 FROM dual");
        let b = sql_hash("SELECT 1 FROM dual");
        assert_eq!(a, b);
        assert_ne!(a, sql_hash("SELECT 2 FROM dual"));
    }

    #[test]
    fn cal_hash_ignores_whitespace_shape() {
        assert_eq!(
            sql_cal_hash("SELECT 1\nFROM   dual"),
            sql_cal_hash("SELECT 1 FROM dual")
        );
    }

    #[test]
    fn murmur_is_deterministic() {
        for v in [0u64, 1, 2050, u64::MAX] {
            assert_eq!(murmur3_shard_key(v), murmur3_shard_key(v));
        }
        assert_ne!(murmur3_shard_key(1), murmur3_shard_key(2));
    }

    #[test]
    fn murmur_tail_lengths() {
        // exercise 1..4 byte tails
        for s in ["a", "ab", "abc", "abcd", "abcde"] {
            let h = murmur3_shard_key_str(s);
            assert_eq!(h, murmur3_shard_key_str(s));
        }
    }
}
