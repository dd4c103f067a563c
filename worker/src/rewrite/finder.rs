use super::is_word_char;

/// Multi-needle, case-insensitive token scanner.
///
/// All needles are matched in one left-to-right pass. A needle only
/// matches at genuine token boundaries: the character before its first
/// byte must not be a word character, and the character after its last
/// byte must not be one either, so `party_id` never matches inside
/// `third_party_id2`. A leading colon in a needle matches the bind sigil.
#[derive(Debug, Clone)]
pub struct Finder {
    needles: Vec<Vec<u8>>,
}

/// A successful match: which needle, and the scan position just past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Found {
    pub needle: usize,
    pub next: usize,
}

impl Finder {
    pub fn new<S: AsRef<str>>(needles: &[S]) -> Self {
        Finder {
            needles: needles
                .iter()
                .map(|n| n.as_ref().as_bytes().to_vec())
                .collect(),
        }
    }

    /// Scans `haystack` from `start`, returning the first completed
    /// needle.
    pub fn find(&self, haystack: &[u8], start: usize) -> Option<Found> {
        // per-needle progress pointers, reset on any mismatch
        let mut progress = vec![0usize; self.needles.len()];
        let mut prev_word = if start == 0 {
            false
        } else {
            is_word_byte(haystack[start - 1])
        };

        let mut pos = start;
        while pos < haystack.len() {
            let c = haystack[pos];
            let word = is_word_byte(c);
            for (i, needle) in self.needles.iter().enumerate() {
                let matched = word
                    && (!prev_word || progress[i] != 0)
                    && eq_case_i(c, needle[progress[i]]);
                if matched {
                    progress[i] += 1;
                    if progress[i] == needle.len() {
                        let next = pos + 1;
                        let boundary =
                            next >= haystack.len() || !is_word_char(haystack[next]);
                        if boundary {
                            return Some(Found { needle: i, next });
                        }
                        progress[i] = 0;
                    }
                } else {
                    progress[i] = 0;
                }
            }
            prev_word = word;
            pos += 1;
        }
        None
    }
}

/// The scanner treats the bind sigil as part of a token so `:name`
/// needles can anchor on it.
fn is_word_byte(c: u8) -> bool {
    is_word_char(c) || c == b':'
}

fn eq_case_i(a: u8, b: u8) -> bool {
    a.eq_ignore_ascii_case(&b)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finds_keywords_case_insensitively() {
        let f = Finder::new(&["select", "from", "where"]);
        let sql = b"SELECT a FROM t WHERE x = 1";
        let m = f.find(sql, 0).unwrap();
        assert_eq!(m.needle, 0);
        assert_eq!(m.next, 6);
        let m = f.find(sql, m.next).unwrap();
        assert_eq!(m.needle, 1);
        let m = f.find(sql, m.next).unwrap();
        assert_eq!(m.needle, 2);
    }

    #[test]
    fn requires_left_boundary() {
        let f = Finder::new(&["party_id"]);
        assert!(f.find(b"SELECT third_party_id FROM t", 0).is_none());
        assert!(f.find(b"SELECT party_id FROM t", 0).is_some());
    }

    #[test]
    fn requires_right_boundary() {
        let f = Finder::new(&["party_id"]);
        assert!(f.find(b"SELECT party_id2 FROM t", 0).is_none());
        // but a later clean occurrence still matches
        let m = f.find(b"SELECT party_id2, party_id FROM t", 0).unwrap();
        assert_eq!(&b"SELECT party_id2, party_id FROM t"[m.next - 8..m.next], b"party_id");
    }

    #[test]
    fn colon_needles_anchor_on_binds() {
        let f = Finder::new(&[":party_id", "party_id"]);
        let sql = b"WHERE party_id = :party_id";
        let m = f.find(sql, 0).unwrap();
        assert_eq!(m.needle, 1); // the bare column comes first
        let m2 = f.find(sql, m.next).unwrap();
        assert_eq!(m2.needle, 0); // then the bind reference
    }

    #[test]
    fn digits_count_as_word_chars() {
        let f = Finder::new(&["id"]);
        assert!(f.find(b"col id2", 0).is_none());
        assert!(f.find(b"2id id", 0).is_some());
    }
}
