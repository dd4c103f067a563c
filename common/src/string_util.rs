/// Canonical statement text: newlines become spaces, runs of spaces
/// collapse to one, ends trimmed. Idempotent.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut prev_space = false;
    for ch in sql.chars() {
        let ch = if ch == '\n' || ch == '\r' || ch == '\t' {
            ' '
        } else {
            ch
        };
        if ch == ' ' {
            if prev_space {
                continue;
            }
            prev_space = true;
        } else {
            prev_space = false;
        }
        out.push(ch);
    }
    out.trim().to_string()
}

/// Splits off the part of `input` before the first `sep`, returning it and
/// leaving the remainder (without the separator) in `input`. Returns None
/// when the separator is absent; `input` is left empty and its previous
/// content returned through the Err-like None contract the callers expect.
pub fn tokenize(input: &mut String, sep: char) -> Option<String> {
    match input.find(sep) {
        Some(pos) => {
            let head = input[..pos].to_string();
            let rest = input[pos + sep.len_utf8()..].to_string();
            *input = rest;
            Some(head)
        }
        None => None,
    }
}

pub fn index_of_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.len() > h.len() {
        return None;
    }
    'outer: for i in 0..=(h.len() - n.len()) {
        for j in 0..n.len() {
            if !h[i + j].eq_ignore_ascii_case(&n[j]) {
                continue 'outer;
            }
        }
        return Some(i);
    }
    None
}

pub fn starts_with_ignore_case(haystack: &str, prefix: &str) -> bool {
    haystack.len() >= prefix.len()
        && haystack.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Escapes binds and other possibly-binary data for the log file.
pub fn hex_escape(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        if (0x20..0x7f).contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{:02x}", b));
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(
            normalize_sql("SELECT 1\n  FROM\t dual "),
            "SELECT 1 FROM dual"
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_sql("a\n\n  b   c");
        assert_eq!(normalize_sql(&once), once);
    }

    #[test]
    fn tokenize_consumes_head() {
        let mut s = "1:abc:x".to_string();
        assert_eq!(tokenize(&mut s, ':').unwrap(), "1");
        assert_eq!(tokenize(&mut s, ':').unwrap(), "abc");
        assert_eq!(s, "x");
        assert!(tokenize(&mut s, ':').is_none());
    }

    #[test]
    fn case_insensitive_search() {
        assert_eq!(index_of_ignore_case("SELECT x FROM t", "from"), Some(9));
        assert_eq!(index_of_ignore_case("abc", "d"), None);
        assert!(starts_with_ignore_case("UPDATE t", "update"));
    }

    #[test]
    fn hex_escape_marks_binary() {
        assert_eq!(hex_escape(b"ab\x00c"), "ab\\x00c");
    }
}
