use std::collections::HashMap;

use tracing::debug;

use common::hash;

use super::finder::Finder;
use super::is_word_char;

/// Why a statement was (or was not) rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteReason {
    Ok,
    SelectWhere,
    JoinNoAlias,
    JoinNoEq,
    Insert,
    UpdateNoEq,
    UnknownSql,
    HasScuttleId,
    Plsql,
    NoShardKey,
    Internal,
}

impl RewriteReason {
    /// Suffix used in the telemetry event name for pass-throughs.
    pub fn event_suffix(self) -> &'static str {
        match self {
            RewriteReason::Ok => "ok",
            RewriteReason::SelectWhere => "where",
            RewriteReason::JoinNoAlias => "join_no_alias",
            RewriteReason::JoinNoEq => "join_no_eq",
            RewriteReason::Insert => "insert",
            RewriteReason::UpdateNoEq => "update_no_eq",
            RewriteReason::UnknownSql => "unk_sql",
            RewriteReason::HasScuttleId => "has_scuttle_id",
            RewriteReason::Plsql => "plsql",
            RewriteReason::NoShardKey => "no_skey",
            RewriteReason::Internal => "internal_err",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub sql: String,
    pub rewritten: bool,
    pub reason: RewriteReason,
    /// Hash of the normalized input, cached for telemetry on repeats.
    pub cal_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SqlType {
    Select = 0,
    Insert = 1,
    Update = 2,
    Delete = 3,
    PlsqlDeclare = 4,
    PlsqlBegin = 5,
    Unknown = 50,
}

/// Injects a scuttle-id predicate or column wherever the shard key
/// appears. Rewrites are cached per input SQL text.
///
/// `SELECT name FROM party WHERE party_id = :party_id` becomes
/// `SELECT name FROM party WHERE party_id = :party_id AND scuttle_id =
/// :scuttle_id `; INSERT gains a column and a bind, UPDATE/DELETE gain a
/// WHERE predicate, and JOIN equality pairs gain an alias-qualified pair.
#[derive(Debug)]
pub struct SqlRewriter {
    cache: HashMap<String, RewriteOutcome>,
    shard_key: String,
    colon_shard_key: String,
    scuttle_name: String,
    scuttle_where_eq: String,
    dot_scuttle_eq: String,
    dot_scuttle: String,
    comma_colon_scuttle: String,
    query_type_finder: Finder,
    select_finder: Finder,
}

const AND: &str = " AND ";
const COMMA: &str = ", ";

impl SqlRewriter {
    pub fn new(shard_key_name: &str, scuttle_attr_name: &str) -> Self {
        let shard_key = shard_key_name.to_string();
        let colon_shard_key = format!(":{}", shard_key);
        let scuttle_name = scuttle_attr_name.to_string();
        SqlRewriter {
            cache: HashMap::new(),
            scuttle_where_eq: format!("{} = :{} ", scuttle_name, scuttle_name),
            dot_scuttle_eq: format!(".{} = ", scuttle_name),
            dot_scuttle: format!(".{}", scuttle_name),
            comma_colon_scuttle: format!(", :{}", scuttle_name),
            query_type_finder: Finder::new(&[
                "select", "insert", "update", "delete", "declare", "begin",
            ]),
            select_finder: Finder::new(&[
                "select",
                "from",
                "where",
                "join",
                colon_shard_key.as_str(),
                shard_key.as_str(),
            ]),
            shard_key,
            colon_shard_key,
            scuttle_name,
        }
    }

    /// Returns the cached outcome for `sql`, computing it on first sight.
    pub fn rewrite(&mut self, sql: &str) -> &RewriteOutcome {
        if !self.cache.contains_key(sql) {
            let mut outcome = if self.has_scuttle_id(sql) {
                pass_through(sql, RewriteReason::HasScuttleId)
            } else {
                match self.get_type(sql) {
                    SqlType::Select => self.rewrite_select(sql),
                    SqlType::Insert => self.rewrite_insert(sql),
                    SqlType::Update | SqlType::Delete => self.rewrite_update(sql),
                    SqlType::PlsqlDeclare | SqlType::PlsqlBegin => {
                        pass_through(sql, RewriteReason::Plsql)
                    }
                    SqlType::Unknown => pass_through(sql, RewriteReason::UnknownSql),
                }
            };
            if !outcome.rewritten {
                outcome.cal_hash = hash::sql_cal_hash(sql).to_string();
                debug!(
                    "sql not rewritten ({}): {}",
                    outcome.reason.event_suffix(),
                    outcome.cal_hash
                );
            }
            self.cache.insert(sql.to_string(), outcome);
        }
        &self.cache[sql]
    }

    fn has_scuttle_id(&self, sql: &str) -> bool {
        common::string_util::index_of_ignore_case(sql, &self.scuttle_name).is_some()
    }

    fn get_type(&self, sql: &str) -> SqlType {
        match self.query_type_finder.find(sql.as_bytes(), 0) {
            Some(found) => match found.needle {
                0 => SqlType::Select,
                1 => SqlType::Insert,
                2 => SqlType::Update,
                3 => SqlType::Delete,
                4 => SqlType::PlsqlDeclare,
                5 => SqlType::PlsqlBegin,
                _ => SqlType::Unknown,
            },
            None => SqlType::Unknown,
        }
    }

    fn rewrite_select(&self, sql: &str) -> RewriteOutcome {
        let b = sql.as_bytes();
        let sk_len = self.shard_key.len();
        let mut out = String::with_capacity(sql.len() + 32);
        let mut start = 0usize;
        let mut last_token: i32 = -1;
        let mut inner_select = false;
        let mut rewritten = false;

        while let Some(found) = self.select_finder.find(b, start) {
            let mut next = found.next;
            match found.needle {
                0 => {
                    // SELECT keyword; a SELECT right after FROM opens an
                    // inline view whose projection needs the scuttle column
                    inner_select = last_token == 1;
                    out.push_str(&sql[start..next]);
                }
                1 | 2 | 3 => {
                    out.push_str(&sql[start..next]);
                }
                4 | 5 => {
                    rewritten = true;
                    match last_token {
                        2 => {
                            // WHERE <sk> = :<sk>  or  WHERE <sk> IN (:<sk>)
                            let alias = get_alias(b, start, next - sk_len);
                            next = skip_spaces(b, next);
                            if peek(b, next) == b'=' {
                                next = skip_spaces(b, next + 1);
                                if peek(b, next) != b':' {
                                    return pass_through(sql, RewriteReason::SelectWhere);
                                }
                                next = skip_spaces(b, next + 1);
                                match self.expect_shard_bind(b, next) {
                                    Some(n) => next = n,
                                    None => {
                                        return pass_through(sql, RewriteReason::SelectWhere)
                                    }
                                }
                            } else if starts_ignore_case(b, next, "IN") {
                                next = skip_spaces(b, next + 2);
                                if peek(b, next) != b'(' {
                                    return pass_through(sql, RewriteReason::SelectWhere);
                                }
                                next = skip_spaces(b, next + 1);
                                if peek(b, next) != b':' {
                                    return pass_through(sql, RewriteReason::SelectWhere);
                                }
                                next = skip_spaces(b, next + 1);
                                match self.expect_shard_bind(b, next) {
                                    Some(n) => next = n,
                                    None => {
                                        return pass_through(sql, RewriteReason::SelectWhere)
                                    }
                                }
                                next = skip_spaces(b, next);
                                if peek(b, next) != b')' {
                                    return pass_through(sql, RewriteReason::SelectWhere);
                                }
                                next += 1;
                            } else {
                                return pass_through(sql, RewriteReason::SelectWhere);
                            }

                            out.push_str(&sql[start..next]);
                            out.push_str(AND);
                            if let Some((pos, len)) = alias {
                                // alias text plus the dot
                                out.push_str(&sql[pos..pos + len + 1]);
                            }
                            out.push_str(&self.scuttle_where_eq);
                        }
                        3 => {
                            // JOIN ... ON a.<sk> = b.<sk>
                            let Some((a1_pos, a1_len)) = get_alias(b, start, next - sk_len)
                            else {
                                return pass_through(sql, RewriteReason::JoinNoAlias);
                            };
                            let alias1 = &sql[a1_pos..a1_pos + a1_len];
                            let mut p = skip_spaces(b, next);
                            if peek(b, p) != b'=' {
                                return pass_through(sql, RewriteReason::JoinNoEq);
                            }
                            p = skip_spaces(b, p + 1);
                            next = p;
                            while next < b.len() && b[next] != b'.' {
                                next += 1;
                            }
                            if peek(b, next) != b'.' {
                                return pass_through(sql, RewriteReason::JoinNoAlias);
                            }
                            let alias2 = &sql[p..next];
                            next += 1;
                            if !starts_ignore_case(b, next, &self.shard_key) {
                                return pass_through(sql, RewriteReason::NoShardKey);
                            }
                            next += sk_len;
                            if is_word_char(peek(b, next)) {
                                return pass_through(sql, RewriteReason::NoShardKey);
                            }

                            out.push_str(&sql[start..next]);
                            out.push_str(AND);
                            out.push_str(alias1);
                            out.push_str(&self.dot_scuttle_eq);
                            out.push_str(alias2);
                            out.push_str(&self.dot_scuttle);
                        }
                        0 => {
                            // shard key in a projection list
                            if inner_select {
                                let alias = get_alias(b, start, next - sk_len);
                                out.push_str(&sql[start..next]);
                                out.push_str(COMMA);
                                if let Some((pos, len)) = alias {
                                    out.push_str(&sql[pos..pos + len + 1]);
                                }
                                out.push_str(&self.scuttle_name);
                            } else {
                                out.push_str(&sql[start..next]);
                            }
                        }
                        _ => {
                            out.push_str(&sql[start..next]);
                        }
                    }
                }
                _ => {}
            }
            start = next;
            last_token = found.needle as i32;
        }

        out.push_str(&sql[start..]);
        if rewritten {
            RewriteOutcome {
                sql: out,
                rewritten: true,
                reason: RewriteReason::Ok,
                cal_hash: String::new(),
            }
        } else {
            pass_through(sql, RewriteReason::NoShardKey)
        }
    }

    /// Consumes the bind name at `pos`, accepting an optional `_0`
    /// suffix. Returns the position after the name.
    fn expect_shard_bind(&self, b: &[u8], pos: usize) -> Option<usize> {
        if !starts_ignore_case(b, pos, &self.shard_key) {
            return None;
        }
        let mut next = pos + self.shard_key.len();
        let c = peek(b, next);
        if c.is_ascii_alphanumeric() {
            return None;
        }
        if c == b'_' {
            next += 1;
            if peek(b, next) == b'0' {
                next += 1;
            } else {
                return None;
            }
        }
        Some(next)
    }

    fn rewrite_insert(&self, sql: &str) -> RewriteOutcome {
        let b = sql.as_bytes();
        let mut out = String::with_capacity(sql.len() + 32);

        // column list: inject the scuttle column after the shard key
        let mut start = 0usize;
        loop {
            let Some(pos) = find_exact_i(b, start, &self.shard_key) else {
                return pass_through(sql, RewriteReason::NoShardKey);
            };
            let alias = get_alias(b, start, pos);
            let mut next = pos + self.shard_key.len();
            next = skip_spaces(b, next);
            out.push_str(&sql[start..next]);
            if !is_word_char(peek(b, next)) {
                out.push_str(COMMA);
                if let Some((apos, alen)) = alias {
                    out.push_str(&sql[apos..apos + alen + 1]);
                }
                out.push_str(&self.scuttle_name);
                start = next;
                break;
            }
            start = next;
        }

        // values list: inject the scuttle bind after the shard-key bind
        let mut next = start;
        loop {
            let Some(pos) = find_exact_i(b, next, &self.colon_shard_key) else {
                return pass_through(sql, RewriteReason::NoShardKey);
            };
            next = pos + self.colon_shard_key.len();
            next = skip_spaces(b, next);
            if !is_word_char(peek(b, next)) {
                out.push_str(&sql[start..next]);
                out.push_str(&self.comma_colon_scuttle);
                break;
            }
        }

        out.push_str(&sql[next..]);
        RewriteOutcome {
            sql: out,
            rewritten: true,
            reason: RewriteReason::Ok,
            cal_hash: String::new(),
        }
    }

    fn rewrite_update(&self, sql: &str) -> RewriteOutcome {
        let b = sql.as_bytes();
        let sk_len = self.shard_key.len();
        let mut out = String::with_capacity(sql.len() + 32);

        let mut start = 0usize;
        loop {
            let Some(where_pos) = find_exact_i(b, start, "where") else {
                return pass_through(sql, RewriteReason::NoShardKey);
            };
            let Some(bind_pos) = find_exact_i(b, where_pos, &self.colon_shard_key) else {
                return pass_through(sql, RewriteReason::NoShardKey);
            };
            // walk back over whitespace; an equality must precede the bind
            let mut p = bind_pos.saturating_sub(1);
            while p > start && (b[p] as char).is_ascii_whitespace() {
                p -= 1;
            }
            if peek(b, p) != b'=' {
                return pass_through(sql, RewriteReason::UpdateNoEq);
            }
            p = p.saturating_sub(1);
            while p > start && (b[p] as char).is_ascii_whitespace() {
                p -= 1;
            }
            let alias = if p + 1 >= sk_len {
                get_alias(b, start, p + 1 - sk_len)
            } else {
                None
            };

            let mut next = bind_pos + self.colon_shard_key.len();
            if !is_word_char(peek(b, next)) {
                out.push_str(&sql[..next]);
                out.push_str(AND);
                if let Some((apos, alen)) = alias {
                    out.push_str(&sql[apos..apos + alen + 1]);
                }
                out.push_str(&self.scuttle_where_eq);
                start = next;
                break;
            }
            next = skip_spaces(b, next);
            start = next;
        }

        out.push_str(&sql[start..]);
        RewriteOutcome {
            sql: out,
            rewritten: true,
            reason: RewriteReason::Ok,
            cal_hash: String::new(),
        }
    }
}

fn pass_through(sql: &str, reason: RewriteReason) -> RewriteOutcome {
    RewriteOutcome {
        sql: sql.to_string(),
        rewritten: false,
        reason,
        cal_hash: String::new(),
    }
}

fn peek(b: &[u8], pos: usize) -> u8 {
    if pos < b.len() {
        b[pos]
    } else {
        0
    }
}

fn skip_spaces(b: &[u8], mut pos: usize) -> usize {
    while pos < b.len() && (b[pos] as char).is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

fn starts_ignore_case(b: &[u8], pos: usize, needle: &str) -> bool {
    let n = needle.as_bytes();
    if pos + n.len() > b.len() {
        return false;
    }
    b[pos..pos + n.len()].eq_ignore_ascii_case(n)
}

/// The alias preceding `key_pos`, when the key is written `alias.key`.
/// Returns the alias start and length (excluding the dot).
fn get_alias(b: &[u8], region_start: usize, key_pos: usize) -> Option<(usize, usize)> {
    if key_pos == 0 {
        return None;
    }
    let dot = key_pos - 1;
    if dot <= region_start || b[dot] != b'.' {
        return None;
    }
    let mut alias = dot - 1;
    while alias > region_start && is_word_char(b[alias]) {
        alias -= 1;
    }
    if !is_word_char(b[alias]) {
        alias += 1;
    }
    Some((alias, dot - alias))
}

/// Case-insensitive search for `needle` as a whole token (word-boundary
/// delimited); matches flush at the search start are skipped.
fn find_exact_i(b: &[u8], from: usize, needle: &str) -> Option<usize> {
    let mut prev = from;
    let len = needle.len();
    loop {
        let rel = index_of_ignore_case_bytes(&b[prev..], needle)?;
        let pos = prev + rel;
        let left_ok = pos != from && pos > 0 && !is_word_char(b[pos - 1]);
        let right_ok = !is_word_char(peek(b, pos + len));
        if !left_ok || !right_ok {
            prev = pos + len;
            if prev >= b.len() {
                return None;
            }
            continue;
        }
        return Some(pos);
    }
}

fn index_of_ignore_case_bytes(haystack: &[u8], needle: &str) -> Option<usize> {
    let n = needle.as_bytes();
    if n.is_empty() || n.len() > haystack.len() {
        return None;
    }
    'outer: for i in 0..=(haystack.len() - n.len()) {
        for j in 0..n.len() {
            if !haystack[i + j].eq_ignore_ascii_case(&n[j]) {
                continue 'outer;
            }
        }
        return Some(i);
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    fn rewriter() -> SqlRewriter {
        SqlRewriter::new("party_id", "scuttle_id")
    }

    #[test]
    fn select_where_eq() {
        let mut rw = rewriter();
        let out = rw
            .rewrite("SELECT name FROM party WHERE party_id = :party_id")
            .clone();
        assert!(out.rewritten);
        assert_eq!(
            out.sql,
            "SELECT name FROM party WHERE party_id = :party_id AND scuttle_id = :scuttle_id "
        );
    }

    #[test]
    fn select_where_eq_suffixed_bind() {
        let mut rw = rewriter();
        let out = rw
            .rewrite("SELECT name FROM party WHERE party_id = :party_id_0")
            .clone();
        assert!(out.rewritten);
        assert!(out.sql.ends_with("AND scuttle_id = :scuttle_id "));
    }

    #[test]
    fn select_where_in_single_bind() {
        let mut rw = rewriter();
        let out = rw
            .rewrite("SELECT name FROM party WHERE party_id IN (:party_id)")
            .clone();
        assert!(out.rewritten);
        assert_eq!(
            out.sql,
            "SELECT name FROM party WHERE party_id IN (:party_id) AND scuttle_id = :scuttle_id "
        );
    }

    #[test]
    fn select_where_with_alias() {
        let mut rw = rewriter();
        let out = rw
            .rewrite("SELECT p.name FROM party p WHERE p.party_id = :party_id")
            .clone();
        assert!(out.rewritten);
        assert!(out
            .sql
            .ends_with("AND p.scuttle_id = :scuttle_id "));
    }

    #[test]
    fn join_gains_alias_pair() {
        let mut rw = rewriter();
        let out = rw
            .rewrite(
                "SELECT a.x FROM t1 a JOIN t2 b ON a.party_id = b.party_id WHERE a.party_id = :party_id",
            )
            .clone();
        assert!(out.rewritten);
        assert!(out.sql.contains("a.party_id = b.party_id AND a.scuttle_id = b.scuttle_id"));
        assert!(out.sql.ends_with("AND a.scuttle_id = :scuttle_id "));
    }

    #[test]
    fn join_without_alias_passes_through() {
        let mut rw = rewriter();
        let out = rw
            .rewrite("SELECT x FROM t1 JOIN t2 ON party_id = party_id")
            .clone();
        assert!(!out.rewritten);
        assert_eq!(out.reason, RewriteReason::JoinNoAlias);
    }

    #[test]
    fn insert_gains_column_and_bind() {
        let mut rw = rewriter();
        let out = rw
            .rewrite("INSERT INTO party (name, party_id) VALUES (:name, :party_id)")
            .clone();
        assert!(out.rewritten);
        assert_eq!(
            out.sql,
            "INSERT INTO party (name, party_id, scuttle_id) VALUES (:name, :party_id, :scuttle_id)"
        );
    }

    #[test]
    fn update_where_appended() {
        let mut rw = rewriter();
        let out = rw
            .rewrite("UPDATE party SET name = :name WHERE party_id = :party_id")
            .clone();
        assert!(out.rewritten);
        assert_eq!(
            out.sql,
            "UPDATE party SET name = :name WHERE party_id = :party_id AND scuttle_id = :scuttle_id "
        );
    }

    #[test]
    fn delete_where_appended() {
        let mut rw = rewriter();
        let out = rw
            .rewrite("DELETE FROM party WHERE party_id = :party_id")
            .clone();
        assert!(out.rewritten);
        assert!(out.sql.ends_with("AND scuttle_id = :scuttle_id "));
    }

    #[test]
    fn existing_scuttle_reference_passes_through() {
        let mut rw = rewriter();
        let out = rw
            .rewrite("SELECT name FROM party WHERE party_id = :party_id AND scuttle_id = 5")
            .clone();
        assert!(!out.rewritten);
        assert_eq!(out.reason, RewriteReason::HasScuttleId);
    }

    #[test]
    fn plsql_passes_through() {
        let mut rw = rewriter();
        let out = rw.rewrite("BEGIN do_thing(:party_id); END;").clone();
        assert!(!out.rewritten);
        assert_eq!(out.reason, RewriteReason::Plsql);
    }

    #[test]
    fn no_shard_key_passes_through() {
        let mut rw = rewriter();
        let out = rw.rewrite("SELECT 1 FROM dual").clone();
        assert!(!out.rewritten);
        assert_eq!(out.reason, RewriteReason::NoShardKey);
    }

    #[test]
    fn where_without_bind_passes_through() {
        let mut rw = rewriter();
        let out = rw
            .rewrite("SELECT name FROM party WHERE party_id = 2050")
            .clone();
        assert!(!out.rewritten);
        assert_eq!(out.reason, RewriteReason::SelectWhere);
    }

    #[test]
    fn substring_names_do_not_match() {
        let mut rw = rewriter();
        let out = rw
            .rewrite("SELECT name FROM party WHERE third_party_id = :third_party_id")
            .clone();
        assert!(!out.rewritten);
    }

    #[test]
    fn outcome_is_cached() {
        let mut rw = rewriter();
        let sql = "SELECT name FROM party WHERE party_id = :party_id";
        let first = rw.rewrite(sql).sql.clone();
        let second = rw.rewrite(sql).sql.clone();
        assert_eq!(first, second);
        assert_eq!(rw.cache.len(), 1);
    }
}
