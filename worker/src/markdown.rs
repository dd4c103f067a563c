use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rand::Rng;
use tracing::{debug, warn};

use common::string_util;

/// What a markdown rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkdownScope {
    Host,
    Table,
    Sql,
    Url,
    Trans,
    Commit,
}

impl MarkdownScope {
    fn from_file_name(name: &str) -> Option<MarkdownScope> {
        let lower = name.to_ascii_lowercase();
        // order matters: "table" before "trans" is irrelevant here, but
        // prefixes must be tested longest-meaning first
        if lower.starts_with("host") {
            Some(MarkdownScope::Host)
        } else if lower.starts_with("table") {
            Some(MarkdownScope::Table)
        } else if lower.starts_with("sql") {
            Some(MarkdownScope::Sql)
        } else if lower.starts_with("url") {
            Some(MarkdownScope::Url)
        } else if lower.starts_with("trans") {
            Some(MarkdownScope::Trans)
        } else if lower.starts_with("commit") {
            Some(MarkdownScope::Commit)
        } else {
            None
        }
    }
}

/// One rule from a per-scope file: the detail string and an optional
/// host the rule is limited to.
#[derive(Debug, Clone)]
pub struct MarkdownRule {
    pub scope: MarkdownScope,
    pub detail: String,
    pub host_filter: String,
}

/// Keyword-list rule from the tabular control files, with a percentage
/// frequency and optional host scope.
#[derive(Debug, Clone)]
struct MarkdownFilter {
    keywords: Vec<String>,
    host: String,
    freq: i32,
    /// Repeat of the same statement right after a match is let through.
    last_sql: String,
}

impl MarkdownFilter {
    fn matches(&mut self, src: &str, host: &str, host2: &str, is_table: bool) -> bool {
        let mut off = 0usize;
        if is_table {
            // skip a leading /* ... */ comment
            if src.starts_with("/*") {
                if let Some(end) = src.find("*/") {
                    off = end + 2;
                }
            }
            while off < src.len() && src.as_bytes()[off].is_ascii_whitespace() {
                off += 1;
            }
            let rest = &src[off..];
            if !(rest.starts_with("SELECT")
                || rest.starts_with("UPDATE")
                || rest.starts_with("INSERT")
                || rest.starts_with("DELETE"))
            {
                return false;
            }
        }

        let search_from = if is_table { (off + 6).min(src.len()) } else { 0 };
        for kw in &self.keywords {
            if !src[search_from..].contains(kw.as_str()) {
                return false;
            }
        }

        if !self.host.is_empty() && self.host != host && self.host != host2 {
            debug!("markdown: host mismatch {} vs {}/{}", self.host, host, host2);
            return false;
        }

        if self.freq < 100 {
            let mut w: f32 = rand::thread_rng().gen_range(0.0..100.0);
            if is_table && src[off..].starts_with("SELECT") {
                w *= 2.0;
            }
            if w > self.freq as f32 {
                return false;
            }
            if self.last_sql == src {
                self.last_sql.clear();
                return false;
            }
        }

        debug!(
            "markdown: matched kw={:?} freq={} src={}",
            self.keywords, self.freq, src
        );
        self.last_sql = src.to_string();
        true
    }
}

fn mod_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// The tabular `rule_table` / `rule_sql` control files, reloaded when
/// their mtime changes.
#[derive(Debug, Default)]
pub struct MarkdownList {
    path: Option<PathBuf>,
    filters: [Vec<MarkdownFilter>; 2],
    last_mod: [Option<SystemTime>; 2],
}

impl MarkdownList {
    pub fn is_empty(&self) -> bool {
        self.filters[0].is_empty() && self.filters[1].is_empty()
    }

    pub fn load_control_files(&mut self, dir: &Path) {
        self.path = Some(dir.to_path_buf());
        let files = [dir.join("rule_table"), dir.join("rule_sql")];

        for (i, file) in files.iter().enumerate() {
            let t = mod_time(file);
            if t.is_none() || t == self.last_mod[i] {
                continue;
            }
            debug!("markdown: loading control file {}", file.display());
            self.last_mod[i] = t;
            self.filters[i].clear();

            let Ok(raw) = fs::read_to_string(file) else {
                continue;
            };
            for line in raw.lines() {
                // keyword-list | frequency | host
                let mut fields = line.split('|');
                let Some(kwlist) = fields.next() else {
                    continue;
                };
                let kwlist = kwlist.trim().to_ascii_uppercase();
                if kwlist.is_empty() {
                    continue;
                }
                let keywords = if i == 0 {
                    // the table file carries a single table name
                    vec![kwlist]
                } else {
                    kwlist
                        .split('~')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(str::to_string)
                        .collect()
                };
                if keywords.is_empty() {
                    continue;
                }

                let mut freq = 100;
                if let Some(f) = fields.next() {
                    let f = f.trim();
                    if !f.is_empty() {
                        freq = f.parse().unwrap_or(100);
                        if !(0..=100).contains(&freq) {
                            freq = 0;
                        }
                    }
                }
                let host = fields
                    .next()
                    .map(|h| h.trim().to_ascii_uppercase())
                    .unwrap_or_default();

                self.filters[i].push(MarkdownFilter {
                    keywords,
                    host,
                    freq,
                    last_sql: String::new(),
                });
            }
        }
    }

    /// True when the statement must be blocked by a keyword rule.
    pub fn do_markdown(&mut self, host: &str, host2: &str, raw_sql: &str) -> bool {
        if self.is_empty() {
            return false;
        }
        if let Some(path) = self.path.clone() {
            // pick up edits between requests
            self.load_control_files(&path);
        }

        let src = raw_sql.trim().to_ascii_uppercase();
        let host = host.to_ascii_uppercase();
        let host2 = host2.to_ascii_uppercase();

        for k in 0..2 {
            for filter in &mut self.filters[k] {
                if filter.matches(&src, &host, &host2, k == 0) {
                    return true;
                }
            }
        }
        false
    }
}

/// Reads every rule file in the markdown directory. File-name prefix
/// picks the scope; line 1 is the detail, optional line 2 a host filter.
pub fn build_markdowns(dir: &str, list: &mut MarkdownList) -> Vec<MarkdownRule> {
    let mut rules = Vec::new();
    if dir.is_empty() {
        return rules;
    }
    let path = Path::new(dir);
    let Ok(entries) = fs::read_dir(path) else {
        debug!("markdown path {} does not exist", dir);
        return rules;
    };
    list.load_control_files(path);

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name == "rule_table" || name == "rule_sql" {
            continue;
        }
        let Some(scope) = MarkdownScope::from_file_name(&name) else {
            if !name.starts_with("postinstall") {
                debug!("markdown file {} is of unknown type", name);
            }
            continue;
        };
        let Ok(raw) = fs::read_to_string(entry.path()) else {
            continue;
        };
        let mut lines = raw.lines();
        let Some(detail) = lines.next() else {
            continue;
        };
        if detail.is_empty() {
            continue;
        }
        let host_filter = lines.next().unwrap_or("").to_string();
        rules.push(MarkdownRule {
            scope,
            detail: detail.to_string(),
            host_filter,
        });
    }
    rules
}

/// Checks the per-scope rules against one inbound command. Returns true
/// when the command is marked down.
pub fn check_markdowns(
    rules: &[MarkdownRule],
    scope: MarkdownScope,
    src: &str,
    host_name: &str,
    mark_host_name: &str,
    module_info: &str,
) -> bool {
    if rules.is_empty() {
        return false;
    }

    let mut fixed: Option<String> = None;
    for rule in rules {
        if rule.scope != scope {
            continue;
        }
        if !rule.host_filter.is_empty()
            && !rule.host_filter.eq_ignore_ascii_case(host_name)
        {
            continue;
        }

        match rule.scope {
            MarkdownScope::Table => {
                // strip a leading comment before the position heuristics
                let mut body = src;
                if let Some(end) = src.find("*/") {
                    if end + 2 < src.len() {
                        body = &src[end + 2..];
                    }
                }
                let Some(table_loc) = string_util::index_of_ignore_case(body, &rule.detail)
                else {
                    continue;
                };
                if string_util::starts_with_ignore_case(body, "update") {
                    // table name must come before SET
                    match string_util::index_of_ignore_case(body, " set") {
                        Some(set_loc) if set_loc <= table_loc => {}
                        _ => return true,
                    }
                } else if string_util::starts_with_ignore_case(body, "insert") {
                    // table name must come before the column list
                    match body.find('(') {
                        Some(paren) if paren <= table_loc => {}
                        _ => return true,
                    }
                } else {
                    // a SELECT: the name must appear after FROM
                    if let Some(from_loc) = string_util::index_of_ignore_case(body, "from ")
                    {
                        if string_util::index_of_ignore_case(&body[from_loc..], &rule.detail)
                            .is_some()
                        {
                            return true;
                        }
                    }
                }
            }
            MarkdownScope::Sql => {
                let body = fixed.get_or_insert_with(|| {
                    let mut s = src.replace('\n', " ");
                    while s.contains("  ") {
                        s = s.replace("  ", " ");
                    }
                    s
                });
                if string_util::index_of_ignore_case(body, &rule.detail).is_some() {
                    return true;
                }
            }
            MarkdownScope::Host => {
                if rule.detail.eq_ignore_ascii_case(host_name)
                    || rule.detail.eq_ignore_ascii_case(mark_host_name)
                {
                    return true;
                }
            }
            MarkdownScope::Commit => {
                if rule.detail.eq_ignore_ascii_case(module_info.trim()) {
                    return true;
                }
            }
            MarkdownScope::Trans => {
                warn!("blocking trans-start because of markdown");
                return true;
            }
            MarkdownScope::Url => {}
        }
    }
    false
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        write!(f, "{}", content).unwrap();
    }

    #[test]
    fn scope_from_file_name() {
        assert_eq!(
            MarkdownScope::from_file_name("host_db42"),
            Some(MarkdownScope::Host)
        );
        assert_eq!(
            MarkdownScope::from_file_name("TABLE1"),
            Some(MarkdownScope::Table)
        );
        assert_eq!(MarkdownScope::from_file_name("readme"), None);
    }

    #[test]
    fn directory_scan_builds_rules() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "sql_bad", "DROP TABLE users\n");
        write_file(dir.path(), "host_primary", "dbhost42\notherhost\n");
        let mut list = MarkdownList::default();
        let rules = build_markdowns(dir.path().to_str().unwrap(), &mut list);
        assert_eq!(rules.len(), 2);
        let sql_rule = rules.iter().find(|r| r.scope == MarkdownScope::Sql).unwrap();
        assert_eq!(sql_rule.detail, "DROP TABLE users");
        let host_rule = rules.iter().find(|r| r.scope == MarkdownScope::Host).unwrap();
        assert_eq!(host_rule.host_filter, "otherhost");
    }

    #[test]
    fn host_markdown_blocks_everything() {
        let rules = vec![MarkdownRule {
            scope: MarkdownScope::Host,
            detail: "dbhost42".to_string(),
            host_filter: String::new(),
        }];
        assert!(check_markdowns(
            &rules,
            MarkdownScope::Host,
            "",
            "DBHOST42",
            "",
            ""
        ));
        assert!(!check_markdowns(
            &rules,
            MarkdownScope::Host,
            "",
            "otherhost",
            "",
            ""
        ));
    }

    #[test]
    fn sql_markdown_matches_inside_statement() {
        let rules = vec![MarkdownRule {
            scope: MarkdownScope::Sql,
            detail: "FROM party".to_string(),
            host_filter: String::new(),
        }];
        assert!(check_markdowns(
            &rules,
            MarkdownScope::Sql,
            "SELECT name\nFROM   party WHERE x = 1",
            "h",
            "",
            ""
        ));
        assert!(!check_markdowns(
            &rules,
            MarkdownScope::Sql,
            "SELECT name FROM other",
            "h",
            "",
            ""
        ));
    }

    #[test]
    fn table_markdown_position_heuristics() {
        let rules = vec![MarkdownRule {
            scope: MarkdownScope::Table,
            detail: "party".to_string(),
            host_filter: String::new(),
        }];
        // SELECT: name after FROM blocks
        assert!(check_markdowns(
            &rules,
            MarkdownScope::Table,
            "SELECT x FROM party",
            "h",
            "",
            ""
        ));
        // UPDATE: table before SET blocks
        assert!(check_markdowns(
            &rules,
            MarkdownScope::Table,
            "UPDATE party SET x = 1",
            "h",
            "",
            ""
        ));
        // INSERT: table before the paren blocks
        assert!(check_markdowns(
            &rules,
            MarkdownScope::Table,
            "INSERT INTO party (a) VALUES (1)",
            "h",
            "",
            ""
        ));
        // the name in a SELECT projection only does not block
        assert!(!check_markdowns(
            &rules,
            MarkdownScope::Table,
            "SELECT party FROM other",
            "h",
            "",
            ""
        ));
    }

    #[test]
    fn commit_markdown_matches_module() {
        let rules = vec![MarkdownRule {
            scope: MarkdownScope::Commit,
            detail: "billing".to_string(),
            host_filter: String::new(),
        }];
        assert!(check_markdowns(
            &rules,
            MarkdownScope::Commit,
            "",
            "h",
            "",
            " billing "
        ));
        assert!(!check_markdowns(
            &rules,
            MarkdownScope::Commit,
            "",
            "h",
            "",
            "checkout"
        ));
    }

    #[test]
    fn control_file_reload_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "rule_sql", "DROP TABLE | 100 |\n");
        let mut list = MarkdownList::default();
        list.load_control_files(dir.path());
        assert!(!list.is_empty());
        assert!(list.do_markdown("h", "", "drop table users"));
        assert!(!list.do_markdown("h", "", "select 1 from dual"));
    }

    #[test]
    fn keyword_rule_with_host_scope() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "rule_sql", "SLOW QUERY | 100 | dbhost42\n");
        let mut list = MarkdownList::default();
        list.load_control_files(dir.path());
        assert!(list.do_markdown("dbhost42", "", "slow query on t"));
        assert!(!list.do_markdown("otherhost", "", "slow query on t"));
    }

    #[test]
    fn zero_frequency_never_blocks() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "rule_sql", "ANY | 0 |\n");
        let mut list = MarkdownList::default();
        list.load_control_files(dir.path());
        for _ in 0..20 {
            assert!(!list.do_markdown("h", "", "any statement"));
        }
    }
}
