use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use tracing::debug;

use common::string_util;

use crate::bind::{BindSlot, OutBindSlot};
use crate::define::{DateTimeId, DefineSlot, LobId};
use crate::error::{DResult, DriverError};
use crate::facade::{
    DriverBreaker, ExecOutcome, FetchOutcome, SqlDriver, StmtId, TransPrepareOutcome,
};
use crate::types::{
    datetime, ColumnInfo, ColumnType, ServerInfo, SessionAttr, StatementKind, TransCoupling, Xid,
};

/// One cell of a canned result row.
#[derive(Debug, Clone)]
pub enum CannedValue {
    Null,
    Str(String),
    Raw(Vec<u8>),
    Clob(String),
    Blob(Vec<u8>),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
}

/// A scripted statement: result shape for SELECTs, affected-row counts for
/// DML, optional error/warning/batch outcomes, OUT bind values.
#[derive(Debug, Clone, Default)]
pub struct CannedStatement {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<CannedValue>>,
    pub dml_row_count: u64,
    pub exec_error: Option<DriverError>,
    pub exec_warning: Option<DriverError>,
    pub batch_errors: Vec<(u32, i32)>,
    /// `(bind_name, column_index)`: rows are filtered to those whose cell
    /// text equals the bound value, approximating an equality predicate.
    pub filter_bind: Option<(String, usize)>,
    pub out_values: Vec<(String, Option<Vec<u8>>)>,
}

impl CannedStatement {
    pub fn select(column_names: &[&str], rows: Vec<Vec<CannedValue>>) -> Self {
        let columns = column_names
            .iter()
            .map(|n| ColumnInfo {
                name: n.to_string(),
                col_type: ColumnType::Str,
                width: 64,
                precision: 0,
                scale: 0,
            })
            .collect();
        CannedStatement {
            columns,
            rows,
            ..Default::default()
        }
    }

    pub fn select_typed(columns: Vec<ColumnInfo>, rows: Vec<Vec<CannedValue>>) -> Self {
        CannedStatement {
            columns,
            rows,
            ..Default::default()
        }
    }

    pub fn dml(row_count: u64) -> Self {
        CannedStatement {
            dml_row_count: row_count,
            ..Default::default()
        }
    }

    pub fn with_error(mut self, err: DriverError) -> Self {
        self.exec_error = Some(err);
        self
    }

    pub fn with_warning(mut self, warn: DriverError) -> Self {
        self.exec_warning = Some(warn);
        self
    }

    pub fn with_batch_errors(mut self, errors: Vec<(u32, i32)>) -> Self {
        self.batch_errors = errors;
        self
    }

    pub fn with_filter_bind(mut self, bind_name: &str, column: usize) -> Self {
        self.filter_bind = Some((bind_name.to_ascii_lowercase(), column));
        self
    }

    pub fn with_out_value(mut self, name: &str, value: Option<&[u8]>) -> Self {
        self.out_values
            .push((name.to_ascii_lowercase(), value.map(|v| v.to_vec())));
        self
    }
}

#[derive(Debug)]
struct PreparedStmt {
    sql: String,
    kind: StatementKind,
    binds: HashMap<String, Option<Vec<u8>>>,
    out_bind_names: Vec<String>,
    snapshot: Vec<Vec<CannedValue>>,
    cursor: usize,
    fetched: u64,
    executed: bool,
}

#[derive(Debug)]
struct LobValue {
    bytes: Vec<u8>,
    char_len: u64,
}

/// Deterministic in-memory driver used by the test harness and local
/// bring-up. Result sets are scripted per normalized SQL text.
pub struct MemoryDriver {
    info: ServerInfo,
    expected_credentials: Option<(String, String)>,
    connected: bool,

    canned: HashMap<String, CannedStatement>,
    blocking_sqls: HashSet<String>,
    stmts: HashMap<StmtId, PreparedStmt>,
    next_stmt: StmtId,
    last_batch_errors: Vec<(u32, i32)>,

    lobs: HashMap<u64, LobValue>,
    datetimes: HashMap<u64, String>,
    next_handle: u64,

    breaker: DriverBreaker,

    in_txn: bool,
    xid: Option<Xid>,
    in_global_txn: bool,
    heuristic_outcome: Option<i32>,
    trans_prepare_no_effect: bool,
    heartbeat_error: Option<DriverError>,

    pub session_attrs: HashMap<&'static str, String>,
    pub commits: u32,
    pub two_phase_commits: u32,
    pub rollbacks: u32,
    pub forgets: u32,
    pub trans_starts: Vec<(String, u32)>,
    pub executed: Vec<String>,
}

/// Upper bound on a gated blocking execute, so a test that forgets to
/// interrupt does not hang the suite.
const BLOCK_CAP: Duration = Duration::from_secs(30);

impl MemoryDriver {
    pub fn new() -> Self {
        MemoryDriver {
            info: ServerInfo {
                version: "MemDB 1.0".to_string(),
                release: "1.0.0".to_string(),
                charset: "AL32UTF8".to_string(),
                unique_name: "memdb".to_string(),
                instance_id: 1,
            },
            expected_credentials: None,
            connected: false,
            canned: HashMap::new(),
            blocking_sqls: HashSet::new(),
            stmts: HashMap::new(),
            next_stmt: 1,
            last_batch_errors: Vec::new(),
            lobs: HashMap::new(),
            datetimes: HashMap::new(),
            next_handle: 1,
            breaker: DriverBreaker::new(),
            in_txn: false,
            xid: None,
            in_global_txn: false,
            heuristic_outcome: None,
            trans_prepare_no_effect: false,
            heartbeat_error: None,
            session_attrs: HashMap::new(),
            commits: 0,
            two_phase_commits: 0,
            rollbacks: 0,
            forgets: 0,
            trans_starts: Vec::new(),
            executed: Vec::new(),
        }
    }

    pub fn with_statement(mut self, sql: &str, canned: CannedStatement) -> Self {
        self.add_statement(sql, canned);
        self
    }

    pub fn add_statement(&mut self, sql: &str, canned: CannedStatement) {
        self.canned.insert(string_util::normalize_sql(sql), canned);
    }

    pub fn with_charset(mut self, charset: &str) -> Self {
        self.info.charset = charset.to_string();
        self
    }

    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.expected_credentials = Some((user.to_string(), password.to_string()));
        self
    }

    /// Makes execute of this SQL block until the break flag is raised.
    pub fn with_blocking(mut self, sql: &str) -> Self {
        self.blocking_sqls.insert(string_util::normalize_sql(sql));
        self
    }

    /// Scripts commit/rollback-by-XID to report heuristic completion.
    pub fn with_heuristic_outcome(mut self, code: i32) -> Self {
        self.heuristic_outcome = Some(code);
        self
    }

    pub fn with_trans_prepare_no_effect(mut self) -> Self {
        self.trans_prepare_no_effect = true;
        self
    }

    pub fn with_heartbeat_error(mut self, err: DriverError) -> Self {
        self.heartbeat_error = Some(err);
        self
    }

    fn stmt(&mut self, id: StmtId) -> DResult<&mut PreparedStmt> {
        self.stmts
            .get_mut(&id)
            .ok_or_else(|| DriverError::internal(format!("unknown statement handle {}", id)))
    }

    fn new_handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn store_cell(&mut self, slot: &mut DefineSlot, row: usize, value: &CannedValue) {
        match value {
            CannedValue::Null => slot.store_null(row),
            CannedValue::Str(s) => slot.store_bytes(row, s.as_bytes()),
            CannedValue::Raw(bytes) => {
                // native raw buffers carry a 4-byte length prefix
                let mut buf = Vec::with_capacity(bytes.len() + 4);
                buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                buf.extend_from_slice(bytes);
                slot.store_bytes(row, &buf);
                slot.lengths[row] = bytes.len();
            }
            CannedValue::Clob(text) => {
                let h = self.new_handle();
                self.lobs.insert(
                    h,
                    LobValue {
                        bytes: text.as_bytes().to_vec(),
                        char_len: text.chars().count() as u64,
                    },
                );
                slot.store_lob(row, LobId(h));
            }
            CannedValue::Blob(bytes) => {
                let h = self.new_handle();
                self.lobs.insert(
                    h,
                    LobValue {
                        bytes: bytes.clone(),
                        char_len: bytes.len() as u64,
                    },
                );
                slot.store_lob(row, LobId(h));
            }
            CannedValue::Timestamp(ts) => {
                let h = self.new_handle();
                self.datetimes.insert(h, datetime::format_timestamp(ts));
                slot.store_datetime(row, DateTimeId(h));
            }
            CannedValue::TimestampTz(ts) => {
                let h = self.new_handle();
                self.datetimes.insert(h, datetime::format_timestamp_tz(ts));
                slot.store_datetime(row, DateTimeId(h));
            }
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        MemoryDriver::new()
    }
}

impl SqlDriver for MemoryDriver {
    fn connect(&mut self, username: &str, password: &str) -> DResult<()> {
        if let Some((u, p)) = &self.expected_credentials {
            if u != username || p != password {
                return Err(DriverError::new(1017, "invalid username/password"));
            }
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.stmts.clear();
        self.lobs.clear();
        self.datetimes.clear();
    }

    fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    fn prepare(&mut self, sql: &str) -> DResult<(StmtId, StatementKind)> {
        let normalized = string_util::normalize_sql(sql);
        let kind = StatementKind::infer(&normalized);
        let id = self.next_stmt;
        self.next_stmt += 1;
        self.stmts.insert(
            id,
            PreparedStmt {
                sql: normalized,
                kind,
                binds: HashMap::new(),
                out_bind_names: Vec::new(),
                snapshot: Vec::new(),
                cursor: 0,
                fetched: 0,
                executed: false,
            },
        );
        Ok((id, kind))
    }

    fn free_statement(&mut self, stmt: StmtId) {
        self.stmts.remove(&stmt);
    }

    fn bind(&mut self, stmt: StmtId, slot: &BindSlot) -> DResult<()> {
        let name = slot.bare_name().to_ascii_lowercase();
        // validate temporal text before accepting the bind
        if slot.data_type.is_temporal() {
            for row in slot.rows.iter().flatten() {
                if !row.is_empty() {
                    let text = std::str::from_utf8(row)
                        .map_err(|_| DriverError::new(1843, "not a valid datetime"))?;
                    if slot.data_type == crate::types::DataType::Timestamp {
                        datetime::parse_timestamp(text)
                            .map_err(|_| DriverError::new(1843, "not a valid datetime"))?;
                    } else {
                        datetime::parse_timestamp_tz(text)
                            .map_err(|_| DriverError::new(1843, "not a valid datetime"))?;
                    }
                }
            }
        }
        let first = slot.rows.first().cloned().unwrap_or(None);
        self.stmt(stmt)?.binds.insert(name, first);
        Ok(())
    }

    fn bind_out(&mut self, stmt: StmtId, slot: &OutBindSlot) -> DResult<()> {
        let name = slot.name.trim_start_matches(':').to_ascii_lowercase();
        self.stmt(stmt)?.out_bind_names.push(name);
        Ok(())
    }

    fn execute(&mut self, stmt_id: StmtId, _iterations: u32) -> DResult<ExecOutcome> {
        let sql = self.stmt(stmt_id)?.sql.clone();
        self.executed.push(sql.clone());

        if self.blocking_sqls.contains(&sql) {
            debug!("memory driver: blocking execute of {:?}", sql);
            let start = Instant::now();
            loop {
                if self.breaker.is_broken() {
                    return Err(DriverError::cancelled());
                }
                if start.elapsed() > BLOCK_CAP {
                    return Err(DriverError::cancelled());
                }
                thread::sleep(Duration::from_millis(2));
            }
        }

        let canned = match self.canned.get(&sql) {
            Some(c) => c.clone(),
            None => {
                let kind = self.stmt(stmt_id)?.kind;
                if kind.is_select() {
                    return Err(DriverError::new(
                        942,
                        format!("table or view does not exist: {}", sql),
                    ));
                }
                CannedStatement::dml(0)
            }
        };

        if let Some(err) = &canned.exec_error {
            self.last_batch_errors = canned.batch_errors.clone();
            return Err(err.clone());
        }
        self.last_batch_errors.clear();

        let kind = self.stmt(stmt_id)?.kind;
        let mut snapshot = canned.rows.clone();
        if let Some((bind_name, col)) = &canned.filter_bind {
            let bound = self
                .stmt(stmt_id)?
                .binds
                .get(bind_name)
                .cloned()
                .flatten();
            if let Some(bound) = bound {
                snapshot.retain(|row| match row.get(*col) {
                    Some(CannedValue::Str(s)) => s.as_bytes() == bound.as_slice(),
                    _ => false,
                });
            } else {
                snapshot.clear();
            }
        }

        {
            let st = self.stmt(stmt_id)?;
            st.snapshot = snapshot;
            st.cursor = 0;
            st.fetched = 0;
            st.executed = true;
        }

        let row_count = if kind.is_select() {
            0
        } else {
            if kind.is_dml() || kind.is_plsql() {
                self.in_txn = true;
            }
            canned.dml_row_count
        };

        Ok(ExecOutcome {
            row_count,
            warning: canned.exec_warning.clone(),
        })
    }

    fn batch_errors(&mut self, _stmt: StmtId) -> Vec<(u32, i32)> {
        self.last_batch_errors.clone()
    }

    fn column_info(&mut self, stmt: StmtId) -> DResult<Vec<ColumnInfo>> {
        let sql = self.stmt(stmt)?.sql.clone();
        Ok(self
            .canned
            .get(&sql)
            .map(|c| c.columns.clone())
            .unwrap_or_default())
    }

    fn row_count(&mut self, stmt: StmtId) -> DResult<u64> {
        let st = self.stmt(stmt)?;
        if st.kind.is_select() {
            Ok(st.fetched)
        } else {
            let sql = st.sql.clone();
            Ok(self
                .canned
                .get(&sql)
                .map(|c| c.dml_row_count)
                .unwrap_or(0))
        }
    }

    fn fetch_block(
        &mut self,
        stmt_id: StmtId,
        defines: &mut [DefineSlot],
        block_rows: usize,
    ) -> DResult<FetchOutcome> {
        if self.breaker.is_broken() {
            return Err(DriverError::cancelled());
        }
        let (rows, cursor) = {
            let st = self.stmt(stmt_id)?;
            if !st.executed {
                return Err(DriverError::new(1002, "fetch out of sequence"));
            }
            let end = (st.cursor + block_rows).min(st.snapshot.len());
            (st.snapshot[st.cursor..end].to_vec(), st.cursor)
        };

        for (i, row) in rows.iter().enumerate() {
            for (col, slot) in defines.iter_mut().enumerate() {
                let value = row.get(col).unwrap_or(&CannedValue::Null);
                let value = value.clone();
                self.store_cell(slot, i, &value);
            }
        }

        let n = rows.len();
        let st = self.stmt(stmt_id)?;
        st.cursor = cursor + n;
        st.fetched += n as u64;
        Ok(FetchOutcome {
            rows_in_block: n,
            total_rows: st.fetched,
            no_more_data: n < block_rows,
        })
    }

    fn read_out_binds(&mut self, stmt_id: StmtId, slots: &mut [OutBindSlot]) -> DResult<()> {
        let sql = self.stmt(stmt_id)?.sql.clone();
        let canned = self.canned.get(&sql).cloned().unwrap_or_default();
        for slot in slots.iter_mut() {
            let name = slot.name.trim_start_matches(':').to_ascii_lowercase();
            let scripted = canned
                .out_values
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone());
            match scripted {
                Some(Some(v)) => slot.store(0, Some(&v)),
                Some(None) | None => slot.store(0, None),
            }
        }
        Ok(())
    }

    fn lob_write(&mut self, _stmt: StmtId, _bind_name: &str, _value: &[u8]) -> DResult<()> {
        Ok(())
    }

    fn lob_length(&mut self, lob: LobId) -> DResult<u64> {
        let v = self
            .lobs
            .get(&lob.0)
            .ok_or_else(|| DriverError::internal("stale LOB locator"))?;
        // character length for CLOBs, byte length for BLOBs; callers size
        // buffers from this
        Ok(v.char_len)
    }

    fn lob_read(&mut self, lob: LobId, buf_size: usize, _by_chars: bool) -> DResult<Vec<u8>> {
        let v = self
            .lobs
            .get(&lob.0)
            .ok_or_else(|| DriverError::internal("stale LOB locator"))?;
        let n = v.bytes.len().min(buf_size);
        Ok(v.bytes[..n].to_vec())
    }

    fn datetime_text(&mut self, dt: DateTimeId) -> DResult<String> {
        self.datetimes
            .get(&dt.0)
            .cloned()
            .ok_or_else(|| DriverError::internal("stale datetime descriptor"))
    }

    fn commit(&mut self, two_phase: bool) -> DResult<()> {
        if let (Some(code), Some(_)) = (self.heuristic_outcome, &self.xid) {
            return Err(DriverError::new(code, "transaction heuristically completed"));
        }
        self.commits += 1;
        if two_phase {
            self.two_phase_commits += 1;
        }
        self.in_txn = false;
        Ok(())
    }

    fn rollback(&mut self) -> DResult<()> {
        if let (Some(code), Some(_)) = (self.heuristic_outcome, &self.xid) {
            return Err(DriverError::new(code, "transaction heuristically completed"));
        }
        self.rollbacks += 1;
        self.in_txn = false;
        Ok(())
    }

    fn set_xid(&mut self, xid: &Xid) -> DResult<()> {
        self.xid = Some(xid.clone());
        Ok(())
    }

    fn trans_start(&mut self, timeout: u32, _coupling: TransCoupling) -> DResult<()> {
        let Some(xid) = &self.xid else {
            return Err(DriverError::internal("trans_start without an XID"));
        };
        self.trans_starts.push((xid.to_string(), timeout));
        self.in_global_txn = true;
        Ok(())
    }

    fn trans_prepare(&mut self) -> DResult<TransPrepareOutcome> {
        if self.trans_prepare_no_effect {
            return Ok(TransPrepareOutcome::NoEffect);
        }
        Ok(TransPrepareOutcome::Prepared)
    }

    fn trans_forget(&mut self) -> DResult<()> {
        self.forgets += 1;
        self.xid = None;
        Ok(())
    }

    fn reset_transaction(&mut self) -> DResult<()> {
        self.xid = None;
        self.in_global_txn = false;
        Ok(())
    }

    fn in_transaction(&mut self) -> DResult<bool> {
        Ok(self.in_txn)
    }

    fn set_session_attr(&mut self, attr: SessionAttr, value: &str) -> DResult<()> {
        let key = match attr {
            SessionAttr::ClientIdentifier => "client_identifier",
            SessionAttr::ClientInfo => "client_info",
            SessionAttr::Action => "action",
            SessionAttr::Module => "module",
        };
        self.session_attrs.insert(key, value.to_string());
        Ok(())
    }

    fn breaker(&self) -> DriverBreaker {
        self.breaker.clone()
    }

    fn reset_after_break(&mut self) -> DResult<()> {
        self.breaker.reset();
        Ok(())
    }

    fn heartbeat(&mut self) -> DResult<()> {
        match &self.heartbeat_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::define::build_define_slots;

    fn select_driver() -> (MemoryDriver, StmtId) {
        let mut drv = MemoryDriver::new().with_statement(
            "SELECT id FROM t WHERE id = :id",
            CannedStatement::select(
                &["id"],
                vec![
                    vec![CannedValue::Str("7".into())],
                    vec![CannedValue::Str("8".into())],
                ],
            )
            .with_filter_bind("id", 0),
        );
        drv.connect("scott", "tiger").unwrap();
        let (stmt, kind) = drv.prepare("SELECT id FROM t WHERE id = :id").unwrap();
        assert_eq!(kind, StatementKind::Select);
        (drv, stmt)
    }

    #[test]
    fn filtered_select_fetch() {
        let (mut drv, stmt) = select_driver();
        drv.bind(
            stmt,
            &BindSlot::single(":id", crate::types::DataType::String, Some(b"7".to_vec())),
        )
        .unwrap();
        drv.execute(stmt, 0).unwrap();

        let cols = drv.column_info(stmt).unwrap();
        let (mut defines, block) = build_define_slots(&cols, 10);
        let out = drv.fetch_block(stmt, &mut defines, block).unwrap();
        assert_eq!(out.rows_in_block, 1);
        assert!(out.no_more_data);
        let cell = defines[0].get_column(0);
        assert_eq!(&cell.data[..cell.str_size], b"7");
        assert_eq!(drv.row_count(stmt).unwrap(), 1);
    }

    #[test]
    fn unknown_select_errors() {
        let mut drv = MemoryDriver::new();
        let (stmt, _) = drv.prepare("SELECT x FROM missing").unwrap();
        let err = drv.execute(stmt, 0).unwrap_err();
        assert_eq!(err.code, 942);
    }

    #[test]
    fn break_flag_cancels_blocking_execute() {
        let mut drv =
            MemoryDriver::new().with_blocking("SELECT sleep FROM big_table");
        let (stmt, _) = drv.prepare("SELECT sleep FROM big_table").unwrap();
        let breaker = drv.breaker();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            breaker.break_call();
        });
        let err = drv.execute(stmt, 0).unwrap_err();
        assert!(err.is_cancel());
        handle.join().unwrap();
        drv.reset_after_break().unwrap();
        assert!(!drv.breaker().is_broken());
    }

    #[test]
    fn dml_opens_transaction() {
        let mut drv = MemoryDriver::new()
            .with_statement("UPDATE t SET a = 1", CannedStatement::dml(3));
        let (stmt, _) = drv.prepare("UPDATE t SET a = 1").unwrap();
        let out = drv.execute(stmt, 1).unwrap();
        assert_eq!(out.row_count, 3);
        assert!(drv.in_transaction().unwrap());
        drv.commit(false).unwrap();
        assert!(!drv.in_transaction().unwrap());
    }

    #[test]
    fn heuristic_commit_reports_code() {
        let mut drv = MemoryDriver::new().with_heuristic_outcome(24764);
        drv.set_xid(&Xid::parse("1:abc:x").unwrap()).unwrap();
        let err = drv.commit(false).unwrap_err();
        assert!(err.is_heuristically_completed());
        drv.trans_forget().unwrap();
        assert_eq!(drv.forgets, 1);
    }

    #[test]
    fn lob_round_trip() {
        let mut drv = MemoryDriver::new().with_statement(
            "SELECT doc FROM docs",
            CannedStatement::select_typed(
                vec![ColumnInfo {
                    name: "doc".into(),
                    col_type: ColumnType::Clob,
                    width: 4000,
                    precision: 0,
                    scale: 0,
                }],
                vec![vec![CannedValue::Clob("héllo".into())]],
            ),
        );
        let (stmt, _) = drv.prepare("SELECT doc FROM docs").unwrap();
        drv.execute(stmt, 0).unwrap();
        let cols = drv.column_info(stmt).unwrap();
        let (mut defines, block) = build_define_slots(&cols, 4);
        drv.fetch_block(stmt, &mut defines, block).unwrap();
        let lob = defines[0].get_column(0).lob.unwrap();
        assert_eq!(drv.lob_length(lob).unwrap(), 5); // characters
        let bytes = drv.lob_read(lob, 4 * 5 + 1, true).unwrap();
        assert_eq!(bytes, "héllo".as_bytes());
    }
}
