use tracing::{debug, info, warn};

use common::err::WResult;
use common::hash;
use common::string_util;
use common::time_util;
use driver::define::{build_define_slots, ColumnOutput};
use driver::error::DriverError;
use driver::types::{ApiVersion, ColumnType, SessionAttr, StatementKind};
use driver::SqlDriver;
use protocol::codes::response;
use protocol::eor::EorStatus;
use protocol::netstring::encode_frame;

use crate::stmt_cache::{StmtCacheEntry, StmtKey};

use super::WorkerChild;

impl<D: SqlDriver> WorkerChild<D> {
    /// PREPARE / PREPARE_V2: run the rewriter when sharding is on, then
    /// prepare (from cache when possible).
    pub(crate) fn op_prepare(&mut self, sql: &str, version: ApiVersion) -> WResult<()> {
        self.sql_rewritten = false;
        let mut effective = sql.to_string();
        if let Some(rw) = self.rewriter.as_mut() {
            let outcome = rw.rewrite(sql);
            debug!(
                "sql rewrite: rw={}, reason={}",
                outcome.rewritten,
                outcome.reason.event_suffix()
            );
            if outcome.rewritten {
                effective = outcome.sql.clone();
                self.sql_rewritten = true;
            }
        }
        if self.sql_rewritten {
            self.orig_query_hash = hash::sql_cal_hash(sql).to_string();
        }
        self.cur_query = effective.clone();
        self.prepare_statement(&effective, version)
    }

    /// Shared prepare path; also used by special queries.
    pub(crate) fn prepare_statement(&mut self, sql: &str, version: ApiVersion) -> WResult<()> {
        // a prepare may be the start of DML; be ready to roll back
        self.in_trans = true;
        self.cur_results = None;
        self.results_valid = false;

        let statement = if self.cfg.enable_query_replace_nl {
            string_util::normalize_sql(sql)
        } else {
            sql.to_string()
        };

        self.bind_slots.clear();
        self.out_slots.clear();

        if let Some(key) = self.cache.find(&statement, version) {
            debug!("cached statement: {}", statement);
            self.cur_stmt = Some(key);
        } else {
            match self.driver.prepare(&statement) {
                Ok((stmt_id, kind)) => {
                    debug!("preparing statement: {}", statement);
                    let entry = StmtCacheEntry::new(statement.clone(), version, stmt_id, kind);
                    if let Some(evicted) = self.cache.insert(entry) {
                        self.driver.free_statement(evicted.stmt);
                    }
                    self.cur_stmt = Some(StmtKey {
                        text: statement.clone(),
                        version,
                    });
                }
                Err(e) => {
                    self.sql_error(&e, &[])?;
                    return Ok(());
                }
            }
        }

        if let Some(key) = self.cur_stmt.clone() {
            if let Some(entry) = self.cache.get_mut(&key) {
                entry.last_used = time_util::now_secs();
                entry.exec_count += 1;
            }
        }

        for expired in self.cache.expire(false) {
            self.driver.free_statement(expired.stmt);
        }
        Ok(())
    }

    /// PREPARE_SPECIAL: a pre-declared read-only query with a TTL result
    /// cache.
    pub(crate) fn op_prepare_special(&mut self, query_id: u32) -> WResult<()> {
        let Some(idx) = self.special.get_or_create(query_id, &self.cfg) else {
            return self.internal_error(&format!(
                "Can't initialize cache entry for special query {}",
                query_id
            ));
        };

        if !self.special.get(idx).valid() {
            let sql = self.special.get(idx).sql.clone();
            self.prepare_statement(&sql, ApiVersion::V1)?;
            if self.cur_stmt.is_none() {
                // prepare already reported the failure
                return Ok(());
            }
            if !self.special.get(idx).enabled() {
                // caching off for this query: it behaves like any other
                return Ok(());
            }
            let kind = self.cur_kind();
            if !kind.map(StatementKind::is_select).unwrap_or(false) {
                return self.internal_error("preparing statement (cached): not a SELECT, bailing");
            }
            self.special.get_mut(idx).expire();
            self.results_valid = false;
            debug!("preparing statement (cached): results will be cached");
        } else {
            self.results_valid = true;
            debug!(
                "preparing statement (cached): {}",
                self.special.get(idx).sql
            );
        }

        self.cur_results = Some(idx);
        Ok(())
    }

    fn cur_kind(&mut self) -> Option<StatementKind> {
        let key = self.cur_stmt.clone()?;
        self.cache.get_mut(&key).map(|e| e.kind)
    }

    /// EXECUTE the current statement.
    pub(crate) fn op_execute(&mut self) -> WResult<()> {
        self.in_trans = true;

        // server-cached special query with live results: short-circuit
        if let Some(idx) = self.cur_results {
            if self.results_valid {
                debug!("execute (cached): skipping");
                let entry = self.special.get(idx);
                let cols = entry.num_columns.to_string();
                let rows = entry.num_rows.to_string();
                self.writer.add(response::VALUE, cols.as_bytes());
                self.writer.add(response::VALUE, rows.as_bytes());
                self.writer.flush_groups()?;
                return Ok(());
            }
        }

        self.last_exec_ok = false;
        let pre_existing_txn = self.is_in_transaction();

        self.query_hash = hash::sql_cal_hash(&self.cur_query).to_string();
        debug!("executing statement, sql hash {}", self.query_hash);
        if self.sql_rewritten {
            debug!(
                "statement was rewritten, original sql hash {}",
                self.orig_query_hash
            );
        }

        let bind_data = self.bind_data.clone();
        if let Err(e) = self
            .driver
            .set_session_attr(SessionAttr::ClientIdentifier, &bind_data)
        {
            debug!("failed to push bind data attribute: {}", e);
        }
        let scuttle = if self.scuttle_id.is_empty() {
            "-1".to_string()
        } else {
            self.scuttle_id.clone()
        };
        if let Err(e) = self.driver.set_session_attr(SessionAttr::ClientInfo, &scuttle) {
            debug!("failed to push scuttle attribute: {}", e);
        }

        let Some(key) = self.cur_stmt.clone() else {
            debug!("statement requested when none was prepared");
            let status = self.eor_status_for_txn();
            self.eor_with_frame(status, response::ERROR, b"");
            self.writer.flush_groups()?;
            self.scuttle_id.clear();
            return Ok(());
        };

        let (stmt_id, kind) = {
            let entry = self.cache.get_mut(&key).expect("current statement");
            (entry.stmt, entry.kind)
        };
        let is_dml = kind.is_dml();

        // DDL and CALL are not allowed inside a global transaction
        if self.in_global_txn
            && matches!(
                kind,
                StatementKind::Create
                    | StatementKind::Drop
                    | StatementKind::Alter
                    | StatementKind::Call
            )
        {
            warn!("cannot execute CREATE/DROP/ALTER in the middle of a global transaction");
            let status = self.eor_status_for_txn();
            self.eor_with_frame(status, response::ERROR, b"");
            self.writer.flush_groups()?;
            self.scuttle_id.clear();
            return Ok(());
        }

        let iterations = if kind.is_select() {
            0
        } else {
            let mut iters = 1u32;
            if let Some(first) = self.bind_slots.first() {
                if first.row_count() > 1 {
                    iters = first.row_count() as u32;
                    for slot in &self.bind_slots[1..] {
                        if slot.row_count() as u32 != iters {
                            return self
                                .internal_error("Array bind length is different among columns.");
                        }
                    }
                }
            }
            iters
        };

        let exec = self.run_blocking(|d| d.execute(stmt_id, iterations));
        let outcome = match exec {
            Ok(outcome) => {
                if let Some(w) = &outcome.warning {
                    // success with info: log and move on
                    warn!("execute returned success with info: {}", w);
                }
                outcome
            }
            Err(e) => {
                let offsets = if iterations > 1 {
                    self.driver.batch_errors(stmt_id)
                } else {
                    Vec::new()
                };
                self.sql_error(&e, &offsets)?;
                self.scuttle_id.clear();
                return Ok(());
            }
        };

        // piecewise LOB binds upload their payload after execute
        let lob_writes: Vec<(String, Vec<u8>)> = self
            .bind_slots
            .iter()
            .filter(|s| s.data_type.is_piecewise_lob())
            .map(|s| {
                (
                    s.name.clone(),
                    s.rows.first().cloned().flatten().unwrap_or_default(),
                )
            })
            .collect();
        for (name, value) in lob_writes {
            if let Err(e) = self.driver.lob_write(stmt_id, &name, &value) {
                self.sql_error(&e, &[])?;
                self.scuttle_id.clear();
                return Ok(());
            }
        }

        let mut rows = outcome.row_count;
        let mut num_cols = 0u32;

        if kind.is_select() {
            let discovered = {
                let entry = self.cache.get_mut(&key).expect("current statement");
                entry.columns.is_none()
            };
            if discovered {
                match self.driver.column_info(stmt_id) {
                    Ok(cols) => {
                        let has_datetime =
                            cols.iter().any(|c| c.col_type.is_datetime_like());
                        let entry = self.cache.get_mut(&key).expect("current statement");
                        entry.has_datetime |= has_datetime;
                        for (i, c) in cols.iter().enumerate() {
                            debug!(
                                "column name[{}] is {}, type is {:?}, width is {}",
                                i, c.name, c.col_type, c.width
                            );
                        }
                        entry.columns = Some(cols);
                    }
                    Err(e) => {
                        self.sql_error(&e, &[])?;
                        self.scuttle_id.clear();
                        return Ok(());
                    }
                }
            }
            let entry = self.cache.get_mut(&key).expect("current statement");
            num_cols = entry.columns.as_ref().map(|c| c.len() as u32).unwrap_or(0);
            rows = 0; // nothing fetched yet
        } else if is_dml {
            let verb = match kind {
                StatementKind::Update => "updated",
                StatementKind::Insert => "created",
                StatementKind::Delete => "deleted",
                StatementKind::Merge => "merged",
                _ => "processed",
            };
            debug!("{} row(s) {}", rows, verb);
            if !self.has_real_dml {
                self.has_real_dml = rows > 0;
            }
        } else {
            debug!("execution completed");
        }

        let terminal_group = (is_dml
            || kind.is_plsql()
            || kind == StatementKind::Rollback
            || kind == StatementKind::Commit)
            && self.out_slots.is_empty();

        if terminal_group {
            // cols and rows ride inside the EOR payload as one envelope
            let mut inner = Vec::new();
            encode_frame(&mut inner, response::VALUE, num_cols.to_string().as_bytes());
            encode_frame(&mut inner, response::VALUE, rows.to_string().as_bytes());
            let mut envelope = Vec::new();
            encode_frame(&mut envelope, 0, &inner);
            let status = self.eor_status_for_txn();
            self.eor(status, envelope);
        } else {
            self.writer
                .add(response::VALUE, num_cols.to_string().as_bytes());
            self.writer.add(response::VALUE, rows.to_string().as_bytes());
        }
        self.writer.flush_groups()?;

        if let Some(idx) = self.cur_results {
            let special = self.special.get_mut(idx);
            special.num_columns = num_cols;
            special.num_rows = rows as u32;
        }

        if !pre_existing_txn && kind == StatementKind::Select && self.is_in_transaction() {
            debug!("read-consistent transaction opened by the driver");
        }

        self.scuttle_id.clear();

        if is_dml || kind.is_plsql() {
            let rc = self.return_out_bind_vars(stmt_id, kind);
            self.last_exec_ok = rc.is_ok();
            if !kind.is_select() {
                self.cur_stmt = None;
            }
            return rc;
        }

        self.last_exec_ok = true;
        if !kind.is_select() {
            self.cur_stmt = None;
        }
        Ok(())
    }

    /// Sends OUT placeholder data back to the client inside the EOR.
    fn return_out_bind_vars(&mut self, stmt_id: driver::StmtId, kind: StatementKind) -> WResult<()> {
        if self.out_slots.is_empty() {
            return Ok(());
        }

        let mut slots = std::mem::take(&mut self.out_slots);
        if let Err(e) = self.driver.read_out_binds(stmt_id, &mut slots) {
            self.out_slots = slots;
            self.sql_error(&e, &[])?;
            return Ok(());
        }

        // PL/SQL blocks never run the out callback; they return one row
        if kind.is_plsql() {
            for slot in &mut slots {
                if slot.rows_returned == 0 {
                    slot.rows_returned = 1;
                }
            }
        }

        let mut num_rows = slots.first().map(|s| s.rows_returned).unwrap_or(0);
        if num_rows > driver::MAX_DYNAMIC_BIND_ROWS {
            info!("OUT bind var returning more than 1 row, not supported");
            num_rows = driver::MAX_DYNAMIC_BIND_ROWS;
        }

        let mut inner = Vec::new();
        encode_frame(&mut inner, response::VALUE, num_rows.to_string().as_bytes());
        for row in 0..num_rows {
            for slot in &slots {
                match slot.value(row) {
                    Some(v) => {
                        encode_frame(&mut inner, response::VALUE, v);
                        debug!("out bind [{}]: {} bytes", slot.name, v.len());
                    }
                    None => {
                        encode_frame(
                            &mut inner,
                            response::VALUE,
                            self.cfg.null_value.as_bytes(),
                        );
                        debug!("out bind [{}]: NULL", slot.name);
                    }
                }
            }
        }
        let mut envelope = Vec::new();
        encode_frame(&mut envelope, 0, &inner);
        let status = self.eor_status_for_txn();
        self.eor(status, envelope);
        self.writer.flush_groups()?;

        self.out_slots = slots;
        Ok(())
    }

    /// FETCH: stream rows in server-sized blocks; 0 means everything.
    pub(crate) fn op_fetch(&mut self, count: u64) -> WResult<()> {
        self.in_trans = true;

        // special query served from memory
        if let Some(idx) = self.cur_results {
            if self.results_valid {
                if count != 0 {
                    return self.internal_error(
                        "fetch (cached): block fetching not supported with special queries",
                    );
                }
                let values = self.special.get(idx).values.clone();
                for v in &values {
                    self.writer.add(response::VALUE, v);
                }
                let status = self.eor_status_for_txn();
                self.eor_with_frame(status, response::NO_MORE_DATA, b"");
                self.writer.flush_groups()?;
                debug!("fetch (cached): served {} values", values.len());
                return Ok(());
            }
        }

        let Some(key) = self.cur_stmt.clone() else {
            if self.last_exec_ok {
                return self.internal_error("fetch requested but no statement exists");
            }
            let status = self.eor_status_for_txn();
            self.eor(status, Vec::new());
            self.writer.flush_groups()?;
            return Ok(());
        };

        let mut remaining = if count == 0 { u64::MAX } else { count };
        let block_limit = self.cfg.max_fetch_block_size as u64;

        // make sure defines exist and are sized for this statement
        {
            let entry = self.cache.get_mut(&key).expect("current statement");
            if entry.defines.is_none() {
                let Some(columns) = entry.columns.as_ref() else {
                    return self.internal_error("fetch requested before execute");
                };
                let (slots, block_rows) =
                    build_define_slots(columns, block_limit as usize);
                entry.defines = Some(slots);
                entry.block_rows = block_rows;
            }
        }

        let version = {
            let entry = self.cache.get_mut(&key).expect("current statement");
            entry.version
        };
        let null_value = self.cfg.null_value.clone();
        let cur_results = self.cur_results;

        let mut no_more_data = false;
        let mut fetch_err: Option<DriverError> = None;
        let mut total_fetched = 0u64;

        while remaining > 0 && !no_more_data {
            let entry = self.cache.get_mut(&key).expect("current statement");
            let block_rows = (remaining.min(block_limit) as usize).min(entry.block_rows);
            let stmt_id = entry.stmt;
            let defines = entry.defines.as_mut().expect("define slots");
            for slot in defines.iter_mut() {
                slot.clear_indicators();
            }

            self.watch.arm(self.reader.count());
            let outcome = self.driver.fetch_block(stmt_id, defines, block_rows);
            self.watch.disarm();

            let outcome = match outcome {
                Ok(o) => o,
                Err(e) => {
                    fetch_err = Some(e);
                    break;
                }
            };
            no_more_data = outcome.no_more_data;
            total_fetched = outcome.total_rows;

            // render and queue this block before fetching the next one,
            // so the writer buffer stays bounded
            for row in 0..outcome.rows_in_block {
                let ncols = defines.len();
                for col in 0..ncols {
                    let output = defines[col].get_column(row);
                    let rendered =
                        match render_value(&mut self.driver, &output, version, &null_value) {
                            Ok(v) => v,
                            Err(e) => {
                                fetch_err = Some(e);
                                break;
                            }
                        };
                    self.writer.add(response::VALUE, &rendered);
                    if let Some(idx) = cur_results {
                        self.special.get_mut(idx).add_result(&rendered);
                    }
                }
                if fetch_err.is_some() {
                    break;
                }
            }
            if fetch_err.is_some() {
                break;
            }

            remaining = remaining.saturating_sub(block_rows as u64);

            if !no_more_data && remaining > 0 {
                self.writer.flush_groups()?;
            }
        }

        if let Some(e) = fetch_err {
            self.sql_error(&e, &[])?;
            return Ok(());
        }

        debug!("fetched {} rows (sql hash {})", total_fetched, self.query_hash);

        if no_more_data {
            if let Some(idx) = cur_results {
                self.special.get_mut(idx).validate();
            }
            let status = self.eor_status_for_txn();
            self.eor_with_frame(status, response::NO_MORE_DATA, b"");
            self.cur_stmt = None;
        } else {
            let status = if self.is_in_transaction() {
                EorStatus::InCursorInTransaction
            } else {
                EorStatus::InCursorNotInTransaction
            };
            self.eor_with_frame(status, response::OK, b"");
        }
        self.writer.flush_groups()?;
        Ok(())
    }

    /// ROWS: rows processed so far for the current statement.
    pub(crate) fn op_row_count(&mut self) -> WResult<()> {
        let Some(key) = self.cur_stmt.clone() else {
            debug!("row count requested when no statement was prepared");
            return Ok(());
        };
        let stmt_id = self.cache.get_mut(&key).expect("current statement").stmt;
        match self.driver.row_count(stmt_id) {
            Ok(rows) => {
                self.writer
                    .write(response::VALUE, rows.to_string().as_bytes())?;
                Ok(())
            }
            Err(e) => self.sql_error(&e, &[]),
        }
    }

    /// COLS: column count plus names.
    pub(crate) fn op_col_names(&mut self) -> WResult<()> {
        let Some(columns) = self.cur_columns() else {
            return Ok(());
        };
        self.writer
            .add(response::VALUE, columns.len().to_string().as_bytes());
        for col in &columns {
            self.writer.add(response::VALUE, col.name.as_bytes());
        }
        self.writer.flush_groups()?;
        Ok(())
    }

    /// COLS_INFO: count, then name/type/width/precision/scale per column.
    pub(crate) fn op_col_info(&mut self) -> WResult<()> {
        let Some(columns) = self.cur_columns() else {
            return Ok(());
        };
        self.writer
            .add(response::VALUE, columns.len().to_string().as_bytes());
        for col in &columns {
            self.writer.add(response::VALUE, col.name.as_bytes());
            self.writer.add(
                response::VALUE,
                u16::from(col.col_type).to_string().as_bytes(),
            );
            self.writer
                .add(response::VALUE, col.width.to_string().as_bytes());
            self.writer
                .add(response::VALUE, col.precision.to_string().as_bytes());
            self.writer
                .add(response::VALUE, col.scale.to_string().as_bytes());
        }
        self.writer.flush_groups()?;
        Ok(())
    }

    fn cur_columns(&mut self) -> Option<Vec<driver::types::ColumnInfo>> {
        let key = self.cur_stmt.clone()?;
        let entry = self.cache.get_mut(&key)?;
        entry.columns.clone()
    }
}

/// Renders one fetched cell to its wire representation.
fn render_value<D: SqlDriver>(
    driver: &mut D,
    output: &ColumnOutput<'_>,
    version: ApiVersion,
    null_value: &str,
) -> Result<Vec<u8>, DriverError> {
    if output.is_null {
        return Ok(null_value.as_bytes().to_vec());
    }
    match output.col_type {
        ColumnType::Raw => {
            // raw buffers carry a native 4-byte length prefix
            let end = (4 + output.str_size).min(output.data.len());
            Ok(output.data[4.min(output.data.len())..end].to_vec())
        }
        ColumnType::Timestamp | ColumnType::TimestampTz => {
            let dt = output
                .datetime
                .ok_or_else(|| DriverError::internal("missing datetime descriptor"))?;
            Ok(driver.datetime_text(dt)?.into_bytes())
        }
        ColumnType::Clob => {
            let lob = output
                .lob
                .ok_or_else(|| DriverError::internal("missing LOB locator"))?;
            let char_len = driver.lob_length(lob)?;
            if char_len == 0 {
                // an empty LOB is an empty value, not NULL
                return Ok(Vec::new());
            }
            // worst case UTF-8 expansion
            let buf_size = (char_len as usize) * 4 + 1;
            driver.lob_read(lob, buf_size, true)
        }
        ColumnType::Blob => {
            let lob = output
                .lob
                .ok_or_else(|| DriverError::internal("missing LOB locator"))?;
            let len = driver.lob_length(lob)?;
            if len == 0 {
                return Ok(Vec::new());
            }
            driver.lob_read(lob, len as usize, false)
        }
        _ => {
            if version == ApiVersion::V2 {
                Ok(output.data[..output.str_size.min(output.data.len())].to_vec())
            } else {
                // v1 truncates at the first NUL
                let end = output
                    .data
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(output.data.len());
                Ok(output.data[..end].to_vec())
            }
        }
    }
}
