use tracing::{debug, warn};

use common::err::{WResult, WorkerError};
use common::string_util;
use driver::bind::{BindSlot, OutBindSlot};
use driver::types::DataType;
use driver::{SqlDriver, MAX_ARRAY_DATA_SIZE, MAX_ARRAY_ROW_NUM, MAX_BIND_NAME_LEN};
use protocol::codes::{response, ClientCommand};

use crate::rewrite;

use super::WorkerChild;

/// Cap on the comma-joined bind data pushed into the session monitoring
/// attribute.
const MAX_SESSION_BIND_DATA: usize = 256;

impl<D: SqlDriver> WorkerChild<D> {
    /// BIND_NAME and its follow-up frames: optional BIND_TYPE, optional
    /// BIND_NUM + BIND_VALUE_MAX_SIZE, then `bind_num` BIND_VALUE
    /// frames. Sequencing violations and array overflows drop the
    /// connection.
    pub(crate) fn op_bind_name(&mut self, payload: &[u8], marked_down: bool) -> WResult<()> {
        let name = String::from_utf8_lossy(payload).to_string();

        let mut data_type = DataType::String;
        let mut bind_num: usize = 1;
        let mut max_size: usize = 0;

        let mut buf = Vec::new();
        let mut code = self.reader.read(&mut buf)?;

        if code == u32::from(ClientCommand::BindType) {
            let raw: u32 = String::from_utf8_lossy(&buf).trim().parse().unwrap_or(0);
            data_type = DataType::try_from(raw).unwrap_or(DataType::String);
            code = self.reader.read(&mut buf)?;
        }

        if code == u32::from(ClientCommand::BindNum) {
            bind_num = String::from_utf8_lossy(&buf).trim().parse().unwrap_or(1);
            if bind_num > MAX_ARRAY_ROW_NUM {
                let msg = format!(
                    "Can't array bind {} rows (>{}) at one time!",
                    bind_num, MAX_ARRAY_ROW_NUM
                );
                self.internal_error(&msg)?;
                return Err(WorkerError::Internal(msg));
            }
            code = self.reader.read(&mut buf)?;
            if code != u32::from(ClientCommand::BindValueMaxSize) {
                let msg = "Commands out of sync BIND_VALUE_MAX_SIZE!".to_string();
                self.internal_error(&msg)?;
                return Err(WorkerError::OutOfSync(msg));
            }
            max_size = String::from_utf8_lossy(&buf).trim().parse().unwrap_or(0);
            if bind_num > 1 && max_size > MAX_ARRAY_DATA_SIZE {
                let msg = format!(
                    "Size in array bind {} can't be more than {} bytes!",
                    max_size, MAX_ARRAY_DATA_SIZE
                );
                self.internal_error(&msg)?;
                return Err(WorkerError::Internal(msg));
            }
            code = self.reader.read(&mut buf)?;
        }

        let mut rows: Vec<Option<Vec<u8>>> = Vec::with_capacity(bind_num);
        loop {
            if code != u32::from(ClientCommand::BindValue) {
                let msg = "Commands out of sync BIND_VALUE!".to_string();
                self.internal_error(&msg)?;
                return Err(WorkerError::OutOfSync(msg));
            }
            if bind_num > 1 && buf.len() > max_size {
                let msg = format!(
                    "Value length {} is larger than max length {}!",
                    buf.len(),
                    max_size
                );
                self.internal_error(&msg)?;
                return Err(WorkerError::Internal(msg));
            }
            rows.push(Some(buf.clone()));
            if rows.len() == bind_num {
                break;
            }
            code = self.reader.read(&mut buf)?;
        }
        if bind_num == 1 {
            max_size = rows[0].as_ref().map(Vec::len).unwrap_or(0);
        }

        if marked_down {
            return Ok(());
        }

        let first_value = rows.first().cloned().flatten();
        if !self.do_bind(&name, data_type, rows, max_size)? {
            return Ok(());
        }

        self.intercept_shard_bind(&name, first_value.as_deref())
    }

    /// Performs the actual driver bind. Returns false when the bind was
    /// rejected but the session continues.
    fn do_bind(
        &mut self,
        name: &str,
        data_type: DataType,
        rows: Vec<Option<Vec<u8>>>,
        max_size: usize,
    ) -> WResult<bool> {
        // might need to commit/rollback later
        self.in_trans = true;

        if self.cur_results.is_some() {
            self.internal_error("binding: not supported with special queries")?;
            return Ok(false);
        }
        let Some(key) = self.cur_stmt.clone() else {
            debug!("bind requested when no statement was prepared");
            return Ok(false);
        };

        if name.len() > MAX_BIND_NAME_LEN {
            warn!("bind name exceeds maximum length: '{}'", name);
            let msg = format!("bind name '{}' exceeds maximum length", name);
            self.writer.write(response::ERROR, msg.as_bytes())?;
            self.cur_stmt = None;
            return Ok(false);
        }

        if let Some(first) = rows.first().and_then(|r| r.as_deref()) {
            let shown = string_util::hex_escape(&first[..first.len().min(1021)]);
            debug!("binding [{}]:[{}]", name, shown);
        } else {
            debug!("binding [{}]:NULL", name);
        }

        let mut slot = BindSlot::array(name, data_type, rows, max_size);
        slot.normalize_temporal_nulls();

        let stmt_id = {
            let entry = self.cache.get_mut(&key).expect("current statement");
            if data_type.is_temporal() {
                entry.has_datetime = true;
            }
            entry.stmt
        };

        if let Err(e) = self.driver.bind(stmt_id, &slot) {
            self.sql_error(&e, &[])?;
            return Ok(false);
        }

        // string binds feed the session monitoring attribute
        if data_type == DataType::String {
            if let Some(Some(v)) = slot.rows.first() {
                let addition = String::from_utf8_lossy(v).to_string();
                if self.bind_data.is_empty() {
                    if addition.len() <= MAX_SESSION_BIND_DATA {
                        self.bind_data.push_str(&addition);
                    } else {
                        self.bind_data.push(' ');
                    }
                } else if self.bind_data.len() + addition.len() + 1 <= MAX_SESSION_BIND_DATA {
                    self.bind_data.push(',');
                    self.bind_data.push_str(&addition);
                }
            }
        }

        self.bind_slots.push(slot);
        Ok(true)
    }

    /// A bind of the shard key also binds the computed scuttle id; an
    /// explicit SHARD_KEY hint sent earlier wins over the bind value.
    fn intercept_shard_bind(&mut self, name: &str, value: Option<&[u8]>) -> WResult<()> {
        let bare = name.strip_prefix(':').unwrap_or(name);

        if self.sql_rewritten {
            let sk = self.cfg.shard_key_name.clone();
            let bare_bytes = bare.as_bytes();
            let matches_key = bare_bytes.len() >= sk.len()
                && bare_bytes[..sk.len()].eq_ignore_ascii_case(sk.as_bytes())
                && (bare_bytes.len() == sk.len() || &bare_bytes[sk.len()..] == b"_0");
            if !matches_key {
                return Ok(());
            }

            let scuttle_name = self.cfg.scuttle_attr_name.clone();
            match value.filter(|v| !v.is_empty()) {
                None => {
                    // a NULL shard key binds a NULL scuttle id to mirror it
                    debug!("scuttle id bound NULL to mirror null shard key value");
                    self.do_bind(&scuttle_name, DataType::String, vec![None], 0)?;
                }
                Some(v) => {
                    let text = String::from_utf8_lossy(v).to_string();
                    let scuttle = if self.cfg.shard_key_value_type_string {
                        rewrite::shard_key::compute_scuttle_id_str(
                            &text,
                            self.sharding_algo,
                            self.cfg.max_scuttle_buckets,
                        )
                    } else {
                        let v: u64 = text.trim().parse().unwrap_or(0);
                        rewrite::compute_scuttle_id(
                            v,
                            self.sharding_algo,
                            self.cfg.max_scuttle_buckets,
                        )
                    };
                    let scuttle_text = scuttle.to_string();
                    if self.scuttle_id.is_empty() {
                        self.scuttle_id = scuttle_text.clone();
                        debug!("scuttle id {} from sql rewrite", self.scuttle_id);
                    }
                    let bytes = scuttle_text.into_bytes();
                    let len = bytes.len();
                    self.do_bind(&scuttle_name, DataType::String, vec![Some(bytes)], len)?;
                }
            }
        } else if self.cfg.enable_sharding && self.scuttle_id.is_empty() {
            // without a rewrite, a client-supplied scuttle bind is captured
            if bare.eq_ignore_ascii_case(&self.cfg.scuttle_attr_name) {
                if let Some(v) = value {
                    self.scuttle_id = String::from_utf8_lossy(v).to_string();
                    debug!("scuttle id {} from sql binding", self.scuttle_id);
                }
            }
        }
        Ok(())
    }

    /// BIND_OUT_NAME: registers an OUT placeholder for a RETURNING
    /// clause; one row of data comes back after execute.
    pub(crate) fn op_bind_out(&mut self, name: &str) -> WResult<()> {
        self.in_trans = true;

        if self.cur_results.is_some() {
            return self.internal_error("binding out: not supported with special queries");
        }
        let Some(key) = self.cur_stmt.clone() else {
            debug!("out bind requested when no statement was prepared");
            return Ok(());
        };

        if name.len() > MAX_BIND_NAME_LEN {
            warn!("bind name exceeds maximum length: '{}'", name);
            let msg = format!("bind name '{}' exceeds maximum length", name);
            self.writer.write(response::ERROR, msg.as_bytes())?;
            self.cur_stmt = None;
            return Ok(());
        }

        debug!("binding out [{}]", name);

        let slot = OutBindSlot::new(
            name,
            DataType::String,
            self.out_slots.len(),
            self.cfg.max_out_bind_var_size,
        );
        let stmt_id = self.cache.get_mut(&key).expect("current statement").stmt;
        if let Err(e) = self.driver.bind_out(stmt_id, &slot) {
            self.sql_error(&e, &[])?;
            return Ok(());
        }
        self.out_slots.push(slot);
        Ok(())
    }
}
