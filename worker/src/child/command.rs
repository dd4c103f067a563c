use tracing::{debug, warn};

use common::err::WResult;
use driver::types::{ApiVersion, SessionAttr, TransRole};
use driver::SqlDriver;
use protocol::codes::{response, server, ClientCommand};
use protocol::eor::EorStatus;

use crate::markdown::{self, MarkdownScope};
use crate::rewrite;

use super::WorkerChild;

impl<D: SqlDriver> WorkerChild<D> {
    /// Dispatches one inbound frame. An `Err` drops the connection;
    /// recoverable problems are reported in-band and return `Ok`.
    pub(crate) fn handle_command(&mut self, cmd: u32, payload: &mut Vec<u8>) -> WResult<()> {
        let Ok(command) = ClientCommand::try_from(cmd) else {
            return self.unexpected_command(cmd, payload);
        };

        // host/SQL/table markdowns gate everything that could reach the
        // database; commit adds its own scope
        let mut marked_down = match command {
            c if c.is_db_bound() => {
                let mut md = self.check_markdown(MarkdownScope::Host, "");
                let query = self.cur_query.clone();
                md |= self.check_markdown(MarkdownScope::Sql, &query);
                md |= self.check_markdown(MarkdownScope::Table, &query);
                if c == ClientCommand::Commit {
                    md |= self.check_markdown(MarkdownScope::Commit, "");
                }
                md
            }
            _ => false,
        };

        match command {
            ClientCommand::Prepare | ClientCommand::PrepareV2 => {
                debug!("worker rq_id = {}", self.reader.count());
                self.bind_data.clear();
                self.scuttle_id.clear();

                let sql = String::from_utf8_lossy(payload).to_string();
                self.cur_query = sql.clone();
                marked_down = self.check_markdown(MarkdownScope::Host, "")
                    | self.check_markdown(MarkdownScope::Sql, &sql)
                    | self.check_markdown(MarkdownScope::Table, &sql);
                if marked_down {
                    // skip the operation, pretend we are happy
                    return Ok(());
                }

                let version = if command == ClientCommand::PrepareV2 {
                    ApiVersion::V2
                } else {
                    ApiVersion::V1
                };
                self.op_prepare(&sql, version)
            }
            ClientCommand::PrepareSpecial => {
                debug!("worker rq_id = {}", self.reader.count());
                self.bind_data.clear();
                self.cur_query = String::from_utf8_lossy(payload).to_string();
                if marked_down {
                    return Ok(());
                }
                let id: u32 = String::from_utf8_lossy(payload).trim().parse().unwrap_or(0);
                self.op_prepare_special(id)
            }
            ClientCommand::ShardKey => {
                self.op_shard_key_hint(&String::from_utf8_lossy(payload));
                Ok(())
            }
            ClientCommand::BindName => {
                let name_payload = payload.clone();
                self.op_bind_name(&name_payload, marked_down)
            }
            ClientCommand::BindOutName => {
                if marked_down {
                    return Ok(());
                }
                let name = String::from_utf8_lossy(payload).to_string();
                self.op_bind_out(&name)
            }
            ClientCommand::Execute => {
                if self.keyword_markdown() || marked_down {
                    return self.markdown_reply("Execute");
                }
                let rc = self.op_execute();
                self.bump_request_count();
                rc
            }
            ClientCommand::Rows => {
                if marked_down {
                    return self.markdown_reply("Rows");
                }
                self.op_row_count()
            }
            ClientCommand::Cols => {
                if marked_down {
                    return self.markdown_reply("Cols");
                }
                self.op_col_names()
            }
            ClientCommand::ColsInfo => {
                if marked_down {
                    return self.markdown_reply("Cols");
                }
                self.op_col_info()
            }
            ClientCommand::Fetch => {
                if marked_down {
                    return self.markdown_reply("Fetch");
                }
                let count = String::from_utf8_lossy(payload).trim().parse().unwrap_or(0);
                self.op_fetch(count)
            }
            ClientCommand::Commit => {
                debug!("worker rq_id = {}", self.reader.count());
                if marked_down {
                    warn!("markdown prevented commit");
                    return self.markdown_reply("Commit");
                }
                let xid = String::from_utf8_lossy(payload).to_string();
                if self.op_commit(&xid)? {
                    self.eor_with_frame(EorStatus::Free, response::OK, b"");
                    self.writer.flush_groups()?;
                }
                self.cur_stmt = None;
                Ok(())
            }
            ClientCommand::Rollback => {
                debug!("worker rq_id = {}", self.reader.count());
                if marked_down {
                    return self.markdown_reply("Rollback");
                }
                let xid = String::from_utf8_lossy(payload).to_string();
                if self.op_rollback(&xid)? {
                    self.eor_with_frame(EorStatus::Free, response::OK, b"");
                    self.writer.flush_groups()?;
                }
                self.cur_stmt = None;
                Ok(())
            }
            ClientCommand::TransStart => {
                marked_down |= self.check_markdown(MarkdownScope::Trans, "");
                let xid = String::from_utf8_lossy(payload).to_string();
                let (timeout, role) = self.read_trans_options()?;
                if marked_down {
                    warn!("trans-start attempted, markdown blocking");
                    return self.markdown_reply("TransStart");
                }
                self.op_trans_start(&xid, timeout, role)
            }
            ClientCommand::TransPrepare => {
                if marked_down {
                    return self.markdown_reply("TransPrepare");
                }
                self.op_trans_prepare()
            }
            ClientCommand::TransTimeout | ClientCommand::TransRole => {
                // options normally arrive pipelined right after
                // TRANS_START; a stray frame is tolerated
                debug!(
                    "stray {} frame: {}",
                    if command == ClientCommand::TransTimeout {
                        "TRANS_TIMEOUT"
                    } else {
                        "TRANS_ROLE"
                    },
                    String::from_utf8_lossy(payload)
                );
                Ok(())
            }
            ClientCommand::BindValue
            | ClientCommand::BindType
            | ClientCommand::BindNum
            | ClientCommand::BindValueMaxSize => {
                self.internal_error("Commands out of sync: bind frame without BIND_NAME")
            }
            ClientCommand::ClientInfo => {
                if marked_down {
                    return self.markdown_reply("ClientInfo");
                }
                let info = self.pool_info();
                self.writer.add(response::OK, info.as_bytes());
                let status = self.eor_status_for_txn();
                self.eor(status, Vec::new());
                self.writer.flush_groups()?;
                self.capture_client_info(payload);
                if self.cur_stmt.is_some() {
                    debug!("CLIENT_INFO_IN_TXN");
                }
                Ok(())
            }
            ClientCommand::IntClientInfo => {
                if marked_down {
                    return self.markdown_reply("ClientInfo");
                }
                let info = self.pool_info();
                self.writer.write(server::INT_INFO, info.as_bytes())?;
                self.capture_client_info(payload);
                Ok(())
            }
            ClientCommand::ClientInfoHandshake => {
                let info = self.pool_info();
                self.writer.write(server::INFO, info.as_bytes())?;
                Ok(())
            }
            ClientCommand::Backtrace => {
                debug!("backtrace: {}", String::from_utf8_lossy(payload));
                Ok(())
            }
            ClientCommand::SqlStmtCaching => {
                // per-session caching toggle: acknowledged no-op
                self.writer.write(response::OK, b"")?;
                Ok(())
            }
            ClientCommand::CalCorrelationId => {
                self.op_correlation_id(payload);
                Ok(())
            }
            ClientCommand::Ping => {
                let status = self.eor_status_for_txn();
                self.eor_with_frame(status, server::ALIVE, b"");
                self.writer.flush_groups()?;
                if self.cur_stmt.is_some() {
                    debug!("PING_IN_TXN");
                }
                Ok(())
            }
            ClientCommand::ProtocolVersion => {
                debug!("protocol version {}", String::from_utf8_lossy(payload));
                Ok(())
            }
        }
    }

    pub(crate) fn check_markdown(&self, scope: MarkdownScope, src: &str) -> bool {
        markdown::check_markdowns(
            &self.markdown_rules,
            scope,
            src,
            &self.params.host_name,
            &self.params.mark_host_name,
            &self.params.module_info,
        )
    }

    /// The tabular keyword rules, applied to the current statement at
    /// execute time.
    fn keyword_markdown(&mut self) -> bool {
        let query = self.cur_query.clone();
        self.mklist
            .do_markdown(&self.params.host_name, &self.params.mark_host_name, &query)
    }

    /// Blocks the command: MARKDOWN goes back, the driver is skipped.
    pub(crate) fn markdown_reply(&mut self, what: &str) -> WResult<()> {
        warn!("markdown prevented operation of {}: {}", what, self.cur_query);
        self.writer.write(response::MARKDOWN, b"")?;
        Ok(())
    }

    /// Optional TRANS_TIMEOUT / TRANS_ROLE frames pipelined right after
    /// TRANS_START.
    fn read_trans_options(&mut self) -> WResult<(u32, TransRole)> {
        let mut timeout = self.cfg.default_trans_timeout;
        // participants call trans-start; the commit point site does not
        let mut role = TransRole::Participant;

        let mut buf = Vec::new();
        while let Some(code) = self.reader.peek_buffered_code() {
            match ClientCommand::try_from(code) {
                Ok(ClientCommand::TransTimeout) => {
                    self.reader.read(&mut buf)?;
                    let text = String::from_utf8_lossy(&buf);
                    timeout = text.trim().parse().unwrap_or(timeout);
                }
                Ok(ClientCommand::TransRole) => {
                    self.reader.read(&mut buf)?;
                    let raw: u32 = String::from_utf8_lossy(&buf).trim().parse().unwrap_or(0);
                    role = TransRole::try_from(raw).unwrap_or(TransRole::Participant);
                }
                _ => break,
            }
        }
        Ok((timeout, role))
    }

    fn pool_info(&self) -> String {
        format!(
            "worker={} pid={} db={}",
            self.params.module_info,
            std::process::id(),
            self.params.host_name
        )
    }

    fn capture_client_info(&mut self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).to_string();
        debug!("client info: {}", text);
        if self.client_info.is_empty() {
            self.client_info = text;
            const CLIENT_NAME_PREFIX: &str = "corr_id_";
            if let Some(idx) = self.client_info.rfind(CLIENT_NAME_PREFIX) {
                self.client_name = self.client_info[idx + CLIENT_NAME_PREFIX.len()..]
                    .trim()
                    .to_string();
            }
        }
    }

    /// Correlation-id frames update telemetry and the session action
    /// attribute without consuming a request slot.
    fn op_correlation_id(&mut self, payload: &[u8]) {
        let raw = String::from_utf8_lossy(payload).to_string();
        let mut corr = raw.split('&').next().unwrap_or("").to_string();
        if corr.is_empty() {
            corr = raw.clone();
        }
        // the value may arrive as `corr_id=<value>`
        if let Some(eq) = corr.find('=') {
            corr = corr[eq + 1..].to_string();
        }
        self.corr_id = corr;
        debug!("set correlation id = {}", self.corr_id);
        if let Err(e) = self
            .driver
            .set_session_attr(SessionAttr::Action, &self.corr_id.clone())
        {
            warn!("failed to set the action attribute: {}", e);
        }

        if self.cur_stmt.is_some() {
            debug!("CORRID_IN_TXN");
        } else if !self.is_in_transaction() {
            // no response goes out for this command
            self.set_dedicated(false);
        }
    }

    /// A SHARD_KEY hint pins the scuttle id before the binds arrive.
    fn op_shard_key_hint(&mut self, hint: &str) {
        if !self.cfg.enable_sharding || !self.scuttle_id.is_empty() {
            return;
        }
        let Some((name, values)) = rewrite::parse_shard_key(hint) else {
            return;
        };
        // hints may name the key in bind syntax (`:party_id_0`)
        let name = rewrite::process_bind_name(&name);
        if values.is_empty() || !name.eq_ignore_ascii_case(&self.cfg.shard_key_name) {
            return;
        }
        let scuttle = if self.cfg.shard_key_value_type_string {
            rewrite::shard_key::compute_scuttle_id_str(
                &values[0],
                self.sharding_algo,
                self.cfg.max_scuttle_buckets,
            )
        } else {
            let v: u64 = values[0].trim().parse().unwrap_or(0);
            rewrite::compute_scuttle_id(v, self.sharding_algo, self.cfg.max_scuttle_buckets)
        };
        self.scuttle_id = scuttle.to_string();
        debug!("{} SHARD_KEY, scuttle id {}", hint, self.scuttle_id);
    }
}
