pub mod binding;
pub mod command;
pub mod statement;
pub mod transaction;

use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use common::config::{OpsConfig, WorkerConfig};
use common::err::WResult;
use common::time_util;
use driver::bind::{BindSlot, OutBindSlot};
use driver::types::TransRole;
use driver::{DriverError, SqlDriver};
use protocol::codes::{mux, response, ClientCommand};
use protocol::eor::{EorMessage, EorStatus};
use protocol::netstring::{encode_frame, NetstringReader, NetstringWriter};

use crate::markdown::{self, MarkdownList, MarkdownRule};
use crate::rewrite::{ShardingAlgo, SqlRewriter};
use crate::special::SpecialQueryCache;
use crate::stmt_cache::{StatementCache, StmtKey};
use crate::watcher::WatchState;

/// Idle poll granularity while waiting for a request.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Identity facts handed in by the bootstrap.
#[derive(Debug, Clone, Default)]
pub struct SessionParams {
    pub connected_id: u32,
    pub db_username: String,
    pub host_name: String,
    pub mark_host_name: String,
    pub module_info: String,
}

/// The worker: owns one driver session and serves framed requests from
/// the mux on the data channel. Two states: available (between
/// requests, idle tasks run) and dedicated (mid-request).
pub struct WorkerChild<D: SqlDriver> {
    pub(crate) driver: D,
    pub(crate) cfg: WorkerConfig,
    pub(crate) ops: OpsConfig,
    pub(crate) reader: NetstringReader<UnixStream>,
    pub(crate) writer: NetstringWriter<UnixStream>,
    wait_handle: UnixStream,
    pub(crate) watch: Arc<WatchState>,
    pub(crate) params: SessionParams,

    // loop state
    pub(crate) dedicated: bool,
    eor_free_sent: bool,
    pub(crate) shutdown: bool,
    requests_count: u32,
    start_time: i64,
    max_requests_allowed: u32,
    max_lifespan_allowed: i64,
    lifespan_jitter: f64,
    next_db_heartbeat: i64,

    // statement state
    pub(crate) cache: StatementCache,
    pub(crate) cur_stmt: Option<StmtKey>,
    pub(crate) bind_slots: Vec<BindSlot>,
    pub(crate) out_slots: Vec<OutBindSlot>,
    pub(crate) last_exec_ok: bool,
    pub(crate) in_trans: bool,
    pub(crate) cur_query: String,
    /// Hash of the normalized statement, carried so fetch logging names
    /// the statement the way execute did.
    pub(crate) query_hash: String,
    /// Pre-rewrite hash, for correlating a rewritten statement with what
    /// the client sent.
    pub(crate) orig_query_hash: String,

    // global transaction state
    pub(crate) has_real_dml: bool,
    pub(crate) in_global_txn: bool,
    pub(crate) phase1_done: bool,
    pub(crate) trans_role: TransRole,
    pub(crate) curr_xid: Option<String>,

    // sharding
    pub(crate) rewriter: Option<SqlRewriter>,
    pub(crate) sql_rewritten: bool,
    pub(crate) sharding_algo: ShardingAlgo,
    pub(crate) scuttle_id: String,
    pub(crate) bind_data: String,

    // markdown
    pub(crate) markdown_rules: Vec<MarkdownRule>,
    pub(crate) mklist: MarkdownList,

    // special queries
    pub(crate) special: SpecialQueryCache,
    pub(crate) cur_results: Option<usize>,
    pub(crate) results_valid: bool,

    // client-provided context
    pub(crate) client_info: String,
    pub(crate) client_name: String,
    pub(crate) corr_id: String,
}

impl<D: SqlDriver> WorkerChild<D> {
    pub fn new(
        driver: D,
        cfg: WorkerConfig,
        ops: OpsConfig,
        data: UnixStream,
        watch: Arc<WatchState>,
        params: SessionParams,
    ) -> WResult<Self> {
        let writer_stream = data.try_clone()?;
        let wait_handle = data.try_clone()?;
        let rewriter = if cfg.enable_sharding && cfg.enable_sql_rewrite {
            Some(SqlRewriter::new(&cfg.shard_key_name, &cfg.scuttle_attr_name))
        } else {
            None
        };
        let cache = StatementCache::new(
            if cfg.max_cache_size == 0 && cfg.enable_session_cache {
                128
            } else {
                cfg.max_cache_size
            },
            cfg.max_statement_age,
            cfg.cache_expire_frequency,
        );
        let sharding_algo = ShardingAlgo::from_config(&cfg.sharding_algo);
        let now = time_util::now_secs();

        Ok(WorkerChild {
            max_requests_allowed: cfg.max_requests_per_worker,
            max_lifespan_allowed: cfg.max_lifespan_seconds,
            lifespan_jitter: rand::thread_rng().gen_range(0.8..1.2),
            next_db_heartbeat: now + cfg.db_heartbeat_frequency,
            driver,
            cfg,
            ops,
            reader: NetstringReader::new(data),
            writer: NetstringWriter::new(writer_stream),
            wait_handle,
            watch,
            params,
            dedicated: false,
            eor_free_sent: false,
            shutdown: false,
            requests_count: 0,
            start_time: now,
            cache,
            cur_stmt: None,
            bind_slots: Vec::new(),
            out_slots: Vec::new(),
            last_exec_ok: false,
            in_trans: false,
            cur_query: String::new(),
            query_hash: String::from("NotSet"),
            orig_query_hash: String::new(),
            has_real_dml: false,
            in_global_txn: false,
            phase1_done: false,
            trans_role: TransRole::PointSite,
            curr_xid: None,
            rewriter,
            sql_rewritten: false,
            sharding_algo,
            scuttle_id: String::new(),
            bind_data: String::new(),
            markdown_rules: Vec::new(),
            mklist: MarkdownList::default(),
            special: SpecialQueryCache::default(),
            cur_results: None,
            results_valid: false,
            client_info: String::new(),
            client_name: String::new(),
            corr_id: String::new(),
        })
    }

    /// The main request loop. Returns when the peer goes away, framing
    /// breaks, or the lifecycle/shutdown limits fire.
    pub fn run(&mut self) {
        let hello = format!("{} {}", self.params.connected_id, self.params.db_username);
        if self.writer.write(mux::CONTROL_MSG, hello.as_bytes()).is_err() {
            warn!("cannot write the initial control message");
            return;
        }

        let mut payload = Vec::new();
        loop {
            if !self.dedicated {
                self.check_opscfg();
                self.prepare_connection();
            }

            if self.reader.is_buffer_empty() && !self.wait_for_request() {
                break;
            }

            let cmd = match self.reader.read(&mut payload) {
                Ok(c) => c,
                Err(e) if e.is_disconnect() => {
                    info!("mux closed the data channel, exiting worker");
                    break;
                }
                Err(e) => {
                    warn!("error reading command (bad protocol or disconnect): {}", e);
                    break;
                }
            };

            let is_corr = cmd == u32::from(ClientCommand::CalCorrelationId);
            if !self.dedicated && !is_corr {
                self.eor_free_sent = false;
                self.set_dedicated(true);
                debug!("session started, rq_id = {}", self.reader.count());
            }

            self.watch
                .current_req
                .store(self.reader.count(), Ordering::SeqCst);

            let name = ClientCommand::try_from(cmd)
                .map(|c| c.name().to_string())
                .unwrap_or_else(|_| format!("COMMAND_{}", cmd));
            debug!("handling command {}", name);

            if let Err(e) = self.handle_command(cmd, &mut payload) {
                warn!("command {} failed hard: {}", name, e);
                break;
            }

            if self.watch.recovery_pending() {
                self.recover();
            }

            if !self.dedicated && !is_corr {
                self.end_session();
            }

            if self.shutdown {
                if self.dedicated {
                    info!("shutdown flag set and ignored because the worker is dedicated");
                } else {
                    info!("shutdown flag set, exiting worker");
                    break;
                }
            }
        }

        self.cleanup_connection();
        self.watch.stop.store(true, Ordering::SeqCst);
    }

    /// Blocks until the data channel is readable, running idle tasks on
    /// each poll timeout. False means the loop should exit.
    fn wait_for_request(&mut self) -> bool {
        use std::os::fd::AsRawFd;

        loop {
            let mut pfd = libc::pollfd {
                fd: self.wait_handle.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, IDLE_POLL.as_millis() as libc::c_int) };
            if rc > 0 {
                return true;
            }
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                debug!("error waiting on the data channel: {}", err);
                return false;
            }

            // poll timeout: run the idle work
            if self.watch.recovery_pending() {
                self.recover();
            }
            if !self.dedicated {
                self.on_idle();
            }
            self.check_opscfg();
            if self.shutdown && !self.dedicated {
                return false;
            }
        }
    }

    pub(crate) fn set_dedicated(&mut self, dedicated: bool) {
        self.dedicated = dedicated;
    }

    /// Appends the EOR sentinel for the current request. FREE downgrades
    /// to MORE_INCOMING_REQUESTS when pipelined data is already
    /// buffered; a second FREE for the same request becomes RESTART.
    pub(crate) fn eor(&mut self, mut status: EorStatus, payload: Vec<u8>) {
        if !self.reader.is_buffer_empty() && status == EorStatus::Free {
            debug!("inbound buffer not empty, EOR FREE overwritten to MORE_INCOMING_REQUESTS");
            self.set_dedicated(true);
            status = EorStatus::MoreIncomingRequests;
        }
        if status == EorStatus::Free {
            self.set_dedicated(false);
            if self.eor_free_sent {
                warn!("EOR_FREE_AGAIN");
                status = EorStatus::Restart;
            }
            self.eor_free_sent = true;
        }
        self.writer.separate();
        let msg = EorMessage::new(status, self.reader.count(), payload);
        debug!("EOR status = {:?}, rq_id = {}", msg.status, msg.req_id);
        self.writer.add(mux::EOR, &msg.compose());
    }

    /// EOR with a terminal frame embedded in the sentinel payload.
    pub(crate) fn eor_with_frame(&mut self, status: EorStatus, code: u32, payload: &[u8]) {
        let mut buf = Vec::with_capacity(payload.len() + 16);
        encode_frame(&mut buf, code, payload);
        self.eor(status, buf);
    }

    /// Transaction state as the driver sees it; assumed true on error so
    /// teardown still rolls back.
    pub(crate) fn is_in_transaction(&mut self) -> bool {
        match self.driver.in_transaction() {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to check transaction state: {}", e);
                true
            }
        }
    }

    pub(crate) fn eor_status_for_txn(&mut self) -> EorStatus {
        if self.is_in_transaction() {
            EorStatus::InTransaction
        } else {
            EorStatus::Free
        }
    }

    /// Reports a driver error to the client. Cancellation (1013) sends
    /// only the SQL_ERROR frame; its EOR comes from the recovery path.
    /// Fatal errors additionally set the shutdown flag.
    pub(crate) fn sql_error(&mut self, err: &DriverError, offsets: &[(u32, i32)]) -> WResult<()> {
        let mut payload = format!("{} ", err.code);
        if !offsets.is_empty() {
            payload.push_str(&format!("{} ", offsets.len()));
            for (off, rc) in offsets {
                payload.push_str(&format!("{} {} ", off, rc));
            }
        }
        payload.push_str(&err.text);

        if err.is_cancel() {
            self.writer.add(response::SQL_ERROR, payload.as_bytes());
        } else {
            let status = self.eor_status_for_txn();
            self.eor_with_frame(status, response::SQL_ERROR, payload.as_bytes());
        }
        self.writer.flush_groups()?;

        warn!("driver error {}: [{}]", err.code, err.text);
        debug!("error event {}", err.ora_name());
        if err.is_fatal() {
            warn!("fatal driver error, worker will exit");
            self.shutdown = true;
        }

        self.cur_stmt = None;
        Ok(())
    }

    /// Reports an internal error: ERROR frame plus EOR, statement
    /// cleared, session continues.
    pub(crate) fn internal_error(&mut self, text: &str) -> WResult<()> {
        let status = self.eor_status_for_txn();
        self.eor_with_frame(status, response::ERROR, text.as_bytes());
        self.writer.flush_groups()?;
        warn!("{}", text);
        self.cur_stmt = None;
        Ok(())
    }

    /// Mux-initiated recovery: the watcher broke (or pre-empted) the
    /// current request. Emits EOR FREE only when the abort id still
    /// matches this request, else warns and stays quiet to avoid a
    /// double reply.
    pub(crate) fn recover(&mut self) {
        let Some(_flags) = self.watch.take_recovery() else {
            return;
        };
        if let Err(e) = self.driver.reset_after_break() {
            warn!("failed to reset the driver after break: {}", e);
            self.shutdown = true;
        }

        if self.dedicated {
            let req_id = self.reader.count();
            let abort_id = self.watch.id_to_abort.load(Ordering::SeqCst);
            if req_id != abort_id {
                warn!(
                    "race interrupting SQL during recover, wk_rq_id is {} and mux_rq_id is {}",
                    req_id, abort_id
                );
                return;
            }
            debug!("mux asked to abort existing work, worker becomes available");
            self.eor(EorStatus::Free, Vec::new());
            if self.writer.flush_groups().is_err() {
                self.shutdown = true;
            }
            self.end_session();
        } else {
            warn!("mux asks to abort existing work, but worker is not dedicated");
        }
    }

    /// Idle processing between requests: cache expiry, DB heartbeat,
    /// lifecycle limits.
    pub(crate) fn on_idle(&mut self) {
        let expired = self.cache.expire(false);
        for entry in expired {
            self.driver.free_statement(entry.stmt);
        }

        let now = time_util::now_secs();
        if now >= self.next_db_heartbeat {
            self.next_db_heartbeat = now + self.cfg.db_heartbeat_frequency;
            if let Err(e) = self.driver.heartbeat() {
                warn!("database heartbeat failed: {}", e);
                self.shutdown = true;
            }
        }

        if self.lifecycle_exceeded() {
            info!(
                "lifecycle limit reached (requests = {}, uptime = {}s), restarting",
                self.requests_count,
                now - self.start_time
            );
            self.shutdown = true;
        }
    }

    fn lifecycle_exceeded(&self) -> bool {
        if self.max_requests_allowed > 0 && self.requests_count >= self.max_requests_allowed {
            return true;
        }
        if self.max_lifespan_allowed > 0 {
            let limit = (self.max_lifespan_allowed as f64 * self.lifespan_jitter) as i64;
            if time_util::now_secs() - self.start_time > limit {
                return true;
            }
        }
        false
    }

    pub(crate) fn bump_request_count(&mut self) {
        self.requests_count += 1;
    }

    /// Applies the hot-tunable overlay, at most every 30 seconds.
    fn check_opscfg(&mut self) {
        if !self.ops.refresh() {
            return;
        }
        if let Some(v) = self.ops.get_u32("max_requests_per_worker") {
            self.max_requests_allowed = v;
        }
        if let Some(v) = self.ops.get_i64("max_lifespan_seconds") {
            self.max_lifespan_allowed = v;
        }
        if let Some(level) = self.ops.get("log_level") {
            debug!("ops config log_level = {}", level);
        }
    }

    /// Per-request initialization while available: reset statement
    /// pointers, clear 2PC residue, refresh the markdown snapshot.
    fn prepare_connection(&mut self) {
        self.cur_stmt = None;
        self.cur_results = None;
        self.results_valid = false;
        self.in_trans = false;
        self.client_info.clear();
        let _ = self.clear_2pc_state();
        let dir = self.cfg.markdown_directory.clone();
        self.markdown_rules = markdown::build_markdowns(&dir, &mut self.mklist);
    }

    /// End-of-request cleanup: roll back anything left open and reset
    /// per-request state.
    pub(crate) fn end_session(&mut self) {
        self.cleanup_connection();
        debug!("session ended");
    }

    fn cleanup_connection(&mut self) {
        self.cur_stmt = None;

        if self.is_in_transaction() && self.rollback_internal("").is_err() {
            warn!("failed to rollback after transaction, shutting down worker");
            self.shutdown = true;
        }

        self.next_db_heartbeat = time_util::now_secs() + self.cfg.db_heartbeat_frequency;

        if self.cfg.max_cache_size == 0 || self.cfg.enable_session_cache {
            for entry in self.cache.dump_all() {
                self.driver.free_statement(entry.stmt);
            }
        } else {
            for entry in self.cache.expire(true) {
                self.driver.free_statement(entry.stmt);
            }
            debug!("cache size is {}", self.cache.len());
        }

        if !self.client_name.is_empty() {
            debug!("client {} session closed", self.client_name);
            self.client_name.clear();
        }
    }

    /// Full teardown on exit.
    pub fn shutdown_session(&mut self) {
        for entry in self.cache.dump_all() {
            self.driver.free_statement(entry.stmt);
        }
        self.driver.disconnect();
    }

    pub(crate) fn unexpected_command(&mut self, cmd: u32, payload: &[u8]) -> WResult<()> {
        self.writer.write(
            protocol::codes::server::UNEXPECTED_COMMAND,
            b"",
        )?;
        warn!(
            "err_msg=Unknown command {}: {}",
            cmd,
            String::from_utf8_lossy(payload)
        );
        Ok(())
    }
}

impl<D: SqlDriver> Drop for WorkerChild<D> {
    fn drop(&mut self) {
        self.watch.stop.store(true, Ordering::SeqCst);
    }
}

// run_blocking lives here so every blocking driver call arms the watcher
// the same way.
impl<D: SqlDriver> WorkerChild<D> {
    /// Brackets a potentially long driver call with the watcher arm /
    /// disarm handshake.
    pub(crate) fn run_blocking<T>(
        &mut self,
        f: impl FnOnce(&mut D) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        self.watch.arm(self.reader.count());
        let result = f(&mut self.driver);
        self.watch.disarm();
        result
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::net::UnixStream;

    use driver::mem::MemoryDriver;
    use protocol::eor::EorMessage;

    use super::*;

    fn child_with_peer() -> (WorkerChild<MemoryDriver>, UnixStream) {
        let (worker_side, peer) = UnixStream::pair().unwrap();
        let child = WorkerChild::new(
            MemoryDriver::new(),
            WorkerConfig::default(),
            OpsConfig::new(None),
            worker_side,
            Arc::new(WatchState::default()),
            SessionParams::default(),
        )
        .unwrap();
        (child, peer)
    }

    #[test]
    fn second_eor_free_is_rewritten_to_restart() {
        let (mut child, peer) = child_with_peer();

        child.eor(EorStatus::Free, Vec::new());
        child.eor(EorStatus::Free, Vec::new());
        child.writer.flush_groups().unwrap();
        drop(child);

        let mut reader = NetstringReader::new(peer);
        let mut payload = Vec::new();
        assert_eq!(reader.read(&mut payload).unwrap(), mux::EOR);
        assert_eq!(
            EorMessage::parse(&payload).unwrap().status,
            EorStatus::Free
        );
        assert_eq!(reader.read(&mut payload).unwrap(), mux::EOR);
        assert_eq!(
            EorMessage::parse(&payload).unwrap().status,
            EorStatus::Restart
        );
    }

    #[test]
    fn eor_embeds_the_terminal_frame() {
        let (mut child, peer) = child_with_peer();

        child.eor_with_frame(EorStatus::InTransaction, response::OK, b"");
        child.writer.flush_groups().unwrap();
        drop(child);

        let mut reader = NetstringReader::new(peer);
        let mut payload = Vec::new();
        assert_eq!(reader.read(&mut payload).unwrap(), mux::EOR);
        let msg = EorMessage::parse(&payload).unwrap();
        assert_eq!(msg.status, EorStatus::InTransaction);
        assert_eq!(msg.payload, b"1:5,");
    }
}
