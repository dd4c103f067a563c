use tracing::{debug, info, warn};

use common::err::{WResult, WorkerError};
use driver::types::{TransCoupling, TransRole, Xid};
use driver::facade::TransPrepareOutcome;
use driver::SqlDriver;
use protocol::codes::response;

use super::WorkerChild;

impl<D: SqlDriver> WorkerChild<D> {
    /// COMMIT, optionally of an explicit global transaction by XID.
    /// Returns true when the caller should send OK + EOR FREE.
    pub(crate) fn op_commit(&mut self, xid: &str) -> WResult<bool> {
        if !xid.is_empty() {
            // commit of a specific global transaction: thrust the session
            // into the post-prepare state for that XID
            if !self.set_xid(xid)? {
                return Ok(false);
            }
            self.in_global_txn = true;
            self.phase1_done = true;
            self.has_real_dml = true;
            self.trans_role = TransRole::Participant;
            debug!("xid={}", xid);
        } else if !self.in_trans {
            debug!("doing COMMIT (skipped)");
            return Ok(true);
        }

        // participants must run phase 1 before commit
        if self.in_global_txn
            && self.has_real_dml
            && !self.phase1_done
            && self.trans_role == TransRole::Participant
        {
            self.internal_error("Cannot COMMIT until TransPrepare is done.")?;
            return Ok(false);
        }

        let two_phase = self.in_global_txn && self.has_real_dml;
        debug!(
            "doing COMMIT as {}",
            if two_phase { "2PC" } else { "DEFAULT" }
        );

        if let Err(e) = self.driver.commit(two_phase) {
            if !xid.is_empty() && e.is_heuristically_completed() {
                // someone already finished this transaction; forget the
                // pending record and report success
                info!("no work: {}", e.ora_name());
                if let Err(forget_err) = self.driver.trans_forget() {
                    warn!("failed to forget global transaction: {}", forget_err);
                }
            } else {
                self.sql_error(&e, &[])?;
                return Ok(false);
            }
        }

        self.in_trans = false;
        if self.clear_2pc_state().is_err() {
            self.internal_error("failed to clear global transaction state")?;
            return Ok(false);
        }
        Ok(true)
    }

    /// ROLLBACK, optionally of an explicit global transaction by XID.
    pub(crate) fn op_rollback(&mut self, xid: &str) -> WResult<bool> {
        if !xid.is_empty() {
            if !self.set_xid(xid)? {
                return Ok(false);
            }
            self.in_global_txn = true;
            self.phase1_done = true;
            self.has_real_dml = true;
            self.in_trans = true;
            self.trans_role = TransRole::Participant;
            debug!("xid={}", xid);
        } else if !self.in_trans {
            debug!("doing ROLLBACK (skipped)");
            return Ok(true);
        }

        debug!("doing ROLLBACK");

        if let Err(e) = self.driver.rollback() {
            if !xid.is_empty() && e.is_heuristically_completed() {
                info!("no work: {}", e.ora_name());
                if let Err(forget_err) = self.driver.trans_forget() {
                    warn!("failed to forget global transaction: {}", forget_err);
                }
            } else {
                self.sql_error(&e, &[])?;
                return Ok(false);
            }
        }

        self.in_trans = false;
        if self.clear_2pc_state().is_err() {
            self.internal_error("failed to clear global transaction state")?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Internal rollback on session teardown; nothing goes to the client.
    pub(crate) fn rollback_internal(&mut self, _reason: &str) -> WResult<()> {
        debug!("doing ROLLBACK (teardown)");
        self.driver
            .rollback()
            .map_err(|e| WorkerError::Internal(format!("rollback failed: {}", e)))?;
        self.in_trans = false;
        self.clear_2pc_state()
    }

    /// TRANS_START: open a global transaction under the given XID.
    /// Success is silent; the transaction ends with commit/rollback.
    pub(crate) fn op_trans_start(
        &mut self,
        xid: &str,
        timeout: u32,
        role: TransRole,
    ) -> WResult<()> {
        if self.in_global_txn {
            if self.curr_xid.as_deref() != Some(xid) {
                let msg = format!(
                    "Already in a global transaction ({}). Cannot start transaction {}",
                    self.curr_xid.as_deref().unwrap_or(""),
                    xid
                );
                return self.internal_error(&msg);
            }
            warn!(
                "trying to start the same global transaction ({}) again, skipped",
                xid
            );
            return Ok(());
        }

        if !self.set_xid(xid)? {
            // set_xid reported and cleared the state
            return Ok(());
        }

        let timeout = if timeout > 0 {
            timeout
        } else {
            self.cfg.default_trans_timeout
        };
        debug!("starting transaction {} (timeout={})", xid, timeout);

        // clients do not pick the coupling mode
        if let Err(e) = self
            .driver
            .trans_start(timeout, TransCoupling::LooselyCoupled)
        {
            let msg = format!("Failed to start transaction {}", xid);
            warn!("{}: {}", msg, e);
            let _ = self.clear_2pc_state();
            self.writer.write(response::ERROR, msg.as_bytes())?;
            return Ok(());
        }

        self.in_global_txn = true;
        self.trans_role = role;
        Ok(())
    }

    /// TRANS_PREPARE: phase 1 for a participant with real DML; every
    /// other combination is acknowledged without driver work.
    pub(crate) fn op_trans_prepare(&mut self) -> WResult<()> {
        if !self.in_global_txn {
            return self.internal_error("Calling TransPrepare without TransStart. (Skipped).");
        }
        if self.phase1_done {
            return self.internal_error("TransPrepare has already been done. (Skipped).");
        }
        if self.trans_role == TransRole::PointSite {
            info!("calling TransPrepare on the commit point site, skipped");
            self.writer.write(response::OK, b"")?;
            return Ok(());
        }
        if !self.has_real_dml {
            info!("no real DMLs in this session, no need for TransPrepare, skipped");
            self.phase1_done = true;
            self.writer.write(response::OK, b"")?;
            return Ok(());
        }

        debug!(
            "preparing global transaction {}",
            self.curr_xid.as_deref().unwrap_or("")
        );

        match self.driver.trans_prepare() {
            Ok(TransPrepareOutcome::Prepared) => {
                self.phase1_done = true;
                self.writer.write(response::OK, b"")?;
                Ok(())
            }
            Ok(TransPrepareOutcome::NoEffect) => {
                info!("TransPrepare has no effect");
                self.has_real_dml = false;
                self.phase1_done = true;
                self.writer.write(response::OK, b"")?;
                Ok(())
            }
            Err(e) => {
                warn!("TransPrepare call failed: {}", e);
                self.sql_error(&e, &[])?;
                Ok(())
            }
        }
    }

    /// Binds an XID to the driver transaction. Reports the failure and
    /// clears 2PC state on a bad XID; returns whether it stuck.
    pub(crate) fn set_xid(&mut self, xid: &str) -> WResult<bool> {
        let parsed = match Xid::parse(xid) {
            Ok(p) => p,
            Err(_) => {
                self.internal_error(&format!("Invalid XID: {}", xid))?;
                return Ok(false);
            }
        };
        if let Err(e) = self.driver.set_xid(&parsed) {
            warn!("failed to set the XID: {}", e);
            let _ = self.clear_2pc_state();
            self.internal_error(&format!("failed to set the XID {}", xid))?;
            return Ok(false);
        }
        self.curr_xid = Some(xid.to_string());
        debug!("xid bound: {}", parsed);
        Ok(true)
    }

    /// Resets the global-transaction block. The driver transaction
    /// association is cycled, otherwise a later local transaction would
    /// inherit global state.
    pub(crate) fn clear_2pc_state(&mut self) -> WResult<()> {
        if self.in_global_txn {
            self.driver
                .reset_transaction()
                .map_err(|e| WorkerError::Internal(format!("reset transaction: {}", e)))?;
        }
        self.has_real_dml = false;
        self.in_global_txn = false;
        self.phase1_done = false;
        self.curr_xid = None;
        self.trans_role = TransRole::PointSite;
        Ok(())
    }
}
