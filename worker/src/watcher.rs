use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use common::err::WorkerError;
use driver::DriverBreaker;
use protocol::codes::{mux, response};
use protocol::control::InterruptMessage;
use protocol::netstring::{encode_frame, NetstringReader};

/// Marker folded into the recovery word so a zero flags byte is still
/// distinguishable from "no recovery pending".
const RECOVER_TAG: u32 = 0xF000;

/// State shared between the main thread and the control-channel watcher.
/// Strictly atomics; no queues, no locks.
#[derive(Debug, Default)]
pub struct WatchState {
    /// True while the main thread is inside a blocking driver call.
    pub armed: AtomicBool,
    /// Non-zero when the main thread must run recovery; holds
    /// `RECOVER_TAG | flags`.
    recover: AtomicU32,
    /// Sequence number of the request the main thread is handling.
    pub current_req: AtomicU32,
    /// Request id the mux asked to abort, captured for the recovery
    /// race check.
    pub id_to_abort: AtomicU32,
    /// Tells the watcher to exit.
    pub stop: AtomicBool,
}

impl WatchState {
    pub fn trigger_recovery(&self, flags: u8) {
        self.recover.store(RECOVER_TAG | flags as u32, Ordering::SeqCst);
    }

    /// Consumes a pending recovery request, returning its flags byte.
    pub fn take_recovery(&self) -> Option<u8> {
        let v = self.recover.swap(0, Ordering::SeqCst);
        if v == 0 {
            None
        } else {
            Some((v & 0xFF) as u8)
        }
    }

    pub fn recovery_pending(&self) -> bool {
        self.recover.load(Ordering::SeqCst) != 0
    }

    /// Main thread bracket around a blocking driver call.
    pub fn arm(&self, req_id: u32) {
        self.current_req.store(req_id, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

/// Watches the control channel while the main thread may be blocked in
/// the driver.
///
/// While armed it emits a keepalive frame to the client every
/// `ping_interval`. An interrupt whose sequence number matches the
/// in-flight request breaks the driver call and flags the main thread
/// for recovery; a mismatch is logged and dropped.
pub struct ControlWatcher {
    reader: NetstringReader<UnixStream>,
    ping_out: Box<dyn Write + Send>,
    state: Arc<WatchState>,
    breaker: DriverBreaker,
    ping_interval: Duration,
}

const CTRL_POLL: Duration = Duration::from_millis(250);

impl ControlWatcher {
    pub fn new(
        ctrl: UnixStream,
        ping_out: Box<dyn Write + Send>,
        state: Arc<WatchState>,
        breaker: DriverBreaker,
        ping_interval: Duration,
    ) -> Self {
        ctrl.set_read_timeout(Some(CTRL_POLL)).ok();
        ControlWatcher {
            reader: NetstringReader::new(ctrl),
            ping_out,
            state,
            breaker,
            ping_interval,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("ctrl-watcher".to_string())
            .spawn(move || self.run())
            .expect("spawn control watcher")
    }

    fn run(mut self) {
        let mut payload = Vec::new();
        let mut last_ping = Instant::now();
        let mut was_armed = false;

        loop {
            if self.state.stop.load(Ordering::SeqCst) {
                return;
            }

            match self.reader.read(&mut payload) {
                Ok(code) if code == mux::INTERRUPT => {
                    self.handle_interrupt(&payload);
                }
                Ok(code) => {
                    // the control channel is owned by the mux; anything
                    // unrecognized means the two sides are out of step
                    error!("invalid control command {}, exiting", code);
                    std::process::exit(0);
                }
                Err(e) if e.is_timeout() => {}
                Err(WorkerError::Protocol(msg)) => {
                    error!("control channel framing broken ({}), exiting", msg);
                    std::process::exit(0);
                }
                Err(_) => {
                    debug!("control channel closed, watcher exiting");
                    return;
                }
            }

            let armed = self.state.armed.load(Ordering::SeqCst);
            if armed && !was_armed {
                last_ping = Instant::now();
            }
            was_armed = armed;
            if armed && self.ping_interval > Duration::ZERO
                && last_ping.elapsed() >= self.ping_interval
            {
                self.send_keepalive();
                last_ping = Instant::now();
            }
        }
    }

    fn handle_interrupt(&mut self, payload: &[u8]) {
        let msg = match InterruptMessage::parse(payload) {
            Ok(m) => m,
            Err(e) => {
                error!("invalid control payload ({}), exiting", e);
                std::process::exit(0);
            }
        };

        let my_req = self.state.current_req.load(Ordering::SeqCst);
        debug!(
            "mux asks to abort work, mux_rq_id = {}, wk_rq_id = {}",
            msg.req_id, my_req
        );
        if msg.req_id != my_req {
            warn!(
                "race interrupting SQL, mux_rq_id is {} and wk_rq_id is {}",
                msg.req_id, my_req
            );
            return;
        }
        self.state.id_to_abort.store(msg.req_id, Ordering::SeqCst);

        if self.state.armed.swap(false, Ordering::SeqCst) {
            debug!("breaking the in-flight driver call");
            self.breaker.break_call();
        } else {
            debug!("watcher not armed, trigger recovery only");
        }
        self.state.trigger_recovery(msg.flags);
    }

    fn send_keepalive(&mut self) {
        debug!("long running query, sending client keepalive");
        let mut frame = Vec::new();
        encode_frame(&mut frame, response::STILL_EXECUTING, b"");
        if self.ping_out.write_all(&frame).is_err() || self.ping_out.flush().is_err() {
            // nobody left to ping; the main thread will notice on its own
            warn!("could not send keepalive to client");
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use super::*;

    fn pair() -> (UnixStream, UnixStream) {
        UnixStream::pair().unwrap()
    }

    fn start_watcher(
        state: Arc<WatchState>,
        breaker: DriverBreaker,
        ping_interval: Duration,
    ) -> (UnixStream, UnixStream, JoinHandle<()>) {
        let (ctrl_tx, ctrl_rx) = pair();
        let (ping_rx, ping_tx) = pair();
        let watcher = ControlWatcher::new(
            ctrl_rx,
            Box::new(ping_tx),
            state,
            breaker,
            ping_interval,
        );
        (ctrl_tx, ping_rx, watcher.spawn())
    }

    fn send_interrupt(ctrl: &mut UnixStream, req_id: u32) {
        let mut frame = Vec::new();
        encode_frame(
            &mut frame,
            mux::INTERRUPT,
            &InterruptMessage::new(0, req_id).compose(),
        );
        ctrl.write_all(&frame).unwrap();
    }

    #[test]
    fn matching_interrupt_breaks_and_flags_recovery() {
        let state = Arc::new(WatchState::default());
        let breaker = DriverBreaker::new();
        let (mut ctrl, _ping, handle) =
            start_watcher(state.clone(), breaker.clone(), Duration::from_secs(60));

        state.arm(7);
        send_interrupt(&mut ctrl, 7);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !breaker.is_broken() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(breaker.is_broken());
        assert!(state.recovery_pending());
        assert!(!state.armed.load(Ordering::SeqCst));
        assert_eq!(state.id_to_abort.load(Ordering::SeqCst), 7);

        state.stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn mismatched_interrupt_is_dropped() {
        let state = Arc::new(WatchState::default());
        let breaker = DriverBreaker::new();
        let (mut ctrl, _ping, handle) =
            start_watcher(state.clone(), breaker.clone(), Duration::from_secs(60));

        state.arm(7);
        send_interrupt(&mut ctrl, 9);

        thread::sleep(Duration::from_millis(300));
        assert!(!breaker.is_broken());
        assert!(!state.recovery_pending());
        assert!(state.armed.load(Ordering::SeqCst));

        state.stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn armed_watcher_sends_keepalives() {
        let state = Arc::new(WatchState::default());
        let breaker = DriverBreaker::new();
        let (_ctrl, mut ping, handle) =
            start_watcher(state.clone(), breaker, Duration::from_millis(300));

        state.arm(1);
        ping.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let mut buf = [0u8; 16];
        let n = ping.read(&mut buf).unwrap();
        // "1:7," is the keepalive frame
        assert_eq!(&buf[..n], b"1:7,");

        state.stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn recovery_word_round_trip() {
        let state = WatchState::default();
        assert!(state.take_recovery().is_none());
        state.trigger_recovery(0);
        assert!(state.recovery_pending());
        assert_eq!(state.take_recovery(), Some(0));
        assert!(!state.recovery_pending());
    }
}
