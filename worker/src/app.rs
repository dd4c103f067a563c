use std::env;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use common::config::{OpsConfig, WorkerConfig};
use common::err::{WResult, WorkerError};
use common::log::tracing_factory::{parse_level, OutputType, TracingFactoryOptions};
use common::log::TracingFactory;
use driver::types::SessionAttr;
use driver::SqlDriver;

use crate::child::{SessionParams, WorkerChild};
use crate::watcher::{ControlWatcher, WatchState};

pub const EXIT_OK: i32 = 0;
pub const EXIT_BAD_CONFIG: i32 = 1;
pub const EXIT_BAD_CREDENTIALS: i32 = 2;
pub const EXIT_BAD_CHARSET: i32 = 3;
pub const EXIT_DB_UNREACHABLE: i32 = 4;

/// Data channel inherited from the mux.
pub const DATA_FD: RawFd = 3;
/// Control channel inherited from the mux.
pub const CTRL_FD: RawFd = 4;

const ENV_MODULE: &str = "WORKER_MODULE";
const ENV_LOG_PREFIX: &str = "LOG_PREFIX";
const ENV_CAL_CLIENT_SESSION: &str = "CAL_CLIENT_SESSION";
const ENV_DB_HOSTNAME: &str = "DB_HOSTNAME";
const ENV_MARK_HOST_NAME: &str = "MARK_HOST_NAME";
const ENV_CFG_FILE: &str = "WORKER_CFG_FILE";
const ENV_OPSCFG_FILE: &str = "OPS_CFG_FILE";
const ENV_MUX_START_TIME_SEC: &str = "MUX_START_TIME_SEC";
const ENV_MUX_START_TIME_USEC: &str = "MUX_START_TIME_USEC";
const ENV_USERNAME: &str = "DB_USERNAME";
const ENV_PASSWORD: &str = "DB_PASSWORD";
const ENV_DEBUG_WAIT: &str = "DEBUG_WORKER_WAIT";

/// Everything the worker needs from its environment.
#[derive(Debug, Clone)]
pub struct InitParams {
    pub config_file: PathBuf,
    pub ops_cfg_file: Option<PathBuf>,
    pub db_username: String,
    pub db_password: String,
    pub module: String,
    pub db_hostname: String,
    pub mark_host_name: String,
    pub cal_client_session: String,
    pub log_prefix: Option<String>,
    pub mux_start_time: Option<(i64, i64)>,
    pub debug_wait: Option<u64>,
}

impl InitParams {
    pub fn from_env() -> WResult<InitParams> {
        let db_username = env::var(ENV_USERNAME)
            .map_err(|_| WorkerError::Config(format!("{} is not set", ENV_USERNAME)))?;
        let db_password = env::var(ENV_PASSWORD)
            .map_err(|_| WorkerError::Config(format!("{} is not set", ENV_PASSWORD)))?;
        let config_file = env::var(ENV_CFG_FILE)
            .map_err(|_| WorkerError::Config(format!("{} is not set", ENV_CFG_FILE)))?;

        let mux_start_time = match (
            env::var(ENV_MUX_START_TIME_SEC).ok(),
            env::var(ENV_MUX_START_TIME_USEC).ok(),
        ) {
            (Some(sec), Some(usec)) => Some((
                sec.trim().parse().unwrap_or(0),
                usec.trim().parse().unwrap_or(0),
            )),
            _ => None,
        };

        Ok(InitParams {
            config_file: PathBuf::from(config_file),
            ops_cfg_file: env::var(ENV_OPSCFG_FILE).ok().map(PathBuf::from),
            db_username,
            db_password,
            module: env::var(ENV_MODULE).unwrap_or_else(|_| "occworker".to_string()),
            db_hostname: env::var(ENV_DB_HOSTNAME).unwrap_or_default(),
            mark_host_name: env::var(ENV_MARK_HOST_NAME).unwrap_or_default(),
            cal_client_session: env::var(ENV_CAL_CLIENT_SESSION)
                .unwrap_or_else(|_| "nullCalClientSession".to_string()),
            log_prefix: env::var(ENV_LOG_PREFIX).ok(),
            mux_start_time,
            debug_wait: env::var(ENV_DEBUG_WAIT)
                .ok()
                .and_then(|v| v.trim().parse().ok()),
        })
    }
}

/// Closes every fd above the two inherited channels. The spawner leaks a
/// few descriptors; a single poll sweep finds the live ones.
pub fn close_stray_fds(first: RawFd) -> usize {
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let limit = if limit <= 0 { 1024 } else { limit as RawFd };
    if first >= limit {
        return 0;
    }
    let mut fds: Vec<libc::pollfd> = (first..limit)
        .map(|fd| libc::pollfd {
            fd,
            events: 0,
            revents: 0,
        })
        .collect();
    unsafe {
        libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 0);
    }
    let mut closed = 0;
    for p in &fds {
        if p.revents & libc::POLLNVAL == 0 {
            unsafe {
                libc::close(p.fd);
            }
            closed += 1;
        }
    }
    closed
}

fn fd_is_valid(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFL) >= 0 }
}

/// Full process bring-up over the inherited fds, then the request loop.
/// Returns the process exit code.
pub fn run<D: SqlDriver>(mut driver: D) -> i32 {
    let params = match InitParams::from_env() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("worker init failed: {}", e);
            return EXIT_BAD_CONFIG;
        }
    };

    let cfg = match WorkerConfig::load(&params.config_file) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("worker config failed: {}", e);
            return EXIT_BAD_CONFIG;
        }
    };

    let level = parse_level(&cfg.log_level);
    let opts = if cfg.log_dir.is_empty() {
        TracingFactoryOptions::new(level, OutputType::STDOUT, None, params.log_prefix.clone())
    } else {
        TracingFactoryOptions::new(
            level,
            OutputType::LOG,
            Some(cfg.log_dir.clone()),
            params.log_prefix.clone(),
        )
    };
    TracingFactory::init_log_with_options(opts);

    info!("a child is born, module {}", params.module);
    if let Some((sec, usec)) = params.mux_start_time {
        debug!("mux start time {}.{:06}", sec, usec);
    }
    if let Some(wait) = params.debug_wait {
        info!("debug wait {}s before init", wait);
        thread::sleep(Duration::from_secs(wait));
    }

    let stray = close_stray_fds(CTRL_FD + 1);
    if stray > 0 {
        warn!("closed {} stray fds at startup", stray);
    }

    if !fd_is_valid(DATA_FD) || !fd_is_valid(CTRL_FD) {
        warn!("inherited channel fds are invalid");
        failure_backoff(&cfg);
        return EXIT_BAD_CONFIG;
    }

    if let Err(e) = driver.connect(&params.db_username, &params.db_password) {
        warn!("cannot connect to the database: {}", e);
        failure_backoff(&cfg);
        return if e.code == 1017 {
            EXIT_BAD_CREDENTIALS
        } else {
            EXIT_DB_UNREACHABLE
        };
    }

    {
        let info = driver.server_info();
        info!(
            "connected: version {}, charset {}, instance {}",
            info.version, info.charset, info.instance_id
        );
        if !info.charset_is_utf8() {
            warn!("database charset {} is not UTF-8", info.charset);
            driver.disconnect();
            return EXIT_BAD_CHARSET;
        }
    }

    if let Err(e) = driver.set_session_attr(SessionAttr::Module, &params.module) {
        debug!("failed to set the module attribute: {}", e);
    }

    let data = unsafe { UnixStream::from_raw_fd(DATA_FD) };
    let ctrl = unsafe { UnixStream::from_raw_fd(CTRL_FD) };

    let watch = Arc::new(WatchState::default());
    let ping_out = match data.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot clone the data channel: {}", e);
            return EXIT_BAD_CONFIG;
        }
    };
    let watcher = ControlWatcher::new(
        ctrl,
        Box::new(ping_out),
        watch.clone(),
        driver.breaker(),
        Duration::from_secs(cfg.ping_interval.max(0) as u64),
    );
    let watcher_handle = watcher.spawn();

    let session = SessionParams {
        connected_id: std::process::id(),
        db_username: params.db_username.clone(),
        host_name: params.db_hostname.clone(),
        mark_host_name: params.mark_host_name.clone(),
        module_info: params.module.clone(),
    };
    let ops = OpsConfig::new(params.ops_cfg_file.clone());

    let mut child = match WorkerChild::new(driver, cfg, ops, data, watch, session) {
        Ok(c) => c,
        Err(e) => {
            warn!("worker construction failed: {}", e);
            return EXIT_BAD_CONFIG;
        }
    };

    child.run();
    child.shutdown_session();
    let _ = watcher_handle.join();

    info!("worker exiting cleanly");
    EXIT_OK
}

/// Random sleep before exiting on a failed construction; the pool
/// manager restarts the worker after it exits.
fn failure_backoff(cfg: &WorkerConfig) {
    let ceiling = cfg.child_failure_delay.max(1);
    let sleep_secs = rand::thread_rng().gen_range(0..=ceiling);
    thread::sleep(Duration::from_secs(sleep_secs));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_env_is_a_config_error() {
        // clear the variables this process may have inherited
        std::env::remove_var(ENV_USERNAME);
        std::env::remove_var(ENV_PASSWORD);
        std::env::remove_var(ENV_CFG_FILE);
        assert!(InitParams::from_env().is_err());
    }

    #[test]
    fn stray_fd_sweep_reports_count() {
        // high floor: nothing should be open up there
        let closed = close_stray_fds(900);
        // there may be zero or more stray fds; the sweep must not crash
        let _ = closed;
    }
}
