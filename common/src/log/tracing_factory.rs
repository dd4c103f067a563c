use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::Level;
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::MakeWriterExt;

static IS_INIT: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Default)]
pub struct TracingFactory {
    options: TracingFactoryOptions,
}

#[derive(Debug, Clone)]
pub struct TracingFactoryOptions {
    level: Level,

    output_type: OutputType,

    log_dir: Option<String>,

    /// Prepended to the rolling log file name.
    prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub enum OutputType {
    STDOUT,

    LOG,
}

impl TracingFactory {
    pub fn init_log(level: Level) -> Self {
        TracingFactory::init_log_with_options(TracingFactoryOptions::new_with_level(level))
    }

    pub fn init_log_with_options(opt: TracingFactoryOptions) -> Self {
        let mut opts = opt.clone();

        if matches!(opts.output_type, OutputType::LOG) && opts.log_dir.is_none() {
            opts.log_dir = Some(String::from("/tmp/occworker/logs"));
        }

        if !IS_INIT.swap(true, Ordering::SeqCst) {
            let format = fmt::format()
                .with_file(false)
                .with_line_number(false)
                .with_target(false)
                .with_thread_ids(true)
                .with_thread_names(true)
                .compact();

            match opts.output_type {
                OutputType::STDOUT => {
                    let _ = tracing_subscriber::fmt()
                        .with_max_level(opts.level)
                        .event_format(format)
                        .try_init();
                }
                OutputType::LOG => {
                    let dir = opts
                        .log_dir
                        .clone()
                        .unwrap_or_else(|| String::from("/tmp/occworker/logs"));
                    let file_name = match &opts.prefix {
                        Some(p) => format!("{}.log", p),
                        None => String::from("worker.log"),
                    };
                    let file_appender = rolling::daily(dir, file_name);
                    let merge = file_appender.and(io::stdout);

                    let _ = tracing_subscriber::fmt()
                        .with_max_level(opts.level)
                        .event_format(format)
                        .with_writer(merge)
                        .try_init();
                }
            }
        }

        TracingFactory { options: opts }
    }

    pub fn get_log_dir(&self) -> &str {
        self.options.get_log_dir()
    }
}

impl Default for TracingFactoryOptions {
    fn default() -> Self {
        TracingFactoryOptions::new_with_level(Level::INFO)
    }
}

impl TracingFactoryOptions {
    pub fn new_with_level(level: Level) -> Self {
        TracingFactoryOptions {
            level,
            output_type: OutputType::STDOUT,
            log_dir: None,
            prefix: None,
        }
    }

    pub fn new(
        level: Level,
        output_type: OutputType,
        log_dir: Option<String>,
        prefix: Option<String>,
    ) -> Self {
        TracingFactoryOptions {
            level,
            output_type,
            log_dir,
            prefix,
        }
    }

    pub fn get_log_dir(&self) -> &str {
        match self.log_dir.as_ref() {
            None => "",
            Some(dir) => dir.as_str(),
        }
    }
}

/// Maps a level name from config to a tracing level; unknown names fall
/// back to INFO.
pub fn parse_level(name: &str) -> Level {
    match name.to_ascii_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" | "verbose" => Level::TRACE,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod test {
    use tracing::{debug, error, info, warn};

    use super::*;

    #[test]
    fn init_is_idempotent() {
        TracingFactory::init_log(Level::DEBUG);
        TracingFactory::init_log(Level::DEBUG);

        debug!("TracingFactory test: {:?}", "test");
        info!("TracingFactory test: {:?}", "test");
        warn!("TracingFactory test: {:?}", "test");
        error!("TracingFactory test: {:?}", "test");
    }

    #[test]
    fn level_parsing() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("VERBOSE"), Level::TRACE);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }
}
