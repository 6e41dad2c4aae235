//! A small built-in logger for hosts that do not install their own `log`
//! backend. Prints the thread id so interleaved GC/mutator output stays
//! readable.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::env;
use std::thread;

struct PmcsLogger;

impl Log for PmcsLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        // Level capping is done globally via log::set_max_level.
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "{:?}[{}:{}] {}",
                thread::current().id(),
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: PmcsLogger = PmcsLogger;

/// Install the built-in logger. The maximum level is taken from the
/// `RUST_LOG` environment variable, defaulting to `info`.
pub fn init() -> Result<(), SetLoggerError> {
    let level = match env::var("RUST_LOG") {
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Info,
        },
        Err(_) => LevelFilter::Info,
    };
    log::set_max_level(level);
    log::set_logger(&LOGGER)
}

/// Like [`init`], but ignores the error when a logger is already installed.
/// Used by tests, which race to initialize.
pub fn try_init() {
    let _ = init();
}
