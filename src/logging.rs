//! Engine logging facility
//!
//! Routes `log` records to a sink installed by the embedding environment,
//! such as a serial port writer. Records are dropped until a sink is set.

use core::fmt;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Receives one formatted log line
pub type Sink = fn(fmt::Arguments<'_>);

/// Global logger instance used by [`init`]
pub static LOGGER: Logger = Logger::new();

/// Logger writing through a replaceable sink
pub struct Logger {
    sink: Mutex<Option<Sink>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            sink: Mutex::new(None),
        }
    }

    /// Replaces the sink, `None` silences the logger
    pub fn set_sink(&self, sink: Option<Sink>) {
        *self.sink.lock() = sink;
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] target: message"
    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let sink = self.sink.lock();
        if let Some(sink) = *sink {
            sink(format_args!(
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Installs [`LOGGER`] as the `log` backend writing to `sink`
///
/// Sets different log levels for debug/release builds:
///   - Debug builds: LevelFilter::Debug
///   - Release builds: LevelFilter::Info
pub fn init(sink: Sink) -> Result<(), SetLoggerError> {
    LOGGER.set_sink(Some(sink));
    log::set_logger(&LOGGER)?;
    log::set_max_level(
        #[cfg(debug_assertions)]
        LevelFilter::Debug,
        #[cfg(not(debug_assertions))]
        LevelFilter::Info,
    );
    Ok(())
}
