//! Kernel backend for the `log` facade.
//!
//! Records go to the serial console with a terse `[LEVEL] target: message`
//! shape. The backend is installed once during early boot, before any
//! subsystem that logs is initialized.

use log::{LevelFilter, Log, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::println!(
            "[{:5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the serial logger. Safe to call more than once; later calls are
/// no-ops because `set_logger` only succeeds the first time.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Raise or lower the global level, e.g. for a verbose boot.
#[allow(dead_code)]
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
