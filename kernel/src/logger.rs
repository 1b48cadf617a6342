//! Logging backend: every `log::info!`/`log::warn!`/... call is routed to
//! the COM1 serial port, prefixed with level and target the way the
//! teacher's framebuffer logger prefixed lines before it.

use crate::serial::SERIAL1;
use core::fmt::Write;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        x86_64::instructions::interrupts::without_interrupts(|| {
            let _ = writeln!(
                SERIAL1.lock(),
                "[{:>5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        });
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger as the global `log` sink. Must run after
/// `serial::init`.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(default_level()))
        .expect("logger already initialized");
}

#[cfg(debug_assertions)]
fn default_level() -> LevelFilter {
    LevelFilter::Debug
}

#[cfg(not(debug_assertions))]
fn default_level() -> LevelFilter {
    LevelFilter::Info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn logger_reports_all_levels_enabled() {
        let metadata = log::Metadata::builder().level(Level::Trace).build();
        assert!(LOGGER.enabled(&metadata));
    }
}
