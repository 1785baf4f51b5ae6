//! Serial-backed `log` implementation.
//!
//! Level-tagged lines on COM1, never allocates, safe from interrupt and
//! panic context. The VGA console stays reserved for the TTY layer; `log`
//! is for the kernel talking to developers.

use log::{Level, LevelFilter, Metadata, Record};

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "E",
            Level::Warn => "W",
            Level::Info => "I",
            Level::Debug => "D",
            Level::Trace => "T",
        };
        crate::serial_println!("[{}] {}: {}", tag, record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the logger. Call after the serial port is up; the level can be
/// raised later once the command line is parsed.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Re-apply the `loglevel=` choice from the parsed command line.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
