//! Daemon logging: timestamped, per-subsystem, colored by level.

use std::io;
use std::io::Write;

use chrono::prelude::*;
use colored::*;
use log::{Level, Log, Metadata, Record, SetLoggerError};

/// Logs to `stdout`. Targets are this daemon's subsystems (`node`,
/// `corpus`, `sync`, `serve`, `tail`), padded to align the columns.
/// Write failures are swallowed: a long-running daemon must not die
/// because its stdout went away.
struct Logger {
    level: Level,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let message = format!(
                "{} {:<5} {:<6} {}",
                Local::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                record.level(),
                record.target().cyan(),
                record.args()
            );
            let message = match record.level() {
                Level::Error => message.red(),
                Level::Warn => message.yellow(),
                Level::Info => message.normal(),
                Level::Debug => message.dimmed(),
                Level::Trace => message.white().dimmed(),
            };
            writeln!(&mut io::stdout(), "{message}").ok();
        }
    }

    fn flush(&self) {}
}

/// Initialize the process-wide logger.
pub fn init(level: Level) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(Logger { level }))?;
    log::set_max_level(level.to_level_filter());

    Ok(())
}

/// Get the level set by the environment variable `RUST_LOG`, if
/// present.
pub fn env_level() -> Option<Level> {
    let level = std::env::var("RUST_LOG").ok()?;
    level.parse().ok()
}
