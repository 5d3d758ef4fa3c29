//! Run reporting.
//!
//! The composer never talks to the terminal directly. Every step emits a
//! structured line (and, for long copies, byte-level progress) through a
//! [`ReportSink`] handed to the orchestrator. The production sink forwards
//! to the `log` facade; tests substitute a recording sink and assert on
//! what was said.

/// Severity of a report line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
    Fatal,
}

/// Destination for run output.
pub trait ReportSink {
    /// Emit one structured line.
    fn log(&self, level: Level, message: &str);

    /// Report copy progress. `total` is the number of bytes the current
    /// operation will move; called after every chunk.
    fn progress(&self, bytes_done: u64, bytes_total: u64);

    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    fn fatal(&self, message: &str) {
        self.log(Level::Fatal, message);
    }
}

/// Sink that forwards to the `log` facade. Progress is demoted to trace so
/// a default logger configuration stays quiet during multi-gigabyte copies.
pub struct LogSink;

impl ReportSink for LogSink {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Info => log::info!("{message}"),
            Level::Warn => log::warn!("{message}"),
            Level::Error | Level::Fatal => log::error!("{message}"),
        }
    }

    fn progress(&self, bytes_done: u64, bytes_total: u64) {
        log::trace!("progress {bytes_done}/{bytes_total}");
    }
}

/// Sink that discards everything.
pub struct NullSink;

impl ReportSink for NullSink {
    fn log(&self, _level: Level, _message: &str) {}
    fn progress(&self, _bytes_done: u64, _bytes_total: u64) {}
}
