//! Log handling as a capability rather than a process-wide singleton (§9
//! "Global state"). Components take a `Arc<dyn LogSink>` at construction
//! and default to a no-op; nothing here calls `log::set_logger` globally.

use std::sync::Arc;

pub use log::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
  pub level: LogLevel,
  pub target: &'static str,
  pub message: String,
}

pub trait LogSink: Send + Sync {
  fn emit(&self, record: LogRecord);
}

/// Default sink: discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogSink;

impl LogSink for NoopLogSink {
  fn emit(&self, _record: LogRecord) {}
}

/// Bridges into the ambient `log` facade (and whatever `env_logger` or
/// other subscriber the host process installed), matching how the
/// original CLI wired `env_logger::Builder::from_env(..).init()` once at
/// process start and logged with the bare `log` macros everywhere else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
  fn emit(&self, record: LogRecord) {
    match record.level {
      LogLevel::Trace => log::trace!(target: record.target, "{}", record.message),
      LogLevel::Debug => log::debug!(target: record.target, "{}", record.message),
      LogLevel::Info => log::info!(target: record.target, "{}", record.message),
      LogLevel::Warn => log::warn!(target: record.target, "{}", record.message),
      LogLevel::Error => log::error!(target: record.target, "{}", record.message),
    }
  }
}

pub fn noop_sink() -> Arc<dyn LogSink> {
  Arc::new(NoopLogSink)
}

pub fn log_crate_sink() -> Arc<dyn LogSink> {
  Arc::new(LogCrateSink)
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn noop_sink_accepts_any_record_without_panicking() {
    let sink = noop_sink();
    sink.emit(LogRecord {
      level: LogLevel::Error,
      target: "pool",
      message: "connection lost".to_string(),
    });
  }

  #[test]
  fn log_level_ordering_matches_severity() {
    assert!(LogLevel::Trace < LogLevel::Debug);
    assert!(LogLevel::Debug < LogLevel::Info);
    assert!(LogLevel::Info < LogLevel::Warn);
    assert!(LogLevel::Warn < LogLevel::Error);
  }
}
