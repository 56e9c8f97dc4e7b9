//! # Loggers Module
//!
//! Logging setup for the binaries. The library itself only uses the `log`
//! facade; this module installs a `fern` dispatcher writing to stdout and to a
//! timestamped file per run.

/// stdout + file logging with pruning of old run logs.
pub mod file_logger;

pub use file_logger::{cleanup_old_logs, parse_level, setup_logging};
