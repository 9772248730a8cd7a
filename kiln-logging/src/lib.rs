//! Logging setup for Kiln
//!
//! Worker processes always log to stderr, because their stdout is the IPC
//! channel back to the coordinator. Coordinators choose a [`LogWriter`].

pub mod init;

pub use init::{init_logging_from_config, init_worker_tracing, LogWriter};
