//! Conversion queue worker.
//!
//! A [`QueueWorker`](queue::QueueWorker) owns an ordered queue of encode
//! commands, drives them through a process runner one at a time, and talks
//! to its controller over three channels: inbound control messages,
//! outbound status events, and a free-text log stream.

use std::path::PathBuf;

pub mod power;
pub mod protocol;
pub mod queue;
pub mod unit;
pub mod watch;

pub use protocol::{ControlMsg, StatusMsg};
pub use queue::{LivenessCheck, ProcessRunner, QueueWorker, WorkerConfig};
pub use unit::JobUnit;

/// Default location for per-run conversion logs.
pub fn default_log_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("vidforge").join("logs")
}
