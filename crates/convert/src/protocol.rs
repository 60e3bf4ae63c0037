use crate::unit::JobUnit;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Commands from the controller to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMsg {
    /// Set the active log directory and append units to the queue.
    AddItems {
        log_dir: PathBuf,
        units: Vec<JobUnit>,
    },
    /// Kill the active run and drop everything queued.
    Cancel,
}

/// Status transitions from the worker to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusMsg {
    Running { video_id: Uuid, command_id: Uuid },
    Converted { video_id: Uuid, command_id: Uuid },
    Error { video_id: Uuid, command_id: Uuid },
    Cancelled { video_id: Uuid, command_id: Uuid },
    Complete,
    Exit,
}

/// Sentinel on the log channel telling the viewer to reset its window
/// before a new unit's output begins.
pub fn clear_window_sentinel(video_id: Uuid, command_id: Uuid) -> String {
    format!("CLEAR_WINDOW:{video_id}:{command_id}")
}

/// True for lines produced by [`clear_window_sentinel`].
pub fn is_clear_window_sentinel(line: &str) -> bool {
    line.starts_with("CLEAR_WINDOW:")
}
