use command_runner::CommandSpec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// One executable step of a conversion. A source video may expand into
/// several sequential units (two-pass encodes, extract-then-mux chains);
/// they share a `video_id` and run strictly in enqueue order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobUnit {
    pub video_id: Uuid,
    pub command_id: Uuid,
    pub command: CommandSpec,
    pub work_dir: PathBuf,
}

impl JobUnit {
    pub fn new(
        video_id: Uuid,
        command_id: Uuid,
        command: CommandSpec,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            video_id,
            command_id,
            command,
            work_dir: work_dir.into(),
        }
    }
}
