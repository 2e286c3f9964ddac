//! Pending work request published for a run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::run::{Constraints, Run, RunMode};

/// Instruction persisted as `request.json` until a task runner claims it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    /// Caller-side task identifier.
    pub task_id: String,
    /// Free-form task category.
    pub intent: String,
    /// Filesystem root the backend operates in.
    pub workspace_path: PathBuf,
    /// Instruction text.
    pub message: String,
    /// Backend adapter name.
    pub engine: String,
    /// Start or continue a conversation.
    pub mode: RunMode,
    /// Conversation to continue; only present for `resume`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Execution limits.
    #[serde(default)]
    pub constraints: Constraints,
}

impl Request {
    /// Snapshot the current cycle of `run` as a request.
    #[must_use]
    pub fn from_run(run: &Run) -> Self {
        let session_id = match run.mode {
            RunMode::Resume => run.session_id.clone(),
            RunMode::New => None,
        };
        Self {
            task_id: run.task_id.clone(),
            intent: run.intent.clone(),
            workspace_path: run.workspace_path.clone(),
            message: run.message.clone(),
            engine: run.engine.clone(),
            mode: run.mode,
            session_id,
            constraints: run.constraints.clone(),
        }
    }
}
