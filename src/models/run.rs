//! Run model and lifecycle helpers.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::result::RunError;

/// Lifecycle state for a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Submitted (or re-armed by resume) and waiting for a task runner.
    Created,
    /// Claimed by a task runner; a backend process is attached.
    Running,
    /// Backend reported success.
    Completed,
    /// Backend failure, timeout, explicit stop, or orphaned by a crash.
    Failed,
}

impl RunState {
    /// Whether no further automatic transition happens from this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Lowercase name as persisted on disk.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Whether the backend starts a fresh conversation or continues one.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Start a new backend conversation.
    #[default]
    New,
    /// Continue the conversation identified by `session_id`.
    Resume,
}

/// Execution limits attached to a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Constraints {
    /// Hard deadline for a single backend call, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Caller-supplied description of a run to submit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSpec {
    /// Caller-side task identifier.
    pub task_id: String,
    /// Free-form task category.
    pub intent: String,
    /// Filesystem root the backend operates in.
    pub workspace_path: PathBuf,
    /// Instruction text for the backend.
    pub message: String,
    /// Backend adapter name.
    pub engine: String,
    /// Start a new conversation or continue `session_id`.
    #[serde(default)]
    pub mode: RunMode,
    /// Existing backend session, required when `mode` is `resume`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Execution limits.
    #[serde(default)]
    pub constraints: Constraints,
}

/// Persisted run record (`session.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Run {
    /// Time-ordered unique identifier; immutable.
    pub run_id: String,
    /// Caller-side task identifier.
    pub task_id: String,
    /// Free-form task category.
    pub intent: String,
    /// Filesystem root the backend operates in.
    pub workspace_path: PathBuf,
    /// Instruction text of the current cycle.
    pub message: String,
    /// Backend adapter name.
    pub engine: String,
    /// Mode of the current cycle.
    pub mode: RunMode,
    /// Backend conversation handle, once reported.
    pub session_id: Option<String>,
    /// Current lifecycle state.
    pub state: RunState,
    /// OS process attached to the run; present only while `running`.
    pub pid: Option<u32>,
    /// Process that claimed the run; `pid` equals it until the backend
    /// reports its own process. Present only while `running`.
    #[serde(default)]
    pub owner_pid: Option<u32>,
    /// Execution limits.
    #[serde(default)]
    pub constraints: Constraints,
    /// Failure recorded by the last `running -> failed` transition.
    #[serde(default)]
    pub error: Option<RunError>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last state change timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Build a fresh `created` run from a submission with a new time-ordered id.
    #[must_use]
    pub fn new(spec: RunSpec) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::now_v7().to_string(),
            task_id: spec.task_id,
            intent: spec.intent,
            workspace_path: spec.workspace_path,
            message: spec.message,
            engine: spec.engine,
            mode: spec.mode,
            session_id: spec.session_id,
            state: RunState::Created,
            pid: None,
            owner_pid: None,
            constraints: spec.constraints,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Re-arming a terminal run additionally requires a `session_id`.
    #[must_use]
    pub fn can_transition_to(&self, next: RunState) -> bool {
        match (self.state, next) {
            (RunState::Created, RunState::Running)
            | (RunState::Running, RunState::Completed | RunState::Failed) => true,
            (RunState::Completed | RunState::Failed, RunState::Created) => {
                self.session_id.is_some()
            }
            _ => false,
        }
    }
}
