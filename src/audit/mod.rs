//! Structured lifecycle event logging for runs.
//!
//! Provides the [`EventLogger`] trait and associated types. The primary
//! implementation, [`JsonlEventWriter`], appends JSONL records to
//! `<run_dir>/logs/events.jsonl` so operators can follow a run's history
//! next to its record.

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::RunState;

/// Event type classification for run log entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    /// Run submitted and first request published.
    Submitted,
    /// Task runner claimed the published request.
    Claimed,
    /// Run moved to `running`.
    Started,
    /// Backend process id attached to the running run.
    PidAttached,
    /// Backend reported success.
    Completed,
    /// Backend reported a failure.
    Failed,
    /// Backend exceeded its deadline.
    TimedOut,
    /// Terminal run re-armed with a follow-up request.
    Resumed,
    /// Operator stopped the run.
    Stopped,
    /// Reconciler failed a run whose process died.
    Orphaned,
}

/// A structured record of a run lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunEvent {
    /// ISO 8601 timestamp with timezone.
    pub timestamp: DateTime<Utc>,
    /// Run the event belongs to.
    pub run_id: String,
    /// Event classification.
    pub event_type: RunEventType,
    /// Run state after the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RunState>,
    /// Process id involved in the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Result error code (for failures).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Free-form detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RunEvent {
    /// Construct a minimal event for the given run.
    #[must_use]
    pub fn new(run_id: impl Into<String>, event_type: RunEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: run_id.into(),
            event_type,
            state: None,
            pid: None,
            error_code: None,
            detail: None,
        }
    }

    /// Set the resulting run state.
    #[must_use]
    pub fn with_state(mut self, state: RunState) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the process id.
    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Set the result error code.
    #[must_use]
    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// Set the free-form detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Writes run lifecycle events to a persistent store.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait EventLogger: Send + Sync {
    /// Record a single event.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn log_event(&self, event: RunEvent) -> crate::Result<()>;
}

/// Record `event`, downgrading failures to a warning.
///
/// The event log is for operators; a failed write never fails the run.
pub fn record(logger: &dyn EventLogger, event: RunEvent) {
    let run_id = event.run_id.clone();
    if let Err(err) = logger.log_event(event) {
        tracing::warn!(%err, run_id, "failed to append run event");
    }
}

pub use writer::JsonlEventWriter;
