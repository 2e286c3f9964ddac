//! Terminal outcome of a processing attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error code for a backend call that exceeded its deadline.
pub const CODE_TIMEOUT: &str = "TIMEOUT";
/// Error code for a run whose process died while the daemon was down.
pub const CODE_ORPHANED: &str = "ORPHANED";
/// Error code for an explicit operator stop.
pub const CODE_TASK_STOPPED: &str = "TASK_STOPPED";
/// Error code synthesized when a backend fails without a structured error.
pub const CODE_BACKEND_ERROR: &str = "BACKEND_ERROR";
/// Error code for a backend process that could not be launched.
pub const CODE_SPAWN_FAILED: &str = "SPAWN_FAILED";

/// Terminal status recorded in `result.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Backend reported success.
    Completed,
    /// The attempt failed; see `error`.
    Failed,
}

/// Structured failure reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunError {
    /// Machine-readable code (`TIMEOUT`, `ORPHANED`, backend-defined, ...).
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Hint for the caller on whether a resume is worth attempting.
    #[serde(default)]
    pub retryable: bool,
}

impl RunError {
    /// Build an error with an arbitrary code.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Backend call exceeded `timeout_ms`.
    #[must_use]
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            CODE_TIMEOUT,
            format!("backend did not finish within {timeout_ms}ms"),
            true,
        )
    }

    /// Reconciler found the run's process dead after a restart.
    #[must_use]
    pub fn orphaned(pid: Option<u32>) -> Self {
        let message = pid.map_or_else(
            || "run was left running without a recorded process".to_owned(),
            |pid| format!("process {pid} is no longer alive; outcome unknown"),
        );
        Self::new(CODE_ORPHANED, message, false)
    }

    /// Operator stopped the run.
    #[must_use]
    pub fn stopped() -> Self {
        Self::new(CODE_TASK_STOPPED, "run stopped by operator", false)
    }

    /// Backend failed without providing its own error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(CODE_BACKEND_ERROR, message, false)
    }
}

/// Token accounting reported by a backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    /// Prompt-side tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion-side tokens.
    #[serde(default)]
    pub output_tokens: u64,
}

/// Persisted result record (`result.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResult {
    /// Terminal status.
    pub status: ResultStatus,
    /// Backend output text.
    #[serde(default)]
    pub output: String,
    /// Failure reason; only present when `status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// Token usage, if the backend reported any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    /// When the result was written.
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// Successful outcome.
    #[must_use]
    pub fn completed(output: String, token_usage: Option<TokenUsage>) -> Self {
        Self {
            status: ResultStatus::Completed,
            output,
            error: None,
            token_usage,
            finished_at: Utc::now(),
        }
    }

    /// Failed outcome.
    #[must_use]
    pub fn failed(output: String, error: RunError, token_usage: Option<TokenUsage>) -> Self {
        Self {
            status: ResultStatus::Failed,
            output,
            error: Some(error),
            token_usage,
            finished_at: Utc::now(),
        }
    }
}
