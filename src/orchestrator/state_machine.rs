//! Session state machine: the only writer of a run's lifecycle state.
//!
//! Every mutation loads the current record, checks it against
//! [`Run::can_transition_to`], merges the patch, and atomically rewrites the
//! record while holding the run's transition lock, which also excludes
//! other processes working on the same store.

use chrono::Utc;
use tracing::{debug, info};

use crate::models::{Request, Run, RunError, RunMode, RunResult, RunState};
use crate::persistence::RunStore;
use crate::{AppError, Result};

/// Fields merged into a run alongside a state change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunPatch {
    /// Process to attach when entering `running`.
    pub pid: Option<u32>,
    /// Backend conversation handle to record.
    pub session_id: Option<String>,
    /// Failure to record when entering `failed`.
    pub error: Option<RunError>,
}

impl RunPatch {
    /// Patch attaching `pid`.
    #[must_use]
    pub fn with_pid(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            ..Self::default()
        }
    }

    /// Patch recording a failure.
    #[must_use]
    pub fn with_error(error: RunError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Set the session id on this patch.
    #[must_use]
    pub fn session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Guards every lifecycle change of a run.
#[derive(Debug, Clone)]
pub struct StateMachine {
    store: RunStore,
}

impl StateMachine {
    /// Create a state machine over `store`.
    #[must_use]
    pub fn new(store: RunStore) -> Self {
        Self { store }
    }

    /// Move a run to `target`, merging `patch`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown run and
    /// `AppError::InvalidTransition` if the move is not in the allowed table;
    /// in both cases nothing is written.
    pub async fn transition(&self, run_id: &str, target: RunState, patch: RunPatch) -> Result<Run> {
        let _guard = self.store.lock_transitions(run_id).await?;
        self.transition_locked(run_id, target, patch).await
    }

    /// Move a running run to a terminal state and write its result under the
    /// same lock, so no concurrent finalizer can interleave.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if `target` is not terminal or the
    /// run is no longer `running`; the result is not written in that case.
    pub async fn finish(
        &self,
        run_id: &str,
        target: RunState,
        patch: RunPatch,
        result: &RunResult,
    ) -> Result<Run> {
        if !target.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "finish requires a terminal state, got {}",
                target.as_str()
            )));
        }
        let _guard = self.store.lock_transitions(run_id).await?;
        let run = self.transition_locked(run_id, target, patch).await?;
        self.store.write_result(run_id, result).await?;
        Ok(run)
    }

    /// Replace the process attached to a running run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the run is not `running`.
    pub async fn attach_pid(&self, run_id: &str, pid: u32) -> Result<Run> {
        let _guard = self.store.lock_transitions(run_id).await?;
        let mut run = self.store.get_status(run_id).await?;
        if run.state != RunState::Running {
            return Err(AppError::InvalidState(format!(
                "run {run_id} is {}, cannot attach pid {pid}",
                run.state.as_str()
            )));
        }
        run.pid = Some(pid);
        run.updated_at = Utc::now();
        self.store.save_run(&run).await?;
        debug!(run_id, pid, "backend pid attached");
        Ok(run)
    }

    /// Re-arm a terminal run with a follow-up message.
    ///
    /// Validates before writing anything, then publishes a `resume` request
    /// carrying the stored session, workspace, and engine, drops the stale
    /// claimed request, and resets the run to `created`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the run is not terminal or has
    /// no `session_id`; persisted state is left unchanged.
    pub async fn rearm(&self, run_id: &str, message: &str) -> Result<Run> {
        let _guard = self.store.lock_transitions(run_id).await?;
        let current = self.store.get_status(run_id).await?;
        check_transition(&current, RunState::Created)?;

        let mut run = current;
        run.mode = RunMode::Resume;
        message.clone_into(&mut run.message);
        run.state = RunState::Created;
        run.pid = None;
        run.owner_pid = None;
        run.error = None;
        run.updated_at = Utc::now();

        // Request first: a crash before the record flips leaves a terminal
        // run with an ignored request instead of a created run with none.
        self.store
            .publish_request(run_id, &Request::from_run(&run))
            .await?;
        self.store.remove_claimed_request(run_id).await?;
        self.store.save_run(&run).await?;

        info!(run_id, session_id = ?run.session_id, "run re-armed for resume");
        Ok(run)
    }

    async fn transition_locked(
        &self,
        run_id: &str,
        target: RunState,
        patch: RunPatch,
    ) -> Result<Run> {
        let mut run = self.store.get_status(run_id).await?;
        check_transition(&run, target)?;
        let from = run.state;

        match target {
            RunState::Running => {
                let owner = std::process::id();
                run.owner_pid = Some(owner);
                run.pid = Some(patch.pid.unwrap_or(owner));
            }
            RunState::Completed => {
                run.pid = None;
                run.owner_pid = None;
                run.error = None;
            }
            RunState::Failed => {
                run.pid = None;
                run.owner_pid = None;
                run.error = Some(
                    patch
                        .error
                        .unwrap_or_else(|| RunError::backend("run failed without a reason")),
                );
            }
            RunState::Created => {
                run.pid = None;
                run.owner_pid = None;
                run.error = None;
            }
        }
        if let Some(session_id) = patch.session_id {
            run.session_id = Some(session_id);
        }
        run.state = target;
        run.updated_at = Utc::now();

        self.store.save_run(&run).await?;
        debug!(
            run_id,
            from = from.as_str(),
            to = target.as_str(),
            "run state transition"
        );
        Ok(run)
    }
}

fn check_transition(run: &Run, target: RunState) -> Result<()> {
    if run.can_transition_to(target) {
        return Ok(());
    }
    if run.state.is_terminal() && target == RunState::Created {
        return Err(AppError::InvalidTransition(format!(
            "run {} has no session_id to resume",
            run.run_id
        )));
    }
    Err(AppError::InvalidTransition(format!(
        "run {}: {} -> {} is not allowed",
        run.run_id,
        run.state.as_str(),
        target.as_str()
    )))
}
