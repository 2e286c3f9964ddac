//! Startup reconciliation of state left behind by an unclean shutdown.
//!
//! Runs once before the daemon starts polling:
//! - A `running` run whose recorded pid is dead (or missing) is failed with
//!   `ORPHANED`, non-retryable, since the attempt's outcome is unknown.
//! - A `running` run whose pid is alive is left alone. A recorded pid equal
//!   to this process is a leftover claim of an earlier daemon that held the
//!   same pid, and counts as dead.
//! - A `created` run whose request was claimed but never moved to `running`
//!   gets its request re-published so the daemon picks it up again.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::audit::{self, EventLogger, RunEvent, RunEventType};
use crate::backend::process;
use crate::models::{Run, RunError, RunResult, RunState};
use crate::persistence::RunStore;
use crate::Result;

use super::state_machine::{RunPatch, StateMachine};

/// What reconciliation did to a run.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    /// Failed with `ORPHANED`.
    Orphaned,
    /// Claimed request returned to the published state.
    Republished,
    /// Left untouched because its process is alive.
    Skipped,
}

/// One reconciliation decision, for operator visibility.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReconcileEntry {
    /// Affected run.
    pub run_id: String,
    /// Action taken.
    pub action: ReconcileAction,
    /// Human-readable reason.
    pub detail: String,
}

/// Repairs runs stranded by a crashed daemon.
pub struct Reconciler {
    store: RunStore,
    machine: StateMachine,
    events: Arc<dyn EventLogger>,
}

impl Reconciler {
    /// Create a reconciler over `store`.
    #[must_use]
    pub fn new(store: RunStore, events: Arc<dyn EventLogger>) -> Self {
        Self {
            machine: StateMachine::new(store.clone()),
            store,
            events,
        }
    }

    /// Scan the store once and repair stranded runs.
    ///
    /// Failures on individual runs are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the store cannot be listed.
    pub async fn reconcile(&self) -> Result<Vec<ReconcileEntry>> {
        self.reconcile_all()
            .instrument(info_span!("reconcile"))
            .await
    }

    async fn reconcile_all(&self) -> Result<Vec<ReconcileEntry>> {
        let runs = self.store.list_runs().await?;
        let mut entries = Vec::new();

        for run in runs {
            let entry = match run.state {
                RunState::Running => self.reconcile_running(&run).await,
                RunState::Created => self.reconcile_created(&run).await,
                RunState::Completed | RunState::Failed => continue,
            };
            match entry {
                Ok(Some(entry)) => {
                    info!(
                        run_id = %entry.run_id,
                        action = ?entry.action,
                        detail = %entry.detail,
                        "reconciled run"
                    );
                    entries.push(entry);
                }
                Ok(None) => {}
                Err(err) => warn!(run_id = %run.run_id, %err, "failed to reconcile run"),
            }
        }

        info!(count = entries.len(), "reconciliation complete");
        Ok(entries)
    }

    async fn reconcile_running(&self, run: &Run) -> Result<Option<ReconcileEntry>> {
        if let Some(pid) = run.pid.filter(|pid| outlives_restart(*pid)) {
            return Ok(Some(ReconcileEntry {
                run_id: run.run_id.clone(),
                action: ReconcileAction::Skipped,
                detail: format!("process {pid} is still alive"),
            }));
        }

        let error = RunError::orphaned(run.pid);
        let result = RunResult::failed(String::new(), error.clone(), None);
        self.machine
            .finish(
                &run.run_id,
                RunState::Failed,
                RunPatch::with_error(error.clone()),
                &result,
            )
            .await?;

        let mut event = RunEvent::new(run.run_id.clone(), RunEventType::Orphaned)
            .with_state(RunState::Failed)
            .with_error_code(error.code.clone())
            .with_detail(error.message.clone());
        if let Some(pid) = run.pid {
            event = event.with_pid(pid);
        }
        audit::record(self.events.as_ref(), event);

        Ok(Some(ReconcileEntry {
            run_id: run.run_id.clone(),
            action: ReconcileAction::Orphaned,
            detail: error.message,
        }))
    }

    async fn reconcile_created(&self, run: &Run) -> Result<Option<ReconcileEntry>> {
        if self.store.has_pending_request(&run.run_id).await
            || !self.store.has_claimed_request(&run.run_id).await
        {
            return Ok(None);
        }

        let request = self.store.claimed_request(&run.run_id).await?;
        self.store.publish_request(&run.run_id, &request).await?;
        self.store.remove_claimed_request(&run.run_id).await?;

        Ok(Some(ReconcileEntry {
            run_id: run.run_id.clone(),
            action: ReconcileAction::Republished,
            detail: "claimed request was never started; published again".into(),
        }))
    }
}

/// Whether `pid` can still be working on a run recorded before this daemon
/// started. Nothing has been claimed by this process yet, so its own pid
/// only matches through reuse.
fn outlives_restart(pid: u32) -> bool {
    pid != std::process::id() && process::is_alive(pid)
}
