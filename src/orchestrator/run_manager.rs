//! Operator-facing run operations: submit, inspect, resume, and stop.
//!
//! These are the calls behind the command-line surface. Processing itself
//! belongs to the daemon and task runner; this module only creates runs,
//! re-arms finished ones, and forces running ones to a stop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::audit::{self, JsonlEventWriter, RunEvent, RunEventType};
use crate::backend::{process, BackendRegistry};
use crate::models::{Run, RunError, RunResult, RunSpec, RunState};
use crate::persistence::RunStore;
use crate::{AppError, Result};

use super::state_machine::{RunPatch, StateMachine};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A run record together with its latest result.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunStatus {
    /// Persisted run record.
    pub run: Run,
    /// Latest result, if any attempt has finished.
    pub result: Option<RunResult>,
}

/// Lifecycle events and raw backend output of a run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunLogs {
    /// Lifecycle events, oldest first.
    pub events: Vec<RunEvent>,
    /// Raw output of the latest backend call.
    pub output: Option<String>,
}

/// Entry point for operator commands against a run store.
pub struct RunManager {
    store: RunStore,
    machine: StateMachine,
    backends: Arc<BackendRegistry>,
    events: Arc<JsonlEventWriter>,
    stop_grace: Duration,
}

impl RunManager {
    /// Create a manager.
    #[must_use]
    pub fn new(
        store: RunStore,
        backends: Arc<BackendRegistry>,
        events: Arc<JsonlEventWriter>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            machine: StateMachine::new(store.clone()),
            store,
            backends,
            events,
            stop_grace,
        }
    }

    /// Create a run and publish its first request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` for an unusable submission, or
    /// `AppError::Io` if the run cannot be persisted.
    pub async fn submit(&self, spec: RunSpec) -> Result<String> {
        let engine = spec.engine.clone();
        let run_id = self.store.create_run(spec).await?;
        audit::record(
            self.events.as_ref(),
            RunEvent::new(run_id.as_str(), RunEventType::Submitted)
                .with_state(RunState::Created)
                .with_detail(format!("engine {engine}")),
        );
        info!(run_id, engine, "run submitted");
        Ok(run_id)
    }

    /// Load a run and its latest result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown run.
    pub async fn status(&self, run_id: &str) -> Result<RunStatus> {
        let run = self.store.get_status(run_id).await?;
        let result = self.store.load_result(run_id).await?;
        Ok(RunStatus { run, result })
    }

    /// All runs, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the store cannot be listed.
    pub async fn list(&self) -> Result<Vec<Run>> {
        self.store.list_runs().await
    }

    /// Re-arm a finished run with a follow-up message in the same backend
    /// session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown run and
    /// `AppError::InvalidTransition` if the run is not terminal or has no
    /// `session_id`; nothing is written in either case.
    pub async fn resume(&self, run_id: &str, message: &str) -> Result<Run> {
        let run = self.machine.rearm(run_id, message).await?;
        let mut event = RunEvent::new(run_id, RunEventType::Resumed).with_state(RunState::Created);
        if let Some(session_id) = &run.session_id {
            event = event.with_detail(format!("session {session_id}"));
        }
        audit::record(self.events.as_ref(), event);
        Ok(run)
    }

    /// Stop a running run.
    ///
    /// The run is finalized as `failed` with a non-retryable `TASK_STOPPED`
    /// result first, so a task runner still holding the call cannot record a
    /// different outcome. The attached backend process then gets a
    /// termination request and, if it outlives the grace window, a forced
    /// kill.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown run and
    /// `AppError::InvalidState` if the run is not `running`.
    pub async fn stop(&self, run_id: &str) -> Result<RunResult> {
        self.stop_run(run_id)
            .instrument(info_span!("stop_run", run_id))
            .await
    }

    async fn stop_run(&self, run_id: &str) -> Result<RunResult> {
        let run = self.store.get_status(run_id).await?;
        if run.state != RunState::Running {
            return Err(AppError::InvalidState(format!(
                "run {run_id} is {}, only running runs can be stopped",
                run.state.as_str()
            )));
        }

        let error = RunError::stopped();
        let result = RunResult::failed(String::new(), error.clone(), None);
        self.machine
            .finish(
                run_id,
                RunState::Failed,
                RunPatch::with_error(error.clone()),
                &result,
            )
            .await
            .map_err(|err| match err {
                AppError::InvalidTransition(reason) => AppError::InvalidState(reason),
                other => other,
            })?;

        // Until the backend reports its own process, `pid` is the claiming
        // daemon; that one must never be signalled.
        let target = run.pid.filter(|pid| Some(*pid) != run.owner_pid);
        let mut event = RunEvent::new(run_id, RunEventType::Stopped)
            .with_state(RunState::Failed)
            .with_error_code(error.code.clone());
        if let Some(pid) = target {
            event = event.with_pid(pid);
            let detail = self.terminate(&run.engine, pid).await;
            event = event.with_detail(detail);
        }
        audit::record(self.events.as_ref(), event);

        info!(pid = ?target, "run stopped");
        Ok(result)
    }

    /// Ask the backend to stop `pid`, then force-kill after the grace window.
    async fn terminate(&self, engine: &str, pid: u32) -> String {
        let requested = match self.backends.get(engine) {
            Ok(backend) => backend.stop(pid).await,
            Err(_) => process::terminate(pid),
        };
        if let Err(err) = requested {
            warn!(%err, pid, "termination request failed");
        }

        let deadline = Instant::now() + self.stop_grace;
        while process::is_alive(pid) {
            if Instant::now() >= deadline {
                warn!(pid, "process outlived stop grace window, killing");
                if let Err(err) = process::force_kill(pid) {
                    warn!(%err, pid, "forced kill failed");
                }
                return "force-killed after grace window".into();
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        "terminated".into()
    }

    /// Lifecycle events and latest backend output of a run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown run.
    pub async fn logs(&self, run_id: &str) -> Result<RunLogs> {
        self.store.get_status(run_id).await?;
        let events = self.events.read_events(run_id)?;
        let output = self.store.read_output_log(run_id).await?;
        Ok(RunLogs { events, output })
    }
}
