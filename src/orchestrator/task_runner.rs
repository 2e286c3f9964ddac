//! Task runner: drives one processing attempt of a run end to end.
//!
//! `created` → claim request → `running` → backend `start`/`send` raced
//! against the deadline → `completed` or `failed` with a persisted result.
//! Backend failures never escape as errors; they become failed results.
//! Errors returned from [`TaskRunner::process_run`] mean the attempt did not
//! own the run (not found, not `created`, lost the claim, or stopped
//! underneath it).

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, info_span, warn, Instrument};

use crate::audit::{self, EventLogger, RunEvent, RunEventType};
use crate::backend::{
    BackendRegistry, BackendResponse, ExecutionBackend, PidReporter, SendOptions,
};
use crate::models::{Request, RunError, RunMode, RunResult, RunState, TokenUsage};
use crate::persistence::RunStore;
use crate::{AppError, Result};

use super::state_machine::{RunPatch, StateMachine};

/// How a backend call ended.
enum CallOutcome {
    /// The call returned (successfully or not) before the deadline.
    Finished(Result<BackendResponse>),
    /// The deadline elapsed first.
    TimedOut(u64),
    /// The run left `running` while the call was in flight.
    Preempted(String),
}

/// Processes runs against the registered backends.
pub struct TaskRunner {
    store: RunStore,
    machine: StateMachine,
    backends: Arc<BackendRegistry>,
    events: Arc<dyn EventLogger>,
    default_timeout: Duration,
}

impl TaskRunner {
    /// Create a runner.
    #[must_use]
    pub fn new(
        store: RunStore,
        backends: Arc<BackendRegistry>,
        events: Arc<dyn EventLogger>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            machine: StateMachine::new(store.clone()),
            store,
            backends,
            events,
            default_timeout,
        }
    }

    /// Process the pending request of `run_id` once.
    ///
    /// Writes exactly one result and one terminal state when it owns the run.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound`: unknown run.
    /// - `AppError::InvalidState`: run is not `created`, or another runner
    ///   claimed the request first, or the run was stopped mid-call.
    /// - `AppError::InvalidTransition`: the run left `running` before the
    ///   result could be recorded.
    pub async fn process_run(&self, run_id: &str) -> Result<RunResult> {
        self.process(run_id)
            .instrument(info_span!("process_run", run_id))
            .await
    }

    async fn process(&self, run_id: &str) -> Result<RunResult> {
        let run = self.store.get_status(run_id).await?;
        if run.state != RunState::Created {
            return Err(AppError::InvalidState(format!(
                "run {run_id} is {}, expected created",
                run.state.as_str()
            )));
        }

        let request = self.store.claim_request(run_id).await?;
        audit::record(
            self.events.as_ref(),
            RunEvent::new(run_id, RunEventType::Claimed),
        );

        let running = self
            .machine
            .transition(run_id, RunState::Running, RunPatch::default())
            .await?;
        let mut started =
            RunEvent::new(run_id, RunEventType::Started).with_state(RunState::Running);
        if let Some(pid) = running.pid {
            started = started.with_pid(pid);
        }
        audit::record(self.events.as_ref(), started);
        info!(engine = %request.engine, mode = ?request.mode, "run started");

        let backend = match self.backends.get(&request.engine) {
            Ok(backend) => backend,
            Err(err) => {
                let error = RunError::new("UNKNOWN_ENGINE", err.to_string(), false);
                return self.fail(run_id, String::new(), error, None, None).await;
            }
        };

        let timeout_ms = request.constraints.timeout_ms.unwrap_or_else(|| {
            u64::try_from(self.default_timeout.as_millis()).unwrap_or(u64::MAX)
        });

        match self.call(run_id, backend.as_ref(), &request, timeout_ms).await {
            CallOutcome::Finished(Ok(response)) => self.settle(run_id, &request, response).await,
            CallOutcome::Finished(Err(err)) => {
                warn!(%err, "backend call failed");
                self.fail(run_id, String::new(), RunError::backend(err.to_string()), None, None)
                    .await
            }
            CallOutcome::TimedOut(ms) => {
                warn!(timeout_ms = ms, "backend call timed out");
                audit::record(
                    self.events.as_ref(),
                    RunEvent::new(run_id, RunEventType::TimedOut)
                        .with_detail(format!("deadline {ms}ms")),
                );
                self.fail(run_id, String::new(), RunError::timeout(ms), None, None)
                    .await
            }
            CallOutcome::Preempted(reason) => {
                info!(%reason, "run left running during backend call");
                Err(AppError::InvalidState(reason))
            }
        }
    }

    /// Run the backend call, attaching reported pids and enforcing the deadline.
    ///
    /// An abandoned call is dropped (its process is killed on drop) and the
    /// backend is asked to stop the last reported pid.
    async fn call(
        &self,
        run_id: &str,
        backend: &dyn ExecutionBackend,
        request: &Request,
        timeout_ms: u64,
    ) -> CallOutcome {
        let (reporter, mut pid_rx) = PidReporter::channel();
        let mut call = match (request.mode, request.session_id.as_deref()) {
            (RunMode::Resume, Some(session_id)) => backend.send(
                session_id,
                &request.message,
                SendOptions {
                    timeout_ms,
                    cwd: request.workspace_path.clone(),
                },
                reporter,
            ),
            (RunMode::Resume, None) => {
                return CallOutcome::Finished(Err(AppError::InvalidState(
                    "resume request carries no session_id".into(),
                )))
            }
            (RunMode::New, _) => backend.start(request, reporter),
        };

        let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
        tokio::pin!(deadline);
        let mut last_pid = None;

        let outcome = loop {
            tokio::select! {
                result = &mut call => break CallOutcome::Finished(result),
                Some(pid) = pid_rx.recv() => {
                    last_pid = Some(pid);
                    match self.machine.attach_pid(run_id, pid).await {
                        Ok(_) => audit::record(
                            self.events.as_ref(),
                            RunEvent::new(run_id, RunEventType::PidAttached).with_pid(pid),
                        ),
                        Err(AppError::InvalidState(reason)) => {
                            break CallOutcome::Preempted(reason);
                        }
                        Err(err) => warn!(%err, pid, "failed to record backend pid"),
                    }
                }
                () = &mut deadline => break CallOutcome::TimedOut(timeout_ms),
            }
        };

        if !matches!(outcome, CallOutcome::Finished(_)) {
            drop(call);
            if let Some(pid) = last_pid {
                if let Err(err) = backend.stop(pid).await {
                    warn!(%err, pid, "failed to stop abandoned backend process");
                }
            }
        }
        outcome
    }

    /// Turn a returned backend response into the terminal state and result.
    async fn settle(
        &self,
        run_id: &str,
        request: &Request,
        response: BackendResponse,
    ) -> Result<RunResult> {
        if let Err(err) = self.store.write_output_log(run_id, &response.output).await {
            warn!(%err, "failed to write backend output log");
        }

        // A resumed conversation keeps the session it was resumed in.
        let session_id = match (request.mode, request.session_id.clone()) {
            (RunMode::Resume, Some(stored)) => {
                if let Some(reported) = response.session_id.as_deref().filter(|r| *r != stored.as_str()) {
                    warn!(
                        stored = %stored,
                        reported,
                        "backend reported a different session on resume, keeping the stored one"
                    );
                }
                Some(stored)
            }
            _ => response.session_id.clone(),
        };

        if let Some(error) = response.error {
            return self
                .fail(run_id, response.output, error, response.token_usage, session_id)
                .await;
        }
        if session_id.is_none() {
            let error = RunError::backend("backend reported success without a session id");
            return self
                .fail(run_id, response.output, error, response.token_usage, None)
                .await;
        }

        let result = RunResult::completed(response.output, response.token_usage);
        self.machine
            .finish(
                run_id,
                RunState::Completed,
                RunPatch::default().session(session_id),
                &result,
            )
            .await?;
        audit::record(
            self.events.as_ref(),
            RunEvent::new(run_id, RunEventType::Completed).with_state(RunState::Completed),
        );
        info!(exit_code = ?response.exit_code, "run completed");
        Ok(result)
    }

    async fn fail(
        &self,
        run_id: &str,
        output: String,
        error: RunError,
        token_usage: Option<TokenUsage>,
        session_id: Option<String>,
    ) -> Result<RunResult> {
        let result = RunResult::failed(output, error.clone(), token_usage);
        self.machine
            .finish(
                run_id,
                RunState::Failed,
                RunPatch::with_error(error.clone()).session(session_id),
                &result,
            )
            .await?;
        audit::record(
            self.events.as_ref(),
            RunEvent::new(run_id, RunEventType::Failed)
                .with_state(RunState::Failed)
                .with_error_code(error.code.clone())
                .with_detail(error.message.clone()),
        );
        info!(code = %error.code, retryable = error.retryable, "run failed");
        Ok(result)
    }
}
