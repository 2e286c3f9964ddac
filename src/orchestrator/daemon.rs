//! Polling daemon that dispatches published requests to the task runner.
//!
//! Each tick lists the store and spawns a task runner for every `created`
//! run with a published request that is not already in flight, up to the
//! concurrency ceiling. The in-flight set is owned by the daemon; entries
//! are removed by a drop guard when the spawned task settles, whatever the
//! outcome.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::RunState;
use crate::persistence::RunStore;
use crate::{AppError, Result};

use super::task_runner::TaskRunner;

type InFlightSet = Arc<Mutex<HashSet<String>>>;

/// Removes a run from the in-flight set when dropped.
struct InFlightGuard {
    set: InFlightSet,
    run_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

/// Poll loop over a run store.
pub struct Daemon {
    store: RunStore,
    runner: Arc<TaskRunner>,
    poll_interval: Duration,
    max_concurrent: usize,
    in_flight: InFlightSet,
}

impl Daemon {
    /// Create a daemon. `max_concurrent` is clamped to at least one.
    #[must_use]
    pub fn new(
        store: RunStore,
        runner: Arc<TaskRunner>,
        poll_interval: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            runner,
            poll_interval,
            max_concurrent: max_concurrent.max(1),
            in_flight: Arc::default(),
        }
    }

    /// Snapshot of the run ids currently being processed, sorted.
    #[must_use]
    pub fn in_flight(&self) -> Vec<String> {
        snapshot(&self.in_flight)
    }

    /// Run one dispatch pass and return the ids handed to the task runner.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the store cannot be listed.
    pub async fn tick(&self) -> Result<Vec<String>> {
        let runs = self.store.list_runs().await?;
        let mut dispatched = Vec::new();

        for run in runs {
            if run.state != RunState::Created {
                continue;
            }
            if !self.store.has_pending_request(&run.run_id).await {
                continue;
            }

            let guard = {
                let mut set = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if set.len() >= self.max_concurrent {
                    debug!(limit = self.max_concurrent, "concurrency ceiling reached");
                    break;
                }
                if !set.insert(run.run_id.clone()) {
                    continue;
                }
                InFlightGuard {
                    set: Arc::clone(&self.in_flight),
                    run_id: run.run_id.clone(),
                }
            };

            let runner = Arc::clone(&self.runner);
            let run_id = run.run_id.clone();
            tokio::spawn(async move {
                let _guard = guard;
                match runner.process_run(&run_id).await {
                    Ok(result) => debug!(run_id, status = ?result.status, "run settled"),
                    Err(AppError::InvalidState(reason)) => {
                        debug!(run_id, %reason, "run not processed");
                    }
                    Err(err) => warn!(run_id, %err, "run processing failed"),
                }
            });
            dispatched.push(run.run_id);
        }

        if !dispatched.is_empty() {
            info!(count = dispatched.len(), "dispatched runs");
        }
        Ok(dispatched)
    }

    /// Start the poll loop on a background task.
    ///
    /// The loop ends when `cancel` fires or [`DaemonHandle::stop`] is called.
    /// Runs already dispatched keep going until they settle.
    #[must_use]
    pub fn spawn(self, cancel: CancellationToken) -> DaemonHandle {
        let in_flight = Arc::clone(&self.in_flight);
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let poll_interval_ms =
                u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX);
            info!(
                poll_interval_ms,
                max_concurrent = self.max_concurrent,
                "daemon started"
            );
            loop {
                tokio::select! {
                    () = loop_cancel.cancelled() => {
                        info!("daemon shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(err) = self.tick().await {
                            error!(%err, "daemon tick failed");
                        }
                    }
                }
            }
        });

        DaemonHandle {
            cancel,
            task,
            in_flight,
        }
    }
}

/// Control handle for a spawned [`Daemon`].
pub struct DaemonHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    in_flight: InFlightSet,
}

impl DaemonHandle {
    /// Snapshot of the run ids currently being processed, sorted.
    #[must_use]
    pub fn in_flight(&self) -> Vec<String> {
        snapshot(&self.in_flight)
    }

    /// Stop polling and wait for the loop to exit.
    ///
    /// In-flight runs are not cancelled.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            error!(%err, "daemon loop terminated abnormally");
        }
    }
}

fn snapshot(set: &InFlightSet) -> Vec<String> {
    let mut ids: Vec<String> = set
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .cloned()
        .collect();
    ids.sort();
    ids
}
