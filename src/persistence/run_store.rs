//! File-backed run store.
//!
//! Layout under `<root>/runs/<run_id>/`:
//!
//! - `session.json`: the [`Run`] record
//! - `request.json`: published pending work
//! - `request.claimed.json`: the request after a task runner took it
//! - `result.json`: the latest [`RunResult`]
//! - `session.lock`: advisory lock held across a state transition
//! - `logs/`, `context/`, `artifacts/`: material produced around the backend
//!
//! Every write goes through [`atomic`](super::atomic). The only other
//! mutation is the `request.json -> request.claimed.json` rename, which is
//! the claim primitive for task runners.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::models::{Request, Run, RunMode, RunResult, RunSpec};
use crate::{AppError, Result};

use super::atomic;

const RUNS_DIR: &str = "runs";
const SESSION_FILE: &str = "session.json";
const REQUEST_FILE: &str = "request.json";
const CLAIMED_REQUEST_FILE: &str = "request.claimed.json";
const RESULT_FILE: &str = "result.json";
const OUTPUT_LOG_FILE: &str = "output.log";
const LOCK_FILE: &str = "session.lock";

/// Subdirectory holding the event log and raw backend output.
pub const LOGS_DIR: &str = "logs";
/// Subdirectory for context material handed to the backend.
pub const CONTEXT_DIR: &str = "context";
/// Subdirectory for artifacts produced by the backend.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Durable store of runs rooted at a directory.
///
/// Clones share an in-process transition lock. Each transition also holds
/// an exclusive `flock` on the run's `session.lock`, so a daemon and a CLI
/// invocation working on the same run never interleave their
/// read-check-write cycles.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
    transition_lock: Arc<Mutex<()>>,
}

impl RunStore {
    /// Create a store rooted at `root`. Directories are created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            transition_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory containing one subdirectory per run.
    #[must_use]
    pub fn runs_dir(&self) -> PathBuf {
        self.root.join(RUNS_DIR)
    }

    /// Directory of a single run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `run_id` cannot name a run directory.
    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.runs_dir().join(run_id))
    }

    /// Persist a new run in `created` state and publish its first request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the submission asks to resume without a
    /// `session_id`, or `AppError::Io` if the run cannot be written.
    pub async fn create_run(&self, spec: RunSpec) -> Result<String> {
        if spec.engine.trim().is_empty() {
            return Err(AppError::InvalidState("engine must not be empty".into()));
        }
        if spec.mode == RunMode::Resume && spec.session_id.is_none() {
            return Err(AppError::InvalidState(
                "resume submission requires a session_id".into(),
            ));
        }

        let run = Run::new(spec);
        let dir = self.run_dir(&run.run_id)?;
        for sub in [LOGS_DIR, CONTEXT_DIR, ARTIFACTS_DIR] {
            tokio::fs::create_dir_all(dir.join(sub)).await.map_err(|err| {
                AppError::Io(format!("failed to create run directory {}: {err}", dir.display()))
            })?;
        }

        // The record lands before the request so the daemon never sees work
        // without a run to attach it to.
        self.save_run(&run).await?;
        self.publish_request(&run.run_id, &Request::from_run(&run))
            .await?;

        debug!(run_id = %run.run_id, engine = %run.engine, "run created");
        Ok(run.run_id)
    }

    /// Load the persisted record of a run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the run does not exist, or
    /// `AppError::Serde` if the record is corrupt.
    pub async fn get_status(&self, run_id: &str) -> Result<Run> {
        let path = self.run_dir(run_id)?.join(SESSION_FILE);
        read_json(&path)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("run {run_id} not found")))
    }

    /// Snapshot every run in the store, ordered by `run_id`.
    ///
    /// Directories without a readable record (a submission still in flight,
    /// or foreign files) are skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the runs directory cannot be listed.
    pub async fn list_runs(&self) -> Result<Vec<Run>> {
        let runs_dir = self.runs_dir();
        let mut entries = match tokio::fs::read_dir(&runs_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::Io(format!(
                    "failed to list {}: {err}",
                    runs_dir.display()
                )))
            }
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(run_id) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match self.get_status(&run_id).await {
                Ok(run) => runs.push(run),
                Err(AppError::NotFound(_)) => {
                    debug!(run_id, "skipping run directory without a record");
                }
                Err(err) => warn!(run_id, %err, "skipping unreadable run record"),
            }
        }

        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }

    /// Atomically rewrite a run record.
    ///
    /// Only the state machine and run creation call this; everything else
    /// goes through [`StateMachine`](crate::orchestrator::state_machine::StateMachine).
    pub(crate) async fn save_run(&self, run: &Run) -> Result<()> {
        let path = self.run_dir(&run.run_id)?.join(SESSION_FILE);
        atomic::write_json(&path, run).await
    }

    /// Acquire the transition lock of a run, in this process and on disk.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the run directory does not exist, or
    /// `AppError::Io` if the lock file cannot be opened or locked.
    pub(crate) async fn lock_transitions(&self, run_id: &str) -> Result<TransitionGuard> {
        let path = self.run_dir(run_id)?.join(LOCK_FILE);
        let local = Arc::clone(&self.transition_lock).lock_owned().await;
        let owned_id = run_id.to_owned();
        let file = tokio::task::spawn_blocking(move || lock_run_file(&path, &owned_id))
            .await
            .map_err(|err| AppError::Io(format!("run lock task failed: {err}")))??;
        Ok(TransitionGuard {
            file,
            _local: local,
        })
    }

    /// Publish `request` as the pending work of a run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the request cannot be written.
    pub async fn publish_request(&self, run_id: &str, request: &Request) -> Result<()> {
        let path = self.run_dir(run_id)?.join(REQUEST_FILE);
        atomic::write_json(&path, request).await
    }

    /// Whether a published, unclaimed request exists for the run.
    pub async fn has_pending_request(&self, run_id: &str) -> bool {
        match self.run_dir(run_id) {
            Ok(dir) => tokio::fs::try_exists(dir.join(REQUEST_FILE))
                .await
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Load the published request without claiming it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no request is published.
    pub async fn load_request(&self, run_id: &str) -> Result<Request> {
        let path = self.run_dir(run_id)?.join(REQUEST_FILE);
        read_json(&path)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("run {run_id} has no pending request")))
    }

    /// Claim the published request by renaming it to the claimed marker.
    ///
    /// Exactly one concurrent caller wins the rename.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if there is no published request
    /// (never submitted, or already claimed).
    pub async fn claim_request(&self, run_id: &str) -> Result<Request> {
        let dir = self.run_dir(run_id)?;
        let claimed = dir.join(CLAIMED_REQUEST_FILE);
        match tokio::fs::rename(dir.join(REQUEST_FILE), &claimed).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(AppError::InvalidState(format!(
                    "run {run_id} has no unclaimed request"
                )));
            }
            Err(err) => {
                return Err(AppError::Io(format!(
                    "failed to claim request for run {run_id}: {err}"
                )))
            }
        }
        read_json(&claimed)
            .await?
            .ok_or_else(|| AppError::Io(format!("claimed request for run {run_id} vanished")))
    }

    /// Whether a claimed request marker exists for the run.
    pub async fn has_claimed_request(&self, run_id: &str) -> bool {
        match self.run_dir(run_id) {
            Ok(dir) => tokio::fs::try_exists(dir.join(CLAIMED_REQUEST_FILE))
                .await
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Load the claimed request of a run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the run has no claimed request.
    pub async fn claimed_request(&self, run_id: &str) -> Result<Request> {
        let path = self.run_dir(run_id)?.join(CLAIMED_REQUEST_FILE);
        read_json(&path)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("run {run_id} has no claimed request")))
    }

    /// Remove the claimed request marker, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file exists but cannot be removed.
    pub async fn remove_claimed_request(&self, run_id: &str) -> Result<()> {
        let path = self.run_dir(run_id)?.join(CLAIMED_REQUEST_FILE);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Io(format!(
                "failed to remove {}: {err}",
                path.display()
            ))),
        }
    }

    /// Atomically write the result of a processing attempt.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the result cannot be written.
    pub async fn write_result(&self, run_id: &str, result: &RunResult) -> Result<()> {
        let path = self.run_dir(run_id)?.join(RESULT_FILE);
        atomic::write_json(&path, result).await
    }

    /// Load the latest result, if one was written.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serde` if the result file is corrupt.
    pub async fn load_result(&self, run_id: &str) -> Result<Option<RunResult>> {
        let path = self.run_dir(run_id)?.join(RESULT_FILE);
        read_json(&path).await
    }

    /// Replace the raw backend output log of the latest attempt.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the log cannot be written.
    pub async fn write_output_log(&self, run_id: &str, output: &str) -> Result<()> {
        let path = self.run_dir(run_id)?.join(LOGS_DIR).join(OUTPUT_LOG_FILE);
        atomic::write_bytes(path, output.as_bytes().to_vec()).await
    }

    /// Read the raw backend output log, if present.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the log exists but cannot be read.
    pub async fn read_output_log(&self, run_id: &str) -> Result<Option<String>> {
        let path = self.run_dir(run_id)?.join(LOGS_DIR).join(OUTPUT_LOG_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::Io(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }
}

/// Exclusive hold on a run's lifecycle state; released on drop.
#[derive(Debug)]
pub(crate) struct TransitionGuard {
    file: File,
    _local: OwnedMutexGuard<()>,
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(%err, "failed to release run lock");
        }
    }
}

fn lock_run_file(path: &Path, run_id: &str) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound => AppError::NotFound(format!("run {run_id} not found")),
            _ => AppError::Io(format!("failed to open {}: {err}", path.display())),
        })?;
    file.lock_exclusive()
        .map_err(|err| AppError::Io(format!("failed to lock {}: {err}", path.display())))?;
    Ok(file)
}

/// Reject identifiers that would escape the runs directory.
fn validate_run_id(run_id: &str) -> Result<()> {
    let valid = !run_id.is_empty()
        && run_id != "."
        && run_id != ".."
        && !run_id.contains(['/', '\\', '\0'])
        && !run_id.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("invalid run id {run_id:?}")))
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(AppError::Io(format!(
                "failed to read {}: {err}",
                path.display()
            )))
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| AppError::Serde(format!("{}: {err}", path.display())))
}
