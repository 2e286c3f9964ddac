//! Execution backend abstraction.
//!
//! The [`ExecutionBackend`] trait decouples the task runner from the agent
//! CLI that does the actual work. Each engine named in a run maps to one
//! backend in the [`BackendRegistry`]; no state is shared between backends.

pub mod command;
pub mod process;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::DispatchConfig;
use crate::models::{Request, RunError, TokenUsage};
use crate::{AppError, Result};

pub use command::CommandBackend;

/// Boxed future returned by backend calls.
pub type BackendFuture<'a> = Pin<Box<dyn Future<Output = Result<BackendResponse>> + Send + 'a>>;

/// Outcome of a single backend call.
///
/// A present `error` is authoritative regardless of `exit_code`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendResponse {
    /// Text produced by the agent.
    pub output: String,
    /// Process that served the call.
    pub pid: Option<u32>,
    /// Process exit code, if it exited normally.
    pub exit_code: Option<i32>,
    /// Conversation handle for follow-up messages.
    pub session_id: Option<String>,
    /// Structured failure reported by the agent.
    pub error: Option<RunError>,
    /// Token accounting, if reported.
    pub token_usage: Option<TokenUsage>,
}

/// Options for continuing a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    /// Deadline the caller enforces for this call.
    pub timeout_ms: u64,
    /// Working directory for the agent process.
    pub cwd: PathBuf,
}

/// Channel through which a backend announces its process id as soon as the
/// process is spawned, before the call completes.
#[derive(Debug, Clone)]
pub struct PidReporter {
    tx: Option<mpsc::UnboundedSender<u32>>,
}

impl PidReporter {
    /// Create a reporter and the receiver the caller listens on.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<u32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter nobody listens to.
    #[must_use]
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Announce the process id. Silently ignored when nobody listens.
    pub fn report(&self, pid: u32) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(pid);
        }
    }
}

/// Uniform lifecycle operations over one kind of external agent.
pub trait ExecutionBackend: Send + Sync {
    /// Begin a fresh conversation for `request`.
    ///
    /// A successful response must carry a `session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the call could not be made at all; agent
    /// failures are reported through [`BackendResponse::error`].
    fn start<'a>(&'a self, request: &'a Request, pids: PidReporter) -> BackendFuture<'a>;

    /// Continue the conversation identified by `session_id`.
    ///
    /// # Errors
    ///
    /// Same contract as [`start`](Self::start).
    fn send<'a>(
        &'a self,
        session_id: &'a str,
        message: &'a str,
        options: SendOptions,
        pids: PidReporter,
    ) -> BackendFuture<'a>;

    /// Best-effort termination of the process serving the current call.
    ///
    /// # Errors
    ///
    /// Returns an error if the termination signal could not be delivered.
    fn stop(&self, pid: u32) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Lookup table from engine name to backend.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn ExecutionBackend>>,
}

impl BackendRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry with one [`CommandBackend`] per configured engine.
    #[must_use]
    pub fn from_config(config: &DispatchConfig) -> Self {
        let mut registry = Self::new();
        for (name, engine) in &config.engines {
            registry.register(name.clone(), Arc::new(CommandBackend::new(engine.clone())));
        }
        registry
    }

    /// Register (or replace) the backend for `engine`.
    pub fn register(&mut self, engine: impl Into<String>, backend: Arc<dyn ExecutionBackend>) {
        self.backends.insert(engine.into(), backend);
    }

    /// Resolve the backend for `engine`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownEngine` if nothing is registered under `engine`.
    pub fn get(&self, engine: &str) -> Result<Arc<dyn ExecutionBackend>> {
        self.backends
            .get(engine)
            .cloned()
            .ok_or_else(|| AppError::UnknownEngine(engine.to_owned()))
    }

    /// Registered engine names, sorted.
    #[must_use]
    pub fn engines(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("engines", &self.engines())
            .finish()
    }
}
