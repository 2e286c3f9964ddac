#![forbid(unsafe_code)]

//! `agent-dispatch`: run dispatcher binary.
//!
//! `daemon` reconciles the store and polls it for published requests until
//! SIGINT/SIGTERM. The remaining subcommands operate on the store directly
//! and print JSON to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use agent_dispatch::audit::{EventLogger, JsonlEventWriter};
use agent_dispatch::backend::BackendRegistry;
use agent_dispatch::models::{Constraints, RunMode, RunSpec};
use agent_dispatch::orchestrator::daemon::Daemon;
use agent_dispatch::orchestrator::reconciler::Reconciler;
use agent_dispatch::orchestrator::run_manager::RunManager;
use agent_dispatch::orchestrator::task_runner::TaskRunner;
use agent_dispatch::persistence::RunStore;
use agent_dispatch::{AppError, DispatchConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "agent-dispatch",
    about = "Dispatch coding tasks to agent CLIs",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile the store, then poll it for work until interrupted.
    Daemon,
    /// Create a run and publish its first request.
    Submit {
        /// Caller-side task identifier.
        #[arg(long)]
        task_id: String,
        /// Free-form task category.
        #[arg(long, default_value = "task")]
        intent: String,
        /// Workspace the agent operates in.
        #[arg(long)]
        workspace: PathBuf,
        /// Instruction text.
        #[arg(long)]
        message: String,
        /// Engine name from the configuration.
        #[arg(long)]
        engine: String,
        /// Continue an existing backend session instead of starting one.
        #[arg(long)]
        session_id: Option<String>,
        /// Deadline for the backend call, in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Show a run and its latest result.
    Status {
        /// Run identifier.
        run_id: String,
    },
    /// List all runs.
    List,
    /// Send a follow-up message to a finished run.
    Resume {
        /// Run identifier.
        run_id: String,
        /// Follow-up instruction text.
        message: String,
    },
    /// Stop a running run.
    Stop {
        /// Run identifier.
        run_id: String,
    },
    /// Show the lifecycle events and latest output of a run.
    Logs {
        /// Run identifier.
        run_id: String,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = DispatchConfig::load_from_path(&args.config)?;
    let store = RunStore::new(config.store_root.clone());
    let events = Arc::new(JsonlEventWriter::new(store.clone()));
    let backends = Arc::new(BackendRegistry::from_config(&config));
    let manager = RunManager::new(
        store.clone(),
        Arc::clone(&backends),
        Arc::clone(&events),
        config.stop_grace(),
    );

    match args.command {
        Command::Daemon => run_daemon(&config, store, backends, events).await,
        Command::Submit {
            task_id,
            intent,
            workspace,
            message,
            engine,
            session_id,
            timeout_ms,
        } => {
            let workspace_path = workspace
                .canonicalize()
                .map_err(|err| AppError::Config(format!("invalid workspace: {err}")))?;
            let mode = if session_id.is_some() {
                RunMode::Resume
            } else {
                RunMode::New
            };
            let run_id = manager
                .submit(RunSpec {
                    task_id,
                    intent,
                    workspace_path,
                    message,
                    engine,
                    mode,
                    session_id,
                    constraints: Constraints { timeout_ms },
                })
                .await?;
            print_json(&serde_json::json!({ "run_id": run_id }))
        }
        Command::Status { run_id } => print_json(&manager.status(&run_id).await?),
        Command::List => print_json(&manager.list().await?),
        Command::Resume { run_id, message } => {
            print_json(&manager.resume(&run_id, &message).await?)
        }
        Command::Stop { run_id } => print_json(&manager.stop(&run_id).await?),
        Command::Logs { run_id } => print_json(&manager.logs(&run_id).await?),
    }
}

async fn run_daemon(
    config: &DispatchConfig,
    store: RunStore,
    backends: Arc<BackendRegistry>,
    events: Arc<JsonlEventWriter>,
) -> Result<()> {
    let events: Arc<dyn EventLogger> = events;
    info!(
        store_root = %config.store_root.display(),
        engines = ?backends.engines(),
        "agent-dispatch daemon bootstrap"
    );

    // ── Repair state left by an unclean shutdown ────────
    let reconciler = Reconciler::new(store.clone(), Arc::clone(&events));
    let entries = reconciler.reconcile().await?;
    info!(count = entries.len(), "startup reconciliation finished");

    // ── Start polling ───────────────────────────────────
    let runner = Arc::new(TaskRunner::new(
        store.clone(),
        backends,
        events,
        std::time::Duration::from_millis(config.default_timeout_ms),
    ));
    let max_concurrent = usize::try_from(config.max_concurrent_runs).unwrap_or(usize::MAX);
    let daemon = Daemon::new(store, runner, config.poll_interval(), max_concurrent);
    let handle = daemon.spawn(CancellationToken::new());
    info!("daemon ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!(in_flight = ?handle.in_flight(), "shutdown signal received");
    handle.stop().await;
    info!("agent-dispatch shut down");

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
