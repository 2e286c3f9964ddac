//! Generic command-line agent backend.
//!
//! Spawns the configured agent binary once per call with:
//! - `kill_on_drop(true)` so a call abandoned by the task runner (timeout)
//!   takes its process down with it.
//! - The message as the final argument and `AGENT_DISPATCH_SESSION_ID` in
//!   the environment.
//! - The workspace as working directory.
//!
//! The agent may print a JSON envelope as its last stdout line
//! (`{"session_id": ..., "output": ..., "error": ..., "token_usage": ...}`);
//! otherwise stdout is the output and the adapter-assigned session id stands.

use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{process, BackendFuture, BackendResponse, ExecutionBackend, PidReporter, SendOptions};
use crate::config::EngineConfig;
use crate::models::result::CODE_SPAWN_FAILED;
use crate::models::{Request, RunError, TokenUsage};
use crate::Result;

/// Environment variable carrying the session id to the agent process.
pub const SESSION_ENV_VAR: &str = "AGENT_DISPATCH_SESSION_ID";

const SESSION_PLACEHOLDER: &str = "{session_id}";
const STDERR_TAIL_CHARS: usize = 2000;

/// Trailing stdout line an agent may print to report structured results.
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<RunError>,
    #[serde(default)]
    token_usage: Option<TokenUsage>,
}

/// [`ExecutionBackend`] for any agent CLI described by an [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct CommandBackend {
    engine: EngineConfig,
}

impl CommandBackend {
    /// Wrap an engine configuration.
    #[must_use]
    pub fn new(engine: EngineConfig) -> Self {
        Self { engine }
    }

    fn resume_args(&self, session_id: &str) -> Vec<String> {
        let template = if self.engine.resume_args.is_empty() {
            &self.engine.args
        } else {
            &self.engine.resume_args
        };
        template
            .iter()
            .map(|arg| arg.replace(SESSION_PLACEHOLDER, session_id))
            .collect()
    }

    async fn invoke(
        &self,
        args: Vec<String>,
        message: &str,
        cwd: &Path,
        session_id: String,
        pids: PidReporter,
    ) -> Result<BackendResponse> {
        let mut cmd = Command::new(&self.engine.program);
        cmd.args(&args)
            .arg(message)
            .envs(&self.engine.env)
            .env(SESSION_ENV_VAR, &session_id)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(program = %self.engine.program, %err, "failed to spawn agent");
                return Ok(BackendResponse {
                    error: Some(RunError::new(
                        CODE_SPAWN_FAILED,
                        format!("failed to spawn {}: {err}", self.engine.program),
                        false,
                    )),
                    ..BackendResponse::default()
                });
            }
        };

        let pid = child.id();
        if let Some(pid) = pid {
            info!(pid, program = %self.engine.program, "agent process spawned");
            pids.report(pid);
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        debug!(
            ?pid,
            status = ?output.status,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "agent process exited"
        );

        let mut response = parse_output(&stdout, session_id);
        response.pid = pid;
        response.exit_code = output.status.code();

        if response.error.is_none() && !output.status.success() {
            response.error = Some(exit_error(output.status.code(), &stderr));
        }
        Ok(response)
    }
}

impl ExecutionBackend for CommandBackend {
    fn start<'a>(&'a self, request: &'a Request, pids: PidReporter) -> BackendFuture<'a> {
        Box::pin(async move {
            let session_id = Uuid::new_v4().to_string();
            self.invoke(
                self.engine.args.clone(),
                &request.message,
                &request.workspace_path,
                session_id,
                pids,
            )
            .await
        })
    }

    fn send<'a>(
        &'a self,
        session_id: &'a str,
        message: &'a str,
        options: SendOptions,
        pids: PidReporter,
    ) -> BackendFuture<'a> {
        Box::pin(async move {
            self.invoke(
                self.resume_args(session_id),
                message,
                &options.cwd,
                session_id.to_owned(),
                pids,
            )
            .await
        })
    }

    fn stop(
        &self,
        pid: u32,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { process::terminate(pid) })
    }
}

/// Split agent stdout into output text and an optional trailing envelope.
fn parse_output(stdout: &str, assigned_session: String) -> BackendResponse {
    let trimmed = stdout.trim_end();
    let (body, last_line) = match trimmed.rsplit_once('\n') {
        Some((body, last)) => (body, last),
        None => ("", trimmed),
    };

    let envelope = last_line
        .trim_start()
        .starts_with('{')
        .then(|| serde_json::from_str::<Envelope>(last_line).ok())
        .flatten();

    match envelope {
        Some(envelope) => BackendResponse {
            output: envelope.output.unwrap_or_else(|| body.to_owned()),
            session_id: Some(envelope.session_id.unwrap_or(assigned_session)),
            error: envelope.error,
            token_usage: envelope.token_usage,
            ..BackendResponse::default()
        },
        None => BackendResponse {
            output: stdout.to_owned(),
            session_id: Some(assigned_session),
            ..BackendResponse::default()
        },
    }
}

fn exit_error(code: Option<i32>, stderr: &str) -> RunError {
    let tail: String = {
        let chars: Vec<char> = stderr.trim().chars().collect();
        let start = chars.len().saturating_sub(STDERR_TAIL_CHARS);
        chars[start..].iter().collect()
    };
    match code {
        Some(code) => RunError::new(
            format!("EXIT_{code}"),
            if tail.is_empty() {
                format!("agent exited with code {code}")
            } else {
                tail
            },
            false,
        ),
        None => RunError::new("SIGNALED", "agent terminated by signal", false),
    }
}
