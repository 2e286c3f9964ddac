//! Integration tests for `TaskRunner::process_run`.
//!
//! Validates:
//! - A new run completes with the backend session recorded
//! - Deadline expiry fails the run with a retryable `TIMEOUT`
//! - Backend errors keep their `retryable` flag verbatim
//! - Concurrent attempts on one run produce exactly one terminal write
//! - Re-processing a terminal run fails fast without a backend call

use std::time::{Duration, Instant};

use agent_dispatch::audit::RunEventType;
use agent_dispatch::backend::BackendResponse;
use agent_dispatch::models::{Constraints, ResultStatus, RunError, RunSpec, RunState};
use agent_dispatch::AppError;

use super::test_helpers::{CallKind, Harness, Script};

#[tokio::test]
async fn new_run_completes_with_backend_session() {
    let h = Harness::new();
    h.backend.push(Script::success("sess-123", "all done"));
    let run_id = h.submit("Initial task").await;

    let result = h.runner.process_run(&run_id).await.expect("processed");

    assert_eq!(result.status, ResultStatus::Completed);
    assert_eq!(result.output, "all done");
    assert!(result.error.is_none());
    assert_eq!(result.token_usage.map(|u| u.output_tokens), Some(20));

    let run = h.store.get_status(&run_id).await.expect("status");
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.session_id.as_deref(), Some("sess-123"));
    assert!(run.pid.is_none(), "pid is only set while running");
    assert!(run.error.is_none());

    let stored = h.store.load_result(&run_id).await.expect("load").expect("result");
    assert_eq!(stored, result);
    assert_eq!(
        h.store.read_output_log(&run_id).await.expect("log").as_deref(),
        Some("all done")
    );

    let calls = h.backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].kind, CallKind::Start);
    assert_eq!(calls[0].message, "Initial task");
    assert_eq!(calls[0].cwd, h.workspace);

    assert_eq!(
        h.event_types(&run_id),
        vec![
            RunEventType::Submitted,
            RunEventType::Claimed,
            RunEventType::Started,
            RunEventType::Completed,
        ]
    );
}

#[tokio::test]
async fn backend_pid_is_attached_while_running() {
    let h = Harness::new();
    let pid = std::process::id();
    h.backend.push(
        Script::success("sess-pid", "ok")
            .with_pid(pid)
            .after(Duration::from_millis(200)),
    );
    let run_id = h.submit("watch pid").await;

    let runner = h.runner.clone();
    let id = run_id.clone();
    let task = tokio::spawn(async move { runner.process_run(&id).await });

    let store = h.store.clone();
    let id = run_id.clone();
    let attached = super::test_helpers::wait_until(Duration::from_secs(2), || {
        let store = store.clone();
        let id = id.clone();
        async move {
            store
                .get_status(&id)
                .await
                .map(|run| run.state == RunState::Running && run.pid == Some(pid))
                .unwrap_or(false)
        }
    })
    .await;
    assert!(attached, "backend pid should be recorded on the running run");

    task.await.expect("join").expect("processed");
    let events = h.events.read_events(&run_id).expect("events");
    let attached = events
        .iter()
        .find(|event| event.event_type == RunEventType::PidAttached)
        .expect("pid_attached event");
    assert_eq!(attached.pid, Some(pid));
}

#[tokio::test]
async fn deadline_expiry_fails_with_retryable_timeout() {
    let h = Harness::new();
    h.backend
        .push(Script::success("sess-slow", "late").after(Duration::from_secs(10)));
    let run_id = h
        .manager
        .submit(RunSpec {
            constraints: Constraints {
                timeout_ms: Some(100),
            },
            ..h.spec("slow task")
        })
        .await
        .expect("submit");

    let started = Instant::now();
    let result = h.runner.process_run(&run_id).await.expect("processed");
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(result.status, ResultStatus::Failed);
    let error = result.error.expect("error");
    assert_eq!(error.code, "TIMEOUT");
    assert!(error.retryable);

    let run = h.store.get_status(&run_id).await.expect("status");
    assert_eq!(run.state, RunState::Failed);
    assert!(run.pid.is_none());
    assert_eq!(run.error.map(|e| e.code), Some("TIMEOUT".to_owned()));
    assert!(h.event_types(&run_id).contains(&RunEventType::TimedOut));
}

#[tokio::test]
async fn timed_out_call_stops_reported_process() {
    let h = Harness::new();
    h.backend.push(
        Script::success("sess-slow", "late")
            .with_pid(4_000_000)
            .after(Duration::from_secs(10)),
    );
    let run_id = h
        .manager
        .submit(RunSpec {
            constraints: Constraints {
                timeout_ms: Some(100),
            },
            ..h.spec("slow task")
        })
        .await
        .expect("submit");

    h.runner.process_run(&run_id).await.expect("processed");
    assert_eq!(h.backend.stops(), vec![4_000_000]);
}

#[tokio::test]
async fn structured_backend_error_keeps_retryable_flag() {
    let h = Harness::new();
    h.backend.push(Script::error(
        RunError::new("RATE_LIMIT", "slow down", true),
        Some("sess-rl"),
    ));
    let run_id = h.submit("busy").await;

    let result = h.runner.process_run(&run_id).await.expect("processed");

    let error = result.error.expect("error");
    assert_eq!(error.code, "RATE_LIMIT");
    assert_eq!(error.message, "slow down");
    assert!(error.retryable);

    let run = h.store.get_status(&run_id).await.expect("status");
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.session_id.as_deref(), Some("sess-rl"));
}

#[tokio::test]
async fn failed_call_becomes_backend_error() {
    let h = Harness::new();
    h.backend.push(Script::call_failure("pipe closed"));
    let run_id = h.submit("doomed").await;

    let result = h.runner.process_run(&run_id).await.expect("processed");

    let error = result.error.expect("error");
    assert_eq!(error.code, "BACKEND_ERROR");
    assert!(!error.retryable);
    assert!(error.message.contains("pipe closed"));
    assert_eq!(
        h.store.get_status(&run_id).await.expect("status").state,
        RunState::Failed
    );
}

#[tokio::test]
async fn success_without_session_is_a_failure() {
    let h = Harness::new();
    h.backend.push(Script::respond(BackendResponse {
        output: "no session".into(),
        ..BackendResponse::default()
    }));
    let run_id = h.submit("anonymous").await;

    let result = h.runner.process_run(&run_id).await.expect("processed");

    assert_eq!(result.status, ResultStatus::Failed);
    assert_eq!(result.error.map(|e| e.code), Some("BACKEND_ERROR".to_owned()));
    assert_eq!(result.output, "no session");
}

#[tokio::test]
async fn unknown_engine_fails_the_run() {
    let h = Harness::new();
    let run_id = h
        .manager
        .submit(RunSpec {
            engine: "missing".into(),
            ..h.spec("nowhere to go")
        })
        .await
        .expect("submit");

    let result = h.runner.process_run(&run_id).await.expect("processed");

    assert_eq!(result.error.map(|e| e.code), Some("UNKNOWN_ENGINE".to_owned()));
    assert_eq!(
        h.store.get_status(&run_id).await.expect("status").state,
        RunState::Failed
    );
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn processing_a_terminal_run_fails_fast() {
    let h = Harness::new();
    h.backend.push(Script::success("sess-1", "first"));
    let run_id = h.submit("once").await;
    let first = h.runner.process_run(&run_id).await.expect("processed");

    let err = h.runner.process_run(&run_id).await.unwrap_err();

    assert!(matches!(err, AppError::InvalidState(_)), "got {err:?}");
    assert_eq!(h.backend.calls().len(), 1);
    assert_eq!(
        h.store.load_result(&run_id).await.expect("load"),
        Some(first)
    );
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let h = Harness::new();
    let err = h.runner.process_run("no-such-run").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn concurrent_attempts_produce_one_terminal_write() {
    let h = Harness::new();
    h.backend
        .push(Script::success("sess-race", "winner").after(Duration::from_millis(100)));
    let run_id = h.submit("race").await;

    let (a, b) = tokio::join!(
        h.runner.process_run(&run_id),
        h.runner.process_run(&run_id)
    );

    let (ok, err) = match (a, b) {
        (Ok(result), Err(err)) | (Err(err), Ok(result)) => (result, err),
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    assert_eq!(ok.status, ResultStatus::Completed);
    assert!(matches!(err, AppError::InvalidState(_)), "got {err:?}");
    assert_eq!(h.backend.calls().len(), 1);

    let completed = h
        .event_types(&run_id)
        .into_iter()
        .filter(|event| *event == RunEventType::Completed)
        .count();
    assert_eq!(completed, 1);
}
