//! Unit tests for `StateMachine` transition guards.

use agent_dispatch::models::{
    Constraints, RunError, RunMode, RunResult, RunSpec, RunState,
};
use agent_dispatch::orchestrator::state_machine::{RunPatch, StateMachine};
use agent_dispatch::persistence::RunStore;
use agent_dispatch::AppError;

struct Fixture {
    _temp: tempfile::TempDir,
    store: RunStore,
    machine: StateMachine,
    run_id: String,
}

async fn fixture() -> Fixture {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = RunStore::new(temp.path().join("store"));
    let run_id = store
        .create_run(RunSpec {
            task_id: "t".into(),
            intent: "fix".into(),
            workspace_path: temp.path().to_path_buf(),
            message: "Initial task".into(),
            engine: "codex".into(),
            mode: RunMode::New,
            session_id: None,
            constraints: Constraints::default(),
        })
        .await
        .expect("create");
    Fixture {
        machine: StateMachine::new(store.clone()),
        _temp: temp,
        store,
        run_id,
    }
}

#[tokio::test]
async fn entering_running_records_owner_and_pid() {
    let f = fixture().await;

    let run = f
        .machine
        .transition(&f.run_id, RunState::Running, RunPatch::default())
        .await
        .expect("running");

    assert_eq!(run.state, RunState::Running);
    assert_eq!(run.owner_pid, Some(std::process::id()));
    assert_eq!(run.pid, run.owner_pid);
    assert_eq!(f.store.get_status(&f.run_id).await.expect("status"), run);
}

#[tokio::test]
async fn explicit_pid_overrides_owner() {
    let f = fixture().await;

    let run = f
        .machine
        .transition(&f.run_id, RunState::Running, RunPatch::with_pid(4242))
        .await
        .expect("running");

    assert_eq!(run.pid, Some(4242));
    assert_eq!(run.owner_pid, Some(std::process::id()));
}

#[tokio::test]
async fn terminal_states_clear_pid() {
    let f = fixture().await;
    f.machine
        .transition(&f.run_id, RunState::Running, RunPatch::default())
        .await
        .expect("running");

    let run = f
        .machine
        .transition(
            &f.run_id,
            RunState::Completed,
            RunPatch::default().session(Some("sess-1".into())),
        )
        .await
        .expect("completed");

    assert!(run.pid.is_none());
    assert!(run.owner_pid.is_none());
    assert_eq!(run.session_id.as_deref(), Some("sess-1"));
}

#[tokio::test]
async fn failure_records_error() {
    let f = fixture().await;
    f.machine
        .transition(&f.run_id, RunState::Running, RunPatch::default())
        .await
        .expect("running");

    let run = f
        .machine
        .transition(
            &f.run_id,
            RunState::Failed,
            RunPatch::with_error(RunError::timeout(10)),
        )
        .await
        .expect("failed");

    let error = run.error.expect("error");
    assert_eq!(error.code, "TIMEOUT");
    assert!(error.retryable);
}

#[tokio::test]
async fn rejected_transition_writes_nothing() {
    let f = fixture().await;
    let before = f.store.get_status(&f.run_id).await.expect("status");

    let err = f
        .machine
        .transition(&f.run_id, RunState::Completed, RunPatch::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::InvalidTransition(_)), "got {err:?}");
    assert_eq!(f.store.get_status(&f.run_id).await.expect("status"), before);
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let f = fixture().await;
    let err = f
        .machine
        .transition("missing", RunState::Running, RunPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn finish_writes_result_with_terminal_state() {
    let f = fixture().await;
    f.machine
        .transition(&f.run_id, RunState::Running, RunPatch::default())
        .await
        .expect("running");
    let result = RunResult::completed("done".into(), None);

    let run = f
        .machine
        .finish(
            &f.run_id,
            RunState::Completed,
            RunPatch::default().session(Some("sess-1".into())),
            &result,
        )
        .await
        .expect("finish");

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(
        f.store.load_result(&f.run_id).await.expect("load"),
        Some(result)
    );
}

#[tokio::test]
async fn finish_requires_terminal_target() {
    let f = fixture().await;
    let result = RunResult::completed("done".into(), None);

    let err = f
        .machine
        .finish(&f.run_id, RunState::Running, RunPatch::default(), &result)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::InvalidTransition(_)));
    assert!(f.store.load_result(&f.run_id).await.expect("load").is_none());
}

#[tokio::test]
async fn second_finish_loses_and_keeps_first_result() {
    let f = fixture().await;
    f.machine
        .transition(&f.run_id, RunState::Running, RunPatch::default())
        .await
        .expect("running");
    let first = RunResult::failed(String::new(), RunError::stopped(), None);
    f.machine
        .finish(
            &f.run_id,
            RunState::Failed,
            RunPatch::with_error(RunError::stopped()),
            &first,
        )
        .await
        .expect("first finish");

    let second = RunResult::completed("late".into(), None);
    let err = f
        .machine
        .finish(&f.run_id, RunState::Completed, RunPatch::default(), &second)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::InvalidTransition(_)));
    assert_eq!(
        f.store.load_result(&f.run_id).await.expect("load"),
        Some(first)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finishes_from_separate_stores_on_one_root_settle_once() {
    let f = fixture().await;
    // Independent stores share nothing in memory, like a daemon and a CLI
    // invocation pointed at the same root.
    let daemon = StateMachine::new(RunStore::new(f.store.root()));
    let operator = StateMachine::new(RunStore::new(f.store.root()));

    for round in 0..50 {
        let run_id = f
            .store
            .create_run(RunSpec {
                task_id: format!("t-{round}"),
                intent: "fix".into(),
                workspace_path: f.store.root().to_path_buf(),
                message: "race".into(),
                engine: "codex".into(),
                mode: RunMode::New,
                session_id: None,
                constraints: Constraints::default(),
            })
            .await
            .expect("create");
        f.machine
            .transition(&run_id, RunState::Running, RunPatch::default())
            .await
            .expect("running");

        let completed = RunResult::completed("done".into(), None);
        let stopped = RunResult::failed(String::new(), RunError::stopped(), None);
        let complete = tokio::spawn({
            let (machine, run_id, result) = (daemon.clone(), run_id.clone(), completed.clone());
            async move {
                machine
                    .finish(&run_id, RunState::Completed, RunPatch::default(), &result)
                    .await
            }
        });
        let stop = tokio::spawn({
            let (machine, run_id, result) = (operator.clone(), run_id.clone(), stopped.clone());
            async move {
                machine
                    .finish(
                        &run_id,
                        RunState::Failed,
                        RunPatch::with_error(RunError::stopped()),
                        &result,
                    )
                    .await
            }
        });
        let complete = complete.await.expect("join");
        let stop = stop.await.expect("join");

        assert!(
            complete.is_ok() != stop.is_ok(),
            "round {round}: exactly one finish must win"
        );
        let run = f.store.get_status(&run_id).await.expect("status");
        let result = f.store.load_result(&run_id).await.expect("load");
        if complete.is_ok() {
            assert_eq!(run.state, RunState::Completed);
            assert_eq!(result, Some(completed));
        } else {
            assert!(matches!(complete, Err(AppError::InvalidTransition(_))));
            assert_eq!(run.state, RunState::Failed);
            assert_eq!(result, Some(stopped));
        }
    }
}

#[tokio::test]
async fn attach_pid_requires_running() {
    let f = fixture().await;
    let err = f.machine.attach_pid(&f.run_id, 99).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    f.machine
        .transition(&f.run_id, RunState::Running, RunPatch::default())
        .await
        .expect("running");
    let run = f.machine.attach_pid(&f.run_id, 99).await.expect("attach");
    assert_eq!(run.pid, Some(99));
    assert_eq!(run.owner_pid, Some(std::process::id()));
}

#[tokio::test]
async fn rearm_resets_to_created_with_resume_request() {
    let f = fixture().await;
    f.store.claim_request(&f.run_id).await.expect("claim");
    f.machine
        .transition(&f.run_id, RunState::Running, RunPatch::default())
        .await
        .expect("running");
    f.machine
        .transition(
            &f.run_id,
            RunState::Completed,
            RunPatch::default().session(Some("sess-123".into())),
        )
        .await
        .expect("completed");

    let run = f.machine.rearm(&f.run_id, "Follow up").await.expect("rearm");

    assert_eq!(run.state, RunState::Created);
    assert_eq!(run.mode, RunMode::Resume);
    assert_eq!(run.message, "Follow up");
    assert!(f.store.has_pending_request(&f.run_id).await);
    assert!(!f.store.has_claimed_request(&f.run_id).await);
    let request = f.store.load_request(&f.run_id).await.expect("request");
    assert_eq!(request.session_id.as_deref(), Some("sess-123"));
}

#[tokio::test]
async fn rearm_of_created_run_is_rejected() {
    let f = fixture().await;
    let err = f.machine.rearm(&f.run_id, "again").await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
}
