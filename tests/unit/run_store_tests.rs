//! Unit tests for the file-backed `RunStore`.

use std::path::Path;

use agent_dispatch::models::{
    Constraints, ResultStatus, RunError, RunMode, RunResult, RunSpec, RunState,
};
use agent_dispatch::persistence::RunStore;
use agent_dispatch::AppError;

fn spec(workspace: &Path) -> RunSpec {
    RunSpec {
        task_id: "task-7".into(),
        intent: "fix".into(),
        workspace_path: workspace.to_path_buf(),
        message: "Initial task".into(),
        engine: "codex".into(),
        mode: RunMode::New,
        session_id: None,
        constraints: Constraints {
            timeout_ms: Some(1000),
        },
    }
}

fn store() -> (tempfile::TempDir, RunStore) {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = RunStore::new(temp.path().join("store"));
    (temp, store)
}

#[tokio::test]
async fn create_then_get_preserves_fields() {
    let (temp, store) = store();
    let spec = spec(temp.path());

    let run_id = store.create_run(spec.clone()).await.expect("create");
    let run = store.get_status(&run_id).await.expect("status");

    assert_eq!(run.run_id, run_id);
    assert_eq!(run.task_id, spec.task_id);
    assert_eq!(run.intent, spec.intent);
    assert_eq!(run.workspace_path, spec.workspace_path);
    assert_eq!(run.message, spec.message);
    assert_eq!(run.engine, spec.engine);
    assert_eq!(run.mode, spec.mode);
    assert_eq!(run.constraints, spec.constraints);
    assert_eq!(run.state, RunState::Created);
    assert!(run.pid.is_none());
    assert!(run.session_id.is_none());
}

#[tokio::test]
async fn create_lays_out_run_directory() {
    let (temp, store) = store();
    let run_id = store.create_run(spec(temp.path())).await.expect("create");
    let dir = store.run_dir(&run_id).expect("dir");

    assert!(dir.join("session.json").is_file());
    assert!(dir.join("request.json").is_file());
    assert!(dir.join("logs").is_dir());
    assert!(dir.join("context").is_dir());
    assert!(dir.join("artifacts").is_dir());
    assert!(!dir.join("result.json").exists());

    let request = store.load_request(&run_id).await.expect("request");
    assert_eq!(request.message, "Initial task");
    assert_eq!(request.mode, RunMode::New);
    assert!(request.session_id.is_none());
    assert_eq!(request.constraints.timeout_ms, Some(1000));
}

#[tokio::test]
async fn resume_submission_requires_session() {
    let (temp, store) = store();
    let spec = RunSpec {
        mode: RunMode::Resume,
        ..spec(temp.path())
    };

    let err = store.create_run(spec).await.unwrap_err();

    assert!(matches!(err, AppError::InvalidState(_)), "got {err:?}");
    assert!(store.list_runs().await.expect("list").is_empty());
}

#[tokio::test]
async fn resume_submission_carries_session_into_request() {
    let (temp, store) = store();
    let spec = RunSpec {
        mode: RunMode::Resume,
        session_id: Some("sess-existing".into()),
        ..spec(temp.path())
    };

    let run_id = store.create_run(spec).await.expect("create");
    let request = store.load_request(&run_id).await.expect("request");

    assert_eq!(request.mode, RunMode::Resume);
    assert_eq!(request.session_id.as_deref(), Some("sess-existing"));
}

#[tokio::test]
async fn empty_engine_is_rejected() {
    let (temp, store) = store();
    let spec = RunSpec {
        engine: " ".into(),
        ..spec(temp.path())
    };
    assert!(matches!(
        store.create_run(spec).await,
        Err(AppError::InvalidState(_))
    ));
}

#[tokio::test]
async fn unknown_or_invalid_ids_are_not_found() {
    let (_temp, store) = store();
    assert!(matches!(
        store.get_status("missing").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        store.get_status("../escape").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn list_is_sorted_and_skips_incomplete_directories() {
    let (temp, store) = store();
    let first = store.create_run(spec(temp.path())).await.expect("create");
    let second = store.create_run(spec(temp.path())).await.expect("create");
    std::fs::create_dir_all(store.runs_dir().join("half-written")).expect("stray dir");
    std::fs::write(store.runs_dir().join("stray.txt"), "x").expect("stray file");

    let runs = store.list_runs().await.expect("list");

    let ids: Vec<_> = runs.iter().map(|run| run.run_id.clone()).collect();
    assert_eq!(ids, vec![first, second]);
}

#[tokio::test]
async fn list_of_empty_store_is_empty() {
    let (_temp, store) = store();
    assert!(store.list_runs().await.expect("list").is_empty());
}

#[tokio::test]
async fn claim_succeeds_exactly_once() {
    let (temp, store) = store();
    let run_id = store.create_run(spec(temp.path())).await.expect("create");

    let claimed = store.claim_request(&run_id).await.expect("claim");
    assert_eq!(claimed.message, "Initial task");
    assert!(!store.has_pending_request(&run_id).await);
    assert!(store.has_claimed_request(&run_id).await);
    assert_eq!(
        store.claimed_request(&run_id).await.expect("claimed"),
        claimed
    );

    let err = store.claim_request(&run_id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)), "got {err:?}");
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let (temp, store) = store();
    let run_id = store.create_run(spec(temp.path())).await.expect("create");

    let (a, b) = tokio::join!(store.claim_request(&run_id), store.claim_request(&run_id));

    assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
}

#[tokio::test]
async fn removing_missing_claim_marker_is_ok() {
    let (temp, store) = store();
    let run_id = store.create_run(spec(temp.path())).await.expect("create");
    store.remove_claimed_request(&run_id).await.expect("remove");
    assert!(matches!(
        store.claimed_request(&run_id).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn results_and_output_round_trip() {
    let (temp, store) = store();
    let run_id = store.create_run(spec(temp.path())).await.expect("create");
    assert!(store.load_result(&run_id).await.expect("load").is_none());
    assert!(store.read_output_log(&run_id).await.expect("read").is_none());

    let result = RunResult::failed(
        "partial".into(),
        RunError::new("RATE_LIMIT", "slow down", true),
        None,
    );
    store.write_result(&run_id, &result).await.expect("write");
    store
        .write_output_log(&run_id, "raw agent output\n")
        .await
        .expect("write log");

    let loaded = store.load_result(&run_id).await.expect("load").expect("result");
    assert_eq!(loaded.status, ResultStatus::Failed);
    assert_eq!(loaded, result);
    assert_eq!(
        store.read_output_log(&run_id).await.expect("read").as_deref(),
        Some("raw agent output\n")
    );
}

#[tokio::test]
async fn corrupt_record_is_a_serde_error() {
    let (temp, store) = store();
    let run_id = store.create_run(spec(temp.path())).await.expect("create");
    let path = store.run_dir(&run_id).expect("dir").join("session.json");
    std::fs::write(path, "{ not json").expect("corrupt");

    assert!(matches!(
        store.get_status(&run_id).await,
        Err(AppError::Serde(_))
    ));
    assert!(store.list_runs().await.expect("list").is_empty());
}

#[tokio::test]
async fn persisted_state_uses_lowercase_names() {
    let (temp, store) = store();
    let run_id = store.create_run(spec(temp.path())).await.expect("create");
    let raw = std::fs::read_to_string(store.run_dir(&run_id).expect("dir").join("session.json"))
        .expect("read");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("json");

    assert_eq!(value["state"], "created");
    assert_eq!(value["mode"], "new");
    assert_eq!(value["pid"], serde_json::Value::Null);
}
