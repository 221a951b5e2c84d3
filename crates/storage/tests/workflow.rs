#![forbid(unsafe_code)]

use tl_core::model::TaskStatus;
use tl_storage::{
    ActorContext, ClaimRequest, CreateTaskRequest, HandoffInput, SqliteStore, StoreError,
    WorkflowService,
};

fn temp_dir(name: &str) -> std::path::PathBuf {
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    let dir =
        std::env::temp_dir().join(format!("taskledger_{name}_{}_{nonce}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn claimed_source(name: &str) -> (SqliteStore, String) {
    let mut store = SqliteStore::open(temp_dir(name)).expect("open store");
    store
        .create_project("default", ActorContext::default())
        .expect("create project");
    let mut request = CreateTaskRequest::new("source work", "default");
    request.initial_status = Some(TaskStatus::Ready);
    let source = store.create_task(request).expect("create").task.task_id;
    store
        .claim_task(ClaimRequest {
            task_id: source.clone(),
            agent: "agent-1".to_string(),
            lease_ttl_ms: Some(60_000),
            actor: ActorContext::default(),
        })
        .expect("claim source");
    (store, source)
}

fn handoff(source: &str) -> HandoffInput {
    HandoffInput {
        source_task_id: source.to_string(),
        agent: "agent-1".to_string(),
        follow_on_title: "follow-on work".to_string(),
        follow_on_priority: 2,
        follow_on_tags: vec!["handoff".to_string()],
        actor: ActorContext::default(),
    }
}

#[test]
fn handoff_completes_the_source_and_readies_a_follow_on() {
    let (mut store, source) = claimed_source("handoff_basic");
    let service = WorkflowService::default();

    let outcome = service
        .run_handoff(&mut store, "op-1", handoff(&source))
        .expect("handoff");
    assert!(!outcome.replayed);
    assert_eq!(outcome.result.source_task_id, source);

    let source_row = store.get_task(&source).expect("get").expect("exists");
    assert_eq!(source_row.status, TaskStatus::Done);

    let follow_on = store
        .get_task(&outcome.result.follow_on_task_id)
        .expect("get")
        .expect("exists");
    assert_eq!(follow_on.status, TaskStatus::Ready);
    assert_eq!(follow_on.project, "default");
    assert_eq!(follow_on.priority, 2);
    assert_eq!(follow_on.tags, vec!["handoff".to_string()]);
}

#[test]
fn a_repeated_op_replays_the_recorded_result() {
    let (mut store, source) = claimed_source("handoff_replay");
    let service = WorkflowService::default();

    let first = service
        .run_handoff(&mut store, "op-1", handoff(&source))
        .expect("first run");
    let second = service
        .run_handoff(&mut store, "op-1", handoff(&source))
        .expect("second run replays");
    assert!(second.replayed);
    assert_eq!(
        first.result.follow_on_task_id,
        second.result.follow_on_task_id
    );

    // One follow-on, not two.
    let ready = store
        .list_tasks(Some("default"), Some(TaskStatus::Ready))
        .expect("list");
    assert_eq!(ready.len(), 1);
}

#[test]
fn a_changed_input_under_the_same_op_id_is_rejected() {
    let (mut store, source) = claimed_source("handoff_mismatch");
    let service = WorkflowService::default();

    service
        .run_handoff(&mut store, "op-1", handoff(&source))
        .expect("first run");

    let mut altered = handoff(&source);
    altered.follow_on_title = "something else entirely".to_string();
    let err = service
        .run_handoff(&mut store, "op-1", altered)
        .expect_err("mismatched input");
    assert!(matches!(err, StoreError::WorkflowInputMismatch { .. }), "got {err}");
}

#[test]
fn a_failed_step_archives_the_follow_on_and_records_the_failure() {
    let dir = temp_dir("handoff_compensation");
    let mut store = SqliteStore::open(&dir).expect("open store");
    store
        .create_project("default", ActorContext::default())
        .expect("create project");
    // Ready but never claimed, so completing it will fail mid-workflow.
    let mut request = CreateTaskRequest::new("unclaimed source", "default");
    request.initial_status = Some(TaskStatus::Ready);
    let source = store.create_task(request).expect("create").task.task_id;

    let service = WorkflowService::default();
    let err = service
        .run_handoff(&mut store, "op-1", handoff(&source))
        .expect_err("completing an unclaimed task fails");
    assert!(matches!(err, StoreError::IllegalTransition { .. }), "got {err}");

    // The follow-on was created, then compensated away.
    let archived = store
        .list_tasks(Some("default"), Some(TaskStatus::Archived))
        .expect("list");
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].title, "follow-on work");

    // The op is parked as failed; retrying replays the failure.
    let err = service
        .run_handoff(&mut store, "op-1", handoff(&source))
        .expect_err("failed op replays as failed");
    assert!(matches!(err, StoreError::WorkflowFailed { .. }), "got {err}");

    // A fresh op id can still do the job once the source is claimable.
    store
        .claim_task(ClaimRequest {
            task_id: source.clone(),
            agent: "agent-1".to_string(),
            lease_ttl_ms: Some(60_000),
            actor: ActorContext::default(),
        })
        .expect("claim source");
    service
        .run_handoff(&mut store, "op-2", handoff(&source))
        .expect("fresh op succeeds");
}

#[test]
fn distinct_op_ids_do_not_interfere() {
    let (mut store, source_a) = claimed_source("handoff_distinct");
    let mut request = CreateTaskRequest::new("second source", "default");
    request.initial_status = Some(TaskStatus::Ready);
    let source_b = store.create_task(request).expect("create").task.task_id;
    store
        .claim_task(ClaimRequest {
            task_id: source_b.clone(),
            agent: "agent-1".to_string(),
            lease_ttl_ms: Some(60_000),
            actor: ActorContext::default(),
        })
        .expect("claim second source");

    let service = WorkflowService::default();
    let a = service
        .run_handoff(&mut store, "op-a", handoff(&source_a))
        .expect("op-a");
    let b = service
        .run_handoff(&mut store, "op-b", handoff(&source_b))
        .expect("op-b");
    assert_ne!(a.result.follow_on_task_id, b.result.follow_on_task_id);
}
