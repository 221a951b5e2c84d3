#![forbid(unsafe_code)]

use tl_core::model::TaskStatus;
use tl_storage::{
    ActorContext, ClaimNextRequest, ClaimRequest, CompleteRequest, CreateTaskRequest,
    ReleaseRequest, SqliteStore, StealMode, StealRequest, StoreError,
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

fn store_with_project(dir: &std::path::Path) -> SqliteStore {
    let mut store = SqliteStore::open(dir).expect("open store");
    store
        .create_project("default", ActorContext::default())
        .expect("create project");
    store
}

fn ready_task(store: &mut SqliteStore, title: &str, priority: u8) -> String {
    let mut request = CreateTaskRequest::new(title, "default");
    request.priority = priority;
    request.initial_status = Some(TaskStatus::Ready);
    store.create_task(request).expect("create task").task.task_id
}

fn claim(store: &mut SqliteStore, task_id: &str, agent: &str) -> Result<(), StoreError> {
    store
        .claim_task(ClaimRequest {
            task_id: task_id.to_string(),
            agent: agent.to_string(),
            lease_ttl_ms: Some(60_000),
            actor: ActorContext::default(),
        })
        .map(|_| ())
}

#[test]
fn second_claimant_loses_with_the_winner_status() {
    let dir = temp_dir("claim_conflict");
    let mut store = store_with_project(&dir);
    let task_id = ready_task(&mut store, "contested", 1);

    claim(&mut store, &task_id, "agent-1").expect("first claim wins");
    let err = claim(&mut store, &task_id, "agent-2").expect_err("second claim loses");
    match err {
        StoreError::NotClaimable { status, .. } => assert_eq!(status, TaskStatus::InProgress),
        other => panic!("expected NotClaimable, got {other}"),
    }
}

#[test]
fn racing_processes_claim_each_task_exactly_once_in_priority_order() {
    let dir = temp_dir("claim_race");
    let mut store = store_with_project(&dir);
    let urgent = ready_task(&mut store, "urgent", 3);
    let low = ready_task(&mut store, "low", 0);
    drop(store);

    // Each thread is its own connection, like separate agent processes.
    let mut handles = Vec::new();
    for worker in 0..20 {
        let dir = dir.clone();
        handles.push(std::thread::spawn(move || {
            let mut store = SqliteStore::open(&dir).expect("open store");
            store
                .claim_next(ClaimNextRequest {
                    agent: format!("agent-{worker}"),
                    lease_ttl_ms: Some(60_000),
                    ..ClaimNextRequest::default()
                })
                .expect("claim_next must not error")
                .map(|mutation| mutation.task.task_id)
        }));
    }

    let outcomes: Vec<Option<String>> = handles
        .into_iter()
        .map(|handle| handle.join().expect("thread join"))
        .collect();
    let mut won: Vec<String> = outcomes.iter().flatten().cloned().collect();
    assert_eq!(won.len(), 2, "two tasks, two winners");
    assert_eq!(
        outcomes.iter().filter(|o| o.is_none()).count(),
        18,
        "everyone else finds the queue empty"
    );
    won.sort();
    let mut expected = vec![urgent.clone(), low.clone()];
    expected.sort();
    assert_eq!(won, expected, "each task claimed exactly once");

    // The urgent task went first even under contention: its claim event
    // landed in the log before the low-priority one's.
    let store = SqliteStore::open(&dir).expect("reopen store");
    let urgent_row = store.get_task(&urgent).expect("get").expect("urgent row");
    let low_row = store.get_task(&low).expect("get").expect("low row");
    assert_eq!(urgent_row.status, TaskStatus::InProgress);
    assert_eq!(low_row.status, TaskStatus::InProgress);
    assert!(
        urgent_row.last_event_seq < low_row.last_event_seq,
        "urgent claimed at seq {}, low at seq {}",
        urgent_row.last_event_seq,
        low_row.last_event_seq
    );
}

#[test]
fn claim_next_orders_by_priority_then_age() {
    let dir = temp_dir("claim_order");
    let mut store = store_with_project(&dir);
    let low = ready_task(&mut store, "low", 0);
    let urgent = ready_task(&mut store, "urgent", 3);
    let high = ready_task(&mut store, "high", 2);

    let order: Vec<String> = (0..3)
        .map(|_| {
            store
                .claim_next(ClaimNextRequest {
                    agent: "agent-1".to_string(),
                    ..ClaimNextRequest::default()
                })
                .expect("claim_next")
                .expect("a task is available")
                .task
                .task_id
        })
        .collect();
    assert_eq!(order, vec![urgent, high, low]);

    assert!(
        store
            .claim_next(ClaimNextRequest {
                agent: "agent-1".to_string(),
                ..ClaimNextRequest::default()
            })
            .expect("claim_next")
            .is_none(),
        "queue is drained"
    );
}

#[test]
fn claim_next_skips_tasks_with_unfinished_dependencies() {
    let dir = temp_dir("claim_deps");
    let mut store = store_with_project(&dir);
    let dep = ready_task(&mut store, "dependency", 0);
    let blocked = ready_task(&mut store, "dependent", 3);
    store
        .add_dependency(tl_storage::AddDependencyRequest {
            task_id: blocked.clone(),
            depends_on_id: dep.clone(),
            actor: ActorContext::default(),
        })
        .expect("add dependency");

    // Despite the higher priority, the dependent waits for its dependency.
    let first = store
        .claim_next(ClaimNextRequest {
            agent: "agent-1".to_string(),
            ..ClaimNextRequest::default()
        })
        .expect("claim_next")
        .expect("dependency is claimable");
    assert_eq!(first.task.task_id, dep);

    assert!(
        store
            .claim_next(ClaimNextRequest {
                agent: "agent-2".to_string(),
                ..ClaimNextRequest::default()
            })
            .expect("claim_next")
            .is_none(),
        "dependent is gated until the dependency is done"
    );

    store
        .complete_task(CompleteRequest {
            task_id: dep,
            agent: Some("agent-1".to_string()),
            actor: ActorContext::default(),
        })
        .expect("complete dependency");

    let second = store
        .claim_next(ClaimNextRequest {
            agent: "agent-2".to_string(),
            ..ClaimNextRequest::default()
        })
        .expect("claim_next")
        .expect("dependent unblocked");
    assert_eq!(second.task.task_id, blocked);
}

#[test]
fn claim_next_skips_parents_and_honors_tags() {
    let dir = temp_dir("claim_leaf_tags");
    let mut store = store_with_project(&dir);
    let parent = ready_task(&mut store, "epic", 3);
    let mut child = CreateTaskRequest::new("subtask", "default");
    child.parent_id = Some(parent.clone());
    child.tags = vec!["rust".to_string()];
    child.initial_status = Some(TaskStatus::Ready);
    let child_id = store.create_task(child).expect("create child").task.task_id;

    let none = store
        .claim_next(ClaimNextRequest {
            agent: "agent-1".to_string(),
            tags: vec!["python".to_string()],
            ..ClaimNextRequest::default()
        })
        .expect("claim_next");
    assert!(none.is_none(), "no task carries the python tag");

    let claimed = store
        .claim_next(ClaimNextRequest {
            agent: "agent-1".to_string(),
            tags: vec!["rust".to_string()],
            ..ClaimNextRequest::default()
        })
        .expect("claim_next")
        .expect("the leaf matches");
    assert_eq!(claimed.task.task_id, child_id, "parents are never claimed directly");
}

#[test]
fn steal_if_expired_requires_a_lapsed_lease() {
    let dir = temp_dir("steal");
    let mut store = store_with_project(&dir);
    let task_id = ready_task(&mut store, "leased", 1);
    claim(&mut store, &task_id, "agent-1").expect("claim");

    let err = store
        .steal_task(StealRequest {
            task_id: task_id.clone(),
            new_agent: "agent-2".to_string(),
            mode: StealMode::IfExpired,
            lease_ttl_ms: Some(60_000),
            actor: ActorContext::default(),
        })
        .expect_err("live lease cannot be stolen");
    assert!(matches!(err, StoreError::NotStealable { .. }), "got {err}");

    // Force takes over regardless.
    let stolen = store
        .steal_task(StealRequest {
            task_id: task_id.clone(),
            new_agent: "agent-2".to_string(),
            mode: StealMode::Force,
            lease_ttl_ms: Some(60_000),
            actor: ActorContext::default(),
        })
        .expect("force steal");
    assert_eq!(stolen.task.status, TaskStatus::InProgress);
    assert_eq!(stolen.task.agent.as_deref(), Some("agent-2"));
}

#[test]
fn steal_if_expired_succeeds_once_the_lease_lapses() {
    let dir = temp_dir("steal_expired");
    let mut store = store_with_project(&dir);
    let task_id = ready_task(&mut store, "expired", 1);
    store
        .claim_task(ClaimRequest {
            task_id: task_id.clone(),
            agent: "agent-1".to_string(),
            // Already in the past.
            lease_ttl_ms: Some(-1_000),
            actor: ActorContext::default(),
        })
        .expect("claim with lapsed lease");

    assert_eq!(
        store
            .list_stuck_tasks(now_ms())
            .expect("stuck scan")
            .iter()
            .map(|t| t.task_id.clone())
            .collect::<Vec<_>>(),
        vec![task_id.clone()]
    );

    let stolen = store
        .steal_task(StealRequest {
            task_id: task_id.clone(),
            new_agent: "agent-2".to_string(),
            mode: StealMode::IfExpired,
            lease_ttl_ms: Some(60_000),
            actor: ActorContext::default(),
        })
        .expect("steal after expiry");
    assert_eq!(stolen.task.agent.as_deref(), Some("agent-2"));
    assert!(store.list_stuck_tasks(now_ms()).expect("stuck scan").is_empty());
}

#[test]
fn release_checks_the_holder_and_requeues() {
    let dir = temp_dir("release");
    let mut store = store_with_project(&dir);
    let task_id = ready_task(&mut store, "handed back", 1);
    claim(&mut store, &task_id, "agent-1").expect("claim");

    let err = store
        .release_task(ReleaseRequest {
            task_id: task_id.clone(),
            agent: Some("agent-2".to_string()),
            actor: ActorContext::default(),
        })
        .expect_err("non-holder cannot release");
    assert!(matches!(err, StoreError::NotHolder { .. }), "got {err}");

    let released = store
        .release_task(ReleaseRequest {
            task_id: task_id.clone(),
            agent: Some("agent-1".to_string()),
            actor: ActorContext::default(),
        })
        .expect("holder releases");
    assert_eq!(released.task.status, TaskStatus::Ready);
    assert!(released.task.agent.is_none());
    assert!(released.task.claimed_at_ms.is_none());

    claim(&mut store, &task_id, "agent-2").expect("reclaimable after release");
}

fn now_ms() -> i64 {
    i64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock before epoch")
            .as_millis(),
    )
    .expect("fits i64")
}
