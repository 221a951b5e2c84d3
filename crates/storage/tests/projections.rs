#![forbid(unsafe_code)]

use tl_core::model::TaskStatus;
use tl_storage::{
    ActorContext, AddCommentRequest, ClaimRequest, CompleteRequest, CreateTaskRequest,
    SetStatusRequest, SqliteStore, UpdateTaskRequest,
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

fn store_with_project(name: &str) -> SqliteStore {
    let mut store = SqliteStore::open(temp_dir(name)).expect("open store");
    store
        .create_project("default", ActorContext::default())
        .expect("create project");
    store
}

fn ready_task(store: &mut SqliteStore, title: &str) -> String {
    let mut request = CreateTaskRequest::new(title, "default");
    request.initial_status = Some(TaskStatus::Ready);
    store.create_task(request).expect("create task").task.task_id
}

/// Every derived surface, dumped through the public API. Good enough to
/// compare state before and after a rebuild.
fn dump(store: &SqliteStore) -> String {
    let mut out = String::new();
    for project in store.list_projects().expect("projects") {
        out.push_str(&format!("{project:?}\n"));
    }
    for task in store.list_tasks(None, None).expect("tasks") {
        out.push_str(&format!("{task:?}\n"));
        for dep in store.dependencies_of(&task.task_id).expect("deps") {
            out.push_str(&format!("  dep {dep}\n"));
        }
        for comment in store.comments(&task.task_id).expect("comments") {
            out.push_str(&format!("  {comment:?}\n"));
        }
        for checkpoint in store.checkpoints(&task.task_id).expect("checkpoints") {
            out.push_str(&format!("  {checkpoint:?}\n"));
        }
    }
    out
}

#[test]
fn commands_keep_the_task_row_current() {
    let mut store = store_with_project("task_row_current");
    let task_id = ready_task(&mut store, "ship it");

    let claimed = store
        .claim_task(ClaimRequest {
            task_id: task_id.clone(),
            agent: "agent-1".to_string(),
            lease_ttl_ms: Some(60_000),
            actor: ActorContext::default(),
        })
        .expect("claim");
    assert_eq!(claimed.task.status, TaskStatus::InProgress);
    assert_eq!(claimed.task.agent.as_deref(), Some("agent-1"));
    assert!(claimed.task.lease_until_ms.is_some());

    let done = store
        .complete_task(CompleteRequest {
            task_id: task_id.clone(),
            agent: Some("agent-1".to_string()),
            actor: ActorContext::default(),
        })
        .expect("complete");
    assert_eq!(done.task.status, TaskStatus::Done);
    assert!(done.task.terminal_at_ms.is_some());
    assert!(done.task.lease_until_ms.is_none());
    // Attribution survives completion.
    assert_eq!(done.task.agent.as_deref(), Some("agent-1"));
}

#[test]
fn blocked_tasks_keep_their_holder_through_resume() {
    let mut store = store_with_project("blocked_resume");
    let a = ready_task(&mut store, "alpha");

    store
        .claim_task(ClaimRequest {
            task_id: a.clone(),
            agent: "agent-1".to_string(),
            lease_ttl_ms: Some(30_000),
            actor: ActorContext::default(),
        })
        .expect("claim a");
    let blocked = store
        .set_status(SetStatusRequest {
            task_id: a.clone(),
            to: TaskStatus::Blocked,
            reason: Some("waiting on review".to_string()),
            actor: ActorContext::default(),
        })
        .expect("block");
    assert_eq!(blocked.task.status, TaskStatus::Blocked);
    assert_eq!(blocked.task.agent.as_deref(), Some("agent-1"));
    assert!(blocked.task.lease_until_ms.is_none(), "lease voids on block");

    let resumed = store
        .set_status(SetStatusRequest {
            task_id: a.clone(),
            to: TaskStatus::InProgress,
            reason: None,
            actor: ActorContext::default(),
        })
        .expect("resume");
    assert_eq!(resumed.task.status, TaskStatus::InProgress);
    assert_eq!(resumed.task.agent.as_deref(), Some("agent-1"));

    store
        .add_comment(AddCommentRequest {
            task_id: a.clone(),
            body: "back on it".to_string(),
            actor: ActorContext {
                author: Some("agent-1".to_string()),
                ..ActorContext::default()
            },
        })
        .expect("comment");
    store
        .complete_task(CompleteRequest {
            task_id: a.clone(),
            agent: Some("agent-1".to_string()),
            actor: ActorContext::default(),
        })
        .expect("complete");
    assert_eq!(store.comments(&a).expect("comments").len(), 1);
}

#[test]
fn double_rebuild_is_idempotent() {
    let mut store = store_with_project("double_rebuild");
    let a = ready_task(&mut store, "alpha");
    store
        .claim_task(ClaimRequest {
            task_id: a.clone(),
            agent: "agent-1".to_string(),
            lease_ttl_ms: Some(1_000),
            actor: ActorContext::default(),
        })
        .expect("claim");
    store
        .update_task(UpdateTaskRequest {
            task_id: a.clone(),
            title: Some("alpha prime".to_string()),
            priority: Some(2),
            tags: Some(vec!["infra".to_string()]),
            links: None,
            metadata: None,
            actor: ActorContext::default(),
        })
        .expect("update");

    let before = dump(&store);
    let replayed_once = store.rebuild_all_projections().expect("first rebuild");
    let after_once = dump(&store);
    let replayed_twice = store.rebuild_all_projections().expect("second rebuild");
    let after_twice = dump(&store);

    assert_eq!(replayed_once, replayed_twice, "same log both times");
    assert_eq!(before, after_once);
    assert_eq!(after_once, after_twice);
}

#[test]
fn search_tracks_title_and_tags() {
    let mut store = store_with_project("search");
    let mut request = CreateTaskRequest::new("Fix the Flaky Build", "default");
    request.tags = vec!["ci".to_string()];
    let task_id = store.create_task(request).expect("create").task.task_id;

    assert_eq!(store.search_tasks("flaky").expect("search"), vec![task_id.clone()]);
    assert_eq!(store.search_tasks("ci").expect("search"), vec![task_id.clone()]);
    assert!(store.search_tasks("nomatch").expect("search").is_empty());

    store
        .update_task(UpdateTaskRequest {
            task_id: task_id.clone(),
            title: Some("Stabilize pipeline".to_string()),
            priority: None,
            tags: None,
            links: None,
            metadata: None,
            actor: ActorContext::default(),
        })
        .expect("retitle");
    assert!(store.search_tasks("flaky").expect("search").is_empty());
    assert_eq!(store.search_tasks("pipeline").expect("search"), vec![task_id]);
}

#[test]
fn project_rename_rehomes_tasks() {
    let mut store = store_with_project("rename");
    let task_id = ready_task(&mut store, "migrate");

    store
        .rename_project("default", "platform", ActorContext::default())
        .expect("rename");

    let task = store.get_task(&task_id).expect("get").expect("exists");
    assert_eq!(task.project, "platform");
    let projects = store.list_projects().expect("projects");
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0].name, "platform");

    // The rename is an event like any other; a rebuild agrees.
    store.rebuild_all_projections().expect("rebuild");
    let task = store.get_task(&task_id).expect("get").expect("exists");
    assert_eq!(task.project, "platform");
}
