#![forbid(unsafe_code)]

use serde_json::Value;
use tl_core::model::TaskStatus;

use super::types::{EventEnvelope, TaskRow};

/// Attribution metadata copied onto every event a command emits.
#[derive(Clone, Debug, Default)]
pub struct ActorContext {
    pub author: Option<String>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CreateTaskRequest {
    pub title: String,
    pub project: String,
    pub parent_id: Option<String>,
    pub priority: u8,
    pub tags: Vec<String>,
    pub links: Vec<String>,
    pub metadata: serde_json::Map<String, Value>,
    pub initial_status: Option<TaskStatus>,
    pub actor: ActorContext,
}

impl CreateTaskRequest {
    pub fn new(title: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            project: project.into(),
            parent_id: None,
            priority: 1,
            tags: Vec::new(),
            links: Vec::new(),
            metadata: serde_json::Map::new(),
            initial_status: None,
            actor: ActorContext::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SetStatusRequest {
    pub task_id: String,
    pub to: TaskStatus,
    pub reason: Option<String>,
    pub actor: ActorContext,
}

#[derive(Clone, Debug)]
pub struct UpdateTaskRequest {
    pub task_id: String,
    pub title: Option<String>,
    pub priority: Option<u8>,
    pub tags: Option<Vec<String>>,
    pub links: Option<Vec<String>>,
    pub metadata: Option<serde_json::Map<String, Value>>,
    pub actor: ActorContext,
}

#[derive(Clone, Debug)]
pub struct MoveTaskRequest {
    pub task_id: String,
    pub to_project: String,
    pub actor: ActorContext,
}

#[derive(Clone, Debug)]
pub struct ClaimRequest {
    pub task_id: String,
    pub agent: String,
    pub lease_ttl_ms: Option<i64>,
    pub actor: ActorContext,
}

#[derive(Clone, Debug, Default)]
pub struct ClaimNextRequest {
    pub project: Option<String>,
    pub tags: Vec<String>,
    pub parent: Option<String>,
    pub agent: String,
    pub lease_ttl_ms: Option<i64>,
    pub actor: ActorContext,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StealMode {
    Force,
    IfExpired,
}

#[derive(Clone, Debug)]
pub struct StealRequest {
    pub task_id: String,
    pub new_agent: String,
    pub mode: StealMode,
    pub lease_ttl_ms: Option<i64>,
    pub actor: ActorContext,
}

#[derive(Clone, Debug)]
pub struct ReleaseRequest {
    pub task_id: String,
    /// When set, release is refused unless this agent currently holds the task.
    pub agent: Option<String>,
    pub actor: ActorContext,
}

#[derive(Clone, Debug)]
pub struct CompleteRequest {
    pub task_id: String,
    pub agent: Option<String>,
    pub actor: ActorContext,
}

#[derive(Clone, Debug)]
pub struct ArchiveRequest {
    pub task_id: String,
    pub reason: Option<String>,
    pub actor: ActorContext,
}

#[derive(Clone, Debug)]
pub struct AddDependencyRequest {
    pub task_id: String,
    pub depends_on_id: String,
    pub actor: ActorContext,
}

#[derive(Clone, Debug)]
pub struct RemoveDependencyRequest {
    pub task_id: String,
    pub depends_on_id: String,
    pub actor: ActorContext,
}

#[derive(Clone, Debug)]
pub struct AddCommentRequest {
    pub task_id: String,
    pub body: String,
    pub actor: ActorContext,
}

#[derive(Clone, Debug)]
pub struct AddCheckpointRequest {
    pub task_id: String,
    pub name: String,
    pub data: serde_json::Map<String, Value>,
    pub actor: ActorContext,
}

#[derive(Clone, Debug)]
pub struct TaskMutation {
    pub task: TaskRow,
    pub event: EventEnvelope,
}

#[derive(Clone, Debug)]
pub struct DependencyAddOutcome {
    /// False when the edge already existed; no event is emitted in that case.
    pub added: bool,
    pub event: Option<EventEnvelope>,
}

#[derive(Clone, Debug)]
pub struct PrunableTask {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub terminal_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct PruneReport {
    pub pruned_task_ids: Vec<String>,
    pub events_deleted: usize,
}

#[derive(Clone, Debug)]
pub struct EnqueueHookRequest {
    pub hook_name: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub payload: Value,
}
