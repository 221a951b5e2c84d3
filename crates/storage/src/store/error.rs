#![forbid(unsafe_code)]

use tl_core::model::TaskStatus;

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    InvalidInput(&'static str),
    Payload(String),
    UnknownTask(String),
    UnknownProject(String),
    UnknownEventType(String),
    DuplicateEventId(String),
    ProjectAlreadyExists(String),
    ProjectNotEmpty(String),
    IllegalTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    NotClaimable {
        task_id: String,
        status: TaskStatus,
    },
    NotStealable {
        task_id: String,
        holder: Option<String>,
        lease_until_ms: Option<i64>,
    },
    NotHolder {
        task_id: String,
        holder: Option<String>,
    },
    DependencyCycle {
        task_id: String,
        depends_on_id: String,
    },
    LockHeld {
        pid: Option<u32>,
        command: Option<String>,
        age_ms: Option<i64>,
    },
    SyncFailed(String),
    WorkflowInProgress {
        op_id: String,
    },
    WorkflowInputMismatch {
        op_id: String,
    },
    WorkflowFailed {
        op_id: String,
        message: String,
    },
    IntegrityCheckFailed(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::Payload(message) => write!(f, "invalid event payload: {message}"),
            Self::UnknownTask(task_id) => write!(f, "unknown task: {task_id}"),
            Self::UnknownProject(name) => write!(f, "unknown project: {name}"),
            Self::UnknownEventType(raw) => write!(f, "unknown event type: {raw}"),
            Self::DuplicateEventId(event_id) => write!(f, "duplicate event id: {event_id}"),
            Self::ProjectAlreadyExists(name) => write!(f, "project already exists: {name}"),
            Self::ProjectNotEmpty(name) => {
                write!(f, "project still has tasks and cannot be deleted: {name}")
            }
            Self::IllegalTransition { task_id, from, to } => write!(
                f,
                "illegal transition for {task_id}: {} -> {}",
                from.as_str(),
                to.as_str()
            ),
            Self::NotClaimable { task_id, status } => {
                write!(f, "task {task_id} not claimable (status={})", status.as_str())
            }
            Self::NotStealable {
                task_id,
                holder,
                lease_until_ms,
            } => match (holder, lease_until_ms) {
                (Some(holder), Some(lease)) => write!(
                    f,
                    "task {task_id} not stealable (held by {holder}, lease_until_ms={lease})"
                ),
                (Some(holder), None) => write!(
                    f,
                    "task {task_id} not stealable (held by {holder}, no lease; force required)"
                ),
                _ => write!(f, "task {task_id} not stealable"),
            },
            Self::NotHolder { task_id, holder } => match holder {
                Some(holder) => write!(f, "task {task_id} is held by {holder}"),
                None => write!(f, "task {task_id} has no holder"),
            },
            Self::DependencyCycle {
                task_id,
                depends_on_id,
            } => write!(
                f,
                "dependency {task_id} -> {depends_on_id} would create a cycle"
            ),
            Self::LockHeld { pid, command, age_ms } => write!(
                f,
                "database lock held (pid={}, command={}, age_ms={})",
                pid.map_or_else(|| "unknown".to_string(), |p| p.to_string()),
                command.as_deref().unwrap_or("unknown"),
                age_ms.map_or_else(|| "unknown".to_string(), |a| a.to_string()),
            ),
            Self::SyncFailed(message) => write!(f, "sync failed: {message}"),
            Self::WorkflowInProgress { op_id } => {
                write!(f, "workflow op {op_id} is already in progress")
            }
            Self::WorkflowInputMismatch { op_id } => write!(
                f,
                "workflow op {op_id} was recorded with a different input hash"
            ),
            Self::WorkflowFailed { op_id, message } => {
                write!(f, "workflow op {op_id} failed: {message}")
            }
            Self::IntegrityCheckFailed(message) => {
                write!(f, "storage integrity check failed: {message}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}

impl From<tl_core::model::PayloadError> for StoreError {
    fn from(value: tl_core::model::PayloadError) -> Self {
        Self::Payload(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Payload(value.to_string())
    }
}
