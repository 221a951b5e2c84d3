#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload schema version stamped on locally appended events. Bump together
/// with a registered upcaster for every shape change.
pub const EVENT_SCHEMA_VERSION: i64 = 2;

pub const MAX_PRIORITY: u8 = 3;
pub const MAX_TITLE_LEN: usize = 500;
pub const MAX_TAGS: usize = 32;
pub const MAX_COMMENT_LEN: usize = 10_000;

/// Closed set of event types. Stored as the `type` column; the store rejects
/// anything it cannot parse back into this enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    StatusChanged,
    Moved,
    DependencyAdded,
    DependencyRemoved,
    Updated,
    Archived,
    CommentAdded,
    CheckpointRecorded,
    ProjectCreated,
    ProjectRenamed,
    ProjectDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::StatusChanged => "status-changed",
            Self::Moved => "moved",
            Self::DependencyAdded => "dependency-added",
            Self::DependencyRemoved => "dependency-removed",
            Self::Updated => "updated",
            Self::Archived => "archived",
            Self::CommentAdded => "comment-added",
            Self::CheckpointRecorded => "checkpoint-recorded",
            Self::ProjectCreated => "project-created",
            Self::ProjectRenamed => "project-renamed",
            Self::ProjectDeleted => "project-deleted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "created" => Self::Created,
            "status-changed" => Self::StatusChanged,
            "moved" => Self::Moved,
            "dependency-added" => Self::DependencyAdded,
            "dependency-removed" => Self::DependencyRemoved,
            "updated" => Self::Updated,
            "archived" => Self::Archived,
            "comment-added" => Self::CommentAdded,
            "checkpoint-recorded" => Self::CheckpointRecorded,
            "project-created" => Self::ProjectCreated,
            "project-renamed" => Self::ProjectRenamed,
            "project-deleted" => Self::ProjectDeleted,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    InProgress,
    Blocked,
    Done,
    Archived,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "backlog" => Self::Backlog,
            "ready" => Self::Ready,
            "in_progress" => Self::InProgress,
            "blocked" => Self::Blocked,
            "done" => Self::Done,
            "archived" => Self::Archived,
            _ => return None,
        })
    }

    /// `done` and `archived` set `terminal_at` and make a task prunable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Archived)
    }

    /// The transition table. `in_progress -> ready` is release (the inverse
    /// of claim); archiving is additionally allowed from any non-terminal
    /// status so unstarted work can be retired.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (*self, to) {
            (Backlog, Ready) => true,
            (Ready, InProgress) => true,
            (InProgress, Done | Blocked | Ready) => true,
            (Blocked, InProgress) => true,
            (Done, Archived) => true,
            (Backlog | Ready | InProgress | Blocked, Archived) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub enum PayloadError {
    Schema(String),
    Invalid(&'static str),
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(message) => write!(f, "payload schema: {message}"),
            Self::Invalid(message) => write!(f, "payload invalid: {message}"),
        }
    }
}

impl std::error::Error for PayloadError {}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreatedPayload {
    pub title: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

fn default_priority() -> u8 {
    1
}

impl CreatedPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.title.trim().is_empty() {
            return Err(PayloadError::Invalid("title must not be empty"));
        }
        if self.title.len() > MAX_TITLE_LEN {
            return Err(PayloadError::Invalid("title too long"));
        }
        if self.priority > MAX_PRIORITY {
            return Err(PayloadError::Invalid("priority must be 0..=3"));
        }
        if self.tags.len() > MAX_TAGS {
            return Err(PayloadError::Invalid("too many tags"));
        }
        match self.status {
            None | Some(TaskStatus::Backlog) | Some(TaskStatus::Ready) => Ok(()),
            Some(_) => Err(PayloadError::Invalid(
                "initial status must be backlog or ready",
            )),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusChangedPayload {
    pub from: TaskStatus,
    pub to: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MovedPayload {
    pub from_project: String,
    pub to_project: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyPayload {
    pub depends_on_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdatedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

impl UpdatedPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.title.is_none()
            && self.priority.is_none()
            && self.tags.is_none()
            && self.links.is_none()
            && self.metadata.is_none()
        {
            return Err(PayloadError::Invalid("no fields to update"));
        }
        if let Some(title) = self.title.as_deref()
            && (title.trim().is_empty() || title.len() > MAX_TITLE_LEN)
        {
            return Err(PayloadError::Invalid("title must be 1..=500 chars"));
        }
        if let Some(priority) = self.priority
            && priority > MAX_PRIORITY
        {
            return Err(PayloadError::Invalid("priority must be 0..=3"));
        }
        if let Some(tags) = self.tags.as_ref()
            && tags.len() > MAX_TAGS
        {
            return Err(PayloadError::Invalid("too many tags"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchivedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommentAddedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub body: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointRecordedPayload {
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectCreatedPayload {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectRenamedPayload {
    pub from: String,
    pub to: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectDeletedPayload {
    pub name: String,
}

fn parse<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T, PayloadError> {
    serde_json::from_value(data.clone()).map_err(|err| PayloadError::Schema(err.to_string()))
}

/// Validates an event payload against the typed schema for its kind. Runs on
/// every append, for self-produced and replicated events alike.
pub fn validate_event_payload(kind: EventKind, data: &Value) -> Result<(), PayloadError> {
    match kind {
        EventKind::Created => parse::<CreatedPayload>(data)?.validate(),
        EventKind::StatusChanged => parse::<StatusChangedPayload>(data).map(|_| ()),
        EventKind::Moved => parse::<MovedPayload>(data).map(|_| ()),
        EventKind::DependencyAdded | EventKind::DependencyRemoved => {
            let payload: DependencyPayload = parse(data)?;
            if payload.depends_on_id.trim().is_empty() {
                return Err(PayloadError::Invalid("depends_on_id must not be empty"));
            }
            Ok(())
        }
        EventKind::Updated => parse::<UpdatedPayload>(data)?.validate(),
        EventKind::Archived => parse::<ArchivedPayload>(data).map(|_| ()),
        EventKind::CommentAdded => {
            let payload: CommentAddedPayload = parse(data)?;
            if payload.body.trim().is_empty() {
                return Err(PayloadError::Invalid("comment body must not be empty"));
            }
            if payload.body.len() > MAX_COMMENT_LEN {
                return Err(PayloadError::Invalid("comment body too long"));
            }
            Ok(())
        }
        EventKind::CheckpointRecorded => {
            let payload: CheckpointRecordedPayload = parse(data)?;
            if payload.name.trim().is_empty() {
                return Err(PayloadError::Invalid("checkpoint name must not be empty"));
            }
            Ok(())
        }
        EventKind::ProjectCreated => parse::<ProjectCreatedPayload>(data).map(|_| ()),
        EventKind::ProjectRenamed => parse::<ProjectRenamedPayload>(data).map(|_| ()),
        EventKind::ProjectDeleted => parse::<ProjectDeletedPayload>(data).map(|_| ()),
    }
}
