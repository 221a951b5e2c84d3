#![forbid(unsafe_code)]

use serde_json::Value;
use tl_core::model::{EventKind, TaskStatus};

/// A stored event, payload already upcast to the current schema shape by the
/// time any caller outside the event store sees it.
#[derive(Clone, Debug)]
pub struct EventEnvelope {
    pub seq: i64,
    pub event_id: String,
    pub task_id: Option<String>,
    pub kind: EventKind,
    pub data: Value,
    pub author: Option<String>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub schema_version: i64,
    pub ts_ms: i64,
}

/// Derived current-state row, owned exclusively by the projection engine.
#[derive(Clone, Debug)]
pub struct TaskRow {
    pub task_id: String,
    pub title: String,
    pub project: String,
    pub status: TaskStatus,
    pub parent_id: Option<String>,
    pub priority: u8,
    pub tags: Vec<String>,
    pub links: Vec<String>,
    pub metadata: serde_json::Map<String, Value>,
    pub agent: Option<String>,
    pub claimed_at_ms: Option<i64>,
    pub lease_until_ms: Option<i64>,
    pub terminal_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub last_event_seq: i64,
}

#[derive(Clone, Debug)]
pub struct ProjectRow {
    pub name: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct CommentRow {
    pub event_seq: i64,
    pub task_id: String,
    pub author: Option<String>,
    pub body: String,
    pub ts_ms: i64,
}

#[derive(Clone, Debug)]
pub struct CheckpointRow {
    pub event_seq: i64,
    pub task_id: String,
    pub name: String,
    pub data: serde_json::Map<String, Value>,
    pub ts_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboxStatus {
    Queued,
    Processing,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "queued" => Self::Queued,
            "processing" => Self::Processing,
            "delivered" => Self::Delivered,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug)]
pub struct OutboxRow {
    pub id: String,
    pub hook_name: String,
    pub status: OutboxStatus,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub payload: Value,
    pub attempts: i64,
    pub next_attempt_at_ms: i64,
    pub lock_token: Option<String>,
    pub locked_by: Option<String>,
    pub lock_expires_at_ms: Option<i64>,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub delivered_at_ms: Option<i64>,
    pub failed_at_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkflowState {
    Processing,
    Completed,
    Failed,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug)]
pub struct WorkflowOpRow {
    pub op_id: String,
    pub workflow_name: String,
    pub input_hash: String,
    pub state: WorkflowState,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}
