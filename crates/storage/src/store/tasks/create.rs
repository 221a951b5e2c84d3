#![forbid(unsafe_code)]

use rusqlite::{TransactionBehavior, params};
use serde_json::json;
use tl_core::ids::ProjectName;
use tl_core::model::{CreatedPayload, EventKind, MovedPayload, UpdatedPayload};

use super::super::SqliteStore;
use super::super::error::StoreError;
use super::super::events::EventInput;
use super::super::requests::{
    ActorContext, CreateTaskRequest, MoveTaskRequest, TaskMutation, UpdateTaskRequest,
};
use super::super::types::EventEnvelope;
use super::{commit_event_tx, load_task_tx, project_exists_tx};

fn validated_project_name(raw: &str) -> Result<String, StoreError> {
    ProjectName::try_new(raw)
        .map(ProjectName::into_string)
        .map_err(|err| StoreError::Payload(err.to_string()))
}

impl SqliteStore {
    pub fn create_project(
        &mut self,
        name: &str,
        actor: ActorContext,
    ) -> Result<EventEnvelope, StoreError> {
        let name = validated_project_name(name)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if project_exists_tx(&tx, &name)? {
            return Err(StoreError::ProjectAlreadyExists(name));
        }
        let mut input = EventInput::new(EventKind::ProjectCreated, json!({ "name": name }));
        input.actor = actor;
        let event = commit_event_tx(&tx, &self.upcasters, &self.projectors, input)?;
        tx.commit()?;
        Ok(event)
    }

    /// Renames a project and re-homes every task in it, in one event.
    pub fn rename_project(
        &mut self,
        from: &str,
        to: &str,
        actor: ActorContext,
    ) -> Result<EventEnvelope, StoreError> {
        let to = validated_project_name(to)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !project_exists_tx(&tx, from)? {
            return Err(StoreError::UnknownProject(from.to_string()));
        }
        if project_exists_tx(&tx, &to)? {
            return Err(StoreError::ProjectAlreadyExists(to));
        }
        let mut input = EventInput::new(
            EventKind::ProjectRenamed,
            json!({ "from": from, "to": to }),
        );
        input.actor = actor;
        let event = commit_event_tx(&tx, &self.upcasters, &self.projectors, input)?;
        tx.commit()?;
        Ok(event)
    }

    pub fn delete_project(
        &mut self,
        name: &str,
        actor: ActorContext,
    ) -> Result<EventEnvelope, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !project_exists_tx(&tx, name)? {
            return Err(StoreError::UnknownProject(name.to_string()));
        }
        let occupied = {
            let mut stmt = tx.prepare_cached("SELECT 1 FROM tasks WHERE project=?1 LIMIT 1")?;
            stmt.exists(params![name])?
        };
        if occupied {
            return Err(StoreError::ProjectNotEmpty(name.to_string()));
        }
        let mut input = EventInput::new(EventKind::ProjectDeleted, json!({ "name": name }));
        input.actor = actor;
        let event = commit_event_tx(&tx, &self.upcasters, &self.projectors, input)?;
        tx.commit()?;
        Ok(event)
    }

    pub fn create_task(&mut self, request: CreateTaskRequest) -> Result<TaskMutation, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !project_exists_tx(&tx, &request.project)? {
            return Err(StoreError::UnknownProject(request.project));
        }
        if let Some(parent_id) = request.parent_id.as_deref() {
            // One level of nesting only.
            let parent = load_task_tx(&tx, parent_id)?;
            if parent.parent_id.is_some() {
                return Err(StoreError::InvalidInput(
                    "parent is itself a subtask; nesting is one level deep",
                ));
            }
        }

        let payload = CreatedPayload {
            title: request.title,
            project: request.project,
            parent_id: request.parent_id,
            priority: request.priority,
            tags: request.tags,
            links: request.links,
            metadata: request.metadata,
            status: request.initial_status,
        };
        let task_id = format!("tsk_{}", uuid::Uuid::now_v7().simple());
        let mut input = EventInput::for_task(
            task_id.clone(),
            EventKind::Created,
            serde_json::to_value(&payload)?,
        );
        input.actor = request.actor;
        let event = commit_event_tx(&tx, &self.upcasters, &self.projectors, input)?;
        let task = load_task_tx(&tx, &task_id)?;
        tx.commit()?;
        Ok(TaskMutation { task, event })
    }

    pub fn update_task(&mut self, request: UpdateTaskRequest) -> Result<TaskMutation, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_task_tx(&tx, &request.task_id)?;
        if current.status.is_terminal() {
            return Err(StoreError::IllegalTransition {
                task_id: request.task_id,
                from: current.status,
                to: current.status,
            });
        }
        let payload = UpdatedPayload {
            title: request.title,
            priority: request.priority,
            tags: request.tags,
            links: request.links,
            metadata: request.metadata,
        };
        let mut input = EventInput::for_task(
            request.task_id.clone(),
            EventKind::Updated,
            serde_json::to_value(&payload)?,
        );
        input.actor = request.actor;
        let event = commit_event_tx(&tx, &self.upcasters, &self.projectors, input)?;
        let task = load_task_tx(&tx, &request.task_id)?;
        tx.commit()?;
        Ok(TaskMutation { task, event })
    }

    pub fn move_task(&mut self, request: MoveTaskRequest) -> Result<TaskMutation, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_task_tx(&tx, &request.task_id)?;
        if !project_exists_tx(&tx, &request.to_project)? {
            return Err(StoreError::UnknownProject(request.to_project));
        }
        let payload = MovedPayload {
            from_project: current.project,
            to_project: request.to_project,
        };
        let mut input = EventInput::for_task(
            request.task_id.clone(),
            EventKind::Moved,
            serde_json::to_value(&payload)?,
        );
        input.actor = request.actor;
        let event = commit_event_tx(&tx, &self.upcasters, &self.projectors, input)?;
        let task = load_task_tx(&tx, &request.task_id)?;
        tx.commit()?;
        Ok(TaskMutation { task, event })
    }
}
