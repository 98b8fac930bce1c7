#![forbid(unsafe_code)]

use crate::ids::{EntityIdError, validate_entity_id};
use crate::model::{Connection, Project, ProjectHeader, Task};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Project,
    Connection,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Project => "project",
            Self::Connection => "connection",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Critical,
}

/// One variant per (action type, entity type) pair, so a payload can never
/// disagree with the action it travels in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionPayload {
    CreateProject { project: ProjectHeader },
    UpdateProject { project: Project },
    DeleteProject { project_id: String },
    CreateTask { project_id: String, task: Task },
    UpdateTask { project_id: String, task: Task },
    DeleteTask { project_id: String, task_id: String },
    CreateConnection { project_id: String, connection: Connection },
    UpdateConnection { project_id: String, connection: Connection },
    DeleteConnection { project_id: String, connection_id: String },
}

impl ActionPayload {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::CreateProject { .. } | Self::CreateTask { .. } | Self::CreateConnection { .. } => {
                ActionType::Create
            }
            Self::UpdateProject { .. } | Self::UpdateTask { .. } | Self::UpdateConnection { .. } => {
                ActionType::Update
            }
            Self::DeleteProject { .. } | Self::DeleteTask { .. } | Self::DeleteConnection { .. } => {
                ActionType::Delete
            }
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::CreateProject { .. } | Self::UpdateProject { .. } | Self::DeleteProject { .. } => {
                EntityType::Project
            }
            Self::CreateTask { .. } | Self::UpdateTask { .. } | Self::DeleteTask { .. } => {
                EntityType::Task
            }
            Self::CreateConnection { .. }
            | Self::UpdateConnection { .. }
            | Self::DeleteConnection { .. } => EntityType::Connection,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            Self::CreateProject { project } => &project.id,
            Self::UpdateProject { project } => &project.id,
            Self::DeleteProject { project_id } => project_id,
            Self::CreateTask { task, .. } | Self::UpdateTask { task, .. } => &task.id,
            Self::DeleteTask { task_id, .. } => task_id,
            Self::CreateConnection { connection, .. } | Self::UpdateConnection { connection, .. } => {
                &connection.id
            }
            Self::DeleteConnection { connection_id, .. } => connection_id,
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            Self::CreateProject { project } => &project.id,
            Self::UpdateProject { project } => &project.id,
            Self::DeleteProject { project_id }
            | Self::CreateTask { project_id, .. }
            | Self::UpdateTask { project_id, .. }
            | Self::DeleteTask { project_id, .. }
            | Self::CreateConnection { project_id, .. }
            | Self::UpdateConnection { project_id, .. }
            | Self::DeleteConnection { project_id, .. } => project_id,
        }
    }

    /// Boundary check run before a payload is allowed into the queue.
    pub fn validate(&self) -> Result<(), PayloadError> {
        validate_entity_id(self.project_id()).map_err(PayloadError::InvalidProjectId)?;
        validate_entity_id(self.entity_id()).map_err(PayloadError::InvalidEntityId)?;
        match self {
            Self::CreateProject { project } => require(&project.name, "project.name"),
            Self::UpdateProject { project } => {
                require(&project.name, "project.name")?;
                for task in &project.tasks {
                    validate_entity_id(&task.id).map_err(PayloadError::InvalidEntityId)?;
                }
                Ok(())
            }
            Self::CreateTask { task, .. } | Self::UpdateTask { task, .. } => {
                require(&task.title, "task.title")
            }
            Self::CreateConnection { connection, .. }
            | Self::UpdateConnection { connection, .. } => {
                validate_entity_id(&connection.source).map_err(PayloadError::InvalidEntityId)?;
                validate_entity_id(&connection.target).map_err(PayloadError::InvalidEntityId)
            }
            Self::DeleteProject { .. } | Self::DeleteTask { .. } | Self::DeleteConnection { .. } => {
                Ok(())
            }
        }
    }
}

fn require(value: &str, field: &'static str) -> Result<(), PayloadError> {
    if value.trim().is_empty() {
        return Err(PayloadError::MissingField(field));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid project id: {}", .0.message())]
    InvalidProjectId(EntityIdError),
    #[error("invalid entity id: {}", .0.message())]
    InvalidEntityId(EntityIdError),
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("action header disagrees with payload ({0})")]
    HeaderMismatch(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: ActionPayload,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub next_attempt_at_ms: i64,
    #[serde(default)]
    pub paused_reason: Option<String>,
}

impl QueuedAction {
    pub fn new(id: String, payload: ActionPayload, priority: Priority, timestamp_ms: i64) -> Self {
        Self {
            id,
            action_type: payload.action_type(),
            entity_type: payload.entity_type(),
            entity_id: payload.entity_id().to_string(),
            payload,
            timestamp_ms,
            retry_count: 0,
            priority,
            next_attempt_at_ms: timestamp_ms,
            paused_reason: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_reason.is_some()
    }

    /// Re-checks a decoded action: the header fields must agree with the
    /// payload and the payload must pass boundary validation.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.action_type != self.payload.action_type() {
            return Err(PayloadError::HeaderMismatch("type"));
        }
        if self.entity_type != self.payload.entity_type() {
            return Err(PayloadError::HeaderMismatch("entity_type"));
        }
        if self.entity_id != self.payload.entity_id() {
            return Err(PayloadError::HeaderMismatch("entity_id"));
        }
        self.payload.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_follow_payload() {
        let action = QueuedAction::new(
            "act_1".to_string(),
            ActionPayload::DeleteTask {
                project_id: "p1".to_string(),
                task_id: "t9".to_string(),
            },
            Priority::Normal,
            10,
        );
        assert_eq!(action.action_type, ActionType::Delete);
        assert_eq!(action.entity_type, EntityType::Task);
        assert_eq!(action.entity_id, "t9");
        assert!(action.validate().is_ok());
    }

    #[test]
    fn tampered_header_is_rejected() {
        let mut action = QueuedAction::new(
            "act_1".to_string(),
            ActionPayload::DeleteProject {
                project_id: "p1".to_string(),
            },
            Priority::Low,
            10,
        );
        action.entity_type = EntityType::Task;
        assert_eq!(
            action.validate(),
            Err(PayloadError::HeaderMismatch("entity_type"))
        );
    }

    #[test]
    fn payload_validation_checks_ids_and_required_fields() {
        let bad_id = ActionPayload::CreateTask {
            project_id: "p1".to_string(),
            task: Task::new("bad id", "Title", 0),
        };
        assert!(matches!(
            bad_id.validate(),
            Err(PayloadError::InvalidEntityId(_))
        ));

        let untitled = ActionPayload::UpdateTask {
            project_id: "p1".to_string(),
            task: Task::new("t1", "  ", 0),
        };
        assert_eq!(
            untitled.validate(),
            Err(PayloadError::MissingField("task.title"))
        );

        let dangling = ActionPayload::CreateConnection {
            project_id: "p1".to_string(),
            connection: Connection::new("c1", "t1", ""),
        };
        assert!(dangling.validate().is_err());
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let payload = ActionPayload::DeleteConnection {
            project_id: "p1".to_string(),
            connection_id: "c1".to_string(),
        };
        let value = serde_json::to_value(&payload).expect("encode");
        assert_eq!(value["kind"], "delete_connection");
        assert_eq!(value["connection_id"], "c1");
    }
}
