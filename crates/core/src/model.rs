#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub stage: Option<i64>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, updated_at_ms: i64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: String::new(),
            stage: None,
            parent_id: None,
            status: TaskStatus::Active,
            updated_at_ms,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Active,
    Completed,
    Archived,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Connection {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            description: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub updated_at_ms: i64,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Deleted entity id -> deletion time. Kept so a later merge or restore
    /// cannot resurrect the entity.
    #[serde(default)]
    pub tombstones: BTreeMap<String, i64>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            version: 0,
            updated_at_ms: 0,
            tasks: Vec::new(),
            connections: Vec::new(),
            tombstones: BTreeMap::new(),
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains_key(id)
    }

    /// Removes a task together with the connections touching it and leaves a
    /// tombstone behind.
    pub fn remove_task(&mut self, id: &str, deleted_at_ms: i64) -> Option<Task> {
        let index = self.tasks.iter().position(|task| task.id == id)?;
        let removed = self.tasks.remove(index);
        self.connections
            .retain(|connection| connection.source != id && connection.target != id);
        self.tombstones.insert(removed.id.clone(), deleted_at_ms);
        Some(removed)
    }

    /// Project header without the task and connection collections.
    pub fn header(&self) -> ProjectHeader {
        ProjectHeader {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version,
            updated_at_ms: self.updated_at_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectHeader {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub updated_at_ms: i64,
}
