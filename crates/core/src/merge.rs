#![forbid(unsafe_code)]

use crate::model::{Connection, Project, Task};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How local guest data is reconciled with what the account already holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStrategy {
    /// Local copy overwrites the remote one.
    LocalWins,
    /// Per-task reconciliation, newer `updated_at_ms` wins.
    #[default]
    Merge,
    /// Remote copy is kept on collision; local-only projects still upload.
    RemoteWins,
    /// Nothing local is uploaded.
    DiscardLocal,
}

impl MigrationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "local-wins",
            Self::Merge => "merge",
            Self::RemoteWins => "remote-wins",
            Self::DiscardLocal => "discard-local",
        }
    }
}

/// Merges a local and a remote copy of the same project.
///
/// Tasks present on one side only are kept. On id collision the task with
/// the newer `updated_at_ms` wins and the remote copy wins ties. Ids that
/// either side tombstoned are dropped so deletions are not undone by the
/// merge, and so are connections whose source or target did not survive. The result's version is past both inputs.
pub fn merge_projects(local: &Project, remote: &Project) -> Project {
    let mut tombstones = remote.tombstones.clone();
    for (id, deleted_at_ms) in &local.tombstones {
        let entry = tombstones.entry(id.clone()).or_insert(*deleted_at_ms);
        *entry = (*entry).max(*deleted_at_ms);
    }

    let mut tasks: BTreeMap<&str, &Task> = BTreeMap::new();
    let mut order: Vec<&str> = Vec::new();
    for task in remote.tasks.iter().chain(local.tasks.iter()) {
        if tombstones.contains_key(&task.id) {
            continue;
        }
        let replace = match tasks.get(task.id.as_str()) {
            None => {
                order.push(task.id.as_str());
                true
            }
            Some(existing) => task.updated_at_ms > existing.updated_at_ms,
        };
        if replace {
            tasks.insert(task.id.as_str(), task);
        }
    }
    let merged_tasks: Vec<Task> = order
        .iter()
        .filter_map(|id| tasks.get(id).map(|task| (*task).clone()))
        .collect();

    let mut connections: Vec<Connection> = Vec::new();
    for connection in remote.connections.iter().chain(local.connections.iter()) {
        let endpoints_live = tasks.contains_key(connection.source.as_str())
            && tasks.contains_key(connection.target.as_str());
        if !endpoints_live
            || tombstones.contains_key(&connection.id)
            || connections.iter().any(|existing| existing.id == connection.id)
        {
            continue;
        }
        connections.push(connection.clone());
    }

    let newer_header = if local.updated_at_ms > remote.updated_at_ms {
        local
    } else {
        remote
    };

    Project {
        id: remote.id.clone(),
        name: newer_header.name.clone(),
        description: newer_header.description.clone(),
        version: local.version.max(remote.version) + 1,
        updated_at_ms: local.updated_at_ms.max(remote.updated_at_ms),
        tasks: merged_tasks,
        connections,
        tombstones,
    }
}

/// Resolves what should be uploaded for one local project. `None` means the
/// local copy is not uploaded at all.
pub fn resolve_upload(
    strategy: MigrationStrategy,
    local: &Project,
    remote: Option<&Project>,
) -> Option<Project> {
    match (strategy, remote) {
        (MigrationStrategy::DiscardLocal, _) => None,
        (_, None) => Some(local.clone()),
        (MigrationStrategy::LocalWins, Some(remote)) => {
            let mut upload = local.clone();
            upload.version = local.version.max(remote.version) + 1;
            Some(upload)
        }
        (MigrationStrategy::Merge, Some(remote)) => Some(merge_projects(local, remote)),
        (MigrationStrategy::RemoteWins, Some(_)) => None,
    }
}
