#![forbid(unsafe_code)]

use super::SnapshotLocation;
use serde::{Deserialize, Serialize};
use tv_storage::{KvStore, StoreError};

pub const MIGRATION_STATUS_KEY: &str = "taskvault.migration.status";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    #[default]
    Idle,
    Preparing,
    Validating,
    Uploading,
    Verifying,
    Cleaning,
    Completed,
    Failed,
    Rollback,
}

impl MigrationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Validating => "validating",
            Self::Uploading => "uploading",
            Self::Verifying => "verifying",
            Self::Cleaning => "cleaning",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rollback => "rollback",
        }
    }

    /// Step number of the forward phases.
    pub fn step(self) -> Option<u8> {
        match self {
            Self::Preparing => Some(1),
            Self::Validating => Some(2),
            Self::Uploading => Some(3),
            Self::Verifying => Some(4),
            Self::Cleaning => Some(5),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatusRecord {
    pub status: MigrationPhase,
    /// Last forward step reached, 0 before the first.
    #[serde(default)]
    pub phase: u8,
    #[serde(default)]
    pub projects_total: usize,
    #[serde(default)]
    pub projects_completed: usize,
    #[serde(default)]
    pub projects_failed: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub snapshot: Option<SnapshotLocation>,
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl MigrationStatusRecord {
    pub fn is_unfinished(&self) -> bool {
        !matches!(self.status, MigrationPhase::Idle | MigrationPhase::Completed)
    }

    pub fn enter(&mut self, status: MigrationPhase, now_ms: i64) {
        self.status = status;
        if let Some(step) = status.step() {
            self.phase = step;
        }
        self.updated_at_ms = now_ms;
    }

    pub fn fail(&mut self, error: impl Into<String>, now_ms: i64) {
        self.error = Some(error.into());
        self.enter(MigrationPhase::Failed, now_ms);
    }

    fn accounted(&self) -> usize {
        self.projects_completed + self.projects_failed.len()
    }

    /// Counts one more project as done. Refused once every project is
    /// accounted for.
    pub fn record_completed(&mut self) -> bool {
        if self.accounted() >= self.projects_total {
            return false;
        }
        self.projects_completed += 1;
        true
    }

    pub fn record_failed(&mut self, project_id: &str) -> bool {
        if self.accounted() >= self.projects_total {
            return false;
        }
        self.projects_failed.push(project_id.to_string());
        true
    }

    pub fn load(kv: &dyn KvStore) -> Result<Option<Self>, StoreError> {
        kv.get(MIGRATION_STATUS_KEY)?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(StoreError::from)
    }

    pub fn save(&self, kv: &mut dyn KvStore) -> Result<(), StoreError> {
        kv.put(MIGRATION_STATUS_KEY, &serde_json::to_string(self)?)
    }

    pub fn clear(kv: &mut dyn KvStore) -> Result<(), StoreError> {
        kv.delete(MIGRATION_STATUS_KEY)
    }
}
