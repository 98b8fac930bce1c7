#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::PathBuf;
use tv_core::Project;

pub const SESSION_SNAPSHOT_KEY: &str = "taskvault.migration.snapshot";
pub const PERSISTENT_SNAPSHOT_KEY: &str = "taskvault.migration.snapshot.persistent";

/// Copy of the guest data taken before anything is uploaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSnapshot {
    pub created_at_ms: i64,
    pub projects: Vec<Project>,
    /// Hex SHA-256 of the JSON-encoded `projects`.
    pub checksum: String,
}

impl MigrationSnapshot {
    pub fn capture(projects: Vec<Project>, created_at_ms: i64) -> Result<Self, serde_json::Error> {
        let checksum = projects_checksum(&projects)?;
        Ok(Self {
            created_at_ms,
            projects,
            checksum,
        })
    }

    pub fn is_intact(&self) -> bool {
        projects_checksum(&self.projects).is_ok_and(|actual| actual == self.checksum)
    }
}

/// Where the snapshot of a run was written. Session snapshots are mirrored
/// to the persistent store so a restart can still roll back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotLocation {
    Session,
    Persistent,
    File(PathBuf),
}

fn projects_checksum(projects: &[Project]) -> Result<String, serde_json::Error> {
    let encoded = serde_json::to_vec(projects)?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(&mut out, "{:02x}", b);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tv_core::Task;

    #[test]
    fn tampering_breaks_the_checksum() {
        let mut project = Project::new("p1", "Inbox");
        project.tasks.push(Task::new("t1", "Write", 1));
        let snapshot = MigrationSnapshot::capture(vec![project], 10).expect("capture");
        assert_eq!(snapshot.checksum.len(), 64);
        assert!(snapshot.is_intact());

        let mut tampered = snapshot.clone();
        tampered.projects[0].tasks.clear();
        assert!(!tampered.is_intact());
    }
}
