#![forbid(unsafe_code)]

//! Guest-to-account migration. Every phase is persisted before it starts so
//! an interrupted run is visible on the next launch and can be rolled back
//! from its snapshot.

mod snapshot;
mod status;

pub use snapshot::{MigrationSnapshot, PERSISTENT_SNAPSHOT_KEY, SESSION_SNAPSHOT_KEY, SnapshotLocation};
pub use status::{MIGRATION_STATUS_KEY, MigrationPhase, MigrationStatusRecord};

use crate::config::MigrationConfig;
use crate::remote::{RemoteBackend, RemoteError};
use crate::time::file_stamp;
use std::collections::BTreeSet;
use tv_core::integrity::{IntegrityCheckResult, check_integrity};
use tv_core::merge::{MigrationStrategy, resolve_upload};
use tv_core::ports::{Notice, NoticeSeverity, Notifier};
use tv_core::Project;
use tv_storage::{KvStore, LoadedProjects, LocalStore, MemoryKvStore, SaveOutcome, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("no signed-in user")]
    NotSignedIn,
    #[error("could not snapshot local data: {0}")]
    SnapshotFailed(String),
    #[error("unreadable local projects: {}", .0.join(", "))]
    CorruptLocalData(Vec<String>),
    #[error("local data failed integrity checks ({} errors)", .0.errors().count())]
    IntegrityFailed(IntegrityCheckResult),
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(RemoteError),
    #[error("{} of {total} projects failed to upload", .failed.len())]
    UploadFailed { failed: Vec<String>, total: usize },
    #[error("no migration snapshot to restore")]
    NoSnapshot,
    #[error("migration snapshot checksum mismatch")]
    ChecksumMismatch,
    #[error("restore incomplete for {0:?}")]
    RestoreFailed(Vec<String>),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationReport {
    pub strategy: MigrationStrategy,
    pub uploaded: Vec<Project>,
    /// Local projects the strategy chose not to upload.
    pub skipped: Vec<String>,
    /// `project:<id>` or `task:<project>/<id>` entries missing after upload.
    pub missing_after_upload: Vec<String>,
    pub local_cleared: bool,
    pub snapshot: Option<SnapshotLocation>,
}

impl MigrationReport {
    pub fn is_degraded(&self) -> bool {
        !self.missing_after_upload.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RollbackReport {
    pub restored: usize,
    pub source: SnapshotLocation,
}

/// Local project without a remote counterpart, or ahead of it.
pub fn needs_migration(local: &[Project], remote: &[Project]) -> bool {
    local.iter().any(|project| {
        remote
            .iter()
            .find(|candidate| candidate.id == project.id)
            .is_none_or(|counterpart| project.version > counterpart.version)
    })
}

pub struct MigrationOrchestrator {
    config: MigrationConfig,
    session: Box<dyn KvStore>,
}

impl std::fmt::Debug for MigrationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MigrationOrchestrator {
    pub fn new(config: MigrationConfig) -> Self {
        Self::with_session_store(config, Box::new(MemoryKvStore::new()))
    }

    pub fn with_session_store(config: MigrationConfig, session: Box<dyn KvStore>) -> Self {
        Self { config, session }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn get_migration_status(&self, store: &mut LocalStore) -> MigrationStatusRecord {
        match MigrationStatusRecord::load(store.kv()) {
            Ok(record) => record.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(error = %err, "migration status unreadable");
                MigrationStatusRecord::default()
            }
        }
    }

    pub fn has_unfinished_migration(&self, store: &mut LocalStore) -> bool {
        self.get_migration_status(store).is_unfinished()
    }

    pub fn get_local_guest_data(&self, store: &mut LocalStore) -> Vec<Project> {
        load_guest_data(store).projects
    }

    pub fn run<B: RemoteBackend + ?Sized>(
        &mut self,
        store: &mut LocalStore,
        remote: &mut B,
        user_id: &str,
        strategy: MigrationStrategy,
        notifier: &dyn Notifier,
        now_ms: i64,
    ) -> Result<MigrationReport, MigrationError> {
        let LoadedProjects {
            projects: local,
            corrupted,
        } = load_guest_data(store);
        let mut status = MigrationStatusRecord {
            projects_total: local.len(),
            ..MigrationStatusRecord::default()
        };
        tracing::info!(
            user_id,
            strategy = strategy.as_str(),
            projects = local.len(),
            "migration started"
        );

        // 1. preparing
        status.enter(MigrationPhase::Preparing, now_ms);
        status.save(store.kv())?;
        let snapshot = match self.take_snapshot(store, &local, notifier, now_ms) {
            Ok(location) => location,
            Err(err) => return Err(self.abort(store, &mut status, err, notifier, now_ms)),
        };
        status.snapshot = Some(snapshot.clone());

        // 2. validating
        status.enter(MigrationPhase::Validating, now_ms);
        status.save(store.kv())?;
        if !corrupted.is_empty() {
            let err = MigrationError::CorruptLocalData(corrupted);
            return Err(self.abort(store, &mut status, err, notifier, now_ms));
        }
        let integrity = check_integrity(&local);
        for issue in integrity.warnings() {
            tracing::warn!(
                project_id = ?issue.project_id,
                entity_id = ?issue.entity_id,
                "{}",
                issue.message
            );
        }
        if !integrity.is_valid() {
            let err = MigrationError::IntegrityFailed(integrity);
            return Err(self.abort(store, &mut status, err, notifier, now_ms));
        }

        // 3. uploading
        status.enter(MigrationPhase::Uploading, now_ms);
        status.save(store.kv())?;
        let remote_projects = match remote.load_projects(user_id) {
            Ok(projects) => projects,
            Err(err) => {
                let err = MigrationError::RemoteUnavailable(err);
                return Err(self.abort(store, &mut status, err, notifier, now_ms));
            }
        };

        let mut uploaded = Vec::new();
        let mut skipped = Vec::new();
        for project in &local {
            let counterpart = remote_projects.iter().find(|candidate| candidate.id == project.id);
            match resolve_upload(strategy, project, counterpart) {
                None => {
                    skipped.push(project.id.clone());
                    status.record_completed();
                }
                Some(upload) => match remote.save_project(&upload, user_id) {
                    Ok(()) => {
                        status.record_completed();
                        uploaded.push(upload);
                    }
                    Err(err) => {
                        tracing::warn!(project_id = %project.id, error = %err, "project upload failed");
                        status.record_failed(&project.id);
                    }
                },
            }
            status.updated_at_ms = now_ms;
            status.save(store.kv())?;
        }
        if !status.projects_failed.is_empty() {
            let err = MigrationError::UploadFailed {
                failed: status.projects_failed.clone(),
                total: status.projects_total,
            };
            return Err(self.abort(store, &mut status, err, notifier, now_ms));
        }

        // 4. verifying
        status.enter(MigrationPhase::Verifying, now_ms);
        status.save(store.kv())?;
        let missing_after_upload = match remote.load_projects(user_id) {
            Ok(after) => missing_items(&uploaded, &after),
            Err(err) => vec![format!("verification fetch failed: {err}")],
        };
        let mut report = MigrationReport {
            strategy,
            uploaded,
            skipped,
            missing_after_upload,
            local_cleared: false,
            snapshot: Some(snapshot),
        };
        if report.is_degraded() {
            // Local data and snapshot stay so nothing is lost.
            status.error = Some(format!(
                "missing after upload: {}",
                report.missing_after_upload.join(", ")
            ));
            status.enter(MigrationPhase::Completed, now_ms);
            status.save(store.kv())?;
            tracing::warn!(
                missing = report.missing_after_upload.len(),
                "migration completed with missing items"
            );
            notifier.notify(Notice::new(
                NoticeSeverity::Warning,
                "Migration incomplete",
                format!(
                    "{} items did not appear in your account. Your local copy was kept.",
                    report.missing_after_upload.len()
                ),
            ));
            return Ok(report);
        }

        // 5. cleaning
        status.enter(MigrationPhase::Cleaning, now_ms);
        status.save(store.kv())?;
        // Only what the snapshot holds; anything saved since stays local.
        for project in &local {
            store.delete_project(&project.id)?;
        }
        self.discard_snapshots(store);
        MigrationStatusRecord::clear(store.kv())?;
        report.local_cleared = true;

        tracing::info!(uploaded = report.uploaded.len(), "migration completed");
        notifier.notify(Notice::new(
            NoticeSeverity::Success,
            "Projects moved to your account",
            format!("{} projects are now synced.", report.uploaded.len()),
        ));
        Ok(report)
    }

    fn abort(
        &self,
        store: &mut LocalStore,
        status: &mut MigrationStatusRecord,
        err: MigrationError,
        notifier: &dyn Notifier,
        now_ms: i64,
    ) -> MigrationError {
        let step = status.status;
        status.fail(err.to_string(), now_ms);
        if let Err(save_err) = status.save(store.kv()) {
            tracing::error!(error = %save_err, "could not persist failed migration status");
        }
        tracing::error!(phase = step.as_str(), error = %err, "migration failed");
        notifier.notify(Notice::new(
            NoticeSeverity::Error,
            "Migration failed",
            format!("{err}. Your local projects were not changed."),
        ));
        err
    }

    /// Session store first, the persistent store when the snapshot is too
    /// large or the session write fails, a JSON file as the last resort. A
    /// session snapshot is also mirrored to the persistent store because the
    /// session does not outlive the process.
    fn take_snapshot(
        &mut self,
        store: &mut LocalStore,
        projects: &[Project],
        notifier: &dyn Notifier,
        now_ms: i64,
    ) -> Result<SnapshotLocation, MigrationError> {
        let snapshot = MigrationSnapshot::capture(projects.to_vec(), now_ms)?;
        let payload = serde_json::to_string(&snapshot)?;

        if payload.len() <= self.config.session_snapshot_max_bytes {
            match self.session.put(SESSION_SNAPSHOT_KEY, &payload) {
                Ok(()) => {
                    if let Err(err) = store.kv().put(PERSISTENT_SNAPSHOT_KEY, &payload) {
                        tracing::warn!(error = %err, "session snapshot not mirrored to the persistent store");
                    }
                    return Ok(SnapshotLocation::Session);
                }
                Err(err) => tracing::warn!(error = %err, "session snapshot failed"),
            }
        }
        match store.kv().put(PERSISTENT_SNAPSHOT_KEY, &payload) {
            Ok(()) => return Ok(SnapshotLocation::Persistent),
            Err(err) => tracing::warn!(error = %err, "persistent snapshot failed"),
        }

        let path = self
            .config
            .export_dir
            .join(format!("migration-snapshot-{}.json", file_stamp(now_ms)));
        let written = std::fs::create_dir_all(&self.config.export_dir)
            .and_then(|()| std::fs::write(&path, &payload));
        match written {
            Ok(()) => {
                notifier.notify(Notice::new(
                    NoticeSeverity::Info,
                    "Backup saved",
                    format!("A backup of your projects was saved to {}", path.display()),
                ));
                Ok(SnapshotLocation::File(path))
            }
            Err(err) => Err(MigrationError::SnapshotFailed(err.to_string())),
        }
    }

    fn discard_snapshots(&mut self, store: &mut LocalStore) {
        if let Err(err) = self.session.delete(SESSION_SNAPSHOT_KEY) {
            tracing::debug!(error = %err, "session snapshot not removed");
        }
        if let Err(err) = store.kv().delete(PERSISTENT_SNAPSHOT_KEY) {
            tracing::debug!(error = %err, "persistent snapshot not removed");
        }
    }

    fn load_snapshot(
        &self,
        store: &mut LocalStore,
        status: &MigrationStatusRecord,
    ) -> Result<(MigrationSnapshot, SnapshotLocation), MigrationError> {
        let mut found = Vec::new();
        if let Some(raw) = self.session.get(SESSION_SNAPSHOT_KEY)? {
            found.push((raw, SnapshotLocation::Session));
        }
        if let Some(raw) = store.kv().get(PERSISTENT_SNAPSHOT_KEY)? {
            found.push((raw, SnapshotLocation::Persistent));
        }
        if let Some(SnapshotLocation::File(path)) = status.snapshot.as_ref() {
            match std::fs::read_to_string(path) {
                Ok(raw) => found.push((raw, SnapshotLocation::File(path.clone()))),
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "snapshot file unreadable"),
            }
        }

        let mut saw_corrupt = false;
        for (raw, location) in found {
            match serde_json::from_str::<MigrationSnapshot>(&raw) {
                Ok(snapshot) if snapshot.is_intact() => return Ok((snapshot, location)),
                _ => {
                    tracing::warn!(?location, "migration snapshot failed its checksum");
                    saw_corrupt = true;
                }
            }
        }
        Err(if saw_corrupt {
            MigrationError::ChecksumMismatch
        } else {
            MigrationError::NoSnapshot
        })
    }

    /// Restores the pre-migration snapshot into the local store, then clears
    /// the status and snapshot. The status is left as it was when no intact
    /// snapshot can be found.
    pub fn rollback(
        &mut self,
        store: &mut LocalStore,
        notifier: &dyn Notifier,
        now_ms: i64,
    ) -> Result<RollbackReport, MigrationError> {
        let mut status = self.get_migration_status(store);
        let (snapshot, source) = self.load_snapshot(store, &status)?;
        status.enter(MigrationPhase::Rollback, now_ms);
        status.save(store.kv())?;

        let keep: BTreeSet<&str> = snapshot.projects.iter().map(|p| p.id.as_str()).collect();
        for project_id in store.project_ids() {
            if !keep.contains(project_id.as_str()) {
                store.delete_project(&project_id)?;
            }
        }
        let failed: Vec<String> = snapshot
            .projects
            .iter()
            .filter(|project| matches!(store.save_project(project), SaveOutcome::Failed { .. }))
            .map(|project| project.id.clone())
            .collect();
        if !failed.is_empty() {
            status.fail(format!("rollback could not restore {}", failed.join(", ")), now_ms);
            status.save(store.kv())?;
            return Err(MigrationError::RestoreFailed(failed));
        }

        self.discard_snapshots(store);
        MigrationStatusRecord::clear(store.kv())?;
        tracing::info!(restored = snapshot.projects.len(), ?source, "migration rolled back");
        notifier.notify(Notice::new(
            NoticeSeverity::Info,
            "Migration rolled back",
            "Your projects were restored to their state before the migration.",
        ));
        Ok(RollbackReport {
            restored: snapshot.projects.len(),
            source,
        })
    }
}

/// Loads every local project. Corrupt rows are discarded by the load itself,
/// so a second pass returns what survived; anything still unreadable is
/// reported.
fn load_guest_data(store: &mut LocalStore) -> LoadedProjects {
    let first = store.load_all_projects();
    if first.corrupted.is_empty() {
        return first;
    }
    tracing::warn!(
        corrupted = ?first.corrupted,
        "corrupted local records discarded; reloading guest data"
    );
    store.load_all_projects()
}

/// Every uploaded project and task id must come back from the remote.
fn missing_items(uploaded: &[Project], remote: &[Project]) -> Vec<String> {
    let mut missing = Vec::new();
    for project in uploaded {
        let Some(found) = remote.iter().find(|candidate| candidate.id == project.id) else {
            missing.push(format!("project:{}", project.id));
            continue;
        };
        let present: BTreeSet<&str> = found.tasks.iter().map(|task| task.id.as_str()).collect();
        for task in &project.tasks {
            if !present.contains(task.id.as_str()) {
                missing.push(format!("task:{}/{}", project.id, task.id));
            }
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use tv_core::Task;

    #[test]
    fn migration_needed_for_new_or_newer_local_projects() {
        let mut local = Project::new("p1", "a");
        local.version = 3;
        let mut remote = Project::new("p1", "a");
        remote.version = 3;
        assert!(!needs_migration(std::slice::from_ref(&local), std::slice::from_ref(&remote)));
        local.version = 4;
        assert!(needs_migration(std::slice::from_ref(&local), std::slice::from_ref(&remote)));
        assert!(needs_migration(&[Project::new("p2", "b")], &[remote]));
        assert!(!needs_migration(&[], &[]));
    }

    #[test]
    fn missing_items_name_projects_and_tasks() {
        let mut uploaded = Project::new("p1", "a");
        uploaded.tasks.push(Task::new("t1", "x", 1));
        uploaded.tasks.push(Task::new("t2", "y", 1));
        let mut echoed = uploaded.clone();
        echoed.tasks.pop();

        assert_eq!(
            missing_items(&[uploaded.clone(), Project::new("p2", "b")], &[echoed]),
            vec!["task:p1/t2".to_string(), "project:p2".to_string()]
        );
        assert!(missing_items(std::slice::from_ref(&uploaded), &[uploaded.clone()]).is_empty());
    }
}
