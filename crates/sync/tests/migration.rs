#![forbid(unsafe_code)]

mod common;

use common::{FakeRemote, open_local_store, project_with_tasks};
use std::path::Path;
use tv_core::merge::MigrationStrategy;
use tv_core::ports::{NoticeSeverity, RecordingNotifier, TracingTelemetry};
use tv_core::Project;
use tv_storage::sqlite::DB_FILE_NAME;
use tv_storage::{KvStore, LocalStore, LocalStoreConfig, MemoryKvStore, StoreError};
use tv_sync::migration::PERSISTENT_SNAPSHOT_KEY;
use tv_sync::{
    MigrationConfig, MigrationError, MigrationOrchestrator, MigrationPhase, SnapshotLocation,
};

/// Accepts everything except migration snapshots.
#[derive(Debug, Default)]
struct RefusesSnapshots(MemoryKvStore);

impl KvStore for RefusesSnapshots {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.0.get(key)
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        if key.contains("snapshot") {
            return Err(StoreError::QuotaExceeded {
                limit_bytes: 0,
                requested_bytes: value.len(),
            });
        }
        self.0.put(key, value)
    }

    fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.0.delete(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.0.keys_with_prefix(prefix)
    }
}

fn orchestrator(root: &Path) -> MigrationOrchestrator {
    MigrationOrchestrator::new(MigrationConfig {
        export_dir: root.join("exports"),
        ..MigrationConfig::default()
    })
}

fn seeded_store(root: &Path, projects: &[Project]) -> LocalStore {
    let mut store = open_local_store(root);
    for project in projects {
        assert!(store.save_project(project).is_durable());
    }
    store
}

#[test]
fn successful_migration_uploads_and_clears_guest_data() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = seeded_store(dir.path(), &[project_with_tasks("p1", 2), project_with_tasks("p2", 3)]);
    let mut remote = FakeRemote::default();
    let notifier = RecordingNotifier::default();
    let mut migration = orchestrator(dir.path());

    let report = migration
        .run(&mut store, &mut remote, "user-1", MigrationStrategy::Merge, &notifier, 1_000)
        .expect("migration");

    assert_eq!(report.uploaded.len(), 2);
    assert!(report.skipped.is_empty());
    assert!(!report.is_degraded());
    assert!(report.local_cleared);
    assert_eq!(report.snapshot, Some(SnapshotLocation::Session));
    assert_eq!(remote.projects["p2"].tasks.len(), 3);
    assert!(migration.get_local_guest_data(&mut store).is_empty());
    assert!(!migration.has_unfinished_migration(&mut store));
    assert_eq!(notifier.count(NoticeSeverity::Success), 1);
    assert!(matches!(
        migration.rollback(&mut store, &notifier, 2_000),
        Err(MigrationError::NoSnapshot)
    ));
}

#[test]
fn failed_upload_leaves_guest_data_untouched() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = seeded_store(dir.path(), &[project_with_tasks("p1", 2), project_with_tasks("p2", 3)]);
    let mut remote = FakeRemote::default();
    remote.fail_save_ids.insert("p2".to_string());
    let notifier = RecordingNotifier::default();
    let mut migration = orchestrator(dir.path());
    let before = migration.get_local_guest_data(&mut store);

    let err = migration
        .run(&mut store, &mut remote, "user-1", MigrationStrategy::LocalWins, &notifier, 1_000)
        .expect_err("upload failure must abort");
    assert!(matches!(
        &err,
        MigrationError::UploadFailed { failed, total: 2 } if failed == &vec!["p2".to_string()]
    ));

    assert_eq!(migration.get_local_guest_data(&mut store), before);
    assert!(migration.has_unfinished_migration(&mut store));
    let status = migration.get_migration_status(&mut store);
    assert_eq!(status.status, MigrationPhase::Failed);
    assert_eq!(status.phase, 3);
    assert_eq!(status.projects_total, 2);
    assert_eq!(status.projects_completed, 1);
    assert_eq!(status.projects_failed, vec!["p2".to_string()]);
    assert!(status.error.is_some());
    assert_eq!(notifier.count(NoticeSeverity::Error), 1);

    let rollback = migration
        .rollback(&mut store, &notifier, 2_000)
        .expect("rollback");
    assert_eq!(rollback.restored, 2);
    assert_eq!(rollback.source, SnapshotLocation::Session);
    assert_eq!(migration.get_local_guest_data(&mut store), before);
    assert!(!migration.has_unfinished_migration(&mut store));
}

#[test]
fn integrity_errors_stop_before_anything_is_uploaded() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = seeded_store(dir.path(), &[project_with_tasks("bad id", 1)]);
    let mut remote = FakeRemote::default();
    let notifier = RecordingNotifier::default();
    let mut migration = orchestrator(dir.path());

    let err = migration
        .run(&mut store, &mut remote, "user-1", MigrationStrategy::Merge, &notifier, 1_000)
        .expect_err("invalid ids must fail validation");
    assert!(matches!(err, MigrationError::IntegrityFailed(_)));
    assert_eq!(remote.save_calls, 0);
    assert_eq!(migration.get_migration_status(&mut store).phase, 2);
    assert_eq!(migration.get_local_guest_data(&mut store).len(), 1);
}

#[test]
fn unreachable_remote_aborts_the_run() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = seeded_store(dir.path(), &[project_with_tasks("p1", 1)]);
    let mut remote = FakeRemote {
        fail_loads: true,
        ..FakeRemote::default()
    };
    let notifier = RecordingNotifier::default();
    let mut migration = orchestrator(dir.path());

    let err = migration
        .run(&mut store, &mut remote, "user-1", MigrationStrategy::Merge, &notifier, 1_000)
        .expect_err("remote down");
    assert!(matches!(err, MigrationError::RemoteUnavailable(_)));
    assert_eq!(migration.get_local_guest_data(&mut store).len(), 1);
    assert_eq!(
        migration.get_migration_status(&mut store).status,
        MigrationPhase::Failed
    );
}

#[test]
fn missing_items_after_upload_keep_the_local_copy() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = seeded_store(dir.path(), &[project_with_tasks("p1", 3)]);
    let mut remote = FakeRemote::default();
    remote.lose_task_ids.insert("p1-t2".to_string());
    let notifier = RecordingNotifier::default();
    let mut migration = orchestrator(dir.path());

    let report = migration
        .run(&mut store, &mut remote, "user-1", MigrationStrategy::Merge, &notifier, 1_000)
        .expect("degraded run still completes");
    assert!(report.is_degraded());
    assert_eq!(report.missing_after_upload, vec!["task:p1/p1-t2".to_string()]);
    assert!(!report.local_cleared);
    assert_eq!(migration.get_local_guest_data(&mut store).len(), 1);

    let status = migration.get_migration_status(&mut store);
    assert_eq!(status.status, MigrationPhase::Completed);
    assert!(status.error.is_some_and(|error| error.contains("p1-t2")));
    assert!(!migration.has_unfinished_migration(&mut store));
    assert_eq!(notifier.count(NoticeSeverity::Warning), 1);
}

#[test]
fn strategies_decide_what_is_uploaded() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut local_p1 = project_with_tasks("p1", 1);
    local_p1.version = 5;
    let mut store = seeded_store(dir.path(), &[local_p1, project_with_tasks("p2", 1)]);
    let mut remote_p1 = project_with_tasks("p1", 4);
    remote_p1.version = 2;
    let mut remote = FakeRemote::with_projects([remote_p1]);
    let notifier = RecordingNotifier::default();
    let mut migration = orchestrator(dir.path());

    let report = migration
        .run(&mut store, &mut remote, "user-1", MigrationStrategy::RemoteWins, &notifier, 1_000)
        .expect("migration");
    assert_eq!(report.skipped, vec!["p1".to_string()]);
    assert_eq!(report.uploaded.len(), 1);
    assert_eq!(report.uploaded[0].id, "p2");
    assert_eq!(remote.projects["p1"].tasks.len(), 4);

    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = seeded_store(dir.path(), &[project_with_tasks("p3", 2)]);
    let mut remote = FakeRemote::default();
    let report = migration
        .run(&mut store, &mut remote, "user-1", MigrationStrategy::DiscardLocal, &notifier, 2_000)
        .expect("migration");
    assert!(report.uploaded.is_empty());
    assert!(report.local_cleared);
    assert_eq!(remote.save_calls, 0);
}

#[test]
fn oversized_snapshots_go_to_the_persistent_store() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = seeded_store(dir.path(), &[project_with_tasks("p1", 2)]);
    let mut remote = FakeRemote::default();
    remote.fail_save_ids.insert("p1".to_string());
    let notifier = RecordingNotifier::default();
    let mut migration = MigrationOrchestrator::with_session_store(
        MigrationConfig {
            export_dir: dir.path().join("exports"),
            ..MigrationConfig::default()
        },
        Box::new(MemoryKvStore::with_quota(16)),
    );

    migration
        .run(&mut store, &mut remote, "user-1", MigrationStrategy::Merge, &notifier, 1_000)
        .expect_err("upload fails");
    assert!(store.kv().get(PERSISTENT_SNAPSHOT_KEY).expect("read").is_some());

    let rollback = migration.rollback(&mut store, &notifier, 2_000).expect("rollback");
    assert_eq!(rollback.source, SnapshotLocation::Persistent);
    assert!(store.kv().get(PERSISTENT_SNAPSHOT_KEY).expect("read").is_none());
}

#[test]
fn snapshot_falls_back_to_an_export_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let blocked = dir.path().join("blocked");
    std::fs::write(&blocked, b"not a directory").expect("write blocker");
    let mut store = LocalStore::with_fallback(
        LocalStoreConfig {
            storage_dir: blocked.join("db"),
            fallback_dir: dir.path().join("fallback"),
        },
        Box::new(RefusesSnapshots::default()),
        Box::new(TracingTelemetry),
    );
    assert!(store.save_project(&project_with_tasks("p1", 2)).is_durable());
    let before = store.load_all_projects().projects;

    let mut remote = FakeRemote::default();
    remote.fail_save_ids.insert("p1".to_string());
    let notifier = RecordingNotifier::default();
    let mut migration = MigrationOrchestrator::with_session_store(
        MigrationConfig {
            session_snapshot_max_bytes: 0,
            export_dir: dir.path().join("exports"),
        },
        Box::new(MemoryKvStore::new()),
    );

    migration
        .run(&mut store, &mut remote, "user-1", MigrationStrategy::Merge, &notifier, 1_000)
        .expect_err("upload fails");
    let status = migration.get_migration_status(&mut store);
    let Some(SnapshotLocation::File(snapshot_file)) = status.snapshot else {
        panic!("file snapshot should be recorded");
    };
    assert!(snapshot_file.starts_with(dir.path().join("exports")));
    assert!(snapshot_file.exists());
    assert!(notifier.count(NoticeSeverity::Info) >= 1);

    let rollback = migration.rollback(&mut store, &notifier, 2_000).expect("rollback");
    assert_eq!(rollback.source, SnapshotLocation::File(snapshot_file));
    assert_eq!(store.load_all_projects().projects, before);
}

#[test]
fn tampered_snapshot_is_refused() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = seeded_store(dir.path(), &[project_with_tasks("p1", 2)]);
    let mut remote = FakeRemote::default();
    remote.fail_save_ids.insert("p1".to_string());
    let notifier = RecordingNotifier::default();
    let mut migration = MigrationOrchestrator::with_session_store(
        MigrationConfig {
            session_snapshot_max_bytes: 0,
            export_dir: dir.path().join("exports"),
        },
        Box::new(MemoryKvStore::new()),
    );
    migration
        .run(&mut store, &mut remote, "user-1", MigrationStrategy::Merge, &notifier, 1_000)
        .expect_err("upload fails");

    let raw = store
        .kv()
        .get(PERSISTENT_SNAPSHOT_KEY)
        .expect("read")
        .expect("persistent snapshot");
    let mut value: serde_json::Value = serde_json::from_str(&raw).expect("parse");
    value["projects"][0]["name"] = serde_json::Value::from("tampered");
    store
        .kv()
        .put(PERSISTENT_SNAPSHOT_KEY, &value.to_string())
        .expect("write");

    assert!(matches!(
        migration.rollback(&mut store, &notifier, 2_000),
        Err(MigrationError::ChecksumMismatch)
    ));
    // A refused rollback leaves the failed run as it was.
    let status = migration.get_migration_status(&mut store);
    assert_eq!(status.status, MigrationPhase::Failed);
    assert_eq!(status.phase, 3);
    assert_eq!(migration.get_local_guest_data(&mut store).len(), 1);
}

#[test]
fn interrupted_run_rolls_back_after_a_restart() {
    let dir = tempfile::tempdir().expect("temp dir");
    let before = {
        let mut store =
            seeded_store(dir.path(), &[project_with_tasks("p1", 2), project_with_tasks("p2", 3)]);
        let mut remote = FakeRemote::default();
        remote.fail_save_ids.insert("p2".to_string());
        let notifier = RecordingNotifier::default();
        let mut migration = orchestrator(dir.path());
        let before = migration.get_local_guest_data(&mut store);
        migration
            .run(&mut store, &mut remote, "user-1", MigrationStrategy::Merge, &notifier, 1_000)
            .expect_err("upload fails");
        assert_eq!(
            migration.get_migration_status(&mut store).snapshot,
            Some(SnapshotLocation::Session)
        );
        before
    };

    // New process: fresh session store, same data directory.
    let mut store = open_local_store(dir.path());
    let notifier = RecordingNotifier::default();
    let mut migration = orchestrator(dir.path());
    assert!(migration.has_unfinished_migration(&mut store));

    let rollback = migration
        .rollback(&mut store, &notifier, 5_000)
        .expect("rollback after restart");
    assert_eq!(rollback.source, SnapshotLocation::Persistent);
    assert_eq!(rollback.restored, 2);
    assert_eq!(migration.get_local_guest_data(&mut store), before);
    assert!(!migration.has_unfinished_migration(&mut store));
    assert!(store.kv().get(PERSISTENT_SNAPSHOT_KEY).expect("read").is_none());
}

#[test]
fn corrupt_task_row_does_not_cost_the_whole_project() {
    let dir = tempfile::tempdir().expect("temp dir");
    drop(seeded_store(dir.path(), &[project_with_tasks("p1", 3)]));

    let db_path = LocalStoreConfig::in_dir(dir.path()).storage_dir.join(DB_FILE_NAME);
    let raw = rusqlite::Connection::open(db_path).expect("raw connection");
    raw.execute("UPDATE tasks SET payload_json='garbage' WHERE id='p1-t0'", [])
        .expect("corrupt row");
    drop(raw);

    let mut store = open_local_store(dir.path());
    let mut remote = FakeRemote::default();
    let notifier = RecordingNotifier::default();
    let mut migration = orchestrator(dir.path());

    let report = migration
        .run(&mut store, &mut remote, "user-1", MigrationStrategy::Merge, &notifier, 1_000)
        .expect("migration");
    assert_eq!(report.uploaded.len(), 1);
    let mut uploaded: Vec<&str> = remote.projects["p1"]
        .tasks
        .iter()
        .map(|task| task.id.as_str())
        .collect();
    uploaded.sort_unstable();
    assert_eq!(uploaded, vec!["p1-t1", "p1-t2"]);
    assert!(report.local_cleared);
    assert!(migration.get_local_guest_data(&mut store).is_empty());
}
