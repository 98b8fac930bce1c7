#![forbid(unsafe_code)]

pub mod config;
pub mod debounce;
pub mod engine;
pub mod migration;
pub mod remote;
pub mod time;

pub use config::{ConfigError, MigrationConfig, SyncConfig};
pub use engine::{PushOutcome, QUEUE_JOURNAL_KEY, ShutdownReport, SyncEngine, SyncError};
pub use migration::{
    MigrationError, MigrationOrchestrator, MigrationPhase, MigrationReport, MigrationStatusRecord,
    RollbackReport, SnapshotLocation, needs_migration,
};
pub use remote::{RemoteBackend, RemoteError};
