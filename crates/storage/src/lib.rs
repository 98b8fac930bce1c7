#![forbid(unsafe_code)]

mod error;
pub mod kv;
pub mod local;
mod schema;
pub mod sqlite;
pub mod verify;

pub use error::StoreError;
pub use kv::{FileKvStore, KvStore, MemoryKvStore};
pub use local::{
    LoadOutcome, LoadedProjects, LocalStore, LocalStoreConfig, SaveOutcome, StoreTier,
    fallback_project_key,
};
pub use sqlite::{Collection, ProjectRecord, Record, SqliteStore, StoreMeta, StoreTx};
