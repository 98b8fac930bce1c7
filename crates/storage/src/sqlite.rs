#![forbid(unsafe_code)]

use crate::StoreError;
use crate::kv::KvStore;
use crate::schema::migrate_sqlite_schema;
use crate::verify::WrittenShape;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tv_core::model::{Project, ProjectHeader};
use tv_core::{Connection as TaskConnection, Task};

pub const DB_FILE_NAME: &str = "taskvault.db";

const META_VERSION: &str = "store.version";
const META_LAST_SYNC: &str = "store.last_sync_time_ms";
const META_ACTIVE_PROJECT: &str = "store.active_project_id";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collection {
    Projects,
    Tasks,
    Connections,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Projects => "projects",
            Self::Tasks => "tasks",
            Self::Connections => "connections",
        }
    }
}

/// A row in one of the entity collections, stored as JSON keyed by id with a
/// `project_id` secondary index.
pub trait Record: Serialize + DeserializeOwned {
    const COLLECTION: Collection;

    fn record_id(&self) -> &str;

    fn record_updated_at_ms(&self) -> i64 {
        0
    }
}

impl Record for Task {
    const COLLECTION: Collection = Collection::Tasks;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn record_updated_at_ms(&self) -> i64 {
        self.updated_at_ms
    }
}

impl Record for TaskConnection {
    const COLLECTION: Collection = Collection::Connections;

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Project row: the header plus tombstones. Tasks and connections live in
/// their own collections.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    #[serde(flatten)]
    pub header: ProjectHeader,
    #[serde(default)]
    pub tombstones: BTreeMap<String, i64>,
}

impl ProjectRecord {
    pub fn of(project: &Project) -> Self {
        Self {
            header: project.header(),
            tombstones: project.tombstones.clone(),
        }
    }
}

impl Record for ProjectRecord {
    const COLLECTION: Collection = Collection::Projects;

    fn record_id(&self) -> &str {
        &self.header.id
    }

    fn record_updated_at_ms(&self) -> i64 {
        self.header.updated_at_ms
    }
}

/// Records read through an index, with the ids of rows that failed to decode.
#[derive(Debug)]
pub struct IndexScan<R> {
    pub records: Vec<R>,
    pub corrupt_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub version: i64,
    pub last_sync_time_ms: Option<i64>,
    pub active_project_id: Option<String>,
}

/// Result of reading one project back from the primary tier. Rows that no
/// longer decode are deleted during the read and listed in `discarded`.
#[derive(Debug, Default)]
pub struct ProjectRead {
    pub project: Option<Project>,
    pub discarded: Vec<String>,
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let db_path = storage_dir.join(DB_FILE_NAME);
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrate_sqlite_schema(&conn)?;

        Ok(Self { conn, storage_dir })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join(DB_FILE_NAME)
    }

    pub fn transaction(&mut self) -> Result<StoreTx<'_>, StoreError> {
        Ok(StoreTx {
            tx: self.conn.transaction()?,
        })
    }

    /// Writes the project row and replaces all of its task and connection
    /// rows in one transaction.
    pub fn write_project(&mut self, project: &Project) -> Result<(), StoreError> {
        if project.id.trim().is_empty() {
            return Err(StoreError::InvalidInput("project id must not be empty"));
        }
        let tx = self.transaction()?;
        tx.delete_by_index(Collection::Tasks, &project.id)?;
        tx.delete_by_index(Collection::Connections, &project.id)?;
        tx.put(&project.id, &ProjectRecord::of(project))?;
        for task in &project.tasks {
            tx.put(&project.id, task)?;
        }
        for connection in &project.connections {
            tx.put(&project.id, connection)?;
        }
        tx.commit()
    }

    /// Read-only pass over what a project write actually left behind.
    pub fn written_shape(&self, project_id: &str) -> Result<Option<WrittenShape>, StoreError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM projects WHERE id=?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let header = serde_json::from_str::<ProjectRecord>(&payload)
            .ok()
            .map(|record| record.header);
        Ok(Some(WrittenShape {
            header,
            task_count: count_rows(&self.conn, Collection::Tasks, project_id)?,
            connection_count: count_rows(&self.conn, Collection::Connections, project_id)?,
        }))
    }

    pub fn load_project(&mut self, project_id: &str) -> Result<ProjectRead, StoreError> {
        let tx = self.transaction()?;
        let record = match tx.get_by_id::<ProjectRecord>(project_id) {
            Ok(record) => record,
            Err(StoreError::Corrupt { .. }) => {
                tx.delete_by_id(Collection::Projects, project_id)?;
                tx.delete_by_index(Collection::Tasks, project_id)?;
                tx.delete_by_index(Collection::Connections, project_id)?;
                tx.commit()?;
                return Ok(ProjectRead {
                    project: None,
                    discarded: vec![project_id.to_string()],
                });
            }
            Err(err) => return Err(err),
        };
        let Some(record) = record else {
            return Ok(ProjectRead::default());
        };

        let tasks = tx.scan_by_index::<Task>(project_id)?;
        let connections = tx.scan_by_index::<TaskConnection>(project_id)?;
        let mut discarded = tasks.corrupt_ids;
        discarded.extend(connections.corrupt_ids);
        tx.commit()?;

        let ProjectHeader {
            id,
            name,
            description,
            version,
            updated_at_ms,
        } = record.header;
        Ok(ProjectRead {
            project: Some(Project {
                id,
                name,
                description,
                version,
                updated_at_ms,
                tasks: tasks.records,
                connections: connections.records,
                tombstones: record.tombstones,
            }),
            discarded,
        })
    }

    pub fn project_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT id FROM projects ORDER BY id ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get::<_, String>(0)?);
        }
        Ok(out)
    }

    pub fn delete_project(&mut self, project_id: &str) -> Result<bool, StoreError> {
        let tx = self.transaction()?;
        let removed = tx.delete_by_id(Collection::Projects, project_id)?;
        tx.delete_by_index(Collection::Tasks, project_id)?;
        tx.delete_by_index(Collection::Connections, project_id)?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn meta(&self) -> Result<StoreMeta, StoreError> {
        let version = read_meta(&self.conn, META_VERSION)?
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or_default();
        let last_sync_time_ms =
            read_meta(&self.conn, META_LAST_SYNC)?.and_then(|raw| raw.parse::<i64>().ok());
        let active_project_id = read_meta(&self.conn, META_ACTIVE_PROJECT)?;
        Ok(StoreMeta {
            version,
            last_sync_time_ms,
            active_project_id,
        })
    }

    pub fn set_meta(&mut self, meta: &StoreMeta) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        write_meta_tx(&tx, META_VERSION, Some(meta.version.to_string()))?;
        write_meta_tx(
            &tx,
            META_LAST_SYNC,
            meta.last_sync_time_ms.map(|value| value.to_string()),
        )?;
        write_meta_tx(&tx, META_ACTIVE_PROJECT, meta.active_project_id.clone())?;
        tx.commit()?;
        Ok(())
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT value FROM kv WHERE key=?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO kv(key, value, updated_at_ms) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms",
            params![key, value, wall_clock_ms()],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM kv WHERE key=?1", params![key])?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key ASC")?;
        let mut rows = stmt.query(params![prefix])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get::<_, String>(0)?);
        }
        Ok(out)
    }
}

/// Explicit transaction scope over the entity collections. Dropping it
/// without `commit` rolls everything back.
pub struct StoreTx<'a> {
    tx: Transaction<'a>,
}

impl StoreTx<'_> {
    pub fn put<R: Record>(&self, project_id: &str, record: &R) -> Result<(), StoreError> {
        let id = record.record_id();
        if id.trim().is_empty() {
            return Err(StoreError::InvalidInput("record id must not be empty"));
        }
        let payload = serde_json::to_string(record)?;
        self.tx.execute(
            &format!(
                "INSERT INTO {}(id, project_id, payload_json, updated_at_ms) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(id) DO UPDATE SET project_id=excluded.project_id, \
                 payload_json=excluded.payload_json, updated_at_ms=excluded.updated_at_ms",
                R::COLLECTION.as_str()
            ),
            params![id, project_id, payload, record.record_updated_at_ms()],
        )?;
        Ok(())
    }

    pub fn get_by_id<R: Record>(&self, id: &str) -> Result<Option<R>, StoreError> {
        let payload: Option<String> = self
            .tx
            .query_row(
                &format!(
                    "SELECT payload_json FROM {} WHERE id=?1",
                    R::COLLECTION.as_str()
                ),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|payload| {
                serde_json::from_str::<R>(&payload).map_err(|_| StoreError::Corrupt {
                    collection: R::COLLECTION.as_str(),
                    id: id.to_string(),
                })
            })
            .transpose()
    }

    /// Strict index read: any undecodable row fails the call.
    pub fn get_by_index<R: Record>(&self, project_id: &str) -> Result<Vec<R>, StoreError> {
        let (records, mut corrupt) = self.read_index::<R>(project_id)?;
        match corrupt.pop() {
            Some(id) => Err(StoreError::Corrupt {
                collection: R::COLLECTION.as_str(),
                id,
            }),
            None => Ok(records),
        }
    }

    /// Lenient index read: undecodable rows are deleted and reported.
    pub fn scan_by_index<R: Record>(&self, project_id: &str) -> Result<IndexScan<R>, StoreError> {
        let (records, corrupt_ids) = self.read_index::<R>(project_id)?;
        for id in &corrupt_ids {
            tracing::warn!(
                collection = R::COLLECTION.as_str(),
                id = %id,
                project_id,
                "discarding corrupted record"
            );
            self.delete_by_id(R::COLLECTION, id)?;
        }
        Ok(IndexScan {
            records,
            corrupt_ids,
        })
    }

    fn read_index<R: Record>(&self, project_id: &str) -> Result<(Vec<R>, Vec<String>), StoreError> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT id, payload_json FROM {} WHERE project_id=?1 ORDER BY rowid ASC",
            R::COLLECTION.as_str()
        ))?;
        let mut rows = stmt.query(params![project_id])?;
        let mut records = Vec::new();
        let mut corrupt = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let payload: String = row.get(1)?;
            match serde_json::from_str::<R>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => corrupt.push(id),
            }
        }
        Ok((records, corrupt))
    }

    pub fn count_by_index(&self, collection: Collection, project_id: &str) -> Result<usize, StoreError> {
        count_rows(&self.tx, collection, project_id)
    }

    pub fn delete_by_id(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        let removed = self.tx.execute(
            &format!("DELETE FROM {} WHERE id=?1", collection.as_str()),
            params![id],
        )?;
        Ok(removed > 0)
    }

    pub fn delete_by_index(&self, collection: Collection, project_id: &str) -> Result<usize, StoreError> {
        Ok(self.tx.execute(
            &format!("DELETE FROM {} WHERE project_id=?1", collection.as_str()),
            params![project_id],
        )?)
    }

    pub fn commit(self) -> Result<(), StoreError> {
        self.tx.commit()?;
        Ok(())
    }
}

fn count_rows(conn: &Connection, collection: Collection, project_id: &str) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE project_id=?1",
            collection.as_str()
        ),
        params![project_id],
        |row| row.get(0),
    )?;
    usize::try_from(count).map_err(|_| StoreError::InvalidInput("negative row count"))
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row("SELECT value FROM meta WHERE key=?1", params![key], |row| {
            row.get(0)
        })
        .optional()?)
}

fn write_meta_tx(tx: &Transaction<'_>, key: &str, value: Option<String>) -> Result<(), StoreError> {
    match value {
        Some(value) => {
            tx.execute(
                "INSERT INTO meta(key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                params![key, value],
            )?;
        }
        None => {
            tx.execute("DELETE FROM meta WHERE key=?1", params![key])?;
        }
    }
    Ok(())
}

fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
