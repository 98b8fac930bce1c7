#![forbid(unsafe_code)]

//! Local Store Adapter: the primary SQLite tier with write verification and a
//! key-value fallback that takes over whenever the primary cannot be opened
//! or a write does not read back correctly.

use crate::StoreError;
use crate::kv::{FileKvStore, KvStore, MemoryKvStore};
use crate::sqlite::{SqliteStore, StoreMeta};
use crate::verify::verify_written;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tv_core::Project;
use tv_core::ports::{Telemetry, TelemetryLevel};

pub const FALLBACK_PROJECT_PREFIX: &str = "taskvault.project.";
pub const FALLBACK_META_KEY: &str = "taskvault.meta";

const WRITE_ATTEMPTS: u32 = 2;

pub fn fallback_project_key(project_id: &str) -> String {
    format!("{FALLBACK_PROJECT_PREFIX}{project_id}")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalStoreConfig {
    pub storage_dir: PathBuf,
    pub fallback_dir: PathBuf,
}

impl LocalStoreConfig {
    pub fn in_dir(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            storage_dir: root.join("db"),
            fallback_dir: root.join("fallback"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreTier {
    Primary,
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    Verified,
    VerifiedAfterRetry,
    /// Primary write did not verify (or the primary is unavailable); the
    /// project was written to the key-value fallback instead.
    FellBack { attempts: u32, reason: String },
    /// Neither tier accepted the write.
    Failed { reason: String },
}

impl SaveOutcome {
    pub fn is_durable(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Found(Project),
    Missing,
    /// Undecodable records were discarded; the caller should re-fetch the
    /// project from remote.
    Corrupted {
        project_id: String,
        discarded: Vec<String>,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadedProjects {
    pub projects: Vec<Project>,
    pub corrupted: Vec<String>,
}

enum Tier {
    Primary(SqliteStore),
    Fallback { reason: String },
}

pub struct LocalStore {
    config: LocalStoreConfig,
    tier: Option<Tier>,
    fallback: Box<dyn KvStore>,
    telemetry: Box<dyn Telemetry>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("config", &self.config)
            .field("initialized", &self.tier.is_some())
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Never fails: an unusable fallback directory degrades to a session-only
    /// memory store.
    pub fn new(config: LocalStoreConfig, telemetry: Box<dyn Telemetry>) -> Self {
        let fallback: Box<dyn KvStore> = match FileKvStore::open(&config.fallback_dir) {
            Ok(store) => Box::new(store),
            Err(err) => {
                tracing::warn!(
                    dir = %config.fallback_dir.display(),
                    error = %err,
                    "fallback directory unavailable; using session memory"
                );
                Box::new(MemoryKvStore::new())
            }
        };
        Self::with_fallback(config, fallback, telemetry)
    }

    pub fn with_fallback(
        config: LocalStoreConfig,
        fallback: Box<dyn KvStore>,
        telemetry: Box<dyn Telemetry>,
    ) -> Self {
        Self {
            config,
            tier: None,
            fallback,
            telemetry,
        }
    }

    pub fn config(&self) -> &LocalStoreConfig {
        &self.config
    }

    /// Opens the primary store on first use and caches the result; later
    /// calls never retry the open.
    pub fn tier(&mut self) -> StoreTier {
        self.ensure_tier();
        match self.tier {
            Some(Tier::Primary(_)) => StoreTier::Primary,
            _ => StoreTier::Fallback,
        }
    }

    fn ensure_tier(&mut self) {
        if self.tier.is_some() {
            return;
        }
        let tier = match SqliteStore::open(&self.config.storage_dir) {
            Ok(store) => Tier::Primary(store),
            Err(err) => {
                let reason = err.to_string();
                tracing::warn!(
                    dir = %self.config.storage_dir.display(),
                    error = %reason,
                    "primary store unavailable; degrading to fallback"
                );
                self.telemetry.capture_message(
                    TelemetryLevel::Warning,
                    "primary store unavailable",
                    &[("reason", reason.clone())],
                );
                Tier::Fallback { reason }
            }
        };
        self.tier = Some(tier);
    }

    fn primary(&mut self) -> Option<&mut SqliteStore> {
        self.ensure_tier();
        match self.tier.as_mut() {
            Some(Tier::Primary(store)) => Some(store),
            _ => None,
        }
    }

    pub fn save_project(&mut self, project: &Project) -> SaveOutcome {
        self.ensure_tier();
        let primary_result = match self.tier.as_mut() {
            Some(Tier::Primary(store)) => {
                write_with_retry(store, project).map_err(|reason| (WRITE_ATTEMPTS, reason))
            }
            Some(Tier::Fallback { reason }) => Err((0, reason.clone())),
            None => Err((0, "store not initialized".to_string())),
        };
        match primary_result {
            Ok(attempt) => {
                self.drop_stale_fallback_copy(&project.id);
                if attempt == 1 {
                    SaveOutcome::Verified
                } else {
                    SaveOutcome::VerifiedAfterRetry
                }
            }
            Err((attempts, reason)) => self.save_to_fallback(project, attempts, reason),
        }
    }

    fn save_to_fallback(&mut self, project: &Project, attempts: u32, reason: String) -> SaveOutcome {
        let key = fallback_project_key(&project.id);
        let written = serde_json::to_string(project)
            .map_err(StoreError::from)
            .and_then(|payload| self.fallback.put(&key, &payload));
        match written {
            Ok(()) => {
                if attempts > 0 {
                    tracing::warn!(
                        project_id = %project.id,
                        attempts,
                        reason = %reason,
                        "project write did not verify; saved to fallback"
                    );
                    self.telemetry.capture_message(
                        TelemetryLevel::Warning,
                        "project write verification failed",
                        &[
                            ("project_id", project.id.clone()),
                            ("attempts", attempts.to_string()),
                            ("reason", reason.clone()),
                        ],
                    );
                }
                SaveOutcome::FellBack { attempts, reason }
            }
            Err(err) => {
                tracing::error!(project_id = %project.id, error = %err, "fallback write failed");
                self.telemetry
                    .capture_error(&err, &[("project_id", project.id.clone())]);
                SaveOutcome::Failed {
                    reason: format!("{reason}; fallback: {err}"),
                }
            }
        }
    }

    fn drop_stale_fallback_copy(&mut self, project_id: &str) {
        if let Err(err) = self.fallback.delete(&fallback_project_key(project_id)) {
            tracing::debug!(project_id, error = %err, "could not drop stale fallback copy");
        }
    }

    pub fn load_project(&mut self, project_id: &str) -> LoadOutcome {
        let mut discarded = Vec::new();

        let primary_copy = match self.primary().map(|store| store.load_project(project_id)) {
            Some(Ok(read)) => {
                discarded.extend(read.discarded);
                read.project
            }
            Some(Err(err)) => {
                tracing::warn!(project_id, error = %err, "primary read failed");
                None
            }
            None => None,
        };

        let key = fallback_project_key(project_id);
        let fallback_copy = match self.fallback.get(&key) {
            Ok(Some(raw)) => match serde_json::from_str::<Project>(&raw) {
                Ok(project) => Some(project),
                Err(_) => {
                    tracing::warn!(project_id, "discarding corrupted fallback copy");
                    if let Err(err) = self.fallback.delete(&key) {
                        tracing::debug!(project_id, error = %err, "could not delete fallback copy");
                    }
                    discarded.push(key);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(project_id, error = %err, "fallback read failed");
                None
            }
        };

        if !discarded.is_empty() {
            self.telemetry.capture_message(
                TelemetryLevel::Warning,
                "corrupted local records discarded",
                &[
                    ("project_id", project_id.to_string()),
                    ("discarded", discarded.join(",")),
                ],
            );
            return LoadOutcome::Corrupted {
                project_id: project_id.to_string(),
                discarded,
            };
        }

        match (primary_copy, fallback_copy) {
            (Some(primary), Some(fallback)) if fallback.version >= primary.version => {
                LoadOutcome::Found(fallback)
            }
            (Some(primary), _) => LoadOutcome::Found(primary),
            (None, Some(fallback)) => LoadOutcome::Found(fallback),
            (None, None) => LoadOutcome::Missing,
        }
    }

    pub fn project_ids(&mut self) -> Vec<String> {
        let mut ids = BTreeSet::new();
        if let Some(store) = self.primary() {
            match store.project_ids() {
                Ok(found) => ids.extend(found),
                Err(err) => tracing::warn!(error = %err, "listing primary projects failed"),
            }
        }
        match self.fallback.keys_with_prefix(FALLBACK_PROJECT_PREFIX) {
            Ok(keys) => ids.extend(
                keys.iter()
                    .filter_map(|key| key.strip_prefix(FALLBACK_PROJECT_PREFIX))
                    .map(str::to_string),
            ),
            Err(err) => tracing::warn!(error = %err, "listing fallback projects failed"),
        }
        ids.into_iter().collect()
    }

    pub fn load_all_projects(&mut self) -> LoadedProjects {
        let mut loaded = LoadedProjects::default();
        for project_id in self.project_ids() {
            match self.load_project(&project_id) {
                LoadOutcome::Found(project) => loaded.projects.push(project),
                LoadOutcome::Missing => {}
                LoadOutcome::Corrupted { project_id, .. } => loaded.corrupted.push(project_id),
            }
        }
        loaded
    }

    pub fn delete_project(&mut self, project_id: &str) -> Result<bool, StoreError> {
        let removed = match self.primary() {
            Some(store) => store.delete_project(project_id)?,
            None => false,
        };
        let key = fallback_project_key(project_id);
        let had_fallback = self.fallback.get(&key)?.is_some();
        self.fallback.delete(&key)?;
        Ok(removed || had_fallback)
    }

    pub fn meta(&mut self) -> StoreMeta {
        let read = match self.primary() {
            Some(store) => store.meta(),
            None => self.fallback.get(FALLBACK_META_KEY).and_then(|raw| {
                raw.map(|raw| serde_json::from_str::<StoreMeta>(&raw))
                    .transpose()
                    .map(Option::unwrap_or_default)
                    .map_err(StoreError::from)
            }),
        };
        read.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "store meta unreadable; using defaults");
            StoreMeta::default()
        })
    }

    pub fn update_meta(&mut self, update: impl FnOnce(&mut StoreMeta)) -> Result<StoreMeta, StoreError> {
        let mut meta = self.meta();
        update(&mut meta);
        match self.primary() {
            Some(store) => store.set_meta(&meta)?,
            None => {
                let payload = serde_json::to_string(&meta)?;
                self.fallback.put(FALLBACK_META_KEY, &payload)?;
            }
        }
        Ok(meta)
    }

    /// Namespaced document store of the active tier.
    pub fn kv(&mut self) -> &mut dyn KvStore {
        self.ensure_tier();
        match self.tier.as_mut() {
            Some(Tier::Primary(store)) => store as &mut dyn KvStore,
            _ => self.fallback.as_mut(),
        }
    }

    pub fn fallback_kv(&mut self) -> &mut dyn KvStore {
        self.fallback.as_mut()
    }

    /// Reason the primary tier was abandoned, once initialization has run.
    pub fn degraded_reason(&self) -> Option<&str> {
        match self.tier.as_ref() {
            Some(Tier::Fallback { reason }) => Some(reason),
            _ => None,
        }
    }

    /// Writes the current local copy of a project as pretty JSON to `path`.
    pub fn export_project(&mut self, project_id: &str, path: &Path) -> Result<(), StoreError> {
        let project = match self.load_project(project_id) {
            LoadOutcome::Found(project) => project,
            LoadOutcome::Missing | LoadOutcome::Corrupted { .. } => return Err(StoreError::UnknownId),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&project)?)?;
        tracing::info!(project_id, path = %path.display(), "project exported");
        Ok(())
    }
}

/// Writes then re-reads; one full retry on failure. Returns the attempt that
/// verified, or the last failure reason.
fn write_with_retry(store: &mut SqliteStore, project: &Project) -> Result<u32, String> {
    let mut reason = String::new();
    for attempt in 1..=WRITE_ATTEMPTS {
        let verified = store
            .write_project(project)
            .map_err(|err| err.to_string())
            .and_then(|()| store.written_shape(&project.id).map_err(|err| err.to_string()))
            .and_then(|shape| verify_written(project, shape.as_ref()).map_err(|err| err.to_string()));
        match verified {
            Ok(()) => return Ok(attempt),
            Err(err) => {
                tracing::warn!(project_id = %project.id, attempt, error = %err, "project write did not verify");
                reason = err;
            }
        }
    }
    Err(reason)
}
