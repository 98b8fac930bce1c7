#![forbid(unsafe_code)]

use std::path::PathBuf;
use tv_core::breaker::BreakerConfig;
use tv_core::queue::QueueConfig;
use tv_core::undo::UndoConfig;
use tv_storage::LocalStoreConfig;

const DEFAULT_DATA_DIR: &str = ".taskvault";
const DEFAULT_SAVE_DEBOUNCE_MS: i64 = 800;
const DEFAULT_SESSION_SNAPSHOT_MAX_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Snapshots larger than this skip the session store and go straight to
    /// the persistent one.
    pub session_snapshot_max_bytes: usize,
    pub export_dir: PathBuf,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            session_snapshot_max_bytes: DEFAULT_SESSION_SNAPSHOT_MAX_BYTES,
            export_dir: PathBuf::from(DEFAULT_DATA_DIR).join("exports"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SyncConfig {
    pub store: LocalStoreConfig,
    pub save_debounce_ms: i64,
    /// Write the queue journal after every queue mutation.
    pub persist_queue: bool,
    pub queue: QueueConfig,
    pub breaker: BreakerConfig,
    pub undo: UndoConfig,
    pub migration: MigrationConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store: LocalStoreConfig::in_dir(DEFAULT_DATA_DIR),
            save_debounce_ms: DEFAULT_SAVE_DEBOUNCE_MS,
            persist_queue: true,
            queue: QueueConfig::default(),
            breaker: BreakerConfig::default(),
            undo: UndoConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{key}: {message}")]
    OutOfRange {
        key: &'static str,
        message: &'static str,
    },
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `TASKVAULT_*` keys resolved through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(dir) = get("TASKVAULT_DATA_DIR") {
            let root = PathBuf::from(dir);
            config.store = LocalStoreConfig::in_dir(&root);
            config.migration.export_dir = root.join("exports");
        }
        if let Some(dir) = get("TASKVAULT_EXPORT_DIR") {
            config.migration.export_dir = PathBuf::from(dir);
        }
        if let Some(value) = get("TASKVAULT_PERSIST_QUEUE") {
            config.persist_queue = parse_bool("TASKVAULT_PERSIST_QUEUE", &value)?;
        }

        set_parsed(&get, "TASKVAULT_SAVE_DEBOUNCE_MS", &mut config.save_debounce_ms)?;
        set_parsed(&get, "TASKVAULT_QUEUE_MAX_RETRIES", &mut config.queue.max_retries)?;
        set_parsed(&get, "TASKVAULT_DLQ_MAX_ITEMS", &mut config.queue.max_dead_letters)?;
        set_parsed(&get, "TASKVAULT_DLQ_TTL_MS", &mut config.queue.dead_letter_ttl_ms)?;
        set_parsed(&get, "TASKVAULT_RETRY_BASE_MS", &mut config.queue.retry_base_ms)?;
        set_parsed(&get, "TASKVAULT_RETRY_MAX_MS", &mut config.queue.retry_max_ms)?;
        set_parsed(&get, "TASKVAULT_BREAKER_L1_RATIO", &mut config.breaker.bands.l1)?;
        set_parsed(&get, "TASKVAULT_BREAKER_L2_RATIO", &mut config.breaker.bands.l2)?;
        set_parsed(&get, "TASKVAULT_BREAKER_L3_RATIO", &mut config.breaker.bands.l3)?;
        set_parsed(
            &get,
            "TASKVAULT_BREAKER_SMALL_PROJECT_FLOOR",
            &mut config.breaker.small_project_floor,
        )?;
        set_parsed(
            &get,
            "TASKVAULT_BREAKER_LARGE_PROJECT_THRESHOLD",
            &mut config.breaker.large_project_threshold,
        )?;
        set_parsed(&get, "TASKVAULT_UNDO_MAX_ENTRIES", &mut config.undo.max_entries)?;
        set_parsed(&get, "TASKVAULT_UNDO_MERGE_WINDOW_MS", &mut config.undo.merge_window_ms)?;
        set_parsed(&get, "TASKVAULT_UNDO_DEBOUNCE_MS", &mut config.undo.debounce_ms)?;
        set_parsed(
            &get,
            "TASKVAULT_SNAPSHOT_SESSION_MAX_BYTES",
            &mut config.migration.session_snapshot_max_bytes,
        )?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bands = &self.breaker.bands;
        let ordered = 0.0 < bands.l1 && bands.l1 < bands.l2 && bands.l2 < bands.l3 && bands.l3 <= 1.0;
        if !ordered {
            return Err(ConfigError::OutOfRange {
                key: "TASKVAULT_BREAKER_L*_RATIO",
                message: "ratios must satisfy 0 < l1 < l2 < l3 <= 1",
            });
        }
        if self.queue.max_retries == 0 {
            return Err(ConfigError::OutOfRange {
                key: "TASKVAULT_QUEUE_MAX_RETRIES",
                message: "must be at least 1",
            });
        }
        if self.queue.retry_base_ms > self.queue.retry_max_ms {
            return Err(ConfigError::OutOfRange {
                key: "TASKVAULT_RETRY_BASE_MS",
                message: "must not exceed TASKVAULT_RETRY_MAX_MS",
            });
        }
        if self.undo.max_entries == 0 {
            return Err(ConfigError::OutOfRange {
                key: "TASKVAULT_UNDO_MAX_ENTRIES",
                message: "must be at least 1",
            });
        }
        if self.save_debounce_ms < 0 {
            return Err(ConfigError::OutOfRange {
                key: "TASKVAULT_SAVE_DEBOUNCE_MS",
                message: "must not be negative",
            });
        }
        Ok(())
    }
}

fn set_parsed<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = get(key) {
        *slot = value
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value })?;
    }
    Ok(())
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        let config = SyncConfig::from_lookup(|_| None).expect("defaults");
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.breaker.small_project_floor, 10);
    }

    #[test]
    fn overrides_are_applied() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("TASKVAULT_DATA_DIR", "/tmp/tv"),
            ("TASKVAULT_QUEUE_MAX_RETRIES", " 5 "),
            ("TASKVAULT_DLQ_TTL_MS", "1000"),
            ("TASKVAULT_BREAKER_L2_RATIO", "0.6"),
            ("TASKVAULT_PERSIST_QUEUE", "off"),
            ("TASKVAULT_UNDO_MAX_ENTRIES", ""),
        ]))
        .expect("config");

        assert_eq!(config.store.storage_dir, PathBuf::from("/tmp/tv/db"));
        assert_eq!(config.migration.export_dir, PathBuf::from("/tmp/tv/exports"));
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.dead_letter_ttl_ms, 1_000);
        assert_eq!(config.breaker.bands.l2, 0.6);
        assert!(!config.persist_queue);
        assert_eq!(config.undo.max_entries, 50, "blank values keep the default");
    }

    #[test]
    fn bad_values_are_rejected() {
        assert_eq!(
            SyncConfig::from_lookup(lookup(&[("TASKVAULT_QUEUE_MAX_RETRIES", "many")])),
            Err(ConfigError::Invalid {
                key: "TASKVAULT_QUEUE_MAX_RETRIES",
                value: "many".to_string(),
            })
        );
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[("TASKVAULT_BREAKER_L1_RATIO", "0.9")])),
            Err(ConfigError::OutOfRange { .. })
        ));
    }
}
