#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndoKind {
    TaskCreate,
    TaskUpdate,
    TaskDelete,
    TaskMove,
    ConnectionCreate,
    ConnectionUpdate,
    ConnectionDelete,
    ProjectUpdate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UndoData {
    pub before: JsonValue,
    pub after: JsonValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UndoAction {
    pub kind: UndoKind,
    pub project_id: String,
    pub data: UndoData,
    pub timestamp_ms: i64,
    /// Project version the mutation was made against, when known.
    #[serde(default)]
    pub project_version: Option<i64>,
}

impl UndoAction {
    fn coalesces_with(&self, other: &UndoAction) -> bool {
        self.kind == other.kind && self.project_id == other.project_id
    }

    fn absorb(&mut self, later: UndoAction) {
        self.data.after = later.data.after;
        self.timestamp_ms = later.timestamp_ms;
    }

    /// A replay is stale once the project moved more than one version past
    /// the one this action was recorded against (the action's own push
    /// accounts for one bump).
    fn is_stale(&self, current_version: Option<i64>) -> bool {
        match (self.project_version, current_version) {
            (Some(recorded), Some(current)) => current > recorded + 1,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UndoConfig {
    pub max_entries: usize,
    pub merge_window_ms: i64,
    pub debounce_ms: i64,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            max_entries: 50,
            merge_window_ms: 1_000,
            debounce_ms: 800,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReplayOutcome {
    Empty,
    /// `snapshot` is the state to apply: `before` for undo, `after` for redo.
    Applied {
        action: UndoAction,
        snapshot: JsonValue,
    },
    VersionMismatch {
        recorded_version: i64,
        current_version: i64,
    },
    Forced {
        action: UndoAction,
        snapshot: JsonValue,
        version_delta: i64,
    },
}

impl ReplayOutcome {
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, Self::VersionMismatch { .. })
    }
}

#[derive(Clone, Debug)]
struct PendingRecord {
    action: UndoAction,
    due_at_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Undo,
    Redo,
}

#[derive(Clone, Debug, Default)]
pub struct UndoStack {
    config: UndoConfig,
    undo: VecDeque<UndoAction>,
    redo: Vec<UndoAction>,
    pending: Option<PendingRecord>,
}

impl UndoStack {
    pub fn new(config: UndoConfig) -> Self {
        Self {
            config,
            undo: VecDeque::new(),
            redo: Vec::new(),
            pending: None,
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn peek_undo(&self) -> Option<&UndoAction> {
        self.undo.back()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn record(&mut self, action: UndoAction) {
        self.commit_pending();
        self.push(action);
    }

    fn push(&mut self, action: UndoAction) {
        self.redo.clear();
        if let Some(last) = self.undo.back_mut() {
            let within_window =
                action.timestamp_ms.saturating_sub(last.timestamp_ms) <= self.config.merge_window_ms;
            if within_window && last.coalesces_with(&action) {
                last.absorb(action);
                return;
            }
        }
        self.undo.push_back(action);
        while self.undo.len() > self.config.max_entries {
            self.undo.pop_front();
        }
    }

    /// Defers recording until input settles: repeated calls for the same
    /// kind and project keep the first `before`, take the latest `after` and
    /// push the deadline back.
    pub fn record_debounced(&mut self, action: UndoAction, now_ms: i64) {
        let due_at_ms = now_ms + self.config.debounce_ms;
        match self.pending.as_mut() {
            Some(pending) if pending.action.coalesces_with(&action) => {
                pending.action.absorb(action);
                pending.due_at_ms = due_at_ms;
            }
            _ => {
                self.commit_pending();
                self.pending = Some(PendingRecord { action, due_at_ms });
            }
        }
    }

    /// Commits the debounced entry if its deadline has passed.
    pub fn flush_debounced(&mut self, now_ms: i64) -> bool {
        let due = self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.due_at_ms <= now_ms);
        if due {
            self.commit_pending()
        } else {
            false
        }
    }

    pub fn commit_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                self.push(pending.action);
                true
            }
            None => false,
        }
    }

    pub fn undo(&mut self, current_version: Option<i64>) -> ReplayOutcome {
        self.replay(Direction::Undo, current_version, false)
    }

    pub fn redo(&mut self, current_version: Option<i64>) -> ReplayOutcome {
        self.replay(Direction::Redo, current_version, false)
    }

    /// Replays even when the project moved on; the caller gets the version
    /// delta so it can warn about the overwrite.
    pub fn force_undo(&mut self, current_version: Option<i64>) -> ReplayOutcome {
        self.replay(Direction::Undo, current_version, true)
    }

    pub fn force_redo(&mut self, current_version: Option<i64>) -> ReplayOutcome {
        self.replay(Direction::Redo, current_version, true)
    }

    fn replay(&mut self, direction: Direction, current_version: Option<i64>, force: bool) -> ReplayOutcome {
        self.commit_pending();
        let top = match direction {
            Direction::Undo => self.undo.back(),
            Direction::Redo => self.redo.last(),
        };
        let Some(top) = top else {
            return ReplayOutcome::Empty;
        };

        let stale = top.is_stale(current_version);
        if stale && !force {
            let recorded_version = top.project_version.unwrap_or_default();
            let current_version = current_version.unwrap_or_default();
            tracing::warn!(
                project_id = %top.project_id,
                recorded_version,
                current_version,
                "refusing to replay history against a newer project version"
            );
            return ReplayOutcome::VersionMismatch {
                recorded_version,
                current_version,
            };
        }

        let version_delta = match (top.project_version, current_version) {
            (Some(recorded), Some(current)) => current - recorded,
            _ => 0,
        };
        let action = match direction {
            Direction::Undo => self.undo.pop_back(),
            Direction::Redo => self.redo.pop(),
        };
        let Some(action) = action else {
            return ReplayOutcome::Empty;
        };
        let snapshot = match direction {
            Direction::Undo => action.data.before.clone(),
            Direction::Redo => action.data.after.clone(),
        };
        match direction {
            Direction::Undo => self.redo.push(action.clone()),
            Direction::Redo => self.undo.push_back(action.clone()),
        }

        if force {
            ReplayOutcome::Forced {
                action,
                snapshot,
                version_delta,
            }
        } else {
            ReplayOutcome::Applied { action, snapshot }
        }
    }

    /// Drops entries of `project_id` that can no longer replay against the
    /// newly confirmed remote version.
    pub fn clear_outdated_history(&mut self, project_id: &str, confirmed_version: i64) -> usize {
        let outdated = |action: &UndoAction| {
            action.project_id == project_id && action.is_stale(Some(confirmed_version))
        };
        let before = self.undo.len() + self.redo.len();
        self.undo.retain(|action| !outdated(action));
        self.redo.retain(|action| !outdated(action));
        let removed = before - self.undo.len() - self.redo.len();
        if removed > 0 {
            tracing::debug!(project_id, confirmed_version, removed, "pruned outdated undo history");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.pending = None;
    }
}

#[cfg(test)]
mod tests;
