#![forbid(unsafe_code)]

//! Outbound action queue and its dead-letter side.
//!
//! An action lives in exactly one place at a time: the pending deque or the
//! dead-letter deque. It leaves the pending deque on delivery, on demotion,
//! when a low-priority action is discarded, or when a newer copy of the same
//! project supersedes it. It leaves the dead-letter deque on dismissal, on
//! retry (back into pending), on eviction, or when its TTL has passed at
//! restore time.

use crate::action::{ActionPayload, ActionType, EntityType, PayloadError, Priority, QueuedAction};
use crate::classify::{ErrorCategory, classify_error};
use crate::ports::{Notice, NoticeSeverity, Notifier};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MAX_DEAD_LETTERS: usize = 100;
pub const DEFAULT_DEAD_LETTER_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

const DEPENDENCY_PAUSE_PREFIX: &str = "dependency ";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub max_dead_letters: usize,
    pub dead_letter_ttl_ms: i64,
    pub retry_base_ms: i64,
    pub retry_max_ms: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_dead_letters: DEFAULT_MAX_DEAD_LETTERS,
            dead_letter_ttl_ms: DEFAULT_DEAD_LETTER_TTL_MS,
            retry_base_ms: 1_000,
            retry_max_ms: 60_000,
        }
    }
}

impl QueueConfig {
    /// Exponential backoff for the given attempt (1-based), capped.
    pub fn retry_delay_ms(&self, attempt: u32) -> i64 {
        let exponent = attempt.saturating_sub(1).min(30);
        self.retry_base_ms
            .saturating_mul(1i64 << exponent)
            .min(self.retry_max_ms)
            .max(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub action: QueuedAction,
    pub failed_at_ms: i64,
    pub reason: String,
    pub category: ErrorCategory,
}

/// What the dispatcher made of one delivery attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    Failed { message: String },
    /// Not attempted (for example blocked by the circuit breaker); the action
    /// stays pending untouched.
    Held { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Idle,
    Delivered {
        action_id: String,
    },
    Held {
        action_id: String,
        reason: String,
    },
    RetryScheduled {
        action_id: String,
        attempt: u32,
        next_attempt_at_ms: i64,
        category: ErrorCategory,
    },
    DeadLettered {
        action_id: String,
        category: ErrorCategory,
        reason: String,
    },
    Discarded {
        action_id: String,
        category: ErrorCategory,
        reason: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueLocation {
    Pending,
    DeadLetter,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("payload rejected: {0}")]
    Payload(#[from] PayloadError),
    #[error("unknown dead letter {0}")]
    UnknownDeadLetter(String),
}

/// Serialized form of the queue, written to the local store after every
/// mutation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub next_seq: u64,
    #[serde(default)]
    pub pending: Vec<QueuedAction>,
    #[serde(default)]
    pub dead_letters: Vec<DeadLetterItem>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored_pending: usize,
    pub restored_dead_letters: usize,
    pub dropped_expired: usize,
    pub dropped_invalid: usize,
}

#[derive(Clone, Debug)]
pub struct ActionQueue {
    config: QueueConfig,
    next_seq: u64,
    pending: VecDeque<QueuedAction>,
    dead_letters: VecDeque<DeadLetterItem>,
}

impl ActionQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            next_seq: 1,
            pending: VecDeque::new(),
            dead_letters: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn pending(&self) -> impl Iterator<Item = &QueuedAction> {
        self.pending.iter()
    }

    pub fn dead_letters(&self) -> impl Iterator<Item = &DeadLetterItem> {
        self.dead_letters.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn dead_letter_len(&self) -> usize {
        self.dead_letters.len()
    }

    pub fn location(&self, action_id: &str) -> Option<QueueLocation> {
        if self.pending.iter().any(|action| action.id == action_id) {
            return Some(QueueLocation::Pending);
        }
        if self.dead_letters.iter().any(|item| item.action.id == action_id) {
            return Some(QueueLocation::DeadLetter);
        }
        None
    }

    /// Appends a validated action. A full project update replaces any
    /// project update still pending for the same project, so an older copy
    /// can never be delivered after a newer one.
    pub fn enqueue(
        &mut self,
        payload: ActionPayload,
        priority: Priority,
        now_ms: i64,
    ) -> Result<String, QueueError> {
        payload.validate()?;
        if let ActionPayload::UpdateProject { project } = &payload {
            self.drop_superseded_project_updates(&project.id, None);
        }
        let id = format!("act_{:016}", self.next_seq);
        self.next_seq += 1;
        let action = QueuedAction::new(id.clone(), payload, priority, now_ms);
        tracing::debug!(
            action_id = %action.id,
            action_type = action.action_type.as_str(),
            entity_type = action.entity_type.as_str(),
            entity_id = %action.entity_id,
            "action enqueued"
        );
        self.pending.push_back(action);
        Ok(id)
    }

    /// Removes pending full-project updates for `project_id` whose copy is no
    /// newer than `up_to_version`, or all of them when it is `None`.
    pub fn drop_superseded_project_updates(
        &mut self,
        project_id: &str,
        up_to_version: Option<i64>,
    ) -> usize {
        let before = self.pending.len();
        self.pending.retain(|action| match &action.payload {
            ActionPayload::UpdateProject { project } if project.id == project_id => {
                up_to_version.is_some_and(|version| project.version > version)
            }
            _ => true,
        });
        let dropped = before - self.pending.len();
        if dropped > 0 {
            tracing::debug!(project_id, dropped, "superseded project updates dropped");
        }
        dropped
    }

    /// Drains at most one due, unpaused action through `dispatch`.
    pub fn process_next(
        &mut self,
        now_ms: i64,
        notifier: &dyn Notifier,
        dispatch: impl FnOnce(&QueuedAction) -> Dispatch,
    ) -> ProcessOutcome {
        let Some(index) = self
            .pending
            .iter()
            .position(|action| !action.is_paused() && action.next_attempt_at_ms <= now_ms)
        else {
            return ProcessOutcome::Idle;
        };

        match dispatch(&self.pending[index]) {
            Dispatch::Delivered => {
                let action_id = self.pending[index].id.clone();
                self.pending.remove(index);
                ProcessOutcome::Delivered { action_id }
            }
            Dispatch::Held { reason } => ProcessOutcome::Held {
                action_id: self.pending[index].id.clone(),
                reason,
            },
            Dispatch::Failed { message } => self.handle_failure(index, message, now_ms, notifier),
        }
    }

    fn handle_failure(
        &mut self,
        index: usize,
        message: String,
        now_ms: i64,
        notifier: &dyn Notifier,
    ) -> ProcessOutcome {
        let category = classify_error(&message);
        if category.is_retriable() {
            let max_retries = self.config.max_retries;
            let action = &mut self.pending[index];
            action.retry_count += 1;
            if action.retry_count < max_retries {
                let attempt = action.retry_count;
                action.next_attempt_at_ms = now_ms + self.config.retry_delay_ms(attempt);
                tracing::info!(
                    action_id = %action.id,
                    attempt,
                    category = category.as_str(),
                    "remote action failed, retry scheduled"
                );
                return ProcessOutcome::RetryScheduled {
                    action_id: action.id.clone(),
                    attempt,
                    next_attempt_at_ms: action.next_attempt_at_ms,
                    category,
                };
            }
        }

        let Some(action) = self.pending.remove(index) else {
            return ProcessOutcome::Idle;
        };
        let reason = if category.is_retriable() {
            format!("retries exhausted after {} attempts: {message}", action.retry_count)
        } else {
            message
        };
        self.demote(action, category, reason, now_ms, notifier)
    }

    fn demote(
        &mut self,
        action: QueuedAction,
        category: ErrorCategory,
        reason: String,
        now_ms: i64,
        notifier: &dyn Notifier,
    ) -> ProcessOutcome {
        let action_id = action.id.clone();
        // A discarded action leaves nothing behind to wait on.
        if action.priority == Priority::Low {
            tracing::debug!(
                action_id = %action_id,
                category = category.as_str(),
                %reason,
                "low priority action discarded"
            );
            return ProcessOutcome::Discarded {
                action_id,
                category,
                reason,
            };
        }

        if action.priority == Priority::Critical {
            notifier.notify(Notice::new(
                NoticeSeverity::Warning,
                "Change not synced",
                format!(
                    "An important {} {} change could not be saved to the cloud: {reason}. \
                     It is kept locally and can be retried.",
                    action.entity_type.as_str(),
                    action.action_type.as_str(),
                ),
            ));
        }

        let paused = self.pause_dependent_actions(
            action.entity_type,
            &action.entity_id,
            &format!("{DEPENDENCY_PAUSE_PREFIX}{action_id} failed"),
        );
        if paused > 0 {
            tracing::warn!(
                action_id = %action_id,
                paused,
                "paused queued actions depending on a failed mutation"
            );
        }

        tracing::warn!(
            action_id = %action_id,
            category = category.as_str(),
            %reason,
            "action moved to dead letter queue"
        );
        self.dead_letters.push_back(DeadLetterItem {
            action,
            failed_at_ms: now_ms,
            reason: reason.clone(),
            category,
        });
        self.evict_overflow();
        ProcessOutcome::DeadLettered {
            action_id,
            category,
            reason,
        }
    }

    fn evict_overflow(&mut self) {
        while self.dead_letters.len() > self.config.max_dead_letters {
            if let Some(evicted) = self.dead_letters.pop_front() {
                tracing::warn!(
                    action_id = %evicted.action.id,
                    "dead letter queue full, oldest item evicted"
                );
                self.release_dependents(evicted.action.entity_type, &evicted.action.entity_id);
            }
        }
    }

    /// Flags pending actions that depend on `entity_id` so draining skips
    /// them. Creates carry no dependency on earlier mutations and are left
    /// alone.
    pub fn pause_dependent_actions(
        &mut self,
        entity_type: EntityType,
        entity_id: &str,
        reason: &str,
    ) -> usize {
        let mut paused = 0;
        for action in self.pending.iter_mut() {
            if action.entity_type != entity_type
                || action.entity_id != entity_id
                || action.action_type == ActionType::Create
                || action.is_paused()
            {
                continue;
            }
            action.paused_reason = Some(reason.to_string());
            paused += 1;
        }
        paused
    }

    pub fn resume_dependent_actions(&mut self, entity_type: EntityType, entity_id: &str) -> usize {
        let mut resumed = 0;
        for action in self.pending.iter_mut() {
            if action.entity_type == entity_type
                && action.entity_id == entity_id
                && action.paused_reason.take().is_some()
            {
                resumed += 1;
            }
        }
        resumed
    }

    /// Unpauses actions that were waiting on a dead letter for this entity
    /// once no dead letter for it remains. Holds placed for other reasons,
    /// such as the circuit breaker, are kept.
    fn release_dependents(&mut self, entity_type: EntityType, entity_id: &str) -> usize {
        let still_failed = self.dead_letters.iter().any(|item| {
            item.action.entity_type == entity_type && item.action.entity_id == entity_id
        });
        if still_failed {
            return 0;
        }
        let mut released = 0;
        for action in self.pending.iter_mut() {
            let waits_on_dependency = action
                .paused_reason
                .as_deref()
                .is_some_and(|reason| reason.starts_with(DEPENDENCY_PAUSE_PREFIX));
            if action.entity_type == entity_type && action.entity_id == entity_id && waits_on_dependency
            {
                action.paused_reason = None;
                released += 1;
            }
        }
        if released > 0 {
            tracing::info!(
                entity_type = entity_type.as_str(),
                entity_id,
                released,
                "resumed actions whose failed dependency is gone"
            );
        }
        released
    }

    pub fn retry_dead_letter(&mut self, action_id: &str, now_ms: i64) -> Result<(), QueueError> {
        let index = self
            .dead_letters
            .iter()
            .position(|item| item.action.id == action_id)
            .ok_or_else(|| QueueError::UnknownDeadLetter(action_id.to_string()))?;
        let Some(item) = self.dead_letters.remove(index) else {
            return Err(QueueError::UnknownDeadLetter(action_id.to_string()));
        };
        let mut action = item.action;
        action.retry_count = 0;
        action.next_attempt_at_ms = now_ms;
        action.paused_reason = None;
        let (entity_type, entity_id) = (action.entity_type, action.entity_id.clone());
        self.pending.push_back(action);
        self.resume_dependent_actions(entity_type, &entity_id);
        Ok(())
    }

    pub fn dismiss_dead_letter(&mut self, action_id: &str) -> bool {
        let Some(index) = self
            .dead_letters
            .iter()
            .position(|item| item.action.id == action_id)
        else {
            return false;
        };
        if let Some(item) = self.dead_letters.remove(index) {
            self.release_dependents(item.action.entity_type, &item.action.entity_id);
        }
        true
    }

    pub fn clear_dead_letters(&mut self) -> usize {
        let cleared: Vec<DeadLetterItem> = self.dead_letters.drain(..).collect();
        for item in &cleared {
            self.release_dependents(item.action.entity_type, &item.action.entity_id);
        }
        cleared.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            next_seq: self.next_seq,
            pending: self.pending.iter().cloned().collect(),
            dead_letters: self.dead_letters.iter().cloned().collect(),
        }
    }

    /// Rebuilds a queue from its persisted snapshot. Dead letters older than
    /// the TTL are dropped here and never rehydrated; actions whose payload no
    /// longer validates are dropped as corrupt.
    pub fn restore(config: QueueConfig, snapshot: QueueSnapshot, now_ms: i64) -> (Self, RestoreReport) {
        let mut report = RestoreReport::default();
        let mut queue = Self::new(config);
        let mut seen = BTreeSet::new();
        let mut max_seq = 0u64;

        for action in snapshot.pending {
            if let Err(err) = action.validate() {
                tracing::warn!(action_id = %action.id, %err, "dropping corrupt queued action");
                report.dropped_invalid += 1;
                continue;
            }
            if !seen.insert(action.id.clone()) {
                report.dropped_invalid += 1;
                continue;
            }
            max_seq = max_seq.max(parse_seq(&action.id));
            queue.pending.push_back(action);
        }

        for item in snapshot.dead_letters {
            if now_ms.saturating_sub(item.failed_at_ms) > queue.config.dead_letter_ttl_ms {
                report.dropped_expired += 1;
                continue;
            }
            if item.action.validate().is_err() || !seen.insert(item.action.id.clone()) {
                report.dropped_invalid += 1;
                continue;
            }
            max_seq = max_seq.max(parse_seq(&item.action.id));
            queue.dead_letters.push_back(item);
        }
        queue.evict_overflow();

        // Dependencies whose dead letter expired or was dropped above.
        let waiting: BTreeSet<(EntityType, String)> = queue
            .pending
            .iter()
            .filter(|action| action.is_paused())
            .map(|action| (action.entity_type, action.entity_id.clone()))
            .collect();
        for (entity_type, entity_id) in waiting {
            queue.release_dependents(entity_type, &entity_id);
        }

        queue.next_seq = snapshot.next_seq.max(max_seq + 1).max(1);
        report.restored_pending = queue.pending.len();
        report.restored_dead_letters = queue.dead_letters.len();
        if report.dropped_expired > 0 || report.dropped_invalid > 0 {
            tracing::info!(
                dropped_expired = report.dropped_expired,
                dropped_invalid = report.dropped_invalid,
                "queue restored with drops"
            );
        }
        (queue, report)
    }
}

fn parse_seq(action_id: &str) -> u64 {
    action_id
        .strip_prefix("act_")
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(0)
}
