#![forbid(unsafe_code)]

//! Sync engine: debounced local saves, breaker-guarded pushes, and the
//! persisted outbound queue.

use crate::config::SyncConfig;
use crate::debounce::PendingWrites;
use crate::migration::{MigrationError, MigrationOrchestrator, MigrationReport};
use crate::remote::RemoteBackend;
use crate::time::file_stamp;
use std::path::PathBuf;
use tv_core::breaker::CircuitBreaker;
use tv_core::merge::MigrationStrategy;
use tv_core::ports::{Notice, NoticeSeverity, Notifier};
use tv_core::queue::{ActionQueue, Dispatch, ProcessOutcome, QueueError, QueueSnapshot, RestoreReport};
use tv_core::undo::UndoStack;
use tv_core::{ActionPayload, CircuitBreakerValidation, EntityType, ErrorCategory, Priority, Project};
use tv_storage::{LocalStore, SaveOutcome, StoreError};

pub const QUEUE_JOURNAL_KEY: &str = "taskvault.queue";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum PushOutcome {
    /// No signed-in user; the project is only persisted locally.
    LocalOnly { save: SaveOutcome },
    Pushed { save: SaveOutcome },
    Blocked {
        save: SaveOutcome,
        validation: CircuitBreakerValidation,
        export_path: Option<PathBuf>,
    },
    /// The remote push failed; a retry action was queued.
    Queued {
        save: SaveOutcome,
        action_id: String,
        category: ErrorCategory,
    },
    /// The remote push failed and the retry action did not validate.
    Rejected { save: SaveOutcome, reason: String },
}

impl PushOutcome {
    pub fn save(&self) -> &SaveOutcome {
        match self {
            Self::LocalOnly { save }
            | Self::Pushed { save }
            | Self::Blocked { save, .. }
            | Self::Queued { save, .. }
            | Self::Rejected { save, .. } => save,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    pub saves: Vec<(String, SaveOutcome)>,
    pub pending_actions: usize,
    pub dead_letters: usize,
}

pub struct SyncEngine<R> {
    config: SyncConfig,
    store: LocalStore,
    remote: R,
    queue: ActionQueue,
    breaker: CircuitBreaker,
    undo: UndoStack,
    pending_writes: PendingWrites,
    migration: MigrationOrchestrator,
    notifier: Box<dyn Notifier>,
    user_id: Option<String>,
}

impl<R: RemoteBackend> SyncEngine<R> {
    pub fn new(config: SyncConfig, store: LocalStore, remote: R, notifier: Box<dyn Notifier>) -> Self {
        Self {
            queue: ActionQueue::new(config.queue.clone()),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            undo: UndoStack::new(config.undo.clone()),
            pending_writes: PendingWrites::new(config.save_debounce_ms),
            migration: MigrationOrchestrator::new(config.migration.clone()),
            config,
            store,
            remote,
            notifier,
            user_id: None,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store_mut(&mut self) -> &mut LocalStore {
        &mut self.store
    }

    pub fn remote_mut(&mut self) -> &mut R {
        &mut self.remote
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn undo_stack(&mut self) -> &mut UndoStack {
        &mut self.undo
    }

    pub fn migration(&mut self) -> &mut MigrationOrchestrator {
        &mut self.migration
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn sign_in(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
    }

    /// Signing out forgets every per-project breaker baseline; they belong to
    /// the account that was signed in.
    pub fn sign_out(&mut self) {
        self.user_id = None;
        self.breaker.clear_all_circuit_states();
    }

    /// Seeds the breaker baseline from a copy known to be good, typically
    /// what the remote returned on load.
    pub fn track_baseline(&mut self, project: &Project) {
        self.breaker
            .update_last_known_task_count(&project.id, project.tasks.len());
    }

    pub fn schedule_save(&mut self, project: Project, now_ms: i64) -> i64 {
        self.pending_writes.schedule(project, now_ms)
    }

    pub fn cancel_save(&mut self, project_id: &str) -> bool {
        self.pending_writes.cancel(project_id)
    }

    pub fn has_pending_saves(&self) -> bool {
        !self.pending_writes.is_empty()
    }

    pub fn flush_due(&mut self, now_ms: i64) -> Vec<(String, SaveOutcome)> {
        let due = self.pending_writes.take_due(now_ms);
        self.save_all(due)
    }

    pub fn flush_all(&mut self) -> Vec<(String, SaveOutcome)> {
        let all = self.pending_writes.drain();
        self.save_all(all)
    }

    fn save_all(&mut self, projects: Vec<Project>) -> Vec<(String, SaveOutcome)> {
        projects
            .into_iter()
            .map(|project| {
                let outcome = self.save_locally(&project);
                (project.id, outcome)
            })
            .collect()
    }

    fn save_locally(&mut self, project: &Project) -> SaveOutcome {
        let outcome = self.store.save_project(project);
        if let SaveOutcome::Failed { reason } = &outcome {
            self.notifier.notify(Notice::new(
                NoticeSeverity::Error,
                "Changes not saved",
                format!(
                    "\"{}\" could not be saved on this device ({reason}). Keep this window open and export the project.",
                    project.name
                ),
            ));
        }
        outcome
    }

    /// Flushes every pending save and writes the queue journal. Nothing
    /// scheduled is dropped.
    pub fn shutdown(&mut self) -> ShutdownReport {
        let saves = self.flush_all();
        self.undo.commit_pending();
        self.persist_queue();
        ShutdownReport {
            saves,
            pending_actions: self.queue.pending_len(),
            dead_letters: self.queue.dead_letter_len(),
        }
    }

    pub fn enqueue(
        &mut self,
        payload: ActionPayload,
        priority: Priority,
        now_ms: i64,
    ) -> Result<String, SyncError> {
        let action_id = self.queue.enqueue(payload, priority, now_ms)?;
        self.persist_queue();
        Ok(action_id)
    }

    /// Persists locally, then validates with the circuit breaker and pushes
    /// when the user is signed in and nothing looks destructive.
    pub fn push_project(&mut self, project: &Project, now_ms: i64) -> PushOutcome {
        self.pending_writes.cancel(&project.id);
        let Some(user_id) = self.user_id.clone() else {
            let save = self.save_locally(project);
            return PushOutcome::LocalOnly { save };
        };

        let validation = self
            .breaker
            .validate_before_sync(project, None, self.notifier.as_ref());
        // Export the previous local copy before it is overwritten.
        let export_path = if validation.export_recommended {
            self.export_before_overwrite(&project.id, now_ms)
        } else {
            None
        };
        let save = self.save_locally(project);

        if validation.should_block {
            self.queue.pause_dependent_actions(
                EntityType::Project,
                &project.id,
                &format!("circuit breaker {}", validation.level.as_str()),
            );
            self.persist_queue();
            return PushOutcome::Blocked {
                save,
                validation,
                export_path,
            };
        }

        match self.remote.save_project(project, &user_id) {
            Ok(()) => {
                self.confirm_pushed(project, now_ms);
                PushOutcome::Pushed { save }
            }
            Err(err) => {
                let category = err.category();
                tracing::warn!(
                    project_id = %project.id,
                    category = category.as_str(),
                    error = %err,
                    "project push failed; queued for retry"
                );
                let payload = ActionPayload::UpdateProject {
                    project: project.clone(),
                };
                match self.enqueue(payload, Priority::Normal, now_ms) {
                    Ok(action_id) => PushOutcome::Queued {
                        save,
                        action_id,
                        category,
                    },
                    Err(queue_err) => {
                        tracing::error!(project_id = %project.id, error = %queue_err, "retry action rejected");
                        PushOutcome::Rejected {
                            save,
                            reason: queue_err.to_string(),
                        }
                    }
                }
            }
        }
    }

    /// Records a direct push. Queued copies of the project that are not newer
    /// than the pushed one are dropped so a later drain cannot roll the
    /// account back.
    fn confirm_pushed(&mut self, project: &Project, now_ms: i64) {
        self.breaker
            .update_last_known_task_count(&project.id, project.tasks.len());
        self.undo.clear_outdated_history(&project.id, project.version);
        let superseded = self
            .queue
            .drop_superseded_project_updates(&project.id, Some(project.version));
        if superseded > 0 {
            self.persist_queue();
        }
        if let Err(err) = self.store.update_meta(|meta| meta.last_sync_time_ms = Some(now_ms)) {
            tracing::warn!(error = %err, "could not record last sync time");
        }
    }

    fn export_before_overwrite(&mut self, project_id: &str, now_ms: i64) -> Option<PathBuf> {
        let path = self
            .config
            .migration
            .export_dir
            .join(format!("{project_id}-{}.json", file_stamp(now_ms)));
        match self.store.export_project(project_id, &path) {
            Ok(()) => {
                self.notifier.notify(Notice::new(
                    NoticeSeverity::Info,
                    "Backup exported",
                    format!("A copy of the project was saved to {}", path.display()),
                ));
                Some(path)
            }
            Err(err) => {
                tracing::warn!(project_id, error = %err, "pre-block export failed");
                None
            }
        }
    }

    /// Processes one due queue action. Project updates pass through the
    /// circuit breaker first and are held (and paused) while it blocks.
    pub fn drain_once(&mut self, now_ms: i64) -> ProcessOutcome {
        let Some(user_id) = self.user_id.clone() else {
            return ProcessOutcome::Idle;
        };
        let Self {
            queue,
            breaker,
            remote,
            notifier,
            ..
        } = self;
        let notifier: &dyn Notifier = &**notifier;
        let mut delivered_project: Option<(String, usize)> = None;
        let outcome = queue.process_next(now_ms, notifier, |action| {
            if let ActionPayload::UpdateProject { project } = &action.payload {
                let validation = breaker.validate_before_sync(project, None, notifier);
                if validation.should_block {
                    return Dispatch::Held {
                        reason: format!("circuit breaker {}", validation.level.as_str()),
                    };
                }
            }
            match remote.push_action(action, &user_id) {
                Ok(()) => {
                    if let ActionPayload::UpdateProject { project } = &action.payload {
                        delivered_project = Some((project.id.clone(), project.tasks.len()));
                    }
                    Dispatch::Delivered
                }
                Err(err) => Dispatch::Failed {
                    message: err.message,
                },
            }
        });

        if let Some((project_id, task_count)) = delivered_project {
            self.breaker.update_last_known_task_count(&project_id, task_count);
        }
        if let ProcessOutcome::Held { action_id, reason } = &outcome {
            let entity = self
                .queue
                .pending()
                .find(|action| &action.id == action_id)
                .map(|action| (action.entity_type, action.entity_id.clone()));
            if let Some((entity_type, entity_id)) = entity {
                self.queue.pause_dependent_actions(entity_type, &entity_id, reason);
            }
        }
        if outcome != ProcessOutcome::Idle {
            self.persist_queue();
        }
        outcome
    }

    /// Drains until the queue is idle or nothing more can be delivered now.
    pub fn drain(&mut self, now_ms: i64) -> Vec<ProcessOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..self.queue.pending_len() {
            let outcome = self.drain_once(now_ms);
            if outcome == ProcessOutcome::Idle {
                break;
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    pub fn retry_dead_letter(&mut self, action_id: &str, now_ms: i64) -> Result<(), SyncError> {
        self.queue.retry_dead_letter(action_id, now_ms)?;
        self.persist_queue();
        Ok(())
    }

    pub fn dismiss_dead_letter(&mut self, action_id: &str) -> bool {
        let dismissed = self.queue.dismiss_dead_letter(action_id);
        if dismissed {
            self.persist_queue();
        }
        dismissed
    }

    pub fn clear_dead_letters(&mut self) -> usize {
        let cleared = self.queue.clear_dead_letters();
        self.persist_queue();
        cleared
    }

    /// The user confirmed a large deletion was intended: the breaker accepts
    /// the current task count as the new baseline and held actions resume.
    pub fn confirm_intentional_deletion(&mut self, project: &Project) -> usize {
        self.breaker.reset_circuit_state(&project.id);
        self.breaker
            .update_last_known_task_count(&project.id, project.tasks.len());
        let resumed = self
            .queue
            .resume_dependent_actions(EntityType::Project, &project.id);
        tracing::info!(
            project_id = %project.id,
            task_count = project.tasks.len(),
            resumed,
            "intentional deletion confirmed"
        );
        self.persist_queue();
        resumed
    }

    /// Reloads the queue journal. Expired dead letters and actions that no
    /// longer validate are dropped; an unreadable journal starts empty.
    pub fn restore_queue(&mut self, now_ms: i64) -> RestoreReport {
        let snapshot = match self.store.kv().get(QUEUE_JOURNAL_KEY) {
            Ok(Some(raw)) => serde_json::from_str::<QueueSnapshot>(&raw).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "queue journal unreadable; starting empty");
                QueueSnapshot::default()
            }),
            Ok(None) => QueueSnapshot::default(),
            Err(err) => {
                tracing::warn!(error = %err, "queue journal unavailable; starting empty");
                QueueSnapshot::default()
            }
        };
        let (queue, report) = ActionQueue::restore(self.config.queue.clone(), snapshot, now_ms);
        self.queue = queue;
        self.persist_queue();
        report
    }

    fn persist_queue(&mut self) {
        if !self.config.persist_queue {
            return;
        }
        let written = serde_json::to_string(&self.queue.snapshot())
            .map_err(StoreError::from)
            .and_then(|payload| self.store.kv().put(QUEUE_JOURNAL_KEY, &payload));
        if let Err(err) = written {
            tracing::warn!(error = %err, "queue journal write failed");
        }
    }

    /// Moves guest data into the signed-in account.
    pub fn migrate(
        &mut self,
        strategy: MigrationStrategy,
        now_ms: i64,
    ) -> Result<MigrationReport, MigrationError> {
        let Some(user_id) = self.user_id.clone() else {
            return Err(MigrationError::NotSignedIn);
        };
        let report = self.migration.run(
            &mut self.store,
            &mut self.remote,
            &user_id,
            strategy,
            self.notifier.as_ref(),
            now_ms,
        )?;
        for project in &report.uploaded {
            self.breaker
                .update_last_known_task_count(&project.id, project.tasks.len());
        }
        Ok(report)
    }
}
