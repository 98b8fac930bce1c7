#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::rc::Rc;
use tv_core::ports::{RecordingNotifier, TracingTelemetry};
use tv_core::{ActionPayload, Project, QueuedAction, Task};
use tv_storage::{LocalStore, LocalStoreConfig};
use tv_sync::{RemoteBackend, RemoteError, SyncConfig, SyncEngine};

/// In-memory account with scripted failures.
#[derive(Debug, Default)]
pub struct FakeRemote {
    pub projects: BTreeMap<String, Project>,
    pub pushed: Vec<QueuedAction>,
    pub save_calls: usize,
    pub fail_all_saves: Option<String>,
    pub fail_save_ids: BTreeSet<String>,
    pub fail_pushes: VecDeque<String>,
    pub fail_loads: bool,
    /// Task ids the account silently loses when a project is saved.
    pub lose_task_ids: BTreeSet<String>,
}

impl FakeRemote {
    pub fn with_projects(projects: impl IntoIterator<Item = Project>) -> Self {
        Self {
            projects: projects
                .into_iter()
                .map(|project| (project.id.clone(), project))
                .collect(),
            ..Self::default()
        }
    }
}

impl RemoteBackend for FakeRemote {
    fn save_project(&mut self, project: &Project, _user_id: &str) -> Result<(), RemoteError> {
        self.save_calls += 1;
        if let Some(message) = &self.fail_all_saves {
            return Err(RemoteError::new(message.clone()));
        }
        if self.fail_save_ids.contains(&project.id) {
            return Err(RemoteError::new("fetch failed: connection reset"));
        }
        let mut stored = project.clone();
        stored
            .tasks
            .retain(|task| !self.lose_task_ids.contains(&task.id));
        self.projects.insert(stored.id.clone(), stored);
        Ok(())
    }

    fn load_projects(&mut self, _user_id: &str) -> Result<Vec<Project>, RemoteError> {
        if self.fail_loads {
            return Err(RemoteError::new("network unreachable"));
        }
        Ok(self.projects.values().cloned().collect())
    }

    fn push_action(&mut self, action: &QueuedAction, _user_id: &str) -> Result<(), RemoteError> {
        if let Some(message) = self.fail_pushes.pop_front() {
            return Err(RemoteError::new(message));
        }
        if let ActionPayload::UpdateProject { project } = &action.payload {
            self.projects.insert(project.id.clone(), project.clone());
        }
        self.pushed.push(action.clone());
        Ok(())
    }
}

pub fn project_with_tasks(id: &str, task_count: usize) -> Project {
    let mut project = Project::new(id, format!("Project {id}"));
    project.version = 1;
    project.updated_at_ms = 100;
    for index in 0..task_count {
        project
            .tasks
            .push(Task::new(format!("{id}-t{index}"), format!("Task {index}"), 100));
    }
    project
}

pub fn open_local_store(root: &Path) -> LocalStore {
    LocalStore::new(LocalStoreConfig::in_dir(root), Box::new(TracingTelemetry))
}

pub fn config_in(root: &Path) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.store = LocalStoreConfig::in_dir(root.join("data"));
    config.migration.export_dir = root.join("exports");
    config
}

pub fn engine_with(config: SyncConfig, remote: FakeRemote) -> (SyncEngine<FakeRemote>, Rc<RecordingNotifier>) {
    let notifier = Rc::new(RecordingNotifier::default());
    let store = LocalStore::new(config.store.clone(), Box::new(TracingTelemetry));
    let engine = SyncEngine::new(config, store, remote, Box::new(notifier.clone()));
    (engine, notifier)
}
