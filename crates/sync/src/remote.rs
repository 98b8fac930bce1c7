#![forbid(unsafe_code)]

use tv_core::{ErrorCategory, Project, QueuedAction, classify_error};

/// Failure reported by the remote backend. Only the message is contractual;
/// its category is derived from the text.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        classify_error(&self.message)
    }
}

/// Authenticated cloud store the engine pushes to. Implementations own
/// transport, auth and serialization.
pub trait RemoteBackend {
    fn save_project(&mut self, project: &Project, user_id: &str) -> Result<(), RemoteError>;

    /// All projects of the account.
    fn load_projects(&mut self, user_id: &str) -> Result<Vec<Project>, RemoteError>;

    fn push_action(&mut self, action: &QueuedAction, user_id: &str) -> Result<(), RemoteError>;
}

impl<T: RemoteBackend + ?Sized> RemoteBackend for &mut T {
    fn save_project(&mut self, project: &Project, user_id: &str) -> Result<(), RemoteError> {
        (**self).save_project(project, user_id)
    }

    fn load_projects(&mut self, user_id: &str) -> Result<Vec<Project>, RemoteError> {
        (**self).load_projects(user_id)
    }

    fn push_action(&mut self, action: &QueuedAction, user_id: &str) -> Result<(), RemoteError> {
        (**self).push_action(action, user_id)
    }
}
