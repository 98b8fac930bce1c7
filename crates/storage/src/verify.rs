#![forbid(unsafe_code)]

use tv_core::model::{Project, ProjectHeader};

/// What a project write left in the primary store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrittenShape {
    /// `None` when the project row exists but no longer decodes.
    pub header: Option<ProjectHeader>,
    pub task_count: usize,
    pub connection_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WriteMismatch {
    #[error("project row missing after write")]
    MissingProject,
    #[error("project row unreadable after write")]
    UnreadableProject,
    #[error("field {field} differs after write")]
    FieldMismatch { field: &'static str },
    #[error("task count mismatch (expected={expected}, actual={actual})")]
    TaskCount { expected: usize, actual: usize },
    #[error("connection count mismatch (expected={expected}, actual={actual})")]
    ConnectionCount { expected: usize, actual: usize },
}

/// Compares the read-back shape of a write against the project that was
/// written: required header fields and collection counts.
pub fn verify_written(expected: &Project, actual: Option<&WrittenShape>) -> Result<(), WriteMismatch> {
    let Some(actual) = actual else {
        return Err(WriteMismatch::MissingProject);
    };
    let Some(header) = actual.header.as_ref() else {
        return Err(WriteMismatch::UnreadableProject);
    };
    if header.id != expected.id {
        return Err(WriteMismatch::FieldMismatch { field: "id" });
    }
    if header.name != expected.name {
        return Err(WriteMismatch::FieldMismatch { field: "name" });
    }
    if header.version != expected.version {
        return Err(WriteMismatch::FieldMismatch { field: "version" });
    }
    if actual.task_count != expected.tasks.len() {
        return Err(WriteMismatch::TaskCount {
            expected: expected.tasks.len(),
            actual: actual.task_count,
        });
    }
    if actual.connection_count != expected.connections.len() {
        return Err(WriteMismatch::ConnectionCount {
            expected: expected.connections.len(),
            actual: actual.connection_count,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tv_core::Task;

    fn shape(project: &Project) -> WrittenShape {
        WrittenShape {
            header: Some(project.header()),
            task_count: project.tasks.len(),
            connection_count: project.connections.len(),
        }
    }

    #[test]
    fn matching_shape_verifies() {
        let mut project = Project::new("p1", "Inbox");
        project.tasks.push(Task::new("t1", "x", 1));
        assert_eq!(verify_written(&project, Some(&shape(&project))), Ok(()));
    }

    #[test]
    fn lost_rows_and_headers_are_reported() {
        let mut project = Project::new("p1", "Inbox");
        project.tasks.push(Task::new("t1", "x", 1));
        project.tasks.push(Task::new("t2", "y", 1));

        let mut short = shape(&project);
        short.task_count = 1;
        assert_eq!(
            verify_written(&project, Some(&short)),
            Err(WriteMismatch::TaskCount {
                expected: 2,
                actual: 1
            })
        );

        let mut renamed = shape(&project);
        if let Some(header) = renamed.header.as_mut() {
            header.name = "Other".to_string();
        }
        assert_eq!(
            verify_written(&project, Some(&renamed)),
            Err(WriteMismatch::FieldMismatch { field: "name" })
        );
        assert_eq!(verify_written(&project, None), Err(WriteMismatch::MissingProject));
    }
}
