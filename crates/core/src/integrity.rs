#![forbid(unsafe_code)]

use crate::ids::validate_entity_id;
use crate::model::Project;
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrityIssueKind {
    MissingId,
    DuplicateId,
    OrphanTask,
    BrokenConnection,
    InvalidField,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IntegrityIssue {
    pub kind: IntegrityIssueKind,
    pub severity: IssueSeverity,
    pub project_id: Option<String>,
    pub entity_id: Option<String>,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityCheckResult {
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityCheckResult {
    /// Error-severity findings block a migration; warnings do not.
    pub fn is_valid(&self) -> bool {
        self.errors().next().is_none()
    }

    pub fn errors(&self) -> impl Iterator<Item = &IntegrityIssue> {
        self.issues
            .iter()
            .filter(|issue| issue.severity == IssueSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &IntegrityIssue> {
        self.issues
            .iter()
            .filter(|issue| issue.severity == IssueSeverity::Warning)
    }
}

pub fn check_integrity(projects: &[Project]) -> IntegrityCheckResult {
    let mut result = IntegrityCheckResult::default();
    let mut project_ids = BTreeSet::new();

    for project in projects {
        let project_id = (!project.id.is_empty()).then(|| project.id.clone());
        if project.id.trim().is_empty() {
            result.push(
                IntegrityIssueKind::MissingId,
                IssueSeverity::Error,
                None,
                None,
                "project without id",
            );
        } else {
            if !project_ids.insert(project.id.as_str()) {
                result.push(
                    IntegrityIssueKind::DuplicateId,
                    IssueSeverity::Error,
                    project_id.clone(),
                    project_id.clone(),
                    "project id appears more than once",
                );
            }
            if let Err(err) = validate_entity_id(&project.id) {
                result.push(
                    IntegrityIssueKind::InvalidField,
                    IssueSeverity::Error,
                    project_id.clone(),
                    project_id.clone(),
                    err.message(),
                );
            }
        }
        if project.name.trim().is_empty() {
            result.push(
                IntegrityIssueKind::InvalidField,
                IssueSeverity::Warning,
                project_id.clone(),
                project_id.clone(),
                "project name is empty",
            );
        }
        check_project_entities(&mut result, project, project_id);
    }
    result
}

fn check_project_entities(
    result: &mut IntegrityCheckResult,
    project: &Project,
    project_id: Option<String>,
) {
    let mut task_ids = BTreeSet::new();
    for task in &project.tasks {
        if task.id.trim().is_empty() {
            result.push(
                IntegrityIssueKind::MissingId,
                IssueSeverity::Error,
                project_id.clone(),
                None,
                "task without id",
            );
            continue;
        }
        if !task_ids.insert(task.id.as_str()) {
            result.push(
                IntegrityIssueKind::DuplicateId,
                IssueSeverity::Error,
                project_id.clone(),
                Some(task.id.clone()),
                "task id appears more than once in the project",
            );
        }
        if task.title.trim().is_empty() {
            result.push(
                IntegrityIssueKind::InvalidField,
                IssueSeverity::Warning,
                project_id.clone(),
                Some(task.id.clone()),
                "task title is empty",
            );
        }
        if task.updated_at_ms < 0 {
            result.push(
                IntegrityIssueKind::InvalidField,
                IssueSeverity::Warning,
                project_id.clone(),
                Some(task.id.clone()),
                "task updated_at is negative",
            );
        }
    }

    for task in &project.tasks {
        let Some(parent_id) = task.parent_id.as_deref() else {
            continue;
        };
        if !task_ids.contains(parent_id) {
            result.push(
                IntegrityIssueKind::OrphanTask,
                IssueSeverity::Warning,
                project_id.clone(),
                Some(task.id.clone()),
                "task parent does not exist",
            );
        }
    }

    let mut connection_ids = BTreeSet::new();
    for connection in &project.connections {
        if connection.id.trim().is_empty() {
            result.push(
                IntegrityIssueKind::MissingId,
                IssueSeverity::Error,
                project_id.clone(),
                None,
                "connection without id",
            );
            continue;
        }
        if !connection_ids.insert(connection.id.as_str()) {
            result.push(
                IntegrityIssueKind::DuplicateId,
                IssueSeverity::Error,
                project_id.clone(),
                Some(connection.id.clone()),
                "connection id appears more than once in the project",
            );
        }
        if !task_ids.contains(connection.source.as_str())
            || !task_ids.contains(connection.target.as_str())
        {
            result.push(
                IntegrityIssueKind::BrokenConnection,
                IssueSeverity::Warning,
                project_id.clone(),
                Some(connection.id.clone()),
                "connection endpoint does not exist",
            );
        }
    }
}

impl IntegrityCheckResult {
    fn push(
        &mut self,
        kind: IntegrityIssueKind,
        severity: IssueSeverity,
        project_id: Option<String>,
        entity_id: Option<String>,
        message: &str,
    ) {
        self.issues.push(IntegrityIssue {
            kind,
            severity,
            project_id,
            entity_id,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Connection, Task};

    fn healthy_project() -> Project {
        let mut project = Project::new("p1", "Roadmap");
        project.tasks.push(Task::new("t1", "Plan", 1));
        let mut child = Task::new("t2", "Build", 2);
        child.parent_id = Some("t1".to_string());
        project.tasks.push(child);
        project.connections.push(Connection::new("c1", "t1", "t2"));
        project
    }

    #[test]
    fn healthy_data_has_no_issues() {
        let result = check_integrity(&[healthy_project()]);
        assert!(result.issues.is_empty());
        assert!(result.is_valid());
    }

    #[test]
    fn duplicates_and_missing_ids_are_errors() {
        let mut project = healthy_project();
        project.tasks.push(Task::new("t1", "Again", 3));
        project.tasks.push(Task::new("", "Nameless", 3));
        let result = check_integrity(&[project.clone(), project]);

        assert!(!result.is_valid());
        let kinds: Vec<_> = result.errors().map(|issue| issue.kind).collect();
        assert!(kinds.contains(&IntegrityIssueKind::DuplicateId));
        assert!(kinds.contains(&IntegrityIssueKind::MissingId));
        assert!(
            result
                .errors()
                .any(|issue| issue.kind == IntegrityIssueKind::DuplicateId
                    && issue.entity_id.as_deref() == Some("p1"))
        );
    }

    #[test]
    fn orphans_and_broken_connections_are_warnings() {
        let mut project = healthy_project();
        project.tasks[1].parent_id = Some("gone".to_string());
        project.connections.push(Connection::new("c2", "t1", "missing"));
        let result = check_integrity(&[project]);

        assert!(result.is_valid());
        let kinds: Vec<_> = result.warnings().map(|issue| issue.kind).collect();
        assert_eq!(
            kinds,
            vec![IntegrityIssueKind::OrphanTask, IntegrityIssueKind::BrokenConnection]
        );
    }

    #[test]
    fn malformed_project_id_is_an_invalid_field_error() {
        let project = Project::new("has space", "Broken");
        let result = check_integrity(&[project]);
        let issue = result.errors().next().expect("error issue");
        assert_eq!(issue.kind, IntegrityIssueKind::InvalidField);
    }
}
