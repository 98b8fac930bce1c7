#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use tv_core::Project;

#[derive(Clone, Debug)]
struct PendingWrite {
    project: Project,
    due_at_ms: i64,
}

/// Per-project debounced saves. Scheduling again replaces the pending copy
/// and pushes its deadline back, so at most one write per project is ever
/// outstanding.
#[derive(Clone, Debug, Default)]
pub struct PendingWrites {
    delay_ms: i64,
    entries: BTreeMap<String, PendingWrite>,
}

impl PendingWrites {
    pub fn new(delay_ms: i64) -> Self {
        Self {
            delay_ms,
            entries: BTreeMap::new(),
        }
    }

    pub fn schedule(&mut self, project: Project, now_ms: i64) -> i64 {
        let due_at_ms = now_ms.saturating_add(self.delay_ms);
        self.entries
            .insert(project.id.clone(), PendingWrite { project, due_at_ms });
        due_at_ms
    }

    pub fn cancel(&mut self, project_id: &str) -> bool {
        self.entries.remove(project_id).is_some()
    }

    pub fn due_at(&self, project_id: &str) -> Option<i64> {
        self.entries.get(project_id).map(|entry| entry.due_at_ms)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn take_due(&mut self, now_ms: i64) -> Vec<Project> {
        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.due_at_ms <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();
        due.iter()
            .filter_map(|id| self.entries.remove(id))
            .map(|entry| entry.project)
            .collect()
    }

    pub fn drain(&mut self) -> Vec<Project> {
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|entry| entry.project)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescheduling_replaces_and_delays() {
        let mut writes = PendingWrites::new(100);
        let mut first = Project::new("p1", "v1");
        writes.schedule(first.clone(), 0);
        first.name = "v2".to_string();
        assert_eq!(writes.schedule(first, 80), 180);
        writes.schedule(Project::new("p2", "other"), 50);

        assert!(writes.take_due(149).is_empty());
        let due = writes.take_due(150);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "p2");

        let due = writes.take_due(180);
        assert_eq!(due[0].name, "v2");
        assert!(writes.is_empty());
    }

    #[test]
    fn cancel_and_drain() {
        let mut writes = PendingWrites::new(100);
        writes.schedule(Project::new("p1", "a"), 0);
        writes.schedule(Project::new("p2", "b"), 0);
        assert!(writes.cancel("p1"));
        assert!(!writes.cancel("p1"));
        assert_eq!(writes.drain().len(), 1);
        assert_eq!(writes.len(), 0);
    }
}
