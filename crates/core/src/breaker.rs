#![forbid(unsafe_code)]

//! Pre-sync anomaly guard. Every outbound project push is evaluated against
//! the last task count known to be good for that project; destructive-looking
//! drops and malformed payloads are blocked before they reach the remote.

use crate::ids::validate_entity_id;
use crate::model::Project;
use crate::ports::{Notice, NoticeSeverity, Notifier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CircuitLevel {
    #[default]
    L0,
    L1,
    L2,
    L3,
}

impl CircuitLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::L0 => "L0",
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::L3 => "L3",
        }
    }

    pub fn blocks(self) -> bool {
        self >= Self::L2
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DropBands {
    pub l1: f64,
    pub l2: f64,
    pub l3: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BreakerConfig {
    pub bands: DropBands,
    /// Used instead of `bands` once the baseline exceeds
    /// `large_project_threshold`.
    pub large_project_bands: DropBands,
    pub large_project_threshold: usize,
    /// Baselines below this use absolute drop counts instead of ratios.
    pub small_project_floor: usize,
    pub small_project_l1_drop: usize,
    pub small_project_l2_drop: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            bands: DropBands {
                l1: 0.25,
                l2: 0.5,
                l3: 0.8,
            },
            large_project_bands: DropBands {
                l1: 0.35,
                l2: 0.65,
                l3: 0.9,
            },
            large_project_threshold: 1_000,
            small_project_floor: 10,
            small_project_l1_drop: 3,
            small_project_l2_drop: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub rule: &'static str,
    pub severity: ViolationSeverity,
    pub entity_id: Option<String>,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ValidationStats {
    pub previous_count: Option<usize>,
    pub current_count: usize,
    pub drop_count: usize,
    pub drop_ratio: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CircuitBreakerValidation {
    pub passed: bool,
    pub level: CircuitLevel,
    pub should_block: bool,
    pub violations: Vec<Violation>,
    pub stats: ValidationStats,
    pub export_recommended: bool,
}

/// Pure evaluation of one project against an optional previous task count.
pub fn evaluate_project(
    config: &BreakerConfig,
    project: &Project,
    previous_count: Option<usize>,
) -> CircuitBreakerValidation {
    let current_count = project.tasks.len();
    let mut stats = ValidationStats {
        previous_count,
        current_count,
        ..ValidationStats::default()
    };

    let collapse = match previous_count {
        Some(previous) if previous > current_count => {
            stats.drop_count = previous - current_count;
            stats.drop_ratio = stats.drop_count as f64 / previous as f64;
            collapse_level(config, previous, current_count, stats.drop_count, stats.drop_ratio)
        }
        _ => CircuitLevel::L0,
    };

    let violations = structural_violations(project);
    let has_errors = violations
        .iter()
        .any(|violation| violation.severity == ViolationSeverity::Error);
    let level = if has_errors {
        collapse.max(CircuitLevel::L2)
    } else {
        collapse
    };

    CircuitBreakerValidation {
        passed: level <= CircuitLevel::L1 && !has_errors,
        level,
        should_block: level.blocks(),
        violations,
        stats,
        export_recommended: collapse == CircuitLevel::L3,
    }
}

fn collapse_level(
    config: &BreakerConfig,
    previous: usize,
    current: usize,
    drop_count: usize,
    drop_ratio: f64,
) -> CircuitLevel {
    if current == 0 {
        return CircuitLevel::L3;
    }
    if previous < config.small_project_floor {
        return if drop_count >= config.small_project_l2_drop {
            CircuitLevel::L2
        } else if drop_count >= config.small_project_l1_drop {
            CircuitLevel::L1
        } else {
            CircuitLevel::L0
        };
    }
    let bands = if previous > config.large_project_threshold {
        config.large_project_bands
    } else {
        config.bands
    };
    if drop_ratio >= bands.l3 {
        CircuitLevel::L3
    } else if drop_ratio >= bands.l2 {
        CircuitLevel::L2
    } else if drop_ratio >= bands.l1 {
        CircuitLevel::L1
    } else {
        CircuitLevel::L0
    }
}

fn structural_violations(project: &Project) -> Vec<Violation> {
    let mut out = Vec::new();
    if project.id.trim().is_empty() {
        out.push(violation("project.id.missing", ViolationSeverity::Error, None, "project id is missing"));
    } else if let Err(err) = validate_entity_id(&project.id) {
        out.push(violation(
            "project.id.format",
            ViolationSeverity::Error,
            Some(&project.id),
            err.message(),
        ));
    }
    if project.name.trim().is_empty() {
        out.push(violation(
            "project.name.missing",
            ViolationSeverity::Error,
            Some(&project.id),
            "project name is missing",
        ));
    }
    for task in &project.tasks {
        if task.id.trim().is_empty() {
            out.push(violation("task.id.missing", ViolationSeverity::Error, None, "task id is missing"));
            continue;
        }
        if let Err(err) = validate_entity_id(&task.id) {
            out.push(violation(
                "task.id.format",
                ViolationSeverity::Error,
                Some(&task.id),
                err.message(),
            ));
        }
        if task.title.trim().is_empty() {
            out.push(violation(
                "task.title.missing",
                ViolationSeverity::Warning,
                Some(&task.id),
                "task title is missing",
            ));
        }
    }
    out
}

fn violation(
    rule: &'static str,
    severity: ViolationSeverity,
    entity_id: Option<&str>,
    message: &str,
) -> Violation {
    Violation {
        rule,
        severity,
        entity_id: entity_id.map(str::to_string),
        message: message.to_string(),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ProjectCircuit {
    last_known_task_count: Option<usize>,
    level: CircuitLevel,
}

/// Per-project breaker context. The process-wide level is derived from the
/// tracked projects rather than stored on its own.
#[derive(Clone, Debug, Default)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    projects: BTreeMap<String, ProjectCircuit>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            projects: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn validate_before_sync(
        &mut self,
        project: &Project,
        previous_count_override: Option<usize>,
        notifier: &dyn Notifier,
    ) -> CircuitBreakerValidation {
        let previous = previous_count_override.or_else(|| self.last_known_task_count(&project.id));
        let validation = evaluate_project(&self.config, project, previous);
        self.projects.entry(project.id.clone()).or_default().level = validation.level;

        match validation.level {
            CircuitLevel::L0 => {}
            CircuitLevel::L1 => tracing::info!(
                project_id = %project.id,
                previous = ?validation.stats.previous_count,
                current = validation.stats.current_count,
                "task count dropped noticeably before sync"
            ),
            CircuitLevel::L2 => {
                tracing::warn!(
                    project_id = %project.id,
                    previous = ?validation.stats.previous_count,
                    current = validation.stats.current_count,
                    violations = validation.violations.len(),
                    "sync paused by circuit breaker"
                );
                notifier.notify(Notice::new(
                    NoticeSeverity::Warning,
                    "Sync paused",
                    format!(
                        "\"{}\" changed more than expected ({} of {} tasks would remain). \
                         Review the project before syncing again.",
                        project.name,
                        validation.stats.current_count,
                        describe_previous(validation.stats.previous_count),
                    ),
                ));
            }
            CircuitLevel::L3 => {
                tracing::error!(
                    project_id = %project.id,
                    previous = ?validation.stats.previous_count,
                    current = validation.stats.current_count,
                    "sync blocked by circuit breaker"
                );
                notifier.notify(Notice::new(
                    NoticeSeverity::Error,
                    "Sync blocked to protect your data",
                    format!(
                        "\"{}\" would go from {} to {} tasks. Nothing was uploaded. \
                         Export the project now, then confirm the deletion if it was intended.",
                        project.name,
                        describe_previous(validation.stats.previous_count),
                        validation.stats.current_count,
                    ),
                ));
            }
        }
        validation
    }

    pub fn last_known_task_count(&self, project_id: &str) -> Option<usize> {
        self.projects
            .get(project_id)
            .and_then(|circuit| circuit.last_known_task_count)
    }

    pub fn update_last_known_task_count(&mut self, project_id: &str, count: usize) {
        self.projects
            .entry(project_id.to_string())
            .or_default()
            .last_known_task_count = Some(count);
    }

    pub fn project_level(&self, project_id: &str) -> CircuitLevel {
        self.projects
            .get(project_id)
            .map(|circuit| circuit.level)
            .unwrap_or_default()
    }

    pub fn current_level(&self) -> CircuitLevel {
        self.projects
            .values()
            .map(|circuit| circuit.level)
            .max()
            .unwrap_or_default()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.current_level().blocks()
    }

    /// Forgets the baseline and level of one project, after the user
    /// confirmed a large deletion was intentional.
    pub fn reset_circuit_state(&mut self, project_id: &str) {
        self.projects.remove(project_id);
    }

    pub fn clear_all_circuit_states(&mut self) {
        self.projects.clear();
    }
}

fn describe_previous(previous: Option<usize>) -> String {
    previous.map_or_else(|| "an unknown number of".to_string(), |count| count.to_string())
}
