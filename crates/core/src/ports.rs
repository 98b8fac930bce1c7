#![forbid(unsafe_code)]

//! Contracts for the fire-and-forget collaborators: telemetry capture and
//! user notifications. Neither is ever on the critical path, so both return
//! nothing and must not panic.

use std::cell::RefCell;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TelemetryLevel {
    Info,
    Warning,
    Error,
}

pub trait Telemetry {
    fn capture_message(&self, level: TelemetryLevel, message: &str, context: &[(&str, String)]);

    fn capture_error(&self, error: &dyn std::error::Error, context: &[(&str, String)]) {
        self.capture_message(TelemetryLevel::Error, &error.to_string(), context);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeSeverity {
    Success,
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub severity: NoticeSeverity,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn new(severity: NoticeSeverity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            message: message.into(),
        }
    }
}

pub trait Notifier {
    fn notify(&self, notice: Notice);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn capture_message(&self, level: TelemetryLevel, message: &str, context: &[(&str, String)]) {
        let context = format_context(context);
        match level {
            TelemetryLevel::Info => tracing::info!(target: "taskvault::telemetry", %context, "{message}"),
            TelemetryLevel::Warning => {
                tracing::warn!(target: "taskvault::telemetry", %context, "{message}")
            }
            TelemetryLevel::Error => {
                tracing::error!(target: "taskvault::telemetry", %context, "{message}")
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        let Notice {
            severity,
            title,
            message,
        } = notice;
        match severity {
            NoticeSeverity::Success | NoticeSeverity::Info => {
                tracing::info!(target: "taskvault::notice", %title, "{message}")
            }
            NoticeSeverity::Warning => tracing::warn!(target: "taskvault::notice", %title, "{message}"),
            NoticeSeverity::Error => tracing::error!(target: "taskvault::notice", %title, "{message}"),
        }
    }
}

/// Keeps every notice in memory; hosts use it to batch notices into a single
/// toast, tests use it to assert on user-visible escalation.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: RefCell<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.borrow().clone()
    }

    pub fn count(&self, severity: NoticeSeverity) -> usize {
        self.notices
            .borrow()
            .iter()
            .filter(|notice| notice.severity == severity)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.borrow_mut().push(notice);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetryEvent {
    pub level: TelemetryLevel,
    pub message: String,
    pub context: Vec<(String, String)>,
}

impl TelemetryEvent {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: RefCell<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.borrow().clone()
    }
}

impl Telemetry for RecordingTelemetry {
    fn capture_message(&self, level: TelemetryLevel, message: &str, context: &[(&str, String)]) {
        self.events.borrow_mut().push(TelemetryEvent {
            level,
            message: message.to_string(),
            context: context
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        });
    }
}

impl<T: Telemetry + ?Sized> Telemetry for std::rc::Rc<T> {
    fn capture_message(&self, level: TelemetryLevel, message: &str, context: &[(&str, String)]) {
        (**self).capture_message(level, message, context);
    }
}

impl<T: Notifier + ?Sized> Notifier for std::rc::Rc<T> {
    fn notify(&self, notice: Notice) {
        (**self).notify(notice);
    }
}

fn format_context(context: &[(&str, String)]) -> String {
    context
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}
