#![forbid(unsafe_code)]

pub mod action;
pub mod breaker;
pub mod classify;
pub mod ids;
pub mod integrity;
pub mod merge;
pub mod model;
pub mod ports;
pub mod queue;
pub mod undo;

pub use action::{ActionPayload, ActionType, EntityType, PayloadError, Priority, QueuedAction};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitBreakerValidation, CircuitLevel};
pub use classify::{ErrorCategory, classify_error};
pub use model::{Connection, Project, ProjectHeader, Task, TaskStatus};
