//! Task-scoped state: completion flags, output, step counter, action log.

use serde_json::{Map, Value};

/// Status of a task, derived from [`EnvState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    InProgress,
    Success,
    Failed,
}

/// Mutable record owned by the engine for the lifetime of one task.
///
/// Created at task start, discarded at task end. `output` is written only
/// by `finish`; `timeframe` never decreases; `log_history` only grows.
#[derive(Debug, Clone, Default)]
pub struct EnvState {
    pub has_succeeded: bool,
    pub has_failed: bool,
    pub output: Map<String, Value>,
    pub timeframe: u64,
    pub log_history: Vec<String>,
}

impl EnvState {
    /// `Success` iff `has_succeeded`, `Failed` iff `has_failed`, otherwise
    /// still in progress.
    pub fn status(&self) -> TaskStatus {
        if self.has_succeeded {
            TaskStatus::Success
        } else if self.has_failed {
            TaskStatus::Failed
        } else {
            TaskStatus::InProgress
        }
    }

    /// Record the terminal outcome. The flags always reflect the most
    /// recent call and stay mutually exclusive.
    pub fn finish(&mut self, did_succeed: bool, output: Map<String, Value>) {
        self.has_succeeded = did_succeed;
        self.has_failed = !did_succeed;
        self.output = output;
    }
}

/// Immutable task description plus named arguments, created once per
/// `act()` invocation.
#[derive(Debug, Clone)]
pub struct Task {
    pub description: String,
    pub args: Map<String, Value>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            args: Map::new(),
        }
    }

    /// Attach a named argument (credentials, search terms, and the like).
    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }
}
