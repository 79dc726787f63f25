//! Error types for the pool executor.

use thiserror::Error;

/// Errors raised while validating pool, group, or task construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A concurrency or frequency limit was zero.
    #[error("{what} must be a positive integer")]
    ZeroLimit { what: &'static str },

    /// A frequency limit was given without a window.
    #[error("a frequency limit requires a frequency window")]
    MissingFrequencyWindow,

    /// A frequency window was given without a limit.
    #[error("a frequency window requires a frequency limit")]
    MissingFrequencyLimit,

    /// A frequency window of zero duration.
    #[error("frequency window must be a non-zero duration")]
    ZeroFrequencyWindow,

    /// A task id is already registered with the pool.
    #[error("task id '{0}' is already in use")]
    DuplicateTaskId(String),

    /// A group from a different pool was attached to a task.
    #[error("group belongs to a different pool")]
    ForeignGroup,

    /// The queuing thresholds sequence was empty.
    #[error("queuing thresholds must contain at least one entry")]
    EmptyThresholds,

    /// A queuing threshold was zero.
    #[error("queuing thresholds must be positive integers")]
    ZeroThreshold,

    /// The pool's scheduler has shut down.
    #[error("pool has been shut down")]
    PoolClosed,
}

/// A runtime task failure.
///
/// Carries a human-readable message and is cheaply clonable so a single
/// failure can be delivered to every waiter on the task and on each of
/// its groups.
#[derive(Debug, Clone)]
pub struct TaskError {
    /// Human-readable error message.
    message: String,
}

impl TaskError {
    /// Creates a new task error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Creates an error from a caught panic payload.
    ///
    /// Extracts the panic message when it is a string, which covers
    /// `panic!("...")` and `assert!` failures.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "generator panicked".to_string()
        };
        Self::new(format!("generator panicked: {message}"))
    }

    /// Creates the error used when a batch returns the wrong number of outputs.
    pub(crate) fn batch_shape(expected: usize, got: usize) -> Self {
        Self::new(format!(
            "batch output length {got} does not match input length {expected}"
        ))
    }

    /// Creates the error delivered to waiters when the pool shuts down.
    pub(crate) fn pool_closed() -> Self {
        Self::new("pool has been shut down")
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {}
