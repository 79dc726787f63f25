//! Configuration and options for pools, groups, and tasks.
//!
//! All limits follow the same convention: `None` means unbounded, and
//! `Some(0)` is rejected at construction time with a [`ConfigError`].
//! Frequency limits come in pairs - a maximum number of invocation starts
//! per sliding window of a given duration - and are validated together.

use super::error::ConfigError;
use std::time::Duration;

// =============================================================================
// Shared Limit Validation
// =============================================================================

/// Concurrency and frequency limits shared by pools, groups, and the
/// private group of every task.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LimitOptions {
    /// Maximum simultaneous invocations, or `None` for unbounded.
    pub concurrency_limit: Option<usize>,

    /// Maximum invocation starts per frequency window, or `None` to
    /// disable frequency limiting.
    pub frequency_limit: Option<usize>,

    /// Length of the sliding frequency window. Required exactly when
    /// `frequency_limit` is set.
    pub frequency_window: Option<Duration>,
}

impl LimitOptions {
    /// Validates the limit combination.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == Some(0) {
            return Err(ConfigError::ZeroLimit {
                what: "concurrency limit",
            });
        }
        validate_frequency(self.frequency_limit, self.frequency_window)?;
        Ok(())
    }
}

/// Validates a frequency limit/window pair.
pub(crate) fn validate_frequency(
    limit: Option<usize>,
    window: Option<Duration>,
) -> Result<(), ConfigError> {
    match (limit, window) {
        (Some(0), _) => Err(ConfigError::ZeroLimit {
            what: "frequency limit",
        }),
        (Some(_), None) => Err(ConfigError::MissingFrequencyWindow),
        (None, Some(_)) => Err(ConfigError::MissingFrequencyLimit),
        (Some(_), Some(w)) if w.is_zero() => Err(ConfigError::ZeroFrequencyWindow),
        _ => Ok(()),
    }
}

// =============================================================================
// Pool and Group Options
// =============================================================================

/// Options for constructing a [`TaskPool`](super::TaskPool).
///
/// The limits apply to the pool's global group, which every task belongs
/// to, so they bound the pool as a whole.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolOptions {
    /// Limits for the pool's global group.
    pub limits: LimitOptions,
}

impl PoolOptions {
    /// Pool options with only a pool-wide concurrency limit.
    pub fn with_concurrency_limit(limit: usize) -> Self {
        Self {
            limits: LimitOptions {
                concurrency_limit: Some(limit),
                ..LimitOptions::default()
            },
        }
    }
}

/// Options for [`TaskPool::add_group`](super::TaskPool::add_group).
pub type GroupOptions = LimitOptions;

// =============================================================================
// Task Options
// =============================================================================

/// Options shared by every task constructor.
#[derive(Clone, Debug, Default)]
pub struct GenericTaskOptions {
    /// Optional caller-chosen task id. Must be unique within the pool;
    /// auto-generated when absent.
    pub id: Option<String>,

    /// Limits for the task's private group.
    pub limits: LimitOptions,

    /// Maximum number of generator invocations, or `None` for unbounded.
    /// Zero is allowed and produces a task that resolves immediately with
    /// an empty result sequence.
    pub invocation_limit: Option<usize>,

    /// Additional groups the task joins, beyond the pool's global group
    /// and its own private group.
    pub groups: Vec<super::GroupHandle>,

    /// Start the task paused. A paused task is skipped by the scheduler
    /// until resumed.
    pub paused: bool,
}

impl GenericTaskOptions {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate()
    }
}

/// Options for [`TaskPool::add_single_task`](super::TaskPool::add_single_task).
#[derive(Clone, Debug, Default)]
pub struct SingleTaskOptions {
    /// Optional caller-chosen task id.
    pub id: Option<String>,
}

/// Options for [`TaskPool::add_linear_task`](super::TaskPool::add_linear_task).
#[derive(Clone, Debug, Default)]
pub struct LinearTaskOptions {
    /// Optional caller-chosen task id.
    pub id: Option<String>,

    /// Maximum number of generator invocations.
    pub invocation_limit: Option<usize>,
}

/// Options for [`TaskPool::add_each_task`](super::TaskPool::add_each_task).
#[derive(Clone, Debug, Default)]
pub struct EachTaskOptions {
    /// Optional caller-chosen task id.
    pub id: Option<String>,

    /// Maximum simultaneous invocations.
    pub concurrency_limit: Option<usize>,

    /// Maximum number of generator invocations.
    pub invocation_limit: Option<usize>,
}

/// Options for [`TaskPool::add_batch_task`](super::TaskPool::add_batch_task).
#[derive(Clone, Debug, Default)]
pub struct BatchTaskOptions {
    /// Optional caller-chosen task id.
    pub id: Option<String>,

    /// Maximum simultaneous invocations.
    pub concurrency_limit: Option<usize>,

    /// Maximum number of generator invocations.
    pub invocation_limit: Option<usize>,
}

/// How many elements a batch task consumes per invocation.
pub enum BatchSize {
    /// A fixed slice size.
    Fixed(usize),

    /// Computed per invocation from `(remaining_elements, free_slots)`.
    /// A non-positive return value fails the task.
    Computed(Box<dyn Fn(usize, usize) -> usize + Send>),
}

impl BatchSize {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Fixed(0) => Err(ConfigError::ZeroLimit { what: "batch size" }),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for BatchSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(n) => f.debug_tuple("Fixed").field(n).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_unbounded() {
        let limits = LimitOptions::default();
        assert!(limits.validate().is_ok());
        assert_eq!(limits.concurrency_limit, None);
        assert_eq!(limits.frequency_limit, None);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let limits = LimitOptions {
            concurrency_limit: Some(0),
            ..LimitOptions::default()
        };
        assert_eq!(
            limits.validate(),
            Err(ConfigError::ZeroLimit {
                what: "concurrency limit"
            })
        );
    }

    #[test]
    fn test_frequency_limit_requires_window() {
        let limits = LimitOptions {
            frequency_limit: Some(2),
            ..LimitOptions::default()
        };
        assert_eq!(limits.validate(), Err(ConfigError::MissingFrequencyWindow));
    }

    #[test]
    fn test_frequency_window_requires_limit() {
        let limits = LimitOptions {
            frequency_window: Some(Duration::from_millis(100)),
            ..LimitOptions::default()
        };
        assert_eq!(limits.validate(), Err(ConfigError::MissingFrequencyLimit));
    }

    #[test]
    fn test_zero_frequency_window_rejected() {
        let limits = LimitOptions {
            frequency_limit: Some(2),
            frequency_window: Some(Duration::ZERO),
            ..LimitOptions::default()
        };
        assert_eq!(limits.validate(), Err(ConfigError::ZeroFrequencyWindow));
    }

    #[test]
    fn test_valid_frequency_pair() {
        let limits = LimitOptions {
            frequency_limit: Some(2),
            frequency_window: Some(Duration::from_millis(100)),
            ..LimitOptions::default()
        };
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_batch_size_zero_rejected() {
        assert!(BatchSize::Fixed(0).validate().is_err());
        assert!(BatchSize::Fixed(3).validate().is_ok());
        assert!(BatchSize::Computed(Box::new(|r, _| r)).validate().is_ok());
    }

    #[test]
    fn test_pool_options_with_concurrency_limit() {
        let options = PoolOptions::with_concurrency_limit(4);
        assert_eq!(options.limits.concurrency_limit, Some(4));
        assert!(options.limits.validate().is_ok());
    }
}
