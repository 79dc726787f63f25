//! Telemetry for pool execution observability.
//!
//! The scheduler emits structured events through a sink abstraction and
//! doesn't know how they are consumed - the "emit, don't present" pattern.
//! Consumers (logging, metrics, UIs) decide how to aggregate or display
//! them.
//!
//! # Example
//!
//! ```ignore
//! use taskpool::executor::{TelemetryEvent, TelemetrySink};
//!
//! struct LoggingSink;
//!
//! impl TelemetrySink for LoggingSink {
//!     fn emit(&self, event: TelemetryEvent) {
//!         tracing::info!(?event, "pool event");
//!     }
//! }
//! ```

use super::task::TaskId;

/// Events emitted during pool execution.
#[derive(Clone, Debug)]
pub enum TelemetryEvent {
    /// A task was registered with the pool.
    TaskSubmitted { id: TaskId },

    /// An invocation was started.
    InvocationStarted { id: TaskId, index: usize },

    /// An invocation finished, successfully or not.
    InvocationCompleted {
        id: TaskId,
        index: usize,
        success: bool,
    },

    /// A task recorded its first failure.
    TaskFailed { id: TaskId },

    /// A task finished and was removed from the pool.
    TaskTerminated { id: TaskId, invocations: usize },

    /// A batch of coalesced inputs was dispatched.
    BatchDispatched { id: TaskId, size: usize },
}

/// Receives telemetry events from the scheduler.
///
/// Implementations must be cheap and non-blocking; they are called from
/// the scheduling loop.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// A sink that discards all events. The default when none is provided.
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {
    fn emit(&self, _event: TelemetryEvent) {}
}
