//! Concurrency Pool Executor
//!
//! This module provides a pool that schedules asynchronous generator tasks
//! under shared constraints: concurrency limits, sliding-window frequency
//! limits, and invocation limits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskPool                              │
//! │  Validate options, register tasks/groups, query status      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                        Scheduler                             │
//! │  Single-owner event loop: commands, completions, timer      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │ Groups      │  │ Task        │  │ Telemetry           │  │
//! │  │ (readiness) │  │ Drivers     │  │ Sink                │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! - **Task**: a generator invoked repeatedly by the scheduler. Each
//!   invocation produces a future; results are collected by invocation
//!   index and delivered through [`TaskHandle::promise`].
//!
//! - **Group**: a constraint bundle (concurrency limit, frequency limit
//!   over a sliding window) shared by one or more tasks. Every task
//!   belongs to the pool's global group and to a private group carrying
//!   its own limits.
//!
//! - **Scheduler**: the single task owning all pool state, invoking
//!   whichever tasks are ready in registration order and arming a timer
//!   when only a frequency window blocks progress.
//!
//! # Example
//!
//! ```ignore
//! use taskpool::executor::{TaskPool, PoolOptions, GroupOptions, EachTaskOptions};
//! use std::time::Duration;
//!
//! let pool = TaskPool::new(PoolOptions::with_concurrency_limit(16))?;
//!
//! // At most 2 requests per second to this host.
//! let host = pool.add_group(GroupOptions {
//!     frequency_limit: Some(2),
//!     frequency_window: Some(Duration::from_secs(1)),
//!     ..GroupOptions::default()
//! })?;
//!
//! let handle = pool.add_each_task(
//!     EachTaskOptions::default(),
//!     urls,
//!     move |url, _i| Box::pin(fetch(url)),
//! )?;
//!
//! let bodies = handle.promise().await?;
//! ```

mod config;
mod error;
mod group;
mod handle;
mod pool;
mod scheduler;
mod task;
mod telemetry;

pub use config::{
    BatchSize, BatchTaskOptions, EachTaskOptions, GenericTaskOptions, GroupOptions, LimitOptions,
    LinearTaskOptions, PoolOptions, SingleTaskOptions,
};
pub use error::{ConfigError, TaskError};
pub use group::GroupHandle;
pub use handle::{BatchTaskHandle, SingleTaskHandle, TaskHandle, TaskStatus};
pub use pool::TaskPool;
pub use task::{TaskContext, TaskFuture, TaskId, TaskState};
pub use telemetry::{NullTelemetrySink, TelemetryEvent, TelemetrySink};
