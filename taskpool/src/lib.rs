//! TaskPool - a concurrency pool executor for asynchronous work units.
//!
//! This library schedules repeatedly-invoked generator tasks under several
//! simultaneous constraints: per-task and per-pool concurrency limits,
//! sliding-window frequency limits shared through groups, and per-task
//! invocation limits. On top of the executor, a persistent batcher coalesces
//! individual requests into batch invocations with configurable queuing
//! delay, batch size caps, and layered queue-depth thresholds.
//!
//! # High-Level API
//!
//! For most use cases, construct a [`executor::TaskPool`] and submit work
//! through its task constructors:
//!
//! ```ignore
//! use taskpool::executor::{TaskPool, PoolOptions, EachTaskOptions};
//!
//! let pool = TaskPool::new(PoolOptions::with_concurrency_limit(8))?;
//!
//! let handle = pool.add_each_task(
//!     EachTaskOptions::default(),
//!     vec![1u32, 2, 3],
//!     |n, _index| Box::pin(async move { Ok(n * 2) }),
//! )?;
//!
//! let doubled = handle.promise().await?;
//! ```

pub mod batcher;
pub mod executor;
pub mod logging;

/// Version of the taskpool library.
///
/// This is synchronized across all components in the workspace.
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
