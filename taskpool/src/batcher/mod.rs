//! Persistent Request Batching
//!
//! This module coalesces individual input requests into batch invocations
//! executed through a [`TaskPool`](crate::executor::TaskPool). Callers
//! submit one input at a time and await one output each; the batcher
//! decides when to cut a batch based on queue depth, a queuing delay, and
//! layered thresholds that cap concurrent-batch pressure.
//!
//! # Core Concepts
//!
//! - **Queuing delay**: how long the first queued input waits for company
//!   before a batch fires anyway.
//!
//! - **Queuing thresholds**: the minimum queue depth required to start a
//!   batch while N batches are already in flight. `[1]` always allows a
//!   batch; `[1, usize::MAX]` never runs two at once.
//!
//! - **Per-item outcomes**: each batch output resolves, retries, or fails
//!   its input independently. Retried inputs rejoin the queue ahead of
//!   newer ones.

mod batcher;

pub use batcher::{BatchOutput, BatcherOptions, PersistentBatcher};
