//! Task handles for control, queries, and awaiting results.
//!
//! A [`TaskHandle`] is returned when a task is added to the pool. It is
//! cloneable; all clones refer to the same task. Control methods
//! (`pause`, `resume`, `end`, limit setters) are non-blocking commands
//! processed by the scheduler. Queries read live shared counters, and
//! [`TaskHandle::promise`] awaits the task's final outcome.
//!
//! # Example
//!
//! ```ignore
//! let handle = pool.add_generic_task(options, generator)?;
//!
//! if handle.state() == TaskState::Active {
//!     handle.pause();
//! }
//! handle.resume();
//!
//! let results = handle.promise().await?;
//! ```

use super::error::{ConfigError, TaskError};
use super::group::GroupShared;
use super::scheduler::{Command, TaskOp};
use super::task::{ResultHolder, ResultWaiter, TaskId, TaskShared, TaskState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

// =============================================================================
// Task Handle
// =============================================================================

/// Handle to a pooled task.
pub struct TaskHandle<R> {
    pub(crate) id: TaskId,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) state_rx: watch::Receiver<TaskState>,
    pub(crate) shared: Arc<TaskShared>,
    /// Slot 0 is the pool's global group, slot 1 the task's private group.
    pub(crate) group_shareds: Vec<Arc<GroupShared>>,
    pub(crate) holder: ResultHolder<R>,
}

impl<R> Clone for TaskHandle<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            commands: self.commands.clone(),
            state_rx: self.state_rx.clone(),
            shared: Arc::clone(&self.shared),
            group_shareds: self.group_shareds.clone(),
            holder: Arc::clone(&self.holder),
        }
    }
}

impl<R> TaskHandle<R> {
    /// The task's unique identifier.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// The task's current lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.state_rx.borrow()
    }

    /// Number of invocations started so far.
    pub fn invocations(&self) -> usize {
        self.shared.invocations.load(Ordering::Acquire)
    }

    /// Number of invocations currently in flight.
    pub fn active_promise_count(&self) -> usize {
        self.group_shareds[1].active_promises.load(Ordering::Acquire)
    }

    /// Invocations the task could start right now: the minimum spare
    /// capacity across its groups, capped by remaining invocations.
    pub fn free_slots(&self) -> usize {
        self.group_shareds
            .iter()
            .map(|group| group.free_slots())
            .min()
            .unwrap_or(usize::MAX)
            .min(self.shared.remaining_invocations())
    }

    /// Suspends the task: no new invocations start, in-flight ones
    /// continue. Only an Active task can pause.
    pub fn pause(&self) {
        self.send(TaskOp::Pause);
    }

    /// Resumes a paused task and triggers a scheduling pass.
    pub fn resume(&self) {
        self.send(TaskOp::Resume);
    }

    /// Ends the task: no further invocations start. The task terminates
    /// once in-flight invocations drain (immediately when none are).
    pub fn end(&self) {
        self.send(TaskOp::End);
    }

    /// Replaces the invocation limit. `None` removes the limit; a value
    /// at or below the current invocation count ends the task. Raising a
    /// previously-reached limit lets the task continue.
    pub fn set_invocation_limit(&self, limit: Option<usize>) {
        self.send(TaskOp::SetInvocationLimit(limit));
    }

    /// Replaces the task's own concurrency limit.
    pub fn set_concurrency_limit(&self, limit: Option<usize>) -> Result<(), ConfigError> {
        if limit == Some(0) {
            return Err(ConfigError::ZeroLimit {
                what: "concurrency limit",
            });
        }
        self.send(TaskOp::SetConcurrencyLimit(limit));
        Ok(())
    }

    /// Replaces the task's own frequency limit and window together.
    /// `None` disables frequency limiting.
    pub fn set_frequency(
        &self,
        limit: Option<usize>,
        window: Option<Duration>,
    ) -> Result<(), ConfigError> {
        super::config::validate_frequency(limit, window)?;
        self.send(TaskOp::SetFrequency(limit.zip(window)));
        Ok(())
    }

    fn send(&self, op: TaskOp) {
        let _ = self.commands.send(Command::Task {
            id: self.id.clone(),
            op,
        });
    }
}

impl<R: Clone + Send + 'static> TaskHandle<R> {
    /// Completes when the task terminates, with the result sequence in
    /// invocation order, or with the task's recorded failure.
    ///
    /// Awaiting (or polling) a failed task's promise claims the error,
    /// which suppresses the unobserved-failure report.
    pub async fn promise(&self) -> Result<Vec<R>, TaskError> {
        if let Some(outcome) = self.stored_outcome() {
            return outcome;
        }

        let (tx, rx) = oneshot::channel::<Result<Vec<R>, TaskError>>();
        let waiter: ResultWaiter<R> = tx;
        if self
            .commands
            .send(Command::Task {
                id: self.id.clone(),
                op: TaskOp::AddWaiter(Box::new(waiter)),
            })
            .is_err()
        {
            return self
                .stored_outcome()
                .unwrap_or_else(|| Err(TaskError::pool_closed()));
        }

        match rx.await {
            Ok(outcome) => self.claim(outcome),
            // The task settled between the holder check and the command
            // being processed; the stored outcome is authoritative.
            Err(_) => self
                .stored_outcome()
                .unwrap_or_else(|| Err(TaskError::pool_closed())),
        }
    }

    fn stored_outcome(&self) -> Option<Result<Vec<R>, TaskError>> {
        let outcome = self.holder.lock().unwrap().clone()?;
        Some(self.claim(outcome))
    }

    fn claim(&self, outcome: Result<Vec<R>, TaskError>) -> Result<Vec<R>, TaskError> {
        if outcome.is_err()
            && !self
                .shared
                .rejection_handled
                .swap(true, Ordering::AcqRel)
        {
            debug!(task_id = %self.id, "task failure claimed");
        }
        outcome
    }
}

impl<R> std::fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("invocations", &self.invocations())
            .finish()
    }
}

// =============================================================================
// Sugar Handles
// =============================================================================

/// Handle to a task with a single invocation, resolving with its one value.
#[derive(Clone, Debug)]
pub struct SingleTaskHandle<R> {
    pub(crate) inner: TaskHandle<R>,
}

impl<R: Clone + Send + 'static> SingleTaskHandle<R> {
    /// Completes with the single invocation's value.
    pub async fn promise(&self) -> Result<R, TaskError> {
        let mut results = self.inner.promise().await?;
        if results.is_empty() {
            return Err(TaskError::new("task ended before producing a result"));
        }
        Ok(results.remove(0))
    }

    /// The underlying task handle.
    pub fn inner(&self) -> &TaskHandle<R> {
        &self.inner
    }

    /// The task's unique identifier.
    pub fn id(&self) -> &TaskId {
        self.inner.id()
    }

    /// The task's current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.inner.state()
    }
}

/// Handle to a batch task, resolving with the per-element results
/// flattened across batch invocations.
#[derive(Clone, Debug)]
pub struct BatchTaskHandle<R> {
    pub(crate) inner: TaskHandle<Vec<R>>,
}

impl<R: Clone + Send + 'static> BatchTaskHandle<R> {
    /// Completes with one result per input element, in input order.
    pub async fn promise(&self) -> Result<Vec<R>, TaskError> {
        let batches = self.inner.promise().await?;
        Ok(batches.into_iter().flatten().collect())
    }

    /// The underlying task handle.
    pub fn inner(&self) -> &TaskHandle<Vec<R>> {
        &self.inner
    }

    /// The task's unique identifier.
    pub fn id(&self) -> &TaskId {
        self.inner.id()
    }

    /// The task's current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.inner.state()
    }
}

// =============================================================================
// Status Snapshot
// =============================================================================

/// Point-in-time view of a live task, from `TaskPool::task_status`.
#[derive(Clone, Debug)]
pub struct TaskStatus {
    pub id: TaskId,
    pub state: TaskState,
    pub invocations: usize,
    /// `None` means unbounded.
    pub invocation_limit: Option<usize>,
    pub active_promise_count: usize,
    pub free_slots: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn handle_with_holder(outcome: Option<Result<Vec<u32>, TaskError>>) -> TaskHandle<u32> {
        let (commands, _rx) = mpsc::unbounded_channel();
        let (_state_tx, state_rx) = watch::channel(TaskState::Active);
        TaskHandle {
            id: TaskId::new("test"),
            commands,
            state_rx,
            shared: TaskShared::new(None),
            group_shareds: vec![GroupShared::new(None), GroupShared::new(Some(4))],
            holder: Arc::new(Mutex::new(outcome)),
        }
    }

    #[tokio::test]
    async fn test_promise_reads_stored_outcome() {
        let handle = handle_with_holder(Some(Ok(vec![1, 2, 3])));
        assert_eq!(handle.promise().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_promise_claims_stored_failure() {
        let handle = handle_with_holder(Some(Err(TaskError::new("boom"))));
        assert!(!handle.shared.rejection_handled.load(Ordering::Acquire));
        assert!(handle.promise().await.is_err());
        assert!(handle.shared.rejection_handled.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_promise_fails_when_pool_gone() {
        let (commands, rx) = mpsc::unbounded_channel();
        drop(rx);
        let (_state_tx, state_rx) = watch::channel(TaskState::Active);
        let handle: TaskHandle<u32> = TaskHandle {
            id: TaskId::new("orphan"),
            commands,
            state_rx,
            shared: TaskShared::new(None),
            group_shareds: vec![GroupShared::new(None), GroupShared::new(None)],
            holder: Arc::new(Mutex::new(None)),
        };
        let outcome = handle.promise().await;
        assert_eq!(outcome.unwrap_err().message(), "pool has been shut down");
    }

    #[test]
    fn test_free_slots_uses_tightest_group() {
        let handle = handle_with_holder(None);
        handle.group_shareds[1]
            .active_promises
            .store(3, Ordering::Release);
        assert_eq!(handle.free_slots(), 1);
    }

    #[tokio::test]
    async fn test_single_handle_takes_first_value() {
        let inner = handle_with_holder(Some(Ok(vec![42])));
        let single = SingleTaskHandle { inner };
        assert_eq!(single.promise().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_single_handle_empty_results_is_error() {
        let inner = handle_with_holder(Some(Ok(vec![])));
        let single = SingleTaskHandle { inner };
        assert!(single.promise().await.is_err());
    }

    #[tokio::test]
    async fn test_batch_handle_flattens() {
        let (commands, _rx) = mpsc::unbounded_channel();
        let (_state_tx, state_rx) = watch::channel(TaskState::Active);
        let inner: TaskHandle<Vec<u32>> = TaskHandle {
            id: TaskId::new("batch"),
            commands,
            state_rx,
            shared: TaskShared::new(None),
            group_shareds: vec![GroupShared::new(None), GroupShared::new(None)],
            holder: Arc::new(Mutex::new(Some(Ok(vec![vec![1, 2], vec![3]])))),
        };
        let batch = BatchTaskHandle { inner };
        assert_eq!(batch.promise().await.unwrap(), vec![1, 2, 3]);
    }
}
