//! The persistent batcher and its backing pool task.
//!
//! The batcher owns a queue of pending inputs and a paused pool task. When
//! a batch may start (queue depth, delay, or an explicit send), the backing
//! task is resumed; its generator drains up to `max_batch_size` inputs and
//! returns the batch future, pausing itself again when no further batch can
//! start. The backing task inherits the configured concurrency and
//! frequency limits through its private group, so batches are throttled
//! like any other pooled work.

use crate::executor::{
    ConfigError, GenericTaskOptions, LimitOptions, TaskContext, TaskError, TaskFuture, TaskHandle,
    TaskPool, TaskState,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

// =============================================================================
// Public Types
// =============================================================================

/// Per-item outcome of a batch invocation.
///
/// The generator returns exactly one of these per input, positionally.
pub enum BatchOutput<O> {
    /// Resolve the input's waiter with this value.
    Value(O),

    /// Requeue the input at the head of the queue for the next batch.
    Retry,

    /// Fail the input's waiter with this error.
    Fail(TaskError),
}

impl<O> std::fmt::Debug for BatchOutput<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(_) => f.write_str("Value(..)"),
            Self::Retry => f.write_str("Retry"),
            Self::Fail(err) => f.debug_tuple("Fail").field(err).finish(),
        }
    }
}

/// Options for [`TaskPool::add_persistent_batch_task`].
#[derive(Clone, Debug)]
pub struct BatcherOptions {
    /// Optional id for the backing task.
    pub id: Option<String>,

    /// Maximum inputs per batch, or `None` for unbounded. Reaching this
    /// depth starts a batch immediately, without waiting for the delay.
    pub max_batch_size: Option<usize>,

    /// How long the queue waits after receiving its first input (or after
    /// a batch start leaves inputs behind) before a batch fires anyway.
    /// The default of zero fires on the next scheduling pass, which still
    /// coalesces inputs submitted in the same cooperative step.
    pub queuing_delay: Duration,

    /// Minimum queue depth required to start a batch while N batches are
    /// in flight; the last entry applies to all deeper nesting. Use
    /// `usize::MAX` as an entry to forbid that level of concurrency.
    pub queuing_thresholds: Vec<usize>,

    /// Concurrency and frequency limits for the backing task.
    pub limits: LimitOptions,
}

impl Default for BatcherOptions {
    fn default() -> Self {
        Self {
            id: None,
            max_batch_size: None,
            queuing_delay: Duration::ZERO,
            queuing_thresholds: vec![1],
            limits: LimitOptions::default(),
        }
    }
}

impl BatcherOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate()?;
        if self.max_batch_size == Some(0) {
            return Err(ConfigError::ZeroLimit {
                what: "max batch size",
            });
        }
        if self.queuing_thresholds.is_empty() {
            return Err(ConfigError::EmptyThresholds);
        }
        if self.queuing_thresholds.contains(&0) {
            return Err(ConfigError::ZeroThreshold);
        }
        Ok(())
    }
}

// =============================================================================
// Batcher
// =============================================================================

type BatchGenerator<I, O> =
    Box<dyn Fn(Vec<I>) -> BoxFuture<'static, Result<Vec<BatchOutput<O>>, TaskError>> + Send + Sync>;

struct PendingInput<I, O> {
    input: I,
    waiter: oneshot::Sender<Result<O, TaskError>>,
}

struct BatcherState<I, O> {
    queue: VecDeque<PendingInput<I, O>>,
    /// Batches currently in flight.
    running: usize,
    /// An explicit `send` is pending until a batch starts.
    send_requested: bool,
    /// When the queued inputs fire regardless of depth. `None` while the
    /// queue is empty.
    deadline: Option<Instant>,
    terminated: bool,
}

struct BatcherInner<I, O> {
    state: Mutex<BatcherState<I, O>>,
    task: OnceLock<TaskHandle<()>>,
    generator: BatchGenerator<I, O>,
    /// `usize::MAX` means unbounded.
    max_batch_size: usize,
    queuing_delay: Duration,
    thresholds: Vec<usize>,
}

/// Coalesces individual inputs into batch invocations.
///
/// Cloneable; all clones feed the same queue. See the
/// [module docs](crate::batcher) for the dispatch rules.
pub struct PersistentBatcher<I, O> {
    inner: Arc<BatcherInner<I, O>>,
}

impl<I, O> Clone for PersistentBatcher<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, O> PersistentBatcher<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    pub(crate) fn new<G>(
        pool: &TaskPool,
        options: BatcherOptions,
        generator: G,
    ) -> Result<Self, ConfigError>
    where
        G: Fn(Vec<I>) -> BoxFuture<'static, Result<Vec<BatchOutput<O>>, TaskError>>
            + Send
            + Sync
            + 'static,
    {
        options.validate()?;

        let inner = Arc::new(BatcherInner {
            state: Mutex::new(BatcherState {
                queue: VecDeque::new(),
                running: 0,
                send_requested: false,
                deadline: None,
                terminated: false,
            }),
            task: OnceLock::new(),
            generator: Box::new(generator),
            max_batch_size: options.max_batch_size.unwrap_or(usize::MAX),
            queuing_delay: options.queuing_delay,
            thresholds: options.queuing_thresholds.clone(),
        });

        // The backing task starts paused and is resumed by triggers. Its
        // generator holds only a weak reference, so dropping every batcher
        // clone lets the task end on its next invocation.
        let weak = Arc::downgrade(&inner);
        let handle = pool.add_task_inner::<(), _>(
            GenericTaskOptions {
                id: options.id,
                limits: options.limits,
                paused: true,
                ..GenericTaskOptions::default()
            },
            move |ctx: &TaskContext, _index: usize| match weak.upgrade() {
                Some(inner) => BatcherInner::generate(&inner, ctx),
                None => None,
            },
            true,
        )?;
        inner
            .task
            .set(handle)
            .unwrap_or_else(|_| unreachable!("backing task registered once"));

        Ok(Self { inner })
    }

    /// Queues one input and completes with its output once a batch
    /// containing it runs.
    pub async fn get_result(&self, input: I) -> Result<O, TaskError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.terminated {
                return Err(TaskError::new("batcher has ended"));
            }
            state.queue.push_back(PendingInput { input, waiter: tx });

            let mut newly_armed = None;
            if state.deadline.is_none() {
                let deadline = Instant::now() + self.inner.queuing_delay;
                state.deadline = Some(deadline);
                newly_armed = Some(deadline);
            }

            let start_now = self.inner.can_start(&state);
            drop(state);

            if start_now {
                self.inner.backing_task().resume();
            } else if let Some(deadline) = newly_armed {
                self.inner.arm_timer(deadline);
            }
        }
        rx.await
            .unwrap_or_else(|_| Err(TaskError::new("batcher has ended")))
    }

    /// Fires the queued inputs without waiting for the delay, still
    /// subject to the queuing thresholds. While thresholds forbid a start
    /// the request is remembered, so the queue fires as soon as an
    /// in-flight batch completes.
    pub fn send(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.terminated {
            return;
        }
        state.send_requested = true;
        let fire = self.inner.can_start(&state);
        drop(state);
        if fire {
            self.inner.backing_task().resume();
        }
    }

    /// Ends the batcher: queued and future inputs fail, and the backing
    /// task terminates once in-flight batches drain.
    pub fn end(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.terminated = true;
        state.deadline = None;
        let ended = TaskError::new("batcher has ended");
        for pending in state.queue.drain(..) {
            let _ = pending.waiter.send(Err(ended.clone()));
        }
        drop(state);
        self.inner.backing_task().end();
    }

    /// Lifecycle state of the backing task.
    pub fn state(&self) -> TaskState {
        self.inner.backing_task().state()
    }

    /// Number of inputs waiting for a batch.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    #[cfg(test)]
    pub(crate) fn backing_task(&self) -> &TaskHandle<()> {
        self.inner.backing_task()
    }
}

impl<I, O> std::fmt::Debug for PersistentBatcher<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("PersistentBatcher")
            .field("queued", &state.queue.len())
            .field("running", &state.running)
            .field("terminated", &state.terminated)
            .finish()
    }
}

// =============================================================================
// Dispatch Internals
// =============================================================================

impl<I, O> BatcherInner<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    fn backing_task(&self) -> &TaskHandle<()> {
        self.task.get().expect("backing task registered")
    }

    /// Whether a batch may start right now.
    fn can_start(&self, state: &BatcherState<I, O>) -> bool {
        if state.terminated || state.queue.is_empty() {
            return false;
        }
        let threshold = self.thresholds[state.running.min(self.thresholds.len() - 1)];
        if state.queue.len() < threshold {
            return false;
        }
        state.queue.len() >= self.max_batch_size
            || state.send_requested
            || state
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// The backing task's generator: takes one batch off the queue, or
    /// pauses the task when no batch can start.
    fn generate(self: &Arc<Self>, ctx: &TaskContext) -> Option<TaskFuture<()>> {
        let mut state = self.state.lock().unwrap();
        if state.terminated {
            return None;
        }
        if !self.can_start(&state) {
            ctx.pause();
            return None;
        }

        let take = self.max_batch_size.min(state.queue.len());
        let items: Vec<PendingInput<I, O>> = state.queue.drain(..take).collect();
        state.running += 1;
        state.send_requested = false;
        // Leftover inputs wait a fresh delay measured from this start.
        state.deadline = if state.queue.is_empty() {
            None
        } else {
            Some(Instant::now() + self.queuing_delay)
        };
        if !self.can_start(&state) {
            ctx.pause();
        }
        let armed = state.deadline;
        drop(state);
        if let Some(deadline) = armed {
            self.arm_timer(deadline);
        }

        debug!(task_id = %ctx.id(), size = items.len(), "batch dispatched");

        let inputs: Vec<I> = items.iter().map(|item| item.input.clone()).collect();
        let batch_future = (self.generator)(inputs);
        let weak = Arc::downgrade(self);

        Some(
            async move {
                let result = match AssertUnwindSafe(batch_future).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(TaskError::from_panic(payload)),
                };

                let mut retries: Vec<PendingInput<I, O>> = Vec::new();
                match result {
                    Ok(outputs) if outputs.len() == items.len() => {
                        for (output, item) in outputs.into_iter().zip(items) {
                            match output {
                                BatchOutput::Value(value) => {
                                    let _ = item.waiter.send(Ok(value));
                                }
                                BatchOutput::Fail(error) => {
                                    let _ = item.waiter.send(Err(error));
                                }
                                BatchOutput::Retry => retries.push(item),
                            }
                        }
                    }
                    Ok(outputs) => {
                        let error = TaskError::batch_shape(items.len(), outputs.len());
                        for item in items {
                            let _ = item.waiter.send(Err(error.clone()));
                        }
                    }
                    Err(error) => {
                        for item in items {
                            let _ = item.waiter.send(Err(error.clone()));
                        }
                    }
                }

                if let Some(inner) = weak.upgrade() {
                    inner.finish_batch(retries);
                }
                // Batch errors reach waiters directly; the backing task
                // itself stays healthy.
                Ok(())
            }
            .boxed(),
        )
    }

    /// Re-evaluates triggering after a batch completes. Runs without a
    /// fresh delay so a full queue, a remembered send, or an elapsed
    /// deadline fires as soon as a slot frees.
    fn finish_batch(self: &Arc<Self>, retries: Vec<PendingInput<I, O>>) {
        let mut state = self.state.lock().unwrap();
        state.running -= 1;

        if state.terminated {
            let ended = TaskError::new("batcher has ended");
            for pending in retries {
                let _ = pending.waiter.send(Err(ended.clone()));
            }
            return;
        }

        // Retried inputs go back to the head, keeping their relative order
        // ahead of newer inputs.
        for pending in retries.into_iter().rev() {
            state.queue.push_front(pending);
        }

        if self.can_start(&state) {
            drop(state);
            self.backing_task().resume();
        } else if !state.queue.is_empty() && state.deadline.is_none() {
            let deadline = Instant::now() + self.queuing_delay;
            state.deadline = Some(deadline);
            drop(state);
            self.arm_timer(deadline);
        }
    }

    /// Wakes the queue at `deadline`. A stale timer is harmless: the
    /// deadline is re-checked under the lock before anything fires.
    fn arm_timer(self: &Arc<Self>, deadline: Instant) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                let state = inner.state.lock().unwrap();
                let fire = inner.can_start(&state);
                drop(state);
                if fire {
                    inner.backing_task().resume();
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{PoolOptions, TaskPool};

    fn echo_generator(
        inputs: Vec<u32>,
    ) -> BoxFuture<'static, Result<Vec<BatchOutput<u32>>, TaskError>> {
        futures::future::ready(Ok(inputs.into_iter().map(BatchOutput::Value).collect())).boxed()
    }

    #[test]
    fn test_options_validation() {
        assert!(BatcherOptions::default().validate().is_ok());

        let zero_batch = BatcherOptions {
            max_batch_size: Some(0),
            ..BatcherOptions::default()
        };
        assert!(matches!(
            zero_batch.validate(),
            Err(ConfigError::ZeroLimit { .. })
        ));

        let empty = BatcherOptions {
            queuing_thresholds: vec![],
            ..BatcherOptions::default()
        };
        assert_eq!(empty.validate(), Err(ConfigError::EmptyThresholds));

        let zero_threshold = BatcherOptions {
            queuing_thresholds: vec![1, 0],
            ..BatcherOptions::default()
        };
        assert_eq!(zero_threshold.validate(), Err(ConfigError::ZeroThreshold));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backing_task_buffers_no_results() {
        let pool = TaskPool::new(PoolOptions::default()).unwrap();
        let batcher: PersistentBatcher<u32, u32> = pool
            .add_persistent_batch_task(BatcherOptions::default(), echo_generator)
            .unwrap();

        for round in 0..3u32 {
            assert_eq!(batcher.get_result(round).await.unwrap(), round);
        }

        let backing = batcher.backing_task().clone();
        assert_eq!(backing.invocations(), 3);
        batcher.end();

        // The discarded unit results leave the final sequence empty even
        // though three invocations ran.
        assert_eq!(backing.promise().await.unwrap(), Vec::<()>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_follows_backing_task() {
        let pool = TaskPool::new(PoolOptions::default()).unwrap();
        let batcher: PersistentBatcher<u32, u32> = pool
            .add_persistent_batch_task(BatcherOptions::default(), echo_generator)
            .unwrap();

        assert_eq!(batcher.state(), TaskState::Paused);
        batcher.end();
        let backing = batcher.backing_task().clone();
        let _ = backing.promise().await;
        assert_eq!(batcher.state(), TaskState::Terminated);
    }
}
