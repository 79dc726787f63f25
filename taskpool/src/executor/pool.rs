//! The task pool - the public front of the executor.
//!
//! [`TaskPool`] validates construction parameters, registers tasks and
//! groups with the scheduler, and exposes pool-wide queries. It is a thin,
//! cloneable handle: the scheduler owns all execution state and runs as a
//! spawned background task for the lifetime of the pool.
//!
//! Task constructors come in a generic form plus sugar variants that
//! wrap a caller's function into a generic generator:
//!
//! - [`TaskPool::add_single_task`]: one invocation, resolves with its value
//! - [`TaskPool::add_linear_task`]: serialized invocations
//! - [`TaskPool::add_each_task`]: one invocation per input element
//! - [`TaskPool::add_batch_task`]: slices inputs into per-invocation chunks

use super::config::{
    BatchSize, BatchTaskOptions, EachTaskOptions, GenericTaskOptions, LinearTaskOptions,
    PoolOptions, SingleTaskOptions,
};
use super::error::{ConfigError, TaskError};
use super::group::{GroupHandle, GroupId, GroupShared};
use super::handle::{BatchTaskHandle, SingleTaskHandle, TaskHandle, TaskStatus};
use super::scheduler::{Command, Registry, Scheduler, TaskOp, TaskRegistration, TaskSpec};
use super::task::{
    GenericDriver, ResultHolder, TaskContext, TaskFuture, TaskId, TaskShared, TaskState,
};
use super::telemetry::{NullTelemetrySink, TelemetrySink};
use super::GroupOptions;
use crate::batcher::{BatchOutput, BatcherOptions, PersistentBatcher};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Global counter distinguishing pools, for cross-pool group validation.
static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The pool's global group always has the first id.
const GLOBAL_GROUP: GroupId = GroupId(0);

// =============================================================================
// Task Pool
// =============================================================================

/// A concurrency pool executing generator tasks under shared constraints.
///
/// Cloneable; all clones drive the same scheduler. The scheduler keeps
/// running until [`TaskPool::shutdown`] is called or every clone of the
/// pool and its handles is dropped.
#[derive(Clone)]
pub struct TaskPool {
    commands: mpsc::UnboundedSender<Command>,
    registry: Registry,
    pool_id: u64,
    next_group_id: Arc<AtomicU64>,
    global_shared: Arc<GroupShared>,
    shutdown: CancellationToken,
}

impl TaskPool {
    /// Creates a pool and spawns its scheduler.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(options: PoolOptions) -> Result<Self, ConfigError> {
        Self::with_telemetry(options, Arc::new(NullTelemetrySink))
    }

    /// Creates a pool with a telemetry sink receiving execution events.
    pub fn with_telemetry(
        options: PoolOptions,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self, ConfigError> {
        options.limits.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let global_shared = GroupShared::new(options.limits.concurrency_limit);
        let shutdown = CancellationToken::new();

        let scheduler = Scheduler::new(
            commands_rx,
            GLOBAL_GROUP,
            options.limits,
            Arc::clone(&global_shared),
            Arc::clone(&registry),
            telemetry,
            shutdown.clone(),
        );
        tokio::spawn(scheduler.run());

        Ok(Self {
            commands: commands_tx,
            registry,
            pool_id: POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            next_group_id: Arc::new(AtomicU64::new(1)),
            global_shared,
            shutdown,
        })
    }

    /// Stops the scheduler. Queued and in-flight work is abandoned and
    /// all pending waiters fail.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // -------------------------------------------------------------------------
    // Groups
    // -------------------------------------------------------------------------

    /// Creates a constraint group belonging to this pool.
    pub fn add_group(&self, options: GroupOptions) -> Result<GroupHandle, ConfigError> {
        options.validate()?;
        let id = self.allocate_group_id();
        let shared = GroupShared::new(options.concurrency_limit);
        let _ = self.commands.send(Command::AddGroup {
            id,
            options,
            shared: Arc::clone(&shared),
        });
        Ok(GroupHandle {
            id,
            pool_id: self.pool_id,
            shared,
            commands: self.commands.clone(),
        })
    }

    /// Number of live tasks in the pool.
    pub fn active_task_count(&self) -> usize {
        self.global_shared.active_tasks.load(Ordering::Acquire)
    }

    /// Number of invocations currently in flight across the pool.
    pub fn active_promise_count(&self) -> usize {
        self.global_shared.active_promises.load(Ordering::Acquire)
    }

    /// Replaces the pool-wide concurrency limit. `None` removes it.
    pub fn set_concurrency_limit(&self, limit: Option<usize>) -> Result<(), ConfigError> {
        if limit == Some(0) {
            return Err(ConfigError::ZeroLimit {
                what: "concurrency limit",
            });
        }
        let _ = self.commands.send(Command::Group {
            id: GLOBAL_GROUP,
            op: super::scheduler::GroupOp::SetConcurrencyLimit(limit),
        });
        Ok(())
    }

    /// Completes when no tasks remain in the pool, or fails with the
    /// first unhandled task error.
    pub async fn wait_for_idle(&self) -> Result<(), TaskError> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::WaitForIdle(tx)).is_err() {
            return Err(TaskError::pool_closed());
        }
        rx.await.unwrap_or_else(|_| Err(TaskError::pool_closed()))
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Point-in-time snapshot of a live task, or `None` once it has
    /// terminated (or never existed).
    pub fn task_status(&self, id: &TaskId) -> Option<TaskStatus> {
        let registry = self.registry.lock().unwrap();
        let registration = registry.get(id)?;
        let invocations = registration.shared.invocations.load(Ordering::Acquire);
        let raw_limit = registration
            .shared
            .invocation_limit
            .load(Ordering::Acquire);
        let free_slots = registration
            .group_shareds
            .iter()
            .map(|group| group.free_slots())
            .min()
            .unwrap_or(usize::MAX)
            .min(registration.shared.remaining_invocations());
        let state = *registration.state_rx.borrow();
        Some(TaskStatus {
            id: id.clone(),
            state,
            invocations,
            invocation_limit: (raw_limit != usize::MAX).then_some(raw_limit),
            active_promise_count: registration.group_shareds[1]
                .active_promises
                .load(Ordering::Acquire),
            free_slots,
        })
    }

    /// Ends the task with the given id, preventing further invocations.
    /// Returns whether the task was found.
    pub fn stop_task(&self, id: &TaskId) -> bool {
        if !self.registry.lock().unwrap().contains_key(id) {
            return false;
        }
        let _ = self.commands.send(Command::Task {
            id: id.clone(),
            op: TaskOp::End,
        });
        true
    }

    // -------------------------------------------------------------------------
    // Task Construction
    // -------------------------------------------------------------------------

    /// Adds a task driven by a generic generator.
    ///
    /// The generator is called with a control context and the invocation
    /// index, and returns the invocation's future, or `None` when the task
    /// has no further work.
    pub fn add_generic_task<R, G>(
        &self,
        options: GenericTaskOptions,
        generator: G,
    ) -> Result<TaskHandle<R>, ConfigError>
    where
        R: Clone + Send + 'static,
        G: FnMut(&TaskContext, usize) -> Option<TaskFuture<R>> + Send + 'static,
    {
        self.add_task_inner(options, generator, false)
    }

    /// Adds a task that runs exactly once and resolves with its value.
    pub fn add_single_task<R, G>(
        &self,
        options: SingleTaskOptions,
        generator: G,
    ) -> Result<SingleTaskHandle<R>, ConfigError>
    where
        R: Clone + Send + 'static,
        G: FnOnce() -> TaskFuture<R> + Send + 'static,
    {
        let mut generator = Some(generator);
        let inner = self.add_task_inner(
            GenericTaskOptions {
                id: options.id,
                invocation_limit: Some(1),
                ..GenericTaskOptions::default()
            },
            move |_ctx: &TaskContext, _index: usize| generator.take().map(|g| g()),
            false,
        )?;
        Ok(SingleTaskHandle { inner })
    }

    /// Adds a task whose invocations run one at a time, in order.
    pub fn add_linear_task<R, G>(
        &self,
        options: LinearTaskOptions,
        mut generator: G,
    ) -> Result<TaskHandle<R>, ConfigError>
    where
        R: Clone + Send + 'static,
        G: FnMut(usize) -> Option<TaskFuture<R>> + Send + 'static,
    {
        self.add_task_inner(
            GenericTaskOptions {
                id: options.id,
                invocation_limit: options.invocation_limit,
                limits: super::LimitOptions {
                    concurrency_limit: Some(1),
                    ..super::LimitOptions::default()
                },
                ..GenericTaskOptions::default()
            },
            move |_ctx: &TaskContext, index: usize| generator(index),
            false,
        )
    }

    /// Adds a task invoking the generator once per input element, with
    /// results in element order.
    pub fn add_each_task<D, R, G>(
        &self,
        options: EachTaskOptions,
        data: Vec<D>,
        mut generator: G,
    ) -> Result<TaskHandle<R>, ConfigError>
    where
        D: Send + 'static,
        R: Clone + Send + 'static,
        G: FnMut(D, usize) -> TaskFuture<R> + Send + 'static,
    {
        let mut elements: Vec<Option<D>> = data.into_iter().map(Some).collect();
        self.add_task_inner(
            GenericTaskOptions {
                id: options.id,
                invocation_limit: options.invocation_limit,
                limits: super::LimitOptions {
                    concurrency_limit: options.concurrency_limit,
                    ..super::LimitOptions::default()
                },
                ..GenericTaskOptions::default()
            },
            move |_ctx: &TaskContext, index: usize| {
                if index >= elements.len() {
                    return None;
                }
                let element = elements[index].take().expect("element generated once");
                Some(generator(element, index))
            },
            false,
        )
    }

    /// Adds a task that consumes its input in slices, one per invocation.
    ///
    /// `batch_size` is either fixed or computed per invocation from the
    /// remaining element count and the task's free slots; a computed size
    /// of zero fails the task.
    pub fn add_batch_task<D, R, G>(
        &self,
        options: BatchTaskOptions,
        data: Vec<D>,
        batch_size: BatchSize,
        mut generator: G,
    ) -> Result<BatchTaskHandle<R>, ConfigError>
    where
        D: Send + 'static,
        R: Clone + Send + 'static,
        G: FnMut(Vec<D>, usize) -> TaskFuture<Vec<R>> + Send + 'static,
    {
        batch_size.validate()?;
        let mut elements: std::collections::VecDeque<D> = data.into();
        let inner = self.add_task_inner(
            GenericTaskOptions {
                id: options.id,
                invocation_limit: options.invocation_limit,
                limits: super::LimitOptions {
                    concurrency_limit: options.concurrency_limit,
                    ..super::LimitOptions::default()
                },
                ..GenericTaskOptions::default()
            },
            move |ctx: &TaskContext, index: usize| {
                if elements.is_empty() {
                    return None;
                }
                let size = match &batch_size {
                    BatchSize::Fixed(size) => *size,
                    BatchSize::Computed(compute) => {
                        let size = compute(elements.len(), ctx.free_slots());
                        if size == 0 {
                            return Some(
                                futures::future::ready(Err(TaskError::new(
                                    "computed batch size must be positive",
                                )))
                                .boxed(),
                            );
                        }
                        size
                    }
                };
                let take = size.min(elements.len());
                let chunk: Vec<D> = elements.drain(..take).collect();
                Some(generator(chunk, index))
            },
            false,
        )?;
        Ok(BatchTaskHandle { inner })
    }

    /// Adds a persistent batcher that coalesces individual inputs into
    /// batch invocations executed through this pool.
    pub fn add_persistent_batch_task<I, O, G>(
        &self,
        options: BatcherOptions,
        generator: G,
    ) -> Result<PersistentBatcher<I, O>, ConfigError>
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
        G: Fn(Vec<I>) -> BoxFuture<'static, Result<Vec<BatchOutput<O>>, TaskError>>
            + Send
            + Sync
            + 'static,
    {
        PersistentBatcher::new(self, options, generator)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Registers a task with the scheduler. `discard_results` tasks never
    /// buffer invocation results.
    pub(crate) fn add_task_inner<R, G>(
        &self,
        options: GenericTaskOptions,
        generator: G,
        discard_results: bool,
    ) -> Result<TaskHandle<R>, ConfigError>
    where
        R: Clone + Send + 'static,
        G: FnMut(&TaskContext, usize) -> Option<TaskFuture<R>> + Send + 'static,
    {
        options.validate()?;
        for group in &options.groups {
            if group.pool_id != self.pool_id {
                return Err(ConfigError::ForeignGroup);
            }
        }

        let id = match &options.id {
            Some(id) => TaskId::new(id.clone()),
            None => TaskId::auto(),
        };

        let shared = TaskShared::new(options.invocation_limit);
        let private_shared = GroupShared::new(options.limits.concurrency_limit);
        let mut group_shareds = vec![Arc::clone(&self.global_shared), Arc::clone(&private_shared)];
        group_shareds.extend(options.groups.iter().map(|group| Arc::clone(&group.shared)));

        let initial_state = if options.paused {
            TaskState::Paused
        } else {
            TaskState::Active
        };
        let (state_tx, state_rx) = watch::channel(initial_state);

        {
            let mut registry = self.registry.lock().unwrap();
            if registry.contains_key(&id) {
                return Err(ConfigError::DuplicateTaskId(id.as_str().to_string()));
            }
            registry.insert(
                id.clone(),
                TaskRegistration {
                    state_rx: state_rx.clone(),
                    shared: Arc::clone(&shared),
                    group_shareds: group_shareds.clone(),
                },
            );
        }

        let holder: ResultHolder<R> = Arc::new(Mutex::new(None));
        let driver = GenericDriver::new(generator, Arc::clone(&holder), discard_results);
        let context = TaskContext::new(id.clone(), Arc::clone(&shared), group_shareds.clone());

        let spec = TaskSpec {
            id: id.clone(),
            driver: Box::new(driver),
            context,
            shared: Arc::clone(&shared),
            state_tx,
            paused: options.paused,
            invocation_limit: options.invocation_limit.unwrap_or(usize::MAX),
            private_group: (
                self.allocate_group_id(),
                options.limits.clone(),
                private_shared,
            ),
            user_groups: options.groups.iter().map(|group| group.id).collect(),
        };

        if self.commands.send(Command::AddTask(Box::new(spec))).is_err() {
            self.registry.lock().unwrap().remove(&id);
            return Err(ConfigError::PoolClosed);
        }

        Ok(TaskHandle {
            id,
            commands: self.commands.clone(),
            state_rx,
            shared,
            group_shareds,
            holder,
        })
    }

    fn allocate_group_id(&self) -> GroupId {
        GroupId(self.next_group_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("pool_id", &self.pool_id)
            .field("active_tasks", &self.active_task_count())
            .field("active_promises", &self.active_promise_count())
            .finish()
    }
}
