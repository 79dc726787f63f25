//! Task state, identity, and the type-erased generator driver.
//!
//! A task is a generator invoked repeatedly by the scheduler. The generator
//! produces a future per invocation (or nothing, meaning the task is out of
//! work), and results are collected positionally by invocation index.
//!
//! The scheduler is untyped: it owns each task behind the [`Driver`] trait
//! object and moves results and waiters across the boundary as `Box<dyn
//! Any>`. The typed half ([`GenericDriver`]) holds the caller's generator
//! and result buffer, and downcasts at the edges.

use super::error::TaskError;
use super::group::GroupShared;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Global counter for generating unique task IDs.
static TASK_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// The future a generator returns for one invocation.
pub type TaskFuture<R> = BoxFuture<'static, Result<R, TaskError>>;

/// A type-erased invocation result crossing the scheduler boundary.
pub(crate) type ErasedValue = Box<dyn Any + Send>;

/// A type-erased invocation future.
pub(crate) type ErasedFuture = BoxFuture<'static, Result<ErasedValue, TaskError>>;

/// The typed waiter registered by `TaskHandle::promise`.
pub(crate) type ResultWaiter<R> = oneshot::Sender<Result<Vec<R>, TaskError>>;

/// Final task outcome shared between the driver and late `promise` calls.
pub(crate) type ResultHolder<R> = Arc<Mutex<Option<Result<Vec<R>, TaskError>>>>;

// =============================================================================
// Task Identity
// =============================================================================

/// Unique identifier for a task within its pool.
///
/// IDs can be generated automatically or constructed from meaningful data
/// so callers can look tasks up later via `TaskPool::task_status`.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task ID with the given string value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a unique auto-generated task ID of the form `task-{n}`.
    pub fn auto() -> Self {
        let counter = TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("task-{counter}"))
    }

    /// Returns the string value of this task ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Task State
// =============================================================================

/// Task lifecycle state.
///
/// The ordering is meaningful and used in comparisons: a state never moves
/// backwards except for the reversible `Active` ↔ `Paused` pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    /// Eligible for new invocations.
    #[default]
    Active,

    /// Suspended: no new invocations start, in-flight ones continue.
    Paused,

    /// Out of work (generator finished, limit reached, ended, or failed)
    /// but with invocations still in flight.
    Exhausted,

    /// Fully finished and detached from the pool.
    Terminated,
}

impl TaskState {
    /// Returns true once the task can no longer start new invocations.
    pub fn is_done(&self) -> bool {
        *self >= Self::Exhausted
    }

    /// Returns true when the task has fully finished.
    pub fn is_terminated(&self) -> bool {
        *self == Self::Terminated
    }

    /// Returns true while the task is eligible for scheduling.
    pub fn is_active(&self) -> bool {
        *self == Self::Active
    }

    /// Returns true while the task is suspended.
    pub fn is_paused(&self) -> bool {
        *self == Self::Paused
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Paused => write!(f, "Paused"),
            Self::Exhausted => write!(f, "Exhausted"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

// =============================================================================
// Shared Counters
// =============================================================================

/// Live task counters shared between the scheduler (sole writer) and
/// handles.
#[derive(Debug)]
pub(crate) struct TaskShared {
    pub(crate) invocations: AtomicUsize,
    /// `usize::MAX` means unbounded.
    pub(crate) invocation_limit: AtomicUsize,
    /// Set once any waiter has claimed the task's recorded rejection.
    /// Independently shareable so groups holding the rejection can mark
    /// the claim too.
    pub(crate) rejection_handled: Arc<AtomicBool>,
}

impl TaskShared {
    pub(crate) fn new(invocation_limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            invocations: AtomicUsize::new(0),
            invocation_limit: AtomicUsize::new(invocation_limit.unwrap_or(usize::MAX)),
            rejection_handled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) fn remaining_invocations(&self) -> usize {
        self.invocation_limit
            .load(Ordering::Acquire)
            .saturating_sub(self.invocations.load(Ordering::Acquire))
    }
}

// =============================================================================
// Task Context
// =============================================================================

/// The control surface handed to a generator for each invocation.
///
/// `pause`, `resume`, and `end` take effect within the current scheduling
/// step, immediately after the generator returns. In particular a generator
/// may call [`TaskContext::pause`] and then return `None` to yield without
/// exhausting the task - the pause is observed before the empty return is
/// interpreted.
pub struct TaskContext {
    id: TaskId,
    shared: Arc<TaskShared>,
    group_shareds: Vec<Arc<GroupShared>>,
    invocation: Cell<usize>,
    pause_requested: Cell<bool>,
    resume_requested: Cell<bool>,
    end_requested: Cell<bool>,
}

impl TaskContext {
    pub(crate) fn new(
        id: TaskId,
        shared: Arc<TaskShared>,
        group_shareds: Vec<Arc<GroupShared>>,
    ) -> Self {
        Self {
            id,
            shared,
            group_shareds,
            invocation: Cell::new(0),
            pause_requested: Cell::new(false),
            resume_requested: Cell::new(false),
            end_requested: Cell::new(false),
        }
    }

    /// The task's id.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// The index of the invocation being generated.
    pub fn invocation(&self) -> usize {
        self.invocation.get()
    }

    /// Total invocations started so far.
    pub fn invocations(&self) -> usize {
        self.shared.invocations.load(Ordering::Acquire)
    }

    /// Invocations the task could start right now: the minimum spare
    /// capacity across its groups, capped by remaining invocations.
    pub fn free_slots(&self) -> usize {
        self.group_shareds
            .iter()
            .map(|g| g.free_slots())
            .min()
            .unwrap_or(usize::MAX)
            .min(self.shared.remaining_invocations())
    }

    /// Requests that the task pause after this invocation is issued.
    pub fn pause(&self) {
        self.pause_requested.set(true);
    }

    /// Requests that a paused task resume.
    pub fn resume(&self) {
        self.resume_requested.set(true);
    }

    /// Requests that the task end: no further invocations start.
    pub fn end(&self) {
        self.end_requested.set(true);
    }

    pub(crate) fn prepare(&self, invocation: usize) {
        self.invocation.set(invocation);
        self.pause_requested.set(false);
        self.resume_requested.set(false);
        self.end_requested.set(false);
    }

    pub(crate) fn take_flags(&self) -> ContextFlags {
        ContextFlags {
            pause: self.pause_requested.replace(false),
            resume: self.resume_requested.replace(false),
            end: self.end_requested.replace(false),
        }
    }
}

/// Control actions a generator requested through its [`TaskContext`].
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ContextFlags {
    pub(crate) pause: bool,
    pub(crate) resume: bool,
    pub(crate) end: bool,
}

// =============================================================================
// Driver
// =============================================================================

/// What the generator produced for one invocation.
pub(crate) enum InvokeStep {
    /// The generator returned `None`: the task has no further work.
    Exhausted,

    /// The generator panicked; the payload becomes a task failure.
    Failed(TaskError),

    /// An invocation future to run.
    Spawn(ErasedFuture),
}

/// The scheduler's type-erased view of a task.
///
/// One implementation exists per result type, holding the typed generator,
/// result buffer, and waiters; the scheduler never sees `R`.
pub(crate) trait Driver: Send {
    /// Calls the generator for invocation `index`.
    fn invoke(&mut self, ctx: &TaskContext, index: usize) -> InvokeStep;

    /// Stores a successful invocation result at its index.
    fn store(&mut self, index: usize, value: ErasedValue);

    /// Registers a `promise` waiter (a downcast oneshot sender), resolving
    /// it immediately when the task already settled.
    fn add_waiter(&mut self, waiter: ErasedValue);

    /// Whether any unresolved waiters are registered.
    fn has_waiters(&self) -> bool;

    /// Records the task's rejection and fails current waiters with it.
    /// Returns true when at least one waiter claimed the error.
    fn fail(&mut self, error: &TaskError) -> bool;

    /// Settles the task at termination: publishes the final outcome and
    /// resolves any remaining waiters.
    fn settle(&mut self);
}

/// The typed driver behind every task.
pub(crate) struct GenericDriver<R> {
    generator: Box<dyn FnMut(&TaskContext, usize) -> Option<TaskFuture<R>> + Send>,
    results: Vec<Option<R>>,
    waiters: Vec<ResultWaiter<R>>,
    holder: ResultHolder<R>,
    /// Skip result storage entirely. Used for tasks whose results are
    /// delivered out of band, so the buffer never grows.
    discard_results: bool,
}

impl<R: Clone + Send + 'static> GenericDriver<R> {
    pub(crate) fn new(
        generator: impl FnMut(&TaskContext, usize) -> Option<TaskFuture<R>> + Send + 'static,
        holder: ResultHolder<R>,
        discard_results: bool,
    ) -> Self {
        Self {
            generator: Box::new(generator),
            results: Vec::new(),
            waiters: Vec::new(),
            holder,
            discard_results,
        }
    }

    fn final_results(&mut self) -> Vec<R> {
        self.results
            .drain(..)
            .map(|slot| slot.expect("completed invocation left no result"))
            .collect()
    }
}

impl<R: Clone + Send + 'static> Driver for GenericDriver<R> {
    fn invoke(&mut self, ctx: &TaskContext, index: usize) -> InvokeStep {
        let generated =
            std::panic::catch_unwind(AssertUnwindSafe(|| (self.generator)(ctx, index)));
        match generated {
            Ok(Some(future)) => InvokeStep::Spawn(
                future
                    .map(|outcome| outcome.map(|value| Box::new(value) as ErasedValue))
                    .boxed(),
            ),
            Ok(None) => InvokeStep::Exhausted,
            Err(payload) => InvokeStep::Failed(TaskError::from_panic(payload)),
        }
    }

    fn store(&mut self, index: usize, value: ErasedValue) {
        if self.discard_results {
            return;
        }
        let value = *value
            .downcast::<R>()
            .expect("invocation result type mismatch");
        if self.results.len() <= index {
            self.results.resize_with(index + 1, || None);
        }
        self.results[index] = Some(value);
    }

    fn add_waiter(&mut self, waiter: ErasedValue) {
        let waiter = *waiter
            .downcast::<ResultWaiter<R>>()
            .expect("waiter type mismatch");
        let settled = self.holder.lock().unwrap().clone();
        match settled {
            Some(outcome) => {
                let _ = waiter.send(outcome);
            }
            None => self.waiters.push(waiter),
        }
    }

    fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    fn fail(&mut self, error: &TaskError) -> bool {
        {
            let mut holder = self.holder.lock().unwrap();
            if holder.is_none() {
                *holder = Some(Err(error.clone()));
            }
        }
        let claimed = !self.waiters.is_empty();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        claimed
    }

    fn settle(&mut self) {
        let outcome = {
            let results = self.final_results();
            let mut holder = self.holder.lock().unwrap();
            if holder.is_none() {
                *holder = Some(Ok(results));
            }
            holder.clone().expect("holder populated above")
        };
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }
}
