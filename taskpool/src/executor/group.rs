//! Constraint groups: concurrency limits and sliding-window frequency limits.
//!
//! A group bundles a concurrency limit (how many invocations may be in
//! flight at once) with an optional frequency limit (how many invocations
//! may *start* within a sliding time window). Groups are shared: every task
//! belongs to the pool's global group, to a private group carrying its own
//! limits, and to any number of user-created groups.
//!
//! Group state lives on the scheduler; the public [`GroupHandle`] reads
//! live counters from shared atomics and sends limit mutations and idle
//! waiters through the command channel, the same split the executor uses
//! for task handles.

use super::error::{ConfigError, TaskError};
use super::scheduler::{Command, GroupOp};
use super::GroupOptions;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Sentinel for an unbounded limit in the shared atomic counters.
pub(crate) const UNBOUNDED: usize = usize::MAX;

/// Identifier for a group within its pool.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub(crate) struct GroupId(pub(crate) u64);

/// Resolver for a `wait_for_idle` call.
pub(crate) type IdleWaiter = oneshot::Sender<Result<(), TaskError>>;

// =============================================================================
// Readiness
// =============================================================================

/// Whether a group can admit a new invocation right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// An invocation may start immediately.
    Ready,

    /// Blocked by the frequency window; an invocation may start at the
    /// given instant.
    BusyUntil(Instant),

    /// Blocked by the concurrency limit, with no time-based resolution.
    Busy,
}

impl Readiness {
    /// Combines two readiness values, keeping the more restrictive one.
    pub(crate) fn max(self, other: Readiness) -> Readiness {
        match (self, other) {
            (Readiness::Busy, _) | (_, Readiness::Busy) => Readiness::Busy,
            (Readiness::BusyUntil(a), Readiness::BusyUntil(b)) => {
                Readiness::BusyUntil(a.max(b))
            }
            (Readiness::BusyUntil(t), _) | (_, Readiness::BusyUntil(t)) => {
                Readiness::BusyUntil(t)
            }
            _ => Readiness::Ready,
        }
    }
}

// =============================================================================
// Shared Counters
// =============================================================================

/// Live counters shared between the scheduler (sole writer) and handles.
#[derive(Debug)]
pub(crate) struct GroupShared {
    pub(crate) active_tasks: AtomicUsize,
    pub(crate) active_promises: AtomicUsize,
    pub(crate) concurrency_limit: AtomicUsize,
}

impl GroupShared {
    pub(crate) fn new(concurrency_limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            active_tasks: AtomicUsize::new(0),
            active_promises: AtomicUsize::new(0),
            concurrency_limit: AtomicUsize::new(concurrency_limit.unwrap_or(UNBOUNDED)),
        })
    }

    /// Remaining invocation capacity as seen from outside the scheduler.
    pub(crate) fn free_slots(&self) -> usize {
        self.concurrency_limit
            .load(Ordering::Acquire)
            .saturating_sub(self.active_promises.load(Ordering::Acquire))
    }
}

// =============================================================================
// Group State (scheduler-owned)
// =============================================================================

/// A recorded failure propagated from a task to one of its groups.
pub(crate) struct GroupRejection {
    pub(crate) error: TaskError,
    /// Shared with the failing task; set once any waiter claims the error.
    pub(crate) handled: Arc<AtomicBool>,
}

/// Mutable group state. Owned and mutated exclusively by the scheduler.
pub(crate) struct GroupState {
    concurrency_limit: usize,
    frequency_limit: Option<usize>,
    frequency_window: Duration,
    active_tasks: usize,
    active_promises: usize,
    /// Start timestamps inside the current frequency window, oldest first.
    /// Empty whenever frequency limiting is disabled.
    frequency_starts: VecDeque<Instant>,
    idle_waiters: Vec<IdleWaiter>,
    rejection: Option<GroupRejection>,
    shared: Arc<GroupShared>,
}

impl GroupState {
    pub(crate) fn new(options: &GroupOptions, shared: Arc<GroupShared>) -> Self {
        Self {
            concurrency_limit: options.concurrency_limit.unwrap_or(UNBOUNDED),
            frequency_limit: options.frequency_limit,
            frequency_window: options.frequency_window.unwrap_or(Duration::ZERO),
            active_tasks: 0,
            active_promises: 0,
            frequency_starts: VecDeque::new(),
            idle_waiters: Vec::new(),
            rejection: None,
            shared,
        }
    }

    pub(crate) fn set_concurrency_limit(&mut self, limit: Option<usize>) {
        self.concurrency_limit = limit.unwrap_or(UNBOUNDED);
        self.shared
            .concurrency_limit
            .store(self.concurrency_limit, Ordering::Release);
    }

    pub(crate) fn set_frequency(&mut self, frequency: Option<(usize, Duration)>) {
        match frequency {
            Some((limit, window)) => {
                self.frequency_limit = Some(limit);
                self.frequency_window = window;
            }
            None => {
                self.frequency_limit = None;
                self.frequency_window = Duration::ZERO;
                // Disabled groups must not retain window timestamps.
                self.frequency_starts = VecDeque::new();
            }
        }
    }

    /// Whether the group can admit a new invocation at `now`.
    ///
    /// Purges expired frequency starts as a side effect, so the window
    /// buffer stays bounded by the frequency limit.
    pub(crate) fn readiness(&mut self, now: Instant) -> Readiness {
        if self.active_promises >= self.concurrency_limit {
            return Readiness::Busy;
        }
        if let Some(limit) = self.frequency_limit {
            self.purge_frequency_starts(now);
            if self.frequency_starts.len() >= limit {
                let oldest = self.frequency_starts[0];
                return Readiness::BusyUntil(oldest + self.frequency_window);
            }
        }
        Readiness::Ready
    }

    fn purge_frequency_starts(&mut self, now: Instant) {
        if let Some(cutoff) = now.checked_sub(self.frequency_window) {
            while self
                .frequency_starts
                .front()
                .is_some_and(|start| *start <= cutoff)
            {
                self.frequency_starts.pop_front();
            }
        }
    }

    /// Records an invocation start for the frequency window.
    pub(crate) fn record_start(&mut self, now: Instant) {
        if self.frequency_limit.is_some() {
            self.frequency_starts.push_back(now);
        }
    }

    pub(crate) fn increment_promises(&mut self) {
        self.active_promises += 1;
        self.shared
            .active_promises
            .store(self.active_promises, Ordering::Release);
    }

    pub(crate) fn decrement_promises(&mut self) {
        self.active_promises -= 1;
        self.shared
            .active_promises
            .store(self.active_promises, Ordering::Release);
    }

    pub(crate) fn increment_tasks(&mut self) {
        self.active_tasks += 1;
        self.shared
            .active_tasks
            .store(self.active_tasks, Ordering::Release);
    }

    /// Detaches a task. When the group goes idle, pending idle waiters
    /// resolve with success and any recorded rejection is cleared.
    pub(crate) fn decrement_tasks(&mut self) {
        self.active_tasks -= 1;
        self.shared
            .active_tasks
            .store(self.active_tasks, Ordering::Release);
        if self.active_tasks == 0 {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
            self.rejection = None;
        }
    }

    /// Registers an idle waiter, resolving it immediately when the group
    /// is already idle or a rejection is pending.
    pub(crate) fn add_idle_waiter(&mut self, waiter: IdleWaiter) {
        if let Some(rejection) = &self.rejection {
            rejection.handled.store(true, Ordering::Release);
            let _ = waiter.send(Err(rejection.error.clone()));
        } else if self.active_tasks == 0 {
            let _ = waiter.send(Ok(()));
        } else {
            self.idle_waiters.push(waiter);
        }
    }

    /// Records a task failure against the group and rejects current idle
    /// waiters with it, claiming the error on the failing task's behalf.
    pub(crate) fn reject(&mut self, error: &TaskError, handled: &Arc<AtomicBool>) {
        if self.rejection.is_none() {
            self.rejection = Some(GroupRejection {
                error: error.clone(),
                handled: Arc::clone(handled),
            });
        }
        if !self.idle_waiters.is_empty() {
            handled.store(true, Ordering::Release);
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Fails every pending idle waiter during pool shutdown.
    pub(crate) fn drain_waiters(&mut self) {
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(Err(TaskError::pool_closed()));
        }
    }

    #[cfg(test)]
    pub(crate) fn frequency_start_count(&self) -> usize {
        self.frequency_starts.len()
    }
}

// =============================================================================
// Group Handle
// =============================================================================

/// Handle to a constraint group.
///
/// Cloneable; all clones refer to the same group. Limit mutations are
/// fire-and-forget commands processed by the scheduler, which re-evaluates
/// readiness afterwards.
#[derive(Clone)]
pub struct GroupHandle {
    pub(crate) id: GroupId,
    pub(crate) pool_id: u64,
    pub(crate) shared: Arc<GroupShared>,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
}

impl GroupHandle {
    /// Number of tasks currently attached to this group.
    pub fn active_task_count(&self) -> usize {
        self.shared.active_tasks.load(Ordering::Acquire)
    }

    /// Number of invocations currently in flight in this group.
    pub fn active_promise_count(&self) -> usize {
        self.shared.active_promises.load(Ordering::Acquire)
    }

    /// Replaces the group's concurrency limit. `None` removes the limit.
    pub fn set_concurrency_limit(&self, limit: Option<usize>) -> Result<(), ConfigError> {
        if limit == Some(0) {
            return Err(ConfigError::ZeroLimit {
                what: "concurrency limit",
            });
        }
        let _ = self.commands.send(Command::Group {
            id: self.id,
            op: GroupOp::SetConcurrencyLimit(limit),
        });
        Ok(())
    }

    /// Replaces the group's frequency limit and window together.
    /// `None` disables frequency limiting.
    pub fn set_frequency(
        &self,
        limit: Option<usize>,
        window: Option<Duration>,
    ) -> Result<(), ConfigError> {
        super::config::validate_frequency(limit, window)?;
        let frequency = limit.zip(window);
        let _ = self.commands.send(Command::Group {
            id: self.id,
            op: GroupOp::SetFrequency(frequency),
        });
        Ok(())
    }

    /// Completes when the group has no attached tasks, or fails with the
    /// first error recorded by a task in the group.
    pub async fn wait_for_idle(&self) -> Result<(), TaskError> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Group {
                id: self.id,
                op: GroupOp::WaitForIdle(tx),
            })
            .is_err()
        {
            return Err(TaskError::pool_closed());
        }
        rx.await.unwrap_or_else(|_| Err(TaskError::pool_closed()))
    }
}

impl std::fmt::Debug for GroupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupHandle")
            .field("id", &self.id)
            .field("active_tasks", &self.active_task_count())
            .field("active_promises", &self.active_promise_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(options: GroupOptions) -> GroupState {
        let shared = GroupShared::new(options.concurrency_limit);
        GroupState::new(&options, shared)
    }

    #[test]
    fn test_unbounded_group_is_always_ready() {
        let mut state = group(GroupOptions::default());
        let now = Instant::now();
        for _ in 0..100 {
            state.increment_promises();
        }
        assert_eq!(state.readiness(now), Readiness::Ready);
    }

    #[test]
    fn test_concurrency_saturation_is_busy_without_timer() {
        let mut state = group(GroupOptions {
            concurrency_limit: Some(2),
            ..GroupOptions::default()
        });
        let now = Instant::now();
        assert_eq!(state.readiness(now), Readiness::Ready);
        state.increment_promises();
        state.increment_promises();
        assert_eq!(state.readiness(now), Readiness::Busy);
        state.decrement_promises();
        assert_eq!(state.readiness(now), Readiness::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frequency_window_reports_wake_time() {
        let window = Duration::from_millis(100);
        let mut state = group(GroupOptions {
            frequency_limit: Some(2),
            frequency_window: Some(window),
            ..GroupOptions::default()
        });

        let start = Instant::now();
        state.record_start(start);
        state.record_start(start);
        assert_eq!(state.readiness(start), Readiness::BusyUntil(start + window));

        // Once the window slides past the oldest start, capacity returns.
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(state.readiness(Instant::now()), Readiness::Ready);
        assert_eq!(state.frequency_start_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_frequency_records_no_starts() {
        let mut state = group(GroupOptions::default());
        state.record_start(Instant::now());
        state.record_start(Instant::now());
        assert_eq!(state.frequency_start_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_frequency_clears_starts() {
        let mut state = group(GroupOptions {
            frequency_limit: Some(4),
            frequency_window: Some(Duration::from_secs(10)),
            ..GroupOptions::default()
        });
        state.record_start(Instant::now());
        state.record_start(Instant::now());
        assert_eq!(state.frequency_start_count(), 2);

        state.set_frequency(None);
        assert_eq!(state.frequency_start_count(), 0);
        assert_eq!(state.readiness(Instant::now()), Readiness::Ready);
    }

    #[test]
    fn test_idle_waiter_resolves_when_last_task_detaches() {
        let mut state = group(GroupOptions::default());
        state.increment_tasks();

        let (tx, mut rx) = oneshot::channel();
        state.add_idle_waiter(tx);
        assert!(rx.try_recv().is_err());

        state.decrement_tasks();
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn test_idle_waiter_resolves_immediately_when_idle() {
        let mut state = group(GroupOptions::default());
        let (tx, mut rx) = oneshot::channel();
        state.add_idle_waiter(tx);
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn test_rejection_fails_waiters_and_marks_handled() {
        let mut state = group(GroupOptions::default());
        state.increment_tasks();

        let (tx, mut rx) = oneshot::channel();
        state.add_idle_waiter(tx);

        let handled = Arc::new(AtomicBool::new(false));
        state.reject(&TaskError::new("boom"), &handled);

        let outcome = rx.try_recv().expect("waiter resolved");
        assert_eq!(outcome.unwrap_err().message(), "boom");
        assert!(handled.load(Ordering::Acquire));
    }

    #[test]
    fn test_rejection_cleared_when_group_goes_idle() {
        let mut state = group(GroupOptions::default());
        state.increment_tasks();

        let handled = Arc::new(AtomicBool::new(false));
        state.reject(&TaskError::new("boom"), &handled);

        // A waiter registered while the rejection is pending fails at once.
        let (tx, mut rx) = oneshot::channel();
        state.add_idle_waiter(tx);
        assert!(matches!(rx.try_recv(), Ok(Err(_))));

        // Idle clears the rejection; the next waiter succeeds.
        state.decrement_tasks();
        let (tx, mut rx) = oneshot::channel();
        state.add_idle_waiter(tx);
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn test_first_rejection_wins() {
        let mut state = group(GroupOptions::default());
        state.increment_tasks();
        state.increment_tasks();

        let handled_a = Arc::new(AtomicBool::new(false));
        let handled_b = Arc::new(AtomicBool::new(false));
        state.reject(&TaskError::new("first"), &handled_a);
        state.reject(&TaskError::new("second"), &handled_b);

        let (tx, mut rx) = oneshot::channel();
        state.add_idle_waiter(tx);
        let outcome = rx.try_recv().expect("waiter resolved");
        assert_eq!(outcome.unwrap_err().message(), "first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_max_prefers_most_restrictive() {
        let now = Instant::now();
        let later = now + Duration::from_millis(50);
        assert_eq!(Readiness::Ready.max(Readiness::Busy), Readiness::Busy);
        assert_eq!(
            Readiness::BusyUntil(now).max(Readiness::BusyUntil(later)),
            Readiness::BusyUntil(later)
        );
        assert_eq!(
            Readiness::Ready.max(Readiness::BusyUntil(later)),
            Readiness::BusyUntil(later)
        );
        assert_eq!(
            Readiness::BusyUntil(later).max(Readiness::Busy),
            Readiness::Busy
        );
    }
}
