//! The scheduler - the pool's single-owner event loop.
//!
//! All mutable pool state (tasks, groups, counters, waiters) lives here and
//! is touched only by this loop. Public handles communicate through the
//! command channel; invocation futures run as spawned tasks and report back
//! through the completion channel. The loop is driven by `tokio::select!`
//! over those two channels, a cancellation token, and a single timer armed
//! for the soonest frequency-window opening.
//!
//! # Dispatch
//!
//! Each trigger runs one or more passes over the tasks in registration
//! order. A task is invoked when every group it belongs to can admit an
//! invocation. Passes repeat while any invocation started, since starting
//! or finishing work shifts readiness. When a pass starts nothing and some
//! group is blocked purely by its frequency window, the timer is armed for
//! the earliest instant the window opens.
//!
//! # Recursion
//!
//! A generator that submits a new task does so through the command
//! channel, so the new task's generator cannot run until a later loop
//! iteration. Generators are never re-entered and submission depth stays
//! bounded.

use super::error::TaskError;
use super::group::{GroupId, GroupShared, GroupState, IdleWaiter, Readiness};
use super::task::{
    ContextFlags, Driver, ErasedValue, InvokeStep, TaskContext, TaskId, TaskShared, TaskState,
};
use super::telemetry::{TelemetryEvent, TelemetrySink};
use super::GroupOptions;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Commands and Completions
// =============================================================================

/// A request from the public API to the scheduler.
pub(crate) enum Command {
    AddGroup {
        id: GroupId,
        options: GroupOptions,
        shared: Arc<GroupShared>,
    },
    AddTask(Box<TaskSpec>),
    Task {
        id: TaskId,
        op: TaskOp,
    },
    Group {
        id: GroupId,
        op: GroupOp,
    },
    /// Pool-level `wait_for_idle`; routed to the global group.
    WaitForIdle(IdleWaiter),
}

/// Operations on a single task.
pub(crate) enum TaskOp {
    Pause,
    Resume,
    End,
    SetInvocationLimit(Option<usize>),
    SetConcurrencyLimit(Option<usize>),
    SetFrequency(Option<(usize, Duration)>),
    AddWaiter(ErasedValue),
}

/// Operations on a single group.
pub(crate) enum GroupOp {
    SetConcurrencyLimit(Option<usize>),
    SetFrequency(Option<(usize, Duration)>),
    WaitForIdle(IdleWaiter),
}

/// Outcome of one spawned invocation future.
pub(crate) struct Completion {
    pub(crate) id: TaskId,
    pub(crate) index: usize,
    pub(crate) outcome: Result<ErasedValue, TaskError>,
}

/// Everything the scheduler needs to register a new task.
pub(crate) struct TaskSpec {
    pub(crate) id: TaskId,
    pub(crate) driver: Box<dyn Driver>,
    pub(crate) context: TaskContext,
    pub(crate) shared: Arc<TaskShared>,
    pub(crate) state_tx: watch::Sender<TaskState>,
    pub(crate) paused: bool,
    /// `usize::MAX` means unbounded.
    pub(crate) invocation_limit: usize,
    pub(crate) private_group: (GroupId, GroupOptions, Arc<GroupShared>),
    pub(crate) user_groups: Vec<GroupId>,
}

/// Registry entry shared with the pool front for synchronous queries.
pub(crate) struct TaskRegistration {
    pub(crate) state_rx: watch::Receiver<TaskState>,
    pub(crate) shared: Arc<TaskShared>,
    pub(crate) group_shareds: Vec<Arc<GroupShared>>,
}

/// Task registry shared between the pool front and the scheduler.
pub(crate) type Registry = Arc<Mutex<HashMap<TaskId, TaskRegistration>>>;

// =============================================================================
// Task Entry
// =============================================================================

struct TaskEntry {
    id: TaskId,
    driver: Box<dyn Driver>,
    context: TaskContext,
    state: TaskState,
    state_tx: watch::Sender<TaskState>,
    shared: Arc<TaskShared>,
    invocations: usize,
    invocation_limit: usize,
    in_flight: usize,
    /// Slot 0 is the pool's global group, slot 1 the task's private group.
    groups: Vec<GroupId>,
    rejected: bool,
}

enum RunOutcome {
    Continue,
    Removed,
}

fn min_wake(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(match current {
        Some(existing) => existing.min(candidate),
        None => candidate,
    })
}

// =============================================================================
// Scheduler
// =============================================================================

pub(crate) struct Scheduler {
    commands: mpsc::UnboundedReceiver<Command>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    shutdown: CancellationToken,
    tasks: Vec<TaskEntry>,
    groups: HashMap<u64, GroupState>,
    global_group: GroupId,
    registry: Registry,
    telemetry: Arc<dyn TelemetrySink>,
    next_wake: Option<Instant>,
}

impl Scheduler {
    pub(crate) fn new(
        commands: mpsc::UnboundedReceiver<Command>,
        global_group: GroupId,
        global_options: GroupOptions,
        global_shared: Arc<GroupShared>,
        registry: Registry,
        telemetry: Arc<dyn TelemetrySink>,
        shutdown: CancellationToken,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let mut groups = HashMap::new();
        groups.insert(
            global_group.0,
            GroupState::new(&global_options, global_shared),
        );
        Self {
            commands,
            completions_rx,
            completions_tx,
            shutdown,
            tasks: Vec::new(),
            groups,
            global_group,
            registry,
            telemetry,
            next_wake: None,
        }
    }

    /// Runs the scheduler until shutdown or until every command sender is
    /// dropped.
    pub(crate) async fn run(mut self) {
        debug!("scheduler started");
        loop {
            let wake = self.next_wake;
            let window_timer = async move {
                match wake {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    self.drain_shutdown();
                    break;
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every pool and handle clone is gone.
                    None => {
                        self.drain_shutdown();
                        break;
                    }
                },

                Some(completion) = self.completions_rx.recv() => {
                    self.handle_completion(completion);
                }

                _ = window_timer => {
                    self.next_wake = None;
                }
            }

            // Absorb everything already queued before re-evaluating
            // readiness, so one dispatch covers a burst of events.
            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(command);
            }
            while let Ok(completion) = self.completions_rx.try_recv() {
                self.handle_completion(completion);
            }

            self.dispatch();
        }
        debug!("scheduler stopped");
    }

    // -------------------------------------------------------------------------
    // Event handling
    // -------------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddGroup {
                id,
                options,
                shared,
            } => {
                self.groups.insert(id.0, GroupState::new(&options, shared));
            }
            Command::AddTask(spec) => self.add_task(*spec),
            Command::Task { id, op } => self.handle_task_op(id, op),
            Command::Group { id, op } => self.handle_group_op(id, op),
            Command::WaitForIdle(waiter) => {
                let global = self.global_group;
                self.handle_group_op(global, GroupOp::WaitForIdle(waiter));
            }
        }
    }

    fn add_task(&mut self, spec: TaskSpec) {
        let (private_id, private_options, private_shared) = spec.private_group;
        self.groups.insert(
            private_id.0,
            GroupState::new(&private_options, private_shared),
        );

        let mut groups = Vec::with_capacity(2 + spec.user_groups.len());
        groups.push(self.global_group);
        groups.push(private_id);
        groups.extend(spec.user_groups);

        for group_id in &groups {
            self.group_mut(*group_id).increment_tasks();
        }

        let state = if spec.paused {
            TaskState::Paused
        } else {
            TaskState::Active
        };

        info!(task_id = %spec.id, paused = spec.paused, "task registered");
        self.telemetry.emit(TelemetryEvent::TaskSubmitted {
            id: spec.id.clone(),
        });

        self.tasks.push(TaskEntry {
            id: spec.id,
            driver: spec.driver,
            context: spec.context,
            state,
            state_tx: spec.state_tx,
            shared: spec.shared,
            invocations: 0,
            invocation_limit: spec.invocation_limit,
            in_flight: 0,
            groups,
            rejected: false,
        });
    }

    fn handle_task_op(&mut self, id: TaskId, op: TaskOp) {
        let Some(index) = self.tasks.iter().position(|task| task.id == id) else {
            // The task already terminated; waiters fall back to the stored
            // outcome when their sender is dropped here.
            return;
        };
        match op {
            TaskOp::Pause => {
                if self.tasks[index].state == TaskState::Active {
                    self.set_task_state(index, TaskState::Paused);
                }
            }
            TaskOp::Resume => {
                if self.tasks[index].state == TaskState::Paused {
                    self.set_task_state(index, TaskState::Active);
                }
            }
            TaskOp::End => {
                self.end_task(index);
            }
            TaskOp::SetInvocationLimit(limit) => {
                let limit = limit.unwrap_or(usize::MAX);
                let entry = &mut self.tasks[index];
                entry.invocation_limit = limit;
                entry
                    .shared
                    .invocation_limit
                    .store(limit, Ordering::Release);
                if entry.invocations >= limit {
                    self.end_task(index);
                }
            }
            TaskOp::SetConcurrencyLimit(limit) => {
                let private = self.tasks[index].groups[1];
                self.group_mut(private).set_concurrency_limit(limit);
            }
            TaskOp::SetFrequency(frequency) => {
                let private = self.tasks[index].groups[1];
                self.group_mut(private).set_frequency(frequency);
            }
            TaskOp::AddWaiter(waiter) => {
                let entry = &mut self.tasks[index];
                if entry.rejected {
                    entry.shared.rejection_handled.store(true, Ordering::Release);
                }
                entry.driver.add_waiter(waiter);
            }
        }
    }

    fn handle_group_op(&mut self, id: GroupId, op: GroupOp) {
        let Some(group) = self.groups.get_mut(&id.0) else {
            return;
        };
        match op {
            GroupOp::SetConcurrencyLimit(limit) => group.set_concurrency_limit(limit),
            GroupOp::SetFrequency(frequency) => group.set_frequency(frequency),
            GroupOp::WaitForIdle(waiter) => group.add_idle_waiter(waiter),
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Some(index) = self
            .tasks
            .iter()
            .position(|task| task.id == completion.id)
        else {
            return;
        };

        let group_ids = self.tasks[index].groups.clone();
        for group_id in &group_ids {
            self.group_mut(*group_id).decrement_promises();
        }
        self.tasks[index].in_flight -= 1;

        match completion.outcome {
            Ok(value) => {
                debug!(
                    task_id = %completion.id,
                    invocation = completion.index,
                    "invocation completed"
                );
                self.telemetry.emit(TelemetryEvent::InvocationCompleted {
                    id: completion.id.clone(),
                    index: completion.index,
                    success: true,
                });
                self.tasks[index].driver.store(completion.index, value);
            }
            Err(failure) => {
                error!(
                    task_id = %completion.id,
                    invocation = completion.index,
                    error = %failure,
                    "invocation failed"
                );
                self.telemetry.emit(TelemetryEvent::InvocationCompleted {
                    id: completion.id.clone(),
                    index: completion.index,
                    success: false,
                });
                self.fail_task(index, failure);
                if self.tasks[index].state < TaskState::Exhausted {
                    self.set_task_state(index, TaskState::Exhausted);
                }
            }
        }

        if self.tasks[index].state >= TaskState::Exhausted && self.tasks[index].in_flight == 0 {
            self.terminate_task(index);
        }
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    fn dispatch(&mut self) {
        self.next_wake = None;
        loop {
            let now = Instant::now();
            let mut invoked = false;
            let mut soonest: Option<Instant> = None;

            let mut index = 0;
            while index < self.tasks.len() {
                match self.group_mut(self.global_group).readiness(now) {
                    Readiness::Ready => {}
                    Readiness::BusyUntil(at) => {
                        soonest = min_wake(soonest, at);
                        break;
                    }
                    Readiness::Busy => break,
                }

                if self.tasks[index].state != TaskState::Active {
                    index += 1;
                    continue;
                }

                let mut readiness = Readiness::Ready;
                for group_id in self.tasks[index].groups.clone() {
                    readiness = readiness.max(self.group_mut(group_id).readiness(now));
                    if readiness == Readiness::Busy {
                        break;
                    }
                }

                match readiness {
                    Readiness::Busy => index += 1,
                    Readiness::BusyUntil(at) => {
                        soonest = min_wake(soonest, at);
                        index += 1;
                    }
                    Readiness::Ready => {
                        invoked = true;
                        if let RunOutcome::Continue = self.run_task(index, now) {
                            index += 1;
                        }
                        // On removal the next task shifts into this slot.
                    }
                }
            }

            if !invoked {
                self.next_wake = soonest;
                break;
            }
        }
    }

    /// Starts one invocation of the task at `index`, which must be Active
    /// and Ready across its groups.
    fn run_task(&mut self, index: usize, now: Instant) -> RunOutcome {
        if self.tasks[index].invocations >= self.tasks[index].invocation_limit {
            return self.end_task(index);
        }

        let invocation = self.tasks[index].invocations;
        let step = {
            let entry = &mut self.tasks[index];
            entry.context.prepare(invocation);
            entry.driver.invoke(&entry.context, invocation)
        };
        let flags = self.tasks[index].context.take_flags();
        self.apply_context_flags(index, flags);

        match step {
            InvokeStep::Exhausted => {
                // A generator that paused itself and returned nothing is
                // yielding, not finishing.
                if flags.end || self.tasks[index].state == TaskState::Active {
                    return self.end_task(index);
                }
                RunOutcome::Continue
            }
            InvokeStep::Failed(failure) => {
                error!(task_id = %self.tasks[index].id, error = %failure, "generator failed");
                self.fail_task(index, failure);
                self.end_task(index)
            }
            InvokeStep::Spawn(future) => {
                {
                    let entry = &mut self.tasks[index];
                    entry.invocations += 1;
                    entry
                        .shared
                        .invocations
                        .store(entry.invocations, Ordering::Release);
                    entry.in_flight += 1;
                }
                for group_id in self.tasks[index].groups.clone() {
                    let group = self.group_mut(group_id);
                    group.increment_promises();
                    group.record_start(now);
                }

                let id = self.tasks[index].id.clone();
                debug!(task_id = %id, invocation, "invocation started");
                self.telemetry.emit(TelemetryEvent::InvocationStarted {
                    id: id.clone(),
                    index: invocation,
                });

                let completions = self.completions_tx.clone();
                tokio::spawn(async move {
                    let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(result) => result,
                        Err(payload) => Err(TaskError::from_panic(payload)),
                    };
                    let _ = completions.send(Completion {
                        id,
                        index: invocation,
                        outcome,
                    });
                });

                if flags.end {
                    return self.end_task(index);
                }
                RunOutcome::Continue
            }
        }
    }

    fn apply_context_flags(&mut self, index: usize, flags: ContextFlags) {
        if flags.end {
            // Applied by the caller once the invocation, if any, is issued.
            return;
        }
        if flags.pause && self.tasks[index].state == TaskState::Active {
            self.set_task_state(index, TaskState::Paused);
        } else if flags.resume && self.tasks[index].state == TaskState::Paused {
            self.set_task_state(index, TaskState::Active);
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    fn set_task_state(&mut self, index: usize, state: TaskState) {
        let entry = &mut self.tasks[index];
        entry.state = state;
        entry.state_tx.send_replace(state);
    }

    /// Stops further invocations; terminates immediately when nothing is
    /// in flight.
    fn end_task(&mut self, index: usize) -> RunOutcome {
        if self.tasks[index].state < TaskState::Exhausted {
            self.set_task_state(index, TaskState::Exhausted);
        }
        if self.tasks[index].in_flight == 0 {
            self.terminate_task(index);
            RunOutcome::Removed
        } else {
            RunOutcome::Continue
        }
    }

    /// Records a task failure: first failure wins, waiters are rejected,
    /// every group is notified, and an unclaimed error is surfaced after a
    /// deferred check.
    fn fail_task(&mut self, index: usize, failure: TaskError) {
        if self.tasks[index].rejected {
            warn!(
                task_id = %self.tasks[index].id,
                error = %failure,
                "failure after recorded rejection"
            );
            return;
        }
        self.tasks[index].rejected = true;

        let claimed = self.tasks[index].driver.fail(&failure);
        let handled: Arc<AtomicBool> = Arc::clone(&self.tasks[index].shared.rejection_handled);
        if claimed {
            handled.store(true, Ordering::Release);
        }

        for group_id in self.tasks[index].groups.clone() {
            self.group_mut(group_id).reject(&failure, &handled);
        }

        self.telemetry.emit(TelemetryEvent::TaskFailed {
            id: self.tasks[index].id.clone(),
        });

        // Give waiters registered in the same cooperative step a chance to
        // claim the error before reporting it as unobserved.
        let id = self.tasks[index].id.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if handled.load(Ordering::Acquire) {
                debug!(task_id = %id, "task failure claimed by a waiter");
            } else {
                error!(task_id = %id, error = %failure, "unobserved task failure");
            }
        });
    }

    fn terminate_task(&mut self, index: usize) {
        let mut entry = self.tasks.remove(index);
        entry.state = TaskState::Terminated;
        entry.state_tx.send_replace(TaskState::Terminated);

        for group_id in &entry.groups {
            self.group_mut(*group_id).decrement_tasks();
        }
        self.registry.lock().unwrap().remove(&entry.id);
        entry.driver.settle();

        info!(
            task_id = %entry.id,
            invocations = entry.invocations,
            "task terminated"
        );
        self.telemetry.emit(TelemetryEvent::TaskTerminated {
            id: entry.id,
            invocations: entry.invocations,
        });
    }

    fn drain_shutdown(&mut self) {
        let remaining = self.tasks.len();
        if remaining > 0 {
            warn!(tasks = remaining, "pool shut down with live tasks");
        }
        let closed = TaskError::pool_closed();
        for mut entry in self.tasks.drain(..) {
            entry.shared.rejection_handled.store(true, Ordering::Release);
            entry.driver.fail(&closed);
            entry.state_tx.send_replace(TaskState::Terminated);
        }
        for group in self.groups.values_mut() {
            group.drain_waiters();
        }
        self.registry.lock().unwrap().clear();
    }

    fn group_mut(&mut self, id: GroupId) -> &mut GroupState {
        self.groups
            .get_mut(&id.0)
            .expect("group registered before use")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_min_wake_keeps_earliest() {
        let now = Instant::now();
        let later = now + Duration::from_millis(50);
        assert_eq!(min_wake(None, later), Some(later));
        assert_eq!(min_wake(Some(now), later), Some(now));
        assert_eq!(min_wake(Some(later), now), Some(now));
    }
}
