//! Integration tests for the persistent batcher.
//!
//! These tests verify the complete batching workflow including:
//! - Coalescing by queuing delay and by reaching the batch size cap
//! - Layered queuing thresholds capping concurrent batches
//! - Per-item outcomes: resolve, retry (head requeue), and fail
//! - Explicit send and termination
//!
//! All tests run on tokio's paused clock, so the timings asserted here are
//! virtual and deterministic.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskpool::batcher::{BatchOutput, BatcherOptions, PersistentBatcher};
use taskpool::executor::{PoolOptions, TaskError, TaskPool};
use tokio::time::Instant;

// =============================================================================
// Test Helpers
// =============================================================================

const TICK: Duration = Duration::from_millis(100);

/// Records the inputs of every dispatched batch.
type BatchLog = Arc<Mutex<Vec<Vec<u32>>>>;

/// A generator resolving every input to `input * 10` after `ticks`.
fn delayed_echo(
    log: BatchLog,
    ticks: u64,
) -> impl Fn(Vec<u32>) -> BoxFuture<'static, Result<Vec<BatchOutput<u32>>, TaskError>> {
    move |inputs| {
        log.lock().unwrap().push(inputs.clone());
        async move {
            if ticks > 0 {
                tokio::time::sleep(TICK * ticks as u32).await;
            }
            Ok(inputs
                .into_iter()
                .map(|n| BatchOutput::Value(n * 10))
                .collect())
        }
        .boxed()
    }
}

fn assert_tick(elapsed: Duration, ticks: u64) {
    let target = TICK * ticks as u32;
    assert!(
        elapsed >= target && elapsed < target + Duration::from_millis(80),
        "expected ~{ticks} ticks, got {elapsed:?}"
    );
}

async fn timed_result(
    batcher: &PersistentBatcher<u32, u32>,
    input: u32,
) -> (Result<u32, TaskError>, Duration) {
    let start = Instant::now();
    let result = batcher.get_result(input).await;
    (result, start.elapsed())
}

// =============================================================================
// Coalescing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_outputs_align_with_inputs_positionally() {
    let pool = TaskPool::new(PoolOptions::default()).unwrap();
    let log: BatchLog = BatchLog::default();
    let batcher = pool
        .add_persistent_batch_task(BatcherOptions::default(), delayed_echo(log.clone(), 0))
        .unwrap();

    let (a, b, c) = tokio::join!(
        batcher.get_result(1),
        batcher.get_result(2),
        batcher.get_result(3),
    );
    assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (10, 20, 30));

    // All three were submitted in one cooperative step: one batch.
    assert_eq!(*log.lock().unwrap(), vec![vec![1, 2, 3]]);
}

#[tokio::test(start_paused = true)]
async fn test_queuing_delay_coalesces_staggered_inputs() {
    let pool = TaskPool::new(PoolOptions::default()).unwrap();
    let log: BatchLog = BatchLog::default();
    let batcher = pool
        .add_persistent_batch_task(
            BatcherOptions {
                queuing_delay: TICK * 2,
                ..BatcherOptions::default()
            },
            delayed_echo(log.clone(), 0),
        )
        .unwrap();

    let early = {
        let batcher = batcher.clone();
        tokio::spawn(async move { timed_result(&batcher, 1).await })
    };
    let late = {
        let batcher = batcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TICK).await;
            timed_result(&batcher, 2).await
        })
    };

    let (result, elapsed) = early.await.unwrap();
    assert_eq!(result.unwrap(), 10);
    // The first input waits out the full delay; the second rides along.
    assert_tick(elapsed, 2);

    let (result, elapsed) = late.await.unwrap();
    assert_eq!(result.unwrap(), 20);
    assert_tick(elapsed, 1);

    assert_eq!(*log.lock().unwrap(), vec![vec![1, 2]]);
}

#[tokio::test(start_paused = true)]
async fn test_reaching_max_batch_size_fires_immediately() {
    let pool = TaskPool::new(PoolOptions::default()).unwrap();
    let log: BatchLog = BatchLog::default();
    let batcher = pool
        .add_persistent_batch_task(
            BatcherOptions {
                max_batch_size: Some(2),
                queuing_delay: TICK * 10,
                ..BatcherOptions::default()
            },
            delayed_echo(log.clone(), 0),
        )
        .unwrap();

    let start = Instant::now();
    let (a, b) = tokio::join!(batcher.get_result(1), batcher.get_result(2));
    assert_eq!((a.unwrap(), b.unwrap()), (10, 20));
    // The cap fires the batch without waiting out the delay.
    assert!(start.elapsed() < TICK);
}

#[tokio::test(start_paused = true)]
async fn test_threshold_blocks_second_batch_until_first_drains() {
    let pool = TaskPool::new(PoolOptions::default()).unwrap();
    let log: BatchLog = BatchLog::default();
    let batcher = pool
        .add_persistent_batch_task(
            BatcherOptions {
                queuing_delay: TICK * 2,
                queuing_thresholds: vec![1, usize::MAX],
                ..BatcherOptions::default()
            },
            delayed_echo(log.clone(), 0),
        )
        .unwrap();

    // Submissions at ticks 0, 1, and 3.
    let first = {
        let batcher = batcher.clone();
        tokio::spawn(async move { timed_result(&batcher, 1).await })
    };
    let second = {
        let batcher = batcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TICK).await;
            timed_result(&batcher, 2).await
        })
    };
    let third = {
        let batcher = batcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TICK * 3).await;
            timed_result(&batcher, 3).await
        })
    };

    let (result, elapsed) = first.await.unwrap();
    assert_eq!(result.unwrap(), 10);
    assert_tick(elapsed, 2);

    let (result, elapsed) = second.await.unwrap();
    assert_eq!(result.unwrap(), 20);
    assert_tick(elapsed, 1);

    // The third input waits its own full delay after arriving at tick 3.
    let (result, elapsed) = third.await.unwrap();
    assert_eq!(result.unwrap(), 30);
    assert_tick(elapsed, 2);

    assert_eq!(*log.lock().unwrap(), vec![vec![1, 2], vec![3]]);
}

// =============================================================================
// Retry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_retried_inputs_requeue_at_head() {
    let pool = TaskPool::new(PoolOptions::default()).unwrap();
    let log: BatchLog = BatchLog::default();
    let calls = Arc::new(Mutex::new(0usize));

    let generator_log = log.clone();
    let generator_calls = Arc::clone(&calls);
    let batcher: PersistentBatcher<u32, u32> = pool
        .add_persistent_batch_task(
            BatcherOptions {
                max_batch_size: Some(3),
                queuing_thresholds: vec![1, usize::MAX],
                ..BatcherOptions::default()
            },
            move |inputs: Vec<u32>| {
                generator_log.lock().unwrap().push(inputs.clone());
                let mut calls = generator_calls.lock().unwrap();
                *calls += 1;
                let first_call = *calls == 1;
                drop(calls);
                async move {
                    tokio::time::sleep(TICK).await;
                    Ok(inputs
                        .into_iter()
                        .enumerate()
                        .map(|(index, n)| {
                            if first_call && index < 2 {
                                BatchOutput::Retry
                            } else {
                                BatchOutput::Value(n * 10)
                            }
                        })
                        .collect())
                }
                .boxed()
            },
        )
        .unwrap();

    let (a, b, c, d) = tokio::join!(
        timed_result(&batcher, 1),
        timed_result(&batcher, 2),
        timed_result(&batcher, 3),
        timed_result(&batcher, 4),
    );

    // The first batch takes [1, 2, 3]; 1 and 2 retry and rejoin ahead of 4,
    // so the second batch is [1, 2, 4] and starts as soon as the first
    // drains, without a fresh delay.
    assert_eq!(*log.lock().unwrap(), vec![vec![1, 2, 3], vec![1, 2, 4]]);

    assert_eq!(a.0.unwrap(), 10);
    assert_tick(a.1, 2);
    assert_eq!(b.0.unwrap(), 20);
    assert_tick(b.1, 2);
    assert_eq!(c.0.unwrap(), 30);
    assert_tick(c.1, 1);
    assert_eq!(d.0.unwrap(), 40);
    assert_tick(d.1, 2);
}

// =============================================================================
// Send
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_send_bypasses_queuing_delay() {
    let pool = TaskPool::new(PoolOptions::default()).unwrap();
    let log: BatchLog = BatchLog::default();
    let batcher = pool
        .add_persistent_batch_task(
            BatcherOptions {
                queuing_delay: TICK * 10,
                ..BatcherOptions::default()
            },
            delayed_echo(log.clone(), 0),
        )
        .unwrap();

    let pending = {
        let batcher = batcher.clone();
        tokio::spawn(async move { timed_result(&batcher, 1).await })
    };
    tokio::time::sleep(TICK).await;
    batcher.send();

    let (result, elapsed) = pending.await.unwrap();
    assert_eq!(result.unwrap(), 10);
    assert_tick(elapsed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_is_remembered_while_thresholds_forbid() {
    let pool = TaskPool::new(PoolOptions::default()).unwrap();
    let log: BatchLog = BatchLog::default();
    let batcher = pool
        .add_persistent_batch_task(
            BatcherOptions {
                queuing_delay: TICK * 10,
                queuing_thresholds: vec![1, usize::MAX],
                ..BatcherOptions::default()
            },
            delayed_echo(log.clone(), 2),
        )
        .unwrap();

    // The first send launches a two-tick batch immediately.
    let first = {
        let batcher = batcher.clone();
        tokio::spawn(async move { timed_result(&batcher, 1).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    batcher.send();

    // While that batch runs, a new input plus send() cannot start another;
    // the send is remembered and fires the moment the slot frees.
    let second = {
        let batcher = batcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TICK).await;
            timed_result(&batcher, 2).await
        })
    };
    tokio::time::sleep(TICK + Duration::from_millis(10)).await;
    batcher.send();

    let (result, elapsed) = first.await.unwrap();
    assert_eq!(result.unwrap(), 10);
    assert_tick(elapsed, 2);

    // Submitted at tick 1, dispatched at tick 2, done at tick 4.
    let (result, elapsed) = second.await.unwrap();
    assert_eq!(result.unwrap(), 20);
    assert_tick(elapsed, 3);

    assert_eq!(*log.lock().unwrap(), vec![vec![1], vec![2]]);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_output_length_mismatch_rejects_batch() {
    let pool = TaskPool::new(PoolOptions::default()).unwrap();
    let batcher: PersistentBatcher<u32, u32> = pool
        .add_persistent_batch_task(BatcherOptions::default(), |inputs: Vec<u32>| {
            let short = inputs.len() - 1;
            async move {
                Ok((0..short)
                    .map(|n| BatchOutput::Value(n as u32))
                    .collect::<Vec<_>>())
            }
            .boxed()
        })
        .unwrap();

    let (a, b) = tokio::join!(batcher.get_result(1), batcher.get_result(2));
    let error = a.unwrap_err();
    assert!(error.message().contains("does not match"));
    assert!(b.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_generator_error_rejects_every_waiter_in_batch() {
    let pool = TaskPool::new(PoolOptions::default()).unwrap();
    let batcher: PersistentBatcher<u32, u32> = pool
        .add_persistent_batch_task(BatcherOptions::default(), |_inputs: Vec<u32>| {
            futures::future::ready(Err(TaskError::new("backend down"))).boxed()
        })
        .unwrap();

    let (a, b) = tokio::join!(batcher.get_result(1), batcher.get_result(2));
    assert_eq!(a.unwrap_err().message(), "backend down");
    assert_eq!(b.unwrap_err().message(), "backend down");
}

#[tokio::test(start_paused = true)]
async fn test_per_item_failure_leaves_others_resolved() {
    let pool = TaskPool::new(PoolOptions::default()).unwrap();
    let batcher: PersistentBatcher<u32, u32> = pool
        .add_persistent_batch_task(BatcherOptions::default(), |inputs: Vec<u32>| {
            async move {
                Ok(inputs
                    .into_iter()
                    .map(|n| {
                        if n % 2 == 0 {
                            BatchOutput::Fail(TaskError::new("even input"))
                        } else {
                            BatchOutput::Value(n * 10)
                        }
                    })
                    .collect())
            }
            .boxed()
        })
        .unwrap();

    let (odd, even) = tokio::join!(batcher.get_result(1), batcher.get_result(2));
    assert_eq!(odd.unwrap(), 10);
    assert_eq!(even.unwrap_err().message(), "even input");
}

// =============================================================================
// Termination
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_end_rejects_pending_and_future_inputs() {
    let pool = TaskPool::new(PoolOptions::default()).unwrap();
    let log: BatchLog = BatchLog::default();
    let batcher = pool
        .add_persistent_batch_task(
            BatcherOptions {
                queuing_delay: TICK * 10,
                ..BatcherOptions::default()
            },
            delayed_echo(log.clone(), 0),
        )
        .unwrap();

    let pending = {
        let batcher = batcher.clone();
        tokio::spawn(async move { batcher.get_result(1).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    batcher.end();

    assert!(pending.await.unwrap().is_err());
    assert!(batcher.get_result(2).await.is_err());
    assert!(log.lock().unwrap().is_empty());
}
