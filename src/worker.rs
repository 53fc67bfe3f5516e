use crate::error::PoolError;
use crate::notifier::{CompletionSink, InternalCompletionMessage, TaskCompletionStatus};
use crate::task_queue::QueueConsumer;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Observable lifecycle state of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
  /// Spawned but not yet polling the queue.
  Starting = 0,
  /// Blocked on the queue, waiting for a task.
  Idle = 1,
  /// Executing a task.
  Busy = 2,
  /// Executing backlog after the queue was closed to new work.
  Draining = 3,
  /// Exited its loop; about to be removed from the worker set.
  Stopped = 4,
}

/// Lock-free state slot shared between a worker and the controller's
/// introspection surface.
#[derive(Debug)]
pub(crate) struct WorkerStateCell(AtomicU8);

impl WorkerStateCell {
  pub(crate) fn new() -> Self {
    Self(AtomicU8::new(WorkerState::Starting as u8))
  }

  pub(crate) fn set(&self, state: WorkerState) {
    self.0.store(state as u8, AtomicOrdering::Release);
  }

  pub(crate) fn get(&self) -> WorkerState {
    match self.0.load(AtomicOrdering::Acquire) {
      0 => WorkerState::Starting,
      1 => WorkerState::Idle,
      2 => WorkerState::Busy,
      3 => WorkerState::Draining,
      _ => WorkerState::Stopped,
    }
  }
}

/// Notice sent to the supervisor once a worker's loop has ended.
#[derive(Debug)]
pub(crate) struct WorkerExit {
  pub(crate) worker_id: u64,
  /// True when the loop itself panicked, as opposed to stopping on signal or
  /// queue closure. Task panics are caught per-task and never set this.
  pub(crate) panicked: bool,
}

/// Everything a worker loop needs, cloned out of the manager at spawn time.
/// Workers hold no reference back to the controller; all coordination flows
/// through the queue, the stop token and the exit notice.
pub(crate) struct WorkerContext<R: Send + 'static> {
  pub(crate) worker_id: u64,
  pub(crate) pool_name: Arc<String>,
  pub(crate) queue: QueueConsumer<R>,
  pub(crate) stop_token: CancellationToken,
  pub(crate) state: Arc<WorkerStateCell>,
  pub(crate) completion_tx: CompletionSink,
}

/// The worker loop: dequeue, execute, publish outcome, repeat.
///
/// The stop token is checked first (biased) on every iteration, so a worker
/// never pulls a new task after being told to stop, but a task already in
/// hand always runs to completion; task futures are never interrupted.
pub(crate) async fn run_worker_loop<R: Send + 'static>(ctx: WorkerContext<R>) {
  debug!(pool_name = %*ctx.pool_name, worker_id = ctx.worker_id, "Worker started.");
  ctx.state.set(WorkerState::Idle);

  loop {
    let task = tokio::select! {
      biased;

      _ = ctx.stop_token.cancelled() => {
        debug!(
          pool_name = %*ctx.pool_name,
          worker_id = ctx.worker_id,
          "Stop signal received while idle. Worker exiting."
        );
        break;
      }

      recv_result = ctx.queue.recv() => {
        match recv_result {
          Ok(task) => task,
          Err(_closed) => {
            debug!(
              pool_name = %*ctx.pool_name,
              worker_id = ctx.worker_id,
              "Task queue closed and drained. Worker exiting."
            );
            break;
          }
        }
      }
    };

    #[cfg(test)]
    if task.crash_worker_loop {
      panic!("Injected worker loop fault (worker {}).", ctx.worker_id);
    }

    // Backlog pulled after the queue closed is drain work, not regular work.
    if ctx.queue.is_closed() {
      ctx.state.set(WorkerState::Draining);
    } else {
      ctx.state.set(WorkerState::Busy);
    }

    let task_id = task.task_id;
    let mut outcome_tx = task.outcome_tx;
    trace!(
      pool_name = %*ctx.pool_name,
      worker_id = ctx.worker_id,
      %task_id,
      "Dequeued task. Executing."
    );

    let execution_outcome: Result<R, PoolError> =
      match AssertUnwindSafe(task.future).catch_unwind().await {
        Ok(value) => {
          trace!(pool_name = %*ctx.pool_name, worker_id = ctx.worker_id, %task_id, "Task executed successfully.");
          Ok(value)
        }
        Err(_panic_payload) => {
          error!(
            pool_name = %*ctx.pool_name,
            worker_id = ctx.worker_id,
            %task_id,
            "Task panicked during execution."
          );
          Err(PoolError::TaskPanicked)
        }
      };

    let status = TaskCompletionStatus::from(&execution_outcome);

    if let Some(tx) = outcome_tx.take() {
      if tx.send(execution_outcome).is_err() {
        warn!(
          pool_name = %*ctx.pool_name,
          worker_id = ctx.worker_id,
          %task_id,
          "Outcome receiver for task was dropped. Task outcome may have been lost."
        );
      }
    }

    ctx.completion_tx.publish(InternalCompletionMessage {
      task_id,
      pool_name: ctx.pool_name.clone(),
      status,
    });

    ctx.state.set(WorkerState::Idle);
  }

  ctx.state.set(WorkerState::Stopped);
  debug!(pool_name = %*ctx.pool_name, worker_id = ctx.worker_id, "Worker stopped.");
}
