use crate::error::PoolError;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::oneshot;

/// The type of future that the pool executes.
/// It must be `Send` and `'static`, and produce a result of type `R`.
pub type TaskToExecute<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

/// Internal representation of one queued unit of work.
///
/// The `outcome_tx` is the task's outcome slot: it is written exactly once,
/// either by the worker that executes the task or by the controller when a
/// still-queued task is rejected during shutdown.
pub(crate) struct QueuedTask<R: Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) future: TaskToExecute<R>,
  pub(crate) outcome_tx: Option<oneshot::Sender<Result<R, PoolError>>>,
  /// Test hook: makes the worker dequeuing this task panic inside its loop,
  /// before task execution, to exercise the supervisor's replacement path.
  #[cfg(test)]
  pub(crate) crash_worker_loop: bool,
}

impl<R: Send + 'static> QueuedTask<R> {
  /// Resolves the task's outcome slot with `error` without running it.
  /// Used when a task is abandoned in the queue at shutdown.
  pub(crate) fn reject(mut self, error: PoolError) {
    if let Some(tx) = self.outcome_tx.take() {
      // A dropped receiver just means nobody is waiting for this outcome.
      let _ = tx.send(Err(error));
    }
  }
}

impl<R: Send + 'static> fmt::Debug for QueuedTask<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueuedTask")
      .field("task_id", &self.task_id)
      .field("outcome_pending", &self.outcome_tx.is_some())
      .finish_non_exhaustive()
  }
}
