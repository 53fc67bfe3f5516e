use crate::error::PoolError;

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::warn;

/// A handle to a task submitted to the [`WorkerPoolManager`](crate::WorkerPoolManager).
///
/// Allows awaiting the task's terminal outcome: either its produced value or
/// the failure recorded for it (panic, or rejection at shutdown).
#[derive(Debug)]
pub struct TaskHandle<R: Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) outcome_rx: Option<oneshot::Receiver<Result<R, PoolError>>>,
}

impl<R: Send + 'static> TaskHandle<R> {
  /// Returns the unique submission sequence number of this task.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Awaits the completion of the task and returns its outcome.
  ///
  /// # Errors
  /// Returns `PoolError::TaskPanicked` if the task panicked during execution.
  /// Returns `PoolError::PoolClosed` if the task was abandoned in the queue by
  /// an immediate shutdown.
  /// Returns `PoolError::ResultChannelError` if the outcome channel broke
  /// before an outcome was delivered.
  /// Returns `PoolError::ResultUnavailable` if the outcome was already taken.
  pub async fn await_result(mut self) -> Result<R, PoolError> {
    match self.outcome_rx.take() {
      Some(rx) => match rx.await {
        Ok(outcome) => outcome,
        Err(recv_error) => {
          warn!(task_id = %self.task_id, "Outcome channel receive error: {}", recv_error);
          Err(PoolError::ResultChannelError(format!(
            "Task (id: {}) outcome channel unexpectedly closed: {}",
            self.task_id, recv_error
          )))
        }
      },
      None => Err(PoolError::ResultUnavailable),
    }
  }

  /// Awaits the task's outcome for at most `timeout`.
  ///
  /// On `PoolError::WaitTimeout` the handle remains usable, so the caller can
  /// keep polling or fall back to [`await_result`](Self::await_result). The
  /// task itself is unaffected: the pool never interrupts running work.
  pub async fn await_result_timeout(&mut self, timeout: Duration) -> Result<R, PoolError> {
    let rx = self.outcome_rx.as_mut().ok_or(PoolError::ResultUnavailable)?;
    match tokio::time::timeout(timeout, rx).await {
      Ok(Ok(outcome)) => {
        self.outcome_rx = None;
        outcome
      }
      Ok(Err(recv_error)) => {
        self.outcome_rx = None;
        warn!(task_id = %self.task_id, "Outcome channel receive error: {}", recv_error);
        Err(PoolError::ResultChannelError(format!(
          "Task (id: {}) outcome channel unexpectedly closed: {}",
          self.task_id, recv_error
        )))
      }
      Err(_elapsed) => Err(PoolError::WaitTimeout),
    }
  }
}
