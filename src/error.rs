use thiserror::Error;

/// Errors that can occur within the `worker_brigade` pool.
///
/// Failures raised by a task's own logic travel inside the task's result type
/// `R` (e.g. `R = Result<T, E>`); `PoolError` only covers the pool's control
/// plane and the panic/cancellation boundary.
#[derive(Error, Debug, PartialEq)]
pub enum PoolError {
  #[error("Pool is shutting down or already shut down, cannot accept new work")]
  PoolClosed,

  #[error("Task queue is at capacity")]
  QueueFull,

  #[error("Submitted task future panicked")]
  TaskPanicked,

  #[error("Task result channel error (worker exited before delivering an outcome): {0}")]
  ResultChannelError(String),

  #[error("Task result already taken")]
  ResultUnavailable,

  #[error("Timed out waiting for a task outcome")]
  WaitTimeout,
}
