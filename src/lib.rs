//! A Tokio-based worker pool for executing futures, with live resizing,
//! FIFO queuing, back-pressure and graceful shutdown.

mod error;
mod handle;
mod manager;
mod notifier;
mod task;
mod task_queue;
mod worker;

pub use error::PoolError;
pub use handle::TaskHandle;
pub use manager::{PoolState, ShutdownMode, WorkerPoolManager};
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use task::TaskToExecute;
pub use worker::WorkerState;
