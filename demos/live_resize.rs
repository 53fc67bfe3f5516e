use worker_brigade::{ShutdownMode, WorkerPoolManager};

use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::info;

async fn work_task_fn(id: usize, duration_ms: u64) -> usize {
  info!("Task {} starting ({}ms of work)", id, duration_ms);
  tokio::time::sleep(Duration::from_millis(duration_ms)).await;
  id
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Live Resize Example ---");

  let manager = WorkerPoolManager::<usize>::new(2, None, Handle::current(), "resize_pool");

  // Build a backlog the 2 initial workers would take a while to clear.
  let started_at = Instant::now();
  let mut handles = Vec::new();
  for i in 0..10 {
    let future = Box::pin(async move { work_task_fn(i, 300).await });
    handles.push(manager.submit(future).await.expect("submit failed"));
  }
  info!(
    "Backlog submitted. Workers: {}, pending tasks: {}",
    manager.current_worker_count(),
    manager.pending_task_count()
  );

  // Grow mid-flight: the new workers immediately compete for the queue head.
  manager.resize(5).expect("resize failed");
  info!("Resized up. Target worker count: {}", manager.target_worker_count());

  for handle in handles {
    let task_id = handle.id();
    match handle.await_result().await {
      Ok(value) => info!("Task {} completed with {}", task_id, value),
      Err(e) => tracing::error!("Task {} failed: {:?}", task_id, e),
    }
  }
  info!("Backlog cleared in {:?} (2 workers alone would need ~1.5s)", started_at.elapsed());

  // Shrink back down and wait for the displaced workers to drain out.
  manager.resize_and_wait(1).await.expect("resize failed");
  info!(
    "Shrunk. Workers now: {}, states: {:?}",
    manager.current_worker_count(),
    manager.worker_states()
  );

  manager
    .shutdown(ShutdownMode::Graceful)
    .await
    .expect("Pool shutdown failed");
  info!("--- Live Resize Example End ---");
}
