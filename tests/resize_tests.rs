use worker_brigade::{PoolError, ShutdownMode, TaskToExecute, WorkerPoolManager};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

fn sleeping_task(
  task_index: usize,
  duration_ms: u64,
  executed_counter: Option<Arc<AtomicUsize>>,
) -> TaskToExecute<usize> {
  Box::pin(async move {
    sleep(Duration::from_millis(duration_ms)).await;
    if let Some(counter) = executed_counter {
      counter.fetch_add(1, Ordering::SeqCst);
    }
    task_index
  })
}

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,worker_brigade=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[tokio::test]
async fn test_grow_mid_backlog_speeds_up_completion() {
  setup_tracing_for_test();
  let manager =
    WorkerPoolManager::<usize>::new(2, None, tokio::runtime::Handle::current(), "test_resize_grow");

  let started_at = Instant::now();
  let mut handles = Vec::new();
  for i in 0..10usize {
    handles.push(manager.submit(sleeping_task(i, 100, None)).await.unwrap());
  }

  manager.resize(5).unwrap();
  assert_eq!(manager.target_worker_count(), 5);

  for (i, handle) in handles.into_iter().enumerate() {
    assert_eq!(handle.await_result().await, Ok(i));
  }

  // 10 tasks of 100ms each: 2 workers would need ~500ms, 5 workers ~200ms.
  // The wall time must land nearer the grown pool's bound.
  let elapsed = started_at.elapsed();
  assert!(
    elapsed < Duration::from_millis(400),
    "Expected the grown pool to clear the backlog faster, took {:?}",
    elapsed
  );

  manager.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_shrink_loses_no_tasks() {
  setup_tracing_for_test();
  let manager =
    WorkerPoolManager::<usize>::new(4, None, tokio::runtime::Handle::current(), "test_resize_shrink");

  let executed = Arc::new(AtomicUsize::new(0));
  let mut handles = Vec::new();

  for i in 0..10usize {
    handles.push(
      manager
        .submit(sleeping_task(i, 20, Some(executed.clone())))
        .await
        .unwrap(),
    );
  }

  // Shrink while the backlog is in flight, then keep submitting.
  manager.resize(1).unwrap();

  for i in 10..20usize {
    handles.push(
      manager
        .submit(sleeping_task(i, 20, Some(executed.clone())))
        .await
        .unwrap(),
    );
  }

  for (i, handle) in handles.into_iter().enumerate() {
    assert_eq!(
      handle.await_result().await,
      Ok(i),
      "No task may be lost or duplicated across a shrink"
    );
  }
  assert_eq!(executed.load(Ordering::SeqCst), 20);

  manager.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_shrink_signaled_worker_finishes_current_task() {
  setup_tracing_for_test();
  let manager =
    WorkerPoolManager::<usize>::new(1, None, tokio::runtime::Handle::current(), "test_resize_drain_current");

  let executed = Arc::new(AtomicUsize::new(0));
  let handle = manager
    .submit(sleeping_task(42, 150, Some(executed.clone())))
    .await
    .unwrap();

  // Let the worker pick the task up, then tell it to stop.
  sleep(Duration::from_millis(30)).await;
  manager.resize(0).unwrap();
  assert_eq!(manager.current_worker_count(), 0);

  // The stop signal must not interrupt the task in hand.
  assert_eq!(handle.await_result().await, Ok(42));
  assert_eq!(executed.load(Ordering::SeqCst), 1);

  manager.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_resize_to_zero_parks_queued_tasks() {
  setup_tracing_for_test();
  let manager =
    WorkerPoolManager::<usize>::new(2, None, tokio::runtime::Handle::current(), "test_resize_to_zero");

  manager.resize_and_wait(0).await.unwrap();
  assert_eq!(manager.current_worker_count(), 0);
  assert_eq!(manager.worker_states().len(), 0);

  let executed = Arc::new(AtomicUsize::new(0));
  let mut handles = Vec::new();
  for i in 0..3usize {
    handles.push(
      manager
        .submit(sleeping_task(i, 5, Some(executed.clone())))
        .await
        .unwrap(),
    );
  }

  // With no workers, accepted tasks sit untouched in the queue.
  sleep(Duration::from_millis(100)).await;
  assert_eq!(executed.load(Ordering::SeqCst), 0);
  assert_eq!(manager.pending_task_count(), 3);

  // Growing back up runs the parked backlog.
  manager.resize(2).unwrap();
  for (i, handle) in handles.into_iter().enumerate() {
    assert_eq!(handle.await_result().await, Ok(i));
  }
  assert_eq!(executed.load(Ordering::SeqCst), 3);

  manager.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_resize_and_wait_converges_both_ways() {
  setup_tracing_for_test();
  let manager =
    WorkerPoolManager::<usize>::new(1, None, tokio::runtime::Handle::current(), "test_resize_converge");

  manager.resize_and_wait(4).await.unwrap();
  assert_eq!(manager.current_worker_count(), 4);
  assert_eq!(manager.target_worker_count(), 4);
  assert_eq!(manager.worker_states().len(), 4);

  manager.resize_and_wait(1).await.unwrap();
  assert_eq!(manager.current_worker_count(), 1);
  assert_eq!(manager.worker_states().len(), 1);

  // The remaining worker still serves tasks.
  let handle = manager.submit(sleeping_task(9, 10, None)).await.unwrap();
  assert_eq!(handle.await_result().await, Ok(9));

  manager.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_resize_after_shutdown_fails() {
  setup_tracing_for_test();
  let manager =
    WorkerPoolManager::<usize>::new(1, None, tokio::runtime::Handle::current(), "test_resize_after_shutdown");

  manager.shutdown(ShutdownMode::Graceful).await.unwrap();

  assert!(matches!(manager.resize(3), Err(PoolError::PoolClosed)));
  assert!(matches!(manager.resize_and_wait(3).await, Err(PoolError::PoolClosed)));
}

#[tokio::test]
async fn test_graceful_shutdown_with_zero_workers_rejects_queued_tasks() {
  setup_tracing_for_test();
  let manager =
    WorkerPoolManager::<usize>::new(0, None, tokio::runtime::Handle::current(), "test_resize_zero_shutdown");

  let first = manager.submit(sleeping_task(0, 5, None)).await.unwrap();
  let second = manager.submit(sleeping_task(1, 5, None)).await.unwrap();

  // Nobody can ever run these; shutdown must not hang and must resolve them.
  manager.shutdown(ShutdownMode::Graceful).await.unwrap();

  assert!(matches!(first.await_result().await, Err(PoolError::PoolClosed)));
  assert!(matches!(second.await_result().await, Err(PoolError::PoolClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resizes_converge() {
  setup_tracing_for_test();
  let manager =
    WorkerPoolManager::<usize>::new(2, None, tokio::runtime::Handle::current(), "test_resize_concurrent");

  let executed = Arc::new(AtomicUsize::new(0));
  let mut handles = Vec::new();
  for i in 0..30usize {
    handles.push(
      manager
        .submit(sleeping_task(i, 10, Some(executed.clone())))
        .await
        .unwrap(),
    );
  }

  // Hammer the controller with interleaved resizes from several tasks.
  let mut resizers = Vec::new();
  for target in [5usize, 1, 4, 2, 3] {
    let manager = manager.clone();
    resizers.push(tokio::spawn(async move {
      manager.resize(target).unwrap();
    }));
  }
  for resizer in resizers {
    resizer.await.unwrap();
  }

  for (i, handle) in handles.into_iter().enumerate() {
    assert_eq!(handle.await_result().await, Ok(i));
  }
  assert_eq!(executed.load(Ordering::SeqCst), 30);

  // Whatever order the resizes landed in, the set settles at the last target
  // recorded by the controller.
  let target = manager.target_worker_count();
  manager.resize_and_wait(target).await.unwrap();
  assert_eq!(manager.current_worker_count(), target);

  manager.shutdown(ShutdownMode::Graceful).await.unwrap();
}
