use crate::error::PoolError;
use crate::task::QueuedTask;

use std::fmt;

use async_channel::{RecvError, TryRecvError, TrySendError};

/// The shared FIFO task queue, backed by an `async-channel` MPMC channel.
///
/// `close()` follows the channel's drain-on-close contract: tasks already
/// buffered are still delivered to consumers, and only once the buffer is
/// empty does `recv()` report closure. This is what lets a graceful shutdown
/// run every task that was accepted before the queue closed.
pub(crate) struct TaskQueue<R: Send + 'static> {
  tx: async_channel::Sender<QueuedTask<R>>,
  rx: async_channel::Receiver<QueuedTask<R>>,
}

impl<R: Send + 'static> TaskQueue<R> {
  /// Creates a new queue. `capacity: Some(n)` bounds the queue at `n.max(1)`
  /// slots for submission back-pressure; `None` makes it unbounded.
  pub(crate) fn new(capacity: Option<usize>) -> Self {
    let (tx, rx) = match capacity {
      Some(n) => async_channel::bounded(n.max(1)),
      None => async_channel::unbounded(),
    };
    Self { tx, rx }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer<R>, QueueConsumer<R>) {
    (QueueProducer { tx: self.tx }, QueueConsumer { rx: self.rx })
  }
}

/// The producer handle for the `TaskQueue`. Cloneable, shared by all
/// submission sites.
pub(crate) struct QueueProducer<R: Send + 'static> {
  tx: async_channel::Sender<QueuedTask<R>>,
}

impl<R: Send + 'static> Clone for QueueProducer<R> {
  fn clone(&self) -> Self {
    Self { tx: self.tx.clone() }
  }
}

impl<R: Send + 'static> fmt::Debug for QueueProducer<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> QueueProducer<R> {
  /// Appends a task to the tail of the queue, waiting for a free slot when
  /// the queue is bounded and full.
  pub(crate) async fn send(&self, task: QueuedTask<R>) -> Result<(), PoolError> {
    self.tx.send(task).await.map_err(|_closed| PoolError::PoolClosed)
  }

  /// Non-blocking enqueue. Fails with `QueueFull` when a bounded queue is at
  /// capacity, and `PoolClosed` once the queue has been closed. The task is
  /// handed back alongside the error so its outcome slot is not lost.
  pub(crate) fn try_send(&self, task: QueuedTask<R>) -> Result<(), (QueuedTask<R>, PoolError)> {
    match self.tx.try_send(task) {
      Ok(()) => Ok(()),
      Err(TrySendError::Full(task)) => Err((task, PoolError::QueueFull)),
      Err(TrySendError::Closed(task)) => Err((task, PoolError::PoolClosed)),
    }
  }

  /// Closes the queue to new enqueues. Buffered tasks remain receivable.
  pub(crate) fn close(&self) {
    let _ = self.tx.close();
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  /// Number of tasks currently buffered (accepted but not yet dequeued).
  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }
}

/// The consumer handle for the `TaskQueue`. Every worker holds its own clone
/// and competes for the queue head, which preserves FIFO start eligibility.
pub(crate) struct QueueConsumer<R: Send + 'static> {
  rx: async_channel::Receiver<QueuedTask<R>>,
}

impl<R: Send + 'static> Clone for QueueConsumer<R> {
  fn clone(&self) -> Self {
    Self { rx: self.rx.clone() }
  }
}

impl<R: Send + 'static> fmt::Debug for QueueConsumer<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueConsumer")
      .field("len", &self.rx.len())
      .field("closed", &self.rx.is_closed())
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> QueueConsumer<R> {
  /// Removes and returns the head of the queue, waiting until a task is
  /// available. Returns `Err` only once the queue is closed *and* empty.
  pub(crate) async fn recv(&self) -> Result<QueuedTask<R>, RecvError> {
    self.rx.recv().await
  }

  /// Non-blocking dequeue, used by the controller to reject tasks left in the
  /// queue after the workers have stopped.
  pub(crate) fn try_recv(&self) -> Option<QueuedTask<R>> {
    match self.rx.try_recv() {
      Ok(task) => Some(task),
      Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
    }
  }

  /// Whether the queue has been closed to new enqueues. Buffered tasks may
  /// still be pending.
  pub(crate) fn is_closed(&self) -> bool {
    self.rx.is_closed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::task::TaskToExecute;
  use tokio::sync::oneshot;

  fn dummy_task(id: u64) -> QueuedTask<String> {
    let future: TaskToExecute<String> = Box::pin(async move { "done".to_string() });
    let (tx, _rx) = oneshot::channel();
    QueuedTask {
      task_id: id,
      future,
      outcome_tx: Some(tx),
      crash_worker_loop: false,
    }
  }

  #[tokio::test]
  async fn test_queue_preserves_fifo_order() {
    let (producer, consumer) = TaskQueue::<String>::new(None).split();

    for id in 0..4u64 {
      producer.send(dummy_task(id)).await.unwrap();
    }
    assert_eq!(producer.len(), 4);

    for id in 0..4u64 {
      assert_eq!(consumer.recv().await.unwrap().task_id, id);
    }
    assert_eq!(producer.len(), 0);
  }

  #[tokio::test]
  async fn test_bounded_queue_blocks_send_until_dequeue() {
    let (producer, consumer) = TaskQueue::<String>::new(Some(1)).split();

    producer.send(dummy_task(1)).await.unwrap();

    let send_future = producer.send(dummy_task(2));
    tokio::pin!(send_future);

    tokio::select! {
      _ = &mut send_future => {
        panic!("Send should have blocked because the queue is full.");
      },
      _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {
        // Expected: the queue is at capacity.
      }
    }

    assert_eq!(consumer.recv().await.unwrap().task_id, 1);

    tokio::time::timeout(std::time::Duration::from_millis(50), send_future)
      .await
      .expect("Send did not complete after a slot was freed.")
      .unwrap();
  }

  #[tokio::test]
  async fn test_try_send_reports_full_then_succeeds() {
    let (producer, consumer) = TaskQueue::<String>::new(Some(1)).split();

    producer.try_send(dummy_task(1)).unwrap();

    let (task, error) = producer.try_send(dummy_task(2)).unwrap_err();
    assert_eq!(error, PoolError::QueueFull);
    assert_eq!(task.task_id, 2);

    assert_eq!(consumer.recv().await.unwrap().task_id, 1);
    producer.try_send(task).unwrap();
    assert_eq!(consumer.recv().await.unwrap().task_id, 2);
  }

  #[tokio::test]
  async fn test_close_drains_buffered_tasks_then_stops_consumer() {
    let (producer, consumer) = TaskQueue::<String>::new(Some(4)).split();

    producer.send(dummy_task(1)).await.unwrap();
    producer.send(dummy_task(2)).await.unwrap();
    producer.close();

    let (task, error) = producer.try_send(dummy_task(3)).unwrap_err();
    assert_eq!(error, PoolError::PoolClosed);
    task.reject(PoolError::PoolClosed);

    // Buffered tasks survive the close.
    assert_eq!(consumer.recv().await.unwrap().task_id, 1);
    assert_eq!(consumer.recv().await.unwrap().task_id, 2);
    assert!(consumer.recv().await.is_err());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_consumers_dequeue_each_task_once() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let (producer, consumer) = TaskQueue::<String>::new(None).split();
    let num_tasks: u64 = 40;
    let received = Arc::new(AtomicUsize::new(0));

    let mut consumers = Vec::new();
    for _ in 0..4 {
      let consumer = consumer.clone();
      let received = received.clone();
      consumers.push(tokio::spawn(async move {
        while consumer.recv().await.is_ok() {
          received.fetch_add(1, Ordering::SeqCst);
        }
      }));
    }

    for id in 0..num_tasks {
      producer.send(dummy_task(id)).await.unwrap();
    }
    producer.close();

    for handle in consumers {
      handle.await.unwrap();
    }
    assert_eq!(received.load(Ordering::SeqCst), num_tasks as usize);
  }
}
