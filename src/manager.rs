use crate::error::PoolError;
use crate::handle::TaskHandle;
use crate::notifier::{
  CompletionNotifier, CompletionSink, InternalCompletionMessage, TaskCompletionInfo,
  TaskCompletionStatus,
};
use crate::task::{QueuedTask, TaskToExecute};
use crate::task_queue::{QueueConsumer, QueueProducer, TaskQueue};
use crate::worker::{run_worker_loop, WorkerContext, WorkerExit, WorkerState, WorkerStateCell};

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
  static ref NEXT_WORKER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Defines how the pool should behave upon shutdown.
///
/// In both modes a task that a worker has already pulled runs to completion;
/// the pool never interrupts work in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Every task accepted before shutdown is drained from the queue and
  /// executed before the pool stops.
  Graceful,
  /// Workers stop pulling new tasks; tasks still queued resolve their handles
  /// with `PoolError::PoolClosed`.
  Immediate,
}

/// Overall lifecycle state of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
  Running,
  Draining,
  Stopped,
}

/// Registry entry for one live worker.
struct WorkerEntry {
  stop_token: CancellationToken,
  state: Arc<WorkerStateCell>,
  // Owned for the worker's lifetime; exit bookkeeping flows through the
  // supervisor's exit notices, not through joining.
  _join: JoinHandle<()>,
}

/// The controller's mutable core. All reads and writes go through one mutex,
/// which linearizes submit/resize/shutdown against each other and serializes
/// concurrent resizes.
struct PoolCore {
  state: PoolState,
  target_workers: usize,
  workers: BTreeMap<u64, WorkerEntry>,
}

impl PoolCore {
  /// Workers that are still eligible to pull tasks (stop not yet requested).
  /// Workers draining out after a shrink stay in the map until their exit is
  /// confirmed, but no longer count toward the live size.
  fn live_worker_count(&self) -> usize {
    self
      .workers
      .values()
      .filter(|w| !w.stop_token.is_cancelled())
      .count()
  }
}

/// Everything needed to spawn a worker, cloned wherever workers are started
/// (construction, resize, supervisor replacement). Deliberately holds no
/// reference back to the manager so worker and supervisor tasks never keep
/// the manager alive.
struct WorkerDeps<R: Send + 'static> {
  pool_name: Arc<String>,
  tokio_handle: TokioHandle,
  queue_rx: QueueConsumer<R>,
  halt_token: CancellationToken,
  exit_tx: mpsc::UnboundedSender<WorkerExit>,
  completion_tx: CompletionSink,
}

impl<R: Send + 'static> Clone for WorkerDeps<R> {
  fn clone(&self) -> Self {
    Self {
      pool_name: self.pool_name.clone(),
      tokio_handle: self.tokio_handle.clone(),
      queue_rx: self.queue_rx.clone(),
      halt_token: self.halt_token.clone(),
      exit_tx: self.exit_tx.clone(),
      completion_tx: self.completion_tx.clone(),
    }
  }
}

/// Spawns one worker onto the runtime and registers it in the core.
///
/// The spawn wrapper catch-unwinds the whole loop so that a panic in the
/// worker's own machinery (task panics are caught separately, per task) still
/// produces an exit notice for the supervisor instead of a silent leak.
fn start_worker<R: Send + 'static>(deps: &WorkerDeps<R>, core: &mut PoolCore) -> u64 {
  let worker_id = NEXT_WORKER_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
  let stop_token = deps.halt_token.child_token();
  let state = Arc::new(WorkerStateCell::new());

  let ctx = WorkerContext {
    worker_id,
    pool_name: deps.pool_name.clone(),
    queue: deps.queue_rx.clone(),
    stop_token: stop_token.clone(),
    state: state.clone(),
    completion_tx: deps.completion_tx.clone(),
  };

  let exit_tx = deps.exit_tx.clone();
  let state_for_exit = state.clone();
  let pool_name_for_exit = deps.pool_name.clone();
  let span = info_span!("pool_worker", pool_name = %*deps.pool_name, worker_id);

  let join_handle = deps.tokio_handle.spawn(
    async move {
      let panicked = AssertUnwindSafe(run_worker_loop(ctx)).catch_unwind().await.is_err();
      if panicked {
        error!(
          pool_name = %*pool_name_for_exit,
          worker_id,
          "Worker loop panicked outside of task execution."
        );
        state_for_exit.set(WorkerState::Stopped);
      }
      // Best effort: the supervisor may already be gone during teardown.
      let _ = exit_tx.send(WorkerExit { worker_id, panicked });
    }
    .instrument(span),
  );

  core.workers.insert(
    worker_id,
    WorkerEntry {
      stop_token,
      state,
      _join: join_handle,
    },
  );
  worker_id
}

/// A dynamically resizable pool of workers executing futures from a shared
/// FIFO queue.
///
/// The pool is an explicit value: clone the returned `Arc` to share it. It is
/// generic over the task result type `R`; fallible tasks put their own error
/// type inside `R`.
pub struct WorkerPoolManager<R: Send + 'static> {
  pool_name: Arc<String>,
  core: Arc<Mutex<PoolCore>>,
  queue_tx: QueueProducer<R>,
  deps: WorkerDeps<R>,
  halt_token: CancellationToken,
  control_token: CancellationToken,
  membership: Arc<Notify>,
  notifier: Arc<CompletionNotifier>,
  supervisor_join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Send + 'static> WorkerPoolManager<R> {
  /// Creates a pool with `initial_workers` workers.
  ///
  /// `queue_capacity: Some(n)` bounds the task queue at `n.max(1)` entries so
  /// that `submit` exerts back-pressure and `try_submit` can fail with
  /// `QueueFull`; `None` leaves the queue unbounded. `initial_workers` may be
  /// zero: tasks are then accepted and parked until a later `resize`.
  pub fn new(
    initial_workers: usize,
    queue_capacity: Option<usize>,
    tokio_handle: TokioHandle,
    pool_name: &str,
  ) -> Arc<Self> {
    let pool_name = Arc::new(pool_name.to_string());
    let (queue_tx, queue_rx) = TaskQueue::new(queue_capacity).split();
    let halt_token = CancellationToken::new();
    let control_token = CancellationToken::new();
    let membership = Arc::new(Notify::new());
    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    let (notifier, completion_tx) = CompletionNotifier::new(tokio_handle.clone(), pool_name.clone());

    let deps = WorkerDeps {
      pool_name: pool_name.clone(),
      tokio_handle: tokio_handle.clone(),
      queue_rx,
      halt_token: halt_token.clone(),
      exit_tx,
      completion_tx,
    };

    let core = Arc::new(Mutex::new(PoolCore {
      state: PoolState::Running,
      target_workers: initial_workers,
      workers: BTreeMap::new(),
    }));

    {
      let mut core_guard = core.lock();
      for _ in 0..initial_workers {
        start_worker(&deps, &mut core_guard);
      }
    }

    let supervisor_join_handle = tokio_handle.spawn(
      Self::run_supervisor_loop(
        deps.clone(),
        core.clone(),
        exit_rx,
        control_token.clone(),
        membership.clone(),
      )
      .instrument(info_span!("pool_supervisor", pool_name = %*pool_name)),
    );

    info!(pool_name = %*pool_name, initial_workers, "Worker pool started.");

    Arc::new(Self {
      pool_name,
      core,
      queue_tx,
      deps,
      halt_token,
      control_token,
      membership,
      notifier,
      supervisor_join_handle: Mutex::new(Some(supervisor_join_handle)),
    })
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn pool_state(&self) -> PoolState {
    self.core.lock().state
  }

  /// Number of workers currently eligible to pull tasks. Workers still
  /// draining out after a shrink are not counted.
  pub fn current_worker_count(&self) -> usize {
    self.core.lock().live_worker_count()
  }

  pub fn target_worker_count(&self) -> usize {
    self.core.lock().target_workers
  }

  /// Number of tasks accepted but not yet pulled by any worker.
  pub fn pending_task_count(&self) -> usize {
    self.queue_tx.len()
  }

  /// Snapshot of `(worker_id, state)` pairs, including workers that are still
  /// draining out after a shrink.
  pub fn worker_states(&self) -> Vec<(u64, WorkerState)> {
    self
      .core
      .lock()
      .workers
      .iter()
      .map(|(worker_id, entry)| (*worker_id, entry.state.get()))
      .collect()
  }

  /// Registers a callback invoked once per task completion (success, panic or
  /// shutdown rejection). Only completions after the first registration are
  /// reported. Handlers run on pool-spawned tasks and must not block or call
  /// back into the pool's mutating operations.
  pub fn add_completion_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.notifier.add_handler(handler);
  }

  fn make_task(&self, task_future: TaskToExecute<R>) -> (QueuedTask<R>, TaskHandle<R>) {
    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let (outcome_tx, outcome_rx) = oneshot::channel::<Result<R, PoolError>>();
    (
      QueuedTask {
        task_id,
        future: task_future,
        outcome_tx: Some(outcome_tx),
        #[cfg(test)]
        crash_worker_loop: false,
      },
      TaskHandle {
        task_id,
        outcome_rx: Some(outcome_rx),
      },
    )
  }

  /// Wraps `task_future` in a task, enqueues it and returns a handle to its
  /// eventual outcome. Waits for a free slot when the queue is bounded and
  /// full.
  ///
  /// # Errors
  /// `PoolError::PoolClosed` once shutdown has begun.
  pub async fn submit(&self, task_future: TaskToExecute<R>) -> Result<TaskHandle<R>, PoolError> {
    if self.pool_state() != PoolState::Running {
      warn!(pool_name = %*self.pool_name, "Submit: Attempted to submit task to a pool that is not running.");
      return Err(PoolError::PoolClosed);
    }

    let (task, handle) = self.make_task(task_future);
    debug!(pool_name = %*self.pool_name, task_id = %handle.task_id, "Submitting task to queue.");
    self.queue_tx.send(task).await?;
    Ok(handle)
  }

  /// Non-blocking variant of [`submit`](Self::submit): fails with
  /// `PoolError::QueueFull` instead of waiting when a bounded queue is at
  /// capacity.
  pub fn try_submit(&self, task_future: TaskToExecute<R>) -> Result<TaskHandle<R>, PoolError> {
    if self.pool_state() != PoolState::Running {
      warn!(pool_name = %*self.pool_name, "Submit: Attempted to submit task to a pool that is not running.");
      return Err(PoolError::PoolClosed);
    }

    let (task, handle) = self.make_task(task_future);
    match self.queue_tx.try_send(task) {
      Ok(()) => Ok(handle),
      Err((task, error)) => {
        debug!(
          pool_name = %*self.pool_name,
          task_id = %task.task_id,
          %error,
          "Non-blocking submit rejected."
        );
        Err(error)
      }
    }
  }

  /// Sets the target worker count and converges toward it without blocking.
  ///
  /// Growing spawns workers that immediately compete for the queue head.
  /// Shrinking signals the **most recently started** live workers to stop;
  /// each finishes the task it already holds (never requeued), and the
  /// supervisor removes it from the worker set once its exit is confirmed.
  /// `new_target` may be zero, which parks queued tasks until a later grow.
  ///
  /// # Errors
  /// `PoolError::PoolClosed` once shutdown has begun.
  pub fn resize(&self, new_target: usize) -> Result<(), PoolError> {
    {
      let mut core = self.core.lock();
      if core.state != PoolState::Running {
        warn!(pool_name = %*self.pool_name, "Resize: Attempted to resize a pool that is not running.");
        return Err(PoolError::PoolClosed);
      }

      core.target_workers = new_target;
      let live = core.live_worker_count();

      if new_target > live {
        let to_start = new_target - live;
        for _ in 0..to_start {
          start_worker(&self.deps, &mut core);
        }
        info!(pool_name = %*self.pool_name, new_target, started = to_start, "Resize: grew worker set.");
      } else if new_target < live {
        let victims: Vec<u64> = core
          .workers
          .iter()
          .rev()
          .filter(|(_, entry)| !entry.stop_token.is_cancelled())
          .map(|(worker_id, _)| *worker_id)
          .take(live - new_target)
          .collect();
        for worker_id in &victims {
          if let Some(entry) = core.workers.get(worker_id) {
            entry.stop_token.cancel();
          }
        }
        info!(
          pool_name = %*self.pool_name,
          new_target,
          stopping = victims.len(),
          "Resize: shrinking worker set."
        );
      } else {
        debug!(pool_name = %*self.pool_name, new_target, "Resize: already at target size.");
      }
    }

    self.membership.notify_waiters();
    Ok(())
  }

  /// Blocking variant of [`resize`](Self::resize): returns once the worker
  /// set has settled at the current target (every signaled worker's exit has
  /// been confirmed and no extra workers remain).
  pub async fn resize_and_wait(&self, new_target: usize) -> Result<(), PoolError> {
    self.resize(new_target)?;
    self
      .await_converged(|core| {
        core.workers.len() == core.target_workers
          && core.workers.values().all(|entry| !entry.stop_token.is_cancelled())
      })
      .await;
    Ok(())
  }

  /// Waits on the membership signal until `converged` observes a satisfied
  /// core. The notified-enable pattern closes the check-then-wait race with
  /// the supervisor's `notify_waiters`.
  async fn await_converged<F: Fn(&PoolCore) -> bool>(&self, converged: F) {
    let mut notified = pin!(self.membership.notified());
    loop {
      notified.as_mut().enable();
      let done = {
        let core = self.core.lock();
        converged(&*core)
      };
      if done {
        break;
      }
      notified.as_mut().await;
      notified.set(self.membership.notified());
    }
  }

  /// Shuts the pool down and blocks until it reaches `Stopped`.
  ///
  /// Both modes stop accepting submissions immediately. `Graceful` lets the
  /// live workers drain and execute every queued task first; `Immediate`
  /// signals all workers to stop pulling (the task each already holds still
  /// runs to completion) and resolves still-queued tasks' handles with
  /// `PoolError::PoolClosed`.
  ///
  /// Calling `shutdown` on an already stopped pool is a no-op; a concurrent
  /// call waits for the shutdown in flight, and an `Immediate` call escalates
  /// a graceful drain already in progress.
  pub async fn shutdown(&self, mode: ShutdownMode) -> Result<(), PoolError> {
    let first_call = {
      let mut core = self.core.lock();
      match core.state {
        PoolState::Stopped => {
          info!(pool_name = %*self.pool_name, "Shutdown: pool already stopped; nothing to do.");
          return Ok(());
        }
        PoolState::Draining => false,
        PoolState::Running => {
          core.state = PoolState::Draining;
          core.target_workers = 0;
          true
        }
      }
    };

    if first_call {
      info!(pool_name = %*self.pool_name, ?mode, "Initiating pool shutdown. Queue closed to new submissions.");
      self.queue_tx.close();
    } else {
      info!(pool_name = %*self.pool_name, ?mode, "Shutdown already in progress; waiting for it to finish.");
    }

    if mode == ShutdownMode::Immediate {
      self.halt_token.cancel();
    }

    self.await_converged(|core| core.workers.is_empty()).await;

    // No worker remains and none will be started again, so whatever is still
    // queued can never run. Resolve those handles rather than leaving callers
    // waiting forever. In a graceful drain with live workers the queue is
    // already empty at this point.
    let mut rejected = 0usize;
    while let Some(task) = self.deps.queue_rx.try_recv() {
      let task_id = task.task_id;
      self.deps.completion_tx.publish(InternalCompletionMessage {
        task_id,
        pool_name: self.pool_name.clone(),
        status: TaskCompletionStatus::Rejected,
      });
      task.reject(PoolError::PoolClosed);
      rejected += 1;
      debug!(pool_name = %*self.pool_name, %task_id, "Rejected task left in queue at shutdown.");
    }
    if rejected > 0 {
      info!(pool_name = %*self.pool_name, rejected, "Resolved abandoned queued tasks with PoolClosed.");
    }

    {
      self.core.lock().state = PoolState::Stopped;
    }

    // Let the notifier drain its channel before reporting Stopped, then stop
    // the supervisor.
    self.deps.completion_tx.close();
    self.notifier.await_shutdown().await;
    self.control_token.cancel();

    let supervisor_handle = { self.supervisor_join_handle.lock().take() };
    if let Some(handle) = supervisor_handle {
      if let Err(join_error) = handle.await {
        error!(
          pool_name = %*self.pool_name,
          "Error joining supervisor loop during shutdown: {:?}", join_error
        );
      }
    }

    info!(pool_name = %*self.pool_name, "Pool shutdown complete.");
    Ok(())
  }

  /// Consumes worker exit notices: removes confirmed exits from the worker
  /// set, starts a replacement when a worker died of an internal panic while
  /// the pool is running below target, and wakes membership waiters.
  async fn run_supervisor_loop(
    deps: WorkerDeps<R>,
    core: Arc<Mutex<PoolCore>>,
    mut exit_rx: mpsc::UnboundedReceiver<WorkerExit>,
    control_token: CancellationToken,
    membership: Arc<Notify>,
  ) {
    info!("Supervisor loop started.");

    loop {
      let exit = tokio::select! {
        biased;

        _ = control_token.cancelled() => break,

        notice = exit_rx.recv() => match notice {
          Some(exit) => exit,
          None => break,
        },
      };

      {
        let mut core_guard = core.lock();
        core_guard.workers.remove(&exit.worker_id);

        if exit.panicked
          && core_guard.state == PoolState::Running
          && core_guard.live_worker_count() < core_guard.target_workers
        {
          let replacement_id = start_worker(&deps, &mut core_guard);
          warn!(
            worker_id = exit.worker_id,
            replacement_id,
            "Worker exited after an internal panic; started a replacement to restore the target count."
          );
        } else {
          debug!(worker_id = exit.worker_id, "Worker exit confirmed; removed from worker set.");
        }
      }
      membership.notify_waiters();
    }

    info!("Supervisor loop stopped.");
  }
}

#[cfg(test)]
impl<R: Send + 'static> WorkerPoolManager<R> {
  /// Enqueues a marker that makes the worker dequeuing it panic inside its
  /// loop, outside task execution.
  fn inject_worker_loop_fault(&self) {
    let (mut task, _handle) = self.make_task(Box::pin(async { unreachable!() }));
    task.crash_worker_loop = true;
    self
      .queue_tx
      .try_send(task)
      .map_err(|(_task, error)| error)
      .expect("Fault marker enqueue failed");
  }
}

impl<R: Send + 'static> Drop for WorkerPoolManager<R> {
  fn drop(&mut self) {
    let state = self.core.lock().state;
    if state != PoolState::Stopped {
      // Signal everything and return; Drop must not block on workers.
      info!(
        pool_name = %*self.pool_name,
        "WorkerPoolManager dropped without explicit shutdown. Signaling workers to stop and closing the queue."
      );
      self.halt_token.cancel();
      self.queue_tx.close();
      self.control_token.cancel();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_worker_replaced_after_internal_panic() {
    let manager = WorkerPoolManager::<usize>::new(
      1,
      None,
      TokioHandle::current(),
      "test_manager_worker_replacement",
    );
    let victim_id = manager.worker_states()[0].0;

    manager.inject_worker_loop_fault();
    manager
      .await_converged(|core| {
        core.live_worker_count() == 1 && !core.workers.contains_key(&victim_id)
      })
      .await;

    // The replacement worker serves tasks as usual.
    let handle = manager.submit(Box::pin(async { 7usize })).await.unwrap();
    assert_eq!(handle.await_result().await, Ok(7));

    manager.shutdown(ShutdownMode::Graceful).await.unwrap();
  }

  #[tokio::test]
  async fn test_completions_without_handlers_are_not_buffered() {
    let manager = WorkerPoolManager::<usize>::new(
      2,
      None,
      TokioHandle::current(),
      "test_manager_completion_sink_gating",
    );

    for i in 0..100usize {
      let handle = manager.submit(Box::pin(async move { i })).await.unwrap();
      assert_eq!(handle.await_result().await, Ok(i));
    }
    // No handler was ever registered, so completions must not pile up in the
    // internal completion channel.
    assert_eq!(manager.deps.completion_tx.buffered(), 0);

    manager.shutdown(ShutdownMode::Graceful).await.unwrap();
  }
}
