use crate::error::PoolError;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Once};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, Instrument};

// --- Public Event Structs for Handlers ---

/// Terminal status of a task as seen by completion handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  /// The task future ran to completion and produced a value.
  Success,
  /// The task future panicked; its handle resolves to `PoolError::TaskPanicked`.
  Panicked,
  /// The task was abandoned in the queue at shutdown; its handle resolves to
  /// `PoolError::PoolClosed`.
  Rejected,
}

impl<R> From<&Result<R, PoolError>> for TaskCompletionStatus {
  fn from(result: &Result<R, PoolError>) -> Self {
    match result {
      Ok(_) => TaskCompletionStatus::Success,
      Err(PoolError::TaskPanicked) => TaskCompletionStatus::Panicked,
      Err(_) => TaskCompletionStatus::Rejected,
    }
  }
}

/// Event delivered to registered completion handlers.
///
/// Handlers execute on pool-spawned tasks, off the worker that produced the
/// outcome. They must not block for long and must not call back into the
/// pool's mutating operations; use the handle returned by `submit` for
/// outcome values.
#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: u64,
  pub pool_name: Arc<String>,
  pub status: TaskCompletionStatus,
  pub completion_time: SystemTime,
}

// --- Internal Message (crate-public) ---

#[derive(Debug)]
pub(crate) struct InternalCompletionMessage {
  pub(crate) task_id: u64,
  pub(crate) pool_name: Arc<String>,
  pub(crate) status: TaskCompletionStatus,
}

pub(crate) type CompletionReceiver = async_channel::Receiver<InternalCompletionMessage>;

/// Producer side of the completion channel, shared by workers and the
/// controller's shutdown rejection path.
///
/// Publishing is gated on the dispatch loop having been started: until the
/// first handler is registered nothing drains the channel, so the sink
/// discards events instead of letting them accumulate for the pool's
/// lifetime.
#[derive(Clone)]
pub(crate) struct CompletionSink {
  tx: async_channel::Sender<InternalCompletionMessage>,
  dispatch_started: Arc<AtomicBool>,
}

impl CompletionSink {
  pub(crate) fn publish(&self, message: InternalCompletionMessage) {
    if !self.dispatch_started.load(AtomicOrdering::Acquire) {
      return;
    }
    // Unbounded channel: failure only means the channel is already closed.
    let _ = self.tx.try_send(message);
  }

  pub(crate) fn close(&self) {
    let _ = self.tx.close();
  }

  #[cfg(test)]
  pub(crate) fn buffered(&self) -> usize {
    self.tx.len()
  }
}

// --- CompletionNotifier Struct ---

type HandlerList = Arc<RwLock<Vec<Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>>>>;

struct NotifierInternalState {
  internal_rx_for_init: Option<CompletionReceiver>,
  tokio_handle: TokioHandle,
  pool_name_for_logging: Arc<String>,
  worker_join_handle: Option<JoinHandle<()>>,
}

/// Fans completion events out to registered handlers.
///
/// The dispatch loop is only spawned once the first handler is added. Until
/// then the [`CompletionSink`] discards events, so a pool whose caller never
/// subscribes buffers nothing.
pub(crate) struct CompletionNotifier {
  handlers: HandlerList,
  init_once: Once,
  dispatch_started: Arc<AtomicBool>,
  internal_state_for_init: Mutex<NotifierInternalState>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.handlers.try_read().map_or(0, |guard| guard.len());
    f.debug_struct("CompletionNotifier")
      .field("handler_count", &handler_count)
      .field("initialized", &self.init_once.is_completed())
      .finish_non_exhaustive()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(
    tokio_handle: TokioHandle,
    pool_name_for_logging: Arc<String>,
  ) -> (Arc<Self>, CompletionSink) {
    let (tx, internal_rx) = async_channel::unbounded();
    let dispatch_started = Arc::new(AtomicBool::new(false));
    let notifier = Arc::new(Self {
      handlers: Arc::new(RwLock::new(Vec::new())),
      init_once: Once::new(),
      dispatch_started: dispatch_started.clone(),
      internal_state_for_init: Mutex::new(NotifierInternalState {
        internal_rx_for_init: Some(internal_rx),
        tokio_handle,
        pool_name_for_logging,
        worker_join_handle: None,
      }),
    });
    let sink = CompletionSink { tx, dispatch_started };
    (notifier, sink)
  }

  fn ensure_dispatch_loop_started(&self) {
    self.init_once.call_once(|| {
      let mut state_guard = self.internal_state_for_init.lock();
      if let Some(rx_to_use) = state_guard.internal_rx_for_init.take() {
        info!(
          pool_name = %*state_guard.pool_name_for_logging,
          "First completion handler added. Starting notification dispatch loop."
        );

        let dispatch_handlers = self.handlers.clone();
        let dispatch_tokio_handle = state_guard.tokio_handle.clone();
        let dispatch_pool_name = state_guard.pool_name_for_logging.clone();

        let join_handle = state_guard.tokio_handle.spawn(
          Self::run_dispatch_loop(rx_to_use, dispatch_handlers, dispatch_tokio_handle)
            .instrument(info_span!("completion_dispatch_loop", pool_name = %*dispatch_pool_name)),
        );
        state_guard.worker_join_handle = Some(join_handle);
        self.dispatch_started.store(true, AtomicOrdering::Release);
      }
    });
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.ensure_dispatch_loop_started();

    let pool_name_for_logging = {
      let state_guard = self.internal_state_for_init.lock();
      state_guard.pool_name_for_logging.clone()
    };

    let mut handlers_guard = self.handlers.write();
    handlers_guard.push(Arc::new(handler));
    info!(
      pool_name = %*pool_name_for_logging,
      "Notifier: Added completion handler. Total handlers: {}",
      handlers_guard.len()
    );
  }

  async fn run_dispatch_loop(
    queue_rx: CompletionReceiver,
    handlers_list_arc: HandlerList,
    tokio_handle_for_handlers: TokioHandle,
  ) {
    info!("Notification dispatch loop started. Runs until the completion channel is closed and drained.");

    while let Ok(message) = queue_rx.recv().await {
      trace!(task_id = %message.task_id, "Dispatching completion notification.");

      let handlers_guard = handlers_list_arc.read();
      if handlers_guard.is_empty() {
        trace!(task_id = %message.task_id, "No completion handlers registered, dropping notification.");
        continue;
      }

      let public_info = TaskCompletionInfo {
        task_id: message.task_id,
        pool_name: message.pool_name.clone(),
        status: message.status,
        completion_time: SystemTime::now(),
      };

      debug!(
        task_id = %public_info.task_id,
        "Dispatching notification to {} handlers.",
        handlers_guard.len()
      );

      for handler_arc in handlers_guard.iter() {
        let handler = handler_arc.clone();
        let info_for_handler = public_info.clone();

        tokio_handle_for_handlers.spawn(async move {
          let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler(info_for_handler.clone());
          }));
          if result.is_err() {
            error!(
              "A completion handler panicked. Pool: {}, Task ID: {}",
              info_for_handler.pool_name, info_for_handler.task_id
            );
          }
        });
      }
    }

    info!("Notification dispatch loop stopped (completion channel closed and drained).");
  }

  /// Waits for the dispatch loop to drain and exit. A no-op if no handler was
  /// ever registered.
  pub(crate) async fn await_shutdown(&self) {
    let (handle_option, pool_name) = {
      let mut guard = self.internal_state_for_init.lock();
      let handle = guard.worker_join_handle.take();
      let name = guard.pool_name_for_logging.clone();
      (handle, name)
    };

    if let Some(handle) = handle_option {
      info!(pool_name = %*pool_name, "Notifier: Waiting for dispatch loop to join.");
      if let Err(e) = handle.await {
        error!(pool_name = %*pool_name, "Notifier: Error joining dispatch loop: {:?}", e);
      } else {
        debug!(pool_name = %*pool_name, "Notifier: Dispatch loop successfully joined.");
      }
    } else {
      trace!(pool_name = %*pool_name, "Notifier: Dispatch loop was never started or handle already taken.");
    }
  }
}
