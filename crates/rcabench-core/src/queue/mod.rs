//! Queue engine: admission, retry policy, scheduler, shared task context.

pub mod admission;
pub mod retry;
pub mod scheduler;

pub use admission::{Admission, GroupReceipt, SubmitReceipt};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, WorkerGroup};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

use crate::domain::{CoreError, TaskId};
use crate::ports::kv_store::KvStore;
use crate::store::keys;

/// Cooperative cancellation handed to every handler invocation.
///
/// Two signals feed it: the global shutdown channel and the per-task cancel
/// channel. Handlers poll `is_cancelled` between steps or await
/// `cancelled` inside a `select!`; nothing is forcibly terminated.
pub struct TaskContext {
    shutdown: watch::Receiver<bool>,
    cancel: watch::Receiver<bool>,
    // Keeps detached contexts (tests, standalone handler calls) alive.
    _guards: Option<(watch::Sender<bool>, watch::Sender<bool>)>,
}

impl TaskContext {
    pub fn new(shutdown: watch::Receiver<bool>, cancel: watch::Receiver<bool>) -> Self {
        Self {
            shutdown,
            cancel,
            _guards: None,
        }
    }

    /// A context that never fires. For handler tests and one-off calls.
    pub fn detached() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            shutdown: shutdown_rx,
            cancel: cancel_rx,
            _guards: Some((shutdown_tx, cancel_tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow() || *self.cancel.borrow()
    }

    /// Resolves when either signal fires.
    pub async fn cancelled(&mut self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone: treat as shutdown.
                        return;
                    }
                }
                changed = self.cancel.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// In-flight cancellation requests, keyed by task.
///
/// The scheduler registers a task when it starts running and deregisters it
/// afterwards; `Admission::cancel` requests through here when the task is
/// no longer in any queue.
#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<HashMap<TaskId, watch::Sender<bool>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: TaskId) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.inner.lock().expect("cancel registry poisoned").insert(task_id, tx);
        rx
    }

    pub fn deregister(&self, task_id: TaskId) {
        self.inner.lock().expect("cancel registry poisoned").remove(&task_id);
    }

    /// Request cancellation of a running task. Returns whether the task was
    /// registered (i.e. currently in flight).
    pub fn request(&self, task_id: TaskId) -> bool {
        let inner = self.inner.lock().expect("cancel registry poisoned");
        match inner.get(&task_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }
}

/// Queue depth snapshot for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueCounts {
    pub ready: usize,
    pub delayed: usize,
    pub dead: usize,
    pub in_flight: i64,
}

pub async fn queue_counts(store: &dyn KvStore) -> Result<QueueCounts, CoreError> {
    Ok(QueueCounts {
        ready: store.list_len(keys::READY).await?,
        delayed: store.zset_len(keys::DELAYED).await?,
        dead: store.zset_len(keys::DEAD).await?,
        in_flight: store.counter_get(keys::CONCURRENCY_LOCK).await?,
    })
}
