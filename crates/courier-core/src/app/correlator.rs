//! Correlator - 非同期モードでの TaskResponse と呼び出し元の対応付け
//!
//! Each dispatched `(task_id, worker_id)` pair owns a one-shot completion slot.
//! Lookup and removal of a slot happen under one lock acquisition, so a
//! duplicated response can never be delivered twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{DispatchError, TaskId, TaskResponse, WorkerId};

type Slot = oneshot::Sender<Result<TaskResponse, DispatchError>>;

/// Cap for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

struct PendingEntry {
    slot: Slot,
    deadline: Instant,
}

pub struct Correlator {
    pending: Mutex<HashMap<(TaskId, WorkerId), PendingEntry>>,
    timeout: Duration,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a slot for a response to `task` from `worker`.
    ///
    /// Must be called before the task is sent, so a fast reply always finds it.
    pub async fn register(self: &Arc<Self>, task: TaskId, worker: WorkerId) -> PendingResponse {
        let (slot, rx) = oneshot::channel();
        let deadline = deadline_after(self.timeout);
        self.pending
            .lock()
            .await
            .insert((task, worker), PendingEntry { slot, deadline });

        PendingResponse {
            task,
            worker,
            rx,
            deadline,
            timeout: self.timeout,
            correlator: Some(Arc::clone(self)),
        }
    }

    /// Route an inbound response from `worker` to its waiting caller.
    ///
    /// Returns `false` when no slot matches (unknown, already delivered, or
    /// abandoned); the response is then discarded.
    pub async fn complete(&self, worker: WorkerId, response: TaskResponse) -> bool {
        let task = response.task_id;
        let entry = self.pending.lock().await.remove(&(task, worker));
        match entry {
            Some(entry) => {
                if entry.slot.send(Ok(response)).is_err() {
                    debug!(task = %task, worker = %worker, "caller no longer waiting");
                }
                true
            }
            None => {
                warn!(task = %task, worker = %worker, "discarding response with no pending task");
                false
            }
        }
    }

    /// Drop a slot without resolving it (send failed, or caller timed out).
    pub async fn abandon(&self, task: TaskId, worker: WorkerId) {
        self.pending.lock().await.remove(&(task, worker));
    }

    /// Resolve every slot waiting on `worker` with `ConnectionLost`.
    pub async fn fail_worker(&self, worker: WorkerId) -> usize {
        let failed: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().await;
            let keys: Vec<(TaskId, WorkerId)> = pending
                .keys()
                .filter(|(_, w)| *w == worker)
                .copied()
                .collect();
            keys.iter().filter_map(|key| pending.remove(key)).collect()
        };

        let count = failed.len();
        for entry in failed {
            let _ = entry.slot.send(Err(DispatchError::ConnectionLost(worker)));
        }
        if count > 0 {
            debug!(worker = %worker, count, "pending responses failed");
        }
        count
    }

    /// Resolve every slot with `Cancelled` (shutdown).
    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            let _ = entry.slot.send(Err(DispatchError::Cancelled));
        }
        count
    }

    /// Expire slots past their deadline and forget slots whose caller is gone.
    pub async fn reap(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<((TaskId, WorkerId), PendingEntry)> = {
            let mut pending = self.pending.lock().await;
            let keys: Vec<(TaskId, WorkerId)> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now || entry.slot.is_closed())
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        let count = expired.len();
        for ((task, _), entry) in expired {
            let _ = entry.slot.send(Err(DispatchError::Timeout {
                task,
                after: self.timeout,
            }));
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Handle a caller awaits for one worker's response to one task.
///
/// Dropping it is fine: the slot is reclaimed by the reaper or when the
/// response arrives.
#[derive(Debug)]
pub struct PendingResponse {
    task: TaskId,
    worker: WorkerId,
    rx: oneshot::Receiver<Result<TaskResponse, DispatchError>>,
    deadline: Instant,
    timeout: Duration,
    correlator: Option<Arc<Correlator>>,
}

impl PendingResponse {
    /// A slot resolved directly by the sender side instead of the correlator
    /// (synchronous exchanges).
    pub(crate) fn detached(task: TaskId, worker: WorkerId, timeout: Duration) -> (Slot, Self) {
        let (slot, rx) = oneshot::channel();
        let pending = Self {
            task,
            worker,
            rx,
            deadline: deadline_after(timeout),
            timeout,
            correlator: None,
        };
        (slot, pending)
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the response, at most until the deadline set at dispatch time.
    pub async fn wait(self) -> Result<TaskResponse, DispatchError> {
        match tokio::time::timeout_at(self.deadline, self.rx).await {
            Ok(Ok(result)) => result,
            // slot dropped without an answer: only shutdown paths do that
            Ok(Err(_)) => Err(DispatchError::Cancelled),
            Err(_) => {
                if let Some(correlator) = &self.correlator {
                    correlator.abandon(self.task, self.worker).await;
                }
                Err(DispatchError::Timeout {
                    task: self.task,
                    after: self.timeout,
                })
            }
        }
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
