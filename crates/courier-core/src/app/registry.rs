//! WorkerRegistry - 接続中 worker の登録と管理
//!
//! The registry owns the only shared mutable state of the controller: the
//! worker list and both id counters, all behind one lock. The lock is held for
//! the mutation or the snapshot copy only, never across channel I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tracing::{debug, info};

use crate::domain::{ChannelError, Message, TaskId, WorkerId};
use crate::ports::{Channel, SelectionStrategy};

/// A live connection to a remote executor.
///
/// Cloning is cheap and yields a handle to the same connection; the registry
/// hands out clones as snapshots.
#[derive(Clone)]
pub struct Worker {
    id: WorkerId,
    channel: Arc<dyn Channel>,
    alive: Arc<AtomicBool>,
    /// Synchronous mode: `true` while a send -> reply exchange is in flight.
    in_flight: Arc<watch::Sender<bool>>,
    /// Synchronous mode: whoever holds it owns the receive side.
    reader: Arc<Mutex<()>>,
    connected_at: DateTime<Utc>,
}

/// A claimed exchange slot. Owns the receive side until dropped.
pub(crate) struct Exchange {
    _reader: OwnedMutexGuard<()>,
    _claim: Claim,
}

struct Claim(Arc<watch::Sender<bool>>);

impl Drop for Claim {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl Worker {
    fn new(id: WorkerId, channel: Arc<dyn Channel>) -> Self {
        Self {
            id,
            channel,
            alive: Arc::new(AtomicBool::new(true)),
            in_flight: Arc::new(watch::channel(false).0),
            reader: Arc::new(Mutex::new(())),
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Send one message. A failure marks the worker dead; removing it from the
    /// registry is the caller's job.
    pub async fn send(&self, message: Message) -> Result<(), ChannelError> {
        let result = self.channel.send(message).await;
        if result.is_err() {
            self.mark_dead();
        }
        result
    }

    /// Claim the exchange slot. `None` if an exchange is already in flight on
    /// this worker; otherwise waits for the idle watcher to hand over the
    /// receive side.
    pub(crate) async fn begin_exchange(&self) -> Option<Exchange> {
        let claimed = self.in_flight.send_if_modified(|busy| {
            if *busy {
                return false;
            }
            *busy = true;
            true
        });
        if !claimed {
            return None;
        }
        let claim = Claim(Arc::clone(&self.in_flight));
        let reader = Arc::clone(&self.reader).lock_owned().await;
        Some(Exchange {
            _reader: reader,
            _claim: claim,
        })
    }

    pub(crate) fn exchange_state(&self) -> watch::Receiver<bool> {
        self.in_flight.subscribe()
    }

    /// Take the receive side while no exchange runs.
    pub(crate) async fn lock_reader(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.reader).lock_owned().await
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("peer", &self.channel.peer())
            .field("alive", &self.is_alive())
            .finish()
    }
}

struct RegistryState {
    /// Connection order. `pick_one` relies on it.
    workers: Vec<Worker>,
    next_worker_id: u64,
    next_task_id: u64,
}

impl RegistryState {
    fn new() -> Self {
        Self {
            workers: Vec::new(),
            next_worker_id: 1,
            next_task_id: 1,
        }
    }

    fn allocate_worker_id(&mut self) -> WorkerId {
        let id = WorkerId::new(self.next_worker_id);
        self.next_worker_id += 1;
        id
    }

    fn allocate_task_id(&mut self) -> TaskId {
        let id = TaskId::new(self.next_task_id);
        self.next_task_id += 1;
        id
    }
}

pub struct WorkerRegistry {
    state: Mutex<RegistryState>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::new()),
        }
    }

    /// Wrap `channel` in a live Worker and insert it.
    ///
    /// Worker ids are never reused, even after the worker disconnects.
    pub async fn register(&self, channel: Arc<dyn Channel>) -> Worker {
        let worker = {
            let mut state = self.state.lock().await;
            let id = state.allocate_worker_id();
            let worker = Worker::new(id, channel);
            state.workers.push(worker.clone());
            worker
        };
        info!(worker = %worker.id(), peer = %worker.channel().peer(), "worker connected");
        worker
    }

    /// Remove a worker. Removing an unknown id is a no-op.
    pub async fn unregister(&self, id: WorkerId) -> Option<Worker> {
        let removed = {
            let mut state = self.state.lock().await;
            let index = state.workers.iter().position(|w| w.id() == id)?;
            state.workers.remove(index)
        };
        removed.mark_dead();
        info!(worker = %id, "worker removed");
        Some(removed)
    }

    pub async fn get(&self, id: WorkerId) -> Option<Worker> {
        let state = self.state.lock().await;
        state
            .workers
            .iter()
            .find(|w| w.id() == id && w.is_alive())
            .cloned()
    }

    /// Point-in-time snapshot of the live workers, in connection order.
    pub async fn list(&self) -> Vec<Worker> {
        let state = self.state.lock().await;
        state
            .workers
            .iter()
            .filter(|w| w.is_alive())
            .cloned()
            .collect()
    }

    pub async fn pick_one(&self, strategy: &dyn SelectionStrategy) -> Option<Worker> {
        let state = self.state.lock().await;
        let candidates: Vec<WorkerId> = state
            .workers
            .iter()
            .filter(|w| w.is_alive())
            .map(Worker::id)
            .collect();
        let chosen = strategy.select(&candidates)?;
        debug!(worker = %chosen, candidates = candidates.len(), "worker selected");
        state.workers.iter().find(|w| w.id() == chosen).cloned()
    }

    /// Allocate the next task id. Shared by submit and broadcast, so ids are
    /// unique across both.
    pub async fn next_task_id(&self) -> TaskId {
        self.state.lock().await.allocate_task_id()
    }

    /// The most recently assigned task id, if any.
    pub async fn last_task_id(&self) -> Option<TaskId> {
        let next = self.state.lock().await.next_task_id;
        (next > 1).then(|| TaskId::new(next - 1))
    }

    /// Remove every worker at once (shutdown).
    pub async fn drain(&self) -> Vec<Worker> {
        let drained: Vec<Worker> = std::mem::take(&mut self.state.lock().await.workers);
        for worker in &drained {
            worker.mark_dead();
        }
        drained
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.workers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
