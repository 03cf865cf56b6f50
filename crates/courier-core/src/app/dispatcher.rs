//! Dispatcher - task id の採番、送信先の選択、送信
//!
//! Fire-and-forget: a failed send evicts that worker and surfaces
//! `WorkerUnavailable`. Nothing is retried or re-routed to another worker.
//!
//! # 相関モード
//! - **Async**: a completion slot is opened in the [`Correlator`] before the
//!   send; the worker's receive loop resolves it.
//! - **Sync**: the worker's exchange slot is claimed (taking the receive side
//!   over from its idle watcher), the task is sent and a reader task waits for
//!   the reply on the same channel. At most one exchange per worker is in
//!   flight; a second caller gets `WorkerBusy` instead of being queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::correlator::{Correlator, PendingResponse};
use super::registry::{Exchange, Worker, WorkerRegistry};
use crate::config::CorrelationMode;
use crate::domain::{
    DispatchError, Envelope, Message, Task, TaskId, TaskRequest, TaskResponse, WorkerId,
};
use crate::ports::SelectionStrategy;

/// Outcome of a broadcast: one shared task id, per-worker delivery results.
#[derive(Debug)]
pub struct BroadcastReport {
    pub task_id: TaskId,
    pub delivered: Vec<WorkerId>,
    pub failed: Vec<(WorkerId, DispatchError)>,
    /// One awaitable response per delivered worker.
    pub responses: Vec<PendingResponse>,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    correlator: Arc<Correlator>,
    strategy: Arc<dyn SelectionStrategy>,
    mode: CorrelationMode,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        correlator: Arc<Correlator>,
        strategy: Arc<dyn SelectionStrategy>,
        mode: CorrelationMode,
    ) -> Self {
        Self {
            registry,
            correlator,
            strategy,
            mode,
            shutdown_rx: None,
        }
    }

    /// Tie the dispatcher to a controller's shutdown signal: once it flips,
    /// new dispatches and in-flight exchanges end with `Cancelled`.
    pub(crate) fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown_rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    fn timeout(&self) -> Duration {
        self.correlator.timeout()
    }

    /// Send to the first available worker and wait for its response.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskResponse, DispatchError> {
        self.dispatch(request).await?.wait().await
    }

    /// Send to a specific worker and wait for its response.
    pub async fn submit_to(
        &self,
        worker: WorkerId,
        request: TaskRequest,
    ) -> Result<TaskResponse, DispatchError> {
        self.dispatch_to(worker, request).await?.wait().await
    }

    /// Send to the first available worker without waiting for the response.
    pub async fn dispatch(&self, request: TaskRequest) -> Result<PendingResponse, DispatchError> {
        let worker = self
            .registry
            .pick_one(self.strategy.as_ref())
            .await
            .ok_or_else(DispatchError::no_workers)?;
        self.dispatch_on(&worker, request).await
    }

    pub async fn dispatch_to(
        &self,
        worker: WorkerId,
        request: TaskRequest,
    ) -> Result<PendingResponse, DispatchError> {
        let worker = self
            .registry
            .get(worker)
            .await
            .ok_or_else(|| DispatchError::unavailable(worker))?;
        self.dispatch_on(&worker, request).await
    }

    async fn dispatch_on(
        &self,
        worker: &Worker,
        request: TaskRequest,
    ) -> Result<PendingResponse, DispatchError> {
        let task = Task::new(self.registry.next_task_id().await, request);
        let message = task.encode()?;
        let pending = self.deliver(worker, task.id, message).await?;
        info!(task = %task.id, worker = %worker.id(), method = %task.method, path = %task.target, "task sent");
        Ok(pending)
    }

    /// Send the same task (one id) to every connected worker.
    pub async fn broadcast(&self, request: TaskRequest) -> Result<BroadcastReport, DispatchError> {
        self.broadcast_with(move |_| request).await
    }

    /// Like [`broadcast`](Self::broadcast), with the request built from the
    /// assigned id.
    pub async fn broadcast_with<F>(&self, build: F) -> Result<BroadcastReport, DispatchError>
    where
        F: FnOnce(TaskId) -> TaskRequest,
    {
        let workers = self.registry.list().await;
        if workers.is_empty() {
            return Err(DispatchError::no_workers());
        }

        let task_id = self.registry.next_task_id().await;
        let task = Task::new(task_id, build(task_id));
        let message = task.encode()?;

        let mut report = BroadcastReport {
            task_id,
            delivered: Vec::with_capacity(workers.len()),
            failed: Vec::new(),
            responses: Vec::with_capacity(workers.len()),
        };
        for worker in &workers {
            match self.deliver(worker, task_id, message.clone()).await {
                Ok(pending) => {
                    report.delivered.push(worker.id());
                    report.responses.push(pending);
                }
                Err(err) => {
                    warn!(task = %task_id, worker = %worker.id(), error = %err, "broadcast delivery failed");
                    report.failed.push((worker.id(), err));
                }
            }
        }

        info!(
            task = %task_id,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "task broadcast"
        );
        Ok(report)
    }

    async fn deliver(
        &self,
        worker: &Worker,
        task: TaskId,
        message: Message,
    ) -> Result<PendingResponse, DispatchError> {
        if self.is_shutting_down() {
            return Err(DispatchError::Cancelled);
        }
        match self.mode {
            CorrelationMode::Async => {
                let pending = self.correlator.register(task, worker.id()).await;
                // cancel_all / fail_worker may have run before the slot existed
                if self.is_shutting_down() || !worker.is_alive() {
                    self.correlator.abandon(task, worker.id()).await;
                    return Err(self.refused(worker));
                }
                if let Err(err) = worker.send(message).await {
                    warn!(task = %task, worker = %worker.id(), error = %err, "send failed");
                    self.correlator.abandon(task, worker.id()).await;
                    self.evict(worker).await;
                    return Err(DispatchError::unavailable(worker.id()));
                }
                Ok(pending)
            }
            CorrelationMode::Sync => {
                let exchange = worker
                    .begin_exchange()
                    .await
                    .ok_or(DispatchError::WorkerBusy(worker.id()))?;
                if self.is_shutting_down() || !worker.is_alive() {
                    return Err(self.refused(worker));
                }
                if let Err(err) = worker.send(message).await {
                    warn!(task = %task, worker = %worker.id(), error = %err, "send failed");
                    drop(exchange);
                    self.evict(worker).await;
                    return Err(DispatchError::unavailable(worker.id()));
                }

                let (slot, pending) = PendingResponse::detached(task, worker.id(), self.timeout());
                let deadline = pending.deadline();
                let worker = worker.clone();
                let this = self.clone();
                tokio::spawn(async move {
                    let result = this.await_reply(&worker, task, deadline, exchange).await;
                    let _ = slot.send(result);
                });
                Ok(pending)
            }
        }
    }

    /// Synchronous mode: read replies on the worker's channel until one carries
    /// `task`. The exchange guard is held until then.
    async fn await_reply(
        &self,
        worker: &Worker,
        task: TaskId,
        deadline: Instant,
        _exchange: Exchange,
    ) -> Result<TaskResponse, DispatchError> {
        loop {
            let received = tokio::time::timeout_at(deadline, worker.channel().receive()).await;
            let message = match received {
                Err(_) => {
                    return Err(DispatchError::Timeout {
                        task,
                        after: self.timeout(),
                    });
                }
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) | Ok(Err(_)) if self.is_shutting_down() => {
                    return Err(DispatchError::Cancelled);
                }
                Ok(Ok(None)) => {
                    info!(worker = %worker.id(), "worker disconnected");
                    self.evict(worker).await;
                    return Err(DispatchError::ConnectionLost(worker.id()));
                }
                Ok(Err(err)) => {
                    warn!(worker = %worker.id(), error = %err, "receive failed");
                    self.evict(worker).await;
                    return Err(DispatchError::ConnectionLost(worker.id()));
                }
            };

            match TaskResponse::decode(&message) {
                Ok(response) if response.task_id == task => {
                    debug!(task = %task, worker = %worker.id(), status = response.status, "reply received");
                    return Ok(response);
                }
                // 以前タイムアウトした exchange の遅延応答
                Ok(stale) => {
                    warn!(task = %stale.task_id, worker = %worker.id(), expected = %task, "discarding stale reply");
                }
                Err(err) => {
                    warn!(worker = %worker.id(), error = %err, "dropping undecodable reply");
                }
            }
        }
    }

    fn refused(&self, worker: &Worker) -> DispatchError {
        if self.is_shutting_down() {
            DispatchError::Cancelled
        } else {
            DispatchError::unavailable(worker.id())
        }
    }

    /// Remove a worker whose channel failed, failing whatever still waits on it.
    async fn evict(&self, worker: &Worker) {
        worker.mark_dead();
        self.registry.unregister(worker.id()).await;
        self.correlator.fail_worker(worker.id()).await;
        worker.channel().close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::runner::Runner;
    use crate::impls::memory;
    use crate::ports::{Channel, FirstAvailable};
    use crate::testing::{EchoExecutor, FailingChannel};
    use tokio::sync::watch;

    struct Harness {
        registry: Arc<WorkerRegistry>,
        correlator: Arc<Correlator>,
        dispatcher: Dispatcher,
        _shutdown: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    impl Harness {
        fn new(mode: CorrelationMode, timeout_ms: u64) -> Self {
            let registry = Arc::new(WorkerRegistry::new());
            let correlator = Arc::new(Correlator::new(Duration::from_millis(timeout_ms)));
            let dispatcher = Dispatcher::new(
                Arc::clone(&registry),
                Arc::clone(&correlator),
                Arc::new(FirstAvailable),
                mode,
            );
            let (shutdown, shutdown_rx) = watch::channel(false);
            Self {
                registry,
                correlator,
                dispatcher,
                _shutdown: shutdown,
                shutdown_rx,
            }
        }

        /// Register a worker backed by an in-process runner echoing tasks.
        async fn echo_worker(&self, name: &'static str) -> Worker {
            let (near, far) = memory::pair();
            let runner = Runner::new(Arc::new(far), Arc::new(EchoExecutor::named(name)));
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                let _ = runner.run(shutdown).await;
            });

            let worker = self.registry.register(Arc::new(near)).await;
            if self.dispatcher.mode() == CorrelationMode::Async {
                let registry = Arc::clone(&self.registry);
                let correlator = Arc::clone(&self.correlator);
                let shutdown = self.shutdown_rx.clone();
                let w = worker.clone();
                tokio::spawn(async move {
                    crate::app::receive_loop::run(w, registry, correlator, shutdown).await;
                });
            }
            worker
        }
    }

    #[tokio::test]
    async fn submit_routes_to_first_worker() {
        let h = Harness::new(CorrelationMode::Async, 1_000);
        let w1 = h.echo_worker("w1").await;
        h.echo_worker("w2").await;

        let pending = h
            .dispatcher
            .dispatch(TaskRequest::new("POST", "/example", "hello"))
            .await
            .unwrap();
        assert_eq!(pending.task_id(), TaskId::new(1));
        assert_eq!(pending.worker_id(), w1.id());

        let response = pending.wait().await.unwrap();
        assert_eq!(response, TaskResponse::new(TaskId::new(1), 200, "w1:hello"));
    }

    #[tokio::test]
    async fn sequential_submits_get_increasing_ids() {
        let h = Harness::new(CorrelationMode::Async, 1_000);
        h.echo_worker("w1").await;

        let mut ids = Vec::new();
        for n in 0..5 {
            let response = h
                .dispatcher
                .submit(TaskRequest::new("POST", "/example", n.to_string()))
                .await
                .unwrap();
            ids.push(response.task_id);
        }
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn no_workers_fails_without_consuming_an_id() {
        let h = Harness::new(CorrelationMode::Async, 1_000);

        let err = h
            .dispatcher
            .submit(TaskRequest::new("GET", "/status", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::WorkerUnavailable { worker: None }));

        let err = h
            .dispatcher
            .broadcast(TaskRequest::new("GET", "/status", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::WorkerUnavailable { worker: None }));
        assert_eq!(h.registry.last_task_id().await, None);
    }

    #[tokio::test]
    async fn send_failure_evicts_worker_without_retry() {
        let h = Harness::new(CorrelationMode::Async, 1_000);
        let failing = h.registry.register(Arc::new(FailingChannel::default())).await;
        h.echo_worker("w2").await;

        let err = h
            .dispatcher
            .submit(TaskRequest::new("POST", "/example", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::WorkerUnavailable { worker: Some(w) } if w == failing.id()));
        assert!(h.registry.get(failing.id()).await.is_none());
        assert!(h.correlator.is_empty().await);

        // 次の submit は残った worker へ
        let response = h
            .dispatcher
            .submit(TaskRequest::new("POST", "/example", "y"))
            .await
            .unwrap();
        assert_eq!(response.body, "w2:y");
    }

    #[tokio::test]
    async fn submit_to_unknown_worker() {
        let h = Harness::new(CorrelationMode::Async, 1_000);
        h.echo_worker("w1").await;

        let err = h
            .dispatcher
            .submit_to(WorkerId::new(42), TaskRequest::new("GET", "/status", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::WorkerUnavailable { worker: Some(w) } if w == WorkerId::new(42)));
    }

    #[tokio::test]
    async fn submit_to_named_worker() {
        let h = Harness::new(CorrelationMode::Async, 1_000);
        h.echo_worker("w1").await;
        let w2 = h.echo_worker("w2").await;

        let response = h
            .dispatcher
            .submit_to(w2.id(), TaskRequest::new("POST", "/example", "direct"))
            .await
            .unwrap();
        assert_eq!(response.body, "w2:direct");
    }

    #[tokio::test]
    async fn broadcast_shares_one_id_across_workers() {
        let h = Harness::new(CorrelationMode::Async, 1_000);
        h.echo_worker("w1").await;
        h.echo_worker("w2").await;

        let report = h
            .dispatcher
            .broadcast(TaskRequest::new("GET", "/status", ""))
            .await
            .unwrap();
        assert_eq!(report.delivered.len(), 2);
        assert!(report.failed.is_empty());

        let mut bodies = Vec::new();
        for pending in report.responses {
            let response = pending.wait().await.unwrap();
            assert_eq!(response.task_id, report.task_id);
            bodies.push(response.body);
        }
        bodies.sort();
        assert_eq!(bodies, vec!["w1:", "w2:"]);
    }

    #[tokio::test]
    async fn broadcast_skips_failing_worker_only() {
        let h = Harness::new(CorrelationMode::Async, 1_000);
        let w1 = h.echo_worker("w1").await;
        let bad = h.registry.register(Arc::new(FailingChannel::default())).await;
        let w3 = h.echo_worker("w3").await;

        let report = h
            .dispatcher
            .broadcast(TaskRequest::new("POST", "/example", "all"))
            .await
            .unwrap();
        assert_eq!(report.delivered, vec![w1.id(), w3.id()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, bad.id());

        let remaining: Vec<WorkerId> = h.registry.list().await.iter().map(Worker::id).collect();
        assert_eq!(remaining, vec![w1.id(), w3.id()]);

        for pending in report.responses {
            assert!(pending.wait().await.is_ok());
        }
    }

    #[tokio::test]
    async fn broadcast_with_sees_assigned_id() {
        let h = Harness::new(CorrelationMode::Async, 1_000);
        h.echo_worker("w1").await;

        let report = h
            .dispatcher
            .broadcast_with(|id| TaskRequest::new("POST", "/example", format!("dummy {}", id.get())))
            .await
            .unwrap();
        let response = report.responses.into_iter().next().unwrap().wait().await.unwrap();
        assert_eq!(response.body, "w1:dummy 1");
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let h = Harness::new(CorrelationMode::Async, 50);
        let (near, _far) = memory::pair();
        h.registry.register(Arc::new(near)).await;

        let err = h
            .dispatcher
            .submit(TaskRequest::new("GET", "/status", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));
        assert!(h.correlator.is_empty().await);
    }

    #[tokio::test]
    async fn slot_is_dropped_when_worker_died_before_send() {
        let h = Harness::new(CorrelationMode::Async, 1_000);
        let (near, _far) = memory::pair();
        let worker = h.registry.register(Arc::new(near)).await;
        h.registry.unregister(worker.id()).await;

        let err = h
            .dispatcher
            .deliver(&worker, TaskId::new(1), b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::WorkerUnavailable { worker: Some(w) } if w == worker.id()));
        assert!(h.correlator.is_empty().await);
    }

    #[tokio::test]
    async fn slot_is_dropped_once_shutdown_started() {
        let h = Harness::new(CorrelationMode::Async, 1_000);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = h.dispatcher.clone().with_shutdown(shutdown_rx);
        let (near, _far) = memory::pair();
        h.registry.register(Arc::new(near)).await;

        shutdown.send_replace(true);
        let err = dispatcher
            .dispatch(TaskRequest::new("GET", "/status", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
        assert!(h.correlator.is_empty().await);
    }

    #[tokio::test]
    async fn sync_submit_returns_reply() {
        let h = Harness::new(CorrelationMode::Sync, 1_000);
        h.echo_worker("w1").await;

        let response = h
            .dispatcher
            .submit(TaskRequest::new("POST", "/example", "hello"))
            .await
            .unwrap();
        assert_eq!(response, TaskResponse::new(TaskId::new(1), 200, "w1:hello"));
        assert!(h.correlator.is_empty().await);
    }

    #[tokio::test]
    async fn sync_mode_allows_one_exchange_per_worker() {
        let h = Harness::new(CorrelationMode::Sync, 200);
        let (near, _far) = memory::pair();
        let worker = h.registry.register(Arc::new(near)).await;

        let first = h
            .dispatcher
            .dispatch(TaskRequest::new("GET", "/status", ""))
            .await
            .unwrap();
        let err = h
            .dispatcher
            .dispatch(TaskRequest::new("GET", "/status", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::WorkerBusy(w) if w == worker.id()));

        assert!(matches!(first.wait().await, Err(DispatchError::Timeout { .. })));
    }

    #[tokio::test]
    async fn sync_mode_discards_stale_replies() {
        let h = Harness::new(CorrelationMode::Sync, 1_000);
        let (near, far) = memory::pair();
        h.registry.register(Arc::new(near)).await;

        let pending = h
            .dispatcher
            .dispatch(TaskRequest::new("GET", "/status", ""))
            .await
            .unwrap();
        let sent = Task::decode(&far.receive().await.unwrap().unwrap()).unwrap();

        let stale = TaskResponse::new(TaskId::new(sent.id.get() + 100), 200, "late");
        far.send(stale.encode().unwrap()).await.unwrap();
        let fresh = TaskResponse::new(sent.id, 200, "fresh");
        far.send(fresh.encode().unwrap()).await.unwrap();

        assert_eq!(pending.wait().await.unwrap(), fresh);
    }

    #[tokio::test]
    async fn sync_mode_peer_close_is_connection_lost() {
        let h = Harness::new(CorrelationMode::Sync, 1_000);
        let (near, far) = memory::pair();
        let worker = h.registry.register(Arc::new(near)).await;

        let pending = h
            .dispatcher
            .dispatch(TaskRequest::new("GET", "/status", ""))
            .await
            .unwrap();
        far.close().await;

        assert!(matches!(
            pending.wait().await,
            Err(DispatchError::ConnectionLost(w)) if w == worker.id()
        ));
        assert!(h.registry.list().await.is_empty());
    }
}
