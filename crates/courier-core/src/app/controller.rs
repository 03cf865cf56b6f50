//! Controller - dispatch core のライフサイクル
//!
//! Owns the registry, the correlator and the dispatcher, plus every background
//! task (receive or idle loops, reaper, heartbeat). All of them watch one
//! shutdown channel.
//!
//! # Shutdown 順序
//! 1. flip the shutdown signal (loops stop, new dispatches are refused)
//! 2. resolve every pending response with `Cancelled`
//! 3. drain the registry and close each channel
//! 4. join the background tasks

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::correlator::{Correlator, PendingResponse};
use super::dispatcher::{BroadcastReport, Dispatcher};
use super::registry::WorkerRegistry;
use super::status::{ControllerStatus, WorkerStatus};
use super::{heartbeat_loop, idle_loop, reaper_loop, receive_loop};
use crate::config::{ControllerConfig, CorrelationMode};
use crate::domain::{ConnectError, DispatchError, TaskRequest, TaskResponse, WorkerId};
use crate::ports::{Acceptor, Channel, SelectionStrategy};

pub struct Controller {
    config: ControllerConfig,
    registry: Arc<WorkerRegistry>,
    correlator: Arc<Correlator>,
    dispatcher: Dispatcher,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub(crate) fn new(config: ControllerConfig, strategy: Arc<dyn SelectionStrategy>) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let correlator = Arc::new(Correlator::new(config.response_timeout()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&correlator),
            strategy,
            config.mode,
        )
        .with_shutdown(shutdown_rx);

        Self {
            config,
            registry,
            correlator,
            dispatcher,
            shutdown_tx,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// A receiver that flips to `true` when [`shutdown`](Self::shutdown) starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawn the reaper (async mode) and the heartbeat (when configured).
    /// Calling it twice is a no-op.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut tasks = self.tasks.lock().await;
        if self.config.mode == CorrelationMode::Async {
            tasks.push(tokio::spawn(reaper_loop::run(
                Arc::clone(&self.correlator),
                self.config.reap_interval(),
                self.shutdown_signal(),
            )));
        }
        if let Some(heartbeat) = self.config.heartbeat.clone() {
            info!(interval_ms = heartbeat.interval_ms, path = %heartbeat.target, "heartbeat enabled");
            tasks.push(tokio::spawn(heartbeat_loop::run(
                self.dispatcher.clone(),
                heartbeat,
                self.shutdown_signal(),
            )));
        }
        info!(mode = ?self.config.mode, timeout_ms = self.config.response_timeout_ms, "controller started");
    }

    /// Register an established channel as a new worker.
    pub async fn attach(&self, channel: Arc<dyn Channel>) -> Result<WorkerId, DispatchError> {
        if self.is_shutting_down() {
            channel.close().await;
            return Err(DispatchError::Cancelled);
        }

        let worker = self.registry.register(channel).await;
        // shutdown が register と競合した場合
        if self.is_shutting_down() {
            self.registry.unregister(worker.id()).await;
            worker.channel().close().await;
            return Err(DispatchError::Cancelled);
        }

        let registry = Arc::clone(&self.registry);
        let correlator = Arc::clone(&self.correlator);
        let join = match self.config.mode {
            CorrelationMode::Async => tokio::spawn(receive_loop::run(
                worker.clone(),
                registry,
                correlator,
                self.shutdown_signal(),
            )),
            CorrelationMode::Sync => tokio::spawn(idle_loop::run(
                worker.clone(),
                registry,
                correlator,
                self.shutdown_signal(),
            )),
        };
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(join);
        Ok(worker.id())
    }

    /// Accept workers until shutdown or until the acceptor closes.
    ///
    /// Each handshake runs on its own task; a failed or silent one only
    /// affects that attempt.
    pub async fn serve(&self, acceptor: &dyn Acceptor) -> Result<(), ConnectError> {
        let mut shutdown_rx = self.shutdown_signal();
        let mut handshakes = JoinSet::new();
        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                Some(joined) = handshakes.join_next() => match joined {
                    Ok(Ok(channel)) => {
                        let channel: Arc<dyn Channel> = Arc::from(channel);
                        let peer = channel.peer();
                        if let Err(err) = self.attach(channel).await {
                            debug!(peer = %peer, error = %err, "connection rejected");
                        }
                    }
                    Ok(Err(err)) => warn!(error = %err, "handshake failed"),
                    Err(err) => warn!(error = %err, "handshake task failed"),
                },
                accepted = acceptor.accept() => match accepted {
                    Ok(handshake) => {
                        handshakes.spawn(handshake);
                    }
                    Err(ConnectError::ListenerClosed) => {
                        info!("listener closed");
                        return Ok(());
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
            }
        }
    }

    pub async fn submit(&self, request: TaskRequest) -> Result<TaskResponse, DispatchError> {
        self.dispatcher.submit(request).await
    }

    pub async fn dispatch(&self, request: TaskRequest) -> Result<PendingResponse, DispatchError> {
        self.dispatcher.dispatch(request).await
    }

    pub async fn broadcast(&self, request: TaskRequest) -> Result<BroadcastReport, DispatchError> {
        self.dispatcher.broadcast(request).await
    }

    pub async fn status(&self) -> ControllerStatus {
        let workers = self
            .registry
            .list()
            .await
            .iter()
            .map(|worker| WorkerStatus {
                id: worker.id(),
                peer: worker.channel().peer(),
                connected_at: worker.connected_at(),
            })
            .collect();

        ControllerStatus {
            mode: self.config.mode,
            workers,
            pending: self.correlator.len().await,
            last_task_id: self.registry.last_task_id().await,
        }
    }

    /// Stop everything. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("controller shutting down");

        let cancelled = self.correlator.cancel_all().await;
        let workers = self.registry.drain().await;
        for worker in &workers {
            worker.channel().close().await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task failed");
            }
        }
        info!(cancelled, workers = workers.len(), "controller stopped");
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::ControllerBuilder;
    use crate::app::runner::Runner;
    use crate::config::HeartbeatConfig;
    use crate::domain::{Envelope, Task, TaskId};
    use crate::impls::{TcpAcceptor, TcpConnector, WsAcceptor, WsConnector, memory};
    use crate::ports::Connector;
    use crate::testing::EchoExecutor;
    use std::time::Duration;

    fn controller(mode: CorrelationMode) -> Arc<Controller> {
        Arc::new(
            ControllerBuilder::new()
                .mode(mode)
                .response_timeout(Duration::from_millis(500))
                .build()
                .unwrap(),
        )
    }

    /// Attach a worker served by an in-process runner.
    async fn attach_echo(controller: &Controller, name: &'static str) -> WorkerId {
        let (near, far) = memory::pair();
        let runner = Runner::new(Arc::new(far), Arc::new(EchoExecutor::named(name)));
        tokio::spawn(async move {
            let (_shutdown, shutdown_rx) = watch::channel(false);
            let _ = runner.run(shutdown_rx).await;
        });
        controller.attach(Arc::new(near)).await.unwrap()
    }

    async fn wait_for_workers(controller: &Controller, expected: usize) {
        for _ in 0..100 {
            if controller.registry().len().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {expected} workers");
    }

    #[tokio::test]
    async fn submit_through_attached_worker() {
        let controller = controller(CorrelationMode::Async);
        controller.start().await;
        attach_echo(&controller, "w1").await;

        let response = controller
            .submit(TaskRequest::new("POST", "/example", "hi"))
            .await
            .unwrap();
        assert_eq!(response, TaskResponse::new(TaskId::new(1), 200, "w1:hi"));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn sync_mode_submit() {
        let controller = controller(CorrelationMode::Sync);
        attach_echo(&controller, "w1").await;

        let first = controller.submit(TaskRequest::new("GET", "/status", "")).await.unwrap();
        let second = controller.submit(TaskRequest::new("GET", "/status", "")).await.unwrap();
        assert!(first.task_id < second.task_id);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn disconnect_removes_worker_and_fails_pending() {
        let controller = controller(CorrelationMode::Async);
        let (near, far) = memory::pair();
        let id = controller.attach(Arc::new(near)).await.unwrap();

        let pending = controller
            .dispatch(TaskRequest::new("POST", "/example", "x"))
            .await
            .unwrap();
        far.close().await;

        assert!(matches!(pending.wait().await, Err(DispatchError::ConnectionLost(w)) if w == id));
        assert!(controller.registry().list().await.is_empty());
        let err = controller
            .submit(TaskRequest::new("POST", "/example", "y"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::WorkerUnavailable { worker: None }));
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_and_closes_channels() {
        let controller = controller(CorrelationMode::Async);
        controller.start().await;
        let (near, far) = memory::pair();
        controller.attach(Arc::new(near)).await.unwrap();

        let pending = controller
            .dispatch(TaskRequest::new("GET", "/status", ""))
            .await
            .unwrap();
        controller.shutdown().await;

        assert!(matches!(pending.wait().await, Err(DispatchError::Cancelled)));
        assert!(controller.registry().is_empty().await);
        // task, then end of stream
        assert!(far.receive().await.unwrap().is_some());
        assert!(far.receive().await.unwrap().is_none());

        let (late, _peer) = memory::pair();
        assert!(matches!(
            controller.attach(Arc::new(late)).await,
            Err(DispatchError::Cancelled)
        ));
        // 二回目は何もしない
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn sync_shutdown_cancels_in_flight_exchange() {
        let controller = controller(CorrelationMode::Sync);
        let (near, _far) = memory::pair();
        controller.attach(Arc::new(near)).await.unwrap();

        let pending = controller
            .dispatch(TaskRequest::new("GET", "/status", ""))
            .await
            .unwrap();
        controller.shutdown().await;
        assert!(matches!(pending.wait().await, Err(DispatchError::Cancelled)));
    }

    #[tokio::test]
    async fn heartbeat_reaches_every_worker() {
        let controller = Arc::new(
            ControllerBuilder::new()
                .heartbeat(HeartbeatConfig {
                    interval_ms: 20,
                    ..HeartbeatConfig::default()
                })
                .build()
                .unwrap(),
        );
        let (near1, far1) = memory::pair();
        let (near2, far2) = memory::pair();
        controller.attach(Arc::new(near1)).await.unwrap();
        controller.attach(Arc::new(near2)).await.unwrap();
        controller.start().await;

        let t1 = Task::decode(&far1.receive().await.unwrap().unwrap()).unwrap();
        let t2 = Task::decode(&far2.receive().await.unwrap().unwrap()).unwrap();
        assert_eq!(t1.id, t2.id);
        assert_eq!(t1.method, "POST");
        assert_eq!(t1.target, "/example");
        assert_eq!(t1.payload, format!("dummy task {}", t1.id.get()));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn serve_attaches_connecting_workers() {
        let controller = controller(CorrelationMode::Async);
        let (acceptor, connector) = memory::listener();
        let serving = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.serve(&acceptor).await })
        };

        let channel: Arc<dyn Channel> = Arc::from(connector.connect("memory").await.unwrap());
        let runner = Runner::new(channel, Arc::new(EchoExecutor::named("remote")));
        let (_runner_shutdown, runner_rx) = watch::channel(false);
        tokio::spawn(async move { runner.run(runner_rx).await });

        wait_for_workers(&controller, 1).await;
        let response = controller
            .submit(TaskRequest::new("POST", "/example", "over the wire"))
            .await
            .unwrap();
        assert_eq!(response.body, "remote:over the wire");

        let status = controller.status().await;
        assert_eq!(status.workers.len(), 1);
        assert_eq!(status.last_task_id, Some(response.task_id));

        controller.shutdown().await;
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sync_mode_idle_disconnect_removes_worker() {
        let controller = controller(CorrelationMode::Sync);
        let (near, far) = memory::pair();
        controller.attach(Arc::new(near)).await.unwrap();
        let live = attach_echo(&controller, "w2").await;

        far.close().await;
        wait_for_workers(&controller, 1).await;
        let listed: Vec<WorkerId> = controller.registry().list().await.iter().map(|w| w.id()).collect();
        assert_eq!(listed, vec![live]);

        let response = controller
            .submit(TaskRequest::new("POST", "/example", "after close"))
            .await
            .unwrap();
        assert_eq!(response.body, "w2:after close");
        assert_eq!(controller.status().await.workers.len(), 1);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn sync_mode_worker_survives_between_exchanges() {
        let controller = controller(CorrelationMode::Sync);
        attach_echo(&controller, "w1").await;

        for n in 0..3 {
            let response = controller
                .submit(TaskRequest::new("POST", "/example", n.to_string()))
                .await
                .unwrap();
            assert_eq!(response.body, format!("w1:{n}"));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(controller.registry().len().await, 1);
        controller.shutdown().await;
    }

    /// A raw connection that never handshakes must not hold up a real worker.
    async fn serve_past_silent_client(
        controller: Arc<Controller>,
        acceptor: Box<dyn Acceptor>,
        address: String,
        connector: Box<dyn Connector>,
    ) {
        let serving = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.serve(acceptor.as_ref()).await })
        };

        let _silent = tokio::net::TcpStream::connect(&address).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let channel = tokio::time::timeout(Duration::from_secs(2), connector.connect(&address))
            .await
            .expect("connect stalled behind a silent client")
            .unwrap();
        let runner = Runner::new(Arc::from(channel), Arc::new(EchoExecutor::named("real")));
        let (_runner_shutdown, runner_rx) = watch::channel(false);
        tokio::spawn(async move { runner.run(runner_rx).await });

        wait_for_workers(&controller, 1).await;
        let response = controller
            .submit(TaskRequest::new("GET", "/status", ""))
            .await
            .unwrap();
        assert_eq!(response.body, "real:");

        controller.shutdown().await;
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn silent_tcp_client_does_not_block_accepts() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let address = acceptor.local_addr().unwrap().to_string();
        serve_past_silent_client(
            controller(CorrelationMode::Async),
            Box::new(acceptor),
            address,
            Box::new(TcpConnector),
        )
        .await;
    }

    #[tokio::test]
    async fn silent_ws_client_does_not_block_accepts() {
        let acceptor = WsAcceptor::bind("127.0.0.1:0").await.unwrap();
        let address = acceptor.local_addr().unwrap().to_string();
        serve_past_silent_client(
            controller(CorrelationMode::Sync),
            Box::new(acceptor),
            address,
            Box::new(WsConnector),
        )
        .await;
    }

    #[tokio::test]
    async fn status_reports_mode_and_pending() {
        let controller = controller(CorrelationMode::Async);
        attach_echo(&controller, "w1").await;
        let (near, _far) = memory::pair();
        controller.attach(Arc::new(near)).await.unwrap();

        let status = controller.status().await;
        assert_eq!(status.mode, CorrelationMode::Async);
        assert_eq!(status.workers.len(), 2);
        assert_eq!(status.pending, 0);
        assert_eq!(status.last_task_id, None);
        controller.shutdown().await;
    }
}
