//! Runner - worker 側のループ
//!
//! receive -> decode Task -> Executor -> encode TaskResponse -> send.
//! Tasks are executed one at a time in arrival order, which keeps replies in
//! the order the controller sent the tasks.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{ChannelError, Envelope, Task};
use crate::ports::{Channel, Executor};

pub struct Runner {
    channel: Arc<dyn Channel>,
    executor: Arc<dyn Executor>,
}

impl Runner {
    pub fn new(channel: Arc<dyn Channel>, executor: Arc<dyn Executor>) -> Self {
        Self { channel, executor }
    }

    /// Serve tasks until the controller closes the channel or `shutdown_rx`
    /// flips to `true`. Returns the number of tasks answered.
    ///
    /// A failed send of a response ends the loop: the channel is unusable.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<u64, ChannelError> {
        let mut answered = 0;
        loop {
            if *shutdown_rx.borrow() {
                info!("runner shutting down");
                self.channel.close().await;
                return Ok(answered);
            }

            let received = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        self.channel.close().await;
                        return Ok(answered);
                    }
                    continue;
                }
                received = self.channel.receive() => received?,
            };

            let Some(message) = received else {
                info!(peer = %self.channel.peer(), "controller closed the connection");
                return Ok(answered);
            };

            let task = match Task::decode(&message) {
                Ok(task) => task,
                Err(err) => {
                    warn!(error = %err, "dropping undecodable task");
                    continue;
                }
            };

            info!(task = %task.id, method = %task.method, path = %task.target, "task received");
            let response = self.executor.execute(task).await;
            let reply = match response.encode() {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(task = %response.task_id, error = %err, "dropping unencodable response");
                    continue;
                }
            };
            self.channel.send(reply).await?;
            debug!(task = %response.task_id, status = response.status, "response sent");
            answered += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskRequest, TaskResponse};
    use crate::impls::memory;
    use crate::testing::EchoExecutor;

    fn spawn_runner(
        channel: memory::MemoryChannel,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<Result<u64, ChannelError>>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let runner = Runner::new(Arc::new(channel), Arc::new(EchoExecutor::named("r")));
        let join = tokio::spawn(async move { runner.run(shutdown_rx).await });
        (shutdown, join)
    }

    async fn send_task(controller: &memory::MemoryChannel, id: u64, payload: &str) {
        let task = Task::new(TaskId::new(id), TaskRequest::new("POST", "/example", payload));
        controller.send(task.encode().unwrap()).await.unwrap();
    }

    async fn next_response(controller: &memory::MemoryChannel) -> TaskResponse {
        let message = controller.receive().await.unwrap().unwrap();
        TaskResponse::decode(&message).unwrap()
    }

    #[tokio::test]
    async fn answers_tasks_in_order() {
        let (controller, worker) = memory::pair();
        let (_shutdown, join) = spawn_runner(worker);

        send_task(&controller, 1, "a").await;
        send_task(&controller, 2, "b").await;
        assert_eq!(next_response(&controller).await, TaskResponse::new(TaskId::new(1), 200, "r:a"));
        assert_eq!(next_response(&controller).await, TaskResponse::new(TaskId::new(2), 200, "r:b"));

        controller.close().await;
        assert_eq!(join.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn undecodable_task_is_skipped() {
        let (controller, worker) = memory::pair();
        let (_shutdown, join) = spawn_runner(worker);

        controller.send(b"not a task".to_vec()).await.unwrap();
        send_task(&controller, 9, "ok").await;
        assert_eq!(next_response(&controller).await.task_id, TaskId::new(9));

        controller.close().await;
        assert_eq!(join.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_channel() {
        let (controller, worker) = memory::pair();
        let (shutdown, join) = spawn_runner(worker);

        shutdown.send(true).unwrap();
        assert_eq!(join.await.unwrap().unwrap(), 0);
        assert!(controller.receive().await.unwrap().is_none());
    }
}
