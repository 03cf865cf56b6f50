//! Test doubles shared by the unit tests.

use async_trait::async_trait;

use crate::domain::{ChannelError, Message, Task, TaskResponse};
use crate::ports::{Channel, Executor};

/// Answers every task with 200 and `"<name>:<payload>"`.
pub(crate) struct EchoExecutor {
    name: &'static str,
}

impl EchoExecutor {
    pub(crate) fn named(name: &'static str) -> Self {
        Self { name }
    }
}

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, task: Task) -> TaskResponse {
        TaskResponse::new(task.id, 200, format!("{}:{}", self.name, task.payload))
    }
}

/// Every send fails; receive never completes.
#[derive(Default)]
pub(crate) struct FailingChannel;

#[async_trait]
impl Channel for FailingChannel {
    async fn send(&self, _message: Message) -> Result<(), ChannelError> {
        Err(ChannelError::Transport("broken pipe".to_string()))
    }

    async fn receive(&self) -> Result<Option<Message>, ChannelError> {
        std::future::pending().await
    }

    async fn close(&self) {}

    fn peer(&self) -> String {
        "failing".to_string()
    }
}
