use serde::{Deserialize, Serialize};

use super::TaskId;

/// A unit of work pushed to a worker.
///
/// `id` is assigned by the dispatcher at send time. Callers build a
/// [`TaskRequest`] instead and never pick ids themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub method: String,
    #[serde(alias = "url")]
    pub target: String,
    #[serde(default, alias = "body")]
    pub payload: String,
}

impl Task {
    pub fn new(id: TaskId, request: TaskRequest) -> Self {
        Self {
            id,
            method: request.method,
            target: request.target,
            payload: request.payload,
        }
    }
}

/// Result of executing a [`Task`] on a worker.
///
/// `status` is owned by the executor (HTTP-like codes in the demo executors);
/// the core never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: TaskId,
    #[serde(alias = "status_code")]
    pub status: i32,
    #[serde(default)]
    pub body: String,
}

impl TaskResponse {
    pub fn new(task_id: TaskId, status: i32, body: impl Into<String>) -> Self {
        Self {
            task_id,
            status,
            body: body.into(),
        }
    }
}

/// What a caller asks the dispatcher to run: a Task without its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub method: String,
    #[serde(alias = "url")]
    pub target: String,
    #[serde(default, alias = "body")]
    pub payload: String,
}

impl TaskRequest {
    pub fn new(
        method: impl Into<String>,
        target: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            payload: payload.into(),
        }
    }
}
