//! Status - controller の状態スナップショット

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CorrelationMode;
use crate::domain::{TaskId, WorkerId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub peer: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub mode: CorrelationMode,
    pub workers: Vec<WorkerStatus>,
    /// Completion slots still waiting for a response (async mode).
    pub pending: usize,
    pub last_task_id: Option<TaskId>,
}
