//! Executor port - runner 側でタスクを実際に処理する
//!
//! The core passes `method` / `target` / `payload` through untouched; what they
//! mean is entirely up to the executor.

use async_trait::async_trait;

use crate::domain::{Task, TaskResponse};

/// Executor は Task を実行して TaskResponse を返す
///
/// Failures are expressed in the response status, never as an `Err`: a
/// worker always answers.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: Task) -> TaskResponse;
}
