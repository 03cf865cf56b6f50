//! SelectionStrategy port - 送信先 worker の選択
//!
//! Availability-based only; load-based scheduling is out of scope.

use crate::domain::WorkerId;

/// SelectionStrategy は接続中の worker から送信先を 1 つ選ぶ
///
/// `candidates` are the live workers in connection order. Returning `None`
/// means no worker fits and the dispatch fails with `WorkerUnavailable`.
pub trait SelectionStrategy: Send + Sync {
    fn select(&self, candidates: &[WorkerId]) -> Option<WorkerId>;
}

/// The earliest-connected live worker always wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstAvailable;

impl SelectionStrategy for FirstAvailable {
    fn select(&self, candidates: &[WorkerId]) -> Option<WorkerId> {
        candidates.first().copied()
    }
}
