//! HeartbeatLoop - 定期的にダミータスクを全 worker へ broadcast
//!
//! Each tick takes one registry snapshot and broadcasts one task; responses
//! are only logged. Ticks with no connected worker are skipped.

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;
use crate::config::HeartbeatConfig;
use crate::domain::DispatchError;

pub(crate) async fn run(
    dispatcher: Dispatcher,
    config: HeartbeatConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval の最初の tick は即時に完了する
    ticker.tick().await;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        match dispatcher.broadcast_with(|id| config.request_for(id)).await {
            Ok(report) => {
                for pending in report.responses {
                    tokio::spawn(async move {
                        let (task, worker) = (pending.task_id(), pending.worker_id());
                        match pending.wait().await {
                            Ok(response) => info!(
                                task = %task,
                                worker = %worker,
                                status = response.status,
                                body = %response.body,
                                "heartbeat response"
                            ),
                            Err(err) => warn!(task = %task, worker = %worker, error = %err, "heartbeat unanswered"),
                        }
                    });
                }
            }
            Err(DispatchError::WorkerUnavailable { worker: None }) => {
                debug!("no workers connected, skipping heartbeat");
            }
            Err(err) => warn!(error = %err, "heartbeat broadcast failed"),
        }
    }
}
