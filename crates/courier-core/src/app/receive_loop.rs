//! ReceiveLoop - 非同期モードで worker ごとに 1 本走る受信ループ
//!
//! One loop per connected worker, so a slow or silent worker never stalls the
//! others. Responses are handed to the [`Correlator`]; a closed or broken
//! channel removes the worker and fails whatever still waits on it.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use super::correlator::Correlator;
use super::registry::{Worker, WorkerRegistry};
use crate::domain::{Envelope, TaskResponse};

pub(crate) async fn run(
    worker: Worker,
    registry: Arc<WorkerRegistry>,
    correlator: Arc<Correlator>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let id = worker.id();
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let received = tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped = controller gone
                if changed.is_err() {
                    return;
                }
                continue;
            }
            received = worker.channel().receive() => received,
        };

        match received {
            Ok(Some(message)) => match TaskResponse::decode(&message) {
                Ok(response) => {
                    info!(
                        task = %response.task_id,
                        worker = %id,
                        status = response.status,
                        "response received"
                    );
                    correlator.complete(id, response).await;
                }
                Err(err) => {
                    warn!(worker = %id, error = %err, "dropping undecodable message");
                }
            },
            Ok(None) => {
                info!(worker = %id, "worker disconnected");
                break;
            }
            Err(err) => {
                warn!(worker = %id, error = %err, "receive failed");
                break;
            }
        }
    }

    // shutdown 中なら pending は Cancelled で解決済み
    if *shutdown_rx.borrow() {
        return;
    }
    worker.mark_dead();
    registry.unregister(id).await;
    correlator.fail_worker(id).await;
    worker.channel().close().await;
}
