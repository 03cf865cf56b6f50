//! IdleLoop - 同期モードで worker ごとに 1 本走る監視ループ
//!
//! In sync mode replies are read by the exchange that sent the task, so
//! between exchanges nobody would notice a peer hanging up. This loop holds
//! the receive side while the worker is idle and hands it over as soon as an
//! exchange claims the slot. A closed or broken channel removes the worker.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use super::correlator::Correlator;
use super::registry::{Worker, WorkerRegistry};

async fn wait_until(rx: &mut watch::Receiver<bool>, value: bool) -> bool {
    rx.wait_for(|current| *current == value).await.is_ok()
}

pub(crate) async fn run(
    worker: Worker,
    registry: Arc<WorkerRegistry>,
    correlator: Arc<Correlator>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let id = worker.id();
    let mut in_flight = worker.exchange_state();
    loop {
        tokio::select! {
            biased;
            _ = wait_until(&mut shutdown_rx, true) => return,
            idle = wait_until(&mut in_flight, false) => {
                if !idle {
                    return;
                }
            }
        }
        // exchange 側が evict 済み
        if !worker.is_alive() {
            return;
        }

        let reader = worker.lock_reader().await;
        let received = tokio::select! {
            biased;
            _ = wait_until(&mut shutdown_rx, true) => return,
            _ = wait_until(&mut in_flight, true) => {
                drop(reader);
                continue;
            }
            received = worker.channel().receive() => received,
        };
        drop(reader);

        match received {
            Ok(Some(message)) => {
                warn!(worker = %id, bytes = message.len(), "discarding message outside an exchange");
            }
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

    if *shutdown_rx.borrow() {
        return;
    }
    worker.mark_dead();
    registry.unregister(id).await;
    correlator.fail_worker(id).await;
    worker.channel().close().await;
}
