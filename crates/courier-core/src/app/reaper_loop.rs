//! ReaperLoop - 期限切れ・放棄された completion slot の回収
//!
//! Callers that stop waiting (dropped handle, broadcast responses nobody
//! awaits) would otherwise leave their slot in the correlator forever.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use super::correlator::Correlator;

pub(crate) async fn run(
    correlator: Arc<Correlator>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
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

        let reaped = correlator.reap().await;
        if reaped > 0 {
            debug!(reaped, "expired pending responses");
        }
    }
}
