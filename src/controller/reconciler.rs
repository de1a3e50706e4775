use std::time::Duration;

use crate::controller::service::ControllerState;

/// Orphan reconciliation background loop (spec §4.1): runs every ~60 s with
/// an initial ~30 s delay so freshly launched meetings aren't immediately
/// swept before their first callback arrives.
pub async fn run(state: ControllerState, interval: Duration) {
    tokio::time::sleep(Duration::from_secs(30)).await;
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = state.reconcile_once().await {
            tracing::warn!("reconciliation pass failed: {e}");
        }
    }
}
