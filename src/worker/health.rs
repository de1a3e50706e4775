use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::worker::WorkerState;

/// Self-monitoring loop (spec §4.3): probe KV connectivity every
/// `health_monitor_interval`, exit the process after `max_unhealthy_streak`
/// consecutive failures so the process manager can restart a wedged worker.
pub async fn run_health_monitor(state: WorkerState) {
    let streak = Arc::new(AtomicU32::new(0));
    let mut ticker = tokio::time::interval(state.settings.health_monitor_interval);
    loop {
        ticker.tick().await;
        if check_once(&state).await {
            streak.store(0, Ordering::Relaxed);
        } else {
            let count = streak.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(streak = count, "worker health check failed");
            if count >= state.settings.max_unhealthy_streak {
                error!(
                    streak = count,
                    "worker unhealthy for {} consecutive checks, exiting",
                    count
                );
                std::process::exit(1);
            }
        }
    }
}

async fn check_once(state: &WorkerState) -> bool {
    state.kv.ping().await.is_ok()
}
