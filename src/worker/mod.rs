pub mod breaker;
pub mod health;
pub mod recognizer;
pub mod server;
pub mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Settings;
use crate::filter::HallucinationFilter;
use crate::kv::Kv;
use recognizer::Recognizer;

/// Shared worker process state (spec §4.3): capacity accounting, the
/// hallucination filter, and a registry of live sessions used by the
/// janitor and `/metrics`.
#[derive(Clone)]
pub struct WorkerState {
    pub settings: Settings,
    pub kv: Kv,
    pub recognizer: Arc<dyn Recognizer>,
    pub filter: Arc<HallucinationFilter>,
    pub sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
    pub active_count: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct SessionHandle {
    pub uid: String,
    pub token_hash: String,
    pub connected_at: std::time::Instant,
    pub max_connection_time: std::time::Duration,
    pub closed: Arc<std::sync::atomic::AtomicBool>,
}

impl WorkerState {
    pub fn new(settings: Settings, kv: Kv, recognizer: Arc<dyn Recognizer>, filter: HallucinationFilter) -> Self {
        Self {
            settings,
            kv,
            recognizer,
            filter: Arc::new(filter),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            active_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn load_percent(&self) -> f64 {
        let active = self.active_count.load(Ordering::Relaxed) as f64;
        let max = self.settings.max_clients as f64;
        if max <= 0.0 {
            0.0
        } else {
            (active / max * 100.0).min(100.0)
        }
    }

    pub async fn at_capacity(&self) -> bool {
        self.sessions.lock().await.len() >= self.settings.max_clients
    }

    pub async fn register(&self, handle: SessionHandle) {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().await.insert(handle.uid.clone(), handle);
    }

    pub async fn unregister(&self, uid: &str) {
        if self.sessions.lock().await.remove(uid).is_some() {
            self.active_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Sweep timed-out or already-closed sessions (spec §4.3's janitor).
    pub async fn sweep_expired(&self) {
        let now = std::time::Instant::now();
        let mut expired = Vec::new();
        {
            let sessions = self.sessions.lock().await;
            for (uid, handle) in sessions.iter() {
                let closed = handle.closed.load(Ordering::Relaxed);
                let timed_out = now.duration_since(handle.connected_at) > handle.max_connection_time;
                if closed || timed_out {
                    expired.push((uid.clone(), handle.closed.clone()));
                }
            }
        }
        for (uid, closed) in expired {
            closed.store(true, Ordering::Relaxed);
            self.unregister(&uid).await;
        }
    }
}

pub async fn run_janitor(state: WorkerState, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        state.sweep_expired().await;
    }
}
