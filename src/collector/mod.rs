pub mod consumer;
pub mod flush;
pub mod http;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::Settings;
use crate::db::Db;
use crate::filter::DedupCache;
use crate::kv::Kv;

pub const TRANSCRIPTION_STREAM: &str = "transcription_segments";
pub const TRANSCRIPTION_GROUP: &str = "transcription_collector_group";
pub const SPEAKER_EVENTS_STREAM: &str = "speaker_events_relative";
pub const SPEAKER_EVENTS_GROUP: &str = "speaker_events_collector_group";

#[derive(Clone)]
pub struct CollectorState {
    pub db: Db,
    pub kv: Kv,
    pub settings: Settings,
    pub consumer_name: String,
    /// Per-meeting recent-segment cache for the durable-flush dedup pass
    /// (spec §4.2); cleared when a meeting leaves `active_meetings`.
    pub dedup_caches: std::sync::Arc<Mutex<HashMap<uuid::Uuid, DedupCache>>>,
}

impl axum::extract::FromRef<CollectorState> for Db {
    fn from_ref(state: &CollectorState) -> Db {
        state.db.clone()
    }
}

impl CollectorState {
    pub fn new(db: Db, kv: Kv, settings: Settings) -> Self {
        Self {
            db,
            kv,
            settings,
            consumer_name: format!("collector-{}", uuid::Uuid::new_v4()),
            dedup_caches: std::sync::Arc::new(Mutex::new(HashMap::new())),
        }
    }
}
