use std::time::Duration;

use uuid::Uuid;

use crate::collector::CollectorState;
use crate::filter::{DedupCandidate, DedupCache, DedupOutcome, FilterConfig};
use crate::model::{MutableSegment, SpeakerMappingStatus, TranscriptSegment};
use crate::speaker;

/// Durable flush background task (spec §4.2): enumerate `active_meetings`,
/// age out immutable entries into the Durable Store, apply the filter
/// pipeline, and HDEL what was committed.
pub async fn run(state: CollectorState, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = flush_once(&state).await {
            tracing::warn!("durable flush pass failed: {e}");
        }
    }
}

async fn flush_once(state: &CollectorState) -> Result<(), crate::error::Error> {
    let active = state.kv.active_meetings().await?;
    let filter_config = FilterConfig::default();

    for meeting_id_str in active {
        let segments = state.kv.all_segments(&meeting_id_str).await?;
        if segments.is_empty() {
            state.kv.remove_active_meeting(&meeting_id_str).await?;
            clear_dedup_cache(state, &meeting_id_str);
            continue;
        }

        let Ok(meeting_id) = meeting_id_str.parse::<Uuid>() else {
            tracing::warn!("active_meetings contains non-uuid entry: {meeting_id_str}");
            continue;
        };

        let now = chrono::Utc::now();
        let mut to_delete: Vec<String> = Vec::new();
        let mut durable_rows: Vec<TranscriptSegment> = Vec::new();

        for (start, mut segment) in segments {
            let age = now - segment.updated_at;
            if age < chrono::Duration::from_std(state.settings.immutability_threshold).unwrap() {
                continue;
            }

            if needs_remap(&segment) {
                if let Ok(events) = state
                    .kv
                    .speaker_events_in_range(
                        &segment.session_uid,
                        (start * 1000.0) as i64 - speaker::MATCH_WINDOW_MS,
                        (segment.end_time * 1000.0) as i64 + speaker::MATCH_WINDOW_MS,
                    )
                    .await
                {
                    let parsed_events: Vec<_> = events
                        .iter()
                        .filter_map(|raw| serde_json::from_str(raw).ok())
                        .collect();
                    let mapping = speaker::map_speaker(
                        (start * 1000.0) as i64,
                        (segment.end_time * 1000.0) as i64,
                        &parsed_events,
                    );
                    segment.speaker = mapping.speaker.or(segment.speaker.clone());
                    segment.speaker_mapping_status = mapping.status;
                    let _ = state
                        .kv
                        .put_segment(&meeting_id_str, start, &segment, state.settings.redis_segment_ttl)
                        .await;
                }
            }

            to_delete.push(crate::kv::format_start_key(start));

            if !crate::filter::passes_filter(&segment.text, &filter_config) {
                continue;
            }

            let keep = evaluate_dedup(state, meeting_id, start, segment.end_time, &segment.text);
            if keep == DedupOutcome::Drop {
                continue;
            }

            durable_rows.push(TranscriptSegment {
                id: Uuid::new_v4(),
                meeting_id,
                session_uid: segment.session_uid.clone(),
                start_time: start,
                end_time: segment.end_time,
                text: segment.text.clone(),
                language: segment.language.clone(),
                speaker: segment.speaker.clone(),
                created_at: now,
            });
        }

        if to_delete.is_empty() {
            continue;
        }

        match state.db.insert_segments(&durable_rows).await {
            Ok(()) => {
                state.kv.delete_segment_fields(&meeting_id_str, &to_delete).await?;
            }
            Err(e) => {
                tracing::warn!("durable commit failed for meeting {meeting_id}, retrying next pass: {e}");
            }
        }
    }
    Ok(())
}

fn needs_remap(segment: &MutableSegment) -> bool {
    matches!(
        segment.speaker_mapping_status,
        SpeakerMappingStatus::Unknown | SpeakerMappingStatus::NoSpeakerEvents | SpeakerMappingStatus::ErrorInMapping
    )
}

fn evaluate_dedup(state: &CollectorState, meeting_id: Uuid, start: f64, end: f64, text: &str) -> DedupOutcome {
    let mut caches = state.dedup_caches.lock().expect("dedup cache mutex poisoned");
    let cache = caches.entry(meeting_id).or_insert_with(DedupCache::default);
    cache.evaluate(DedupCandidate {
        start_time: start,
        end_time: end,
        text: text.to_string(),
    })
}

fn clear_dedup_cache(state: &CollectorState, meeting_id_str: &str) {
    if let Ok(meeting_id) = meeting_id_str.parse::<Uuid>() {
        let mut caches = state.dedup_caches.lock().expect("dedup cache mutex poisoned");
        caches.remove(&meeting_id);
    }
}
