use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::collector::{
    CollectorState, SPEAKER_EVENTS_GROUP, SPEAKER_EVENTS_STREAM, TRANSCRIPTION_GROUP,
    TRANSCRIPTION_STREAM,
};
use crate::kv::StreamMessage;
use crate::model::{MutableSegment, SpeakerEvent};
use crate::speaker;
use crate::token;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TranscriptionMessage {
    SessionStart(SessionStartPayload),
    Transcription(TranscriptionPayload),
    SessionEnd(SessionEndPayload),
}

#[derive(Debug, Deserialize)]
struct SessionStartPayload {
    uid: String,
    token: String,
    #[allow(dead_code)]
    platform: String,
    meeting_id: uuid::Uuid,
    start_timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionPayload {
    uid: String,
    token: String,
    #[allow(dead_code)]
    platform: String,
    meeting_id: uuid::Uuid,
    segments: Vec<RawSegment>,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionEndPayload {
    uid: String,
}

/// Consume the transcription stream: for each message, verify token, resolve
/// session start, canonicalize segments, change-only write to KV, and publish
/// the changed subset (spec §4.2 steps 1-4).
pub async fn run_transcription_loop(state: CollectorState) {
    if let Err(e) = state
        .kv
        .ensure_group(TRANSCRIPTION_STREAM, TRANSCRIPTION_GROUP)
        .await
    {
        tracing::error!("failed to ensure transcription consumer group: {e}");
        return;
    }

    loop {
        let messages = match state
            .kv
            .read_group(
                TRANSCRIPTION_STREAM,
                TRANSCRIPTION_GROUP,
                &state.consumer_name,
                50,
                2000,
            )
            .await
        {
            Ok(msgs) => msgs,
            Err(e) => {
                tracing::warn!("transcription read_group failed: {e}");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        if messages.is_empty() {
            continue;
        }

        let mut to_ack = Vec::new();
        for msg in &messages {
            match process_transcription_message(&state, msg).await {
                Ok(()) => to_ack.push(msg.id.clone()),
                Err(e) => {
                    tracing::warn!("transcription message {} left unacked: {e}", msg.id);
                }
            }
        }
        if let Err(e) = state.kv.ack(TRANSCRIPTION_STREAM, TRANSCRIPTION_GROUP, &to_ack).await {
            tracing::warn!("failed to ack transcription batch: {e}");
        }
    }
}

async fn process_transcription_message(
    state: &CollectorState,
    msg: &StreamMessage,
) -> Result<(), crate::error::Error> {
    let parsed: TranscriptionMessage = match msg.decode() {
        Ok(p) => p,
        Err(_) => return Ok(()), // unknown/unparsable type -> ack (drop)
    };

    match parsed {
        TranscriptionMessage::SessionStart(payload) => {
            if token::verify(&payload.token, state.settings.meeting_token_secret.as_bytes()).is_err() {
                return Ok(()); // verification failure -> ack (drop), permanent
            }
            state
                .db
                .insert_session(payload.meeting_id, &payload.uid, payload.start_timestamp)
                .await?;
            state
                .kv
                .cache_session_start(
                    &payload.uid,
                    payload.start_timestamp,
                    Duration::from_secs(2 * 3600),
                )
                .await?;
            Ok(())
        }
        TranscriptionMessage::Transcription(payload) => {
            if token::verify(&payload.token, state.settings.meeting_token_secret.as_bytes()).is_err() {
                return Ok(());
            }
            let session_start = resolve_session_start(state, &payload.uid, payload.meeting_id).await?;
            process_transcription_segments(state, &payload, session_start).await
        }
        TranscriptionMessage::SessionEnd(payload) => {
            let SessionEndPayload { uid } = payload;
            state.kv.delete_speaker_events(&uid).await?;
            state.kv.delete_session_start_cache(&uid).await?;
            Ok(())
        }
    }
}

async fn resolve_session_start(
    state: &CollectorState,
    session_uid: &str,
    meeting_id: uuid::Uuid,
) -> Result<Option<DateTime<Utc>>, crate::error::Error> {
    if let Some(start) = state.kv.cached_session_start(session_uid).await? {
        return Ok(Some(start));
    }
    if let Some(session) = state.db.session_by_uid(session_uid).await? {
        if session.meeting_id == meeting_id {
            return Ok(Some(session.session_start_time));
        }
    }
    Ok(None)
}

async fn process_transcription_segments(
    state: &CollectorState,
    payload: &TranscriptionPayload,
    session_start: Option<DateTime<Utc>>,
) -> Result<(), crate::error::Error> {
    let meeting_id_str = payload.meeting_id.to_string();

    for raw in &payload.segments {
        let (mut start, mut end) = (raw.start, raw.end);
        if end < start {
            std::mem::swap(&mut start, &mut end);
        }
        if (end - start).abs() < 1e-3 {
            continue;
        }

        let events = fetch_speaker_window(state, &payload.uid, start, end).await?;
        let mapping = speaker::map_speaker((start * 1000.0) as i64, (end * 1000.0) as i64, &events);

        let (abs_start, abs_end) = match session_start {
            Some(base) => (
                Some(base + chrono::Duration::milliseconds((start * 1000.0) as i64)),
                Some(base + chrono::Duration::milliseconds((end * 1000.0) as i64)),
            ),
            None => (None, None),
        };

        let candidate = MutableSegment {
            text: raw.text.clone(),
            end_time: end,
            language: raw.language.clone(),
            updated_at: Utc::now(),
            session_uid: payload.uid.clone(),
            speaker: mapping.speaker,
            speaker_mapping_status: mapping.status,
            absolute_start_time: abs_start,
            absolute_end_time: abs_end,
        };

        let existing = state.kv.get_segment(&meeting_id_str, start).await?;
        if let Some(existing) = &existing {
            if existing.render_fields_eq(&candidate) {
                continue; // change-only: identical render-relevant fields, skip
            }
        }

        state
            .kv
            .put_segment(&meeting_id_str, start, &candidate, state.settings.redis_segment_ttl)
            .await?;

        let event = serde_json::json!({
            "type": "transcript.mutable",
            "meeting": { "id": payload.meeting_id },
            "payload": { "segments": [segment_wire(start, &candidate)] },
            "ts": Utc::now(),
        });
        state
            .kv
            .publish(&crate::kv::mutable_channel(&meeting_id_str), &event)
            .await?;
    }
    Ok(())
}

fn segment_wire(start: f64, segment: &MutableSegment) -> serde_json::Value {
    serde_json::json!({
        "start": start,
        "end": segment.end_time,
        "text": segment.text,
        "language": segment.language,
        "speaker": segment.speaker,
        "speaker_mapping_status": segment.speaker_mapping_status,
        "absolute_start_time": segment.absolute_start_time,
        "absolute_end_time": segment.absolute_end_time,
    })
}

async fn fetch_speaker_window(
    state: &CollectorState,
    session_uid: &str,
    start_s: f64,
    end_s: f64,
) -> Result<Vec<SpeakerEvent>, crate::error::Error> {
    let min_score = (start_s * 1000.0) as i64 - speaker::MATCH_WINDOW_MS;
    let max_score = (end_s * 1000.0) as i64 + speaker::MATCH_WINDOW_MS;
    let raw = state
        .kv
        .speaker_events_in_range(session_uid, min_score, max_score)
        .await?;
    let mut events = Vec::with_capacity(raw.len());
    for item in raw {
        if let Ok(event) = serde_json::from_str::<SpeakerEvent>(&item) {
            events.push(event);
        }
    }
    Ok(events)
}

/// Speaker-event stream consumer (spec §4.2, second stream).
pub async fn run_speaker_events_loop(state: CollectorState) {
    if let Err(e) = state
        .kv
        .ensure_group(SPEAKER_EVENTS_STREAM, SPEAKER_EVENTS_GROUP)
        .await
    {
        tracing::error!("failed to ensure speaker events consumer group: {e}");
        return;
    }

    loop {
        let messages = match state
            .kv
            .read_group(
                SPEAKER_EVENTS_STREAM,
                SPEAKER_EVENTS_GROUP,
                &state.consumer_name,
                100,
                2000,
            )
            .await
        {
            Ok(msgs) => msgs,
            Err(e) => {
                tracing::warn!("speaker events read_group failed: {e}");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        if messages.is_empty() {
            continue;
        }

        let mut to_ack = Vec::new();
        for msg in &messages {
            match process_speaker_event(&state, msg).await {
                Ok(()) => to_ack.push(msg.id.clone()),
                Err(e) => tracing::warn!("speaker event {} left unacked: {e}", msg.id),
            }
        }
        if let Err(e) = state
            .kv
            .ack(SPEAKER_EVENTS_STREAM, SPEAKER_EVENTS_GROUP, &to_ack)
            .await
        {
            tracing::warn!("failed to ack speaker events batch: {e}");
        }
    }
}

async fn process_speaker_event(
    state: &CollectorState,
    msg: &StreamMessage,
) -> Result<(), crate::error::Error> {
    let event: SpeakerEvent = match msg.decode() {
        Ok(e) => e,
        Err(_) => return Ok(()), // malformed -> ack and drop
    };
    state
        .kv
        .add_speaker_event(
            &event.uid,
            event.relative_client_timestamp_ms,
            &serde_json::to_string(&event).unwrap(),
            state.settings.redis_speaker_event_ttl,
        )
        .await?;
    Ok(())
}

/// Stale-claim sweep: re-claims pending entries idle longer than
/// `PENDING_MSG_TIMEOUT_MS` so a crashed consumer doesn't strand messages
/// (spec §4.2 step 4).
pub async fn run_stale_claimer(state: CollectorState, interval: Duration) {
    let min_idle_ms = state.settings.pending_msg_timeout.as_millis() as i64;
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for (stream, group) in [
            (TRANSCRIPTION_STREAM, TRANSCRIPTION_GROUP),
            (SPEAKER_EVENTS_STREAM, SPEAKER_EVENTS_GROUP),
        ] {
            match state
                .kv
                .claim_stale(stream, group, &state.consumer_name, min_idle_ms, 50)
                .await
            {
                Ok(claimed) if !claimed.is_empty() => {
                    tracing::debug!("stale-claimed {} entries on {stream}", claimed.len());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("stale claim failed on {stream}: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_start_message_parses_with_type_tag() {
        let json = r#"{"type":"session_start","uid":"u1","token":"t","platform":"zoom","meeting_id":"11111111-1111-1111-1111-111111111111","start_timestamp":"2026-01-01T00:00:00Z"}"#;
        let parsed: TranscriptionMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, TranscriptionMessage::SessionStart(_)));
    }

    #[test]
    fn session_end_message_only_needs_uid() {
        let json = r#"{"type":"session_end","uid":"u1"}"#;
        let parsed: TranscriptionMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, TranscriptionMessage::SessionEnd(_)));
    }

    #[test]
    fn unknown_type_fails_to_parse_and_is_dropped_by_caller() {
        let json = r#"{"type":"unknown_type","uid":"u1"}"#;
        let parsed: Result<TranscriptionMessage, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }
}
