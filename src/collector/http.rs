use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collector::CollectorState;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{Account, Meeting, Platform, TranscriptSegment};
use crate::ws_types::{
    AuthorizeError, AuthorizeSubscribeRequest, AuthorizeSubscribeResponse, AuthorizedMeeting,
};

pub fn router(state: CollectorState) -> Router {
    Router::new()
        .route("/meetings", get(list_meetings))
        .route("/transcripts/:platform/:native_id", get(read_transcript))
        .route("/meetings/:platform/:native_id", patch(patch_meeting))
        .route("/meetings/:platform/:native_id", delete(purge_meeting))
        .route("/ws/authorize-subscribe", post(authorize_subscribe))
        .route("/internal/transcripts/:meeting_id", get(internal_transcript))
        .route("/healthz", get(healthz))
        .route("/health", get(healthz))
        .with_state(state)
}

async fn authed_account(state: &CollectorState, headers: &axum::http::HeaderMap) -> Result<Account> {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::AuthFailure("missing X-API-Key header".into()))?;
    let db: Db = state.db.clone();
    db.account_by_api_key(key)
        .await?
        .filter(|a| a.enabled)
        .ok_or_else(|| Error::AuthFailure("unknown or disabled api key".into()))
}

fn parse_platform(raw: &str) -> Result<Platform> {
    Platform::parse(raw).ok_or_else(|| Error::InvalidInput(format!("unknown platform: {raw}")))
}

async fn list_meetings(
    State(state): State<CollectorState>,
    headers: axum::http::HeaderMap,
) -> Result<impl IntoResponse> {
    let account = authed_account(&state, &headers).await?;
    let meetings: Vec<Meeting> = state.db.list_meetings_for_account(account.id).await?;
    Ok(Json(meetings))
}

#[derive(Debug, Deserialize)]
struct TranscriptQuery {
    meeting_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct TranscriptResponse {
    meeting: Meeting,
    segments: Vec<TranscriptEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    pub language: Option<String>,
    pub speaker: Option<String>,
    pub absolute_start_time: Option<DateTime<Utc>>,
    pub absolute_end_time: Option<DateTime<Utc>>,
}

async fn read_transcript(
    State(state): State<CollectorState>,
    headers: axum::http::HeaderMap,
    Path((platform, native_id)): Path<(String, String)>,
    Query(query): Query<TranscriptQuery>,
) -> Result<impl IntoResponse> {
    let account = authed_account(&state, &headers).await?;
    let platform = parse_platform(&platform)?;
    let meeting = resolve_meeting(&state, &account, platform, &native_id, query.meeting_id).await?;
    let segments = build_transcript(&state, &meeting).await?;
    Ok(Json(TranscriptResponse { meeting, segments }))
}

async fn internal_transcript(
    State(state): State<CollectorState>,
    Path(meeting_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let meeting = state
        .db
        .get_meeting(meeting_id)
        .await?
        .ok_or_else(|| Error::NotFound("meeting not found".into()))?;
    let segments = build_transcript(&state, &meeting).await?;
    Ok(Json(TranscriptResponse { meeting, segments }))
}

async fn resolve_meeting(
    state: &CollectorState,
    account: &Account,
    platform: Platform,
    native_id: &str,
    meeting_id: Option<Uuid>,
) -> Result<Meeting> {
    if let Some(id) = meeting_id {
        let meeting = state
            .db
            .get_meeting(id)
            .await?
            .ok_or_else(|| Error::NotFound("meeting not found".into()))?;
        if meeting.account_id != account.id {
            return Err(Error::AuthzFailure);
        }
        return Ok(meeting);
    }
    state
        .db
        .latest_for_tuple(account.id, platform, native_id)
        .await?
        .ok_or_else(|| Error::NotFound("no meeting found for tuple".into()))
}

/// Merge Session + Durable + live KV sources into one ordered, deduplicated,
/// same-speaker-merged transcript (spec §4.2's REST transcript read).
async fn build_transcript(state: &CollectorState, meeting: &Meeting) -> Result<Vec<TranscriptEntry>> {
    let sessions = state.db.sessions_for_meeting(meeting.id).await?;
    let durable = state.db.segments_for_meeting(meeting.id).await?;
    let live = state.kv.all_segments(&meeting.id.to_string()).await?;

    let session_start = |session_uid: &str| -> DateTime<Utc> {
        sessions
            .iter()
            .find(|s| s.session_uid == session_uid)
            .map(|s| s.session_start_time)
            .unwrap_or(meeting.created_at)
    };

    let mut entries: Vec<TranscriptEntry> = Vec::with_capacity(durable.len() + live.len());
    for seg in &durable {
        entries.push(durable_entry(seg, session_start(&seg.session_uid)));
    }
    for (start, seg) in &live {
        let base = session_start(&seg.session_uid);
        entries.push(live_entry(*start, seg, base));
    }

    entries.sort_by(|a, b| {
        let ka = a.absolute_start_time.unwrap_or_default();
        let kb = b.absolute_start_time.unwrap_or_default();
        ka.cmp(&kb)
    });

    let deduped = dedup_across_sources(entries);
    Ok(merge_same_speaker(deduped))
}

fn durable_entry(seg: &TranscriptSegment, session_start: DateTime<Utc>) -> TranscriptEntry {
    TranscriptEntry {
        start_time: seg.start_time,
        end_time: seg.end_time,
        text: seg.text.clone(),
        language: seg.language.clone(),
        speaker: seg.speaker.clone(),
        absolute_start_time: Some(session_start + chrono::Duration::milliseconds((seg.start_time * 1000.0) as i64)),
        absolute_end_time: Some(session_start + chrono::Duration::milliseconds((seg.end_time * 1000.0) as i64)),
    }
}

fn live_entry(start: f64, seg: &crate::model::MutableSegment, session_start: DateTime<Utc>) -> TranscriptEntry {
    TranscriptEntry {
        start_time: start,
        end_time: seg.end_time,
        text: seg.text.clone(),
        language: seg.language.clone(),
        speaker: seg.speaker.clone(),
        absolute_start_time: seg
            .absolute_start_time
            .or(Some(session_start + chrono::Duration::milliseconds((start * 1000.0) as i64))),
        absolute_end_time: seg
            .absolute_end_time
            .or(Some(session_start + chrono::Duration::milliseconds((seg.end_time * 1000.0) as i64))),
    }
}

/// Drop near-duplicate entries straddling the durable/live boundary: same
/// text with a small gap or temporal overlap against the previous entry.
fn dedup_across_sources(entries: Vec<TranscriptEntry>) -> Vec<TranscriptEntry> {
    let mut out: Vec<TranscriptEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        let is_dup = out.last().is_some_and(|prev: &TranscriptEntry| {
            if prev.text != entry.text {
                return false;
            }
            let (Some(prev_end), Some(cur_start)) = (prev.absolute_end_time, entry.absolute_start_time) else {
                return false;
            };
            let gap = (cur_start - prev_end).num_milliseconds();
            gap < 2000
        });
        if !is_dup {
            out.push(entry);
        }
    }
    out
}

/// Merge consecutive same-speaker entries whose gap is under 5 s, capping
/// each merged group at 60 s of combined span.
fn merge_same_speaker(entries: Vec<TranscriptEntry>) -> Vec<TranscriptEntry> {
    let mut out: Vec<TranscriptEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(last) = out.last_mut() {
            let same_speaker = last.speaker.is_some() && last.speaker == entry.speaker;
            let (Some(prev_end), Some(cur_start)) = (last.absolute_end_time, entry.absolute_start_time) else {
                out.push(entry);
                continue;
            };
            let gap_ms = (cur_start - prev_end).num_milliseconds();
            let span_ms = entry
                .absolute_end_time
                .zip(last.absolute_start_time)
                .map(|(e, s)| (e - s).num_milliseconds())
                .unwrap_or(0);
            if same_speaker && gap_ms >= 0 && gap_ms < 5000 && span_ms < 60_000 {
                last.text.push(' ');
                last.text.push_str(&entry.text);
                last.end_time = entry.end_time;
                last.absolute_end_time = entry.absolute_end_time;
                continue;
            }
        }
        out.push(entry);
    }
    out
}

#[derive(Debug, Deserialize)]
struct PatchMeetingRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    participants: Option<Vec<String>>,
    #[serde(default)]
    languages: Option<Vec<String>>,
    #[serde(default)]
    notes: Option<String>,
}

async fn patch_meeting(
    State(state): State<CollectorState>,
    headers: axum::http::HeaderMap,
    Path((platform, native_id)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse> {
    let account = authed_account(&state, &headers).await?;
    let platform = parse_platform(&platform)?;

    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidInput(format!("invalid json body: {e}")))?;
    if let Some(obj) = value.as_object() {
        const WHITELIST: &[&str] = &["name", "participants", "languages", "notes"];
        for key in obj.keys() {
            if !WHITELIST.contains(&key.as_str()) {
                return Err(Error::InvalidInput(format!("field not updatable: {key}")));
            }
        }
    }
    let req: PatchMeetingRequest = serde_json::from_value(value)
        .map_err(|e| Error::InvalidInput(format!("invalid patch body: {e}")))?;

    let mut meeting = state
        .db
        .latest_for_tuple(account.id, platform, &native_id)
        .await?
        .ok_or_else(|| Error::NotFound("no meeting found".into()))?;

    if let Some(name) = req.name {
        meeting.data.name = Some(name);
    }
    if let Some(participants) = req.participants {
        meeting.data.participants = participants;
    }
    if let Some(languages) = req.languages {
        meeting.data.languages = languages;
    }
    if let Some(notes) = req.notes {
        meeting.data.notes = Some(notes);
    }
    meeting.updated_at = Utc::now();

    let mut tx = state.db.begin().await?;
    state.db.save_meeting(&mut tx, &meeting).await?;
    tx.commit().await?;

    Ok(Json(meeting))
}

async fn purge_meeting(
    State(state): State<CollectorState>,
    headers: axum::http::HeaderMap,
    Path((platform, native_id)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let account = authed_account(&state, &headers).await?;
    let platform = parse_platform(&platform)?;

    let mut meeting = state
        .db
        .latest_for_tuple(account.id, platform, &native_id)
        .await?
        .ok_or_else(|| Error::NotFound("no meeting found".into()))?;

    if meeting.data.redacted {
        return Ok(Json(meeting)); // idempotent: already purged
    }
    if !meeting.is_terminal() {
        return Err(Error::Conflict("meeting is not finalized".into()));
    }

    state.db.delete_segments_for_meeting(meeting.id).await?;
    let meeting_id_str = meeting.id.to_string();
    state.kv.delete_segments_hash(&meeting_id_str).await?;
    state.kv.remove_active_meeting(&meeting_id_str).await?;

    meeting.data.name = None;
    meeting.data.participants.clear();
    meeting.data.notes = None;
    meeting.data.passcode = None;
    meeting.data.redacted = true;
    meeting.updated_at = Utc::now();

    let mut tx = state.db.begin().await?;
    state.db.save_meeting(&mut tx, &meeting).await?;
    tx.commit().await?;

    Ok(Json(meeting))
}

async fn authorize_subscribe(
    State(state): State<CollectorState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<AuthorizeSubscribeRequest>,
) -> Result<impl IntoResponse> {
    let account = authed_account(&state, &headers).await?;

    let mut authorized = Vec::new();
    let mut errors = Vec::new();

    for meeting_ref in req.meetings {
        let Some(platform) = Platform::parse(&meeting_ref.platform) else {
            errors.push(AuthorizeError {
                platform: meeting_ref.platform,
                native_id: meeting_ref.native_id,
                error: "unknown platform".into(),
            });
            continue;
        };
        if platform.build_url(&meeting_ref.native_id, None).is_none() {
            errors.push(AuthorizeError {
                platform: meeting_ref.platform.clone(),
                native_id: meeting_ref.native_id.clone(),
                error: "malformed native id".into(),
            });
            continue;
        }
        match state
            .db
            .latest_for_tuple(account.id, platform, &meeting_ref.native_id)
            .await
        {
            Ok(Some(meeting)) => authorized.push(AuthorizedMeeting {
                platform: meeting_ref.platform,
                native_id: meeting_ref.native_id,
                account_id: account.id,
                meeting_id: meeting.id,
            }),
            Ok(None) => errors.push(AuthorizeError {
                platform: meeting_ref.platform,
                native_id: meeting_ref.native_id,
                error: "no meeting found".into(),
            }),
            Err(e) => errors.push(AuthorizeError {
                platform: meeting_ref.platform,
                native_id: meeting_ref.native_id,
                error: e.to_string(),
            }),
        }
    }

    Ok(Json(AuthorizeSubscribeResponse {
        authorized,
        errors,
        account_id: account.id,
    }))
}

async fn healthz(State(state): State<CollectorState>) -> impl IntoResponse {
    let db_ok = state.db.ping().await.is_ok();
    let kv_ok = state.kv.ping().await.is_ok();
    if db_ok && kv_ok {
        (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "unhealthy", "db": db_ok, "kv": kv_ok})),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str, speaker: Option<&str>, start_ms: i64, end_ms: i64) -> TranscriptEntry {
        let base = Utc::now();
        TranscriptEntry {
            start_time: start_ms as f64 / 1000.0,
            end_time: end_ms as f64 / 1000.0,
            text: text.to_string(),
            language: None,
            speaker: speaker.map(|s| s.to_string()),
            absolute_start_time: Some(base + chrono::Duration::milliseconds(start_ms)),
            absolute_end_time: Some(base + chrono::Duration::milliseconds(end_ms)),
        }
    }

    #[test]
    fn dedup_drops_same_text_within_small_gap() {
        let entries = vec![entry("hello there", None, 0, 1000), entry("hello there", None, 1500, 2500)];
        let out = dedup_across_sources(entries);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn dedup_keeps_same_text_after_large_gap() {
        let entries = vec![entry("hello there", None, 0, 1000), entry("hello there", None, 10_000, 11_000)];
        let out = dedup_across_sources(entries);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn merge_joins_consecutive_same_speaker_within_gap() {
        let entries = vec![
            entry("hello", Some("alice"), 0, 1000),
            entry("world", Some("alice"), 2000, 3000),
        ];
        let out = merge_same_speaker(entries);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "hello world");
    }

    #[test]
    fn merge_keeps_separate_entries_for_different_speakers() {
        let entries = vec![
            entry("hello", Some("alice"), 0, 1000),
            entry("hi", Some("bob"), 2000, 3000),
        ];
        let out = merge_same_speaker(entries);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn merge_respects_combined_span_cap() {
        let entries = vec![
            entry("one", Some("alice"), 0, 1000),
            entry("two", Some("alice"), 5000, 6000),
            entry("three", Some("alice"), 10_000, 65_000),
        ];
        let out = merge_same_speaker(entries);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "one two");
    }
}
