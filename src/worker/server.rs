use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::collector::{SPEAKER_EVENTS_STREAM, TRANSCRIPTION_STREAM};
use crate::model::{SpeakerEvent, SpeakerEventType};
use crate::worker::breaker::CircuitBreaker;
use crate::worker::session::SessionBuffer;
use crate::worker::{SessionHandle, WorkerState};

const END_OF_AUDIO: &[u8] = b"END_OF_AUDIO";

pub fn router(state: WorkerState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/health", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WorkerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn healthz(State(state): State<WorkerState>) -> impl IntoResponse {
    if state.kv.ping().await.is_ok() {
        (StatusCode::OK, Json(json!({"status": "ok"})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "unhealthy"})))
    }
}

async fn metrics(State(state): State<WorkerState>) -> impl IntoResponse {
    let sessions = state.sessions.lock().await;
    let session_uids: Vec<String> = sessions.keys().cloned().collect();
    let session_tokens: Vec<String> = sessions.values().map(|h| h.token_hash.clone()).collect();
    Json(json!({
        "active_sessions": sessions.len(),
        "max_clients": state.settings.max_clients,
        "load_percent": state.load_percent(),
        "session_tokens": session_tokens,
        "session_uids": session_uids,
    }))
}

/// First-frame options (spec §4.3's connection contract).
#[derive(Debug, Deserialize)]
struct ConnectOptions {
    uid: String,
    platform: String,
    #[allow(dead_code)]
    meeting_url: String,
    token: String,
    meeting_id: uuid::Uuid,
    #[serde(default)]
    backend: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    max_connection_time: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status")]
enum ConnectResponse {
    #[serde(rename = "ERROR")]
    Error { message: String },
    #[serde(rename = "WAIT")]
    Wait { message: u64 },
    #[serde(rename = "SERVER_READY")]
    Ready { uid: String, backend: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    SpeakerActivity(SpeakerActivityPayload),
    SpeakerActivityUpdate(SpeakerActivityPayload),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct SpeakerActivityPayload {
    event: String,
    participant_name: String,
    #[serde(default)]
    participant_id: Option<String>,
    relative_timestamp_ms: i64,
}

async fn handle_socket(socket: WebSocket, state: WorkerState) {
    let (mut sink, mut stream) = socket.split();

    let first = match stream.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return,
    };

    let options: ConnectOptions = match serde_json::from_str(&first) {
        Ok(o) => o,
        Err(e) => {
            let _ = send_json(&mut sink, &ConnectResponse::Error { message: format!("bad options: {e}") }).await;
            return;
        }
    };

    if state.at_capacity().await {
        let _ = send_json(&mut sink, &ConnectResponse::Wait { message: 1 }).await;
        return;
    }

    let backend = options.backend.clone().unwrap_or_else(|| "default".to_string());
    if send_json(&mut sink, &ConnectResponse::Ready { uid: options.uid.clone(), backend }).await.is_err() {
        return;
    }

    let closed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let handle = SessionHandle {
        uid: options.uid.clone(),
        token_hash: hex::encode(Sha256::digest(options.token.as_bytes())),
        connected_at: Instant::now(),
        max_connection_time: options
            .max_connection_time
            .map(Duration::from_secs)
            .unwrap_or(state.settings.max_connection_time),
        closed: closed.clone(),
    };
    state.register(handle).await;
    info!(uid = %options.uid, meeting_id = %options.meeting_id, "worker session started");

    let start_timestamp = Utc::now();
    if let Err(e) = state
        .kv
        .xadd(
            TRANSCRIPTION_STREAM,
            &json!({
                "type": "session_start",
                "uid": options.uid,
                "token": options.token,
                "platform": options.platform,
                "meeting_id": options.meeting_id,
                "start_timestamp": start_timestamp,
            }),
        )
        .await
    {
        warn!("failed to publish session_start: {e}");
    }

    let mut buffer = SessionBuffer::new(options.language.clone());
    let mut breaker = CircuitBreaker::new(&state.settings, Instant::now());

    'session: while !closed.load(std::sync::atomic::Ordering::Relaxed) {
        let msg = match stream.next().await {
            Some(Ok(m)) => m,
            _ => break,
        };

        match msg {
            Message::Binary(bytes) => {
                if bytes.as_ref() == END_OF_AUDIO {
                    break 'session;
                }
                buffer.push_audio(&bytes);
            }
            Message::Text(text) => {
                if let Ok(ctrl) = serde_json::from_str::<ControlMessage>(&text) {
                    handle_control(&state, &options, &mut buffer, ctrl).await;
                }
            }
            Message::Close(_) => break 'session,
            _ => {}
        }

        buffer.trim(&state.settings);
        if buffer.ready_for_pass(&state.settings) {
            let samples = buffer.samples.clone();
            let offset = buffer.offset_s;
            match state
                .recognizer
                .transcribe(&samples, 16_000, offset, buffer.language.as_deref())
                .await
            {
                Ok(output) => {
                    let pass_duration_s = samples.len() as f64 / 16_000.0;
                    let window = buffer.apply_recognition(output, &state.filter, pass_duration_s);

                    if !window.is_empty() {
                        if send_json(&mut sink, &window).await.is_err() {
                            break 'session;
                        }
                        let _ = state
                            .kv
                            .xadd(
                                TRANSCRIPTION_STREAM,
                                &json!({
                                    "type": "transcription",
                                    "uid": options.uid,
                                    "token": options.token,
                                    "platform": options.platform,
                                    "meeting_id": options.meeting_id,
                                    "segments": window,
                                }),
                            )
                            .await;
                    }
                }
                Err(e) => warn!("recognizer error for session {}: {e}", options.uid),
            }
        }

        if breaker.check(Instant::now(), buffer.last_speaker_activity_at, buffer.last_output_at) {
            warn!(uid = %options.uid, "stall circuit breaker tripped, exiting process");
            let _ = sink.close().await;
            std::process::exit(1);
        }
    }

    let _ = state
        .kv
        .xadd(TRANSCRIPTION_STREAM, &json!({ "type": "session_end", "uid": options.uid }))
        .await;
    state.unregister(&options.uid).await;
    info!(uid = %options.uid, "worker session ended");
}

async fn handle_control(
    state: &WorkerState,
    options: &ConnectOptions,
    buffer: &mut SessionBuffer,
    ctrl: ControlMessage,
) {
    let payload = match ctrl {
        ControlMessage::SpeakerActivity(p) | ControlMessage::SpeakerActivityUpdate(p) => p,
        ControlMessage::Other => return,
    };

    buffer.last_speaker_activity_at = Some(Instant::now());

    let event_type = if payload.event.eq_ignore_ascii_case("start") {
        SpeakerEventType::SpeakerStart
    } else {
        SpeakerEventType::SpeakerEnd
    };
    let event = SpeakerEvent {
        event_type,
        participant_name: payload.participant_name,
        participant_id: payload.participant_id,
        uid: options.uid.clone(),
        relative_client_timestamp_ms: payload.relative_timestamp_ms,
    };
    if let Err(e) = state.kv.xadd(SPEAKER_EVENTS_STREAM, &event).await {
        debug!("failed to publish speaker event: {e}");
    }
}

async fn send_json<T: Serialize>(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    value: &T,
) -> Result<(), axum::Error> {
    use futures_util::SinkExt;
    let text = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    sink.send(Message::Text(text)).await
}
