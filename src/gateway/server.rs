use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::db::Db;
use crate::gateway::auth::AuthedAccount;
use crate::kv::{mutable_channel, status_channel};
use crate::ws_types::{AuthorizeSubscribeRequest, AuthorizeSubscribeResponse, ClientFrame, MeetingRef, ServerFrame};

#[derive(Clone)]
pub struct GatewayState {
    pub db: Db,
    pub redis_url: String,
    pub http: reqwest::Client,
    pub collector_base_url: String,
}

impl axum::extract::FromRef<GatewayState> for Db {
    fn from_ref(state: &GatewayState) -> Db {
        state.db.clone()
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    AuthedAccount(account): AuthedAccount,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, account))
}

enum PubSubCmd {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

async fn handle_socket(socket: WebSocket, state: GatewayState, account: crate::model::Account) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<PubSubCmd>();

    let write_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let pubsub_task = tokio::spawn(run_pubsub(state.redis_url.clone(), cmd_rx, out_tx.clone()));

    // meeting ref -> channel names currently subscribed for it.
    let mut subscriptions: HashMap<MeetingRef, Vec<String>> = HashMap::new();

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                handle_client_text(&text, &state, &account, &cmd_tx, &out_tx, &mut subscriptions).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    let all_channels: Vec<String> = subscriptions.into_values().flatten().collect();
    if !all_channels.is_empty() {
        let _ = cmd_tx.send(PubSubCmd::Unsubscribe(all_channels));
    }
    drop(cmd_tx);
    pubsub_task.abort();
    write_task.abort();
}

async fn handle_client_text(
    text: &str,
    state: &GatewayState,
    account: &crate::model::Account,
    cmd_tx: &mpsc::UnboundedSender<PubSubCmd>,
    out_tx: &mpsc::UnboundedSender<Message>,
    subscriptions: &mut HashMap<MeetingRef, Vec<String>>,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            send_frame(out_tx, &ServerFrame::Error {
                error: "invalid_json".into(),
                details: None,
            });
            return;
        }
    };

    let frame: ClientFrame = match serde_json::from_value(value.clone()) {
        Ok(f) => f,
        Err(_) => {
            let error = if value.get("action").is_some() {
                "unknown_action"
            } else {
                "invalid_json"
            };
            send_frame(out_tx, &ServerFrame::Error {
                error: error.into(),
                details: None,
            });
            return;
        }
    };

    match frame {
        ClientFrame::Ping => send_frame(out_tx, &ServerFrame::Pong),
        ClientFrame::Subscribe { meetings } => {
            handle_subscribe(state, account, meetings, cmd_tx, out_tx, subscriptions).await;
        }
        ClientFrame::Unsubscribe { meetings } => {
            handle_unsubscribe(meetings, cmd_tx, out_tx, subscriptions);
        }
    }
}

async fn handle_subscribe(
    state: &GatewayState,
    account: &crate::model::Account,
    meetings: Vec<MeetingRef>,
    cmd_tx: &mpsc::UnboundedSender<PubSubCmd>,
    out_tx: &mpsc::UnboundedSender<Message>,
    subscriptions: &mut HashMap<MeetingRef, Vec<String>>,
) {
    let request = AuthorizeSubscribeRequest { meetings };
    let resp = state
        .http
        .post(format!("{}/ws/authorize-subscribe", state.collector_base_url))
        .header("x-api-key", &account.api_key)
        .json(&request)
        .send()
        .await;

    let body: AuthorizeSubscribeResponse = match resp {
        Ok(r) => match r.json().await {
            Ok(b) => b,
            Err(e) => {
                send_frame(out_tx, &ServerFrame::Error {
                    error: "upstream_unavailable".into(),
                    details: Some(e.to_string()),
                });
                return;
            }
        },
        Err(e) => {
            send_frame(out_tx, &ServerFrame::Error {
                error: "upstream_unavailable".into(),
                details: Some(e.to_string()),
            });
            return;
        }
    };

    let mut channels = Vec::new();
    let mut confirmed = Vec::new();
    for authorized in &body.authorized {
        let meeting_ref = MeetingRef {
            platform: authorized.platform.clone(),
            native_id: authorized.native_id.clone(),
        };
        let meeting_id = authorized.meeting_id.to_string();
        let subscribed_channels = vec![mutable_channel(&meeting_id), status_channel(&meeting_id)];
        channels.extend(subscribed_channels.clone());
        subscriptions.insert(meeting_ref.clone(), subscribed_channels);
        confirmed.push(meeting_ref);
    }

    if !channels.is_empty() {
        let _ = cmd_tx.send(PubSubCmd::Subscribe(channels));
    }

    if !confirmed.is_empty() {
        send_frame(out_tx, &ServerFrame::Subscribed { meetings: confirmed });
    }
    for err in &body.errors {
        send_frame(out_tx, &ServerFrame::Error {
            error: err.error.clone(),
            details: Some(format!("{}/{}", err.platform, err.native_id)),
        });
    }
}

fn handle_unsubscribe(
    meetings: Vec<MeetingRef>,
    cmd_tx: &mpsc::UnboundedSender<PubSubCmd>,
    out_tx: &mpsc::UnboundedSender<Message>,
    subscriptions: &mut HashMap<MeetingRef, Vec<String>>,
) {
    let mut channels = Vec::new();
    for meeting_ref in &meetings {
        if let Some(chs) = subscriptions.remove(meeting_ref) {
            channels.extend(chs);
        }
    }
    if !channels.is_empty() {
        let _ = cmd_tx.send(PubSubCmd::Unsubscribe(channels));
    }
    send_frame(out_tx, &ServerFrame::Unsubscribed { meetings });
}

fn send_frame(out_tx: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) {
    if let Ok(json) = serde_json::to_string(frame) {
        let _ = out_tx.send(Message::Text(json));
    }
}

/// Owns the client's desired channel set, driven by subscribe/unsubscribe
/// commands from the socket-reader task, forwarding every received message
/// verbatim to the client's outbound queue (spec §4.4: upstream events are
/// forwarded as-is).
///
/// redis-rs's `PubSub::subscribe` needs exclusive access to the connection,
/// which conflicts with concurrently holding its `on_message` stream; rather
/// than fight that borrow, a channel-set change reopens a fresh pub/sub
/// connection subscribed to the updated set. Subscribe/unsubscribe traffic
/// per client is low-frequency, so the reconnect cost is immaterial.
async fn run_pubsub(
    redis_url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<PubSubCmd>,
    out_tx: mpsc::UnboundedSender<Message>,
) {
    let mut channels: Vec<String> = Vec::new();

    'reconnect: loop {
        let client = match redis::Client::open(redis_url.clone()) {
            Ok(c) => c,
            Err(e) => {
                warn!("gateway: failed to open redis client: {e}");
                return;
            }
        };
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(c) => c,
            Err(e) => {
                warn!("gateway: failed to open pubsub connection: {e}");
                return;
            }
        };
        for ch in &channels {
            if let Err(e) = pubsub.subscribe(ch).await {
                debug!("gateway: subscribe {ch} failed: {e}");
            }
        }

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(PubSubCmd::Subscribe(new_channels)) => {
                            for ch in new_channels {
                                if !channels.contains(&ch) {
                                    channels.push(ch);
                                }
                            }
                            continue 'reconnect;
                        }
                        Some(PubSubCmd::Unsubscribe(removed)) => {
                            channels.retain(|c| !removed.contains(c));
                            continue 'reconnect;
                        }
                        None => return,
                    }
                }
                msg = stream.next() => {
                    match msg {
                        Some(msg) => {
                            if let Ok(payload) = msg.get_payload::<String>() {
                                if out_tx.send(Message::Text(payload)).is_err() {
                                    return;
                                }
                            }
                        }
                        None => continue 'reconnect,
                    }
                }
            }
        }
    }
}
