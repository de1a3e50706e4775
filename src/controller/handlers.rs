use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{http::StatusCode, Json, Router};

use crate::controller::service::{
    BotStatusChangePayload, ControllerState, LaunchRequest, ReconfigureRequest,
};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{Account, Meeting, Platform};

pub fn router(state: ControllerState) -> Router {
    Router::new()
        .route("/bots", post(launch))
        .route("/bots/status", get(status))
        .route("/bots/:platform/:native_id", delete(stop))
        .route("/bots/:platform/:native_id/config", put(reconfigure))
        .route("/bots/internal/callback/status_change", post(status_change))
        .with_state(state)
}

async fn authed_account(state: &ControllerState, headers: &axum::http::HeaderMap) -> Result<Account> {
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

async fn launch(
    State(state): State<ControllerState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<LaunchRequest>,
) -> Result<impl IntoResponse> {
    let account = authed_account(&state, &headers).await?;
    let meeting = state.launch(&account, req).await?;
    Ok((StatusCode::CREATED, Json(meeting)))
}

async fn status(
    State(state): State<ControllerState>,
    headers: axum::http::HeaderMap,
) -> Result<impl IntoResponse> {
    let account = authed_account(&state, &headers).await?;
    let meetings: Vec<Meeting> = state.db.list_non_terminal_for_account(account.id).await?;
    Ok(Json(meetings))
}

async fn stop(
    State(state): State<ControllerState>,
    headers: axum::http::HeaderMap,
    Path((platform, native_id)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let account = authed_account(&state, &headers).await?;
    let platform = parse_platform(&platform)?;
    state.stop(&account, platform, &native_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn reconfigure(
    State(state): State<ControllerState>,
    headers: axum::http::HeaderMap,
    Path((platform, native_id)): Path<(String, String)>,
    Json(req): Json<ReconfigureRequest>,
) -> Result<impl IntoResponse> {
    let account = authed_account(&state, &headers).await?;
    let platform = parse_platform(&platform)?;
    state.reconfigure(&account, platform, &native_id, req).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Internal worker callback. Per the spec §4.1 failure model, callback
/// resolution errors are swallowed into a 200 "ignored" body instead of
/// bubbling an error status — the worker must never see a failure here.
async fn status_change(
    State(state): State<ControllerState>,
    Json(payload): Json<BotStatusChangePayload>,
) -> impl IntoResponse {
    match state.status_change(payload).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))),
        Err(e) => {
            tracing::warn!("status_change callback error (ignored): {e}");
            (
                StatusCode::OK,
                Json(serde_json::json!({"status": "ignored", "error": e.to_string()})),
            )
        }
    }
}
