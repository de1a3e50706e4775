use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::fsm::MeetingStatus;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub meeting_id: Uuid,
    pub account_id: Uuid,
    pub event: String,
    pub status: MeetingStatus,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Post-meeting / lifecycle webhook delivery, scheduled outside the FSM
/// transaction per spec §9's commit-then-publish discipline. Failures are
/// logged and retried with bounded backoff; delivery is best-effort (the
/// durable store, not the webhook, is authoritative).
pub async fn deliver(
    client: &reqwest::Client,
    url: &str,
    secret: Option<&str>,
    payload: &WebhookPayload,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;

    let mut builder = client
        .post(url)
        .header("content-type", "application/json");

    if let Some(secret) = secret {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
        mac.update(&body);
        let signature = hex::encode(mac.finalize().into_bytes());
        builder = builder.header("x-webhook-signature", signature);
    }

    const MAX_ATTEMPTS: u32 = 3;
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        let req = builder
            .try_clone()
            .expect("webhook request body is buffered, clone is infallible")
            .body(body.clone());
        match req.send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => {
                last_err = Some(anyhow::anyhow!("webhook responded {}", resp.status()));
            }
            Err(e) => last_err = Some(e.into()),
        }
        if attempt + 1 < MAX_ATTEMPTS {
            tokio::time::sleep(std::time::Duration::from_millis(250 * (1 << attempt))).await;
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("webhook delivery failed")))
}
