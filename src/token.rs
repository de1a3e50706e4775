use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

const ISS: &str = "bot-manager";
const AUD: &str = "transcription-collector";
const SCOPE: &str = "transcribe:write";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

/// Meeting Token claims (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingTokenClaims {
    pub meeting_id: Uuid,
    pub account_id: Uuid,
    pub platform: String,
    pub native_meeting_id: String,
    pub scope: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Mint a Meeting Token: `b64url(header).b64url(payload).b64url(hmac)`
/// (spec §6). `ttl` is how long the token remains valid.
pub fn mint(
    secret: &[u8],
    meeting_id: Uuid,
    account_id: Uuid,
    platform: &str,
    native_meeting_id: &str,
    ttl: Duration,
) -> Result<String, Error> {
    let now = Utc::now();
    let claims = MeetingTokenClaims {
        meeting_id,
        account_id,
        platform: platform.to_string(),
        native_meeting_id: native_meeting_id.to_string(),
        scope: SCOPE.to_string(),
        iss: ISS.to_string(),
        aud: AUD.to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
        jti: Uuid::new_v4().to_string(),
    };
    sign(&claims, secret)
}

fn sign(claims: &MeetingTokenClaims, secret: &[u8]) -> Result<String, Error> {
    let header = Header::default();
    let header_json = serde_json::to_vec(&header)
        .map_err(|e| Error::InvalidInput(format!("header encode: {e}")))?;
    let payload_json = serde_json::to_vec(claims)
        .map_err(|e| Error::InvalidInput(format!("payload encode: {e}")))?;

    let header_b64 = URL_SAFE_NO_PAD.encode(header_json);
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload_json);
    let signing_input = format!("{header_b64}.{payload_b64}");

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| Error::InvalidInput(format!("bad secret: {e}")))?;
    mac.update(signing_input.as_bytes());
    let sig = mac.finalize().into_bytes();
    let sig_b64 = URL_SAFE_NO_PAD.encode(sig);

    Ok(format!("{signing_input}.{sig_b64}"))
}

/// Verify a Meeting Token (spec §6): signature, `alg`, `typ`, `iss`, `aud`,
/// `scope`, non-expiry, and presence of `meeting_id`. Comparison of the
/// signature is constant-time (spec §9 design note).
pub fn verify(token: &str, secret: &[u8]) -> Result<MeetingTokenClaims, Error> {
    let mut parts = token.split('.');
    let header_b64 = parts
        .next()
        .ok_or_else(|| Error::AuthFailure("malformed token".into()))?;
    let payload_b64 = parts
        .next()
        .ok_or_else(|| Error::AuthFailure("malformed token".into()))?;
    let sig_b64 = parts
        .next()
        .ok_or_else(|| Error::AuthFailure("malformed token".into()))?;
    if parts.next().is_some() {
        return Err(Error::AuthFailure("malformed token".into()));
    }

    let header_json = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| Error::AuthFailure("bad header encoding".into()))?;
    let header: Header = serde_json::from_slice(&header_json)
        .map_err(|_| Error::AuthFailure("bad header".into()))?;
    if header.alg != "HS256" || header.typ != "JWT" {
        return Err(Error::AuthFailure("unsupported alg/typ".into()));
    }

    let signing_input = format!("{header_b64}.{payload_b64}");
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| Error::AuthFailure(format!("bad secret: {e}")))?;
    mac.update(signing_input.as_bytes());

    let given_sig = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| Error::AuthFailure("bad signature encoding".into()))?;

    // `verify_slice` performs a constant-time comparison internally (spec §9).
    mac.verify_slice(&given_sig)
        .map_err(|_| Error::AuthFailure("signature mismatch".into()))?;

    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| Error::AuthFailure("bad payload encoding".into()))?;
    let claims: MeetingTokenClaims = serde_json::from_slice(&payload_json)
        .map_err(|_| Error::AuthFailure("bad payload".into()))?;

    if claims.iss != ISS {
        return Err(Error::AuthFailure("bad issuer".into()));
    }
    if claims.aud != AUD {
        return Err(Error::AuthFailure("bad audience".into()));
    }
    if claims.scope != SCOPE {
        return Err(Error::AuthFailure("bad scope".into()));
    }
    let now = Utc::now().timestamp();
    if claims.exp <= now {
        return Err(Error::AuthFailure("token expired".into()));
    }

    Ok(claims)
}

pub fn expires_at(claims: &MeetingTokenClaims) -> DateTime<Utc> {
    DateTime::from_timestamp(claims.exp, 0).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> Vec<u8> {
        b"test-secret-key-do-not-use".to_vec()
    }

    #[test]
    fn mint_then_verify_round_trips() {
        let meeting_id = Uuid::new_v4();
        let account_id = Uuid::new_v4();
        let token = mint(
            &secret(),
            meeting_id,
            account_id,
            "google_meet",
            "abc-defg-hij",
            Duration::hours(1),
        )
        .unwrap();
        let claims = verify(&token, &secret()).unwrap();
        assert_eq!(claims.meeting_id, meeting_id);
        assert_eq!(claims.scope, "transcribe:write");
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = mint(
            &secret(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "zoom",
            "123456789",
            Duration::seconds(-10),
        )
        .unwrap();
        assert!(verify(&token, &secret()).is_err());
    }

    #[test]
    fn one_bit_flip_in_signature_rejects() {
        let token = mint(
            &secret(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "teams",
            "meeting-id-12345",
            Duration::hours(1),
        )
        .unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let mut sig_bytes = URL_SAFE_NO_PAD.decode(parts[2]).unwrap();
        sig_bytes[0] ^= 0x01;
        let flipped = URL_SAFE_NO_PAD.encode(sig_bytes);
        parts[2] = &flipped;
        let tampered = parts.join(".");
        assert!(verify(&tampered, &secret()).is_err());
    }

    #[test]
    fn wrong_secret_rejects() {
        let token = mint(
            &secret(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "google_meet",
            "abc-defg-hij",
            Duration::hours(1),
        )
        .unwrap();
        assert!(verify(&token, b"wrong-secret").is_err());
    }
}
