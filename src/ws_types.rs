use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A `(platform, native_id)` pair as carried in subscribe/unsubscribe frames
/// and the authorization request body (spec §4.4, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MeetingRef {
    pub platform: String,
    pub native_id: String,
}

/// Frames a Gateway client may send (spec §4.4).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { meetings: Vec<MeetingRef> },
    Unsubscribe { meetings: Vec<MeetingRef> },
    Ping,
}

/// Frames the Gateway sends back to a client, either direct replies or
/// relayed upstream events (spec §4.4).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed { meetings: Vec<MeetingRef> },
    Unsubscribed { meetings: Vec<MeetingRef> },
    Pong,
    Error { error: String, details: Option<String> },
    #[serde(rename = "transcript.mutable")]
    TranscriptMutable {
        meeting: MeetingIdRef,
        payload: Value,
        ts: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "meeting.status")]
    MeetingStatus {
        meeting: MeetingStatusRef,
        payload: Value,
        ts: chrono::DateTime<chrono::Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingIdRef {
    pub id: uuid::Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingStatusRef {
    pub id: uuid::Uuid,
    pub platform: String,
    pub native_id: String,
}

/// Body of `POST /ws/authorize-subscribe` (spec §4.2, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeSubscribeRequest {
    pub meetings: Vec<MeetingRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizedMeeting {
    pub platform: String,
    pub native_id: String,
    pub account_id: uuid::Uuid,
    pub meeting_id: uuid::Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeSubscribeResponse {
    pub authorized: Vec<AuthorizedMeeting>,
    pub errors: Vec<AuthorizeError>,
    pub account_id: uuid::Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeError {
    pub platform: String,
    pub native_id: String,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_parses_from_action_tag() {
        let json = r#"{"action":"subscribe","meetings":[{"platform":"zoom","native_id":"123456789"}]}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Subscribe { meetings } => assert_eq!(meetings.len(), 1),
            _ => panic!("expected subscribe"),
        }
    }

    #[test]
    fn ping_frame_needs_no_fields() {
        let json = r#"{"action":"ping"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));
    }

    #[test]
    fn pong_serializes_to_type_tag() {
        let value = serde_json::to_value(ServerFrame::Pong).unwrap();
        assert_eq!(value["type"], "pong");
    }
}
