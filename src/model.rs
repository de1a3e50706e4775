use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fsm::MeetingStatus;

/// External tenant (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub api_key: String,
    pub api_secret: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub max_concurrent_bots: i32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    GoogleMeet,
    Teams,
    Zoom,
}

impl Platform {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Platform::GoogleMeet => "google_meet",
            Platform::Teams => "teams",
            Platform::Zoom => "zoom",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "google_meet" => Some(Platform::GoogleMeet),
            "teams" => Some(Platform::Teams),
            "zoom" => Some(Platform::Zoom),
            _ => None,
        }
    }

    /// Build the meeting-join URL for this platform, validating that
    /// `native_id` (and `passcode`, when required) are well-formed. Returns
    /// `None` if no URL can be constructed, per spec §4.1's launch-time
    /// validation and the round-trip testable property of spec §8.
    pub fn build_url(&self, native_id: &str, passcode: Option<&str>) -> Option<String> {
        if native_id.trim().is_empty() {
            return None;
        }
        match self {
            Platform::GoogleMeet => {
                // xxx-xxxx-xxx, lowercase letters and hyphens only.
                let re = regex::Regex::new(r"^[a-z]{3,4}-[a-z]{4}-[a-z]{3,4}$").unwrap();
                if !re.is_match(native_id) {
                    return None;
                }
                Some(format!("https://meet.google.com/{}", native_id))
            }
            Platform::Zoom => {
                let re = regex::Regex::new(r"^[0-9]{9,11}$").unwrap();
                if !re.is_match(native_id) {
                    return None;
                }
                let mut url = format!("https://zoom.us/j/{}", native_id);
                if let Some(pw) = passcode {
                    if !pw.is_empty() {
                        url.push_str(&format!("?pwd={}", pw));
                    }
                }
                Some(url)
            }
            Platform::Teams => {
                if native_id.len() < 5 {
                    return None;
                }
                Some(format!(
                    "https://teams.microsoft.com/l/meetup-join/{}",
                    native_id
                ))
            }
        }
    }

    /// Inverse of [`Platform::build_url`]: recover `(platform, native_id)`
    /// from a previously constructed URL, for the round-trip testable
    /// property of spec §8.
    pub fn parse_url(url: &str) -> Option<(Platform, String)> {
        if let Some(rest) = url.strip_prefix("https://meet.google.com/") {
            let native_id = rest.split('?').next().unwrap_or(rest).to_string();
            return Some((Platform::GoogleMeet, native_id));
        }
        if let Some(rest) = url.strip_prefix("https://zoom.us/j/") {
            let native_id = rest.split('?').next().unwrap_or(rest).to_string();
            return Some((Platform::Zoom, native_id));
        }
        if let Some(rest) = url.strip_prefix("https://teams.microsoft.com/l/meetup-join/") {
            let native_id = rest.split('?').next().unwrap_or(rest).to_string();
            return Some((Platform::Teams, native_id));
        }
        None
    }
}

/// One `{from,to,timestamp,source,reason?}` entry, append-only (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: MeetingStatus,
    pub to: MeetingStatus,
    pub timestamp: DateTime<Utc>,
    pub source: TransitionSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionSource {
    User,
    BotCallback,
    ValidationError,
    Reconciliation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Normal,
    Stopped,
    WaitingRoomTimeout,
    NoOneJoinedTimeout,
    EveryoneLeftTimeout,
    AdmissionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Requested,
    Joining,
    WaitingRoom,
    Active,
}

/// Semi-structured `data` bag carried on every Meeting (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeetingData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<CompletionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<FailureStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passcode: Option<String>,
    #[serde(default)]
    pub status_transition: Vec<StatusTransition>,
    #[serde(default)]
    pub stop_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub redacted: bool,
}

/// One bot execution attempt (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Uuid,
    pub account_id: Uuid,
    pub platform: Platform,
    pub native_meeting_id: String,
    pub status: MeetingStatus,
    pub workload_handle: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub data: MeetingData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Meeting {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One recognition connection within a Meeting (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MeetingSession {
    pub id: Uuid,
    pub meeting_id: Uuid,
    pub session_uid: String,
    pub session_start_time: DateTime<Utc>,
}

/// An immutable finalized segment (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TranscriptSegment {
    pub id: Uuid,
    pub meeting_id: Uuid,
    pub session_uid: String,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    pub language: Option<String>,
    pub speaker: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpeakerMappingStatus {
    Unknown,
    Mapped,
    NoSpeakerEvents,
    MultipleConcurrentSpeakers,
    ErrorInMapping,
}

/// The ephemeral, KV-resident mutable-segment payload (spec §3).
///
/// `start_time` is stored as a 3-decimal-formatted string key in the hash;
/// see [`crate::kv::format_start_key`] — this struct is only the value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutableSegment {
    pub text: String,
    pub end_time: f64,
    pub language: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub session_uid: String,
    pub speaker: Option<String>,
    pub speaker_mapping_status: SpeakerMappingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absolute_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absolute_end_time: Option<DateTime<Utc>>,
}

impl MutableSegment {
    /// Render-relevant fields compared for change-only publish (spec §4.2,
    /// design note in spec §9 on millisecond rounding).
    pub fn render_fields_eq(&self, other: &MutableSegment) -> bool {
        self.text == other.text
            && self.speaker == other.speaker
            && self.language == other.language
            && round_ms(self.end_time) == round_ms(other.end_time)
            && self.absolute_start_time == other.absolute_start_time
            && self.absolute_end_time == other.absolute_end_time
    }
}

pub fn round_ms(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpeakerEventType {
    SpeakerStart,
    SpeakerEnd,
}

/// One member of the `speaker_events:{session_uid}` sorted set (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerEvent {
    pub event_type: SpeakerEventType,
    pub participant_name: String,
    #[serde(default)]
    pub participant_id: Option<String>,
    pub uid: String,
    pub relative_client_timestamp_ms: i64,
}
