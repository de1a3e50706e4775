use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::fsm::MeetingStatus;
use crate::kv::{self, Kv};
use crate::model::{
    Account, CompletionReason, FailureStage, Meeting, MeetingData, Platform, StatusTransition,
    TransitionSource,
};
use crate::token;
use crate::webhook::{self, WebhookPayload};
use crate::workload::{self, WorkloadConfig, WorkloadRunState, WorkloadScheduler};

#[derive(Clone)]
pub struct ControllerState {
    pub db: Db,
    pub kv: Kv,
    pub scheduler: Arc<dyn WorkloadScheduler>,
    pub settings: Settings,
    pub http: reqwest::Client,
}

impl axum::extract::FromRef<ControllerState> for Db {
    fn from_ref(state: &ControllerState) -> Db {
        state.db.clone()
    }
}

#[derive(Debug, Deserialize)]
pub struct LaunchRequest {
    pub platform: String,
    pub native_meeting_id: String,
    #[serde(default)]
    pub bot_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub passcode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReconfigureRequest {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BotStatusChangePayload {
    pub connection_id: String,
    #[serde(default)]
    pub container_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error_details: Option<String>,
    #[serde(default)]
    pub platform_specific_error: Option<String>,
    #[serde(default)]
    pub completion_reason: Option<String>,
    #[serde(default)]
    pub failure_stage: Option<String>,
    #[serde(default)]
    pub timestamp: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ReconfigureCommand {
    pub action: &'static str,
    pub meeting_id: Uuid,
    pub language: Option<String>,
    pub task: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LeaveCommand {
    pub action: &'static str,
    pub meeting_id: Uuid,
}

fn status_event(meeting: &Meeting) -> serde_json::Value {
    serde_json::json!({
        "type": "meeting.status",
        "meeting": {
            "id": meeting.id,
            "platform": meeting.platform.as_tag(),
            "native_id": meeting.native_meeting_id,
        },
        "payload": { "status": meeting.status.as_wire() },
        "ts": Utc::now(),
    })
}

impl ControllerState {
    /// Bot Lifecycle Controller `launch` (spec §4.1).
    pub async fn launch(&self, account: &Account, req: LaunchRequest) -> Result<Meeting> {
        let platform = Platform::parse(&req.platform)
            .ok_or_else(|| Error::InvalidInput(format!("unknown platform: {}", req.platform)))?;
        platform
            .build_url(&req.native_meeting_id, req.passcode.as_deref())
            .ok_or_else(|| Error::InvalidInput("cannot construct meeting url".into()))?;

        let mut tx = self.db.begin().await?;

        if self
            .db
            .non_terminal_for_tuple(&mut tx, account.id, platform, &req.native_meeting_id)
            .await?
            .is_some()
        {
            return Err(Error::Conflict(
                "a non-terminal meeting already exists for this (account, platform, native id)"
                    .into(),
            ));
        }

        let active_count = self.db.count_non_terminal_for_account(&mut tx, account.id).await?;
        if active_count >= account.max_concurrent_bots as i64 {
            return Err(Error::LimitExceeded("max_concurrent_bots reached".into()));
        }

        let now = Utc::now();
        let meeting_id = Uuid::new_v4();
        let mut meeting = Meeting {
            id: meeting_id,
            account_id: account.id,
            platform,
            native_meeting_id: req.native_meeting_id.clone(),
            status: MeetingStatus::Requested,
            workload_handle: None,
            start_time: None,
            end_time: None,
            data: MeetingData::default(),
            created_at: now,
            updated_at: now,
        };
        meeting.data.status_transition.push(StatusTransition {
            from: MeetingStatus::Requested,
            to: MeetingStatus::Requested,
            timestamp: now,
            source: TransitionSource::User,
            reason: None,
        });

        self.db.insert_meeting(&mut tx, &meeting).await?;
        tx.commit().await?;

        self.publish_status(&meeting).await;
        self.fire_webhook(account, &meeting, "requested").await;

        let session_uid = Uuid::new_v4().to_string();
        let meeting_token = token::mint(
            self.settings.meeting_token_secret.as_bytes(),
            meeting.id,
            account.id,
            platform.as_tag(),
            &req.native_meeting_id,
            ChronoDuration::hours(6),
        )?;

        let workload_config = WorkloadConfig {
            platform: platform.as_tag().to_string(),
            meeting_url: platform
                .build_url(&req.native_meeting_id, req.passcode.as_deref())
                .expect("validated above"),
            bot_name: workload::normalize_bot_name(req.bot_name.as_deref()),
            meeting_token,
            native_meeting_id: req.native_meeting_id.clone(),
            session_uid,
            language: req.language.clone(),
            task: req.task.clone(),
            kv_endpoint: self.settings.redis_url.clone(),
            callback_url: format!(
                "{}/bots/internal/callback/status_change",
                self.settings.controller_callback_base_url
            ),
            waiting_room_timeout_secs: 600,
            no_one_joined_timeout_secs: 300,
            everyone_left_timeout_secs: 60,
        };

        match self.scheduler.schedule(&workload_config).await {
            Ok(handle) => {
                meeting.workload_handle = Some(handle);
                meeting.updated_at = Utc::now();
                let mut tx = self.db.begin().await?;
                self.db.save_meeting(&mut tx, &meeting).await?;
                tx.commit().await?;
                Ok(meeting)
            }
            Err(e) => {
                self.finalize(
                    &meeting,
                    MeetingStatus::Failed,
                    TransitionSource::ValidationError,
                    Some(CompletionReason::AdmissionFailed),
                    Some(FailureStage::Requested),
                    Some(e.to_string()),
                )
                .await?;
                Err(e)
            }
        }
    }

    /// Bot Lifecycle Controller `stop` (spec §4.1).
    pub async fn stop(&self, account: &Account, platform: Platform, native_id: &str) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let meeting = self
            .db
            .non_terminal_for_tuple(&mut tx, account.id, platform, native_id)
            .await?;
        tx.commit().await?;

        let Some(mut meeting) = meeting else {
            return Ok(()); // idempotent: nothing to stop
        };

        let age = Utc::now() - meeting.created_at;
        let is_pre_active = matches!(
            meeting.status,
            MeetingStatus::Requested | MeetingStatus::Joining | MeetingStatus::AwaitingAdmission
        );

        if is_pre_active && age < ChronoDuration::seconds(5) {
            meeting.data.stop_requested = true;
            if let Some(handle) = &meeting.workload_handle {
                let _ = self.scheduler.kill(handle).await;
            }
            self.finalize(
                &meeting,
                MeetingStatus::Completed,
                TransitionSource::User,
                Some(CompletionReason::Stopped),
                None,
                None,
            )
            .await?;
            return Ok(());
        }

        let command = LeaveCommand {
            action: "leave",
            meeting_id: meeting.id,
        };
        self.kv
            .publish(&kv::command_channel(&meeting.id.to_string()), &command)
            .await?;

        meeting.data.stop_requested = true;
        self.transition(&mut meeting, MeetingStatus::Stopping, TransitionSource::User, None)
            .await?;
        self.publish_status(&meeting).await;

        let state = self.clone();
        let handle = meeting.workload_handle.clone();
        let meeting_id = meeting.id;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            if let Some(handle) = &handle {
                let _ = state.scheduler.kill(handle).await;
            }
            match state.db.get_meeting(meeting_id).await {
                Ok(Some(meeting)) if !meeting.status.is_terminal() => {
                    if let Err(e) = state
                        .finalize(
                            &meeting,
                            MeetingStatus::Completed,
                            TransitionSource::User,
                            Some(CompletionReason::Stopped),
                            None,
                            None,
                        )
                        .await
                    {
                        tracing::warn!("stop safety-finalize failed for {meeting_id}: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("stop safety-finalize lookup failed for {meeting_id}: {e}"),
            }
        });

        Ok(())
    }

    /// Bot Lifecycle Controller `reconfigure` (spec §4.1).
    pub async fn reconfigure(
        &self,
        account: &Account,
        platform: Platform,
        native_id: &str,
        req: ReconfigureRequest,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let meeting = self
            .db
            .non_terminal_for_tuple(&mut tx, account.id, platform, native_id)
            .await?;
        tx.commit().await?;

        let meeting = meeting.ok_or_else(|| Error::NotFound("no meeting found".into()))?;
        if meeting.status != MeetingStatus::Active {
            return Err(Error::Conflict("meeting is not active".into()));
        }

        let command = ReconfigureCommand {
            action: "reconfigure",
            meeting_id: meeting.id,
            language: req.language,
            task: req.task,
        };
        self.kv
            .publish(&kv::command_channel(&meeting.id.to_string()), &command)
            .await?;
        Ok(())
    }

    /// Bot Lifecycle Controller `callback.status_change` (spec §4.1).
    pub async fn status_change(&self, payload: BotStatusChangePayload) -> Result<()> {
        let Some(session) = self.db.session_by_uid(&payload.connection_id).await? else {
            return Ok(()); // unresolvable session: ignore, never break the worker
        };
        let Some(mut meeting) = self.db.get_meeting(session.meeting_id).await? else {
            return Ok(());
        };

        let next = match payload.status.as_str() {
            "joining" => MeetingStatus::Joining,
            "awaiting_admission" => MeetingStatus::AwaitingAdmission,
            "active" => MeetingStatus::Active,
            "stopping" => MeetingStatus::Stopping,
            "completed" => MeetingStatus::Completed,
            "failed" => MeetingStatus::Failed,
            other => {
                tracing::warn!("unknown callback status: {other}");
                return Ok(());
            }
        };

        if meeting.data.stop_requested && !matches!(next, MeetingStatus::Completed | MeetingStatus::Failed) {
            return Ok(());
        }

        if let Some(container_id) = &payload.container_id {
            meeting.workload_handle = Some(container_id.clone());
        }
        if next == MeetingStatus::Active {
            meeting.start_time = Some(Utc::now());
        }

        let is_terminal = next.is_terminal();
        if is_terminal {
            meeting.end_time = Some(Utc::now());
            meeting.data.completion_reason = payload
                .completion_reason
                .as_deref()
                .and_then(parse_completion_reason);
            meeting.data.failure_stage = payload.failure_stage.as_deref().and_then(parse_failure_stage);
            meeting.data.last_error = payload.error_details.clone().or(payload.platform_specific_error.clone());
        }

        match self
            .transition(&mut meeting, next, TransitionSource::BotCallback, payload.reason.clone())
            .await
        {
            Ok(()) => {}
            Err(Error::InvalidTransition(msg)) => {
                tracing::warn!("ignored invalid callback transition: {msg}");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.publish_status(&meeting).await;
        if is_terminal {
            if let Some(account) = self.account_for(&meeting).await? {
                self.fire_webhook(&account, &meeting, meeting.status.as_wire()).await;
            }
        } else if payload.exit_code.map(|c| c != 0).unwrap_or(false) {
            let scheduler = self.scheduler.clone();
            let handle = meeting.workload_handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                if let Some(handle) = handle {
                    let _ = scheduler.kill(&handle).await;
                }
            });
        }

        Ok(())
    }

    /// Orphan reconciliation pass (spec §4.1).
    pub async fn reconcile_once(&self) -> Result<()> {
        let candidates = self
            .db
            .reconciliation_candidates(
                chrono::Duration::from_std(self.settings.orphan_grace_period).unwrap(),
                chrono::Duration::from_std(self.settings.reconciliation_max_age).unwrap(),
            )
            .await?;

        for meeting in candidates {
            let Some(handle) = meeting.workload_handle.clone() else {
                continue;
            };
            let state = match self.scheduler.inspect(&handle).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("reconcile: inspect failed for {}: {e}", meeting.id);
                    continue;
                }
            };

            let mut meeting = meeting;
            match state {
                WorkloadRunState::Running => continue,
                WorkloadRunState::Succeeded | WorkloadRunState::NotFound => {
                    let reason = if state == WorkloadRunState::NotFound {
                        CompletionReason::Stopped
                    } else {
                        CompletionReason::Normal
                    };
                    if let Err(e) = self
                        .finalize(
                            &meeting,
                            MeetingStatus::Completed,
                            TransitionSource::Reconciliation,
                            Some(reason),
                            None,
                            None,
                        )
                        .await
                    {
                        tracing::warn!("reconcile: finalize completed failed for {}: {e}", meeting.id);
                    }
                }
                WorkloadRunState::Failed => {
                    let stage = match meeting.status {
                        MeetingStatus::Joining => FailureStage::Joining,
                        MeetingStatus::AwaitingAdmission => FailureStage::WaitingRoom,
                        _ => FailureStage::Active,
                    };
                    meeting.data.last_error = Some("workload reported failure".into());
                    if let Err(e) = self
                        .finalize(
                            &meeting,
                            MeetingStatus::Failed,
                            TransitionSource::Reconciliation,
                            None,
                            Some(stage),
                            Some("workload failed".into()),
                        )
                        .await
                    {
                        tracing::warn!("reconcile: finalize failed for {}: {e}", meeting.id);
                    }
                }
                WorkloadRunState::Unknown => continue,
            }
        }
        Ok(())
    }

    async fn account_for(&self, meeting: &Meeting) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, Account>(
            "SELECT id, api_key, api_secret, webhook_url, webhook_secret, max_concurrent_bots, enabled \
             FROM accounts WHERE id = $1",
        )
        .bind(meeting.account_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row)
    }

    async fn transition(
        &self,
        meeting: &mut Meeting,
        next: MeetingStatus,
        source: TransitionSource,
        reason: Option<String>,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let Some(mut current) = self.db.get_meeting_for_update(&mut tx, meeting.id).await? else {
            return Err(Error::NotFound("meeting vanished mid-transition".into()));
        };
        let noop = current.status.validate_transition(next)?;
        if !noop {
            current.data.status_transition.push(StatusTransition {
                from: current.status,
                to: next,
                timestamp: Utc::now(),
                source,
                reason,
            });
            current.status = next;
        }
        current.start_time = meeting.start_time.or(current.start_time);
        current.end_time = meeting.end_time.or(current.end_time);
        current.workload_handle = meeting.workload_handle.clone().or(current.workload_handle.clone());
        current.data.completion_reason = meeting.data.completion_reason.or(current.data.completion_reason);
        current.data.failure_stage = meeting.data.failure_stage.or(current.data.failure_stage);
        current.data.last_error = meeting.data.last_error.clone().or(current.data.last_error.clone());
        current.data.stop_requested = meeting.data.stop_requested || current.data.stop_requested;
        current.updated_at = Utc::now();

        self.db.save_meeting(&mut tx, &current).await?;
        tx.commit().await?;
        *meeting = current;
        Ok(())
    }

    async fn finalize(
        &self,
        meeting: &Meeting,
        next: MeetingStatus,
        source: TransitionSource,
        completion_reason: Option<CompletionReason>,
        failure_stage: Option<FailureStage>,
        last_error: Option<String>,
    ) -> Result<()> {
        let mut meeting = meeting.clone();
        meeting.end_time = Some(Utc::now());
        meeting.data.completion_reason = completion_reason;
        meeting.data.failure_stage = failure_stage;
        meeting.data.last_error = last_error;
        self.transition(&mut meeting, next, source, None).await?;
        self.publish_status(&meeting).await;
        if let Some(account) = self.account_for(&meeting).await? {
            self.fire_webhook(&account, &meeting, meeting.status.as_wire()).await;
        }
        Ok(())
    }

    async fn publish_status(&self, meeting: &Meeting) {
        let channel = crate::kv::status_channel(&meeting.id.to_string());
        if let Err(e) = self.kv.publish(&channel, &status_event(meeting)).await {
            tracing::warn!("failed to publish status change for {}: {e}", meeting.id);
        }
    }

    async fn fire_webhook(&self, account: &Account, meeting: &Meeting, event: &str) {
        let Some(url) = account.webhook_url.clone() else {
            return;
        };
        let payload = WebhookPayload {
            meeting_id: meeting.id,
            account_id: account.id,
            event: event.to_string(),
            status: meeting.status,
            timestamp: Utc::now(),
        };
        let http = self.http.clone();
        let secret = account.webhook_secret.clone();
        tokio::spawn(async move {
            if let Err(e) = webhook::deliver(&http, &url, secret.as_deref(), &payload).await {
                tracing::warn!("webhook delivery failed: {e}");
            }
        });
    }
}

fn parse_completion_reason(s: &str) -> Option<CompletionReason> {
    match s {
        "normal" => Some(CompletionReason::Normal),
        "stopped" => Some(CompletionReason::Stopped),
        "waiting_room_timeout" => Some(CompletionReason::WaitingRoomTimeout),
        "no_one_joined_timeout" => Some(CompletionReason::NoOneJoinedTimeout),
        "everyone_left_timeout" => Some(CompletionReason::EveryoneLeftTimeout),
        "admission_failed" => Some(CompletionReason::AdmissionFailed),
        _ => None,
    }
}

fn parse_failure_stage(s: &str) -> Option<FailureStage> {
    match s {
        "requested" => Some(FailureStage::Requested),
        "joining" => Some(FailureStage::Joining),
        "waiting_room" => Some(FailureStage::WaitingRoom),
        "active" => Some(FailureStage::Active),
        _ => None,
    }
}

