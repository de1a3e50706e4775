use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::Error;
use crate::fsm::MeetingStatus;
use crate::model::{Account, Meeting, MeetingData, MeetingSession, Platform, TranscriptSegment};

/// Durable-store handle (spec §2's "Durable Store"). Wraps a Postgres pool;
/// migrations live under `migrations/` and are applied via
/// [`Db::migrate`], mirroring how `meeting-assistant-rs` owns its schema
/// alongside the binary rather than via an external migration tool.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(url)
            .await
            .map_err(Error::from)?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), Error> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::TransientBackend(e.to_string()))?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn account_by_api_key(&self, api_key: &str) -> Result<Option<Account>, Error> {
        let row = sqlx::query_as::<_, Account>(
            "SELECT id, api_key, api_secret, webhook_url, webhook_secret, max_concurrent_bots, enabled \
             FROM accounts WHERE api_key = $1",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Count non-terminal meetings for `(account, platform, native_id)`;
    /// used both for the uniqueness invariant and — summed across all
    /// tuples for the account — the `max_concurrent_bots` check (spec §4.1).
    pub async fn non_terminal_for_tuple(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        platform: Platform,
        native_meeting_id: &str,
    ) -> Result<Option<Meeting>, Error> {
        let row = sqlx::query_as::<_, MeetingRow>(
            "SELECT * FROM meetings \
             WHERE account_id = $1 AND platform = $2 AND native_meeting_id = $3 \
             AND status NOT IN ('completed', 'failed') \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(account_id)
        .bind(platform.as_tag())
        .bind(native_meeting_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn count_non_terminal_for_account(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
    ) -> Result<i64, Error> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM meetings WHERE account_id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(account_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(count)
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, Error> {
        self.pool.begin().await.map_err(Error::from)
    }

    pub async fn insert_meeting(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        meeting: &Meeting,
    ) -> Result<(), Error> {
        let data_json = serde_json::to_value(&meeting.data)
            .map_err(|e| Error::InvalidInput(format!("data encode: {e}")))?;
        sqlx::query(
            "INSERT INTO meetings \
             (id, account_id, platform, native_meeting_id, status, workload_handle, \
              start_time, end_time, data, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
        )
        .bind(meeting.id)
        .bind(meeting.account_id)
        .bind(meeting.platform.as_tag())
        .bind(&meeting.native_meeting_id)
        .bind(meeting.status.as_wire())
        .bind(&meeting.workload_handle)
        .bind(meeting.start_time)
        .bind(meeting.end_time)
        .bind(data_json)
        .bind(meeting.created_at)
        .bind(meeting.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get_meeting(&self, id: Uuid) -> Result<Option<Meeting>, Error> {
        let row = sqlx::query_as::<_, MeetingRow>("SELECT * FROM meetings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn get_meeting_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<Meeting>, Error> {
        let row = sqlx::query_as::<_, MeetingRow>("SELECT * FROM meetings WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn save_meeting(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        meeting: &Meeting,
    ) -> Result<(), Error> {
        let data_json = serde_json::to_value(&meeting.data)
            .map_err(|e| Error::InvalidInput(format!("data encode: {e}")))?;
        sqlx::query(
            "UPDATE meetings SET status=$2, workload_handle=$3, start_time=$4, end_time=$5, \
             data=$6, updated_at=$7 WHERE id=$1",
        )
        .bind(meeting.id)
        .bind(meeting.status.as_wire())
        .bind(&meeting.workload_handle)
        .bind(meeting.start_time)
        .bind(meeting.end_time)
        .bind(data_json)
        .bind(meeting.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Latest Meeting for a tuple regardless of status, used by transcript
    /// read and WS-authorize (as opposed to [`Db::non_terminal_for_tuple`],
    /// which is launch's uniqueness check).
    pub async fn latest_for_tuple(
        &self,
        account_id: Uuid,
        platform: Platform,
        native_meeting_id: &str,
    ) -> Result<Option<Meeting>, Error> {
        let row = sqlx::query_as::<_, MeetingRow>(
            "SELECT * FROM meetings \
             WHERE account_id = $1 AND platform = $2 AND native_meeting_id = $3 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(account_id)
        .bind(platform.as_tag())
        .bind(native_meeting_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_meetings_for_account(&self, account_id: Uuid) -> Result<Vec<Meeting>, Error> {
        let rows = sqlx::query_as::<_, MeetingRow>(
            "SELECT * FROM meetings WHERE account_id = $1 ORDER BY created_at DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn list_non_terminal_for_account(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<Meeting>, Error> {
        let rows = sqlx::query_as::<_, MeetingRow>(
            "SELECT * FROM meetings WHERE account_id = $1 AND status NOT IN ('completed','failed') \
             ORDER BY created_at DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Candidates for orphan reconciliation (spec §4.1): pre-terminal active
    /// states with a workload handle, stale `updated_at`, not too old.
    pub async fn reconciliation_candidates(
        &self,
        grace_period: chrono::Duration,
        max_age: chrono::Duration,
    ) -> Result<Vec<Meeting>, Error> {
        let now = Utc::now();
        let stale_before = now - grace_period;
        let created_after = now - max_age;
        let rows = sqlx::query_as::<_, MeetingRow>(
            "SELECT * FROM meetings \
             WHERE status IN ('active','joining','awaiting_admission') \
             AND workload_handle IS NOT NULL \
             AND updated_at < $1 \
             AND created_at > $2",
        )
        .bind(stale_before)
        .bind(created_after)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn insert_session(
        &self,
        meeting_id: Uuid,
        session_uid: &str,
        session_start_time: DateTime<Utc>,
    ) -> Result<MeetingSession, Error> {
        let row = sqlx::query_as::<_, MeetingSession>(
            "INSERT INTO meeting_sessions (id, meeting_id, session_uid, session_start_time) \
             VALUES ($1,$2,$3,$4) \
             ON CONFLICT (meeting_id, session_uid) DO UPDATE SET session_uid = EXCLUDED.session_uid \
             RETURNING id, meeting_id, session_uid, session_start_time",
        )
        .bind(Uuid::new_v4())
        .bind(meeting_id)
        .bind(session_uid)
        .bind(session_start_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn session_by_uid(&self, session_uid: &str) -> Result<Option<MeetingSession>, Error> {
        let row = sqlx::query_as::<_, MeetingSession>(
            "SELECT id, meeting_id, session_uid, session_start_time FROM meeting_sessions \
             WHERE session_uid = $1",
        )
        .bind(session_uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn sessions_for_meeting(&self, meeting_id: Uuid) -> Result<Vec<MeetingSession>, Error> {
        let rows = sqlx::query_as::<_, MeetingSession>(
            "SELECT id, meeting_id, session_uid, session_start_time FROM meeting_sessions \
             WHERE meeting_id = $1 ORDER BY session_start_time ASC",
        )
        .bind(meeting_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn insert_segments(
        &self,
        segments: &[TranscriptSegment],
    ) -> Result<(), Error> {
        if segments.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for seg in segments {
            sqlx::query(
                "INSERT INTO transcript_segments \
                 (id, meeting_id, session_uid, start_time, end_time, text, language, speaker, created_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) \
                 ON CONFLICT (meeting_id, start_time) DO NOTHING",
            )
            .bind(seg.id)
            .bind(seg.meeting_id)
            .bind(&seg.session_uid)
            .bind(seg.start_time)
            .bind(seg.end_time)
            .bind(&seg.text)
            .bind(&seg.language)
            .bind(&seg.speaker)
            .bind(seg.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn segments_for_meeting(
        &self,
        meeting_id: Uuid,
    ) -> Result<Vec<TranscriptSegment>, Error> {
        let rows = sqlx::query_as::<_, TranscriptSegment>(
            "SELECT id, meeting_id, session_uid, start_time, end_time, text, language, speaker, created_at \
             FROM transcript_segments WHERE meeting_id = $1 ORDER BY start_time ASC",
        )
        .bind(meeting_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_segments_for_meeting(&self, meeting_id: Uuid) -> Result<(), Error> {
        sqlx::query("DELETE FROM transcript_segments WHERE meeting_id = $1")
            .bind(meeting_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct MeetingRow {
    id: Uuid,
    account_id: Uuid,
    platform: String,
    native_meeting_id: String,
    status: String,
    workload_handle: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    data: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<MeetingRow> for Meeting {
    fn from(row: MeetingRow) -> Self {
        Meeting {
            id: row.id,
            account_id: row.account_id,
            platform: Platform::parse(&row.platform).unwrap_or(Platform::GoogleMeet),
            native_meeting_id: row.native_meeting_id,
            status: wire_to_status(&row.status),
            workload_handle: row.workload_handle,
            start_time: row.start_time,
            end_time: row.end_time,
            data: serde_json::from_value::<MeetingData>(row.data).unwrap_or_default(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn wire_to_status(s: &str) -> MeetingStatus {
    match s {
        "requested" => MeetingStatus::Requested,
        "joining" => MeetingStatus::Joining,
        "awaiting_admission" => MeetingStatus::AwaitingAdmission,
        "active" => MeetingStatus::Active,
        "stopping" => MeetingStatus::Stopping,
        "completed" => MeetingStatus::Completed,
        _ => MeetingStatus::Failed,
    }
}
