use std::collections::HashMap;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;
use crate::model::MutableSegment;

/// Thin wrapper over a Redis connection manager exposing exactly the KV
/// substrate primitives named in spec §2/§6: hashes, streams with consumer
/// groups, sorted sets, sets, and pub/sub. Kept deliberately narrow so call
/// sites read like the spec's key/channel table rather than raw Redis
/// calls.
#[derive(Clone)]
pub struct Kv {
    conn: ConnectionManager,
}

pub fn format_start_key(start_time: f64) -> String {
    format!("{:.3}", start_time)
}

const ACTIVE_MEETINGS_KEY: &str = "active_meetings";

fn segments_hash_key(meeting_id: &str) -> String {
    format!("meeting:{meeting_id}:segments")
}

fn speaker_events_key(session_uid: &str) -> String {
    format!("speaker_events:{session_uid}")
}

fn session_start_key(session_uid: &str) -> String {
    format!("meeting_session:{session_uid}:start")
}

pub fn mutable_channel(meeting_id: &str) -> String {
    format!("tc:meeting:{meeting_id}:mutable")
}

pub fn status_channel(meeting_id: &str) -> String {
    format!("bm:meeting:{meeting_id}:status")
}

pub fn command_channel(meeting_id: &str) -> String {
    format!("bot_commands:meeting:{meeting_id}")
}

impl Kv {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(Error::from)?;
        let conn = ConnectionManager::new(client).await.map_err(Error::from)?;
        Ok(Self { conn })
    }

    pub async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    // ---- active_meetings set --------------------------------------------

    pub async fn mark_active_meeting(&self, meeting_id: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        conn.sadd(ACTIVE_MEETINGS_KEY, meeting_id).await?;
        Ok(())
    }

    pub async fn active_meetings(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(ACTIVE_MEETINGS_KEY).await?;
        Ok(members)
    }

    pub async fn remove_active_meeting(&self, meeting_id: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        conn.srem(ACTIVE_MEETINGS_KEY, meeting_id).await?;
        Ok(())
    }

    // ---- mutable-segment hash --------------------------------------------

    pub async fn get_segment(
        &self,
        meeting_id: &str,
        start_time: f64,
    ) -> Result<Option<MutableSegment>, Error> {
        let mut conn = self.conn.clone();
        let key = segments_hash_key(meeting_id);
        let field = format_start_key(start_time);
        let raw: Option<String> = conn.hget(&key, &field).await?;
        match raw {
            Some(s) => Ok(Some(
                serde_json::from_str(&s)
                    .map_err(|e| Error::TransientBackend(format!("corrupt segment json: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    pub async fn all_segments(
        &self,
        meeting_id: &str,
    ) -> Result<Vec<(f64, MutableSegment)>, Error> {
        let mut conn = self.conn.clone();
        let key = segments_hash_key(meeting_id);
        let raw: HashMap<String, String> = conn.hgetall(&key).await?;
        let mut out = Vec::with_capacity(raw.len());
        for (field, value) in raw {
            let start: f64 = field
                .parse()
                .map_err(|_| Error::TransientBackend(format!("bad segment field: {field}")))?;
            let seg: MutableSegment = serde_json::from_str(&value)
                .map_err(|e| Error::TransientBackend(format!("corrupt segment json: {e}")))?;
            out.push((start, seg));
        }
        out.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        Ok(out)
    }

    /// Write a segment, refresh the hash TTL, and mark the meeting active,
    /// all in one pipeline (spec §4.2's "pipeline: add meeting id ... HSET").
    pub async fn put_segment(
        &self,
        meeting_id: &str,
        start_time: f64,
        segment: &MutableSegment,
        ttl: std::time::Duration,
    ) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = segments_hash_key(meeting_id);
        let field = format_start_key(start_time);
        let value = serde_json::to_string(segment)
            .map_err(|e| Error::TransientBackend(format!("segment encode: {e}")))?;

        let _: () = redis::pipe()
            .atomic()
            .sadd(ACTIVE_MEETINGS_KEY, meeting_id)
            .ignore()
            .hset(&key, &field, &value)
            .ignore()
            .expire(&key, ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn delete_segment_fields(
        &self,
        meeting_id: &str,
        fields: &[String],
    ) -> Result<(), Error> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let key = segments_hash_key(meeting_id);
        conn.hdel(&key, fields).await?;
        Ok(())
    }

    pub async fn delete_segments_hash(&self, meeting_id: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = segments_hash_key(meeting_id);
        let _: () = conn.del(&key).await?;
        Ok(())
    }

    // ---- speaker events sorted set ---------------------------------------

    pub async fn add_speaker_event(
        &self,
        session_uid: &str,
        score: i64,
        payload: &str,
        ttl: std::time::Duration,
    ) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = speaker_events_key(session_uid);
        let _: () = redis::pipe()
            .atomic()
            .zadd(&key, payload, score)
            .ignore()
            .expire(&key, ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn speaker_events_in_range(
        &self,
        session_uid: &str,
        min_score: i64,
        max_score: i64,
    ) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        let key = speaker_events_key(session_uid);
        let members: Vec<String> = conn.zrangebyscore(&key, min_score, max_score).await?;
        Ok(members)
    }

    pub async fn delete_speaker_events(&self, session_uid: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = speaker_events_key(session_uid);
        let _: () = conn.del(&key).await?;
        Ok(())
    }

    // ---- session-start cache ----------------------------------------------

    pub async fn cache_session_start(
        &self,
        session_uid: &str,
        start: DateTime<Utc>,
        ttl: std::time::Duration,
    ) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = session_start_key(session_uid);
        conn.set_ex::<_, _, ()>(&key, start.to_rfc3339(), ttl.as_secs())
            .await?;
        Ok(())
    }

    pub async fn cached_session_start(
        &self,
        session_uid: &str,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let mut conn = self.conn.clone();
        let key = session_start_key(session_uid);
        let raw: Option<String> = conn.get(&key).await?;
        Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))))
    }

    pub async fn delete_session_start_cache(&self, session_uid: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = session_start_key(session_uid);
        let _: () = conn.del(&key).await?;
        Ok(())
    }

    // ---- pub/sub ------------------------------------------------------------

    pub async fn publish<T: Serialize>(&self, channel: &str, message: &T) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(message)
            .map_err(|e| Error::TransientBackend(format!("publish encode: {e}")))?;
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    /// Open a dedicated pub/sub connection subscribed to `channels`. Used by
    /// the Fan-Out Gateway, which needs a long-lived subscriber distinct
    /// from the pooled command connection.
    pub async fn subscribe(&self, url: &str, channels: &[String]) -> Result<redis::aio::PubSub, Error> {
        let client = redis::Client::open(url).map_err(Error::from)?;
        let mut pubsub = client.get_async_pubsub().await.map_err(Error::from)?;
        for ch in channels {
            pubsub.subscribe(ch).await.map_err(Error::from)?;
        }
        Ok(pubsub)
    }

    // ---- streams / consumer groups ----------------------------------------

    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    pub async fn xadd<T: Serialize>(&self, stream: &str, payload: &T) -> Result<String, Error> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(payload)
            .map_err(|e| Error::TransientBackend(format!("xadd encode: {e}")))?;
        let id: String = conn.xadd(stream, "*", &[("payload", body)]).await?;
        Ok(id)
    }

    /// Read up to `count` new messages for `consumer` in `group`, blocking
    /// up to `block_ms` if none are ready (spec §4.2 step 1).
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<StreamMessage>, Error> {
        let mut conn = self.conn.clone();
        let opts = redis::streams::StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);
        let reply: redis::streams::StreamReadReply = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .unwrap_or_default();
        Ok(parse_stream_reply(reply))
    }

    pub async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), Error> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, ids).await?;
        Ok(())
    }

    /// List pending entries idle longer than `min_idle_ms` and claim them
    /// to `consumer` (spec §4.2's stale-claimer).
    pub async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: i64,
        count: usize,
    ) -> Result<Vec<StreamMessage>, Error> {
        let mut conn = self.conn.clone();
        let pending: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await
            .unwrap_or(redis::streams::StreamPendingCountReply { ids: Vec::new() });

        let ids: Vec<String> = pending.ids.iter().map(|i| i.id.clone()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let reply: redis::streams::StreamClaimReply = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(ids)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| StreamMessage {
                id: entry.id,
                payload: entry
                    .map
                    .get("payload")
                    .and_then(|v| match v {
                        redis::Value::BulkString(b) => String::from_utf8(b.clone()).ok(),
                        _ => None,
                    })
                    .unwrap_or_default(),
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub id: String,
    pub payload: String,
}

impl StreamMessage {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_str(&self.payload)
            .map_err(|e| Error::ProtocolMalformed(format!("bad stream payload: {e}")))
    }
}

fn parse_stream_reply(reply: redis::streams::StreamReadReply) -> Vec<StreamMessage> {
    let mut out = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            let payload = id
                .map
                .get("payload")
                .and_then(|v| match v {
                    redis::Value::BulkString(b) => String::from_utf8(b.clone()).ok(),
                    _ => None,
                })
                .unwrap_or_default();
            out.push(StreamMessage { id: id.id, payload });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_start_key_is_three_decimals() {
        assert_eq!(format_start_key(1.0), "1.000");
        assert_eq!(format_start_key(12.3456), "12.346");
        assert_eq!(format_start_key(0.0), "0.000");
    }

    #[test]
    fn channel_names_match_spec_table() {
        assert_eq!(mutable_channel("m1"), "tc:meeting:m1:mutable");
        assert_eq!(status_channel("m1"), "bm:meeting:m1:status");
        assert_eq!(command_channel("m1"), "bot_commands:meeting:m1");
    }
}
