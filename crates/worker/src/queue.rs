//! Redis-backed event queue.
//!
//! Producers `LPUSH` JSON-encoded events onto the queue list. Workers take
//! them with `BLMOVE` into `<key>:processing` and remove them from there with
//! [`RedisEventQueue::ack`] once the intake has accepted the event. An entry
//! popped by a worker that dies before acking stays in the processing list
//! and is put back by [`RedisEventQueue::recover`] on the next start.
//!
//! Retries wait in a sorted set (`<key>:delayed`) scored by their due time in
//! milliseconds until [`RedisEventQueue::promote_due`] moves them back onto the
//! list, so a scheduled retry survives a worker restart and may run on any
//! worker.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;

use courier_common::error::QueueError;
use courier_common::redis_pool;
use courier_common::types::Event;
use courier_engine::scheduler::{RetryScheduler, ScheduleError};

/// Move up to ARGV[2] members of KEYS[1] scored at or below ARGV[1] onto the
/// list KEYS[2]. Runs atomically, so two workers never promote the same retry.
const PROMOTE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    redis.call('LPUSH', KEYS[2], member)
end
return #due
"#;

/// Move every member of the processing list KEYS[1] back onto the consuming
/// end of the queue KEYS[2], oldest first.
const RECOVER_PROCESSING: &str = r#"
local moved = 0
while redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT') do
    moved = moved + 1
end
return moved
"#;

/// A raw entry taken off the queue and parked in the processing list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    payload: String,
}

impl QueueEntry {
    pub fn decode(&self) -> Result<Event, QueueError> {
        decode(&self.payload)
    }
}

pub struct RedisEventQueue {
    /// Dedicated to `BLMOVE`, which holds its connection for the whole wait.
    blocking: ConnectionManager,
    commands: ConnectionManager,
    key: String,
    processing_key: String,
    delayed_key: String,
    promote: Script,
    recover: Script,
}

impl RedisEventQueue {
    pub async fn connect(redis_url: &str, key: impl Into<String>) -> anyhow::Result<Self> {
        let blocking = redis_pool::connect(redis_url).await?;
        let commands = redis_pool::connect(redis_url).await?;
        Ok(Self::new(blocking, commands, key))
    }

    pub fn new(
        blocking: ConnectionManager,
        commands: ConnectionManager,
        key: impl Into<String>,
    ) -> Self {
        let key = key.into();
        Self {
            blocking,
            commands,
            processing_key: processing_key(&key),
            delayed_key: delayed_key(&key),
            key,
            promote: Script::new(PROMOTE_DUE),
            recover: Script::new(RECOVER_PROCESSING),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Enqueue an event for immediate processing.
    pub async fn push(&self, event: &Event) -> Result<(), QueueError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.commands.clone();
        let _len: i64 = redis::cmd("LPUSH")
            .arg(&self.key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Wait up to `timeout` for the next entry.
    ///
    /// Returns `Ok(None)` when the wait times out. The entry stays in the
    /// processing list until it is passed to [`RedisEventQueue::ack`].
    pub async fn pop(&self, timeout: Duration) -> Result<Option<QueueEntry>, QueueError> {
        let mut conn = self.blocking.clone();
        let payload: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.key)
            .arg(&self.processing_key)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(payload.map(|payload| QueueEntry { payload }))
    }

    /// Drop a handled entry from the processing list.
    pub async fn ack(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        let _removed: i64 = redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&entry.payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Put entries left unacked by a previous run back on the queue.
    ///
    /// Returns the number of entries re-queued.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.commands.clone();
        let recovered: usize = self
            .recover
            .key(&self.processing_key)
            .key(&self.key)
            .invoke_async(&mut conn)
            .await?;

        if recovered > 0 {
            tracing::warn!(recovered, queue = %self.key, "Re-queued unacknowledged entries");
        }
        Ok(recovered)
    }

    /// Number of entries popped but not yet acknowledged.
    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.commands.clone();
        let len: usize = redis::cmd("LLEN")
            .arg(&self.processing_key)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Move retries whose due time has passed back onto the queue.
    ///
    /// Returns the number of events promoted.
    pub async fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> Result<usize, QueueError> {
        let mut conn = self.commands.clone();
        let promoted: usize = self
            .promote
            .key(&self.delayed_key)
            .key(&self.key)
            .arg(now.timestamp_millis())
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        if promoted > 0 {
            tracing::debug!(promoted, queue = %self.key, "Promoted due retries");
        }
        Ok(promoted)
    }

    /// Number of retries waiting in the delayed set.
    pub async fn delayed_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.commands.clone();
        let len: usize = redis::cmd("ZCARD")
            .arg(&self.delayed_key)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}

#[async_trait]
impl RetryScheduler for RedisEventQueue {
    async fn schedule(&self, event: Event, delay: Duration) -> Result<(), ScheduleError> {
        let payload = serde_json::to_string(&event).map_err(QueueError::from)?;
        let score = due_score(Utc::now(), delay);

        let mut conn = self.commands.clone();
        let _added: i64 = redis::cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(score)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::from)?;

        tracing::debug!(
            event_id = %event.event_id,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        Ok(())
    }
}

fn processing_key(key: &str) -> String {
    format!("{}:processing", key)
}

fn delayed_key(key: &str) -> String {
    format!("{}:delayed", key)
}

/// Sorted-set score for a retry due `delay` after `now`, in epoch milliseconds.
fn due_score(now: DateTime<Utc>, delay: Duration) -> i64 {
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_add(delay_ms)
}

fn decode(payload: &str) -> Result<Event, QueueError> {
    Ok(serde_json::from_str(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_derived_keys() {
        assert_eq!(delayed_key("courier:events"), "courier:events:delayed");
        assert_eq!(processing_key("courier:events"), "courier:events:processing");
    }

    #[test]
    fn test_entry_decode() {
        let entry = QueueEntry {
            payload: r#"{"event_id":"e1","entity_id":"r1","occurred_at":"2025-01-01T00:00:00Z"}"#
                .to_string(),
        };
        assert_eq!(entry.decode().unwrap().event_id, "e1");

        let garbage = QueueEntry {
            payload: "{".to_string(),
        };
        assert!(matches!(garbage.decode(), Err(QueueError::Malformed(_))));
    }

    #[test]
    fn test_due_score() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        assert_eq!(due_score(now, Duration::from_millis(1500)), 1_700_000_001_500);
        assert_eq!(due_score(now, Duration::ZERO), 1_700_000_000_000);
        assert_eq!(due_score(now, Duration::MAX), i64::MAX);
    }

    #[test]
    fn test_decode_event() {
        let event = decode(
            r#"{"event_id":"e1","entity_id":"r1","payload":{"pickup":"A","drop":"B"},"occurred_at":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(event.event_id, "e1");
        assert_eq!(event.recipient_id(), "r1");
    }

    #[test]
    fn test_decode_without_payload() {
        let event = decode(
            r#"{"event_id":"e2","entity_id":"r2","occurred_at":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(event.payload.pickup.is_none());
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            decode("not json"),
            Err(QueueError::Malformed(_))
        ));
        assert!(matches!(
            decode(r#"{"event_id":"e3"}"#),
            Err(QueueError::Malformed(_))
        ));
    }
}
