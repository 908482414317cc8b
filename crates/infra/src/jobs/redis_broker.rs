//! Redis-backed broker.
//!
//! Layout under the key prefix:
//! - `{prefix}:job:{id}`: the JSON record. Gets a TTL once terminal.
//! - `{prefix}:{queue}:waiting`: sorted set of ids scored by visibility time (ms).
//! - `{prefix}:{queue}:active`: sorted set of ids scored by last heartbeat (ms).
//! - `{prefix}:{queue}:completed` / `:failed`: ids scored by finish time (ms).
//!
//! Every state change goes through [`SWAP_SCRIPT`]: the record is replaced
//! only if it still holds the exact JSON the caller read, and its id moves
//! between sets in the same script. A record and its index entry therefore
//! never disagree, even when the caller is cancelled halfway.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::{debug, warn};

use feedback_core::JobId;

use super::broker::{cutoff, Broker, BrokerError, JobCounts};
use super::types::{JobRecord, JobState, QueueName};

const DEFAULT_PREFIX: &str = "feedback";

/// Visible waiting ids looked at per claim.
const CLAIM_BATCH: usize = 8;

/// Attempts at an owned update before giving up on a record that keeps changing.
const SWAP_RETRIES: usize = 5;

/// Compare-and-swap a record and move its id between state sets.
///
/// KEYS: record key, source set, target set.
/// ARGV: expected JSON, new JSON, id, target score, TTL seconds (0 for none).
const SWAP_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
if redis.call('ZREM', KEYS[2], ARGV[3]) == 0 then
    return 0
end
redis.call('ZADD', KEYS[3], ARGV[4], ARGV[3])
if tonumber(ARGV[5]) > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[5])
else
    redis.call('SET', KEYS[1], ARGV[2])
end
return 1
"#;

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
            Self::Connection(e.to_string())
        } else {
            Self::Storage(e.to_string())
        }
    }
}

/// A record and the exact JSON it was read from.
struct Stored {
    raw: String,
    record: JobRecord,
}

#[derive(Clone)]
pub struct RedisBroker {
    conn: MultiplexedConnection,
    prefix: String,
    retention: Duration,
    swap_script: Script,
}

impl RedisBroker {
    /// Connect to `redis_url` (e.g. `redis://:password@localhost:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
            retention: Duration::from_secs(86_400),
            swap_script: Script::new(SWAP_SCRIPT),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// TTL applied to records when they reach a terminal state.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn state_key(&self, queue: QueueName, state: JobState) -> String {
        format!("{}:{}:{}", self.prefix, queue, state)
    }

    fn ttl_secs(&self) -> u64 {
        self.retention.as_secs().max(1)
    }

    async fn load_raw(&self, id: JobId) -> Result<Option<Stored>, BrokerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(id))
            .query_async(&mut conn)
            .await?;
        raw.map(|raw| -> Result<Stored, BrokerError> {
            let record = serde_json::from_str(&raw)?;
            Ok(Stored { raw, record })
        })
        .transpose()
    }

    async fn load_many(&self, ids: &[String]) -> Result<Vec<JobRecord>, BrokerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}:job:{}", self.prefix, id))
            .collect();
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
        raw.into_iter()
            .flatten()
            .map(|s| serde_json::from_str(&s).map_err(BrokerError::from))
            .collect()
    }

    async fn drop_index_entry(
        &self,
        queue: QueueName,
        state: JobState,
        raw_id: &str,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREM")
            .arg(self.state_key(queue, state))
            .arg(raw_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Replace `expected` with `next` and move the id from `from` to the set
    /// of `next.state`. False when the record or its index entry changed since
    /// `expected` was read.
    async fn swap(
        &self,
        expected: &str,
        next: &JobRecord,
        from: JobState,
        score: DateTime<Utc>,
    ) -> Result<bool, BrokerError> {
        let json = serde_json::to_string(next)?;
        let ttl = if next.state.is_terminal() { self.ttl_secs() } else { 0 };
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .swap_script
            .key(self.job_key(next.id))
            .key(self.state_key(next.queue_name, from))
            .key(self.state_key(next.queue_name, next.state))
            .arg(expected)
            .arg(json)
            .arg(next.id.to_string())
            .arg(score.timestamp_millis())
            .arg(ttl)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    /// Apply `change` to the stored record as long as `attempt` still holds it.
    /// `change` returns the score the id is filed under afterwards.
    async fn update_held<F>(
        &self,
        id: JobId,
        attempt: u32,
        mut change: F,
    ) -> Result<JobRecord, BrokerError>
    where
        F: FnMut(&mut JobRecord) -> Result<DateTime<Utc>, BrokerError> + Send,
    {
        for _ in 0..SWAP_RETRIES {
            let stored = self.load_raw(id).await?.ok_or(BrokerError::NotFound(id))?;
            if !stored.record.is_held_by(attempt) {
                return Err(BrokerError::LostOwnership(id));
            }
            let mut next = stored.record;
            let score = change(&mut next)?;
            if self.swap(&stored.raw, &next, JobState::Active, score).await? {
                return Ok(next);
            }
        }
        Err(BrokerError::Storage(format!(
            "job {id} changed under {SWAP_RETRIES} consecutive updates"
        )))
    }

    /// Write a new record and file its id under its current state.
    async fn insert(&self, record: &JobRecord, score: DateTime<Utc>) -> Result<(), BrokerError> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.job_key(record.id))
            .arg(json)
            .ignore()
            .cmd("ZADD")
            .arg(self.state_key(record.queue_name, record.state))
            .arg(score.timestamp_millis())
            .arg(record.id.to_string())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Score an id is filed under for the record's current state.
fn index_score(record: &JobRecord, now: DateTime<Utc>) -> DateTime<Utc> {
    match record.state {
        JobState::Waiting => record.available_at,
        JobState::Active => record.heartbeat_at.or(record.last_attempt_at).unwrap_or(now),
        JobState::Completed | JobState::Failed => record.finished_at.unwrap_or(now),
    }
}

fn parse_id(raw_id: &str) -> Result<JobId, BrokerError> {
    raw_id
        .parse()
        .map_err(|e: feedback_core::DomainError| BrokerError::Storage(e.to_string()))
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, record: JobRecord) -> Result<JobId, BrokerError> {
        if record.state != JobState::Waiting {
            return Err(BrokerError::Storage(format!(
                "push of job {} in state {}",
                record.id, record.state
            )));
        }
        self.insert(&record, record.available_at).await?;
        Ok(record.id)
    }

    async fn claim(&self, queue: QueueName) -> Result<Option<JobRecord>, BrokerError> {
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let candidates: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.state_key(queue, JobState::Waiting))
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(CLAIM_BATCH)
            .query_async(&mut conn)
            .await?;

        for raw_id in candidates {
            let id = parse_id(&raw_id)?;
            let Some(stored) = self.load_raw(id).await? else {
                warn!(job_id = %id, queue = %queue, "waiting id has no record; dropping");
                self.drop_index_entry(queue, JobState::Waiting, &raw_id).await?;
                continue;
            };
            if stored.record.state != JobState::Waiting {
                continue;
            }

            let mut record = stored.record;
            record.mark_active(now)?;
            // Losing the swap means another consumer took it first.
            if self.swap(&stored.raw, &record, JobState::Waiting, now).await? {
                debug!(job_id = %id, queue = %queue, attempt = record.attempts, "claimed job");
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn peek(&self, id: JobId) -> Result<Option<JobRecord>, BrokerError> {
        Ok(self.load_raw(id).await?.map(|stored| stored.record))
    }

    async fn update_progress(
        &self,
        id: JobId,
        attempt: u32,
        progress: u8,
    ) -> Result<(), BrokerError> {
        self.update_held(id, attempt, |record| {
            let now = Utc::now();
            record.set_progress(progress)?;
            record.touch(now)?;
            Ok(now)
        })
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, id: JobId, attempt: u32) -> Result<(), BrokerError> {
        self.update_held(id, attempt, |record| {
            let now = Utc::now();
            record.touch(now)?;
            Ok(now)
        })
        .await?;
        Ok(())
    }

    async fn ack(&self, record: &JobRecord) -> Result<(), BrokerError> {
        if !record.state.is_terminal() {
            return Err(BrokerError::Storage(format!(
                "ack of non-terminal job {} ({})",
                record.id, record.state
            )));
        }
        self.update_held(record.id, record.attempts, |stored| {
            *stored = record.clone();
            Ok(index_score(stored, Utc::now()))
        })
        .await?;
        Ok(())
    }

    async fn nack(&self, record: &JobRecord, retry_delay: Duration) -> Result<(), BrokerError> {
        if record.state != JobState::Waiting {
            return Err(BrokerError::Storage(format!(
                "nack of job {} in state {}",
                record.id, record.state
            )));
        }
        let delay = chrono::Duration::from_std(retry_delay).unwrap_or_default();
        self.update_held(record.id, record.attempts, |stored| {
            *stored = record.clone();
            stored.available_at = Utc::now() + delay;
            Ok(stored.available_at)
        })
        .await?;
        Ok(())
    }

    async fn list(
        &self,
        queue: QueueName,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, BrokerError> {
        let states: Vec<JobState> = match state {
            Some(s) => vec![s],
            None => JobState::ALL.to_vec(),
        };

        let mut conn = self.conn.clone();
        let mut ids = Vec::new();
        for s in states {
            let mut chunk: Vec<String> = redis::cmd("ZRANGE")
                .arg(self.state_key(queue, s))
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?;
            ids.append(&mut chunk);
        }

        let mut records = self.load_many(&ids).await?;
        records.sort_by_key(|j| (j.created_at, j.id));
        records.truncate(limit);
        Ok(records)
    }

    async fn counts(&self, queue: QueueName) -> Result<JobCounts, BrokerError> {
        let mut conn = self.conn.clone();
        let card = |state: JobState| {
            let mut cmd = redis::cmd("ZCARD");
            cmd.arg(self.state_key(queue, state));
            cmd
        };
        let (waiting, active, completed, failed): (usize, usize, usize, usize) = redis::pipe()
            .add_command(card(JobState::Waiting))
            .add_command(card(JobState::Active))
            .add_command(card(JobState::Completed))
            .add_command(card(JobState::Failed))
            .query_async(&mut conn)
            .await?;
        Ok(JobCounts {
            waiting,
            active,
            completed,
            failed,
        })
    }

    async fn recover_stalled(
        &self,
        queue: QueueName,
        stall_timeout: Duration,
    ) -> Result<usize, BrokerError> {
        let now = Utc::now();
        let stalled_before = cutoff(now, stall_timeout);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.state_key(queue, JobState::Active))
            .arg("-inf")
            .arg(stalled_before.timestamp_millis())
            .query_async(&mut conn)
            .await?;

        let mut recovered = 0;
        for raw_id in ids {
            let id = parse_id(&raw_id)?;
            let Some(stored) = self.load_raw(id).await? else {
                self.drop_index_entry(queue, JobState::Active, &raw_id).await?;
                continue;
            };

            let mut job = stored.record;
            if job.state != JobState::Active {
                // Filed under the wrong set; move it to the one its state names.
                warn!(job_id = %id, state = %job.state, "re-indexing job found in active set");
                let score = index_score(&job, now);
                self.swap(&stored.raw, &job, JobState::Active, score).await?;
                continue;
            }
            if !job.is_stalled(stalled_before) {
                continue;
            }

            job.mark_stalled(now)?;
            if self
                .swap(&stored.raw, &job, JobState::Active, index_score(&job, now))
                .await?
            {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn purge_expired(&self, retention: Duration) -> Result<usize, BrokerError> {
        let expire_before = cutoff(Utc::now(), retention).timestamp_millis();
        let mut conn = self.conn.clone();
        let mut purged = 0;

        for queue in QueueName::ALL {
            for state in [JobState::Completed, JobState::Failed] {
                let set = self.state_key(queue, state);
                let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                    .arg(&set)
                    .arg("-inf")
                    .arg(format!("({expire_before}"))
                    .query_async(&mut conn)
                    .await?;
                if ids.is_empty() {
                    continue;
                }

                let keys: Vec<String> = ids
                    .iter()
                    .map(|id| format!("{}:job:{}", self.prefix, id))
                    .collect();
                redis::pipe()
                    .atomic()
                    .cmd("DEL")
                    .arg(&keys)
                    .ignore()
                    .cmd("ZREM")
                    .arg(&set)
                    .arg(&ids)
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                purged += ids.len();
            }
        }
        Ok(purged)
    }
}

/// These run against a live server and are skipped unless `REDIS_URL` is set.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobType, Payload, RetryPolicy, STALLED_REASON};
    use serde_json::json;

    async fn broker() -> Option<RedisBroker> {
        let url = std::env::var("REDIS_URL").ok()?;
        let prefix = format!("feedback-test-{}", JobId::new());
        Some(RedisBroker::connect(&url).await.ok()?.with_prefix(prefix))
    }

    fn record() -> JobRecord {
        let payload: Payload = json!({"username": "alice", "content": "hi"})
            .as_object()
            .cloned()
            .unwrap();
        JobRecord::new(JobType::SaveMessage, payload, RetryPolicy::fixed(2, Duration::ZERO))
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_ack_is_terminal() {
        let Some(broker) = broker().await else { return };
        let id = broker.push(record()).await.unwrap();

        let mut claimed = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert!(broker.claim(QueueName::MessagePersist).await.unwrap().is_none());

        broker.update_progress(id, claimed.attempts, 40).await.unwrap();
        broker.heartbeat(id, claimed.attempts).await.unwrap();
        assert_eq!(broker.peek(id).await.unwrap().unwrap().progress, 40);

        claimed.mark_completed(json!({"success": true}), Utc::now()).unwrap();
        broker.ack(&claimed).await.unwrap();

        let counts = broker.counts(QueueName::MessagePersist).await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 0);
        assert_eq!(broker.peek(id).await.unwrap().unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn stalled_job_returns_to_waiting_then_fails() {
        let Some(broker) = broker().await else { return };
        let id = broker.push(record()).await.unwrap();

        broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        assert_eq!(
            broker.recover_stalled(QueueName::MessagePersist, Duration::ZERO).await.unwrap(),
            1
        );
        assert_eq!(broker.peek(id).await.unwrap().unwrap().state, JobState::Waiting);

        broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        broker.recover_stalled(QueueName::MessagePersist, Duration::ZERO).await.unwrap();

        let job = broker.peek(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some(STALLED_REASON));
        assert_eq!(
            broker.list(QueueName::MessagePersist, Some(JobState::Failed), 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn superseded_attempt_cannot_touch_newer_attempt() {
        let Some(broker) = broker().await else { return };
        let id = broker.push(record()).await.unwrap();

        let first = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        broker.recover_stalled(QueueName::MessagePersist, Duration::ZERO).await.unwrap();
        let second = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);

        broker.update_progress(id, second.attempts, 90).await.unwrap();
        assert!(matches!(
            broker.update_progress(id, first.attempts, 30).await,
            Err(BrokerError::LostOwnership(_))
        ));
        assert!(matches!(
            broker.heartbeat(id, first.attempts).await,
            Err(BrokerError::LostOwnership(_))
        ));

        let mut stale = first.clone();
        stale.mark_completed(json!({"success": true}), Utc::now()).unwrap();
        assert!(matches!(broker.ack(&stale).await, Err(BrokerError::LostOwnership(_))));

        let job = broker.peek(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.progress, 90);
    }

    #[tokio::test]
    async fn heartbeat_defers_stall_recovery() {
        let Some(broker) = broker().await else { return };
        let id = broker.push(record()).await.unwrap();
        let claimed = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        broker.heartbeat(id, claimed.attempts).await.unwrap();
        assert_eq!(
            broker
                .recover_stalled(QueueName::MessagePersist, Duration::from_millis(50))
                .await
                .unwrap(),
            0
        );
        assert_eq!(broker.peek(id).await.unwrap().unwrap().state, JobState::Active);
    }

    #[tokio::test]
    async fn claimed_record_and_index_move_together() {
        let Some(broker) = broker().await else { return };
        let id = broker.push(record()).await.unwrap();
        broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();

        let counts = broker.counts(QueueName::MessagePersist).await.unwrap();
        assert_eq!((counts.waiting, counts.active), (0, 1));
        let active = broker
            .list(QueueName::MessagePersist, Some(JobState::Active), 10)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);
        assert_eq!(active[0].state, JobState::Active);
    }
}
