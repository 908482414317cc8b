//! Broker abstraction and the in-memory implementation.
//!
//! The broker is the durable side of the queue: it owns job records, hands
//! each waiting record to exactly one consumer, and keeps terminal records
//! around for status polling until the retention window passes.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use feedback_core::JobId;

use super::types::{JobRecord, JobState, QueueName, TransitionError};

/// How often [`Broker::pop_blocking`] re-checks an empty queue.
const POP_POLL_STEP: Duration = Duration::from_millis(20);

/// Broker error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} is no longer owned by this consumer")]
    LostOwnership(JobId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Per-queue record counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed
    }
}

/// Durable store of pending work, grouped into named queues.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Persist a new waiting record. Returns only once the record is stored.
    async fn push(&self, record: JobRecord) -> Result<JobId, BrokerError>;

    /// Claim the next visible waiting record of `queue`, marking it active.
    /// Returns None if nothing is ready.
    async fn claim(&self, queue: QueueName) -> Result<Option<JobRecord>, BrokerError>;

    /// Claim, waiting up to `wait` for a record to become visible.
    async fn pop_blocking(
        &self,
        queue: QueueName,
        wait: Duration,
    ) -> Result<Option<JobRecord>, BrokerError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(record) = self.claim(queue).await? {
                return Ok(Some(record));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_STEP.min(deadline - now)).await;
        }
    }

    /// Read a record without changing it.
    async fn peek(&self, id: JobId) -> Result<Option<JobRecord>, BrokerError>;

    /// Write handler progress onto `attempt` of an active record; visible to
    /// readers at once. `LostOwnership` once that attempt no longer holds the job.
    async fn update_progress(
        &self,
        id: JobId,
        attempt: u32,
        progress: u8,
    ) -> Result<(), BrokerError>;

    /// Keep `attempt`'s claim alive so stall recovery leaves it alone.
    async fn heartbeat(&self, id: JobId, attempt: u32) -> Result<(), BrokerError>;

    /// Store a record that reached a terminal state and release the claim.
    async fn ack(&self, record: &JobRecord) -> Result<(), BrokerError>;

    /// Store a record returned to `waiting` and make it claimable again after
    /// `retry_delay`.
    async fn nack(&self, record: &JobRecord, retry_delay: Duration) -> Result<(), BrokerError>;

    /// Records of a queue, oldest first, optionally filtered by state.
    async fn list(
        &self,
        queue: QueueName,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, BrokerError>;

    async fn counts(&self, queue: QueueName) -> Result<JobCounts, BrokerError>;

    /// Return active records with no heartbeat for `stall_timeout` to
    /// `waiting` (or `failed` when no attempts remain).
    async fn recover_stalled(
        &self,
        queue: QueueName,
        stall_timeout: Duration,
    ) -> Result<usize, BrokerError>;

    /// Drop terminal records that finished more than `retention` ago.
    async fn purge_expired(&self, retention: Duration) -> Result<usize, BrokerError>;
}

pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    now - chrono::Duration::from_std(age).unwrap_or_default()
}

/// In-memory broker for tests/dev.
///
/// Records do not survive a process restart; use the Redis broker when
/// producers and workers run as separate processes.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_owned(stored: &JobRecord, attempt: u32) -> Result<(), BrokerError> {
        if stored.is_held_by(attempt) {
            Ok(())
        } else {
            Err(BrokerError::LostOwnership(stored.id))
        }
    }

    fn held_mut(
        jobs: &mut HashMap<JobId, JobRecord>,
        id: JobId,
        attempt: u32,
    ) -> Result<&mut JobRecord, BrokerError> {
        let job = jobs.get_mut(&id).ok_or(BrokerError::NotFound(id))?;
        Self::ensure_owned(job, attempt)?;
        Ok(job)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn push(&self, record: JobRecord) -> Result<JobId, BrokerError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&record.id) {
            return Err(BrokerError::Storage(format!("job already exists: {}", record.id)));
        }
        let id = record.id;
        jobs.insert(id, record);
        Ok(id)
    }

    async fn claim(&self, queue: QueueName) -> Result<Option<JobRecord>, BrokerError> {
        let mut jobs = self.jobs.write().unwrap();
        let now = Utc::now();

        // Oldest visible record first; ties broken by (time-ordered) id.
        let next = jobs
            .values()
            .filter(|j| j.queue_name == queue && j.is_ready(now))
            .min_by_key(|j| (j.available_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.mark_active(now)?;
        Ok(Some(job.clone()))
    }

    async fn peek(&self, id: JobId) -> Result<Option<JobRecord>, BrokerError> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs.get(&id).cloned())
    }

    async fn update_progress(
        &self,
        id: JobId,
        attempt: u32,
        progress: u8,
    ) -> Result<(), BrokerError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = Self::held_mut(&mut jobs, id, attempt)?;
        job.set_progress(progress)?;
        job.touch(Utc::now())?;
        Ok(())
    }

    async fn heartbeat(&self, id: JobId, attempt: u32) -> Result<(), BrokerError> {
        let mut jobs = self.jobs.write().unwrap();
        Self::held_mut(&mut jobs, id, attempt)?.touch(Utc::now())?;
        Ok(())
    }

    async fn ack(&self, record: &JobRecord) -> Result<(), BrokerError> {
        if !record.state.is_terminal() {
            return Err(BrokerError::Storage(format!(
                "ack of non-terminal job {} ({})",
                record.id, record.state
            )));
        }
        let mut jobs = self.jobs.write().unwrap();
        let stored = jobs.get(&record.id).ok_or(BrokerError::NotFound(record.id))?;
        Self::ensure_owned(stored, record.attempts)?;
        jobs.insert(record.id, record.clone());
        Ok(())
    }

    async fn nack(&self, record: &JobRecord, retry_delay: Duration) -> Result<(), BrokerError> {
        if record.state != JobState::Waiting {
            return Err(BrokerError::Storage(format!(
                "nack of job {} in state {}",
                record.id, record.state
            )));
        }
        let mut jobs = self.jobs.write().unwrap();
        let stored = jobs.get(&record.id).ok_or(BrokerError::NotFound(record.id))?;
        Self::ensure_owned(stored, record.attempts)?;

        let mut record = record.clone();
        record.available_at =
            Utc::now() + chrono::Duration::from_std(retry_delay).unwrap_or_default();
        jobs.insert(record.id, record);
        Ok(())
    }

    async fn list(
        &self,
        queue: QueueName,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, BrokerError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.queue_name == queue && state.map_or(true, |s| j.state == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn counts(&self, queue: QueueName) -> Result<JobCounts, BrokerError> {
        let jobs = self.jobs.read().unwrap();
        let mut counts = JobCounts::default();
        for job in jobs.values().filter(|j| j.queue_name == queue) {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn recover_stalled(
        &self,
        queue: QueueName,
        stall_timeout: Duration,
    ) -> Result<usize, BrokerError> {
        let mut jobs = self.jobs.write().unwrap();
        let now = Utc::now();
        let stalled_before = cutoff(now, stall_timeout);

        let mut recovered = 0;
        for job in jobs
            .values_mut()
            .filter(|j| j.queue_name == queue && j.is_stalled(stalled_before))
        {
            job.mark_stalled(now)?;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn purge_expired(&self, retention: Duration) -> Result<usize, BrokerError> {
        let mut jobs = self.jobs.write().unwrap();
        let expire_before = cutoff(Utc::now(), retention);
        let before = jobs.len();
        jobs.retain(|_, j| !(j.state.is_terminal() && j.finished_at.is_some_and(|t| t < expire_before)));
        Ok(before - jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobType, Payload, RetryPolicy};

    fn record(job_type: JobType) -> JobRecord {
        let mut payload = Payload::new();
        payload.insert("username".into(), "alice".into());
        JobRecord::new(job_type, payload, RetryPolicy::fixed(2, Duration::ZERO))
    }

    #[tokio::test]
    async fn push_and_claim() {
        let broker = InMemoryBroker::new();
        let job_id = broker.push(record(JobType::SaveMessage)).await.unwrap();

        let claimed = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts, 1);

        // Claimed records are invisible to other consumers
        assert!(broker.claim(QueueName::MessagePersist).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queues_are_separate() {
        let broker = InMemoryBroker::new();
        broker.push(record(JobType::SaveMessage)).await.unwrap();

        assert!(broker.claim(QueueName::Email).await.unwrap().is_none());
        assert!(broker.claim(QueueName::MessagePersist).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn nack_hides_record_until_delay_elapses() {
        let broker = InMemoryBroker::new();
        broker.push(record(JobType::SaveMessage)).await.unwrap();

        let mut claimed = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        claimed.mark_attempt_failed("boom", Utc::now()).unwrap();
        broker
            .nack(&claimed, Duration::from_secs(3600))
            .await
            .unwrap();

        let stored = broker.peek(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert!(broker.claim(QueueName::MessagePersist).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_blocking_waits_for_visibility() {
        let broker = InMemoryBroker::new();
        broker.push(record(JobType::SaveMessage)).await.unwrap();

        let mut claimed = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        claimed.mark_attempt_failed("boom", Utc::now()).unwrap();
        broker.nack(&claimed, Duration::from_millis(50)).await.unwrap();

        let again = broker
            .pop_blocking(QueueName::MessagePersist, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn pop_blocking_times_out_on_empty_queue() {
        let broker = InMemoryBroker::new();
        let got = broker
            .pop_blocking(QueueName::Email, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn progress_is_visible_immediately() {
        let broker = InMemoryBroker::new();
        broker.push(record(JobType::SaveMessage)).await.unwrap();
        let claimed = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();

        broker
            .update_progress(claimed.id, claimed.attempts, 30)
            .await
            .unwrap();
        assert_eq!(broker.peek(claimed.id).await.unwrap().unwrap().progress, 30);
    }

    #[tokio::test]
    async fn superseded_attempt_cannot_write_progress() {
        let broker = InMemoryBroker::new();
        broker.push(record(JobType::SaveMessage)).await.unwrap();

        let first = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        broker
            .recover_stalled(QueueName::MessagePersist, Duration::ZERO)
            .await
            .unwrap();

        // Between recovery and the next claim the record is waiting.
        assert!(matches!(
            broker.update_progress(first.id, first.attempts, 90).await,
            Err(BrokerError::LostOwnership(_))
        ));
        assert!(matches!(
            broker.heartbeat(first.id, first.attempts).await,
            Err(BrokerError::LostOwnership(_))
        ));

        let second = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        assert!(matches!(
            broker.update_progress(first.id, first.attempts, 90).await,
            Err(BrokerError::LostOwnership(_))
        ));

        let stored = broker.peek(second.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Active);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.progress, 0);
    }

    #[tokio::test]
    async fn heartbeat_keeps_long_attempt_from_being_recovered() {
        let broker = InMemoryBroker::new();
        broker.push(record(JobType::SaveMessage)).await.unwrap();
        let claimed = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        broker.heartbeat(claimed.id, claimed.attempts).await.unwrap();

        let recovered = broker
            .recover_stalled(QueueName::MessagePersist, Duration::from_millis(40))
            .await
            .unwrap();
        assert_eq!(recovered, 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let recovered = broker
            .recover_stalled(QueueName::MessagePersist, Duration::from_millis(40))
            .await
            .unwrap();
        assert_eq!(recovered, 1);
    }

    #[tokio::test]
    async fn stale_owner_cannot_ack() {
        let broker = InMemoryBroker::new();
        broker.push(record(JobType::SaveMessage)).await.unwrap();

        let mut first = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        // Worker vanished; record is recovered and claimed again.
        assert_eq!(
            broker
                .recover_stalled(QueueName::MessagePersist, Duration::ZERO)
                .await
                .unwrap(),
            1
        );
        let second = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);

        first
            .mark_completed(serde_json::Value::Null, Utc::now())
            .unwrap();
        assert!(matches!(
            broker.ack(&first).await,
            Err(BrokerError::LostOwnership(_))
        ));
    }

    #[tokio::test]
    async fn stalled_record_without_attempts_left_fails() {
        let broker = InMemoryBroker::new();
        let mut job = record(JobType::SaveMessage);
        job.max_attempts = 1;
        let id = broker.push(job).await.unwrap();

        broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        broker
            .recover_stalled(QueueName::MessagePersist, Duration::ZERO)
            .await
            .unwrap();

        let stored = broker.peek(id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(
            stored.failure_reason.as_deref(),
            Some(crate::jobs::types::STALLED_REASON)
        );
    }

    #[tokio::test]
    async fn counts_and_list_by_state() {
        let broker = InMemoryBroker::new();
        for _ in 0..3 {
            broker.push(record(JobType::SaveMessage)).await.unwrap();
        }
        broker.push(record(JobType::SendOtpEmail)).await.unwrap();

        let mut claimed = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        claimed
            .mark_completed(serde_json::json!({}), Utc::now())
            .unwrap();
        broker.ack(&claimed).await.unwrap();
        broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();

        let counts = broker.counts(QueueName::MessagePersist).await.unwrap();
        assert_eq!(
            counts,
            JobCounts {
                waiting: 1,
                active: 1,
                completed: 1,
                failed: 0
            }
        );
        assert_eq!(counts.total(), 3);

        let completed = broker
            .list(QueueName::MessagePersist, Some(JobState::Completed), 10)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, claimed.id);

        let all = broker.list(QueueName::MessagePersist, None, 2).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn purge_drops_only_expired_terminal_records() {
        let broker = InMemoryBroker::new();
        let done = broker.push(record(JobType::SaveMessage)).await.unwrap();
        let mut claimed = broker.claim(QueueName::MessagePersist).await.unwrap().unwrap();
        assert_eq!(claimed.id, done);
        let pending = broker.push(record(JobType::SaveMessage)).await.unwrap();
        claimed
            .mark_completed(serde_json::json!({}), Utc::now() - chrono::Duration::hours(2))
            .unwrap();
        broker.ack(&claimed).await.unwrap();

        let purged = broker.purge_expired(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(broker.peek(done).await.unwrap().is_none());
        assert!(broker.peek(pending).await.unwrap().is_some());
    }
}
