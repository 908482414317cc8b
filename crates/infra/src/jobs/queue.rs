//! Producer-facing queue API and status lookups.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use feedback_core::JobId;

use super::broker::{Broker, BrokerError};
use super::types::{Backoff, JobRecord, JobState, JobStatus, JobType, Payload, QueueName, RetryPolicy};

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Per-enqueue overrides of the queue's default retry policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOptions {
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(mut self, n: u32) -> Self {
        self.attempts = Some(n);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    fn resolve(&self, defaults: RetryPolicy) -> Result<RetryPolicy, QueueError> {
        let policy = RetryPolicy {
            max_attempts: self.attempts.unwrap_or(defaults.max_attempts),
            backoff: self.backoff.unwrap_or(defaults.backoff),
        };
        if policy.max_attempts == 0 {
            return Err(QueueError::Validation("attempts must be at least 1".into()));
        }
        Ok(policy)
    }
}

/// Check that `payload` carries every field `job_type` needs.
pub fn validate_payload(job_type: JobType, payload: &Payload) -> Result<(), QueueError> {
    if payload.is_empty() {
        return Err(QueueError::Validation("payload must not be empty".into()));
    }

    let missing: Vec<&str> = job_type
        .required_fields()
        .iter()
        .copied()
        .filter(|field| {
            !payload
                .get(*field)
                .and_then(|v| v.as_str())
                .is_some_and(|s| !s.trim().is_empty())
        })
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(QueueError::Validation(format!(
            "{job_type} requires non-empty string field(s): {}",
            missing.join(", ")
        )))
    }
}

/// Job queue facade shared by producers and status readers.
///
/// Enqueue returns as soon as the broker has stored the record; it never
/// waits for execution.
#[derive(Clone)]
pub struct JobQueue {
    broker: Arc<dyn Broker>,
    defaults: RetryPolicy,
}

impl JobQueue {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            defaults: RetryPolicy::default(),
        }
    }

    /// Default policy applied when an enqueue carries no overrides.
    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.defaults = policy;
        self
    }

    pub fn default_policy(&self) -> RetryPolicy {
        self.defaults
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Validate and store a new waiting job.
    pub async fn enqueue(
        &self,
        queue: QueueName,
        job_type: JobType,
        payload: Payload,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        if job_type.queue() != queue {
            return Err(QueueError::Validation(format!(
                "job type {job_type} does not belong to queue {queue}"
            )));
        }
        validate_payload(job_type, &payload)?;
        let policy = options.resolve(self.defaults)?;

        let record = JobRecord::new(job_type, payload, policy);
        let id = self.broker.push(record).await?;
        debug!(job_id = %id, queue = %queue, job_type = %job_type, "job enqueued");
        Ok(id)
    }

    pub async fn get_job(&self, id: JobId) -> Result<JobRecord, QueueError> {
        self.broker
            .peek(id)
            .await?
            .ok_or(QueueError::NotFound(id))
    }

    pub async fn get_state(&self, id: JobId) -> Result<JobState, QueueError> {
        Ok(self.get_job(id).await?.state)
    }

    pub async fn get_status(&self, id: JobId) -> Result<JobStatus, QueueError> {
        Ok(self.get_job(id).await?.status())
    }
}
