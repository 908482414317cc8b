//! Core job types and policies.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use feedback_core::JobId;

/// Ordered mapping of named payload fields.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Named queue a job lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    /// Outgoing mail (verification codes).
    Email,
    /// Inbound anonymous messages waiting to be written to the user store.
    MessagePersist,
}

impl QueueName {
    pub const ALL: [QueueName; 2] = [QueueName::Email, QueueName::MessagePersist];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Email => "email",
            QueueName::MessagePersist => "message-persist",
        }
    }

    /// Job types hosted by this queue.
    pub fn job_types(&self) -> impl Iterator<Item = JobType> + '_ {
        JobType::ALL.into_iter().filter(move |t| t.queue() == *self)
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| UnknownName::new("queue", s))
    }
}

/// Discriminator selecting the handler for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    SendOtpEmail,
    SaveMessage,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::SendOtpEmail, JobType::SaveMessage];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::SendOtpEmail => "send-otp-email",
            JobType::SaveMessage => "save-message",
        }
    }

    /// The queue this job type is routed to.
    pub fn queue(&self) -> QueueName {
        match self {
            JobType::SendOtpEmail => QueueName::Email,
            JobType::SaveMessage => QueueName::MessagePersist,
        }
    }

    /// Payload fields that must be present and non-blank.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            JobType::SendOtpEmail => &["email", "username", "otp"],
            JobType::SaveMessage => &["username", "content"],
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownName::new("job type", s))
    }
}

/// Parse failure for queue names, job types and states.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownName {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownName {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Job lifecycle state.
///
/// `waiting -> active -> {completed | waiting (retry) | failed}`; the two
/// terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, eligible for claim once visible
    Waiting,
    /// Claimed by exactly one worker
    Active,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| UnknownName::new("job state", s))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(UnknownName::new("backoff type", other)),
        }
    }
}

/// Backoff configuration as carried on the wire: `{type, delayMs}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(rename = "type")]
    pub strategy: BackoffStrategy,
    pub delay_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(1000)
    }
}

impl Backoff {
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            delay_ms,
        }
    }

    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            delay_ms,
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of execution attempts (including the first)
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::fixed(delay.as_millis() as u64),
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::exponential(base_delay.as_millis() as u64),
        }
    }

    /// Delay before the next attempt, given the number of attempts made so far.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.backoff.delay_ms;
        let delay_ms = match self.backoff.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let factor = 2u64.saturating_pow(attempt - 1);
                base_ms.saturating_mul(factor)
            }
        };

        Duration::from_millis(delay_ms)
    }

    /// Check if more attempts are allowed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Illegal state-machine step on a [`JobRecord`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("job {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
    #[error("job {id}: all {max_attempts} attempts already used")]
    AttemptsExhausted { id: JobId, max_attempts: u32 },
    #[error("progress must be between 0 and 100, got {0}")]
    InvalidProgress(u8),
    #[error("job {id}: progress can only change while active (state is {state})")]
    NotActive { id: JobId, state: JobState },
}

/// What happened after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Back to `waiting`; re-visible after the delay.
    Retry { delay: Duration },
    /// Terminal `failed`.
    Failed,
}

/// Reason recorded when a worker vanished while holding a job.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// The durable unit of queued work and its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub queue_name: QueueName,
    pub job_type: JobType,
    pub payload: Payload,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub state: JobState,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Last sign of life from the worker running the current attempt
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When the record reached a terminal state (completed or failed)
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time the record may be claimed
    pub available_at: DateTime<Utc>,
    /// Execution history (one entry per finished attempt)
    pub history: Vec<JobAttemptRecord>,
}

impl JobRecord {
    /// Create a new waiting record.
    pub fn new(job_type: JobType, payload: Payload, policy: RetryPolicy) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue_name: job_type.queue(),
            job_type,
            payload,
            attempts: 0,
            max_attempts: policy.max_attempts,
            backoff: policy.backoff,
            state: JobState::Waiting,
            progress: 0,
            result: None,
            failure_reason: None,
            created_at: now,
            last_attempt_at: None,
            heartbeat_at: None,
            completed_at: None,
            finished_at: None,
            available_at: now,
            history: Vec::new(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
        }
    }

    /// Check if the job is ready to be claimed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.available_at <= now
    }

    /// Claim: `waiting -> active`, counting the attempt.
    pub fn mark_active(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_state(JobState::Waiting, JobState::Active)?;
        if self.attempts >= self.max_attempts {
            return Err(TransitionError::AttemptsExhausted {
                id: self.id,
                max_attempts: self.max_attempts,
            });
        }

        self.state = JobState::Active;
        self.attempts += 1;
        self.progress = 0;
        self.last_attempt_at = Some(now);
        self.heartbeat_at = Some(now);
        Ok(())
    }

    /// The attempt's worker is still alive.
    pub fn touch(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.state != JobState::Active {
            return Err(TransitionError::NotActive {
                id: self.id,
                state: self.state,
            });
        }
        self.heartbeat_at = Some(now);
        Ok(())
    }

    /// Whether this record is `attempt` of an active job.
    pub fn is_held_by(&self, attempt: u32) -> bool {
        self.state == JobState::Active && self.attempts == attempt
    }

    /// Active with no heartbeat since `before`.
    pub fn is_stalled(&self, before: DateTime<Utc>) -> bool {
        self.state == JobState::Active
            && self
                .heartbeat_at
                .or(self.last_attempt_at)
                .is_some_and(|t| t <= before)
    }

    /// Record handler progress. Lower values than the current one are ignored.
    pub fn set_progress(&mut self, progress: u8) -> Result<(), TransitionError> {
        if progress > 100 {
            return Err(TransitionError::InvalidProgress(progress));
        }
        if self.state != JobState::Active {
            return Err(TransitionError::NotActive {
                id: self.id,
                state: self.state,
            });
        }

        self.progress = self.progress.max(progress);
        Ok(())
    }

    /// `active -> completed`.
    pub fn mark_completed(
        &mut self,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_state(JobState::Active, JobState::Completed)?;

        self.push_history(now, None);
        self.state = JobState::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.finished_at = Some(now);
        Ok(())
    }

    /// `active -> waiting` when attempts remain, otherwise `active -> failed`.
    pub fn mark_attempt_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, TransitionError> {
        let policy = self.retry_policy();
        let delay = policy.delay_for_attempt(self.attempts);
        self.fail_attempt(error.into(), now, delay)
    }

    /// A worker disappeared mid-attempt. Retries are immediate.
    pub fn mark_stalled(&mut self, now: DateTime<Utc>) -> Result<AttemptOutcome, TransitionError> {
        self.fail_attempt(STALLED_REASON.to_string(), now, Duration::ZERO)
    }

    fn fail_attempt(
        &mut self,
        error: String,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> Result<AttemptOutcome, TransitionError> {
        if self.state != JobState::Active {
            return Err(TransitionError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: JobState::Failed,
            });
        }

        self.push_history(now, Some(error.clone()));

        if self.retry_policy().should_retry(self.attempts) {
            self.state = JobState::Waiting;
            self.available_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            Ok(AttemptOutcome::Retry { delay })
        } else {
            self.state = JobState::Failed;
            self.failure_reason = Some(error);
            self.finished_at = Some(now);
            Ok(AttemptOutcome::Failed)
        }
    }

    fn ensure_state(&self, expected: JobState, to: JobState) -> Result<(), TransitionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            })
        }
    }

    fn push_history(&mut self, now: DateTime<Utc>, error: Option<String>) {
        let started_at = self.last_attempt_at.unwrap_or(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// Snapshot served to status pollers.
    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            queue_name: self.queue_name,
            state: self.state,
            progress: self.progress,
        }
    }
}

/// Read-only status view of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: JobId,
    pub queue_name: QueueName,
    pub state: JobState,
    pub progress: u8,
}
