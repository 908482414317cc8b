//! Handler trait, per-attempt context, and the job type dispatch table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use feedback_core::{DomainError, JobId};

use super::broker::{Broker, BrokerError};
use super::types::{JobRecord, JobType, Payload, QueueName};

/// Failure raised by a handler. Every variant counts against the job's attempts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    InvalidPayload(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Permission(String),
    #[error("{0}")]
    Transport(String),
    #[error("{0}")]
    Store(String),
}

impl HandlerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "invalid_payload",
            Self::NotFound(_) => "not_found",
            Self::Permission(_) => "permission",
            Self::Transport(_) => "transport",
            Self::Store(_) => "store",
        }
    }

    /// Prepend `prefix: ` to the message, keeping the variant.
    pub fn context(self, prefix: &str) -> Self {
        let wrap = |msg: String| format!("{prefix}: {msg}");
        match self {
            Self::InvalidPayload(m) => Self::InvalidPayload(wrap(m)),
            Self::NotFound(m) => Self::NotFound(wrap(m)),
            Self::Permission(m) => Self::Permission(wrap(m)),
            Self::Transport(m) => Self::Transport(wrap(m)),
            Self::Store(m) => Self::Store(wrap(m)),
        }
    }

    /// Read a required string field out of a payload.
    pub fn require_str<'a>(payload: &'a Payload, field: &str) -> Result<&'a str, Self> {
        payload
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Self::InvalidPayload(format!("missing field `{field}`")))
    }
}

impl From<DomainError> for HandlerError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::Validation(m) | DomainError::InvalidId(m) => Self::InvalidPayload(m),
            DomainError::NotFound(what) => Self::NotFound(format!("{what} not found")),
            DomainError::PermissionDenied(m) => Self::Permission(m),
        }
    }
}

/// What a handler sees about the attempt it is running.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: JobType,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    broker: Arc<dyn Broker>,
}

impl JobContext {
    pub fn new(record: &JobRecord, broker: Arc<dyn Broker>) -> Self {
        Self {
            job_id: record.id,
            job_type: record.job_type,
            attempt: record.attempts,
            created_at: record.created_at,
            broker,
        }
    }

    /// Write progress straight to the broker so status readers see it at once.
    ///
    /// Fails with `LostOwnership` once this attempt no longer holds the job.
    pub async fn update_progress(&self, progress: u8) -> Result<(), BrokerError> {
        self.broker
            .update_progress(self.job_id, self.attempt, progress)
            .await
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext, payload: &Payload) -> Result<Value, HandlerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no handler registered for job type {job_type} on queue {queue}")]
    Unregistered { queue: QueueName, job_type: JobType },
}

/// Maps each job type to its handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, job_type: JobType, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(job_type, Arc::new(handler));
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    /// Every job type hosted by `queues` must have a handler.
    pub fn ensure_complete(
        &self,
        queues: impl IntoIterator<Item = QueueName>,
    ) -> Result<(), RegistryError> {
        for queue in queues {
            for job_type in queue.job_types() {
                if !self.handlers.contains_key(&job_type) {
                    return Err(RegistryError::Unregistered { queue, job_type });
                }
            }
        }
        Ok(())
    }
}
