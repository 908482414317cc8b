//! Infrastructure wiring: broker, queue, user store, mail transport, workers.

use std::sync::{Arc, RwLock};

use tracing::info;

use feedback_infra::config::{AppConfig, BrokerKind, MailConfig};
use feedback_infra::handlers;
use feedback_infra::jobs::{
    Broker, BrokerError, HandlerRegistry, InMemoryBroker, JobQueue, RegistryError, RetryPolicy,
    Worker, WorkerConfig, WorkerHandle, WorkerStats, WorkerStatsHandle,
};
use feedback_infra::mail::{HttpMailTransport, LogTransport, MailTransport, TransportError};
use feedback_infra::users::{InMemoryUserStore, PostgresUserStore, UserStore, UserStoreError};

const DEFAULT_EMAIL_FROM: &str = "\"Feedback App\" <no-reply@localhost>";

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("broker unavailable: {0}")]
    Broker(#[from] BrokerError),
    #[error("user store unavailable: {0}")]
    UserStore(#[from] UserStoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Mail(#[from] TransportError),
    #[error("BROKER=redis requires the `redis` feature")]
    RedisDisabled,
}

/// Shared application services (one instance per process).
pub struct AppServices {
    pub queue: JobQueue,
    pub users: Arc<dyn UserStore>,
    pub registry: HandlerRegistry,
    workers: RwLock<Vec<WorkerStatsHandle>>,
}

impl AppServices {
    pub fn new(queue: JobQueue, users: Arc<dyn UserStore>, registry: HandlerRegistry) -> Self {
        Self {
            queue,
            users,
            registry,
            workers: RwLock::new(Vec::new()),
        }
    }

    /// Everything in memory, mail to the log. Used by tests and local runs.
    pub fn in_memory() -> Self {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let users: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new());
        let registry = handlers::registry(Arc::new(LogTransport), DEFAULT_EMAIL_FROM, users.clone());
        Self::new(JobQueue::new(broker), users, registry)
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.queue = self.queue.with_default_policy(policy);
        self
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        self.queue.broker()
    }

    /// Start one worker per config; their stats show up under `/admin/workers`.
    pub fn spawn_workers(
        &self,
        configs: impl IntoIterator<Item = WorkerConfig>,
    ) -> Result<Vec<WorkerHandle>, RegistryError> {
        let workers = configs
            .into_iter()
            .map(|config| Worker::new(self.broker().clone(), self.registry.clone(), config))
            .collect::<Result<Vec<_>, _>>()?;

        let handles: Vec<WorkerHandle> = workers.into_iter().map(Worker::spawn).collect();
        self.workers
            .write()
            .unwrap()
            .extend(handles.iter().map(WorkerHandle::stats_handle));
        Ok(handles)
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers
            .read()
            .unwrap()
            .iter()
            .map(WorkerStatsHandle::snapshot)
            .collect()
    }
}

/// Build services from configuration.
pub async fn build_services(config: &AppConfig) -> Result<AppServices, ServicesError> {
    let broker = build_broker(config).await?;

    let users: Arc<dyn UserStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresUserStore::connect(url).await?;
            store.ensure_schema().await?;
            info!("user store: postgres");
            Arc::new(store)
        }
        None => {
            info!("user store: in-memory (DATABASE_URL not set)");
            Arc::new(InMemoryUserStore::new())
        }
    };

    let transport: Arc<dyn MailTransport> = match &config.mail {
        MailConfig::Log => Arc::new(LogTransport),
        MailConfig::Http {
            api_url,
            api_key,
            timeout,
        } => Arc::new(HttpMailTransport::new(
            api_url.clone(),
            api_key.clone(),
            *timeout,
        )?),
    };

    let registry = handlers::registry(transport, config.email_from.clone(), users.clone());
    registry.ensure_complete(feedback_infra::jobs::QueueName::ALL)?;

    let queue = JobQueue::new(broker).with_default_policy(config.retry);
    Ok(AppServices::new(queue, users, registry))
}

async fn build_broker(config: &AppConfig) -> Result<Arc<dyn Broker>, ServicesError> {
    match config.broker {
        BrokerKind::Memory => {
            info!("broker: in-memory");
            Ok(Arc::new(InMemoryBroker::new()))
        }
        #[cfg(feature = "redis")]
        BrokerKind::Redis => {
            let broker = feedback_infra::jobs::RedisBroker::connect(&config.redis.url)
                .await?
                .with_prefix(config.redis.prefix.clone())
                .with_retention(config.retention);
            info!(prefix = %config.redis.prefix, "broker: redis");
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "redis"))]
        BrokerKind::Redis => Err(ServicesError::RedisDisabled),
    }
}
