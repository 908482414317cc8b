//! Queue worker with retry and backoff logic.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, BrokerError};
use super::registry::{HandlerRegistry, JobContext, RegistryError};
use super::types::{AttemptOutcome, JobRecord, JobState, QueueName};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    pub queue: QueueName,
    /// Jobs processed at once by this worker
    pub concurrency: usize,
    /// How long an idle consumer waits for work before re-checking shutdown
    pub poll_interval: Duration,
    /// Active records without a heartbeat for this long are considered abandoned
    pub stall_timeout: Duration,
    /// How long terminal records stay readable
    pub retention: Duration,
    pub janitor_interval: Duration,
}

impl WorkerConfig {
    pub fn new(queue: QueueName) -> Self {
        Self {
            name: format!("{queue}-worker"),
            queue,
            concurrency: 1,
            poll_interval: Duration::from_millis(100),
            stall_timeout: Duration::from_secs(300),
            retention: Duration::from_secs(86_400),
            janitor_interval: Duration::from_secs(5),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// How often a running handler's claim is renewed: a quarter of the stall
    /// timeout, at least 10 ms.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.stall_timeout / 4).max(Duration::from_millis(10))
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub worker: String,
    pub queue: QueueName,
    pub concurrency: usize,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub stalled_recovered: u64,
    pub purged: u64,
    pub current_running: usize,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn new(config: &WorkerConfig) -> Self {
        Self {
            worker: config.name.clone(),
            queue: config.queue,
            concurrency: config.concurrency,
            jobs_processed: 0,
            jobs_succeeded: 0,
            jobs_retried: 0,
            jobs_failed: 0,
            stalled_recovered: 0,
            purged: 0,
            current_running: 0,
            started_at: Utc::now(),
            uptime_secs: 0,
        }
    }
}

/// Shared view onto a running worker's statistics.
#[derive(Debug, Clone)]
pub struct WorkerStatsHandle(Arc<Mutex<WorkerStats>>);

impl WorkerStatsHandle {
    fn new(stats: WorkerStats) -> Self {
        Self(Arc::new(Mutex::new(stats)))
    }

    pub fn snapshot(&self) -> WorkerStats {
        let mut stats = self.0.lock().unwrap().clone();
        stats.uptime_secs = (Utc::now() - stats.started_at).num_seconds().max(0) as u64;
        stats
    }

    fn update(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.0.lock().unwrap());
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: WorkerStatsHandle,
}

impl WorkerHandle {
    /// Stop claiming new jobs and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> WorkerStatsHandle {
        self.stats.clone()
    }
}

/// Background consumer of one queue.
///
/// Claims visible records from the broker, dispatches them to the handler
/// registered for their job type, and resolves each attempt as completed,
/// scheduled for retry, or failed.
pub struct Worker {
    broker: Arc<dyn Broker>,
    registry: HandlerRegistry,
    config: WorkerConfig,
}

impl Worker {
    /// Fails if any job type of the queue has no handler.
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> Result<Self, RegistryError> {
        registry.ensure_complete([config.queue])?;
        Ok(Self {
            broker,
            registry,
            config,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Claim one record (waiting up to `wait`) and run it to the end of the attempt.
    pub async fn process_one(&self, wait: Duration) -> Result<Option<JobRecord>, BrokerError> {
        match self.broker.pop_blocking(self.config.queue, wait).await? {
            Some(record) => self.execute(record).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run the handler for a claimed record and store the outcome.
    ///
    /// Handler errors and panics become attempt failures; only broker errors
    /// are returned.
    pub async fn execute(&self, record: JobRecord) -> Result<JobRecord, BrokerError> {
        info!(
            worker = %self.config.name,
            job_id = %record.id,
            queue = %record.queue_name,
            job_type = %record.job_type,
            attempt = record.attempts,
            "job claimed"
        );

        let outcome = self.run_handler(&record).await;

        // Progress was written through the broker; start from the stored copy.
        let mut current = self
            .broker
            .peek(record.id)
            .await?
            .ok_or(BrokerError::NotFound(record.id))?;
        if !current.is_held_by(record.attempts) {
            warn!(
                worker = %self.config.name,
                job_id = %record.id,
                attempt = record.attempts,
                state = %current.state,
                "job was reclaimed while running; dropping result"
            );
            return Err(BrokerError::LostOwnership(record.id));
        }

        let now = Utc::now();
        match outcome {
            Ok(result) => {
                current.mark_completed(result, now)?;
                self.broker.ack(&current).await?;
                info!(
                    worker = %self.config.name,
                    job_id = %current.id,
                    job_type = %current.job_type,
                    attempt = current.attempts,
                    "job completed"
                );
            }
            Err(reason) => match current.mark_attempt_failed(reason.clone(), now)? {
                AttemptOutcome::Retry { delay } => {
                    self.broker.nack(&current, delay).await?;
                    warn!(
                        worker = %self.config.name,
                        job_id = %current.id,
                        job_type = %current.job_type,
                        attempt = current.attempts,
                        max_attempts = current.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "job attempt failed; retry scheduled"
                    );
                }
                AttemptOutcome::Failed => {
                    self.broker.ack(&current).await?;
                    error!(
                        worker = %self.config.name,
                        job_id = %current.id,
                        job_type = %current.job_type,
                        attempt = current.attempts,
                        error = %reason,
                        "job failed"
                    );
                }
            },
        }

        Ok(current)
    }

    async fn run_handler(&self, record: &JobRecord) -> Result<serde_json::Value, String> {
        let Some(handler) = self.registry.get(record.job_type) else {
            return Err(format!("no handler registered for job type {}", record.job_type));
        };

        let ctx = JobContext::new(record, self.broker.clone());
        let payload = record.payload.clone();

        // Spawned so a panicking handler cannot take the consumer down with it.
        let mut task = tokio::spawn(async move { handler.handle(&ctx, &payload).await });

        let mut beat = tokio::time::interval(self.config.heartbeat_interval());
        beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        beat.tick().await;
        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                _ = beat.tick() => {
                    if let Err(e) = self.broker.heartbeat(record.id, record.attempts).await {
                        warn!(
                            worker = %self.config.name,
                            job_id = %record.id,
                            attempt = record.attempts,
                            error = %e,
                            "heartbeat failed"
                        );
                    }
                }
            }
        };

        match joined {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(join_err) => {
                let reason = match join_err.try_into_panic() {
                    Ok(panic) => format!("handler panicked: {}", panic_message(&*panic)),
                    Err(e) => format!("handler task aborted: {e}"),
                };
                error!(
                    worker = %self.config.name,
                    job_id = %record.id,
                    job_type = %record.job_type,
                    error = %reason,
                    "handler panicked"
                );
                Err(reason)
            }
        }
    }

    /// Return stalled records to the queue and drop expired terminal ones.
    pub async fn run_maintenance(&self) -> Result<(usize, usize), BrokerError> {
        let recovered = self
            .broker
            .recover_stalled(self.config.queue, self.config.stall_timeout)
            .await?;
        if recovered > 0 {
            warn!(
                worker = %self.config.name,
                queue = %self.config.queue,
                recovered,
                "recovered stalled jobs"
            );
        }
        let purged = self.broker.purge_expired(self.config.retention).await?;
        if purged > 0 {
            debug!(worker = %self.config.name, purged, "purged expired jobs");
        }
        Ok((recovered, purged))
    }

    /// Spawn `concurrency` consumer tasks plus one maintenance task.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = WorkerStatsHandle::new(WorkerStats::new(&self.config));
        let worker = Arc::new(self);

        let mut joins = Vec::with_capacity(worker.config.concurrency + 1);
        for slot in 0..worker.config.concurrency {
            joins.push(tokio::spawn(consumer_loop(
                worker.clone(),
                slot,
                shutdown_rx.clone(),
                stats.clone(),
            )));
        }
        joins.push(tokio::spawn(janitor_loop(
            worker.clone(),
            shutdown_rx,
            stats.clone(),
        )));

        info!(
            worker = %worker.config.name,
            queue = %worker.config.queue,
            concurrency = worker.config.concurrency,
            "worker started"
        );

        WorkerHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
        }
    }
}

async fn consumer_loop(
    worker: Arc<Worker>,
    slot: usize,
    mut shutdown: watch::Receiver<bool>,
    stats: WorkerStatsHandle,
) {
    let name = &worker.config.name;
    let queue = worker.config.queue;
    debug!(worker = %name, slot, "consumer started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let popped = tokio::select! {
            _ = shutdown.changed() => break,
            popped = worker.broker.pop_blocking(queue, worker.config.poll_interval) => popped,
        };

        match popped {
            Ok(Some(record)) => {
                stats.update(|s| s.current_running += 1);
                let result = worker.execute(record).await;
                stats.update(|s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.jobs_processed += 1;
                    match &result {
                        Ok(job) if job.state == JobState::Completed => s.jobs_succeeded += 1,
                        Ok(job) if job.state == JobState::Failed => s.jobs_failed += 1,
                        Ok(_) => s.jobs_retried += 1,
                        Err(_) => {}
                    }
                });
                if let Err(e) = result {
                    error!(worker = %name, error = %e, "failed to store job outcome");
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(worker = %name, queue = %queue, error = %e, "failed to claim job");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(worker.config.poll_interval) => {}
                }
            }
        }
    }

    debug!(worker = %name, slot, "consumer stopped");
}

async fn janitor_loop(
    worker: Arc<Worker>,
    mut shutdown: watch::Receiver<bool>,
    stats: WorkerStatsHandle,
) {
    let mut ticker = tokio::time::interval(worker.config.janitor_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        match worker.run_maintenance().await {
            Ok((recovered, purged)) => stats.update(|s| {
                s.stalled_recovered += recovered as u64;
                s.purged += purged as u64;
            }),
            Err(e) => error!(worker = %worker.config.name, error = %e, "maintenance failed"),
        }
    }

    info!(worker = %worker.config.name, "worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
