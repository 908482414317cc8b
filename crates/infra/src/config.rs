//! Configuration loading and representation.
//!
//! Everything comes from environment variables; unset variables fall back to
//! development defaults, malformed ones are rejected at startup.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{Backoff, BackoffStrategy, QueueName, RetryPolicy, WorkerConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{key} must be set when {when}")]
    Missing { key: &'static str, when: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Memory,
    Redis,
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            _ => Err("expected `memory` or `redis`".into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailConfig {
    Log,
    Http {
        api_url: String,
        api_key: String,
        /// Per-request limit for the mail API
        timeout: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub url: String,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub broker: BrokerKind,
    pub redis: RedisConfig,
    pub database_url: Option<String>,
    pub mail: MailConfig,
    pub email_from: String,
    pub retry: RetryPolicy,
    pub retention: Duration,
    pub worker: WorkerSettings,
    pub run_workers: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let redis_url = match env.get("REDIS_URL") {
            Some(url) => url,
            None => {
                let host = env.get("REDIS_HOST").unwrap_or_else(|| "localhost".into());
                let port: u16 = env.parse("REDIS_PORT", 6379)?;
                match env.get("REDIS_PASSWORD") {
                    Some(password) => format!("redis://:{password}@{host}:{port}"),
                    None => format!("redis://{host}:{port}"),
                }
            }
        };

        let mail = match env.get("MAIL_TRANSPORT").as_deref().unwrap_or("log") {
            "log" => MailConfig::Log,
            "http" => MailConfig::Http {
                api_url: env.require("MAIL_API_URL", "MAIL_TRANSPORT=http")?,
                api_key: env.require("MAIL_API_KEY", "MAIL_TRANSPORT=http")?,
                timeout: Duration::from_millis(env.parse("MAIL_TIMEOUT_MS", 10_000)?),
            },
            other => {
                return Err(ConfigError::Invalid {
                    key: "MAIL_TRANSPORT",
                    value: other.to_string(),
                    reason: "expected `log` or `http`".into(),
                })
            }
        };

        let attempts: u32 = env.parse("JOB_ATTEMPTS", 3)?;
        if attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "JOB_ATTEMPTS",
                value: "0".into(),
                reason: "at least one attempt is required".into(),
            });
        }
        let strategy: BackoffStrategy = env.parse("JOB_BACKOFF_TYPE", BackoffStrategy::Exponential)?;
        let delay_ms: u64 = env.parse("JOB_BACKOFF_DELAY_MS", 1000)?;

        let concurrency: usize = env.parse("WORKER_CONCURRENCY", 1)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_CONCURRENCY",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            bind_addr: env.parse("BIND_ADDR", IpAddr::from([0, 0, 0, 0]))?,
            port: env.parse("PORT", 3001)?,
            broker: env.parse("BROKER", BrokerKind::Memory)?,
            redis: RedisConfig {
                url: redis_url,
                prefix: env.get("REDIS_PREFIX").unwrap_or_else(|| "feedback".into()),
            },
            database_url: env.get("DATABASE_URL"),
            mail,
            email_from: env
                .get("EMAIL_FROM")
                .unwrap_or_else(|| "\"Feedback App\" <no-reply@localhost>".into()),
            retry: RetryPolicy {
                max_attempts: attempts,
                backoff: Backoff { strategy, delay_ms },
            },
            retention: Duration::from_secs(env.parse("JOB_RETENTION_SECS", 86_400)?),
            worker: WorkerSettings {
                concurrency,
                poll_interval: Duration::from_millis(env.parse("WORKER_POLL_INTERVAL_MS", 100)?),
                stall_timeout: Duration::from_secs(env.parse("WORKER_STALL_TIMEOUT_SECS", 300)?),
            },
            run_workers: env.parse("RUN_WORKERS", true)?,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn worker_config(&self, queue: QueueName) -> WorkerConfig {
        WorkerConfig::new(queue)
            .with_concurrency(self.worker.concurrency)
            .with_poll_interval(self.worker.poll_interval)
            .with_stall_timeout(self.worker.stall_timeout)
            .with_retention(self.retention)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Set and non-blank.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn require(&self, key: &'static str, when: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::Missing {
            key,
            when: when.to_string(),
        })
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
