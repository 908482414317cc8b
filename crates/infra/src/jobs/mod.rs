//! Background job system with retry, backoff, and stall recovery.
//!
//! ## Design
//!
//! - Jobs are typed and routed to a fixed set of named queues
//! - Retry policy with exponential or fixed backoff
//! - Exhausted jobs stay in the broker as `failed` until the retention window passes
//! - Progress is written straight to the broker and is visible to status readers
//!
//! ## Components
//!
//! - `JobRecord`: the unit of work and its state machine
//! - `Broker`: durable record storage (in-memory or Redis)
//! - `JobQueue`: enqueue + status lookups
//! - `Worker`: runs claimed jobs through registered handlers

pub mod broker;
pub mod executor;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_broker;
pub mod registry;
pub mod types;

pub use broker::{Broker, BrokerError, InMemoryBroker, JobCounts};
pub use executor::{Worker, WorkerConfig, WorkerHandle, WorkerStats, WorkerStatsHandle};
pub use queue::{EnqueueOptions, JobQueue, QueueError};
#[cfg(feature = "redis")]
pub use redis_broker::RedisBroker;
pub use registry::{HandlerError, HandlerRegistry, JobContext, JobHandler, RegistryError};
pub use types::{
    Backoff, BackoffStrategy, JobRecord, JobState, JobStatus, JobType, Payload, QueueName,
    RetryPolicy,
};
