// src/lib.rs
//
// qlimit-engine: a Redis-backed worker runtime with a distributed,
// multi-scope capacity limiter. Many engine processes share one Redis to
// enforce per-worker concurrency limits (clusterwide, per queue, per host,
// per process) with no central coordinator; rejected jobs are rescheduled
// with jittered backoff through the schedule index.

pub mod config;
pub mod fetch;
pub mod job;
pub mod limiter;
pub mod message;
pub mod queue;
pub mod registry;
pub mod services;
pub mod utils;

pub use config::{EngineConfig, Position, QueueCollection, QueueOptions};
pub use job::{CapacityOverride, Job};
pub use limiter::limits::{DelayValue, LimitValue, LimiterDefaults, Limits, RetryPolicy};
pub use limiter::{Limiter, LimiterError, Outcome};
pub use message::JobMessage;
pub use queue::{enqueue, enqueue_in, enqueue_message};
pub use registry::register_job;
