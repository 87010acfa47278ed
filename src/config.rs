// src/config.rs
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use redis::AsyncCommands;
use tokio::sync::Notify;
use tracing::info;

use crate::limiter::limits::LimiterDefaults;
use crate::limiter::scope;
use crate::services::runner_service::{start_schedule_poller, start_worker_pool};
use crate::utils::constants::PREFIX_QUEUE_CONFIG;
use crate::utils::rdconfig::get_redis_connection;

pub static REDIS_URL: OnceLock<String> = OnceLock::new();
pub static ENGINE_SHUTDOWN: OnceLock<Arc<Notify>> = OnceLock::new();
static LIMITER_DEFAULTS: OnceLock<LimiterDefaults> = OnceLock::new();

pub fn get_shutdown_notify() -> Arc<Notify> {
    ENGINE_SHUTDOWN
        .get_or_init(|| Arc::new(Notify::new()))
        .clone()
}

/// Notify all running worker loops to stop gracefully.
///
/// The engine binary calls this on SIGINT/SIGTERM.
pub fn trigger_shutdown() {
    get_shutdown_notify().notify_waiters();
}

pub fn get_redis_url() -> &'static str {
    REDIS_URL.get().expect("Redis URL is not set")
}

pub fn set_redis_url(url: String) -> Result<()> {
    REDIS_URL
        .set(url)
        .map_err(|_| anyhow!("Redis URL already set"))
}

/// Engine-wide limiter fallbacks. Must be set before the first admission;
/// reading first pins the built-in defaults.
pub fn set_limiter_defaults(defaults: LimiterDefaults) -> Result<()> {
    LIMITER_DEFAULTS
        .set(defaults)
        .map_err(|_| anyhow!("Limiter defaults already set"))
}

pub fn limiter_defaults() -> &'static LimiterDefaults {
    LIMITER_DEFAULTS.get_or_init(LimiterDefaults::default)
}

/// Errors from queue-configuration mutations. Raised synchronously and never
/// retried.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("queue name cannot be empty")]
    EmptyQueueName,
    #[error("queue {0} cannot be positioned relative to itself")]
    SelfReference(String),
    #[error("unable to find reference priority queue {0}")]
    UnknownReferenceQueue(String),
}

/// Where to place a queue in the priority list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    Front,
    Before(String),
    After(String),
}

/// Which queue collection an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCollection {
    Queues,
    PriorityQueues,
}

/// The engine's queue configuration: which queues to poll, which of them are
/// prioritized, and the host-identity queue. Owned by whoever boots the
/// engine and passed in explicitly; the runtime never mutates it.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub queues: Vec<String>,
    pub priority_queues: Vec<String>,
    /// Keep the configured polling order instead of shuffling non-priority
    /// queues.
    pub strict: bool,
    /// Overrides the machine hostname as the host-identity queue name.
    pub host_queue: Option<String>,
}

impl QueueOptions {
    pub fn new(queues: Vec<String>) -> Self {
        let mut options = Self::default();
        for queue in queues {
            if !options.queues.contains(&queue) {
                options.queues.push(queue);
            }
        }
        options
    }

    /// Move a queue into the priority list. `Front` prepends; `Before`/
    /// `After` place it relative to a queue already in the priority list.
    /// A prioritized queue is removed from the plain list, and repeated
    /// prioritization relocates rather than duplicates.
    pub fn prioritize_queue(&mut self, name: &str, position: Position) -> Result<(), ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::EmptyQueueName);
        }
        match &position {
            Position::Front => {
                self.priority_queues.retain(|q| q != name);
                self.priority_queues.insert(0, name.to_string());
            }
            Position::Before(reference) | Position::After(reference) => {
                if reference == name {
                    return Err(ConfigError::SelfReference(name.to_string()));
                }
                let mut index = self
                    .priority_queues
                    .iter()
                    .position(|q| q == reference)
                    .ok_or_else(|| ConfigError::UnknownReferenceQueue(reference.clone()))?;
                // Removing an earlier occurrence of the queue shifts the
                // reference left by one.
                if let Some(existing) = self.priority_queues.iter().position(|q| q == name) {
                    if existing < index {
                        index -= 1;
                    }
                }
                self.priority_queues.retain(|q| q != name);
                if matches!(position, Position::After(_)) {
                    index += 1;
                }
                self.priority_queues.insert(index, name.to_string());
            }
        }
        self.queues.retain(|q| q != name);
        Ok(())
    }

    /// Remove every occurrence of a queue from the given collection.
    pub fn remove_queue(&mut self, name: &str, from: QueueCollection) -> Result<(), ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::EmptyQueueName);
        }
        let collection = match from {
            QueueCollection::Queues => &mut self.queues,
            QueueCollection::PriorityQueues => &mut self.priority_queues,
        };
        collection.retain(|q| q != name);
        Ok(())
    }

    /// The host-identity queue: configured override or the machine hostname.
    pub fn host_queue(&self) -> String {
        self.host_queue.clone().unwrap_or_else(scope::host)
    }

    /// Register the host-identity queue with the given polling weight.
    /// Appends copies until the queue appears `weight` times; an existing
    /// equal or higher weight is left alone. Weight below 1 is coerced to 1.
    pub fn register_host_queue(&mut self, weight: usize) {
        let weight = weight.max(1);
        let host_queue = self.host_queue();
        let existing = self.queues.iter().filter(|q| **q == host_queue).count();
        for _ in existing..weight {
            self.queues.push(host_queue.clone());
        }
    }

    /// Every queue this engine polls, deduplicated, priority first.
    pub fn all_queues(&self) -> Vec<String> {
        let mut all: Vec<String> = Vec::new();
        for queue in self.priority_queues.iter().chain(self.queues.iter()) {
            if !all.contains(queue) {
                all.push(queue.clone());
            }
        }
        all
    }
}

async fn store_queue_metadata(options: &QueueOptions, concurrency: usize) -> Result<()> {
    let mut conn = get_redis_connection().await?;
    for queue in options.all_queues() {
        let config_key = format!("{PREFIX_QUEUE_CONFIG}:{queue}");
        let priority = options.priority_queues.contains(&queue);
        conn.hset_multiple::<_, _, _, ()>(
            &config_key,
            &[
                ("concurrency", concurrency.to_string()),
                ("priority", priority.to_string()),
            ],
        )
        .await?;
    }
    Ok(())
}

/// Boot configuration for one engine process.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub queues: QueueOptions,
    pub concurrency: usize,
}

impl EngineConfig {
    pub fn new(queues: QueueOptions, concurrency: usize) -> Self {
        Self {
            queues,
            concurrency,
        }
    }

    /// Wire up Redis, record queue metadata, and start the worker pool and
    /// schedule poller.
    pub async fn initialize(self, redis_url: String) -> Result<()> {
        set_redis_url(redis_url)?;
        store_queue_metadata(&self.queues, self.concurrency).await?;

        info!("Worker Pool Started");
        start_worker_pool(self.queues, self.concurrency).await;

        info!("Schedule Poller Started");
        start_schedule_poller().await;

        Ok(())
    }
}
