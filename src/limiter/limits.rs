// src/limiter/limits.rs
use crate::message::JobMessage;

/// A concurrency limit that is either a constant or computed from the
/// message at lookup time.
#[derive(Debug, Clone, Copy)]
pub enum LimitValue {
    Constant(u32),
    Computed(fn(&JobMessage) -> u32),
}

impl LimitValue {
    pub fn resolve(&self, message: &JobMessage) -> u32 {
        match self {
            LimitValue::Constant(n) => *n,
            LimitValue::Computed(f) => f(message),
        }
    }
}

/// A reschedule delay in seconds, constant or computed from the message.
#[derive(Debug, Clone, Copy)]
pub enum DelayValue {
    Constant(u64),
    Computed(fn(&JobMessage) -> u64),
}

impl DelayValue {
    pub fn resolve(&self, message: &JobMessage) -> u64 {
        match self {
            DelayValue::Constant(n) => *n,
            DelayValue::Computed(f) => f(message),
        }
    }
}

/// How many times a capacity-rejected message may be rescheduled.
/// `Attempts(0)` behaves like `Disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Attempts(u32),
    Disabled,
}

/// Per-worker limiter options. Each of the four scopes is optional; a worker
/// with none configured is never limited and never touches Redis.
#[derive(Debug, Clone, Default)]
pub struct Limits {
    pub per_redis: Option<LimitValue>,
    pub per_queue: Option<LimitValue>,
    pub per_host: Option<LimitValue>,
    pub per_process: Option<LimitValue>,
    /// Overrides the worker identity string used to namespace scope keys and
    /// the admission lock.
    pub key: Option<String>,
    /// Unset falls back to the engine-wide default, then to
    /// [`super::retry::DEFAULT_MAX_RETRIES`].
    pub retry: Option<RetryPolicy>,
    /// Unset falls back to the engine-wide default, then to the built-in
    /// backoff formula.
    pub retry_delay: Option<DelayValue>,
}

impl Limits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn per_redis(mut self, limit: u32) -> Self {
        self.per_redis = Some(LimitValue::Constant(limit));
        self
    }

    pub fn per_queue(mut self, limit: u32) -> Self {
        self.per_queue = Some(LimitValue::Constant(limit));
        self
    }

    pub fn per_host(mut self, limit: u32) -> Self {
        self.per_host = Some(LimitValue::Constant(limit));
        self
    }

    pub fn per_process(mut self, limit: u32) -> Self {
        self.per_process = Some(LimitValue::Constant(limit));
        self
    }

    pub fn per_redis_with(mut self, f: fn(&JobMessage) -> u32) -> Self {
        self.per_redis = Some(LimitValue::Computed(f));
        self
    }

    pub fn per_queue_with(mut self, f: fn(&JobMessage) -> u32) -> Self {
        self.per_queue = Some(LimitValue::Computed(f));
        self
    }

    pub fn per_host_with(mut self, f: fn(&JobMessage) -> u32) -> Self {
        self.per_host = Some(LimitValue::Computed(f));
        self
    }

    pub fn per_process_with(mut self, f: fn(&JobMessage) -> u32) -> Self {
        self.per_process = Some(LimitValue::Computed(f));
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn retry(mut self, attempts: u32) -> Self {
        self.retry = Some(RetryPolicy::Attempts(attempts));
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retry = Some(RetryPolicy::Disabled);
        self
    }

    pub fn retry_delay(mut self, seconds: u64) -> Self {
        self.retry_delay = Some(DelayValue::Constant(seconds));
        self
    }

    pub fn retry_delay_with(mut self, f: fn(&JobMessage) -> u64) -> Self {
        self.retry_delay = Some(DelayValue::Computed(f));
        self
    }
}

/// Engine-wide fallbacks for `retry` and `retry_delay`, consulted when the
/// worker's own `Limits` leave them unset.
#[derive(Debug, Clone, Default)]
pub struct LimiterDefaults {
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<DelayValue>,
}
