// src/limiter/scope.rs
use nanoid::nanoid;

use crate::limiter::limits::Limits;
use crate::message::JobMessage;
use crate::utils::constants::LIMITER_PREFIX;

/// The four concurrency-counting domains, in canonical priority order.
///
/// Every list the limiter builds per admission (limits, counts, keys) is
/// zipped positionally against this order; `limited_scopes` must therefore
/// always return a subsequence of [`Scope::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Clusterwide concurrency for this worker type.
    PerRedis,
    /// Concurrency within the job's queue.
    PerQueue,
    /// Concurrency on the executing host.
    PerHost,
    /// Concurrency within one OS process.
    PerProcess,
}

impl Scope {
    pub const ALL: [Scope; 4] = [
        Scope::PerRedis,
        Scope::PerQueue,
        Scope::PerHost,
        Scope::PerProcess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::PerRedis => "per_redis",
            Scope::PerQueue => "per_queue",
            Scope::PerHost => "per_host",
            Scope::PerProcess => "per_process",
        }
    }
}

/// Subset of scopes the worker actually limits, in canonical order.
pub fn limited_scopes(limits: &Limits) -> Vec<Scope> {
    Scope::ALL
        .into_iter()
        .filter(|scope| limit_option(limits, *scope).is_some())
        .collect()
}

pub(crate) fn limit_option(
    limits: &Limits,
    scope: Scope,
) -> Option<crate::limiter::limits::LimitValue> {
    match scope {
        Scope::PerRedis => limits.per_redis,
        Scope::PerQueue => limits.per_queue,
        Scope::PerHost => limits.per_host,
        Scope::PerProcess => limits.per_process,
    }
}

/// Namespaced identity of a worker type: the configured `key` override, else
/// the canonical form of the worker name (lowercased, path separators
/// collapsed to colons).
pub fn worker_key(worker_name: &str, limits: &Limits) -> String {
    let tail = match &limits.key {
        Some(key) => key.clone(),
        None => canonical_worker_key(worker_name),
    };
    format!("{LIMITER_PREFIX}:{tail}")
}

fn canonical_worker_key(worker_name: &str) -> String {
    worker_name.to_lowercase().replace("::", ":").replace('/', ":")
}

/// Fully-qualified membership-set keys for the given scopes, zipped with the
/// canonical scope order.
pub fn scope_keys(worker_key: &str, scopes: &[Scope], message: &JobMessage) -> Vec<String> {
    scopes
        .iter()
        .map(|scope| scope_key(worker_key, *scope, &message.queue, &host(), process_id()))
        .collect()
}

fn scope_key(worker_key: &str, scope: Scope, queue: &str, host: &str, pid: u32) -> String {
    match scope {
        Scope::PerRedis => format!("{worker_key}:per_redis"),
        Scope::PerQueue => format!("{worker_key}:per_queue:{queue}"),
        Scope::PerHost => format!("{worker_key}:per_host:{host}"),
        Scope::PerProcess => format!("{worker_key}:per_process:{host}:{pid}"),
    }
}

pub(crate) fn host() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".into())
}

fn process_id() -> u32 {
    std::process::id()
}

tokio::task_local! {
    /// Identity of the job execution currently running on this task. Scoped
    /// by the runner around each job so the token stays stable for the whole
    /// execution, including the limiter's register/release pair.
    pub static EXECUTION_ID: String;
}

/// A fresh identity token for one job execution: host, process, and a random
/// discriminator, distinct across concurrent executions anywhere in the
/// fleet with overwhelming probability.
pub fn new_execution_identity() -> String {
    format!("{}:{}-{}", host(), process_id(), nanoid!(8))
}

/// The identity of the current execution. Inside a runner-scoped task this is
/// the token registered in the liveness registry; elsewhere it falls back to
/// a thread-derived identity.
pub fn execution_identity() -> String {
    EXECUTION_ID
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| {
            format!("{}:{}-{:?}", host(), process_id(), std::thread::current().id())
        })
}
