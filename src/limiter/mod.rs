// src/limiter/mod.rs
//
// Distributed, multi-scope capacity limiter.
//
// Many engine processes, possibly on many hosts, share one Redis to enforce
// per-worker concurrency limits without a central coordinator. An admission
// takes at most a few round trips: an optimistic capacity read, a short-lived
// per-worker lock, an authoritative re-check, and one atomic multi-key
// registration. Capacity leaked by crashed executions is recovered lazily by
// intersecting scope membership with the runner's liveness registry.

pub mod capacity;
pub mod limits;
pub mod lock;
pub mod retry;
pub mod scope;

use std::future::Future;

use redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

use crate::job::Job;
use crate::limiter::limits::Limits;
use crate::limiter::lock::WorkerLock;
use crate::limiter::scope::{execution_identity, limited_scopes, scope_keys, worker_key, Scope};
use crate::message::JobMessage;
use crate::utils::rdconfig::get_redis_connection;

/// Failures the limiter itself can produce. Job-body errors pass through
/// untouched and never take these shapes.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("capacity limit reached: unable to allocate worker {worker}; rescheduling is disabled")]
    RetryDisabled { worker: String },
    #[error("capacity limit reached: unable to allocate worker {worker}; all reschedule attempts are exhausted")]
    RetriesExhausted { worker: String },
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("serializing job message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// What the limiter did with one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The job body ran (whether limited or not).
    Completed,
    /// Admission was rejected and the message was written to the schedule
    /// index for a later attempt.
    Rescheduled,
    /// Admission was rejected and the worker's override took over.
    Overridden,
}

/// One worker admission, fully resolved against a message: which scopes
/// apply, their limits, their membership-set keys, and the lock key.
pub struct LimitedJob {
    worker: String,
    limits: Limits,
    scopes: Vec<Scope>,
    scope_limits: Vec<u32>,
    scope_keys: Vec<String>,
    lock_key: String,
}

enum Admission {
    Admitted,
    Rejected,
}

impl LimitedJob {
    pub fn new(job: &dyn Job, message: &JobMessage) -> Self {
        let limits = job.limits();
        let scopes = limited_scopes(&limits);
        let lock_key = worker_key(job.name(), &limits);
        let scope_limits = scopes
            .iter()
            .map(|s| {
                scope::limit_option(&limits, *s)
                    .expect("limited scope without a limit")
                    .resolve(message)
            })
            .collect();
        let scope_keys = scope_keys(&lock_key, &scopes, message);
        Self {
            worker: job.name().to_string(),
            limits,
            scopes,
            scope_limits,
            scope_keys,
            lock_key,
        }
    }

    pub fn is_limited(&self) -> bool {
        !self.scopes.is_empty()
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    pub fn scope_keys(&self) -> &[String] {
        &self.scope_keys
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Add this execution's identity token to every scope membership set in
    /// one transaction. Caller must hold the admission lock.
    pub async fn register(
        &self,
        conn: &mut MultiplexedConnection,
        token: &str,
    ) -> redis::RedisResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in &self.scope_keys {
            pipe.sadd(key, token).ignore();
        }
        pipe.query_async(conn).await
    }

    /// Remove this execution's identity token from every scope membership
    /// set. Removal of one's own token commutes with concurrent membership
    /// changes, so no lock is needed and the call is idempotent.
    pub async fn unregister(
        &self,
        conn: &mut MultiplexedConnection,
        token: &str,
    ) -> redis::RedisResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in &self.scope_keys {
            pipe.srem(key, token).ignore();
        }
        pipe.query_async(conn).await
    }

    async fn try_admit(
        &self,
        conn: &mut MultiplexedConnection,
        token: &str,
    ) -> Result<Admission, LimiterError> {
        // Optimistic pre-check keeps the saturated path off the lock.
        if !capacity::capacity_available(conn, &self.scope_keys, &self.scope_limits).await? {
            return Ok(Admission::Rejected);
        }

        let lock = WorkerLock::new(&self.lock_key);
        if !lock.acquire(conn).await? {
            // Lock contention is a capacity signal, not a failure.
            debug!(worker = %self.worker, "admission lock contended");
            return Ok(Admission::Rejected);
        }

        // Authoritative check-then-register under the lock; this is what
        // closes the race between concurrent admission attempts.
        let decision = match capacity::capacity_available(conn, &self.scope_keys, &self.scope_limits)
            .await
        {
            Ok(true) => self
                .register(conn, token)
                .await
                .map(|()| Admission::Admitted)
                .map_err(LimiterError::from),
            Ok(false) => Ok(Admission::Rejected),
            Err(err) => Err(LimiterError::from(err)),
        };

        if let Err(err) = lock.release(conn).await {
            // Lease expiry will clean up behind us.
            warn!(worker = %self.worker, error = %err, "failed to release admission lock");
        }
        decision
    }
}

/// The admission controller. Wraps one job execution in an admission
/// decision; see the module docs for the protocol.
pub struct Limiter;

impl Limiter {
    /// Run `body` if capacity allows, otherwise defer or reject the message.
    ///
    /// Workers with no configured scopes pass straight through to the body
    /// with zero store access. For limited workers, the execution's identity
    /// token occupies every configured scope set for exactly the duration of
    /// the body; release happens whether the body succeeds or fails, and a
    /// body error is propagated unaltered.
    pub async fn call<F, Fut>(
        job: &dyn Job,
        message: &mut JobMessage,
        body: F,
    ) -> anyhow::Result<Outcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let limited = LimitedJob::new(job, message);
        if !limited.is_limited() {
            body().await?;
            return Ok(Outcome::Completed);
        }

        let mut conn = get_redis_connection().await?;
        let token = execution_identity();

        match limited.try_admit(&mut conn, &token).await? {
            Admission::Admitted => {
                let result = body().await;
                if let Err(err) = limited.unregister(&mut conn, &token).await {
                    // The membership entry outlives us but the purge will
                    // reclaim it once this identity leaves the registry.
                    warn!(
                        worker = %limited.worker,
                        error = %err,
                        "failed to release capacity reservation"
                    );
                }
                result.map(|()| Outcome::Completed)
            }
            Admission::Rejected => Self::handle_rejection(job, message, &limited, &mut conn).await,
        }
    }

    /// Rejection resolution, in priority order: worker override, fatal error
    /// when rescheduling is disabled or exhausted, else backoff reschedule.
    async fn handle_rejection(
        job: &dyn Job,
        message: &mut JobMessage,
        limited: &LimitedJob,
        conn: &mut MultiplexedConnection,
    ) -> anyhow::Result<Outcome> {
        if let Some(strategy) = job.capacity_override() {
            strategy.on_capacity_exceeded(message).await?;
            return Ok(Outcome::Overridden);
        }

        let Some(max) = retry::max_retries(&limited.limits) else {
            return Err(LimiterError::RetryDisabled {
                worker: limited.worker.clone(),
            }
            .into());
        };
        if message.limiter_retry_count >= max {
            return Err(LimiterError::RetriesExhausted {
                worker: limited.worker.clone(),
            }
            .into());
        }

        let delay = retry::retry_delay(&limited.limits, message);
        retry::schedule_retry(conn, message, delay).await?;
        Ok(Outcome::Rescheduled)
    }
}
