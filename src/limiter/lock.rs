// src/limiter/lock.rs
use std::time::Duration;

use nanoid::nanoid;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tokio::time::{sleep, Instant};

/// Lease on the admission lock. Expiry recovers locks held by crashed
/// processes; the lease must comfortably outlast one capacity check plus one
/// registration round trip.
pub const LOCK_LEASE: Duration = Duration::from_secs(10);

/// How long an admission attempt is willing to wait for the lock before
/// treating contention as a capacity rejection.
pub const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(250);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

// Delete only if we still hold the lease.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

/// Advisory lock keyed by worker identity, so contention stays proportional
/// to one worker type's own admission rate.
pub struct WorkerLock {
    key: String,
    token: String,
}

impl WorkerLock {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: nanoid!(16),
        }
    }

    /// Try to take the lock within [`LOCK_ACQUIRE_TIMEOUT`]. Returns `false`
    /// on contention; the caller treats that as capacity-unavailable, never
    /// as an error.
    pub async fn acquire(&self, conn: &mut MultiplexedConnection) -> redis::RedisResult<bool> {
        let deadline = Instant::now() + LOCK_ACQUIRE_TIMEOUT;
        loop {
            let taken: Option<String> = redis::cmd("SET")
                .arg(&self.key)
                .arg(&self.token)
                .arg("NX")
                .arg("PX")
                .arg(LOCK_LEASE.as_millis() as u64)
                .query_async(conn)
                .await?;
            if taken.is_some() {
                return Ok(true);
            }
            if Instant::now() + LOCK_RETRY_INTERVAL > deadline {
                return Ok(false);
            }
            sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    /// Release the lock if this holder still owns it. A lease that already
    /// expired (and was possibly re-acquired elsewhere) is left alone.
    pub async fn release(&self, conn: &mut MultiplexedConnection) -> redis::RedisResult<()> {
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(conn)
            .await?;
        Ok(())
    }
}
