// src/limiter/retry.rs
use chrono::Utc;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::debug;

use crate::config::limiter_defaults;
use crate::limiter::limits::{Limits, RetryPolicy};
use crate::limiter::LimiterError;
use crate::message::JobMessage;
use crate::utils::constants::SCHEDULE_KEY;

/// Rescheduling attempts allowed when neither the worker nor the engine
/// configures `retry`.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Reschedule attempts allowed for this worker, resolved worker → engine →
/// default. `None` means rescheduling is disabled.
pub fn max_retries(limits: &Limits) -> Option<u32> {
    let policy = limits
        .retry
        .or(limiter_defaults().retry)
        .unwrap_or(RetryPolicy::Attempts(DEFAULT_MAX_RETRIES));
    match policy {
        RetryPolicy::Disabled | RetryPolicy::Attempts(0) => None,
        RetryPolicy::Attempts(n) => Some(n),
    }
}

/// Delay in seconds before the message's next admission attempt, resolved
/// worker → engine → built-in backoff.
pub fn retry_delay(limits: &Limits, message: &JobMessage) -> u64 {
    limits
        .retry_delay
        .or(limiter_defaults().retry_delay)
        .map(|delay| delay.resolve(message))
        .unwrap_or_else(|| default_retry_delay(message.limiter_retry_count))
}

/// Default backoff: `count^4 + 15 + rand(0..49) * (count + 1)` seconds.
/// Spreads ten attempts over roughly five hours, with jitter so many
/// rejected workers don't reschedule in lockstep.
pub fn default_retry_delay(retry_count: u32) -> u64 {
    let count = u64::from(retry_count);
    let jitter = rand::thread_rng().gen_range(0..50u64);
    count.pow(4) + 15 + jitter * (count + 1)
}

/// Increment the message's reschedule counter and write the serialized copy
/// into the schedule index at `now + delay`. The insert is idempotent at the
/// store level; deduplication is the schedule consumer's concern.
pub async fn schedule_retry(
    conn: &mut MultiplexedConnection,
    message: &mut JobMessage,
    delay: u64,
) -> Result<(), LimiterError> {
    message.limiter_retry_count += 1;
    let run_at = Utc::now().timestamp() + delay as i64;
    let payload = serde_json::to_string(message)?;
    conn.zadd::<_, _, _, ()>(SCHEDULE_KEY, payload, run_at).await?;
    debug!(
        worker = %message.job_type,
        retry = message.limiter_retry_count,
        delay_secs = delay,
        "capacity limit reached, rescheduled"
    );
    Ok(())
}
