// src/queue.rs
use crate::job::Job;
use crate::message::JobMessage;
use crate::utils::constants::{PREFIX_JOB, PREFIX_QUEUE, QUEUES_SET, SCHEDULE_KEY};
use crate::utils::rdconfig::get_redis_connection;

use chrono::Utc;
use nanoid::nanoid;
use redis::AsyncCommands;
use serde::Serialize;
use serde_json::to_string;
use tracing::debug;

/// Enqueue a job for immediate execution. Returns the job id.
pub async fn enqueue<J>(job: J) -> anyhow::Result<String>
where
    J: Job + Serialize,
{
    let payload = to_string(&job)?;
    let message = JobMessage::new(nanoid!(10), job.name(), job.queue(), payload);
    enqueue_message(&message).await
}

/// Schedule a job to run after `delay_secs`. The serialized message goes into
/// the schedule index; the poller enqueues it once due. Returns the job id.
pub async fn enqueue_in<J>(job: J, delay_secs: u64) -> anyhow::Result<String>
where
    J: Job + Serialize,
{
    let payload = to_string(&job)?;
    let message = JobMessage::new(nanoid!(10), job.name(), job.queue(), payload);
    let run_at = Utc::now().timestamp() + delay_secs as i64;

    let mut conn = get_redis_connection().await?;
    conn.zadd::<_, _, _, ()>(SCHEDULE_KEY, to_string(&message)?, run_at)
        .await?;

    debug!(job_id = %message.id, queue = %message.queue, run_at, "scheduled job");
    Ok(message.id)
}

/// Enqueue an already-built message onto its queue: write the job hash, push
/// the id, and record the queue. Used directly by the schedule poller, which
/// must preserve `limiter_retry_count` across reschedules.
pub async fn enqueue_message(message: &JobMessage) -> anyhow::Result<String> {
    let mut conn = get_redis_connection().await?;
    let now = Utc::now().to_rfc3339();

    let queue_key = format!("{PREFIX_QUEUE}:{}", message.queue);
    let job_key = format!("{PREFIX_JOB}:{}", message.id);

    conn.hset_multiple::<_, _, _, ()>(
        &job_key,
        &[
            ("queue", message.queue.as_str()),
            ("job_type", message.job_type.as_str()),
            ("status", "pending"),
            ("payload", message.payload.as_str()),
            ("retry", if message.retry { "true" } else { "false" }),
            (
                "limiter_retry_count",
                &message.limiter_retry_count.to_string(),
            ),
            ("created_at", &now),
        ],
    )
    .await?;

    conn.rpush::<_, _, ()>(&queue_key, &message.id).await?;
    conn.sadd::<_, _, ()>(QUEUES_SET, &message.queue).await?;

    debug!(job_id = %message.id, queue = %message.queue, "enqueued job");
    Ok(message.id.clone())
}
