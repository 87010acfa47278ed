// src/services/runner_service.rs
//
// The host runtime: polls queues in hybrid-fetch order, maintains the
// liveness registry, and invokes every job body through the admission
// controller.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt; // for `now_or_never`
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, warn};

use crate::config::{get_shutdown_notify, QueueOptions};
use crate::fetch::queue_order;
use crate::job::Job;
use crate::limiter::scope::{new_execution_identity, EXECUTION_ID};
use crate::limiter::{Limiter, LimiterError, Outcome};
use crate::message::JobMessage;
use crate::queue::enqueue_message;
use crate::registry::get_job_handler;
use crate::utils::constants::{
    CLAIM_BATCH_LIMIT, MAX_JOB_ERROR_RETRIES, PREFIX_JOB, PREFIX_QUEUE, SCHEDULE_KEY, WORKERS_SET,
};
use crate::utils::rdconfig::get_redis_connection;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SCHEDULE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Spawn `concurrency` worker tasks that poll the configured queues and run
/// jobs until shutdown is triggered.
pub async fn start_worker_pool(options: QueueOptions, concurrency: usize) {
    let shutdown = get_shutdown_notify();
    let options = Arc::new(options);

    for _ in 0..concurrency {
        let options = options.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            loop {
                if shutdown.notified().now_or_never().is_some() {
                    break;
                }

                let mut conn = match get_redis_connection().await {
                    Ok(c) => c,
                    Err(_) => {
                        sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                match pop_next_job(&mut conn, &options).await {
                    Some((queue, job_id)) => {
                        if let Err(err) = process_job(&mut conn, &job_id).await {
                            error!(queue = %queue, job_id = %job_id, error = ?err, "job processing failed");
                        }
                    }
                    None => sleep(IDLE_POLL_INTERVAL).await,
                }
            }
        });
    }
}

/// One polling pass over the queues, priority order first.
async fn pop_next_job(
    conn: &mut MultiplexedConnection,
    options: &QueueOptions,
) -> Option<(String, String)> {
    for queue in queue_order(options) {
        let job_id: Option<String> = conn
            .lpop(format!("{PREFIX_QUEUE}:{queue}"), None)
            .await
            .unwrap_or(None);
        if let Some(job_id) = job_id {
            return Some((queue, job_id));
        }
    }
    None
}

async fn process_job(conn: &mut MultiplexedConnection, job_id: &str) -> anyhow::Result<()> {
    let Some(mut message) = load_message(conn, job_id).await? else {
        warn!(job_id, "job hash missing, skipping");
        return Ok(());
    };

    let Some(handler) = get_job_handler(&message.job_type) else {
        set_job_fields(
            conn,
            job_id,
            &[
                ("status", "failed"),
                ("error", "no registered handler"),
                ("failed_at", &Utc::now().to_rfc3339()),
            ],
        )
        .await;
        warn!(job_id, job_type = %message.job_type, "no registered handler");
        return Ok(());
    };

    let job = match handler(message.payload.clone()).await {
        Ok(job) => job,
        Err(err) => {
            set_job_fields(
                conn,
                job_id,
                &[
                    ("status", "failed"),
                    ("error", &err.to_string()),
                    ("failed_at", &Utc::now().to_rfc3339()),
                ],
            )
            .await;
            warn!(job_id, error = ?err, "failed to deserialize job");
            return Ok(());
        }
    };

    // Register this execution as alive before admission so the limiter's
    // stale-member purge can tell it apart from a crashed one.
    let identity = new_execution_identity();
    conn.sadd::<_, _, ()>(WORKERS_SET, &identity).await?;

    let outcome = EXECUTION_ID
        .scope(identity.clone(), async {
            Limiter::call(job.as_ref(), &mut message, || run_body(job.as_ref())).await
        })
        .await;

    let _: () = conn
        .srem(WORKERS_SET, &identity)
        .await
        .unwrap_or_default();

    match outcome {
        Ok(Outcome::Completed) => {
            set_job_fields(
                conn,
                job_id,
                &[
                    ("status", "success"),
                    ("completed_at", &Utc::now().to_rfc3339()),
                ],
            )
            .await;
        }
        Ok(Outcome::Rescheduled) => {
            debug!(job_id, retry = message.limiter_retry_count, "deferred by capacity limiter");
            set_job_fields(conn, job_id, &[("status", "deferred")]).await;
        }
        Ok(Outcome::Overridden) => {
            set_job_fields(conn, job_id, &[("status", "overridden")]).await;
        }
        Err(err) if is_fatal_capacity_failure(&err) => {
            error!(job_id, worker = %message.job_type, error = %err, "fatal capacity failure");
            set_job_fields(
                conn,
                job_id,
                &[
                    ("status", "capacity_failed"),
                    ("error", &err.to_string()),
                    ("failed_at", &Utc::now().to_rfc3339()),
                ],
            )
            .await;
        }
        Err(err) => handle_job_failure(conn, &message, err).await?,
    }

    Ok(())
}

fn is_fatal_capacity_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<LimiterError>(),
        Some(LimiterError::RetryDisabled { .. }) | Some(LimiterError::RetriesExhausted { .. })
    )
}

async fn run_body(job: &dyn Job) -> anyhow::Result<()> {
    job.before().await?;
    let result = job.perform().await;
    match &result {
        Ok(()) => job.after().await,
        Err(err) => job.on_error(err).await,
    }
    job.always().await;
    result
}

/// Job-body errors get a short linear backoff, distinct from the limiter's
/// capacity reschedule (which threads its own counter).
async fn handle_job_failure(
    conn: &mut MultiplexedConnection,
    message: &JobMessage,
    err: anyhow::Error,
) -> anyhow::Result<()> {
    let job_key = format!("{PREFIX_JOB}:{}", message.id);
    set_job_fields(
        conn,
        &message.id,
        &[
            ("error", &err.to_string()),
            ("failed_at", &Utc::now().to_rfc3339()),
        ],
    )
    .await;

    if !message.retry {
        set_job_fields(conn, &message.id, &[("status", "failed")]).await;
        return Ok(());
    }

    let retries: i64 = conn.hincr(&job_key, "retries", 1).await?;
    if retries <= MAX_JOB_ERROR_RETRIES {
        let backoff = 10 * retries;
        let run_at = Utc::now().timestamp() + backoff;
        conn.zadd::<_, _, _, ()>(SCHEDULE_KEY, serde_json::to_string(message)?, run_at)
            .await?;
        set_job_fields(conn, &message.id, &[("status", "retrying")]).await;
        debug!(job_id = %message.id, retries, backoff, "scheduled error retry");
    } else {
        set_job_fields(conn, &message.id, &[("status", "failed")]).await;
    }
    Ok(())
}

async fn load_message(
    conn: &mut MultiplexedConnection,
    job_id: &str,
) -> anyhow::Result<Option<JobMessage>> {
    let job_key = format!("{PREFIX_JOB}:{job_id}");
    let fields: HashMap<String, String> = conn.hgetall(&job_key).await?;
    if fields.is_empty() {
        return Ok(None);
    }
    Ok(Some(JobMessage {
        id: job_id.to_string(),
        job_type: fields.get("job_type").cloned().unwrap_or_default(),
        queue: fields
            .get("queue")
            .cloned()
            .unwrap_or_else(|| "default".to_string()),
        payload: fields.get("payload").cloned().unwrap_or_default(),
        retry: fields.get("retry").map(|v| v == "true").unwrap_or(true),
        limiter_retry_count: fields
            .get("limiter_retry_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    }))
}

async fn set_job_fields(conn: &mut MultiplexedConnection, job_id: &str, fields: &[(&str, &str)]) {
    let job_key = format!("{PREFIX_JOB}:{job_id}");
    let _: () = conn.hset_multiple(&job_key, fields).await.unwrap_or_default();
}

// Atomically claim due members so concurrent engine processes never enqueue
// the same scheduled message twice.
const CLAIM_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local members = redis.call('ZRANGEBYSCORE', key, '-inf', now, 'LIMIT', 0, limit)
for i, member in ipairs(members) do
  redis.call('ZREM', key, member)
end
return members
"#;

/// Spawn the schedule poller: drains due entries from the schedule index and
/// enqueues them onto their queues.
pub async fn start_schedule_poller() {
    let shutdown = get_shutdown_notify();
    tokio::spawn(async move {
        loop {
            if shutdown.notified().now_or_never().is_some() {
                break;
            }
            if let Err(err) = drain_due_messages().await {
                error!(error = ?err, "schedule poller error");
            }
            sleep(SCHEDULE_POLL_INTERVAL).await;
        }
    });
}

async fn drain_due_messages() -> anyhow::Result<()> {
    let mut conn = get_redis_connection().await?;
    let now = Utc::now().timestamp();

    let due: Vec<String> = Script::new(CLAIM_SCRIPT)
        .key(SCHEDULE_KEY)
        .arg(now)
        .arg(CLAIM_BATCH_LIMIT as i64)
        .invoke_async(&mut conn)
        .await?;

    for raw in due {
        match serde_json::from_str::<JobMessage>(&raw) {
            Ok(message) => {
                if let Err(err) = enqueue_message(&message).await {
                    error!(job_id = %message.id, error = ?err, "failed to enqueue scheduled job");
                }
            }
            Err(err) => {
                warn!(error = ?err, "dropping unparseable scheduled message");
            }
        }
    }
    Ok(())
}
