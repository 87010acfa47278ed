//! Admission-controller properties exercised against a live Redis.
//!
//! These tests are ignored by default; run them with a local server:
//!
//!   REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored
//!
//! Each test namespaces its own worker key, so the suite is safe to run in
//! parallel against a shared database.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::time::{sleep, Duration};

use qlimit_engine::limiter::scope::{new_execution_identity, EXECUTION_ID};
use qlimit_engine::limiter::LimitedJob;
use qlimit_engine::utils::constants::{SCHEDULE_KEY, WORKERS_SET};
use qlimit_engine::utils::rdconfig::get_redis_connection;
use qlimit_engine::{CapacityOverride, Job, JobMessage, Limiter, LimiterError, Limits, Outcome};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn test_conn() -> MultiplexedConnection {
    let _ = qlimit_engine::config::set_redis_url(redis_url());
    get_redis_connection().await.expect("redis available")
}

/// Run one limiter call the way the runner does: a fresh execution identity,
/// registered in the liveness set for the duration of the call.
async fn call_registered<F, Fut>(
    job: &dyn Job,
    message: &mut JobMessage,
    body: F,
) -> anyhow::Result<Outcome>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut conn = test_conn().await;
    let identity = new_execution_identity();
    let _: () = conn.sadd(WORKERS_SET, &identity).await.unwrap();
    let outcome = EXECUTION_ID
        .scope(identity.clone(), Limiter::call(job, message, body))
        .await;
    let _: () = conn.srem(WORKERS_SET, &identity).await.unwrap();
    outcome
}

async fn clear_scope_keys(job: &dyn Job, message: &JobMessage) {
    let mut conn = test_conn().await;
    for key in LimitedJob::new(job, message).scope_keys() {
        let _: () = conn.del(key).await.unwrap();
    }
}

struct MutexJob;

#[async_trait]
impl Job for MutexJob {
    fn name(&self) -> &'static str {
        "itest_mutex"
    }
    fn queue(&self) -> &'static str {
        "itest"
    }
    fn limits(&self) -> Limits {
        Limits::new().per_redis(1).no_retry()
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis"]
async fn concurrent_admissions_admit_exactly_one() {
    let mut a = JobMessage::new("mx-a", "itest_mutex", "itest", "{}");
    let mut b = JobMessage::new("mx-b", "itest_mutex", "itest", "{}");
    clear_scope_keys(&MutexJob, &a).await;

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_a = ran.clone();
    let ran_b = ran.clone();

    let (left, right) = tokio::join!(
        call_registered(&MutexJob, &mut a, || async move {
            ran_a.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(500)).await;
            Ok(())
        }),
        call_registered(&MutexJob, &mut b, || async move {
            ran_b.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(500)).await;
            Ok(())
        }),
    );

    assert_eq!(ran.load(Ordering::SeqCst), 1, "exactly one body may run");
    let outcomes = [left, right];
    assert_eq!(
        outcomes.iter().filter(|o| o.is_ok()).count(),
        1,
        "one admission succeeds"
    );
    let rejected = outcomes.iter().find(|o| o.is_err()).unwrap();
    let err = rejected.as_ref().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LimiterError>(),
        Some(LimiterError::RetryDisabled { .. })
    ));
    assert!(err.to_string().contains("itest_mutex"));
}

struct ReleaseJob;

#[async_trait]
impl Job for ReleaseJob {
    fn name(&self) -> &'static str {
        "itest_release"
    }
    fn queue(&self) -> &'static str {
        "itest"
    }
    fn limits(&self) -> Limits {
        Limits::new().per_redis(2).per_queue(2).per_process(2).no_retry()
    }
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn identity_token_is_released_on_success_and_on_failure() {
    let mut message = JobMessage::new("rel-1", "itest_release", "itest", "{}");
    clear_scope_keys(&ReleaseJob, &message).await;
    let keys: Vec<String> = LimitedJob::new(&ReleaseJob, &message)
        .scope_keys()
        .to_vec();
    let mut conn = test_conn().await;

    let outcome = call_registered(&ReleaseJob, &mut message, || async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed);
    for key in &keys {
        let count: u64 = conn.scard(key).await.unwrap();
        assert_eq!(count, 0, "token leaked in {key} after success");
    }

    let err = call_registered(&ReleaseJob, &mut message, || async {
        anyhow::bail!("he's dead, jim")
    })
    .await
    .unwrap_err();
    assert_eq!(err.to_string(), "he's dead, jim");
    for key in &keys {
        let count: u64 = conn.scard(key).await.unwrap();
        assert_eq!(count, 0, "token leaked in {key} after failure");
    }
}

struct MultiScopeJob;

#[async_trait]
impl Job for MultiScopeJob {
    fn name(&self) -> &'static str {
        "itest_multi_scope"
    }
    fn queue(&self) -> &'static str {
        "itest"
    }
    fn limits(&self) -> Limits {
        Limits::new().per_queue(3).per_host(2).no_retry()
    }
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn one_saturated_scope_rejects_even_when_others_have_room() {
    let mut message = JobMessage::new("ms-1", "itest_multi_scope", "itest", "{}");
    clear_scope_keys(&MultiScopeJob, &message).await;
    let keys: Vec<String> = LimitedJob::new(&MultiScopeJob, &message)
        .scope_keys()
        .to_vec();
    let (queue_key, host_key) = (&keys[0], &keys[1]);

    // per_queue has 1 of 3, per_host has 2 of 2; all occupants are alive so
    // the purge cannot free anything.
    let mut conn = test_conn().await;
    let occupants = ["ms-occ-0", "ms-occ-1", "ms-occ-2"];
    for token in &occupants {
        let _: () = conn.sadd(WORKERS_SET, token).await.unwrap();
    }
    let _: () = conn.sadd(queue_key, "ms-occ-0").await.unwrap();
    let _: () = conn.sadd(host_key, "ms-occ-1").await.unwrap();
    let _: () = conn.sadd(host_key, "ms-occ-2").await.unwrap();

    let err = call_registered(&MultiScopeJob, &mut message, || async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LimiterError>(),
        Some(LimiterError::RetryDisabled { .. })
    ));

    // Freeing one host slot admits the job.
    let _: () = conn.srem(host_key, "ms-occ-2").await.unwrap();
    let outcome = call_registered(&MultiScopeJob, &mut message, || async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed);

    for token in &occupants {
        let _: () = conn.srem(WORKERS_SET, token).await.unwrap();
    }
    clear_scope_keys(&MultiScopeJob, &message).await;
}

struct PurgeJob;

#[async_trait]
impl Job for PurgeJob {
    fn name(&self) -> &'static str {
        "itest_purge"
    }
    fn queue(&self) -> &'static str {
        "itest"
    }
    fn limits(&self) -> Limits {
        Limits::new().per_redis(1).no_retry()
    }
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn purge_recovers_capacity_leaked_by_dead_executions() {
    let mut message = JobMessage::new("pg-1", "itest_purge", "itest", "{}");
    clear_scope_keys(&PurgeJob, &message).await;
    let keys: Vec<String> = LimitedJob::new(&PurgeJob, &message).scope_keys().to_vec();

    // A token from a crashed execution: present in the scope set, absent
    // from the liveness registry.
    let mut conn = test_conn().await;
    let _: () = conn.sadd(&keys[0], "stale-execution").await.unwrap();

    let outcome = call_registered(&PurgeJob, &mut message, || async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let is_member: bool = conn.sismember(&keys[0], "stale-execution").await.unwrap();
    assert!(!is_member, "stale token must be purged");
}

struct SaturatedJob;

#[async_trait]
impl Job for SaturatedJob {
    fn name(&self) -> &'static str {
        "itest_saturated"
    }
    fn queue(&self) -> &'static str {
        "itest"
    }
    fn limits(&self) -> Limits {
        // A zero limit can never admit; every call exercises the rejection
        // path deterministically.
        Limits::new().per_redis(0).retry(3).retry_delay(7)
    }
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn reschedule_threads_the_counter_and_timestamps_the_index() {
    let mut message = JobMessage::new("rs-1", "itest_saturated", "itest", "{}");
    clear_scope_keys(&SaturatedJob, &message).await;
    let mut conn = test_conn().await;

    let before = chrono::Utc::now().timestamp();
    let outcome = call_registered(&SaturatedJob, &mut message, || async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Rescheduled);
    assert_eq!(message.limiter_retry_count, 1);

    let member = serde_json::to_string(&message).unwrap();
    let score: Option<f64> = conn.zscore(SCHEDULE_KEY, &member).await.unwrap();
    let score = score.expect("rescheduled message present in schedule index") as i64;
    assert!(
        (before + 7..=before + 9).contains(&score),
        "schedule score {score} should be call time + 7s"
    );

    let outcome = call_registered(&SaturatedJob, &mut message, || async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Rescheduled);
    assert_eq!(message.limiter_retry_count, 2);

    let _: () = conn.zrem(SCHEDULE_KEY, &member).await.unwrap();
    let member = serde_json::to_string(&message).unwrap();
    let _: () = conn.zrem(SCHEDULE_KEY, &member).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn exhausted_retries_fail_fatally_naming_the_worker() {
    let mut message = JobMessage::new("rs-2", "itest_saturated", "itest", "{}");
    message.limiter_retry_count = 3;
    clear_scope_keys(&SaturatedJob, &message).await;

    let err = call_registered(&SaturatedJob, &mut message, || async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LimiterError>(),
        Some(LimiterError::RetriesExhausted { .. })
    ));
    assert!(err.to_string().contains("itest_saturated"));
    // The counter is left untouched on the fatal path.
    assert_eq!(message.limiter_retry_count, 3);
}

struct OverrideJob {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Job for OverrideJob {
    fn name(&self) -> &'static str {
        "itest_override"
    }
    fn queue(&self) -> &'static str {
        "itest"
    }
    fn limits(&self) -> Limits {
        Limits::new().per_redis(0).retry(5)
    }
    fn capacity_override(&self) -> Option<&dyn CapacityOverride> {
        Some(self)
    }
}

#[async_trait]
impl CapacityOverride for OverrideJob {
    async fn on_capacity_exceeded(&self, message: &JobMessage) -> anyhow::Result<()> {
        assert_eq!(message.job_type, "itest_override");
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn override_takes_precedence_over_rescheduling() {
    let job = OverrideJob {
        invocations: Arc::new(AtomicUsize::new(0)),
    };
    let mut message = JobMessage::new("ov-1", "itest_override", "itest", "{}");
    clear_scope_keys(&job, &message).await;
    let mut conn = test_conn().await;

    let outcome = call_registered(&job, &mut message, || async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Overridden);
    assert_eq!(job.invocations.load(Ordering::SeqCst), 1);

    // The override fully owns the outcome: nothing was rescheduled.
    assert_eq!(message.limiter_retry_count, 0);
    let mut would_be = message.clone();
    would_be.limiter_retry_count = 1;
    let score: Option<f64> = conn
        .zscore(SCHEDULE_KEY, serde_json::to_string(&would_be).unwrap())
        .await
        .unwrap();
    assert!(score.is_none());
}
