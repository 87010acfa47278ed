// src/limiter/capacity.rs
//
// The capacity oracle: answers "is there room for one more execution of this
// worker under all of its configured scopes?" against the shared store.

use redis::aio::MultiplexedConnection;
use tracing::debug;

use crate::utils::constants::WORKERS_SET;

/// Current cardinality of every scope membership set, read in one pipelined
/// round trip. Order matches `keys`.
pub async fn scope_counts(
    conn: &mut MultiplexedConnection,
    keys: &[String],
) -> redis::RedisResult<Vec<u64>> {
    let mut pipe = redis::pipe();
    for key in keys {
        pipe.scard(key);
    }
    pipe.query_async(conn).await
}

/// Single-pass check: every limited scope must simultaneously have room.
pub async fn has_room(
    conn: &mut MultiplexedConnection,
    keys: &[String],
    limits: &[u32],
) -> redis::RedisResult<bool> {
    let counts = scope_counts(conn, keys).await?;
    Ok(counts
        .iter()
        .zip(limits)
        .all(|(count, limit)| *count < u64::from(*limit)))
}

/// Check with one purge-and-recheck pass: if any scope is full, drop
/// membership tokens whose executions are no longer alive and check again.
/// The purge runs only on the failing path so the common case stays a single
/// round trip.
pub async fn capacity_available(
    conn: &mut MultiplexedConnection,
    keys: &[String],
    limits: &[u32],
) -> redis::RedisResult<bool> {
    if has_room(conn, keys, limits).await? {
        return Ok(true);
    }
    purge_stale_members(conn, keys).await?;
    has_room(conn, keys, limits).await
}

/// Intersect every scope membership set with the liveness registry and store
/// the result back, dropping tokens left behind by crashed executions.
///
/// Best-effort and lock-free: it only ever removes tokens, and only tokens
/// absent from the registry, so racing registrations are safe. A just-started
/// execution not yet registered as alive can lose its brand-new token here —
/// an accepted small-window inconsistency when the registry lags.
pub async fn purge_stale_members(
    conn: &mut MultiplexedConnection,
    keys: &[String],
) -> redis::RedisResult<()> {
    debug!(scope_keys = ?keys, "purging stale scope members");
    let mut pipe = redis::pipe();
    pipe.atomic();
    for key in keys {
        pipe.sinterstore(key, &[key.as_str(), WORKERS_SET]).ignore();
    }
    pipe.query_async(conn).await
}
