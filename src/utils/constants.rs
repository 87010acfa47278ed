// src/utils/constants.rs

// ---------------------------------------------------------
// General
// ---------------------------------------------------------

/// Linear-backoff retries for job bodies that return an error.
pub const MAX_JOB_ERROR_RETRIES: i64 = 3;

// ---------------------------------------------------------
// Redis Keys
// ---------------------------------------------------------

// Prefixes
pub const PREFIX_QUEUE: &str = "qlimit:queue";
pub const PREFIX_JOB: &str = "qlimit:job";
pub const PREFIX_QUEUE_CONFIG: &str = "qlimit:queue:config";

pub const QUEUES_SET: &str = "qlimit:queues";

/// ZSET: score = unix ts, member = serialized `JobMessage`. The
/// deferred-execution index: capacity reschedules and `enqueue_in` both land
/// here, and the schedule poller drains it.
pub const SCHEDULE_KEY: &str = "qlimit:schedule";

/// SET of identity tokens for executions that are currently alive. Maintained
/// by the runner; the limiter only reads it when purging stale scope members.
pub const WORKERS_SET: &str = "qlimit:workers";

/// Namespace for the limiter's scope membership sets and admission locks.
pub const LIMITER_PREFIX: &str = "qlimit:limiter";

// ---------------------------------------------------------
// Schedule Poller
// ---------------------------------------------------------
// NOTE: members are claimed in batches; a batch is one Lua round trip.
pub const CLAIM_BATCH_LIMIT: usize = 200;
