// src/message.rs
use serde::{Deserialize, Serialize};

fn default_retry() -> bool {
    true
}

/// One unit of work as it travels through Redis.
///
/// The worker's arguments ride along as the serialized worker payload; the
/// envelope itself carries only what the runtime and the limiter need. A
/// message lives for one runner invocation and is serialized back out only
/// when it lands in the schedule index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMessage {
    pub id: String,
    pub job_type: String,
    pub queue: String,
    /// Serialized worker struct, opaque to the runtime. Handed to the
    /// registered handler for deserialization.
    pub payload: String,
    /// Whether the runner may retry this job after a job-body error.
    #[serde(default = "default_retry")]
    pub retry: bool,
    /// Number of times the limiter has rescheduled this message after a
    /// capacity rejection. Incremented on every reschedule.
    #[serde(default)]
    pub limiter_retry_count: u32,
}

impl JobMessage {
    pub fn new(
        id: impl Into<String>,
        job_type: impl Into<String>,
        queue: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            queue: queue.into(),
            payload: payload.into(),
            retry: true,
            limiter_retry_count: 0,
        }
    }
}
