// src/job.rs
use async_trait::async_trait;

use crate::limiter::limits::Limits;
use crate::message::JobMessage;

#[async_trait]
pub trait Job: Send + Sync {
    async fn before(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn perform(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after(&self) {}
    async fn on_error(&self, _err: &anyhow::Error) {}
    async fn always(&self) {}

    fn name(&self) -> &'static str;
    fn queue(&self) -> &'static str;

    /// Concurrency limits enforced before `perform` runs. Unlimited by
    /// default, which keeps the runtime off Redis entirely for this worker.
    fn limits(&self) -> Limits {
        Limits::default()
    }

    /// Capacity-rejection override. A worker that implements
    /// [`CapacityOverride`] returns `Some(self)` here to take over handling
    /// of rejected admissions; the limiter then neither reschedules nor
    /// fails the job itself.
    fn capacity_override(&self) -> Option<&dyn CapacityOverride> {
        None
    }
}

/// Optional capability for workers that want custom behavior when admission
/// is rejected.
#[async_trait]
pub trait CapacityOverride: Send + Sync {
    async fn on_capacity_exceeded(&self, message: &JobMessage) -> anyhow::Result<()>;
}
