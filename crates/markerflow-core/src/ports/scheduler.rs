//! Scheduler port: the batch scheduler as seen by the Job Submitter.
//!
//! Two operations only:
//! - `submit` registers one job (or one array job) and returns its id.
//!   Not idempotent: every successful call is one more job in the scheduler.
//! - `observe` takes a non-blocking snapshot of a job's state, or of every
//!   task of an array job in one query. The orchestrator never waits for a
//!   job to finish.

use async_trait::async_trait;

use crate::domain::{JobSnapshot, SchedulerError, SchedulerJobId, SubmitRequest};

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register one job with the scheduler.
    async fn submit(&self, request: &SubmitRequest) -> Result<SchedulerJobId, SchedulerError>;

    /// Current state of a job as far as the scheduler knows. Given the base
    /// id of an array job, the snapshot covers each of its tasks.
    async fn observe(&self, job_id: &SchedulerJobId) -> JobSnapshot;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}
