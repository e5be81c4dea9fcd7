//! Dry-run scheduler: records what would have been submitted, submits nothing.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{JobSnapshot, SchedulerError, SchedulerJobId, SubmitRequest};
use crate::ports::Scheduler;

#[derive(Default)]
pub struct DryRunScheduler {
    recorded: Mutex<Vec<SubmitRequest>>,
}

impl DryRunScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn recorded(&self) -> Vec<SubmitRequest> {
        self.recorded.lock().await.clone()
    }
}

#[async_trait]
impl Scheduler for DryRunScheduler {
    async fn submit(&self, request: &SubmitRequest) -> Result<SchedulerJobId, SchedulerError> {
        let mut recorded = self.recorded.lock().await;
        recorded.push(request.clone());
        Ok(SchedulerJobId::new(format!("dry-run-{}", recorded.len())))
    }

    /// Nothing ever runs, so there is nothing to report.
    async fn observe(&self, _job_id: &SchedulerJobId) -> JobSnapshot {
        JobSnapshot::new()
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}
