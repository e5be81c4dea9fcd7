//! Job Submitter: one scheduler submission with bounded retries.
//!
//! The scheduler dependency expression is built here and nowhere else:
//! - StrictSuccess -> `afterok:<id>[:<id>...]`
//! - AnyCompletion -> `afterany:<id>[:<id>...]`
//!
//! Several edges are joined with `,` (all must hold).

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use crate::domain::{
    DependencyEdge, DependencyKind, PipelineError, SchedulerJobId, SubmitRequest,
};
use crate::ports::Scheduler;

/// Scheduler dependency expression for `edges`, `None` when there is nothing
/// to wait for.
pub fn dependency_expression(edges: &[DependencyEdge]) -> Option<String> {
    let parts: Vec<String> = edges
        .iter()
        .filter(|e| !e.is_empty())
        .map(|e| {
            let keyword = match e.kind {
                DependencyKind::StrictSuccess => "afterok",
                DependencyKind::AnyCompletion => "afterany",
            };
            let ids: Vec<&str> = e.upstream.iter().map(SchedulerJobId::as_str).collect();
            format!("{keyword}:{}", ids.join(":"))
        })
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}

pub struct JobSubmitter {
    scheduler: Arc<dyn Scheduler>,
    policy: RetryPolicy,
}

impl JobSubmitter {
    pub fn new(scheduler: Arc<dyn Scheduler>, policy: RetryPolicy) -> Self {
        Self { scheduler, policy }
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Register `request` with the scheduler and return its job id.
    ///
    /// Fills in `request.dependency` from its edges first. Transient errors
    /// are retried with exponential backoff up to `max_attempts`; a rejection
    /// or an exhausted budget becomes `PipelineError::Submission`.
    ///
    /// Not idempotent: callers must not resubmit a request that was accepted.
    pub async fn submit(
        &self,
        request: &mut SubmitRequest,
    ) -> Result<SchedulerJobId, PipelineError> {
        request.dependency = dependency_expression(&request.edges);

        let mut attempts = 0;
        loop {
            attempts += 1;
            debug!(
                scheduler = self.scheduler.name(),
                job_name = %request.job_name,
                dependency = request.dependency.as_deref().unwrap_or("-"),
                attempt = attempts,
                "submitting"
            );

            match self.scheduler.submit(request).await {
                Ok(id) => {
                    info!(
                        stage = %request.stage,
                        subject = %request.subject,
                        job_id = %id,
                        "stage submitted"
                    );
                    return Ok(id);
                }
                Err(e) if e.is_transient() && self.policy.should_retry(attempts) => {
                    let delay = self.policy.jittered_delay(attempts);
                    warn!(
                        stage = %request.stage,
                        subject = %request.subject,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient submission failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(PipelineError::Submission {
                        stage: request.stage,
                        subject: request.subject.clone(),
                        attempts,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Resources, StageCommand, StageKind, SubjectId};
    use crate::impls::InMemoryScheduler;
    use rstest::rstest;

    fn id(s: &str) -> SchedulerJobId {
        SchedulerJobId::new(s)
    }

    fn request(stage: StageKind, edges: Vec<DependencyEdge>) -> SubmitRequest {
        SubmitRequest {
            subject: SubjectId::new("S1"),
            stage,
            job_name: format!("S1_{stage}"),
            resources: Resources {
                partition: "pool1".into(),
                cpus: 1,
                memory: "8G".into(),
                walltime: "02:00:00".into(),
                conda_env: "base".into(),
                modules: vec![],
            },
            command: StageCommand::new("/bin/true", vec![]),
            array: None,
            edges,
            dependency: None,
            output_dir: "/out".into(),
            log_dir: "/out/logs".into(),
        }
    }

    #[rstest]
    #[case::none(vec![], None)]
    #[case::strict(vec![DependencyEdge::strict(vec![id("10")])], Some("afterok:10"))]
    #[case::several(vec![DependencyEdge::strict(vec![id("11"), id("13")])], Some("afterok:11:13"))]
    #[case::any(
        vec![DependencyEdge::any_completion(vec![id("12_1"), id("12_4")])],
        Some("afterany:12_1:12_4")
    )]
    #[case::empty_edge(vec![DependencyEdge::any_completion(vec![])], None)]
    #[case::combined(
        vec![DependencyEdge::strict(vec![id("1")]), DependencyEdge::any_completion(vec![id("2")])],
        Some("afterok:1,afterany:2")
    )]
    fn builds_dependency_expressions(
        #[case] edges: Vec<DependencyEdge>,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(dependency_expression(&edges).as_deref(), expected);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let scheduler = Arc::new(InMemoryScheduler::new().transient_failures(2));
        let submitter = JobSubmitter::new(scheduler.clone(), RetryPolicy::immediate(5));

        let mut req = request(StageKind::Aggregate, vec![DependencyEdge::strict(vec![id("9")])]);
        submitter.submit(&mut req).await.unwrap();

        assert_eq!(scheduler.submit_calls().await, 3);
        assert_eq!(req.dependency.as_deref(), Some("afterok:9"));
        let recorded = scheduler.submissions().await;
        assert_eq!(recorded[0].dependency.as_deref(), Some("afterok:9"));
    }

    #[tokio::test]
    async fn exhausted_retries_are_submission_error() {
        let scheduler = Arc::new(InMemoryScheduler::new().transient_failures(10));
        let submitter = JobSubmitter::new(scheduler.clone(), RetryPolicy::immediate(3));

        let err = submitter
            .submit(&mut request(StageKind::Resample, vec![]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Submission {
                stage: StageKind::Resample,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(scheduler.submit_calls().await, 3);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let scheduler = Arc::new(InMemoryScheduler::new().reject_stage(StageKind::Infer));
        let submitter = JobSubmitter::new(scheduler.clone(), RetryPolicy::immediate(5));

        let err = submitter
            .submit(&mut request(StageKind::Infer, vec![]))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Submission { attempts: 1, .. }));
        assert_eq!(scheduler.submit_calls().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_between_attempts() {
        let scheduler = Arc::new(InMemoryScheduler::new().transient_failures(2));
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default_v1()
        };
        let submitter = JobSubmitter::new(scheduler, policy);

        let start = tokio::time::Instant::now();
        submitter
            .submit(&mut request(StageKind::Resample, vec![]))
            .await
            .unwrap();
        // 2s after the first failure, 4s after the second
        assert_eq!(start.elapsed(), std::time::Duration::from_secs(6));
    }
}
