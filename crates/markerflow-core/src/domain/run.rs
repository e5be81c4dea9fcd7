//! PipelineRun: one subject's pass through the stage sequence.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::ids::{RunId, SubjectId};
use super::job::{JobRecord, JobState, JobView};
use super::stage::StageKind;
use super::submission::SubmitRequest;

/// Aggregate status of a PipelineRun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every stage succeeded.
    Succeeded,
    /// Some fan-out replicates failed, every scalar stage still succeeded.
    PartiallySucceeded,
    /// A scalar stage failed or was skipped, or a stage was never accepted.
    Failed,
    /// Every stage was accepted by the scheduler; outcomes are not known yet.
    Submitted,
}

impl RunStatus {
    /// Does this status satisfy the subject's success contract at batch level?
    pub fn is_success(self) -> bool {
        !matches!(self, RunStatus::Failed)
    }

    /// Derive the aggregate status from the job records.
    pub fn from_records(records: &[JobRecord]) -> RunStatus {
        if records.is_empty() {
            return RunStatus::Failed;
        }

        if records.iter().any(fails_run) {
            return RunStatus::Failed;
        }

        if records.iter().all(|r| r.state == JobState::Succeeded) {
            return RunStatus::Succeeded;
        }

        let scalars_succeeded = records
            .iter()
            .filter(|r| !r.stage.is_fan_out())
            .all(|r| r.state == JobState::Succeeded);
        let replicate_failed = records
            .iter()
            .any(|r| r.stage.is_fan_out() && r.state.is_unsuccessful());

        if scalars_succeeded && replicate_failed {
            RunStatus::PartiallySucceeded
        } else {
            RunStatus::Submitted
        }
    }
}

/// A failed scalar job, or any stage the scheduler refused outright.
fn fails_run(r: &JobRecord) -> bool {
    (!r.stage.is_fan_out() && r.state.is_unsuccessful()) || r.submission_failed()
}

/// One subject's pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub subject: SubjectId,
    pub base_dir: PathBuf,
    pub dry_run: bool,

    /// Records in submission order.
    pub records: Vec<JobRecord>,

    /// Every submission handed to the scheduler (or recorded by a dry run).
    pub plan: Vec<SubmitRequest>,

    /// Stages whose canonical output directory already held content.
    pub preexisting_outputs: Vec<StageKind>,

    /// Submission-level error that ended a stage, if any.
    pub error: Option<String>,

    pub status: RunStatus,
}

impl PipelineRun {
    pub fn new(subject: SubjectId, base_dir: PathBuf, dry_run: bool) -> Self {
        Self {
            run_id: RunId::generate(),
            subject,
            base_dir,
            dry_run,
            records: Vec::new(),
            plan: Vec::new(),
            preexisting_outputs: Vec::new(),
            error: None,
            status: RunStatus::Submitted,
        }
    }

    pub fn records_for(&self, stage: StageKind) -> impl Iterator<Item = &JobRecord> {
        self.records.iter().filter(move |r| r.stage == stage)
    }

    pub fn was_submitted(&self, stage: StageKind) -> bool {
        self.plan.iter().any(|p| p.stage == stage)
    }

    pub fn finalize(&mut self) {
        self.status = RunStatus::from_records(&self.records);
    }

    /// Exit code of the first stage that failed the run (replicate failures
    /// do not fail a run on their own), 0 when the run met its success
    /// contract.
    pub fn exit_code(&self) -> i32 {
        if self.status.is_success() {
            return 0;
        }
        self.records
            .iter()
            .find(|r| fails_run(r) && r.state == JobState::Failed)
            .or_else(|| self.records.iter().find(|r| r.state == JobState::Failed))
            .map(|r| r.exit_code.filter(|c| *c != 0).unwrap_or(1))
            .unwrap_or(1)
    }

    /// First failing record for diagnostics, run-failing ones first.
    pub fn first_failure(&self) -> Option<&JobRecord> {
        self.records
            .iter()
            .find(|r| fails_run(r))
            .or_else(|| self.records.iter().find(|r| r.state.is_unsuccessful()))
    }

    pub fn summary(&self) -> PipelineRunSummary {
        PipelineRunSummary {
            run_id: self.run_id.to_string(),
            subject: self.subject.clone(),
            base_dir: self.base_dir.clone(),
            dry_run: self.dry_run,
            status: self.status,
            jobs: self.records.iter().map(JobView::from).collect(),
            error: self.error.clone(),
        }
    }
}

/// Serializable snapshot of a PipelineRun.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunSummary {
    pub run_id: String,
    pub subject: SubjectId,
    pub base_dir: PathBuf,
    pub dry_run: bool,
    pub status: RunStatus,
    pub jobs: Vec<JobView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::SchedulerJobId;
    use crate::domain::job::Observation;

    fn rec(stage: StageKind, replicate: Option<u32>, obs: Option<Observation>) -> JobRecord {
        let mut r = JobRecord::new(SubjectId::new("S1"), stage, replicate);
        r.mark_submitted(SchedulerJobId::new("1"));
        if let Some(o) = obs {
            r.apply_observation(o);
        }
        r
    }

    fn failed(code: i32) -> Option<Observation> {
        Some(Observation::Failed {
            exit_code: Some(code),
        })
    }

    #[test]
    fn all_succeeded() {
        let ok = Some(Observation::Succeeded);
        let records = vec![
            rec(StageKind::Resample, None, ok),
            rec(StageKind::Infer, Some(1), ok),
            rec(StageKind::Aggregate, None, ok),
            rec(StageKind::SelectMarkers, None, ok),
        ];
        assert_eq!(RunStatus::from_records(&records), RunStatus::Succeeded);
    }

    #[test]
    fn replicate_failure_is_partial() {
        let ok = Some(Observation::Succeeded);
        let records = vec![
            rec(StageKind::Resample, None, ok),
            rec(StageKind::Infer, Some(1), ok),
            rec(StageKind::Infer, Some(2), failed(1)),
            rec(StageKind::Aggregate, None, ok),
            rec(StageKind::SelectMarkers, None, ok),
        ];
        assert_eq!(
            RunStatus::from_records(&records),
            RunStatus::PartiallySucceeded
        );
    }

    #[test]
    fn scalar_failure_is_failed_with_exit_code() {
        let ok = Some(Observation::Succeeded);
        let mut skipped = JobRecord::new(SubjectId::new("S1"), StageKind::SelectMarkers, None);
        skipped.mark_skipped("aggregate failed".into());
        let mut run = PipelineRun::new(SubjectId::new("S1"), PathBuf::from("/b"), false);
        run.records = vec![
            rec(StageKind::Resample, None, ok),
            rec(StageKind::Infer, Some(1), failed(9)),
            rec(StageKind::Aggregate, None, failed(42)),
            skipped,
        ];
        run.finalize();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.exit_code(), 42);
        assert_eq!(run.first_failure().map(|r| r.stage), Some(StageKind::Aggregate));
    }

    #[test]
    fn in_flight_jobs_are_submitted() {
        let records = vec![
            rec(StageKind::Resample, None, None),
            rec(StageKind::Infer, Some(1), None),
        ];
        assert_eq!(RunStatus::from_records(&records), RunStatus::Submitted);
        assert!(RunStatus::Submitted.is_success());
    }

    #[test]
    fn refused_array_submission_fails_the_run() {
        let mut rejected = JobRecord::new(SubjectId::new("S1"), StageKind::Infer, Some(1));
        rejected.mark_submission_failed("Invalid partition name specified".into());
        let mut skipped = JobRecord::new(SubjectId::new("S1"), StageKind::Aggregate, None);
        skipped.mark_skipped("infer was never submitted".into());

        let mut run = PipelineRun::new(SubjectId::new("S1"), PathBuf::from("/b"), false);
        run.records = vec![
            rec(StageKind::Resample, None, Some(Observation::Succeeded)),
            rejected,
            skipped,
        ];
        run.finalize();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.exit_code(), 1);
        assert_eq!(run.first_failure().map(|r| r.stage), Some(StageKind::Infer));
    }

    #[test]
    fn empty_run_is_failed() {
        assert_eq!(RunStatus::from_records(&[]), RunStatus::Failed);
    }
}
