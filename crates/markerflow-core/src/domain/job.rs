//! Job record: one scheduler job (or one task of an array job) of a stage.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

use super::ids::{SchedulerJobId, SubjectId};
use super::stage::StageKind;

/// Job lifecycle state.
///
/// State transitions:
/// - Pending -> Submitted -> Running -> Succeeded | Failed
/// - Pending -> Failed (submission error)
/// - Pending -> SkippedUpstreamFailure (a StrictSuccess upstream failed; never submitted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Submitted,
    Running,
    Succeeded,
    Failed,
    SkippedUpstreamFailure,
}

impl JobState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::SkippedUpstreamFailure
        )
    }

    /// Did this job end without producing usable output?
    pub fn is_unsuccessful(self) -> bool {
        matches!(self, JobState::Failed | JobState::SkippedUpstreamFailure)
    }
}

/// What the scheduler currently says about a job. Never a blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Pending,
    Running,
    Succeeded,
    Failed { exit_code: Option<i32> },
    /// The scheduler does not know (yet) or could not be asked.
    Unknown,
}

/// Observations from one scheduler query: a single job, or every task of an
/// array job queried by its base id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSnapshot {
    states: HashMap<SchedulerJobId, Observation>,
}

impl JobSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job_id: SchedulerJobId, observation: Observation) {
        self.states.insert(job_id, observation);
    }

    /// What the query said about `job_id`; `Unknown` when it was not listed.
    pub fn get(&self, job_id: &SchedulerJobId) -> Observation {
        self.states
            .get(job_id)
            .copied()
            .unwrap_or(Observation::Unknown)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl FromIterator<(SchedulerJobId, Observation)> for JobSnapshot {
    fn from_iter<I: IntoIterator<Item = (SchedulerJobId, Observation)>>(iter: I) -> Self {
        Self {
            states: iter.into_iter().collect(),
        }
    }
}

/// State of one job, owned by the PipelineRun that created it.
///
/// Only the Job Submitter (via the runner) and the runner mutate it; all
/// transitions go through the methods below.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub subject: SubjectId,
    pub stage: StageKind,

    /// Replicate index for fan-out stages.
    pub replicate: Option<u32>,

    pub job_id: Option<SchedulerJobId>,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,

    pub created_at: Instant,
    pub updated_at: Instant,
}

impl JobRecord {
    pub fn new(subject: SubjectId, stage: StageKind, replicate: Option<u32>) -> Self {
        let now = Instant::now();
        Self {
            subject,
            stage,
            replicate,
            job_id: None,
            state: JobState::Pending,
            exit_code: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_submitted(&mut self, job_id: SchedulerJobId) {
        self.job_id = Some(job_id);
        self.state = JobState::Submitted;
        self.updated_at = Instant::now();
    }

    /// Submission itself failed; nothing was registered with the scheduler.
    pub fn mark_submission_failed(&mut self, error: String) {
        self.state = JobState::Failed;
        self.last_error = Some(error);
        self.updated_at = Instant::now();
    }

    /// Failed before the scheduler ever accepted it.
    pub fn submission_failed(&self) -> bool {
        self.state == JobState::Failed && self.job_id.is_none()
    }

    pub fn mark_skipped(&mut self, reason: String) {
        self.state = JobState::SkippedUpstreamFailure;
        self.last_error = Some(reason);
        self.updated_at = Instant::now();
    }

    /// Fold a scheduler observation into the record.
    ///
    /// Terminal records are never changed, and `Unknown`/`Pending` leave a
    /// submitted record as it is.
    pub fn apply_observation(&mut self, observation: Observation) {
        if self.state.is_terminal() || self.job_id.is_none() {
            return;
        }
        match observation {
            Observation::Running => self.state = JobState::Running,
            Observation::Succeeded => {
                self.state = JobState::Succeeded;
                self.exit_code = Some(0);
            }
            Observation::Failed { exit_code } => {
                self.state = JobState::Failed;
                self.exit_code = exit_code;
            }
            Observation::Pending | Observation::Unknown => return,
        }
        self.updated_at = Instant::now();
    }

    /// `stage` or `stage[3]` for diagnostics.
    pub fn label(&self) -> String {
        match self.replicate {
            Some(i) => format!("{}[{}]", self.stage, i),
            None => self.stage.to_string(),
        }
    }
}

/// Serializable view of a JobRecord for logs and summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobView {
    pub stage: StageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<SchedulerJobId>,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&JobRecord> for JobView {
    fn from(record: &JobRecord) -> Self {
        Self {
            stage: record.stage,
            replicate: record.replicate,
            job_id: record.job_id.clone(),
            state: record.state,
            exit_code: record.exit_code,
            error: record.last_error.clone(),
        }
    }
}
