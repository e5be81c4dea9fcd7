//! In-memory scheduler for tests and local experiments.
//!
//! Jobs "finish" the moment they are submitted: every job (or array task)
//! gets its scripted outcome, `Succeeded` unless told otherwise. Transient
//! outages and permanent rejections can be scripted as well.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    JobSnapshot, Observation, SchedulerError, SchedulerJobId, StageKind, SubjectId,
    SubmitRequest,
};
use crate::ports::Scheduler;

struct InMemorySchedulerState {
    next_id: u64,

    /// Every accepted submission, in order.
    submissions: Vec<SubmitRequest>,

    /// Calls to `submit`, including failed ones.
    submit_calls: u32,

    /// Calls to `observe`.
    observe_calls: u32,

    /// Known job states.
    jobs: HashMap<SchedulerJobId, Observation>,

    /// Scripted outcomes per (stage, replicate).
    scripted: HashMap<(StageKind, Option<u32>), Observation>,

    /// Scripted outcomes of one subject's stage, all replicates included.
    scripted_subjects: HashMap<(SubjectId, StageKind), Observation>,

    /// Outcome for anything not scripted.
    default_outcome: Observation,

    /// Number of upcoming `submit` calls that fail transiently.
    transient_failures: u32,

    /// Stages whose submissions are rejected outright.
    rejected: HashSet<StageKind>,
}

pub struct InMemoryScheduler {
    state: Mutex<InMemorySchedulerState>,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemorySchedulerState {
                next_id: 1000,
                submissions: Vec::new(),
                submit_calls: 0,
                observe_calls: 0,
                jobs: HashMap::new(),
                scripted: HashMap::new(),
                scripted_subjects: HashMap::new(),
                default_outcome: Observation::Succeeded,
                transient_failures: 0,
                rejected: HashSet::new(),
            }),
        }
    }

    /// Jobs stay pending forever, like a busy cluster right after submission.
    pub fn pending(mut self) -> Self {
        self.state.get_mut().default_outcome = Observation::Pending;
        self
    }

    /// Script the given replicates of a fan-out stage to fail with `exit_code`.
    pub fn fail_replicates(mut self, stage: StageKind, replicates: &[u32], exit_code: i32) -> Self {
        let state = self.state.get_mut();
        for &i in replicates {
            state.scripted.insert(
                (stage, Some(i)),
                Observation::Failed {
                    exit_code: Some(exit_code),
                },
            );
        }
        self
    }

    /// Script a scalar stage to fail with `exit_code`.
    pub fn fail_stage(mut self, stage: StageKind, exit_code: i32) -> Self {
        self.state.get_mut().scripted.insert(
            (stage, None),
            Observation::Failed {
                exit_code: Some(exit_code),
            },
        );
        self
    }

    /// Script one subject's stage to fail with `exit_code`.
    pub fn fail_subject_stage(mut self, subject: &str, stage: StageKind, exit_code: i32) -> Self {
        self.state.get_mut().scripted_subjects.insert(
            (SubjectId::new(subject), stage),
            Observation::Failed {
                exit_code: Some(exit_code),
            },
        );
        self
    }

    /// The next `n` submit calls fail as if the controller were unreachable.
    pub fn transient_failures(mut self, n: u32) -> Self {
        self.state.get_mut().transient_failures = n;
        self
    }

    /// Every submission of `stage` is refused.
    pub fn reject_stage(mut self, stage: StageKind) -> Self {
        self.state.get_mut().rejected.insert(stage);
        self
    }

    pub async fn submissions(&self) -> Vec<SubmitRequest> {
        self.state.lock().await.submissions.clone()
    }

    pub async fn submit_calls(&self) -> u32 {
        self.state.lock().await.submit_calls
    }

    pub async fn observe_calls(&self) -> u32 {
        self.state.lock().await.observe_calls
    }

    pub async fn submitted_stages(&self) -> Vec<StageKind> {
        self.state
            .lock()
            .await
            .submissions
            .iter()
            .map(|s| s.stage)
            .collect()
    }
}

impl Default for InMemoryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for InMemoryScheduler {
    async fn submit(&self, request: &SubmitRequest) -> Result<SchedulerJobId, SchedulerError> {
        let mut state = self.state.lock().await;
        state.submit_calls += 1;

        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(SchedulerError::Transient(
                "Unable to contact slurm controller (connect failure)".into(),
            ));
        }
        if state.rejected.contains(&request.stage) {
            return Err(SchedulerError::Rejected(format!(
                "Invalid partition name specified: {}",
                request.resources.partition
            )));
        }

        let id = SchedulerJobId::new(state.next_id.to_string());
        state.next_id += 1;

        let default_outcome = state
            .scripted_subjects
            .get(&(request.subject.clone(), request.stage))
            .copied()
            .unwrap_or(state.default_outcome);
        match &request.array {
            Some(array) => {
                for &i in &array.indices {
                    let outcome = state
                        .scripted
                        .get(&(request.stage, Some(i)))
                        .copied()
                        .unwrap_or(default_outcome);
                    state.jobs.insert(id.array_task(i), outcome);
                }
            }
            None => {
                let outcome = state
                    .scripted
                    .get(&(request.stage, None))
                    .copied()
                    .unwrap_or(default_outcome);
                state.jobs.insert(id.clone(), outcome);
            }
        }

        state.submissions.push(request.clone());
        Ok(id)
    }

    async fn observe(&self, job_id: &SchedulerJobId) -> JobSnapshot {
        let mut state = self.state.lock().await;
        state.observe_calls += 1;
        let task_prefix = format!("{job_id}_");
        state
            .jobs
            .iter()
            .filter(|(id, _)| *id == job_id || id.as_str().starts_with(&task_prefix))
            .map(|(id, outcome)| (id.clone(), *outcome))
            .collect()
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArraySpec, Resources, StageCommand};

    fn request(stage: StageKind, array: Option<Vec<u32>>) -> SubmitRequest {
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
            array: array.map(|indices| ArraySpec {
                indices,
                parallel_limit: None,
            }),
            edges: vec![],
            dependency: None,
            output_dir: "/out".into(),
            log_dir: "/out/logs".into(),
        }
    }

    #[tokio::test]
    async fn scripted_replicate_failures() {
        let s = InMemoryScheduler::new().fail_replicates(StageKind::Infer, &[2], 9);
        let id = s
            .submit(&request(StageKind::Infer, Some(vec![1, 2, 3])))
            .await
            .unwrap();

        let snapshot = s.observe(&id).await;
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get(&id.array_task(1)), Observation::Succeeded);
        assert_eq!(
            snapshot.get(&id.array_task(2)),
            Observation::Failed { exit_code: Some(9) }
        );
        assert!(s.observe(&SchedulerJobId::new("nope")).await.is_empty());
        assert_eq!(s.observe_calls().await, 2);
    }

    #[tokio::test]
    async fn scripted_subject_failure() {
        let s = InMemoryScheduler::new().fail_subject_stage("S2", StageKind::Aggregate, 4);
        let ok = s.submit(&request(StageKind::Aggregate, None)).await.unwrap();
        let mut other = request(StageKind::Aggregate, None);
        other.subject = SubjectId::new("S2");
        let failed = s.submit(&other).await.unwrap();

        assert_eq!(s.observe(&ok).await.get(&ok), Observation::Succeeded);
        assert_eq!(
            s.observe(&failed).await.get(&failed),
            Observation::Failed { exit_code: Some(4) }
        );
    }

    #[tokio::test]
    async fn transient_failures_then_success() {
        let s = InMemoryScheduler::new().transient_failures(2);
        let req = request(StageKind::Aggregate, None);

        assert!(s.submit(&req).await.unwrap_err().is_transient());
        assert!(s.submit(&req).await.unwrap_err().is_transient());
        assert!(s.submit(&req).await.is_ok());
        assert_eq!(s.submit_calls().await, 3);
        assert_eq!(s.submissions().await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_stage_is_not_transient() {
        let s = InMemoryScheduler::new().reject_stage(StageKind::SelectMarkers);
        let err = s
            .submit(&request(StageKind::SelectMarkers, None))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
