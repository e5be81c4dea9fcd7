//! BatchRun: the multi-subject aggregate.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::ids::{BatchId, SubjectId};
use super::run::RunStatus;

/// Outcome of one subject inside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectOutcome {
    pub subject: SubjectId,
    pub input: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    pub log_path: PathBuf,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubjectOutcome {
    pub fn is_failed(&self) -> bool {
        !self.status.is_success()
    }
}

/// Aggregate of every PipelineRun in a batch. Subjects share nothing mutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRun {
    pub batch_id: BatchId,
    pub output_base: PathBuf,
    pub master_log: PathBuf,
    pub subjects: Vec<SubjectOutcome>,
}

impl BatchRun {
    pub fn new(output_base: PathBuf, master_log: PathBuf) -> Self {
        Self {
            batch_id: BatchId::generate(),
            output_base,
            master_log,
            subjects: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: SubjectOutcome) {
        self.subjects.push(outcome);
    }

    pub fn succeeded_count(&self) -> usize {
        self.subjects.iter().filter(|s| !s.is_failed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.subjects.iter().filter(|s| s.is_failed()).count()
    }

    pub fn failed_subjects(&self) -> impl Iterator<Item = &SubjectOutcome> {
        self.subjects.iter().filter(|s| s.is_failed())
    }

    /// Nonzero iff at least one subject ended Failed.
    pub fn exit_code(&self) -> i32 {
        if self.failed_count() > 0 { 1 } else { 0 }
    }
}
