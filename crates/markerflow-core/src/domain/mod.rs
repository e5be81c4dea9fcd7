//! Domain model (ids, stages, specs, job records, runs, errors).

pub mod batch;
pub mod dependency;
pub mod errors;
pub mod ids;
pub mod job;
pub mod run;
pub mod spec;
pub mod stage;
pub mod submission;

pub use batch::{BatchRun, SubjectOutcome};
pub use dependency::{DependencyEdge, DependencyKind};
pub use errors::{ErrorKind, PipelineError, SchedulerError};
pub use ids::{BatchId, RunId, SchedulerJobId, SubjectId};
pub use job::{JobRecord, JobSnapshot, JobState, JobView, Observation};
pub use run::{PipelineRun, PipelineRunSummary, RunStatus};
pub use spec::{REPLICATE_PLACEHOLDER, Resources, StageCommand, StageSpec};
pub use stage::StageKind;
pub use submission::{ArraySpec, SubmitRequest};
