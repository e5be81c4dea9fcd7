//! App: runners built on top of the ports.
//!
//! # Components
//! - **StageGraph**: the fixed stage dependency graph
//! - **JobSubmitter**: dependency expressions and submission retries
//! - **PipelineRunner**: one subject, stage by stage
//! - **MultiSubjectOrchestrator**: a directory of subjects, one after another

pub mod graph;
pub mod orchestrator;
pub mod retry;
pub mod runner;
pub mod subject;
pub mod submitter;

pub use self::graph::{StageEdge, StageGraph};
pub use self::orchestrator::{BatchOptions, MultiSubjectOrchestrator};
pub use self::retry::RetryPolicy;
pub use self::runner::{PipelineRunner, RunOptions};
pub use self::subject::{discover_inputs, subject_id_for};
pub use self::submitter::{JobSubmitter, dependency_expression};
