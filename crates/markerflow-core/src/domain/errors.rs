//! Errors and their classification.

use std::path::PathBuf;
use thiserror::Error;

use super::ids::SubjectId;
use super::stage::StageKind;

/// Error class, used in diagnostics and batch summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Argument,
    Validation,
    Configuration,
    Submission,
    StageFailure,
    Orchestration,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Argument => "ArgumentError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Submission => "SubmissionError",
            ErrorKind::StageFailure => "StageFailure",
            ErrorKind::Orchestration => "OrchestrationFailure",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Wrong argument count or malformed flag.
    #[error("ArgumentError: {0}")]
    Argument(String),

    /// A referenced input file, directory or code root is missing.
    #[error("ValidationError: {what} not found: {}", path.display())]
    Validation { what: String, path: PathBuf },

    /// A required StageSpec field is missing or invalid after defaulting.
    #[error("ConfigurationError: {message}")]
    Configuration { message: String },

    /// Submission failed permanently or exhausted its retries.
    #[error("SubmissionError: stage={stage} subject={subject} after {attempts} attempt(s): {message}")]
    Submission {
        stage: StageKind,
        subject: SubjectId,
        attempts: u32,
        message: String,
    },

    /// The external program of a stage returned nonzero.
    #[error("StageFailure: stage={stage} exit_code={exit_code}")]
    StageFailure { stage: StageKind, exit_code: i32 },

    /// At least one subject of a batch ended Failed.
    #[error("OrchestrationFailure: {failed} subject(s) failed")]
    Orchestration { failed: usize },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn validation(what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        PipelineError::Validation {
            what: what.into(),
            path: path.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        PipelineError::Configuration {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Argument(_) => ErrorKind::Argument,
            PipelineError::Validation { .. } | PipelineError::Io { .. } => ErrorKind::Validation,
            PipelineError::Configuration { .. } => ErrorKind::Configuration,
            PipelineError::Submission { .. } => ErrorKind::Submission,
            PipelineError::StageFailure { .. } => ErrorKind::StageFailure,
            PipelineError::Orchestration { .. } => ErrorKind::Orchestration,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::StageFailure { exit_code, .. } if *exit_code != 0 => *exit_code,
            _ => 1,
        }
    }
}

/// Errors at the scheduler port.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Scheduler temporarily unreachable; worth retrying.
    #[error("scheduler temporarily unavailable: {0}")]
    Transient(String),

    /// Scheduler refused the job; retrying will not help.
    #[error("scheduler rejected submission: {0}")]
    Rejected(String),

    #[error("could not parse scheduler response: {0:?}")]
    Parse(String),

    #[error("failed to run scheduler command `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl SchedulerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Transient(_))
    }
}
