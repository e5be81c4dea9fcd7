//! Resolved per-stage execution specs.
//!
//! A `StageSpec` is fully populated: every default has been applied and every
//! referenced path has been checked. Nothing downstream of the resolver
//! consults the configuration document again.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::stage::StageKind;

/// Placeholder in a fan-out stage's argument list that stands for the
/// replicate index (1-based).
pub const REPLICATE_PLACEHOLDER: &str = "{replicate}";

/// Scheduler resource request for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub partition: String,
    pub cpus: u32,
    /// Memory in scheduler syntax, e.g. `8G`.
    pub memory: String,
    /// Wall-time in scheduler syntax, e.g. `02:00:00`.
    pub walltime: String,
    /// Named conda environment activated before the command.
    pub conda_env: String,
    /// Environment modules loaded before the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
}

/// Executable reference plus templated arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl StageCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Argument vector with the replicate placeholder substituted by `value`.
    pub fn render_with(&self, value: &str) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.display().to_string());
        argv.extend(
            self.args
                .iter()
                .map(|a| a.replace(REPLICATE_PLACEHOLDER, value)),
        );
        argv
    }

    /// Argument vector for one concrete replicate index.
    pub fn render_for(&self, replicate: u32) -> Vec<String> {
        self.render_with(&replicate.to_string())
    }

    pub fn is_templated(&self) -> bool {
        self.args.iter().any(|a| a.contains(REPLICATE_PLACEHOLDER))
    }
}

/// Fully resolved execution spec for one stage of one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub stage: StageKind,
    pub resources: Resources,
    pub command: StageCommand,

    /// Replicates the stage produces or runs over: N for resample and infer,
    /// 1 otherwise. Only array stages submit one task per replicate.
    pub fan_out: u32,

    /// Maximum number of array tasks the scheduler may run at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_limit: Option<u32>,

    /// Paths the stage reads (validated to exist when they are external inputs).
    pub inputs: Vec<PathBuf>,

    /// Canonical directory the stage writes into.
    pub output_dir: PathBuf,
}

impl StageSpec {
    pub fn ordinal(&self) -> u8 {
        self.stage.ordinal()
    }

    pub fn is_array(&self) -> bool {
        self.stage.is_fan_out()
    }

    /// Replicate indices `1..=fan_out`.
    pub fn indices(&self) -> Vec<u32> {
        (1..=self.fan_out).collect()
    }
}
