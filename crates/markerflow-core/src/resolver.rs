//! StageSpec Resolver: configuration document -> validated stage specs.
//!
//! Read-only. Every default comes from [`defaults`], so the single-subject and
//! batch entry points resolve identically. Validation order is fixed and is
//! the same for live and dry runs:
//!
//! 1. required fields present (ConfigurationError)
//! 2. referenced paths exist (ValidationError)
//! 3. counts and resource values valid (ConfigurationError)
//! 4. every stage program exists under the code root (ConfigurationError)

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::graph::StageGraph;
use crate::app::retry::RetryPolicy;
use crate::config::defaults::{self, HpcField};
use crate::config::PipelineConfig;
use crate::domain::{
    PipelineError, REPLICATE_PLACEHOLDER, Resources, StageCommand, StageKind, StageSpec,
    SubjectId,
};
use crate::layout::OutputLayout;
use crate::stages::{ReplicateSelection, check_program};

/// Scheduler client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitSettings {
    pub sbatch: String,
    pub sacct: String,
    pub max_submit_attempts: u32,
    pub backoff_base: Duration,
}

impl SubmitSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_submit_attempts, self.backoff_base)
    }
}

/// Everything a PipelineRun needs, resolved once up front.
#[derive(Debug, Clone)]
pub struct ResolvedPipeline {
    pub subject: SubjectId,
    pub layout: OutputLayout,
    pub input: PathBuf,
    pub code_dir: PathBuf,
    pub num_bootstraps: u32,
    pub read_depth: u32,
    pub longitudinal: bool,
    pub graph: StageGraph,
    /// One spec per stage in the graph, in submission order.
    pub specs: Vec<StageSpec>,
    pub submit: SubmitSettings,
}

impl ResolvedPipeline {
    pub fn spec(&self, stage: StageKind) -> Option<&StageSpec> {
        self.specs.iter().find(|s| s.stage == stage)
    }

    /// Aggregate command restricted to the given replicate indices.
    ///
    /// The whole range `1..=N` is written as a count, anything else as an
    /// explicit list.
    pub fn aggregate_command(&self, replicates: &[u32]) -> Option<StageCommand> {
        let spec = self.spec(StageKind::Aggregate)?;
        let all: Vec<u32> = (1..=self.num_bootstraps).collect();
        let selection = if replicates == all.as_slice() {
            ReplicateSelection::Count(self.num_bootstraps)
        } else {
            ReplicateSelection::List(replicates.to_vec())
        };

        let mut command = spec.command.clone();
        if let Some(last) = command.args.last_mut() {
            *last = selection.to_string();
        }
        Some(command)
    }
}

pub struct Resolver<'a> {
    config: &'a PipelineConfig,
    stage_runner: Option<PathBuf>,
}

/// Fields shared by every stage.
struct Common {
    subject: SubjectId,
    input: PathBuf,
    code_dir: PathBuf,
    layout: OutputLayout,
    stage_runner: PathBuf,
    num_bootstraps: u32,
    num_chains: u32,
    parallel_limit: u32,
    read_depth: u32,
}

impl<'a> Resolver<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self {
            config,
            stage_runner: None,
        }
    }

    /// Binary every scheduler job runs, overriding config and current exe.
    pub fn with_stage_runner(mut self, path: impl Into<PathBuf>) -> Self {
        self.stage_runner = Some(path.into());
        self
    }

    /// Resolve one stage.
    pub fn resolve(&self, stage: StageKind) -> Result<StageSpec, PipelineError> {
        let common = self.common()?;
        self.stage_spec(&common, stage)
    }

    /// Resolve every stage of the pipeline graph.
    pub fn resolve_all(&self) -> Result<ResolvedPipeline, PipelineError> {
        let common = self.common()?;
        let longitudinal = self.config.longitudinal.enabled;

        let graph = StageGraph::pipeline(longitudinal);
        graph.check_ordinals()?;
        let specs = graph
            .topological_order()?
            .into_iter()
            .map(|stage| self.stage_spec(&common, stage))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ResolvedPipeline {
            subject: common.subject,
            layout: common.layout,
            input: common.input,
            code_dir: common.code_dir,
            num_bootstraps: common.num_bootstraps,
            read_depth: common.read_depth,
            longitudinal,
            graph,
            specs,
            submit: self.submit_settings()?,
        })
    }

    fn common(&self) -> Result<Common, PipelineError> {
        let cfg = self.config;

        let subject = cfg
            .patient_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PipelineError::configuration("patient_id is required"))?;
        let input = cfg
            .input
            .ssm_file
            .clone()
            .ok_or_else(|| PipelineError::configuration("input.ssm_file is required"))?;
        let code_dir = cfg
            .input
            .code_dir
            .clone()
            .ok_or_else(|| PipelineError::configuration("input.code_dir is required"))?;
        let base_dir = cfg
            .output
            .base_dir
            .clone()
            .ok_or_else(|| PipelineError::configuration("output.base_dir is required"))?;

        if !input.is_file() {
            return Err(PipelineError::validation("input file", input));
        }
        if !code_dir.is_dir() {
            return Err(PipelineError::validation("code directory", code_dir));
        }

        let num_bootstraps = at_least_one(
            "bootstrap.num_bootstraps",
            cfg.bootstrap.num_bootstraps.unwrap_or(defaults::NUM_BOOTSTRAPS),
        )?;
        let num_chains = at_least_one(
            "phylowgs.num_chains",
            cfg.phylowgs.num_chains.unwrap_or(defaults::NUM_CHAINS),
        )?;
        let parallel_limit = at_least_one(
            "phylowgs.parallel_limit",
            cfg.phylowgs.parallel_limit.unwrap_or(defaults::PARALLEL_LIMIT),
        )?;
        let read_depth = at_least_one(
            "marker_selection.read_depth",
            cfg.marker_selection.read_depth.unwrap_or(defaults::READ_DEPTH),
        )?;

        let subject = SubjectId::new(subject);
        Ok(Common {
            layout: OutputLayout::new(base_dir, subject.clone()),
            subject,
            input,
            code_dir,
            stage_runner: self.stage_runner()?,
            num_bootstraps,
            num_chains,
            parallel_limit,
            read_depth,
        })
    }

    fn stage_runner(&self) -> Result<PathBuf, PipelineError> {
        if let Some(p) = self.stage_runner.clone().or_else(|| self.config.stage_runner.clone()) {
            return Ok(p);
        }
        std::env::current_exe().map_err(|e| {
            PipelineError::configuration(format!("cannot determine stage runner binary: {e}"))
        })
    }

    /// Scheduler client settings; needs no paths to exist.
    pub fn submit_settings(&self) -> Result<SubmitSettings, PipelineError> {
        let s = &self.config.scheduler;
        Ok(SubmitSettings {
            sbatch: s.sbatch.clone().unwrap_or_else(|| defaults::SBATCH.to_string()),
            sacct: s.sacct.clone().unwrap_or_else(|| defaults::SACCT.to_string()),
            max_submit_attempts: at_least_one(
                "scheduler.max_submit_attempts",
                s.max_submit_attempts.unwrap_or(defaults::MAX_SUBMIT_ATTEMPTS),
            )?,
            backoff_base: Duration::from_secs(
                s.backoff_base_secs.unwrap_or(defaults::BACKOFF_BASE_SECS),
            ),
        })
    }

    fn resources(&self, stage: StageKind) -> Result<Resources, PipelineError> {
        let section = stage.config_section();
        let hpc = self.config.hpc_for(section).cloned().unwrap_or_default();
        let or_default = |v: Option<String>, field| {
            v.unwrap_or_else(|| defaults::hpc(stage, field).to_string())
        };

        let partition = or_default(hpc.partition, HpcField::Partition);
        if partition.trim().is_empty() {
            return Err(PipelineError::configuration(format!(
                "hpc.{section}.partition must not be empty"
            )));
        }
        let cpus = at_least_one(
            &format!("hpc.{section}.cpus_per_task"),
            hpc.cpus_per_task.unwrap_or_else(|| defaults::cpus(stage)),
        )?;
        let memory = or_default(hpc.memory, HpcField::Memory);
        if !is_valid_memory(&memory) {
            return Err(PipelineError::configuration(format!(
                "hpc.{section}.memory: invalid value {memory:?} (expected e.g. 8G)"
            )));
        }
        let walltime = or_default(hpc.walltime, HpcField::Walltime);
        if !is_valid_walltime(&walltime) {
            return Err(PipelineError::configuration(format!(
                "hpc.{section}.walltime: invalid value {walltime:?} (expected [D-]HH:MM:SS)"
            )));
        }

        Ok(Resources {
            partition,
            cpus,
            memory,
            walltime,
            conda_env: or_default(hpc.conda_env, HpcField::CondaEnv),
            modules: hpc.modules,
        })
    }

    fn stage_spec(&self, c: &Common, stage: StageKind) -> Result<StageSpec, PipelineError> {
        let resources = self.resources(stage)?;
        check_program(stage, &c.code_dir)?;

        let l = &c.layout;
        let code = path_arg(&c.code_dir);
        let subject = c.subject.as_str().to_string();

        let (args, fan_out, inputs) = match stage {
            StageKind::Resample => (
                vec![
                    "resample-stage".to_string(),
                    path_arg(&c.input),
                    path_arg(&l.bootstraps_dir()),
                    code,
                    c.num_bootstraps.to_string(),
                ],
                c.num_bootstraps,
                vec![c.input.clone()],
            ),
            StageKind::Infer => (
                vec![
                    "infer-stage".to_string(),
                    format!(
                        "{}/bootstrap{REPLICATE_PLACEHOLDER}",
                        path_arg(&l.bootstraps_dir())
                    ),
                    code,
                    c.num_chains.to_string(),
                ],
                c.num_bootstraps,
                vec![l.bootstraps_dir()],
            ),
            StageKind::Aggregate => (
                vec![
                    "aggregate-stage".to_string(),
                    subject,
                    path_arg(&l.bootstraps_dir()),
                    path_arg(&l.aggregation_dir()),
                    code,
                    ReplicateSelection::Count(c.num_bootstraps).to_string(),
                ],
                1,
                vec![l.bootstraps_dir()],
            ),
            StageKind::SelectMarkers => (
                vec![
                    "select-markers-stage".to_string(),
                    subject,
                    path_arg(&l.aggregation_dir()),
                    path_arg(&l.filtered_input()),
                    code,
                    c.read_depth.to_string(),
                ],
                1,
                vec![l.aggregation_dir(), l.filtered_input()],
            ),
            StageKind::LongitudinalUpdate => (
                vec![
                    "longitudinal-stage".to_string(),
                    subject,
                    path_arg(&l.markers_dir()),
                    path_arg(&l.aggregation_dir()),
                    code,
                ],
                1,
                vec![l.markers_dir(), l.aggregation_dir()],
            ),
        };

        Ok(StageSpec {
            stage,
            resources,
            command: StageCommand::new(c.stage_runner.clone(), args),
            fan_out,
            parallel_limit: stage.is_fan_out().then_some(c.parallel_limit),
            inputs,
            output_dir: l.stage_output_dir(stage),
        })
    }
}

fn path_arg(p: &Path) -> String {
    p.display().to_string()
}

fn at_least_one(field: &str, value: u32) -> Result<u32, PipelineError> {
    if value == 0 {
        Err(PipelineError::configuration(format!(
            "{field} must be at least 1"
        )))
    } else {
        Ok(value)
    }
}

/// `8G`, `500M`, `16000`: digits with an optional K/M/G/T suffix.
fn is_valid_memory(s: &str) -> bool {
    let digits = s
        .strip_suffix(|c: char| matches!(c.to_ascii_uppercase(), 'K' | 'M' | 'G' | 'T'))
        .unwrap_or(s);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// `HH:MM:SS` with an optional `D-` day prefix.
fn is_valid_walltime(s: &str) -> bool {
    let clock = match s.split_once('-') {
        Some((days, rest)) => {
            if days.is_empty() || !days.chars().all(|c| c.is_ascii_digit()) {
                return false;
            }
            rest
        }
        None => s,
    };
    let parts: Vec<&str> = clock.split(':').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return false;
    }
    let nums: Option<Vec<u32>> = parts.iter().map(|p| p.parse::<u32>().ok()).collect();
    match nums.as_deref() {
        Some([_, min, sec]) => *min < 60 && *sec < 60 && parts[1].len() == 2 && parts[2].len() == 2,
        _ => false,
    }
}
