//! Pipeline Runner: submits one subject's stages in order.
//!
//! Submission is fire-and-forget: each stage is handed to the scheduler with
//! a dependency on its upstream job ids and the runner moves on. Before a
//! stage is submitted, the runner takes a non-blocking snapshot of its
//! upstream jobs, so failures the scheduler already knows about are honored:
//!
//! - StrictSuccess: the stage is skipped if any upstream job failed
//! - AnyCompletion: submitted over whatever upstream survived, as long as
//!   the upstream stage was accepted at all
//!
//! A stage whose upstream was never submitted is skipped either way.
//! Failures the scheduler learns about later are enforced by the scheduler
//! itself through the dependency expression.
//!
//! Snapshots are taken per stage: one `observe` call covers a scalar job or
//! every task of an array.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{Instrument, debug, error, info, info_span, warn};

use super::graph::StageEdge;
use super::retry::RetryPolicy;
use super::submitter::JobSubmitter;
use crate::config::PipelineConfig;
use crate::domain::{
    ArraySpec, DependencyEdge, DependencyKind, JobRecord, PipelineError, PipelineRun,
    SchedulerJobId, StageKind, StageSpec, SubmitRequest,
};
use crate::impls::DryRunScheduler;
use crate::layout::DirStatus;
use crate::ports::Scheduler;
use crate::resolver::{ResolvedPipeline, Resolver};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Resolve and plan everything, submit nothing.
    pub dry_run: bool,
    /// Binary the scheduler jobs run, overriding the configuration.
    pub stage_runner: Option<PathBuf>,
}

pub struct PipelineRunner {
    scheduler: Arc<dyn Scheduler>,
    retry_policy: Option<RetryPolicy>,
}

/// Whether a stage may be submitted, and over which edges.
enum Gate {
    Open(Vec<DependencyEdge>),
    Blocked(String),
}

impl PipelineRunner {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            retry_policy: None,
        }
    }

    /// Use `policy` instead of the one from the configuration.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Resolve `config` and run it.
    pub async fn run_config(
        &self,
        config: &PipelineConfig,
        options: &RunOptions,
    ) -> Result<PipelineRun, PipelineError> {
        let mut resolver = Resolver::new(config);
        if let Some(runner) = &options.stage_runner {
            resolver = resolver.with_stage_runner(runner.clone());
        }
        let resolved = resolver.resolve_all()?;
        self.run(&resolved, options.dry_run).await
    }

    /// Submit every stage of `resolved`.
    ///
    /// `Err` means the run never got going (the output skeleton could not be
    /// created). Stage-level problems, submission errors included, end up in
    /// the returned run's records and status.
    pub async fn run(
        &self,
        resolved: &ResolvedPipeline,
        dry_run: bool,
    ) -> Result<PipelineRun, PipelineError> {
        let span = info_span!("subject", subject = %resolved.subject, dry_run);
        self.run_stages(resolved, dry_run).instrument(span).await
    }

    async fn run_stages(
        &self,
        resolved: &ResolvedPipeline,
        dry_run: bool,
    ) -> Result<PipelineRun, PipelineError> {
        let scheduler: Arc<dyn Scheduler> = if dry_run {
            Arc::new(DryRunScheduler::new())
        } else {
            Arc::clone(&self.scheduler)
        };
        let policy = self
            .retry_policy
            .clone()
            .unwrap_or_else(|| resolved.submit.retry_policy());
        let submitter = JobSubmitter::new(scheduler, policy);

        let layout = &resolved.layout;
        let mut run = PipelineRun::new(resolved.subject.clone(), layout.subject_dir(), dry_run);
        info!(
            run_id = %run.run_id,
            scheduler = submitter.scheduler().name(),
            base_dir = %run.base_dir.display(),
            "pipeline run started"
        );
        if !dry_run {
            log_dirs(layout.ensure_base()?);
        }

        // Base scheduler id of every stage that was accepted.
        let mut submitted: BTreeMap<StageKind, SchedulerJobId> = BTreeMap::new();

        for spec in &resolved.specs {
            let stage = spec.stage;
            if layout.has_existing_output(stage) {
                warn!(
                    %stage,
                    dir = %layout.stage_output_dir(stage).display(),
                    "output directory already holds results; stage is re-submitted and may overwrite them"
                );
                run.preexisting_outputs.push(stage);
            }

            let upstream = resolved.graph.dependencies(stage);
            for edge in upstream {
                if let Some(id) = submitted.get(&edge.upstream) {
                    refresh(submitter.scheduler().as_ref(), &mut run, edge.upstream, id).await;
                }
            }

            let mut records = Vec::new();
            let indices = if spec.is_array() { spec.indices() } else { Vec::new() };

            match gate(&run, &submitted, upstream) {
                Gate::Blocked(reason) => {
                    warn!(%stage, %reason, "stage skipped, upstream failed");
                    records.extend(new_records(&run, spec, &indices).map(|mut r| {
                        r.mark_skipped(reason.clone());
                        r
                    }));
                }
                Gate::Open(edges) => {
                    let request = self.request(resolved, spec, &run, &indices, edges);
                    if !dry_run {
                        log_dirs(layout.ensure_stage(stage, spec.fan_out)?);
                    }
                    let accepted = self
                        .submit(&submitter, &mut run, spec, &indices, request, &mut submitted)
                        .await;
                    records.extend(accepted);
                }
            }

            records.sort_by_key(|r| r.replicate);
            run.records.extend(records);
        }

        // Downstream of a stage that is still live cannot have finished.
        for (stage, id) in &submitted {
            refresh(submitter.scheduler().as_ref(), &mut run, *stage, id).await;
            if run.records_for(*stage).any(|r| !r.state.is_terminal()) {
                break;
            }
        }
        run.finalize();

        info!(status = ?run.status, jobs = run.records.len(), "pipeline run finished");
        if let Some(failure) = run.first_failure() {
            if !run.status.is_success() {
                error!(
                    stage = %failure.stage,
                    job = %failure.label(),
                    exit_code = failure.exit_code.unwrap_or(1),
                    error = failure.last_error.as_deref().unwrap_or("-"),
                    "pipeline run failed"
                );
            }
        }
        Ok(run)
    }

    fn request(
        &self,
        resolved: &ResolvedPipeline,
        spec: &StageSpec,
        run: &PipelineRun,
        indices: &[u32],
        edges: Vec<DependencyEdge>,
    ) -> SubmitRequest {
        let stage = spec.stage;
        let command = match stage {
            StageKind::Aggregate => {
                let survivors = surviving_replicates(run, resolved, stage);
                if survivors.len() < resolved.num_bootstraps as usize {
                    warn!(
                        survivors = survivors.len(),
                        replicates = resolved.num_bootstraps,
                        "aggregating a reduced replicate set"
                    );
                }
                resolved
                    .aggregate_command(&survivors)
                    .unwrap_or_else(|| spec.command.clone())
            }
            _ => spec.command.clone(),
        };

        SubmitRequest {
            subject: run.subject.clone(),
            stage,
            job_name: format!("{}_{}", run.subject, stage),
            resources: spec.resources.clone(),
            command,
            array: spec.is_array().then(|| ArraySpec {
                indices: indices.to_vec(),
                parallel_limit: spec.parallel_limit,
            }),
            edges,
            dependency: None,
            output_dir: spec.output_dir.clone(),
            log_dir: resolved.layout.logs_dir(),
        }
    }

    async fn submit(
        &self,
        submitter: &JobSubmitter,
        run: &mut PipelineRun,
        spec: &StageSpec,
        indices: &[u32],
        mut request: SubmitRequest,
        submitted: &mut BTreeMap<StageKind, SchedulerJobId>,
    ) -> Vec<JobRecord> {
        let stage = spec.stage;
        let mut records: Vec<JobRecord> = new_records(run, spec, indices).collect();

        match submitter.submit(&mut request).await {
            Ok(id) => {
                for r in &mut records {
                    let job_id = match r.replicate {
                        Some(i) => id.array_task(i),
                        None => id.clone(),
                    };
                    r.mark_submitted(job_id);
                }
                submitted.insert(stage, id);
                run.plan.push(request);
            }
            Err(e) => {
                error!(
                    %stage,
                    subject = %run.subject,
                    error_class = e.kind().as_str(),
                    error = %e,
                    "stage submission failed"
                );
                for r in &mut records {
                    r.mark_submission_failed(e.to_string());
                }
                run.error.get_or_insert_with(|| e.to_string());
            }
        }
        records
    }
}

/// Decide whether a stage can be submitted and over which edges.
fn gate(
    run: &PipelineRun,
    submitted: &BTreeMap<StageKind, SchedulerJobId>,
    upstream: &[StageEdge],
) -> Gate {
    let mut edges = Vec::new();

    for e in upstream {
        if e.kind == DependencyKind::StrictSuccess {
            if let Some(r) = run
                .records_for(e.upstream)
                .find(|r| r.state.is_unsuccessful())
            {
                return Gate::Blocked(format!("{} did not succeed", r.label()));
            }
        }
        let Some(id) = submitted.get(&e.upstream) else {
            return Gate::Blocked(format!("{} was never submitted", e.upstream));
        };
        edges.push(match e.kind {
            DependencyKind::StrictSuccess => DependencyEdge::strict(vec![id.clone()]),
            DependencyKind::AnyCompletion => DependencyEdge::any_completion(vec![id.clone()]),
        });
    }
    Gate::Open(edges)
}

/// Fresh records for `spec`: one per index for array stages, one otherwise.
fn new_records<'a>(
    run: &'a PipelineRun,
    spec: &'a StageSpec,
    indices: &'a [u32],
) -> Box<dyn Iterator<Item = JobRecord> + 'a> {
    if spec.is_array() {
        Box::new(
            indices
                .iter()
                .map(move |i| JobRecord::new(run.subject.clone(), spec.stage, Some(*i))),
        )
    } else {
        Box::new(std::iter::once(JobRecord::new(
            run.subject.clone(),
            spec.stage,
            None,
        )))
    }
}

/// Replicates of the fan-out stage feeding `stage` that are not known to
/// have failed.
fn surviving_replicates(
    run: &PipelineRun,
    resolved: &ResolvedPipeline,
    stage: StageKind,
) -> Vec<u32> {
    let mut survivors: Vec<u32> = resolved
        .graph
        .dependencies(stage)
        .iter()
        .filter(|e| e.upstream.is_fan_out())
        .flat_map(|e| run.records_for(e.upstream))
        .filter(|r| !r.state.is_unsuccessful())
        .filter_map(|r| r.replicate)
        .collect();
    survivors.sort_unstable();
    survivors.dedup();
    survivors
}

/// Fold one scheduler snapshot of `job_id` into every live record of
/// `stage`. Nothing is asked when every record is already terminal.
async fn refresh(
    scheduler: &dyn Scheduler,
    run: &mut PipelineRun,
    stage: StageKind,
    job_id: &SchedulerJobId,
) {
    if run.records_for(stage).all(|r| r.state.is_terminal()) {
        return;
    }
    let snapshot = scheduler.observe(job_id).await;
    debug!(%stage, %job_id, entries = snapshot.len(), "observed");
    for record in run
        .records
        .iter_mut()
        .filter(|r| r.stage == stage && !r.state.is_terminal())
    {
        let Some(id) = &record.job_id else { continue };
        let observation = snapshot.get(id);
        record.apply_observation(observation);
    }
}

fn log_dirs(dirs: Vec<(PathBuf, DirStatus)>) {
    for (path, status) in dirs {
        match status {
            DirStatus::Created => debug!(dir = %path.display(), "created"),
            DirStatus::AlreadyExisted => debug!(dir = %path.display(), "already exists"),
        }
    }
}
