//! Multi-Subject Orchestrator: one pipeline run per input file.
//!
//! Subjects are processed one after another. Whatever goes wrong with one
//! subject (bad name, config error, submission error, failed stage) is
//! recorded in its outcome and the batch moves on to the next subject.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use super::runner::{PipelineRunner, RunOptions};
use super::subject::{discover_inputs, subject_id_for};
use crate::config::PipelineConfig;
use crate::config::template::{generated_config_path, materialize};
use crate::domain::{BatchRun, PipelineError, PipelineRun, RunStatus, SubjectId, SubjectOutcome};
use crate::layout::{BatchLayout, ensure_dir};
use crate::ports::Clock;

pub const SUMMARY_FILE: &str = "batch_summary.json";

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Pause between two subjects; never before the first or after the last.
    pub delay: Duration,
    /// Binary the scheduler jobs run, overriding the template.
    pub stage_runner: Option<PathBuf>,
}

pub struct MultiSubjectOrchestrator {
    runner: PipelineRunner,
    clock: Arc<dyn Clock>,
    options: BatchOptions,
}

/// Plain-text master log of a batch.
struct MasterLog {
    file: File,
    clock: Arc<dyn Clock>,
}

impl MasterLog {
    async fn create(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, PipelineError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| PipelineError::io(path, e))?;
        Ok(Self { file, clock })
    }

    async fn line(&mut self, message: &str) {
        let ts = self.clock.now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{ts}] {message}\n");
        if let Err(e) = self.file.write_all(line.as_bytes()).await {
            warn!(error = %e, "cannot write master log");
        }
    }

    async fn close(mut self) {
        if let Err(e) = self.file.flush().await {
            warn!(error = %e, "cannot flush master log");
        }
    }
}

#[derive(Serialize)]
struct BatchSummary<'a> {
    batch_id: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    total: usize,
    succeeded: usize,
    failed: usize,
    master_log: &'a Path,
    subjects: &'a [SubjectOutcome],
}

impl MultiSubjectOrchestrator {
    pub fn new(runner: PipelineRunner, clock: Arc<dyn Clock>) -> Self {
        Self {
            runner,
            clock,
            options: BatchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Run every input file of `input_dir` through the template.
    ///
    /// `Err` only when the batch cannot start at all: missing input
    /// directory or template, no input files, unwritable output base.
    pub async fn run(
        &self,
        input_dir: &Path,
        template_path: &Path,
        output_base: &Path,
    ) -> Result<BatchRun, PipelineError> {
        let inputs = discover_inputs(input_dir)?;
        let template = PipelineConfig::load(template_path)?;
        if inputs.is_empty() {
            return Err(PipelineError::validation(
                "input files (*.txt, *.tsv)",
                input_dir,
            ));
        }

        let layout = BatchLayout::new(output_base);
        layout.ensure()?;

        let started_at = self.clock.now();
        let master_path = layout
            .logs_dir()
            .join(format!("batch_{}.log", started_at.format("%Y%m%d_%H%M%S")));
        let mut master = MasterLog::create(&master_path, Arc::clone(&self.clock)).await?;
        let mut batch = BatchRun::new(output_base.to_path_buf(), master_path.clone());

        info!(
            batch_id = %batch.batch_id,
            subjects = inputs.len(),
            input_dir = %input_dir.display(),
            "batch started"
        );
        master
            .line(&format!(
                "batch {} started: {} input file(s) from {}, template {}",
                batch.batch_id,
                inputs.len(),
                input_dir.display(),
                template_path.display()
            ))
            .await;

        let mut seen = BTreeSet::new();
        for (i, input) in inputs.iter().enumerate() {
            if i > 0 && !self.options.delay.is_zero() {
                info!(delay_secs = self.options.delay.as_secs_f64(), "waiting before next subject");
                tokio::time::sleep(self.options.delay).await;
            }

            let outcome = self.run_subject(&layout, &template, input, &mut seen).await;
            match &outcome.error {
                None => {
                    master
                        .line(&format!(
                            "{}: {:?} (log: {})",
                            outcome.subject,
                            outcome.status,
                            outcome.log_path.display()
                        ))
                        .await
                }
                Some(e) => {
                    error!(subject = %outcome.subject, error = %e, "subject failed");
                    master
                        .line(&format!(
                            "{}: FAILED: {e} (log: {})",
                            outcome.subject,
                            outcome.log_path.display()
                        ))
                        .await;
                }
            }
            batch.record(outcome);
        }

        let finished_at = self.clock.now();
        master
            .line(&format!(
                "batch finished: {} succeeded, {} failed",
                batch.succeeded_count(),
                batch.failed_count()
            ))
            .await;
        for failed in batch.failed_subjects() {
            master
                .line(&format!(
                    "  failed: {} (log: {})",
                    failed.subject,
                    failed.log_path.display()
                ))
                .await;
        }
        master.close().await;
        self.write_summary(&layout, &batch, started_at, finished_at).await?;

        info!(
            succeeded = batch.succeeded_count(),
            failed = batch.failed_count(),
            master_log = %master_path.display(),
            "batch finished"
        );
        Ok(batch)
    }

    /// Everything for one subject. Never fails: problems land in the outcome.
    async fn run_subject(
        &self,
        layout: &BatchLayout,
        template: &PipelineConfig,
        input: &Path,
        seen: &mut BTreeSet<SubjectId>,
    ) -> SubjectOutcome {
        let subject = subject_id_for(input)
            .unwrap_or_else(|| SubjectId::new(input.display().to_string()));
        let log_path = layout.subject_log(&subject);
        let mut outcome = SubjectOutcome {
            subject: subject.clone(),
            input: input.to_path_buf(),
            config_path: None,
            log_path: log_path.clone(),
            status: RunStatus::Failed,
            error: None,
        };

        if !seen.insert(subject.clone()) {
            outcome.error = Some(format!(
                "duplicate subject id {subject} (from {})",
                input.display()
            ));
            return outcome;
        }

        let config_path = generated_config_path(layout.output_base(), &subject);
        let result = self.prepare_and_run(layout, template, &subject, input, &config_path).await;
        outcome.config_path = config_path.is_file().then_some(config_path);

        match result {
            Ok(run) => {
                outcome.status = run.status;
                if !run.status.is_success() {
                    let stage_failure = run.first_failure().map(|r| {
                        format!(
                            "StageFailure: stage={} exit_code={}",
                            r.label(),
                            r.exit_code.unwrap_or(1)
                        )
                    });
                    outcome.error = run
                        .error
                        .clone()
                        .or(stage_failure)
                        .or_else(|| Some("pipeline failed".to_string()));
                }
                write_subject_log(&log_path, Some(&run), outcome.error.as_deref()).await;
            }
            Err(e) => {
                outcome.error = Some(e.to_string());
                write_subject_log(&log_path, None, outcome.error.as_deref()).await;
            }
        }
        outcome
    }

    async fn prepare_and_run(
        &self,
        layout: &BatchLayout,
        template: &PipelineConfig,
        subject: &SubjectId,
        input: &Path,
        config_path: &Path,
    ) -> Result<PipelineRun, PipelineError> {
        let config = materialize(template, subject, input, &layout.patients_dir());
        config.save(config_path)?;
        ensure_dir(&layout.subject_layout(subject.clone()).subject_dir())?;

        let options = RunOptions {
            dry_run: false,
            stage_runner: self.options.stage_runner.clone(),
        };
        self.runner.run_config(&config, &options).await
    }

    async fn write_summary(
        &self,
        layout: &BatchLayout,
        batch: &BatchRun,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let summary = BatchSummary {
            batch_id: batch.batch_id.to_string(),
            started_at,
            finished_at,
            total: batch.subjects.len(),
            succeeded: batch.succeeded_count(),
            failed: batch.failed_count(),
            master_log: &batch.master_log,
            subjects: &batch.subjects,
        };
        let path = layout.logs_dir().join(SUMMARY_FILE);
        let json = serde_json::to_string_pretty(&summary)
            .map_err(|e| PipelineError::configuration(format!("cannot serialize batch summary: {e}")))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| PipelineError::io(&path, e))
    }
}

/// Per-subject log: a job table followed by the JSON run summary.
async fn write_subject_log(path: &Path, run: Option<&PipelineRun>, error: Option<&str>) {
    let mut text = String::new();
    if let Some(run) = run {
        text.push_str(&format!(
            "subject {} run {} status {:?}\n",
            run.subject, run.run_id, run.status
        ));
        for r in &run.records {
            text.push_str(&format!(
                "{:<24} {:<16} {:?}\n",
                r.label(),
                r.job_id.as_ref().map(|j| j.as_str()).unwrap_or("-"),
                r.state
            ));
        }
        if let Ok(json) = serde_json::to_string_pretty(&run.summary()) {
            text.push_str(&json);
            text.push('\n');
        }
    }
    if let Some(e) = error {
        text.push_str(&format!("error: {e}\n"));
    }
    if let Err(e) = tokio::fs::write(path, text).await {
        warn!(path = %path.display(), error = %e, "cannot write subject log");
    }
}
