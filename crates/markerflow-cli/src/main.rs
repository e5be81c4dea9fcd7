use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::error::ErrorKind as ClapErrorKind;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use markerflow_core::app::{BatchOptions, MultiSubjectOrchestrator, PipelineRunner, RunOptions};
use markerflow_core::config::PipelineConfig;
use markerflow_core::config::defaults;
use markerflow_core::domain::{BatchRun, PipelineError, PipelineRun, StageKind};
use markerflow_core::impls::SlurmScheduler;
use markerflow_core::ports::SystemClock;
use markerflow_core::resolver::Resolver;
use markerflow_core::stages::{ReplicateSelection, StageInvocation, interpreter_from_env, run_stage};

#[derive(Debug, Parser)]
#[command(name = "markerflow", version, about = "Marker discovery pipeline on SLURM")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit every stage of one subject.
    RunPipeline {
        config: PathBuf,
        /// Resolve and print the plan without submitting anything.
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run the pipeline for every input file of a directory.
    MultiPatient {
        input_dir: PathBuf,
        config_template: PathBuf,
        output_base: PathBuf,
        /// Seconds to wait between two subjects.
        #[arg(long, default_value_t = 0)]
        delay: u64,
    },
    /// Resample the input into every replicate directory.
    ResampleStage {
        input_file: PathBuf,
        output_dir: PathBuf,
        code_dir: PathBuf,
        #[arg(default_value_t = defaults::NUM_BOOTSTRAPS)]
        replicate_count: u32,
    },
    /// Run inference over one replicate directory.
    InferStage {
        replicate_dir: PathBuf,
        code_dir: PathBuf,
        #[arg(default_value_t = defaults::NUM_CHAINS)]
        num_chains: u32,
    },
    /// Aggregate the completed replicates.
    AggregateStage {
        subject_id: String,
        fanout_parent_dir: PathBuf,
        output_dir: PathBuf,
        code_dir: PathBuf,
        /// Replicate count `N` or comma list `1,4`.
        #[arg(default_value_t = ReplicateSelection::default())]
        replicates: ReplicateSelection,
    },
    /// Select markers from the aggregation results.
    SelectMarkersStage {
        subject_id: String,
        aggregation_dir: PathBuf,
        filtered_input_file: PathBuf,
        code_dir: PathBuf,
        #[arg(default_value_t = defaults::READ_DEPTH)]
        read_depth: u32,
    },
    /// Update longitudinal tracking from the selected markers.
    LongitudinalStage {
        subject_id: String,
        markers_dir: PathBuf,
        aggregation_dir: PathBuf,
        code_dir: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Help and version requests succeed; every other parse error is an
/// argument error.
fn parse_exit_code(kind: ClapErrorKind) -> u8 {
    match kind {
        ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(parse_exit_code(e.kind()));
        }
    };
    init_tracing();

    let code = match cli.command {
        Command::RunPipeline {
            config,
            dry_run,
            json,
        } => run_pipeline(&config, dry_run, json).await,
        Command::MultiPatient {
            input_dir,
            config_template,
            output_base,
            delay,
        } => {
            multi_patient(
                &input_dir,
                &config_template,
                &output_base,
                Duration::from_secs(delay),
            )
            .await
        }
        Command::ResampleStage {
            input_file,
            output_dir,
            code_dir,
            replicate_count,
        } => {
            stage(StageInvocation::Resample {
                input: input_file,
                output_dir,
                code_dir,
                replicates: replicate_count,
            })
            .await
        }
        Command::InferStage {
            replicate_dir,
            code_dir,
            num_chains,
        } => {
            stage(StageInvocation::Infer {
                replicate_dir,
                code_dir,
                num_chains,
            })
            .await
        }
        Command::AggregateStage {
            subject_id,
            fanout_parent_dir,
            output_dir,
            code_dir,
            replicates,
        } => {
            stage(StageInvocation::Aggregate {
                subject: subject_id,
                fanout_parent: fanout_parent_dir,
                output_dir,
                code_dir,
                replicates,
            })
            .await
        }
        Command::SelectMarkersStage {
            subject_id,
            aggregation_dir,
            filtered_input_file,
            code_dir,
            read_depth,
        } => {
            stage(StageInvocation::SelectMarkers {
                subject: subject_id,
                aggregation_dir,
                filtered_input: filtered_input_file,
                code_dir,
                read_depth,
            })
            .await
        }
        Command::LongitudinalStage {
            subject_id,
            markers_dir,
            aggregation_dir,
            code_dir,
        } => {
            stage(StageInvocation::LongitudinalUpdate {
                subject: subject_id,
                markers_dir,
                aggregation_dir,
                code_dir,
            })
            .await
        }
    };
    exit(code)
}

/// In-job entry point: the external program's exit code, verbatim.
async fn stage(invocation: StageInvocation) -> i32 {
    let stage = invocation.stage();
    let subject = invocation.subject().unwrap_or("-").to_string();
    match run_stage(&invocation, &interpreter_from_env()).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("stage {stage} (subject {subject}) failed: {e}");
            e.exit_code()
        }
    }
}

fn scheduler_for(config: &PipelineConfig) -> Result<SlurmScheduler, PipelineError> {
    let settings = Resolver::new(config).submit_settings()?;
    Ok(SlurmScheduler::new(settings.sbatch, settings.sacct))
}

async fn submit_pipeline(config_path: &Path, dry_run: bool) -> Result<PipelineRun, PipelineError> {
    let config = PipelineConfig::load(config_path)?;
    let runner = PipelineRunner::new(Arc::new(scheduler_for(&config)?));
    let options = RunOptions {
        dry_run,
        stage_runner: None,
    };
    runner.run_config(&config, &options).await
}

async fn run_pipeline(config_path: &Path, dry_run: bool, json: bool) -> i32 {
    info!(config = %config_path.display(), dry_run, "run-pipeline");
    match submit_pipeline(config_path, dry_run).await {
        Ok(run) => {
            if json {
                match serde_json::to_string_pretty(&run.summary()) {
                    Ok(text) => println!("{text}"),
                    Err(e) => eprintln!("cannot serialize run summary: {e}"),
                }
            } else {
                print_run(&run);
            }
            run.exit_code()
        }
        Err(e) => {
            eprintln!("{} ({}): {e}", e.kind().as_str(), config_path.display());
            e.exit_code()
        }
    }
}

async fn run_batch(
    input_dir: &Path,
    template: &Path,
    output_base: &Path,
    delay: Duration,
) -> Result<BatchRun, PipelineError> {
    // the orchestrator reports a missing input directory before the template
    if !input_dir.is_dir() {
        return Err(PipelineError::validation("input directory", input_dir));
    }
    let config = PipelineConfig::load(template)?;
    let runner = PipelineRunner::new(Arc::new(scheduler_for(&config)?));
    MultiSubjectOrchestrator::new(runner, Arc::new(SystemClock))
        .with_options(BatchOptions {
            delay,
            stage_runner: None,
        })
        .run(input_dir, template, output_base)
        .await
}

async fn multi_patient(
    input_dir: &Path,
    template: &Path,
    output_base: &Path,
    delay: Duration,
) -> i32 {
    info!(input_dir = %input_dir.display(), template = %template.display(), delay_secs = delay.as_secs(), "multi-patient");
    match run_batch(input_dir, template, output_base, delay).await {
        Ok(batch) => {
            print_batch(&batch);
            batch.exit_code()
        }
        Err(e) => {
            eprintln!("{}: {e}", e.kind().as_str());
            e.exit_code()
        }
    }
}

fn print_run(run: &PipelineRun) {
    let mode = if run.dry_run { " (dry run)" } else { "" };
    println!("subject {} run {}{mode}", run.subject, run.run_id);
    println!("{:<22} {:>10}  {:<16} STATE", "STAGE", "REPLICATES", "JOB");
    for stage in StageKind::ALL {
        let records: Vec<_> = run.records_for(stage).collect();
        if records.is_empty() {
            continue;
        }
        // array tasks are `<array id>_<index>`; show the array id
        let job = records
            .iter()
            .find_map(|r| r.job_id.as_ref())
            .map(|id| id.as_str().split('_').next().unwrap_or_default().to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut states: Vec<String> = Vec::new();
        for r in &records {
            let s = format!("{:?}", r.state);
            if !states.contains(&s) {
                states.push(s);
            }
        }
        let replicates = if stage.is_fan_out() {
            records.len().to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:<22} {:>10}  {:<16} {}",
            stage.as_str(),
            replicates,
            job,
            states.join(",")
        );
    }
    for stage in &run.preexisting_outputs {
        println!("warning: output of stage {stage} existed before this run and will be overwritten");
    }
    println!("status: {:?}", run.status);

    if let Some(err) = &run.error {
        eprintln!("subject {}: {err}", run.subject);
    } else if let Some(r) = run.first_failure().filter(|_| !run.status.is_success()) {
        eprintln!(
            "stage {} (subject {}) failed: {}",
            r.label(),
            r.subject,
            r.exit_code
                .map(|c| format!("StageFailure exit code {c}"))
                .or_else(|| r.last_error.clone())
                .unwrap_or_else(|| format!("{:?}", r.state))
        );
    }
}

fn print_batch(batch: &BatchRun) {
    println!(
        "batch {}: {} subject(s), {} succeeded, {} failed",
        batch.batch_id,
        batch.subjects.len(),
        batch.succeeded_count(),
        batch.failed_count()
    );
    println!("master log: {}", batch.master_log.display());
    for failed in batch.failed_subjects() {
        eprintln!(
            "failed: {} ({}) log: {}",
            failed.subject,
            failed.error.as_deref().unwrap_or("unknown error"),
            failed.log_path.display()
        );
    }
}
