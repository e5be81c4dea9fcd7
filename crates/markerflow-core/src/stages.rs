//! Stage entry points: what a scheduler job actually runs.
//!
//! Each entry point validates its input paths, checks that its external
//! program exists under the code root, then runs the program and reports
//! its exit code. The scientific work happens entirely in those programs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::defaults;
use crate::domain::{PipelineError, StageKind};
use crate::layout::ensure_dir;

/// Interpreter used for the external programs unless overridden.
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Environment variable overriding the interpreter.
pub const INTERPRETER_ENV: &str = "MARKERFLOW_PYTHON";

/// Location of each stage's program relative to the code root.
pub fn script_relpath(stage: StageKind) -> &'static str {
    match stage {
        StageKind::Resample => "src/bootstrap/bootstrap.py",
        StageKind::Infer => "src/phylowgs/multievolve.py",
        StageKind::Aggregate => "src/aggregation/aggregate.py",
        StageKind::SelectMarkers => "src/markers/run_data_multi_sample.py",
        StageKind::LongitudinalUpdate => "src/longitudinal/longitudinal_update.py",
    }
}

pub fn script_path(stage: StageKind, code_dir: &Path) -> PathBuf {
    code_dir.join(script_relpath(stage))
}

/// The external program must exist before anything is run or submitted.
pub fn check_program(stage: StageKind, code_dir: &Path) -> Result<PathBuf, PipelineError> {
    let script = script_path(stage, code_dir);
    if !script.is_file() {
        return Err(PipelineError::configuration(format!(
            "program for stage {stage} not found at {}",
            script.display()
        )));
    }
    Ok(script)
}

fn require_file(what: &str, path: &Path) -> Result<(), PipelineError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PipelineError::validation(what, path))
    }
}

fn require_dir(what: &str, path: &Path) -> Result<(), PipelineError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(PipelineError::validation(what, path))
    }
}

/// Canonical sibling directory of `dir`, e.g. `initial/markers` next to
/// `initial/aggregation_results`.
fn sibling(dir: &Path, name: &str) -> PathBuf {
    dir.parent().unwrap_or(dir).join(name)
}

/// Written into a replicate directory once its inference exited 0.
pub const INFER_DONE_FILE: &str = "infer.done";

/// A replicate counts as completed only once its inference exited 0.
fn replicate_completed(dir: &Path) -> bool {
    dir.join(INFER_DONE_FILE).is_file()
}

fn path_arg(p: &Path) -> String {
    p.display().to_string()
}

/// Which replicate indices an aggregation reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicateSelection {
    /// `1..=N`
    Count(u32),
    /// An explicit index list.
    List(Vec<u32>),
}

impl ReplicateSelection {
    pub fn indices(&self) -> Vec<u32> {
        match self {
            ReplicateSelection::Count(n) => (1..=*n).collect(),
            ReplicateSelection::List(list) => list.clone(),
        }
    }
}

impl Default for ReplicateSelection {
    fn default() -> Self {
        ReplicateSelection::Count(defaults::NUM_BOOTSTRAPS)
    }
}

impl fmt::Display for ReplicateSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicateSelection::Count(n) => write!(f, "{n}"),
            ReplicateSelection::List(list) => {
                let parts: Vec<String> = list.iter().map(u32::to_string).collect();
                // zero or one index still needs a comma to read back as a list
                match parts.len() {
                    0 => f.write_str(","),
                    1 => write!(f, "{},", parts[0]),
                    _ => f.write_str(&parts.join(",")),
                }
            }
        }
    }
}

impl FromStr for ReplicateSelection {
    type Err = PipelineError;

    /// `N` means `1..=N`; anything with a comma is an explicit list.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PipelineError::Argument(format!("invalid replicate selection: {s:?}"));
        if s.contains(',') {
            let list = s
                .split(',')
                .filter(|p| !p.trim().is_empty())
                .map(|p| p.trim().parse::<u32>().ok().filter(|i| *i > 0))
                .collect::<Option<Vec<u32>>>()
                .ok_or_else(bad)?;
            Ok(ReplicateSelection::List(list))
        } else {
            let n = s.trim().parse::<u32>().map_err(|_| bad())?;
            if n == 0 {
                return Err(bad());
            }
            Ok(ReplicateSelection::Count(n))
        }
    }
}

/// One stage entry point invocation with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageInvocation {
    Resample {
        input: PathBuf,
        output_dir: PathBuf,
        code_dir: PathBuf,
        replicates: u32,
    },
    Infer {
        replicate_dir: PathBuf,
        code_dir: PathBuf,
        num_chains: u32,
    },
    Aggregate {
        subject: String,
        fanout_parent: PathBuf,
        output_dir: PathBuf,
        code_dir: PathBuf,
        replicates: ReplicateSelection,
    },
    SelectMarkers {
        subject: String,
        aggregation_dir: PathBuf,
        filtered_input: PathBuf,
        code_dir: PathBuf,
        read_depth: u32,
    },
    LongitudinalUpdate {
        subject: String,
        markers_dir: PathBuf,
        aggregation_dir: PathBuf,
        code_dir: PathBuf,
    },
}

impl StageInvocation {
    pub fn stage(&self) -> StageKind {
        match self {
            StageInvocation::Resample { .. } => StageKind::Resample,
            StageInvocation::Infer { .. } => StageKind::Infer,
            StageInvocation::Aggregate { .. } => StageKind::Aggregate,
            StageInvocation::SelectMarkers { .. } => StageKind::SelectMarkers,
            StageInvocation::LongitudinalUpdate { .. } => StageKind::LongitudinalUpdate,
        }
    }

    pub fn code_dir(&self) -> &Path {
        match self {
            StageInvocation::Resample { code_dir, .. }
            | StageInvocation::Infer { code_dir, .. }
            | StageInvocation::Aggregate { code_dir, .. }
            | StageInvocation::SelectMarkers { code_dir, .. }
            | StageInvocation::LongitudinalUpdate { code_dir, .. } => code_dir,
        }
    }

    /// Subject named in diagnostics.
    pub fn subject(&self) -> Option<&str> {
        match self {
            StageInvocation::Aggregate { subject, .. }
            | StageInvocation::SelectMarkers { subject, .. }
            | StageInvocation::LongitudinalUpdate { subject, .. } => Some(subject),
            StageInvocation::Resample { .. } | StageInvocation::Infer { .. } => None,
        }
    }

    /// Check every input path and the external program.
    pub fn validate(&self) -> Result<PathBuf, PipelineError> {
        require_dir("code directory", self.code_dir())?;
        match self {
            StageInvocation::Resample {
                input, replicates, ..
            } => {
                require_file("input file", input)?;
                if *replicates == 0 {
                    return Err(PipelineError::Argument(
                        "replicate count must be at least 1".into(),
                    ));
                }
            }
            StageInvocation::Infer {
                replicate_dir,
                num_chains,
                ..
            } => {
                require_dir("replicate directory", replicate_dir)?;
                // resampling may have produced this replicate's directory but not its data
                require_file("replicate input", &replicate_dir.join("ssm.txt"))?;
                if *num_chains == 0 {
                    return Err(PipelineError::Argument(
                        "chain count must be at least 1".into(),
                    ));
                }
            }
            StageInvocation::Aggregate { fanout_parent, .. } => {
                require_dir("fan-out parent directory", fanout_parent)?;
            }
            StageInvocation::SelectMarkers {
                aggregation_dir,
                filtered_input,
                ..
            } => {
                require_dir("aggregation directory", aggregation_dir)?;
                require_file("filtered input file", filtered_input)?;
            }
            StageInvocation::LongitudinalUpdate {
                markers_dir,
                aggregation_dir,
                ..
            } => {
                require_dir("markers directory", markers_dir)?;
                require_dir("aggregation directory", aggregation_dir)?;
            }
        }
        check_program(self.stage(), self.code_dir())
    }

    /// Directory the program writes into, created before it runs.
    fn output_dir(&self) -> Option<PathBuf> {
        match self {
            StageInvocation::Resample { output_dir, .. }
            | StageInvocation::Aggregate { output_dir, .. } => Some(output_dir.clone()),
            StageInvocation::SelectMarkers {
                aggregation_dir, ..
            } => Some(sibling(aggregation_dir, "markers")),
            StageInvocation::Infer { replicate_dir, .. } => Some(replicate_dir.join("chains")),
            StageInvocation::LongitudinalUpdate { markers_dir, .. } => {
                Some(sibling(markers_dir, "longitudinal"))
            }
        }
    }

    /// Arguments passed to the external program (after the script path).
    pub fn program_args(&self) -> Vec<String> {
        match self {
            StageInvocation::Resample {
                input,
                output_dir,
                replicates,
                ..
            } => vec![
                "-i".to_string(),
                path_arg(input),
                "-o".to_string(),
                path_arg(output_dir),
                "-n".to_string(),
                replicates.to_string(),
            ],
            StageInvocation::Infer {
                replicate_dir,
                num_chains,
                ..
            } => vec![
                "--num-chains".to_string(),
                num_chains.to_string(),
                "--ssms".to_string(),
                path_arg(&replicate_dir.join("ssm.txt")),
                "--cnvs".to_string(),
                path_arg(&replicate_dir.join("cnv.txt")),
                "-O".to_string(),
                path_arg(&replicate_dir.join("chains")),
            ],
            StageInvocation::Aggregate {
                subject,
                fanout_parent,
                output_dir,
                replicates,
                ..
            } => {
                let mut args = vec![subject.clone(), "--bootstrap-dirs".to_string()];
                for i in replicates.indices() {
                    let dir = fanout_parent.join(format!("bootstrap{i}"));
                    if replicate_completed(&dir) {
                        args.push(path_arg(&dir));
                    } else {
                        warn!(stage = "aggregate", replicate = i, "replicate has no inference output, skipped");
                    }
                }
                args.push("-o".to_string());
                args.push(path_arg(output_dir));
                args
            }
            StageInvocation::SelectMarkers {
                subject,
                aggregation_dir,
                filtered_input,
                read_depth,
                ..
            } => vec![
                subject.clone(),
                "-r".to_string(),
                read_depth.to_string(),
                "-a".to_string(),
                path_arg(aggregation_dir),
                "-s".to_string(),
                path_arg(filtered_input),
                "-o".to_string(),
                path_arg(&sibling(aggregation_dir, "markers")),
            ],
            StageInvocation::LongitudinalUpdate {
                subject,
                markers_dir,
                aggregation_dir,
                ..
            } => vec![
                subject.clone(),
                "-m".to_string(),
                path_arg(markers_dir),
                "-a".to_string(),
                path_arg(aggregation_dir),
                "-o".to_string(),
                path_arg(&sibling(markers_dir, "longitudinal")),
            ],
        }
    }
}

/// Interpreter from the environment, or the default.
pub fn interpreter_from_env() -> String {
    std::env::var(INTERPRETER_ENV).unwrap_or_else(|_| DEFAULT_INTERPRETER.to_string())
}

/// Validate and run one stage. A nonzero exit becomes `StageFailure`
/// carrying the program's exit code verbatim.
pub async fn run_stage(
    invocation: &StageInvocation,
    interpreter: &str,
) -> Result<(), PipelineError> {
    let stage = invocation.stage();
    let script = invocation.validate()?;
    if let Some(out) = invocation.output_dir() {
        ensure_dir(&out)?;
    }
    let done_marker = match invocation {
        StageInvocation::Infer { replicate_dir, .. } => Some(replicate_dir.join(INFER_DONE_FILE)),
        _ => None,
    };
    if let Some(marker) = &done_marker {
        // a marker left by an earlier run must not vouch for this one
        if let Err(e) = tokio::fs::remove_file(marker).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(PipelineError::io(marker, e));
            }
        }
    }

    let args = invocation.program_args();
    info!(%stage, subject = invocation.subject().unwrap_or("-"), script = %script.display(), "running stage program");

    let status = Command::new(interpreter)
        .arg(&script)
        .args(&args)
        .status()
        .await
        .map_err(|e| {
            PipelineError::configuration(format!(
                "cannot start `{interpreter}` for stage {stage}: {e}"
            ))
        })?;

    match status.code() {
        Some(0) => {
            if let Some(marker) = &done_marker {
                tokio::fs::write(marker, b"")
                    .await
                    .map_err(|e| PipelineError::io(marker, e))?;
            }
            Ok(())
        }
        // killed by a signal
        None => Err(PipelineError::StageFailure {
            stage,
            exit_code: 1,
        }),
        Some(code) => Err(PipelineError::StageFailure {
            stage,
            exit_code: code,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn code_dir_with(stage: StageKind, body: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let script = script_path(stage, dir.path());
        std::fs::create_dir_all(script.parent().unwrap()).unwrap();
        std::fs::write(&script, body).unwrap();
        dir
    }

    #[rstest]
    #[case("4", ReplicateSelection::Count(4), vec![1, 2, 3, 4])]
    #[case("1,4", ReplicateSelection::List(vec![1, 4]), vec![1, 4])]
    #[case("3,", ReplicateSelection::List(vec![3]), vec![3])]
    #[case(",", ReplicateSelection::List(vec![]), vec![])]
    fn parses_replicate_selection(
        #[case] input: &str,
        #[case] expected: ReplicateSelection,
        #[case] indices: Vec<u32>,
    ) {
        let sel: ReplicateSelection = input.parse().unwrap();
        assert_eq!(sel, expected);
        assert_eq!(sel.indices(), indices);
        assert_eq!(sel.to_string().parse::<ReplicateSelection>().unwrap(), sel);
    }

    #[rstest]
    #[case("0")]
    #[case("-1")]
    #[case("a,b")]
    #[case("1,0")]
    fn rejects_bad_selection(#[case] input: &str) {
        assert!(matches!(
            input.parse::<ReplicateSelection>(),
            Err(PipelineError::Argument(_))
        ));
    }

    #[test]
    fn missing_input_is_validation_error() {
        let code = code_dir_with(StageKind::Resample, "exit 0\n");
        let inv = StageInvocation::Resample {
            input: code.path().join("nope.txt"),
            output_dir: code.path().join("out"),
            code_dir: code.path().to_path_buf(),
            replicates: 10,
        };
        assert!(matches!(
            inv.validate(),
            Err(PipelineError::Validation { .. })
        ));
    }

    #[test]
    fn missing_program_is_configuration_error() {
        let code = tempfile::tempdir().unwrap();
        let input = code.path().join("in.txt");
        std::fs::write(&input, "id\tgene\ta\td\n").unwrap();
        let inv = StageInvocation::Resample {
            input,
            output_dir: code.path().join("out"),
            code_dir: code.path().to_path_buf(),
            replicates: 10,
        };
        assert!(matches!(
            inv.validate(),
            Err(PipelineError::Configuration { .. })
        ));
    }

    #[test]
    fn aggregate_args_list_only_completed_replicates() {
        let tmp = tempfile::tempdir().unwrap();
        let parent = tmp.path().join("bootstraps");
        for i in 1..=4 {
            std::fs::create_dir_all(parent.join(format!("bootstrap{i}/chains"))).unwrap();
        }
        // bootstrap2 crashed mid-run: chain output but no completion marker
        std::fs::write(parent.join("bootstrap2/chains/chain_0"), b"x").unwrap();
        for i in [1, 4] {
            std::fs::write(parent.join(format!("bootstrap{i}/chains/trees.zip")), b"x").unwrap();
            std::fs::write(parent.join(format!("bootstrap{i}/{INFER_DONE_FILE}")), b"").unwrap();
        }
        let inv = StageInvocation::Aggregate {
            subject: "S1".into(),
            fanout_parent: parent.clone(),
            output_dir: tmp.path().join("agg"),
            code_dir: tmp.path().to_path_buf(),
            replicates: ReplicateSelection::Count(4),
        };
        let args = inv.program_args();
        assert_eq!(args[0], "S1");
        assert!(args.contains(&path_arg(&parent.join("bootstrap1"))));
        assert!(args.contains(&path_arg(&parent.join("bootstrap4"))));
        assert!(!args.contains(&path_arg(&parent.join("bootstrap2"))));
        assert!(!args.contains(&path_arg(&parent.join("bootstrap3"))));
    }

    #[test]
    fn resample_args_follow_the_program_contract() {
        let inv = StageInvocation::Resample {
            input: PathBuf::from("/in/S1.txt"),
            output_dir: PathBuf::from("/out/bootstraps"),
            code_dir: PathBuf::from("/code"),
            replicates: 4,
        };
        assert_eq!(
            inv.program_args(),
            vec!["-i", "/in/S1.txt", "-o", "/out/bootstraps", "-n", "4"]
        );
    }

    #[test]
    fn infer_requires_its_own_replicate_input() {
        let code = code_dir_with(StageKind::Infer, "exit 0\n");
        let replicate = code.path().join("bootstrap3");
        std::fs::create_dir_all(&replicate).unwrap();
        let inv = StageInvocation::Infer {
            replicate_dir: replicate.clone(),
            code_dir: code.path().to_path_buf(),
            num_chains: 5,
        };
        let err = inv.validate().unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
        assert_eq!(err.exit_code(), 1);

        std::fs::write(replicate.join("ssm.txt"), "id\tgene\n").unwrap();
        inv.validate().unwrap();
    }

    #[tokio::test]
    async fn successful_inference_marks_the_replicate_done() {
        let code = code_dir_with(StageKind::Infer, "exit 0\n");
        let replicate = code.path().join("bootstrap1");
        std::fs::create_dir_all(&replicate).unwrap();
        std::fs::write(replicate.join("ssm.txt"), "id\tgene\n").unwrap();
        let inv = StageInvocation::Infer {
            replicate_dir: replicate.clone(),
            code_dir: code.path().to_path_buf(),
            num_chains: 5,
        };
        run_stage(&inv, "sh").await.unwrap();
        assert!(replicate_completed(&replicate));
    }

    #[tokio::test]
    async fn failed_inference_clears_a_stale_marker() {
        let code = code_dir_with(StageKind::Infer, "exit 2\n");
        let replicate = code.path().join("bootstrap1");
        std::fs::create_dir_all(&replicate).unwrap();
        std::fs::write(replicate.join("ssm.txt"), "id\tgene\n").unwrap();
        std::fs::write(replicate.join(INFER_DONE_FILE), b"").unwrap();
        let inv = StageInvocation::Infer {
            replicate_dir: replicate.clone(),
            code_dir: code.path().to_path_buf(),
            num_chains: 5,
        };
        run_stage(&inv, "sh").await.unwrap_err();
        assert!(!replicate_completed(&replicate));
    }

    #[tokio::test]
    async fn nonzero_exit_is_propagated_verbatim() {
        let code = code_dir_with(StageKind::Infer, "exit 3\n");
        let replicate = code.path().join("bootstrap1");
        std::fs::create_dir_all(&replicate).unwrap();
        std::fs::write(replicate.join("ssm.txt"), "id\tgene\n").unwrap();
        let inv = StageInvocation::Infer {
            replicate_dir: replicate,
            code_dir: code.path().to_path_buf(),
            num_chains: 5,
        };
        let err = run_stage(&inv, "sh").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StageFailure {
                stage: StageKind::Infer,
                exit_code: 3
            }
        ));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        let code = code_dir_with(StageKind::Aggregate, "exit 0\n");
        let parent = code.path().join("bootstraps");
        std::fs::create_dir_all(&parent).unwrap();
        let inv = StageInvocation::Aggregate {
            subject: "S1".into(),
            fanout_parent: parent,
            output_dir: code.path().join("aggregation_results"),
            code_dir: code.path().to_path_buf(),
            replicates: ReplicateSelection::Count(2),
        };
        run_stage(&inv, "sh").await.unwrap();
        assert!(code.path().join("aggregation_results").is_dir());
    }
}
