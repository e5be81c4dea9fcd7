//! SLURM scheduler: `sbatch` for submission, `sacct` for snapshots.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::domain::{
    DependencyKind, JobSnapshot, Observation, REPLICATE_PLACEHOLDER, SchedulerError, SchedulerJobId,
    SubmitRequest,
};
use crate::ports::Scheduler;

/// Array task variable substituted for the replicate placeholder.
const ARRAY_TASK_VAR: &str = "\"${SLURM_ARRAY_TASK_ID}\"";

/// stderr fragments that mean "try again later".
const TRANSIENT_MARKERS: &[&str] = &[
    "Unable to contact slurm controller",
    "Socket timed out",
    "temporarily unavailable",
    "Try again",
    "slurm_load_jobs error",
];

pub struct SlurmScheduler {
    sbatch: String,
    sacct: String,
}

impl SlurmScheduler {
    pub fn new(sbatch: impl Into<String>, sacct: impl Into<String>) -> Self {
        Self {
            sbatch: sbatch.into(),
            sacct: sacct.into(),
        }
    }
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote one argument; the replicate placeholder becomes the array task id.
fn shell_word(arg: &str) -> String {
    arg.split(REPLICATE_PLACEHOLDER)
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(ARRAY_TASK_VAR)
}

/// Shell script passed to `sbatch --wrap`.
pub fn wrap_script(request: &SubmitRequest) -> String {
    let mut lines = vec!["set -eo pipefail".to_string()];
    for module in &request.resources.modules {
        lines.push(format!("module load {}", shell_quote(module)));
    }
    if !request.resources.conda_env.is_empty() {
        let env = shell_quote(&request.resources.conda_env);
        lines.push(format!(
            "source activate {env} 2>/dev/null || conda activate {env}"
        ));
    }

    let mut words = vec![shell_word(&request.command.program.display().to_string())];
    words.extend(request.command.args.iter().map(|a| shell_word(a)));
    lines.push(words.join(" "));
    lines.join("\n")
}

/// `sbatch` argument list for one request.
pub fn sbatch_args(request: &SubmitRequest) -> Vec<String> {
    let stage = request.stage.as_str();
    let log_pattern = if request.array.is_some() {
        format!("{stage}_%A_%a")
    } else {
        format!("{stage}_%j")
    };
    let log_dir = request.log_dir.display();

    let mut args = vec![
        "--parsable".to_string(),
        format!("--job-name={}", request.job_name),
        format!("--partition={}", request.resources.partition),
        format!("--cpus-per-task={}", request.resources.cpus),
        format!("--mem={}", request.resources.memory),
        format!("--time={}", request.resources.walltime),
        format!("--output={log_dir}/{log_pattern}.out"),
        format!("--error={log_dir}/{log_pattern}.err"),
    ];
    if let Some(array) = &request.array {
        args.push(format!("--array={}", array.to_range_expr()));
    }
    if let Some(dependency) = &request.dependency {
        args.push(format!("--dependency={dependency}"));
        // an afterok that can never be satisfied should not sit in the queue
        if request
            .edges
            .iter()
            .any(|e| e.kind == DependencyKind::StrictSuccess)
        {
            args.push("--kill-on-invalid-dep=yes".to_string());
        }
    }
    args.push(format!("--wrap={}", wrap_script(request)));
    args
}

/// Job id from `sbatch --parsable` (`123` or `123;cluster`) or classic
/// `Submitted batch job 123` output.
pub fn parse_job_id(stdout: &str) -> Result<SchedulerJobId, SchedulerError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| SchedulerError::Parse(stdout.to_string()))?;

    let candidate = match line.strip_prefix("Submitted batch job ") {
        Some(rest) => rest.trim(),
        None => line.split(';').next().unwrap_or_default().trim(),
    };

    if !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit()) {
        Ok(SchedulerJobId::new(candidate))
    } else {
        Err(SchedulerError::Parse(stdout.to_string()))
    }
}

/// Transient or permanent, judged from stderr.
pub fn classify_failure(stderr: &str) -> SchedulerError {
    let message = stderr.trim().to_string();
    if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        SchedulerError::Transient(message)
    } else {
        SchedulerError::Rejected(message)
    }
}

fn observation_of(state: &str, exit_code: &str) -> Observation {
    // "CANCELLED by 1234" -> "CANCELLED"
    let state = state.split_whitespace().next().unwrap_or_default();
    let exit_code = exit_code
        .split(':')
        .next()
        .and_then(|c| c.parse::<i32>().ok());
    match state {
        "PENDING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => Observation::Pending,
        "RUNNING" | "COMPLETING" => Observation::Running,
        "COMPLETED" => Observation::Succeeded,
        "FAILED" | "CANCELLED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" | "BOOT_FAIL"
        | "DEADLINE" | "PREEMPTED" => Observation::Failed { exit_code },
        _ => Observation::Unknown,
    }
}

/// Task ids named by one `sacct` JobID field. Pending array tasks are
/// collapsed as `100_[3-5,8%10]`; everything else names itself.
fn task_ids(field: &str) -> Vec<SchedulerJobId> {
    let Some((base, rest)) = field.split_once("_[") else {
        return vec![SchedulerJobId::new(field)];
    };
    let base = SchedulerJobId::new(base);
    let list = rest.trim_end_matches(']');
    let list = list.split('%').next().unwrap_or_default();

    let mut ids = Vec::new();
    for part in list.split(',') {
        let bounds = match part.split_once('-') {
            Some((lo, hi)) => lo.parse::<u32>().ok().zip(hi.parse::<u32>().ok()),
            None => part.parse::<u32>().ok().map(|i| (i, i)),
        };
        if let Some((lo, hi)) = bounds {
            ids.extend((lo..=hi).map(|i| base.array_task(i)));
        }
    }
    ids
}

/// Snapshot from `sacct -n -P -X -o JobID,State,ExitCode` output. A query on
/// an array's base id lists one line per task.
pub fn parse_sacct(stdout: &str) -> JobSnapshot {
    let mut snapshot = JobSnapshot::new();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.trim().split('|').collect();
        if fields.len() < 3 || fields[0].is_empty() {
            continue;
        }
        let observation = observation_of(fields[1], fields[2]);
        for id in task_ids(fields[0]) {
            snapshot.insert(id, observation);
        }
    }
    snapshot
}

#[async_trait]
impl Scheduler for SlurmScheduler {
    async fn submit(&self, request: &SubmitRequest) -> Result<SchedulerJobId, SchedulerError> {
        let args = sbatch_args(request);
        trace!(command = %self.sbatch, ?args, "running sbatch");

        let output = Command::new(&self.sbatch)
            .args(&args)
            .output()
            .await
            .map_err(|source| SchedulerError::Io {
                command: self.sbatch.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(classify_failure(&stderr));
        }
        let id = parse_job_id(&stdout)?;
        debug!(job_id = %id, job_name = %request.job_name, "sbatch accepted job");
        Ok(id)
    }

    async fn observe(&self, job_id: &SchedulerJobId) -> JobSnapshot {
        let output = Command::new(&self.sacct)
            .args([
                "-n",
                "-P",
                "-X",
                "-j",
                job_id.as_str(),
                "-o",
                "JobID,State,ExitCode",
            ])
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                let snapshot = parse_sacct(&String::from_utf8_lossy(&out.stdout));
                trace!(%job_id, entries = snapshot.len(), "sacct snapshot");
                snapshot
            }
            Ok(out) => {
                warn!(
                    %job_id,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "sacct failed; state unknown"
                );
                JobSnapshot::new()
            }
            Err(e) => {
                warn!(%job_id, error = %e, "could not run sacct; state unknown");
                JobSnapshot::new()
            }
        }
    }

    fn name(&self) -> &'static str {
        "slurm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ArraySpec, DependencyEdge, Resources, StageCommand, StageKind, SubjectId,
    };
    use rstest::rstest;

    fn request() -> SubmitRequest {
        SubmitRequest {
            subject: SubjectId::new("S1"),
            stage: StageKind::Infer,
            job_name: "S1_infer".into(),
            resources: Resources {
                partition: "pool1".into(),
                cpus: 4,
                memory: "16G".into(),
                walltime: "1-00:00:00".into(),
                conda_env: "phylowgs".into(),
                modules: vec!["gcc/12".into()],
            },
            command: StageCommand::new(
                "/opt/markerflow",
                vec![
                    "infer-stage".into(),
                    "/out/S1/initial/bootstraps/bootstrap{replicate}".into(),
                    "/code".into(),
                    "5".into(),
                ],
            ),
            array: Some(ArraySpec {
                indices: vec![1, 2, 3, 4],
                parallel_limit: Some(10),
            }),
            edges: vec![DependencyEdge::strict(vec![SchedulerJobId::new("77")])],
            dependency: Some("afterok:77".into()),
            output_dir: "/out/S1/initial/bootstraps".into(),
            log_dir: "/out/S1/initial/logs".into(),
        }
    }

    #[test]
    fn sbatch_args_carry_resources_array_and_dependency() {
        let args = sbatch_args(&request());
        assert_eq!(args[0], "--parsable");
        assert!(args.contains(&"--job-name=S1_infer".to_string()));
        assert!(args.contains(&"--cpus-per-task=4".to_string()));
        assert!(args.contains(&"--mem=16G".to_string()));
        assert!(args.contains(&"--time=1-00:00:00".to_string()));
        assert!(args.contains(&"--array=1-4%10".to_string()));
        assert!(args.contains(&"--dependency=afterok:77".to_string()));
        assert!(args.contains(&"--kill-on-invalid-dep=yes".to_string()));
        assert!(args.contains(&"--output=/out/S1/initial/logs/infer_%A_%a.out".to_string()));
        assert!(args.last().unwrap().starts_with("--wrap="));
    }

    #[test]
    fn any_completion_does_not_kill_on_invalid_dep() {
        let mut req = request();
        req.stage = StageKind::Aggregate;
        req.array = None;
        req.edges = vec![DependencyEdge::any_completion(vec![SchedulerJobId::new("78")])];
        req.dependency = Some("afterany:78".into());
        let args = sbatch_args(&req);
        assert!(!args.iter().any(|a| a.starts_with("--kill-on-invalid-dep")));
        assert!(args.contains(&"--output=/out/S1/initial/logs/aggregate_%j.out".to_string()));
    }

    #[test]
    fn wrap_script_expands_array_index() {
        let script = wrap_script(&request());
        assert!(script.contains("module load 'gcc/12'"));
        assert!(script.contains("source activate 'phylowgs'"));
        assert!(script.contains(
            "'/out/S1/initial/bootstraps/bootstrap'\"${SLURM_ARRAY_TASK_ID}\"''"
        ));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[rstest]
    #[case("12345\n", "12345")]
    #[case("12345;cluster1\n", "12345")]
    #[case("Submitted batch job 987\n", "987")]
    #[case("\n  42  \n", "42")]
    fn parses_job_ids(#[case] stdout: &str, #[case] expected: &str) {
        assert_eq!(parse_job_id(stdout).unwrap().as_str(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("sbatch: error: something\n")]
    fn rejects_unparseable_output(#[case] stdout: &str) {
        assert!(matches!(parse_job_id(stdout), Err(SchedulerError::Parse(_))));
    }

    #[rstest]
    #[case("sbatch: error: Batch job submission failed: Unable to contact slurm controller (connect failure)", true)]
    #[case("sbatch: error: Socket timed out on send/recv operation", true)]
    #[case("sbatch: error: Batch job submission failed: Invalid partition name specified", false)]
    fn classifies_failures(#[case] stderr: &str, #[case] transient: bool) {
        assert_eq!(classify_failure(stderr).is_transient(), transient);
    }

    #[rstest]
    #[case("100_2|COMPLETED|0:0", Observation::Succeeded)]
    #[case("100_2|RUNNING|0:0", Observation::Running)]
    #[case("100_2|PENDING|0:0", Observation::Pending)]
    #[case("100_2|FAILED|3:0", Observation::Failed { exit_code: Some(3) })]
    #[case("100_2|CANCELLED by 501|0:15", Observation::Failed { exit_code: Some(0) })]
    #[case("100_3|FAILED|3:0", Observation::Unknown)]
    #[case("100_2|BOGUS|0:0", Observation::Unknown)]
    fn parses_sacct_lines(#[case] stdout: &str, #[case] expected: Observation) {
        assert_eq!(parse_sacct(stdout).get(&SchedulerJobId::new("100_2")), expected);
    }

    #[test]
    fn one_array_query_covers_every_task() {
        let stdout = "100_1|COMPLETED|0:0\n\
                      100_2|FAILED|2:0\n\
                      100_3|RUNNING|0:0\n\
                      100_[4-5,7%10]|PENDING|0:0\n";
        let snapshot = parse_sacct(stdout);
        let task = |i| SchedulerJobId::new("100").array_task(i);

        assert_eq!(snapshot.len(), 6);
        assert_eq!(snapshot.get(&task(1)), Observation::Succeeded);
        assert_eq!(snapshot.get(&task(2)), Observation::Failed { exit_code: Some(2) });
        assert_eq!(snapshot.get(&task(3)), Observation::Running);
        assert_eq!(snapshot.get(&task(4)), Observation::Pending);
        assert_eq!(snapshot.get(&task(5)), Observation::Pending);
        assert_eq!(snapshot.get(&task(6)), Observation::Unknown);
        assert_eq!(snapshot.get(&task(7)), Observation::Pending);
    }
}
