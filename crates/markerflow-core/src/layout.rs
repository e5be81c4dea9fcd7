//! Output Layout Manager: canonical directory skeletons.
//!
//! ```text
//! {base}/{subject}/initial/
//!   ssm_filtered.txt
//!   bootstraps/bootstrap{1..N}/
//!   aggregation_results/
//!   markers/
//!   longitudinal/
//!   logs/
//! ```
//!
//! Paths are a pure function of (base, subject). Directory creation never
//! deletes or truncates anything, and "already exists" is reported, not
//! treated as an error.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use crate::domain::{PipelineError, StageKind, SubjectId};

pub const FILTERED_INPUT_FILE: &str = "ssm_filtered.txt";

/// Result of ensuring one directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirStatus {
    Created,
    AlreadyExisted,
}

/// Ensure `path` is a directory.
///
/// Safe under concurrent invocation: if another process creates the
/// directory between the check and the creation, `create_dir_all` still
/// succeeds.
pub fn ensure_dir(path: &Path) -> Result<DirStatus, PipelineError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(DirStatus::AlreadyExisted),
        Ok(_) => Err(PipelineError::validation(
            "directory (a non-directory is in the way)",
            path,
        )),
        Err(e) if e.kind() == IoErrorKind::NotFound => {
            std::fs::create_dir_all(path).map_err(|e| PipelineError::io(path, e))?;
            Ok(DirStatus::Created)
        }
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

fn has_content(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Canonical per-subject layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    base: PathBuf,
    subject: SubjectId,
}

impl OutputLayout {
    pub fn new(base: impl Into<PathBuf>, subject: SubjectId) -> Self {
        Self {
            base: base.into(),
            subject,
        }
    }

    pub fn subject(&self) -> &SubjectId {
        &self.subject
    }

    pub fn subject_dir(&self) -> PathBuf {
        self.base.join(self.subject.as_str())
    }

    pub fn initial_dir(&self) -> PathBuf {
        self.subject_dir().join("initial")
    }

    pub fn filtered_input(&self) -> PathBuf {
        self.initial_dir().join(FILTERED_INPUT_FILE)
    }

    pub fn bootstraps_dir(&self) -> PathBuf {
        self.initial_dir().join("bootstraps")
    }

    pub fn replicate_dir(&self, index: u32) -> PathBuf {
        self.bootstraps_dir().join(format!("bootstrap{index}"))
    }

    pub fn aggregation_dir(&self) -> PathBuf {
        self.initial_dir().join("aggregation_results")
    }

    pub fn markers_dir(&self) -> PathBuf {
        self.initial_dir().join("markers")
    }

    pub fn longitudinal_dir(&self) -> PathBuf {
        self.initial_dir().join("longitudinal")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.initial_dir().join("logs")
    }

    /// The directory a stage writes into.
    pub fn stage_output_dir(&self, stage: StageKind) -> PathBuf {
        match stage {
            StageKind::Resample | StageKind::Infer => self.bootstraps_dir(),
            StageKind::Aggregate => self.aggregation_dir(),
            StageKind::SelectMarkers => self.markers_dir(),
            StageKind::LongitudinalUpdate => self.longitudinal_dir(),
        }
    }

    /// Ensure the skeleton every stage relies on (`initial/` and `logs/`).
    pub fn ensure_base(&self) -> Result<Vec<(PathBuf, DirStatus)>, PipelineError> {
        [self.initial_dir(), self.logs_dir()]
            .into_iter()
            .map(|p| ensure_dir(&p).map(|s| (p, s)))
            .collect()
    }

    /// Ensure the directories `stage` writes into. For the resample stage
    /// this includes one subdirectory per replicate index.
    pub fn ensure_stage(
        &self,
        stage: StageKind,
        fan_out: u32,
    ) -> Result<Vec<(PathBuf, DirStatus)>, PipelineError> {
        let mut dirs = vec![self.stage_output_dir(stage)];
        if stage == StageKind::Resample {
            dirs.extend((1..=fan_out).map(|i| self.replicate_dir(i)));
        }
        dirs.into_iter()
            .map(|p| ensure_dir(&p).map(|s| (p, s)))
            .collect()
    }

    /// Does the stage's canonical output already hold content from an
    /// earlier run?
    pub fn has_existing_output(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::Resample => self.filtered_input().exists(),
            // replicate directories are pre-created, so look one level down
            StageKind::Infer => std::fs::read_dir(self.bootstraps_dir())
                .map(|entries| {
                    entries
                        .filter_map(Result::ok)
                        .any(|e| has_content(&e.path().join("chains")))
                })
                .unwrap_or(false),
            other => has_content(&self.stage_output_dir(other)),
        }
    }
}

/// Batch-level layout under one output base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLayout {
    output_base: PathBuf,
}

impl BatchLayout {
    pub fn new(output_base: impl Into<PathBuf>) -> Self {
        Self {
            output_base: output_base.into(),
        }
    }

    pub fn output_base(&self) -> &Path {
        &self.output_base
    }

    pub fn generated_configs_dir(&self) -> PathBuf {
        self.output_base.join("configs").join("generated")
    }

    pub fn patients_dir(&self) -> PathBuf {
        self.output_base.join("patients")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.output_base.join("logs")
    }

    pub fn subject_log(&self, subject: &SubjectId) -> PathBuf {
        self.logs_dir().join(format!("{subject}.log"))
    }

    pub fn subject_layout(&self, subject: SubjectId) -> OutputLayout {
        OutputLayout::new(self.patients_dir(), subject)
    }

    pub fn ensure(&self) -> Result<(), PipelineError> {
        for dir in [
            self.generated_configs_dir(),
            self.patients_dir(),
            self.logs_dir(),
        ] {
            ensure_dir(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(base: &Path) -> OutputLayout {
        OutputLayout::new(base, SubjectId::new("S1"))
    }

    #[test]
    fn canonical_paths() {
        let l = layout(Path::new("/out"));
        assert_eq!(l.filtered_input(), PathBuf::from("/out/S1/initial/ssm_filtered.txt"));
        assert_eq!(
            l.replicate_dir(4),
            PathBuf::from("/out/S1/initial/bootstraps/bootstrap4")
        );
        assert_eq!(
            l.aggregation_dir(),
            PathBuf::from("/out/S1/initial/aggregation_results")
        );
        assert_eq!(l.markers_dir(), PathBuf::from("/out/S1/initial/markers"));
        assert_eq!(l.logs_dir(), PathBuf::from("/out/S1/initial/logs"));
    }

    #[test]
    fn ensure_creates_then_reports_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let l = layout(tmp.path());

        let first = l.ensure_stage(StageKind::Resample, 3).unwrap();
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|(_, s)| *s == DirStatus::Created));
        assert!(l.replicate_dir(3).is_dir());

        let second = l.ensure_stage(StageKind::Resample, 3).unwrap();
        assert!(second.iter().all(|(_, s)| *s == DirStatus::AlreadyExisted));
    }

    #[test]
    fn ensure_never_touches_existing_content() {
        let tmp = tempfile::tempdir().unwrap();
        let l = layout(tmp.path());
        l.ensure_stage(StageKind::Aggregate, 1).unwrap();
        let marker = l.aggregation_dir().join("result.pkl");
        std::fs::write(&marker, b"keep me").unwrap();

        l.ensure_stage(StageKind::Aggregate, 1).unwrap();
        assert_eq!(std::fs::read(&marker).unwrap(), b"keep me");
        assert!(l.has_existing_output(StageKind::Aggregate));
        assert!(!l.has_existing_output(StageKind::SelectMarkers));
    }

    #[test]
    fn file_in_the_way_is_validation_error() {
        let tmp = tempfile::tempdir().unwrap();
        let l = layout(tmp.path());
        std::fs::create_dir_all(l.initial_dir()).unwrap();
        std::fs::write(l.logs_dir(), b"oops").unwrap();

        let err = l.ensure_base().unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
    }

    #[test]
    fn concurrent_ensure_is_safe() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().to_path_buf();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let base = base.clone();
                std::thread::spawn(move || layout(&base).ensure_stage(StageKind::Resample, 5))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_ok());
        }
        assert!(layout(&base).replicate_dir(5).is_dir());
    }

    #[test]
    fn batch_layout_paths() {
        let b = BatchLayout::new("/out");
        assert_eq!(b.generated_configs_dir(), PathBuf::from("/out/configs/generated"));
        assert_eq!(
            b.subject_layout(SubjectId::new("P7")).initial_dir(),
            PathBuf::from("/out/patients/P7/initial")
        );
        assert_eq!(b.subject_log(&SubjectId::new("P7")), PathBuf::from("/out/logs/P7.log"));
    }
}
