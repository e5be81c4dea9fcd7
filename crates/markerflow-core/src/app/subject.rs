//! Subject discovery for batch runs.

use std::path::{Path, PathBuf};

use crate::domain::{PipelineError, SubjectId};

/// Accepted input file extensions.
pub const INPUT_EXTENSIONS: &[&str] = &["txt", "tsv"];

/// Suffixes stripped from the file stem, in order, to get the subject id.
pub const KNOWN_SUFFIXES: &[&str] = &["_subset", "_ssm", "_filtered", "_input"];

/// Subject id for an input file: the file stem minus known suffixes.
///
/// `CRUK0001_subset.txt` -> `CRUK0001`, `P7_ssm_filtered.tsv` -> `P7`.
pub fn subject_id_for(path: &Path) -> Option<SubjectId> {
    let mut stem = path.file_stem()?.to_str()?;
    loop {
        match KNOWN_SUFFIXES.iter().find_map(|s| stem.strip_suffix(s)) {
            Some(rest) if !rest.is_empty() => stem = rest,
            _ => break,
        }
    }
    (!stem.is_empty()).then(|| SubjectId::new(stem))
}

fn is_input_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_none_or(|n| n.starts_with('.'));
    let ext_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| INPUT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
    !hidden && ext_ok && path.is_file()
}

/// Input files of a batch directory, sorted by name.
pub fn discover_inputs(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if !dir.is_dir() {
        return Err(PipelineError::validation("input directory", dir));
    }
    let mut inputs: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| PipelineError::io(dir, e))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| is_input_file(p))
        .collect();
    inputs.sort();
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/in/CRUK0001_subset.txt", Some("CRUK0001"))]
    #[case("/in/P7_ssm_filtered.tsv", Some("P7"))]
    #[case("/in/patient_3.txt", Some("patient_3"))]
    #[case("/in/S1_input.txt", Some("S1"))]
    #[case("/in/_subset.txt", Some("_subset"))]
    fn derives_subject_ids(#[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(
            subject_id_for(Path::new(path)),
            expected.map(SubjectId::new)
        );
    }

    #[test]
    fn discovers_only_input_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b_subset.txt", "a.tsv", ".hidden.txt", "notes.md", "c.TXT"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        std::fs::create_dir(dir.path().join("d.txt")).unwrap();

        let found: Vec<String> = discover_inputs(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(found, vec!["a.tsv", "b_subset.txt", "c.TXT"]);
    }

    #[test]
    fn missing_directory_is_validation_error() {
        assert!(matches!(
            discover_inputs(Path::new("/no/such/dir")),
            Err(PipelineError::Validation { .. })
        ));
    }
}
