//! Per-subject configuration materialized from a batch template.

use std::path::{Path, PathBuf};

use super::PipelineConfig;
use crate::domain::SubjectId;

/// Concrete config for one subject: the template with subject id, input path
/// and output directory substituted. Everything else is inherited.
pub fn materialize(
    template: &PipelineConfig,
    subject: &SubjectId,
    input: &Path,
    base_dir: &Path,
) -> PipelineConfig {
    let mut cfg = template.clone();
    cfg.patient_id = Some(subject.as_str().to_string());
    cfg.input.ssm_file = Some(input.to_path_buf());
    cfg.output.base_dir = Some(base_dir.to_path_buf());
    cfg
}

/// Where the generated config of `subject` lives under a batch output base.
pub fn generated_config_path(output_base: &Path, subject: &SubjectId) -> PathBuf {
    output_base
        .join("configs")
        .join("generated")
        .join(format!("{subject}_config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_subject_fields_and_keeps_the_rest() {
        let template = PipelineConfig::from_yaml(
            r#"
patient_id: TEMPLATE
input:
  code_dir: /opt/code
bootstrap:
  num_bootstraps: 20
"#,
        )
        .unwrap();

        let cfg = materialize(
            &template,
            &SubjectId::new("CRUK0042"),
            Path::new("/in/CRUK0042_subset.txt"),
            Path::new("/out/patients"),
        );

        assert_eq!(cfg.patient_id.as_deref(), Some("CRUK0042"));
        assert_eq!(
            cfg.input.ssm_file.as_deref(),
            Some(Path::new("/in/CRUK0042_subset.txt"))
        );
        assert_eq!(cfg.input.code_dir.as_deref(), Some(Path::new("/opt/code")));
        assert_eq!(cfg.output.base_dir.as_deref(), Some(Path::new("/out/patients")));
        assert_eq!(cfg.bootstrap.num_bootstraps, Some(20));
        // template is untouched
        assert_eq!(template.patient_id.as_deref(), Some("TEMPLATE"));
    }

    #[test]
    fn generated_path_layout() {
        let p = generated_config_path(Path::new("/out"), &SubjectId::new("S1"));
        assert_eq!(p, PathBuf::from("/out/configs/generated/S1_config.yaml"));
    }
}
