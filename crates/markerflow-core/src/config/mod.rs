//! Configuration document (YAML).
//!
//! Fields are kept as `Option` so that "omitted" stays distinguishable from
//! "given"; defaults are applied only by the resolver through [`defaults`].
//! Unknown keys are ignored.

pub mod defaults;
pub mod template;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::domain::PipelineError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,

    #[serde(default)]
    pub input: InputConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    #[serde(default)]
    pub phylowgs: PhylowgsConfig,

    #[serde(default)]
    pub marker_selection: MarkerSelectionConfig,

    #[serde(default)]
    pub longitudinal: LongitudinalConfig,

    /// Per-stage resources, keyed by section name (`bootstrap`, `phylowgs`, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hpc: BTreeMap<String, HpcStageConfig>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Binary run by every scheduler job (defaults to the current executable).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_runner: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssm_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_bootstraps: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhylowgsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_chains: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkerSelectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_depth: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LongitudinalConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HpcStageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus_per_task: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walltime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conda_env: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbatch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sacct: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_submit_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_base_secs: Option<u64>,
}

impl PipelineConfig {
    pub fn from_yaml(text: &str) -> Result<Self, PipelineError> {
        serde_yaml::from_str(text)
            .map_err(|e| PipelineError::configuration(format!("invalid YAML: {e}")))
    }

    /// Read and parse a configuration file.
    ///
    /// A missing file is a ValidationError, a malformed one a ConfigurationError.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        if !path.is_file() {
            return Err(PipelineError::validation("configuration file", path));
        }
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        serde_yaml::from_str(&text).map_err(|e| {
            PipelineError::configuration(format!("{}: invalid YAML: {e}", path.display()))
        })
    }

    pub fn to_yaml(&self) -> Result<String, PipelineError> {
        serde_yaml::to_string(self)
            .map_err(|e| PipelineError::configuration(format!("cannot serialize config: {e}")))
    }

    /// Write the document to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        std::fs::write(path, self.to_yaml()?).map_err(|e| PipelineError::io(path, e))
    }

    pub fn hpc_for(&self, section: &str) -> Option<&HpcStageConfig> {
        self.hpc.get(section)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
patient_id: CRUK0001
input:
  ssm_file: /data/CRUK0001_subset.txt
  code_dir: /opt/code
output:
  base_dir: /scratch/out
bootstrap:
  num_bootstraps: 50
hpc:
  marker_selection:
    partition: gpu
    memory: 32G
    modules: [gurobi/10.0]
something_unknown: true
"#;

    #[test]
    fn parses_sample_document() {
        let cfg = PipelineConfig::from_yaml(SAMPLE).expect("parse");
        assert_eq!(cfg.patient_id.as_deref(), Some("CRUK0001"));
        assert_eq!(cfg.bootstrap.num_bootstraps, Some(50));
        assert_eq!(cfg.marker_selection.read_depth, None);
        let ms = cfg.hpc_for("marker_selection").expect("section");
        assert_eq!(ms.partition.as_deref(), Some("gpu"));
        assert_eq!(ms.modules, vec!["gurobi/10.0".to_string()]);
        assert!(!cfg.longitudinal.enabled);
    }

    #[test]
    fn empty_document_is_all_defaults() {
        let cfg = PipelineConfig::from_yaml("{}").expect("parse");
        assert_eq!(cfg, PipelineConfig::default());
    }

    #[test]
    fn malformed_yaml_is_configuration_error() {
        let err = PipelineConfig::from_yaml("bootstrap: [unclosed").unwrap_err();
        assert!(matches!(err, PipelineError::Configuration { .. }));
    }

    #[test]
    fn negative_count_is_configuration_error() {
        let err = PipelineConfig::from_yaml("bootstrap:\n  num_bootstraps: -3\n").unwrap_err();
        assert!(matches!(err, PipelineError::Configuration { .. }));
    }

    #[test]
    fn missing_file_is_validation_error() {
        let err = PipelineConfig::load(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
    }

    #[test]
    fn save_then_load_keeps_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs/generated/x_config.yaml");
        let cfg = PipelineConfig::from_yaml(SAMPLE).unwrap();
        cfg.save(&path).unwrap();
        let back = PipelineConfig::load(&path).unwrap();
        assert_eq!(back, cfg);
    }
}
