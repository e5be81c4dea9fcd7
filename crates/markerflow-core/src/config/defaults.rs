//! Documented defaults.
//!
//! Every default is a pure function of (stage, field). Both the single-subject
//! and the batch entry points go through the resolver, which is the only
//! caller of this module.

use crate::domain::StageKind;

pub const NUM_BOOTSTRAPS: u32 = 100;
pub const NUM_CHAINS: u32 = 5;
pub const PARALLEL_LIMIT: u32 = 10;
pub const READ_DEPTH: u32 = 1500;

pub const MAX_SUBMIT_ATTEMPTS: u32 = 5;
pub const BACKOFF_BASE_SECS: u64 = 2;

pub const SBATCH: &str = "sbatch";
pub const SACCT: &str = "sacct";

/// A per-stage resource field under `hpc.<stage>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpcField {
    Partition,
    CpusPerTask,
    Memory,
    Walltime,
    CondaEnv,
}

/// Default for one resource field of one stage.
///
/// All stages currently share the same values.
pub fn hpc(_stage: StageKind, field: HpcField) -> &'static str {
    match field {
        HpcField::Partition => "pool1",
        HpcField::CpusPerTask => "1",
        HpcField::Memory => "8G",
        HpcField::Walltime => "02:00:00",
        HpcField::CondaEnv => "base",
    }
}

pub fn cpus(stage: StageKind) -> u32 {
    hpc(stage, HpcField::CpusPerTask).parse().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        assert_eq!(NUM_BOOTSTRAPS, 100);
        assert_eq!(READ_DEPTH, 1500);
        for stage in StageKind::ALL {
            assert_eq!(hpc(stage, HpcField::Partition), "pool1");
            assert_eq!(hpc(stage, HpcField::Memory), "8G");
            assert_eq!(hpc(stage, HpcField::Walltime), "02:00:00");
            assert_eq!(cpus(stage), 1);
        }
    }
}
