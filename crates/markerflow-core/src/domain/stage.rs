//! Stage identity: the fixed sequence of pipeline stages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One stage of the per-subject pipeline.
///
/// The declaration order is the ordinal order and never changes:
/// resample < infer < aggregate < select-markers < longitudinal-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Resample,
    Infer,
    Aggregate,
    SelectMarkers,
    LongitudinalUpdate,
}

impl StageKind {
    /// Every stage in ordinal order.
    pub const ALL: [StageKind; 5] = [
        StageKind::Resample,
        StageKind::Infer,
        StageKind::Aggregate,
        StageKind::SelectMarkers,
        StageKind::LongitudinalUpdate,
    ];

    /// Position in the pipeline (0-based, strictly increasing).
    pub fn ordinal(self) -> u8 {
        match self {
            StageKind::Resample => 0,
            StageKind::Infer => 1,
            StageKind::Aggregate => 2,
            StageKind::SelectMarkers => 3,
            StageKind::LongitudinalUpdate => 4,
        }
    }

    /// Short name used in job names, log files and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Resample => "resample",
            StageKind::Infer => "infer",
            StageKind::Aggregate => "aggregate",
            StageKind::SelectMarkers => "select_markers",
            StageKind::LongitudinalUpdate => "longitudinal_update",
        }
    }

    /// Section name under `hpc:` in the configuration document.
    pub fn config_section(self) -> &'static str {
        match self {
            StageKind::Resample => "bootstrap",
            StageKind::Infer => "phylowgs",
            StageKind::Aggregate => "aggregation",
            StageKind::SelectMarkers => "marker_selection",
            StageKind::LongitudinalUpdate => "longitudinal",
        }
    }

    /// Array-style stages run one scheduler task per replicate.
    ///
    /// Resampling produces every replicate in a single job, so only
    /// inference fans out at the scheduler.
    pub fn is_fan_out(self) -> bool {
        matches!(self, StageKind::Infer)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_strictly_increasing() {
        let ordinals: Vec<u8> = StageKind::ALL.iter().map(|s| s.ordinal()).collect();
        assert!(ordinals.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn ord_matches_ordinal() {
        let mut shuffled = vec![
            StageKind::SelectMarkers,
            StageKind::Resample,
            StageKind::LongitudinalUpdate,
            StageKind::Aggregate,
            StageKind::Infer,
        ];
        shuffled.sort();
        assert_eq!(shuffled, StageKind::ALL.to_vec());
    }

    #[test]
    fn only_infer_fans_out() {
        let fan_out: Vec<StageKind> = StageKind::ALL
            .into_iter()
            .filter(|s| s.is_fan_out())
            .collect();
        assert_eq!(fan_out, vec![StageKind::Infer]);
    }
}
