//! What gets handed to the scheduler for one stage.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::dependency::DependencyEdge;
use super::ids::SubjectId;
use super::spec::{Resources, StageCommand};
use super::stage::StageKind;

/// Array-job description: which replicate indices to run and how many at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArraySpec {
    pub indices: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_limit: Option<u32>,
}

impl ArraySpec {
    /// Compact range syntax, e.g. `1-3,5,7-8%10`.
    pub fn to_range_expr(&self) -> String {
        let mut sorted = self.indices.clone();
        sorted.sort_unstable();
        sorted.dedup();

        let mut parts: Vec<String> = Vec::new();
        let mut iter = sorted.into_iter();
        if let Some(first) = iter.next() {
            let (mut start, mut end) = (first, first);
            for i in iter {
                if i == end + 1 {
                    end = i;
                    continue;
                }
                parts.push(range_part(start, end));
                start = i;
                end = i;
            }
            parts.push(range_part(start, end));
        }

        let mut expr = parts.join(",");
        if let Some(limit) = self.parallel_limit {
            expr.push_str(&format!("%{limit}"));
        }
        expr
    }
}

fn range_part(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

/// One submission, fully described. Also what a dry run records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub subject: SubjectId,
    pub stage: StageKind,
    pub job_name: String,
    pub resources: Resources,
    pub command: StageCommand,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array: Option<ArraySpec>,

    /// Edges this job waits on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<DependencyEdge>,

    /// Scheduler dependency expression derived from `edges`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,

    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(vec![1, 2, 3, 4], None, "1-4")]
    #[case(vec![1, 4], None, "1,4")]
    #[case(vec![4, 1, 2, 7, 8], Some(10), "1-2,4,7-8%10")]
    #[case(vec![5], Some(2), "5%2")]
    fn range_expression(
        #[case] indices: Vec<u32>,
        #[case] limit: Option<u32>,
        #[case] expected: &str,
    ) {
        let spec = ArraySpec {
            indices,
            parallel_limit: limit,
        };
        assert_eq!(spec.to_range_expr(), expected);
    }
}
