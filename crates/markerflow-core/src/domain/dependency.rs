//! Dependency kinds and edges between stages.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::SchedulerJobId;

/// How a downstream job waits for its upstream jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Proceed only if every listed upstream job succeeded.
    StrictSuccess,
    /// Proceed once every listed upstream job reached a terminal state,
    /// whatever the outcome.
    AnyCompletion,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::StrictSuccess => f.write_str("strict_success"),
            DependencyKind::AnyCompletion => f.write_str("any_completion"),
        }
    }
}

/// Links a downstream stage to the scheduler ids it waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub kind: DependencyKind,
    /// Upstream scheduler ids; an array job is listed by its base id and
    /// stands for all of its tasks.
    pub upstream: Vec<SchedulerJobId>,
}

impl DependencyEdge {
    pub fn strict(upstream: Vec<SchedulerJobId>) -> Self {
        Self {
            kind: DependencyKind::StrictSuccess,
            upstream,
        }
    }

    pub fn any_completion(upstream: Vec<SchedulerJobId>) -> Self {
        Self {
            kind: DependencyKind::AnyCompletion,
            upstream,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }
}
