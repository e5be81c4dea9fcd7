//! Stage dependency graph.
//!
//! Design:
//! - Forward edges: stage -> stages it depends on (waits for)
//! - Reverse edges: stage -> stages that depend on it
//! - Invariant: edges and reverse_edges are kept in sync
//!
//! Each edge carries the dependency kind fixed for that stage pair.
//! The runner walks the graph in topological order and turns every edge into
//! a `DependencyEdge` over the upstream stage's scheduler ids.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::domain::{DependencyKind, PipelineError, StageKind};

/// How one stage waits for one upstream stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageEdge {
    pub upstream: StageKind,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    nodes: BTreeSet<StageKind>,

    /// Forward edges: stage -> edges to the stages it waits for.
    edges: BTreeMap<StageKind, Vec<StageEdge>>,

    /// Reverse edges: stage -> stages waiting for it.
    reverse_edges: BTreeMap<StageKind, BTreeSet<StageKind>>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fixed per-subject pipeline:
    ///
    /// ```text
    /// resample -(StrictSuccess)-> infer
    /// infer -(AnyCompletion)-> aggregate
    /// aggregate -(StrictSuccess)-> select_markers
    /// select_markers -(StrictSuccess)-> longitudinal_update   (optional)
    /// ```
    ///
    /// Resampling writes every replicate in one job; inference task `i`
    /// checks for replicate `i` itself before running.
    pub fn pipeline(longitudinal: bool) -> Self {
        let mut g = Self::new();
        g.add_stage(StageKind::Resample);
        g.add_dependency(
            StageKind::Infer,
            StageKind::Resample,
            DependencyKind::StrictSuccess,
        );
        g.add_dependency(
            StageKind::Aggregate,
            StageKind::Infer,
            DependencyKind::AnyCompletion,
        );
        g.add_dependency(
            StageKind::SelectMarkers,
            StageKind::Aggregate,
            DependencyKind::StrictSuccess,
        );
        if longitudinal {
            g.add_dependency(
                StageKind::LongitudinalUpdate,
                StageKind::SelectMarkers,
                DependencyKind::StrictSuccess,
            );
        }
        g
    }

    pub fn add_stage(&mut self, stage: StageKind) {
        self.nodes.insert(stage);
    }

    /// `stage` waits for `depends_on`.
    pub fn add_dependency(
        &mut self,
        stage: StageKind,
        depends_on: StageKind,
        kind: DependencyKind,
    ) {
        self.nodes.insert(stage);
        self.nodes.insert(depends_on);
        let edges = self.edges.entry(stage).or_default();
        edges.retain(|e| e.upstream != depends_on);
        edges.push(StageEdge {
            upstream: depends_on,
            kind,
        });
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(stage);
    }

    pub fn contains(&self, stage: StageKind) -> bool {
        self.nodes.contains(&stage)
    }

    pub fn dependencies(&self, stage: StageKind) -> &[StageEdge] {
        self.edges.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Stages waiting for `stage`.
    pub fn dependents(&self, stage: StageKind) -> Vec<StageKind> {
        self.reverse_edges
            .get(&stage)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Submission order (Kahn's algorithm). Ties go to the lower ordinal, so
    /// the fixed pipeline always comes out in ordinal order.
    ///
    /// A cycle is reported with the stages that could not be ordered.
    pub fn topological_order(&self) -> Result<Vec<StageKind>, PipelineError> {
        let mut in_degree: BTreeMap<StageKind, usize> = self
            .nodes
            .iter()
            .map(|s| (*s, self.dependencies(*s).len()))
            .collect();

        let mut ready: VecDeque<StageKind> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(s, _)| *s)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(stage) = ready.pop_front() {
            order.push(stage);
            for dependent in self.dependents(stage) {
                if let Some(d) = in_degree.get_mut(&dependent) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            let stuck: Vec<String> = self
                .nodes
                .iter()
                .filter(|s| !order.contains(*s))
                .map(|s| s.to_string())
                .collect();
            Err(PipelineError::configuration(format!(
                "stage dependency cycle among: {}",
                stuck.join(", ")
            )))
        }
    }

    /// Every edge must point from a lower ordinal to a higher one.
    pub fn check_ordinals(&self) -> Result<(), PipelineError> {
        for (stage, edges) in &self.edges {
            for e in edges {
                if e.upstream.ordinal() >= stage.ordinal() {
                    return Err(PipelineError::configuration(format!(
                        "stage {stage} cannot depend on later stage {}",
                        e.upstream
                    )));
                }
            }
        }
        Ok(())
    }
}
