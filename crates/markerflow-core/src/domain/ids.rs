//! Domain identifiers (strongly-typed IDs).
//!
//! Two families live here:
//! - ULID-backed ids for things this process creates (`RunId`, `BatchId`).
//!   They share one generic implementation through a phantom marker type, so
//!   a `RunId` can never be passed where a `BatchId` is expected.
//! - `SchedulerJobId`, an opaque string assigned by the batch scheduler.
//! - `SubjectId`, the analysis unit (one patient).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait providing the display prefix of an id family.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID id. `T` costs nothing at runtime.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Fresh id from the current time.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Run {}

impl IdMarker for Run {
    fn prefix() -> &'static str {
        "run-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Batch {}

impl IdMarker for Batch {
    fn prefix() -> &'static str {
        "batch-"
    }
}

/// Identifier of one subject's PipelineRun.
pub type RunId = Id<Run>;

/// Identifier of a BatchRun.
pub type BatchId = Id<Batch>;

/// Identifier assigned by the batch scheduler on submission.
///
/// For array jobs the base id names the whole array and each task is
/// addressed as `<base>_<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchedulerJobId(String);

impl SchedulerJobId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of one task of an array job.
    pub fn array_task(&self, index: u32) -> SchedulerJobId {
        SchedulerJobId(format!("{}_{}", self.0, index))
    }
}

impl fmt::Display for SchedulerJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one analysis subject (e.g. a patient).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_family_prefix() {
        let run = RunId::generate();
        let batch = BatchId::generate();

        assert!(run.to_string().starts_with("run-"));
        assert!(batch.to_string().starts_with("batch-"));
        // let _: RunId = batch; // <- does not compile
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = RunId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = RunId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<RunId>(), size_of::<Ulid>());
        assert_eq!(size_of::<BatchId>(), size_of::<Ulid>());
    }

    #[test]
    fn array_task_ids_use_underscore_index() {
        let base = SchedulerJobId::new("4242");
        assert_eq!(base.array_task(3).as_str(), "4242_3");
    }

    #[test]
    fn scheduler_job_id_serializes_as_plain_string() {
        let id = SchedulerJobId::new("17");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"17\"");
    }
}
