//! Scheduler implementations.
//!
//! - `SlurmScheduler`: the real thing, via `sbatch` / `sacct`
//! - `DryRunScheduler`: records requests, submits nothing
//! - `InMemoryScheduler`: scripted outcomes for tests

pub mod dry_run;
pub mod inmem_scheduler;
pub mod slurm;

pub use self::dry_run::DryRunScheduler;
pub use self::inmem_scheduler::InMemoryScheduler;
pub use self::slurm::SlurmScheduler;
