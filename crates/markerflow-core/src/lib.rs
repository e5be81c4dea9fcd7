//! markerflow-core
//!
//! Staged marker-discovery pipeline on top of a SLURM cluster.
//!
//! # Modules
//! - **domain**: ids, stages, stage specs, job records, runs, errors
//! - **config**: YAML configuration document and batch templates
//! - **resolver**: configuration → validated stage specs
//! - **layout**: output directory layout
//! - **stages**: the in-job stage entry points
//! - **ports**: Scheduler and Clock interfaces
//! - **impls**: SLURM, dry-run and in-memory schedulers
//! - **app**: submitter, pipeline runner, multi-subject orchestrator

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod layout;
pub mod ports;
pub mod resolver;
pub mod stages;
