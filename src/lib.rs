//! # tmengine
//!
//! Workflow engine for large scale microscopy image analysis.
//!
//! An experiment is processed by an ordered workflow of steps. Each step
//! fans out into jobs over batches of imaged sites; every job runs a
//! pipeline of analysis modules against a per-site data store, and the
//! collect phase rolls object features up the spatial hierarchy
//! (site, well, plate).
//!
//! ## Modules
//!
//! - `workflow` - Workflow descriptor, step abstraction, state machine and job submission
//! - `execution` - Batch partitioning, pipeline descriptors and the module pipeline executor
//! - `aggregation` - Hierarchical aggregation of object features
//! - `steps` - Built-in step programs
//! - `storage` - Persistence collaborator and its in-memory implementation
//! - `image` - Image arrays, illumination correction and alignment
//! - `geometry` - Minimal polygon geometry
//! - `subprocess` - Subprocess abstraction used by the language backends
//! - `config` - Engine configuration
pub mod aggregation;
pub mod config;
pub mod error;
pub mod execution;
pub mod geometry;
pub mod image;
pub mod steps;
pub mod storage;
pub mod subprocess;
pub mod workflow;

pub use error::{Error, ErrorKind, Result};
