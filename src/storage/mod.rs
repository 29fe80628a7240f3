//! Experiment persistence layer
//!
//! The relational store of an experiment is an external collaborator; this
//! module defines the interface the engine needs from it and ships an
//! in-memory implementation.

pub mod backends;
pub mod error;
pub mod traits;
pub mod types;

pub use backends::{ExperimentSnapshot, InMemoryExperimentStore};
pub use error::{StorageError, StorageResult};
pub use traits::ExperimentStore;
pub use types::*;
