//! Persistence backend implementations

pub mod memory;

pub use memory::{ExperimentSnapshot, InMemoryExperimentStore};
