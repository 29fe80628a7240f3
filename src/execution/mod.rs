//! Per-site execution of module pipelines
//!
//! A step's sites are partitioned into [`JobBatch`]es; each batch is run by a
//! [`ModulePipelineExecutor`] that loads the site's inputs into a
//! [`DataStore`], runs the active modules through their language backends
//! and persists the declared output objects.

pub mod backend;
pub mod executor;
pub mod handles;
pub mod objects;
pub mod partition;
pub mod pipeline;
pub mod store;

pub use backend::{BackendError, BackendFactory, ExecutionBackend, Language, NativeModules};
pub use executor::ModulePipelineExecutor;
pub use handles::{
    HandleDescriptor, HandleType, HandleValue, HandleValues, ModuleHandles,
};
pub use objects::{MeasurementTable, ObjectOutline, ObjectsValue, SegmentedObjectCollection};
pub use partition::{BatchPartitioner, JobBatch};
pub use pipeline::{Pipeline, PipelineDescriptor, PIPELINE_FILE};
pub use store::DataStore;
