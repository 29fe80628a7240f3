//! Step abstraction and the registry resolving step programs

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::descriptor::StepCommand;
use super::jobs::{CollectJob, ResourceRequest, RunJob, StepJobs};
use crate::error::{Error, Result};
use crate::execution::BackendFactory;
use crate::image::ImageReader;
use crate::storage::ExperimentStore;

/// Collaborators shared by all steps of a workflow run
#[derive(Clone)]
pub struct StepContext {
    pub experiment_dir: PathBuf,
    pub store: Arc<dyn ExperimentStore>,
    pub images: Arc<dyn ImageReader>,
    pub backends: BackendFactory,
    /// Resources of jobs whose step command does not request any
    pub resources: ResourceRequest,
    pub lock_dir: PathBuf,
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("experiment_dir", &self.experiment_dir)
            .field("resources", &self.resources)
            .field("lock_dir", &self.lock_dir)
            .finish_non_exhaustive()
    }
}

/// Executes the jobs of a step
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, job: &RunJob) -> Result<()>;

    async fn collect(&self, job: &CollectJob) -> Result<()>;
}

/// One stage of a workflow
#[async_trait]
pub trait WorkflowStep: JobRunner {
    fn name(&self) -> &str;

    /// Files that must exist before any job of the step is created
    fn required_inputs(&self) -> Vec<PathBuf>;

    /// Files that exist once the step completed successfully
    fn expected_outputs(&self) -> Vec<PathBuf>;

    /// Number of sites per run job requested by the step command
    fn batch_size(&self) -> usize;

    /// Removes results of previous runs and creates the jobs of the step
    async fn create_jobs(&self, batch_size: usize) -> Result<StepJobs>;

    /// The jobs `create_jobs` would return, leaving results of previous
    /// runs in place. Steps without such results keep the default.
    async fn plan_jobs(&self, batch_size: usize) -> Result<StepJobs> {
        self.create_jobs(batch_size).await
    }
}

/// Paths among `paths` that do not exist
pub fn missing_paths(paths: &[PathBuf]) -> Vec<&Path> {
    paths
        .iter()
        .filter(|path| !path.exists())
        .map(PathBuf::as_path)
        .collect()
}

/// Fails with a next-step error unless every required input of the step
/// exists.
pub fn check_required_inputs(step: &dyn WorkflowStep) -> Result<()> {
    let required = step.required_inputs();
    let missing = missing_paths(&required);
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::next_step(format!(
        "Required inputs of step \"{}\" are missing: {}",
        step.name(),
        missing
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

type StepConstructor =
    Box<dyn Fn(&StepCommand, &StepContext) -> Result<Arc<dyn WorkflowStep>> + Send + Sync>;

/// Maps step program names to step constructors
#[derive(Default)]
pub struct StepRegistry {
    constructors: BTreeMap<String, StepConstructor>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, program: impl Into<String>, constructor: F)
    where
        F: Fn(&StepCommand, &StepContext) -> Result<Arc<dyn WorkflowStep>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(program.into(), Box::new(constructor));
    }

    pub fn contains(&self, program: &str) -> bool {
        self.constructors.contains_key(program)
    }

    pub fn programs(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn create(
        &self,
        command: &StepCommand,
        context: &StepContext,
    ) -> Result<Arc<dyn WorkflowStep>> {
        let constructor = self.constructors.get(&command.program).ok_or_else(|| {
            Error::descriptor(format!(
                "Unknown step \"{}\", known steps: {}",
                command.program,
                self.programs().collect::<Vec<_>>().join(", ")
            ))
        })?;
        constructor(command, context)
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("programs", &self.programs().collect::<Vec<_>>())
            .finish()
    }
}
