//! The image analysis step: runs a module pipeline on every site and
//! aggregates the resulting object features.
//!
//! ```text
//! image-analysis {experiment_dir} --pipeline pipelines/segmentation --batch-size 10
//!     [--plot] [--duration 02:00:00] [--memory 4096] [--cores 2]
//! ```
//!
//! The pipeline directory (the step location) holds `pipeline.yaml`, the
//! handles files and module sources. The step writes its batch files, the
//! figures of plotting runs and the collect report below it.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::aggregation::HierarchicalAggregator;
use crate::error::Result;
use crate::execution::{
    BatchPartitioner, JobBatch, ModulePipelineExecutor, Pipeline, PIPELINE_FILE,
};
use crate::storage::SiteId;
use crate::workflow::{
    CollectJob, CollectLock, JobRunner, ResourceRequest, RunJob, StepCommand, StepContext,
    StepJobs, WorkflowStep,
};

pub const PROGRAM: &str = "image-analysis";
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const COLLECT_REPORT_FILE: &str = "collect.json";

pub struct ImageAnalysisStep {
    name: String,
    command: StepCommand,
    step_location: PathBuf,
    batch_size: usize,
    plot: bool,
    resources: ResourceRequest,
    context: StepContext,
}

impl ImageAnalysisStep {
    pub fn from_command(command: &StepCommand, context: &StepContext) -> Result<Self> {
        let pipeline = PathBuf::from(command.required_option("pipeline")?);
        let step_location = if pipeline.is_absolute() {
            pipeline
        } else {
            context.experiment_dir.join(pipeline)
        };
        let name = step_location
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(PROGRAM)
            .to_string();

        let mut resources = context.resources.clone();
        if let Some(duration) = command.option("duration") {
            resources.duration = ResourceRequest::parse_duration(duration)?;
        }
        if let Some(memory_mb) = command.parse_option("memory")? {
            resources.memory_mb = memory_mb;
        }
        if let Some(cores) = command.parse_option("cores")? {
            resources.cores = cores;
        }
        resources.validate()?;

        Ok(Self {
            name,
            command: command.clone(),
            step_location,
            batch_size: command
                .parse_option("batch-size")?
                .unwrap_or(DEFAULT_BATCH_SIZE),
            plot: command.flag("plot"),
            resources,
            context: context.clone(),
        })
    }

    /// Resources of the step's jobs: the defaults overridden by
    /// `--duration`, `--memory` and `--cores`
    pub fn resources(&self) -> &ResourceRequest {
        &self.resources
    }

    pub fn step_location(&self) -> &Path {
        &self.step_location
    }

    pub fn figures_dir(&self) -> PathBuf {
        self.step_location.join("figures")
    }

    pub fn batches_dir(&self) -> PathBuf {
        self.step_location.join("batches")
    }

    pub fn collect_report_path(&self) -> PathBuf {
        self.step_location.join(COLLECT_REPORT_FILE)
    }

    /// Loads the pipeline, failing for native modules the engine does not
    /// provide.
    pub fn load_pipeline(&self) -> Result<Pipeline> {
        let pipeline = Pipeline::load(&self.step_location)?;
        pipeline.check_native_modules(self.context.backends.native_modules())?;
        Ok(pipeline)
    }

    /// Clears figures and the collect report of a previous run.
    pub async fn remove_previous_pipeline_output(&self) -> Result<()> {
        let figures_dir = self.figures_dir();
        if figures_dir.exists() {
            debug!("remove figures of previous run in {}", figures_dir.display());
            tokio::fs::remove_dir_all(&figures_dir).await?;
        }
        tokio::fs::create_dir_all(&figures_dir).await?;
        let report = self.collect_report_path();
        if report.exists() {
            tokio::fs::remove_file(&report).await?;
        }
        Ok(())
    }

    /// Deletes the analysis objects of previous runs, keeping the object
    /// types the pipeline loads as input.
    pub async fn delete_previous_job_output(&self, pipeline: &Pipeline) -> Result<()> {
        let keep: BTreeSet<String> = pipeline
            .input_object_names()
            .into_iter()
            .map(String::from)
            .collect();
        let deleted = self.context.store.delete_leaf_mapobject_types(&keep).await?;
        info!("deleted {} object types of previous runs", deleted);
        Ok(())
    }

    /// Remote command line of job `id`
    fn job_arguments(&self, id: usize) -> Vec<String> {
        let mut arguments = vec![
            "tmengine".to_string(),
            "job".to_string(),
            self.context.experiment_dir.display().to_string(),
            "--id".to_string(),
            id.to_string(),
            "--".to_string(),
        ];
        arguments.extend(self.command.to_words());
        arguments
    }

    fn run_jobs(&self, batches: Vec<JobBatch>) -> Vec<RunJob> {
        batches
            .into_iter()
            .map(|batch| RunJob {
                id: batch.id,
                arguments: self.job_arguments(batch.id),
                batch,
                resources: self.resources.clone(),
            })
            .collect()
    }

    /// One plotting job per site, for inspecting a pipeline on a few sites
    pub async fn create_debug_jobs(&self, site_ids: &[SiteId]) -> Result<StepJobs> {
        let pipeline = self.load_pipeline()?;
        let partitioner = BatchPartitioner::new(1, true)?;
        self.remove_previous_pipeline_output().await?;
        let mut batches = partitioner.partition(site_ids);
        for batch in batches.iter_mut() {
            batch.image_file_locations = self
                .context
                .store
                .image_file_locations(&pipeline.channel_names(), &batch.site_ids)
                .await?;
        }
        Ok(StepJobs {
            step: self.name.clone(),
            run: self.run_jobs(batches),
            collect: None,
        })
    }

    /// The batch description of job `id` written when the jobs were created
    pub async fn read_batch(&self, id: usize) -> Result<JobBatch> {
        JobBatch::read(&self.batches_dir(), id).await
    }

    /// Partitions the sites and replaces the batch files of the step
    async fn write_jobs(
        &self,
        partitioner: BatchPartitioner,
        pipeline: &Pipeline,
    ) -> Result<StepJobs> {
        let batches = partitioner
            .create_batches(self.context.store.as_ref(), &pipeline.channel_names())
            .await?;
        let batches_dir = self.batches_dir();
        if batches_dir.exists() {
            tokio::fs::remove_dir_all(&batches_dir).await?;
        }
        for batch in &batches {
            batch.write(&batches_dir).await?;
        }
        info!(
            "created {} jobs for step {} with batch size {}",
            batches.len(),
            self.name,
            partitioner.batch_size()
        );
        Ok(StepJobs {
            step: self.name.clone(),
            run: self.run_jobs(batches),
            collect: Some(CollectJob {
                resources: self.resources.clone(),
            }),
        })
    }
}

#[async_trait]
impl JobRunner for ImageAnalysisStep {
    async fn run_job(&self, job: &RunJob) -> Result<()> {
        let pipeline = Arc::new(self.load_pipeline()?);
        let mut executor = ModulePipelineExecutor::new(
            pipeline,
            Arc::clone(&self.context.store),
            Arc::clone(&self.context.images),
            self.context
                .backends
                .clone()
                .with_module_timeout(job.resources.duration),
            self.figures_dir(),
        );
        executor.run_job(&job.batch).await
    }

    async fn collect(&self, _job: &CollectJob) -> Result<()> {
        let _lock = CollectLock::acquire(&self.context.lock_dir, &self.name).await?;
        let report = HierarchicalAggregator::new(Arc::clone(&self.context.store))
            .run()
            .await?;
        let path = self.collect_report_path();
        tokio::fs::write(&path, serde_json::to_string_pretty(&report)?).await?;
        info!("wrote collect report {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl WorkflowStep for ImageAnalysisStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_inputs(&self) -> Vec<PathBuf> {
        vec![self.step_location.join(PIPELINE_FILE)]
    }

    fn expected_outputs(&self) -> Vec<PathBuf> {
        vec![self.collect_report_path(), self.figures_dir()]
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn create_jobs(&self, batch_size: usize) -> Result<StepJobs> {
        let partitioner = BatchPartitioner::new(batch_size, self.plot)?;
        let pipeline = self.load_pipeline()?;
        self.remove_previous_pipeline_output().await?;
        self.delete_previous_job_output(&pipeline).await?;
        self.write_jobs(partitioner, &pipeline).await
    }

    async fn plan_jobs(&self, batch_size: usize) -> Result<StepJobs> {
        let partitioner = BatchPartitioner::new(batch_size, self.plot)?;
        let pipeline = self.load_pipeline()?;
        self.write_jobs(partitioner, &pipeline).await
    }
}
