//! Submission of a step's jobs
//!
//! The cluster scheduler is an external collaborator behind
//! [`JobSubmitter`]. [`LocalSubmitter`] runs the jobs on the current host:
//! run jobs fan out as concurrent tasks, and the collect job starts after
//! all of them finished and only if every one succeeded.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::jobs::StepJobs;
use super::step::WorkflowStep;
use crate::error::Result;

/// Completion state of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Run job id, `0` for the collect job
    pub id: usize,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatus {
    pub fn success(id: usize) -> Self {
        Self {
            id,
            exit_code: 0,
            error: None,
        }
    }

    pub fn failure(id: usize, error: impl Into<String>) -> Self {
        Self {
            id,
            exit_code: 1,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Result of submitting all jobs of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    /// Run jobs ordered by id
    pub run: Vec<JobStatus>,
    /// `None` when the step has no collect job or it was skipped
    pub collect: Option<JobStatus>,
}

impl StepOutcome {
    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobStatus> {
        self.run
            .iter()
            .chain(self.collect.iter())
            .filter(|status| !status.is_success())
    }

    pub fn succeeded(&self) -> bool {
        self.failed_jobs().next().is_none()
    }
}

#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Runs the jobs and reports once the step is complete
    async fn submit(&self, step: Arc<dyn WorkflowStep>, jobs: StepJobs) -> Result<StepOutcome>;
}

/// Runs jobs as tokio tasks on the local host
#[derive(Debug, Clone)]
pub struct LocalSubmitter {
    max_parallel: usize,
}

impl LocalSubmitter {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }
}

#[async_trait]
impl JobSubmitter for LocalSubmitter {
    async fn submit(&self, step: Arc<dyn WorkflowStep>, jobs: StepJobs) -> Result<StepOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut futures = FuturesUnordered::new();
        info!(
            "Submitting {} jobs of step {} (max parallel: {})",
            jobs.run.len(),
            jobs.step,
            self.max_parallel
        );

        for job in jobs.run {
            let semaphore = Arc::clone(&semaphore);
            let step = Arc::clone(&step);
            let id = job.id;
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                info!("Running job {} of step {}", job.id, step.name());
                match step.run_job(&job).await {
                    Ok(()) => JobStatus::success(job.id),
                    Err(e) => {
                        error!("Job {} of step {} failed: {}", job.id, step.name(), e);
                        JobStatus::failure(job.id, e.to_string())
                    }
                }
            });
            futures.push(async move {
                handle
                    .await
                    .unwrap_or_else(|e| JobStatus::failure(id, format!("job task panicked: {}", e)))
            });
        }

        let mut run = Vec::new();
        while let Some(status) = futures.next().await {
            run.push(status);
        }
        run.sort_by_key(|status| status.id);

        let failed = run.iter().filter(|s| !s.is_success()).count();
        let collect = match jobs.collect {
            Some(_) if failed > 0 => {
                warn!(
                    "Skipping collect of step {}: {} of {} jobs failed",
                    jobs.step,
                    failed,
                    run.len()
                );
                None
            }
            Some(collect) => {
                info!("Running collect job of step {}", jobs.step);
                Some(match step.collect(&collect).await {
                    Ok(()) => JobStatus::success(0),
                    Err(e) => {
                        error!("Collect job of step {} failed: {}", jobs.step, e);
                        JobStatus::failure(0, e.to_string())
                    }
                })
            }
            None => None,
        };

        Ok(StepOutcome {
            step: jobs.step,
            run,
            collect,
        })
    }
}
