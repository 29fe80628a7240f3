//! Batch partitioning of a step's units of work
//!
//! Sites are grouped into contiguous, fixed-size batches in their original
//! order. Each batch becomes one cluster job.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::{ExperimentStore, SiteId};

/// A partition of a step's units of work submitted as one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBatch {
    /// One-based job id
    pub id: usize,
    pub site_ids: Vec<SiteId>,
    /// Write per-module figures for the units of this batch
    pub plot: bool,
    /// Image files of the pipeline's input channels acquired at these sites
    #[serde(default)]
    pub image_file_locations: Vec<String>,
}

impl JobBatch {
    pub fn len(&self) -> usize {
        self.site_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.site_ids.is_empty()
    }

    /// Location of the persisted description of batch `id` below `batches_dir`
    pub fn file_path(batches_dir: &Path, id: usize) -> PathBuf {
        batches_dir.join(format!("batch_{}.json", id))
    }

    /// Persist the batch so a remote job can reload it
    pub async fn write(&self, batches_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(batches_dir).await?;
        let path = Self::file_path(batches_dir, self.id);
        tokio::fs::write(&path, serde_json::to_string_pretty(self)?).await?;
        Ok(path)
    }

    pub async fn read(batches_dir: &Path, id: usize) -> Result<Self> {
        let path = Self::file_path(batches_dir, id);
        let content = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Splits units of work into job batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPartitioner {
    batch_size: usize,
    plot: bool,
}

impl BatchPartitioner {
    /// Create a partitioner; plotting requires exactly one unit per job.
    pub fn new(batch_size: usize, plot: bool) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::descriptor("Batch size must be positive."));
        }
        if plot && batch_size != 1 {
            return Err(Error::descriptor(
                "Batch size must be 1 when plotting is active.",
            ));
        }
        Ok(Self { batch_size, plot })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Contiguous batches of at most `batch_size` ids, preserving order.
    pub fn partition(&self, site_ids: &[SiteId]) -> Vec<JobBatch> {
        site_ids
            .chunks(self.batch_size)
            .enumerate()
            .map(|(index, chunk)| JobBatch {
                id: index + 1,
                site_ids: chunk.to_vec(),
                plot: self.plot,
                image_file_locations: Vec::new(),
            })
            .collect()
    }

    /// Partition all sites of the experiment and attach the image locations
    /// of `channel_names` to each batch.
    pub async fn create_batches(
        &self,
        store: &dyn ExperimentStore,
        channel_names: &[String],
    ) -> Result<Vec<JobBatch>> {
        let site_ids: Vec<SiteId> = store.sites().await?.iter().map(|s| s.id).collect();
        let mut batches = self.partition(&site_ids);
        for batch in batches.iter_mut() {
            batch.image_file_locations = store
                .image_file_locations(channel_names, &batch.site_ids)
                .await?;
            debug!(
                "Batch {} covers {} sites and {} image files",
                batch.id,
                batch.len(),
                batch.image_file_locations.len()
            );
        }
        Ok(batches)
    }
}
