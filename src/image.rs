//! Pixel arrays, illumination correction and alignment
//!
//! Images are kept as dense `f64` arrays in row-major order. A channel loaded
//! for one site is four-dimensional (`height × width × zplanes × tpoints`)
//! until [`ImageArray::squeeze`] drops the singleton dimensions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl ImageArray {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::descriptor(format!(
                "Image data of length {} does not match shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Two-dimensional image from row-major pixel rows
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let height = rows.len();
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != width) {
            return Err(Error::descriptor("Image rows differ in length"));
        }
        Self::new(vec![height, width], rows.concat())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn height(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    pub fn width(&self) -> usize {
        self.shape.get(1).copied().unwrap_or(0)
    }

    fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0;
        for (i, (&idx, &dim)) in index.iter().zip(&self.shape).enumerate() {
            if idx >= dim {
                return None;
            }
            offset = if i == 0 { idx } else { offset * dim + idx };
        }
        Some(offset)
    }

    pub fn get(&self, index: &[usize]) -> Option<f64> {
        self.offset(index).map(|o| self.data[o])
    }

    pub fn set(&mut self, index: &[usize], value: f64) -> bool {
        match self.offset(index) {
            Some(o) => {
                self.data[o] = value;
                true
            }
            None => false,
        }
    }

    /// Pixel of a two-dimensional image
    pub fn pixel(&self, y: usize, x: usize) -> f64 {
        self.data[y * self.width() + x]
    }

    /// Writes a 2D plane into a 4D array at `(zplane, tpoint)`.
    pub fn insert_plane(&mut self, plane: &ImageArray, zplane: usize, tpoint: usize) -> Result<()> {
        let [height, width, n_zplanes, n_tpoints] = self.shape[..] else {
            return Err(Error::descriptor(format!(
                "Cannot insert a plane into an array of shape {:?}",
                self.shape
            )));
        };
        if plane.shape() != [height, width] || zplane >= n_zplanes || tpoint >= n_tpoints {
            return Err(Error::descriptor(format!(
                "Plane of shape {:?} at zplane {} and tpoint {} does not fit array of shape {:?}",
                plane.shape(),
                zplane,
                tpoint,
                self.shape
            )));
        }
        for y in 0..height {
            for x in 0..width {
                let o = ((y * width + x) * n_zplanes + zplane) * n_tpoints + tpoint;
                self.data[o] = plane.data[y * width + x];
            }
        }
        Ok(())
    }

    /// Removes dimensions of length one. Row-major data order is unaffected.
    pub fn squeeze(mut self) -> Self {
        self.shape.retain(|&d| d != 1);
        self
    }

    /// Applies illumination correction with statistics computed in log10 space.
    ///
    /// Each pixel is standardized against the per-pixel mean and standard
    /// deviation and rescaled to the global mean of both, then clipped to the
    /// range of the channel's bit depth.
    pub fn correct(&self, stats: &IllumStats, bit_depth: u32) -> Result<Self> {
        if stats.mean.shape() != self.shape() || stats.std.shape() != self.shape() {
            return Err(Error::descriptor(format!(
                "Illumination statistics of shape {:?} do not match image of shape {:?}",
                stats.mean.shape(),
                self.shape
            )));
        }
        let global_mean = mean(stats.mean.data());
        let global_std = mean(stats.std.data());
        let max_value = 2f64.powi(bit_depth as i32) - 1.0;
        let data = self
            .data
            .iter()
            .zip(stats.mean.data().iter().zip(stats.std.data()))
            .map(|(&value, (&m, &s))| {
                let log_value = value.log10();
                let standardized = if s > 0.0 { (log_value - m) / s } else { 0.0 };
                let corrected = 10f64.powf(standardized * global_std + global_mean);
                if value <= 0.0 {
                    0.0
                } else {
                    corrected.clamp(0.0, max_value)
                }
            })
            .collect();
        Ok(Self {
            shape: self.shape.clone(),
            data,
        })
    }

    /// Shifts and crops a 2D image to the aligned window of its site.
    ///
    /// The window starts at `(y_offset + y_shift, x_offset + x_shift)`;
    /// pixels that fall outside of the source image are zero.
    pub fn align(&self, window: &AlignmentWindow, y_shift: i64, x_shift: i64) -> Self {
        let (src_h, src_w) = (self.height() as i64, self.width() as i64);
        let (top, left) = (window.y_offset + y_shift, window.x_offset + x_shift);
        let mut aligned = Self::zeros(vec![window.height, window.width]);
        for y in 0..window.height {
            let sy = top + y as i64;
            if sy < 0 || sy >= src_h {
                continue;
            }
            for x in 0..window.width {
                let sx = left + x as i64;
                if sx < 0 || sx >= src_w {
                    continue;
                }
                aligned.data[y * window.width + x] = self.pixel(sy as usize, sx as usize);
            }
        }
        aligned
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Region of a site image that overlaps all acquisition cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentWindow {
    pub y_offset: i64,
    pub x_offset: i64,
    pub height: usize,
    pub width: usize,
}

/// Per-channel illumination statistics in log10 space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IllumStats {
    pub mean: ImageArray,
    pub std: ImageArray,
}

/// Decodes image files referenced by the experiment.
#[async_trait]
pub trait ImageReader: Send + Sync {
    async fn read(&self, location: &str) -> Result<ImageArray>;
}

/// Reads images stored as serialized [`ImageArray`] JSON documents.
pub struct JsonImageReader {
    base_dir: PathBuf,
}

impl JsonImageReader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl ImageReader for JsonImageReader {
    async fn read(&self, location: &str) -> Result<ImageArray> {
        let path = self.base_dir.join(location);
        let content = tokio::fs::read_to_string(&path).await?;
        let image: ImageArray = serde_json::from_str(&content)?;
        ImageArray::new(image.shape, image.data)
    }
}

/// Image reader serving arrays registered in memory
#[derive(Clone, Default)]
pub struct InMemoryImageReader {
    images: Arc<RwLock<HashMap<String, ImageArray>>>,
}

impl InMemoryImageReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, location: impl Into<String>, image: ImageArray) {
        self.images.write().await.insert(location.into(), image);
    }
}

#[async_trait]
impl ImageReader for InMemoryImageReader {
    async fn read(&self, location: &str) -> Result<ImageArray> {
        self.images
            .read()
            .await
            .get(location)
            .cloned()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("image {} not found", location),
                ))
            })
    }
}
