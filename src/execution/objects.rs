//! Segmented objects of one type detected in one site

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::{Error, Result};
use crate::geometry::{Point, Polygon};
use crate::image::ImageArray;

/// Outline of one labelled object in one plane, in site coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectOutline {
    #[serde(default)]
    pub tpoint: usize,
    #[serde(default)]
    pub zplane: usize,
    pub label: i64,
    pub polygon: Polygon,
}

/// Per-object measurements at one time point.
///
/// Rows are keyed by object label; `None` marks a missing value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeasurementTable {
    #[serde(default)]
    pub tpoint: usize,
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: BTreeMap<i64, Vec<Option<f64>>>,
}

impl MeasurementTable {
    pub fn new(tpoint: usize, columns: Vec<String>) -> Self {
        Self {
            tpoint,
            columns,
            rows: BTreeMap::new(),
        }
    }

    pub fn with_row(mut self, label: i64, values: Vec<Option<f64>>) -> Self {
        self.rows.insert(label, values);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.columns.is_empty()
    }

    fn validate(&self) -> Result<()> {
        let mismatch = self
            .rows
            .iter()
            .find(|(_, row)| row.len() != self.columns.len());
        if let Some((label, row)) = mismatch {
            return Err(Error::descriptor(format!(
                "Measurement row of object {} has {} values for {} columns",
                label,
                row.len(),
                self.columns.len()
            )));
        }
        Ok(())
    }

    /// Adds the columns of `other`, replacing columns of the same name.
    fn merge(&mut self, other: MeasurementTable) {
        for (index, column) in other.columns.iter().enumerate() {
            let position = match self.columns.iter().position(|c| c == column) {
                Some(position) => {
                    debug!("replace measurement column \"{}\"", column);
                    position
                }
                None => {
                    self.columns.push(column.clone());
                    for row in self.rows.values_mut() {
                        row.push(None);
                    }
                    self.columns.len() - 1
                }
            };
            for (label, values) in &other.rows {
                let n_columns = self.columns.len();
                let row = self
                    .rows
                    .entry(*label)
                    .or_insert_with(|| vec![None; n_columns]);
                row[position] = values.get(index).copied().flatten();
            }
        }
    }
}

/// Serialized form of a collection as passed through handles
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectsValue {
    pub outlines: Vec<ObjectOutline>,
}

/// Objects of one type for one site with their outlines per plane and
/// accumulated measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentedObjectCollection {
    name: String,
    planes: BTreeMap<(usize, usize), BTreeMap<i64, Polygon>>,
    measurements: BTreeMap<usize, MeasurementTable>,
    /// Persist the collection after the pipeline finished
    pub save: bool,
    /// Persist outlines, otherwise only centroids
    pub represent_as_polygons: bool,
}

impl SegmentedObjectCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            planes: BTreeMap::new(),
            measurements: BTreeMap::new(),
            save: false,
            represent_as_polygons: true,
        }
    }

    pub fn from_outlines(name: impl Into<String>, outlines: Vec<ObjectOutline>) -> Self {
        let mut collection = Self::new(name);
        for outline in outlines {
            collection.add_outline(outline);
        }
        collection
    }

    pub fn add_outline(&mut self, outline: ObjectOutline) {
        self.planes
            .entry((outline.tpoint, outline.zplane))
            .or_default()
            .insert(outline.label, outline.polygon);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Labels of all objects across planes
    pub fn labels(&self) -> BTreeSet<i64> {
        self.planes
            .values()
            .flat_map(|plane| plane.keys().copied())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.planes.values().all(BTreeMap::is_empty)
    }

    /// Outlines grouped by `(tpoint, zplane)`
    pub fn iter_planes(
        &self,
    ) -> impl Iterator<Item = ((usize, usize), &BTreeMap<i64, Polygon>)> {
        self.planes.iter().map(|(key, plane)| (*key, plane))
    }

    /// Outlines translated into experiment coordinates
    pub fn iter_polygons(&self, origin: Point) -> impl Iterator<Item = ObjectOutline> + '_ {
        self.planes.iter().flat_map(move |(&(tpoint, zplane), plane)| {
            plane.iter().map(move |(&label, polygon)| ObjectOutline {
                tpoint,
                zplane,
                label,
                polygon: polygon.translate(origin.x, origin.y),
            })
        })
    }

    /// Centroids in experiment coordinates, skipping degenerate outlines
    pub fn iter_points(
        &self,
        origin: Point,
    ) -> impl Iterator<Item = (usize, usize, i64, Point)> + '_ {
        self.iter_polygons(origin).filter_map(|outline| {
            let centroid = outline.polygon.centroid()?;
            Some((outline.tpoint, outline.zplane, outline.label, centroid))
        })
    }

    pub fn add_measurement(&mut self, table: MeasurementTable) -> Result<()> {
        table.validate()?;
        match self.measurements.get_mut(&table.tpoint) {
            Some(existing) => existing.merge(table),
            None => {
                self.measurements.insert(table.tpoint, table);
            }
        }
        Ok(())
    }

    pub fn measurements(&self) -> impl Iterator<Item = &MeasurementTable> {
        self.measurements.values()
    }

    pub fn to_value(&self) -> ObjectsValue {
        ObjectsValue {
            outlines: self.iter_polygons(Point::new(0.0, 0.0)).collect(),
        }
    }

    /// Rasterizes the outlines into a `height × width × zplanes × tpoints`
    /// label image, sampling each pixel at its center.
    pub fn label_image(
        &self,
        height: usize,
        width: usize,
        n_zplanes: usize,
        n_tpoints: usize,
    ) -> Result<ImageArray> {
        let mut image =
            ImageArray::zeros(vec![height, width, n_zplanes.max(1), n_tpoints.max(1)]);
        for (&(tpoint, zplane), plane) in &self.planes {
            let mut labels = ImageArray::zeros(vec![height, width]);
            for (&label, polygon) in plane {
                let Some(bounds) = polygon.bounds() else {
                    continue;
                };
                let y_range = pixel_range(bounds.min_y, bounds.max_y, height);
                let x_range = pixel_range(bounds.min_x, bounds.max_x, width);
                for y in y_range {
                    for x in x_range.clone() {
                        let center = Point::new(x as f64 + 0.5, y as f64 + 0.5);
                        if polygon.contains_point(&center) {
                            labels.set(&[y, x], label as f64);
                        }
                    }
                }
            }
            image.insert_plane(&labels, zplane, tpoint)?;
        }
        Ok(image)
    }
}

fn pixel_range(min: f64, max: f64, len: usize) -> std::ops::Range<usize> {
    let start = min.floor().max(0.0) as usize;
    let end = (max.ceil().max(0.0) as usize).min(len);
    start.min(end)..end
}
