//! Typed records exchanged with the experiment persistence layer

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::geometry::{Point, Polygon};
use crate::image::AlignmentWindow;

pub type SiteId = i64;
pub type ChannelId = i64;
pub type MapobjectTypeId = i64;
pub type MapobjectId = i64;
pub type FeatureId = i64;
pub type SegmentationLayerId = i64;

/// One tier of the spatial containment hierarchy, ordered finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HierarchyLevel {
    Site,
    Well,
    Plate,
}

impl HierarchyLevel {
    /// All levels from the finest to the coarsest
    pub const ALL: [HierarchyLevel; 3] = [Self::Site, Self::Well, Self::Plate];

    pub fn finest() -> Self {
        Self::Site
    }

    /// The next finer level, `None` for the finest one
    pub fn finer(&self) -> Option<Self> {
        match self {
            Self::Site => None,
            Self::Well => Some(Self::Site),
            Self::Plate => Some(Self::Well),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Site => "Site",
            Self::Well => "Well",
            Self::Plate => "Plate",
        }
    }
}

impl fmt::Display for HierarchyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HierarchyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Site" => Ok(Self::Site),
            "Well" => Ok(Self::Well),
            "Plate" => Ok(Self::Plate),
            other => Err(format!("unknown hierarchy level: {}", other)),
        }
    }
}

/// An imaged region; the unit of work of a pipeline step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub y_offset: i64,
    pub x_offset: i64,
    pub aligned_height: usize,
    pub aligned_width: usize,
    /// Position of the site's upper-left corner in experiment coordinates
    pub origin: Point,
}

impl Site {
    pub fn alignment_window(&self) -> AlignmentWindow {
        AlignmentWindow {
            y_offset: self.y_offset,
            x_offset: self.x_offset,
            height: self.aligned_height,
            width: self.aligned_width,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub bit_depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelImageFile {
    pub id: i64,
    pub site_id: SiteId,
    pub channel_id: ChannelId,
    pub tpoint: usize,
    pub zplane: usize,
    pub location: String,
    /// Shift of this acquisition relative to the reference cycle
    #[serde(default)]
    pub y_shift: i64,
    #[serde(default)]
    pub x_shift: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapobjectType {
    pub id: MapobjectTypeId,
    pub name: String,
    /// Containment level for structural types, `None` for analysis objects
    pub ref_type: Option<HierarchyLevel>,
}

impl MapobjectType {
    pub fn is_leaf(&self) -> bool {
        self.ref_type.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapobject {
    pub id: MapobjectId,
    pub mapobject_type_id: MapobjectTypeId,
    /// Site the object was segmented in
    pub site_id: Option<SiteId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segmentation {
    pub mapobject_id: MapobjectId,
    pub segmentation_layer_id: SegmentationLayerId,
    pub label: i64,
    pub geom_polygon: Option<Polygon>,
    pub geom_centroid: Point,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationLayer {
    pub id: SegmentationLayerId,
    pub mapobject_type_id: MapobjectTypeId,
    pub tpoint: usize,
    pub zplane: usize,
    pub polygon_threshold: u32,
    pub centroid_threshold: u32,
}

impl SegmentationLayer {
    /// Zoom levels below which objects are drawn as centroids only and below
    /// which they are hidden, derived from the maximum zoom level of the map.
    pub fn zoom_thresholds(max_zoom_level: u32) -> (u32, u32) {
        let polygon_threshold = (max_zoom_level as i64 - 3).max(0);
        let centroid_threshold = (polygon_threshold - 2).max(0);
        (polygon_threshold as u32, centroid_threshold as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub name: String,
    pub mapobject_type_id: MapobjectTypeId,
    pub is_aggregate: bool,
}

/// Decimal places kept for persisted feature values
pub const FEATURE_VALUE_DECIMALS: i32 = 6;

/// Rounds a feature value to [`FEATURE_VALUE_DECIMALS`] places; NaN passes through.
pub fn round_feature_value(value: f64) -> f64 {
    let factor = 10f64.powi(FEATURE_VALUE_DECIMALS);
    (value * factor).round() / factor
}

/// Measurements of one object at one time point, keyed by feature id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureValues {
    pub mapobject_id: MapobjectId,
    pub tpoint: usize,
    #[serde(with = "nan_as_null")]
    pub values: BTreeMap<FeatureId, f64>,
}

/// A structural object of one hierarchy level and its outline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceObject {
    pub mapobject_id: MapobjectId,
    pub geometry: Polygon,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceObjects {
    pub mapobject_type: MapobjectType,
    pub objects: Vec<ReferenceObject>,
}

/// Feature values of all objects intersecting a region at one time point
#[derive(Debug, Clone, PartialEq)]
pub struct TimepointValues {
    pub tpoint: usize,
    pub values: Vec<BTreeMap<FeatureId, f64>>,
}

/// JSON has no NaN; missing measurements are stored as `null`.
pub mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(values: &BTreeMap<i64, f64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        values
            .iter()
            .map(|(k, v)| (*k, if v.is_nan() { None } else { Some(*v) }))
            .collect::<BTreeMap<i64, Option<f64>>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<i64, f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<i64, Option<f64>>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k, v.unwrap_or(f64::NAN)))
            .collect())
    }
}
