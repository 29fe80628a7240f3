//! Core trait definition for the experiment persistence layer

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

use super::error::StorageResult;
use super::types::*;
use crate::geometry::Polygon;
use crate::image::IllumStats;

/// Session-scoped access to one experiment's persisted state.
///
/// Catalog entities (object types, features, segmentation layers) follow
/// get-or-create semantics; high-volume records (mapobjects, segmentations,
/// feature values) are bulk-inserted.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// All sites ordered by id
    async fn sites(&self) -> StorageResult<Vec<Site>>;

    async fn site(&self, id: SiteId) -> StorageResult<Site>;

    async fn channel(&self, name: &str) -> StorageResult<Channel>;

    async fn channel_image_files(
        &self,
        site_id: SiteId,
        channel_id: ChannelId,
    ) -> StorageResult<Vec<ChannelImageFile>>;

    /// Locations of the images of the named channels acquired at the given sites
    async fn image_file_locations(
        &self,
        channel_names: &[String],
        site_ids: &[SiteId],
    ) -> StorageResult<Vec<String>>;

    async fn illumstats(&self, channel_id: ChannelId) -> StorageResult<Option<IllumStats>>;

    /// Highest zoom level of the experiment's channel layers
    async fn max_zoom_level(&self) -> StorageResult<u32>;

    async fn get_or_create_mapobject_type(
        &self,
        name: &str,
        ref_type: Option<HierarchyLevel>,
    ) -> StorageResult<MapobjectType>;

    async fn mapobject_type(&self, name: &str) -> StorageResult<Option<MapobjectType>>;

    async fn mapobject_types(&self) -> StorageResult<Vec<MapobjectType>>;

    /// Deletes all analysis object types (no `ref_type`) except those named
    /// in `keep`, with their objects, segmentations, layers and features.
    async fn delete_leaf_mapobject_types(&self, keep: &BTreeSet<String>) -> StorageResult<usize>;

    /// Inserts the feature unless one with the same name exists for the type,
    /// and returns the id either way.
    async fn get_or_create_feature(
        &self,
        name: &str,
        mapobject_type_id: MapobjectTypeId,
        is_aggregate: bool,
    ) -> StorageResult<FeatureId>;

    async fn features(&self, mapobject_type_id: MapobjectTypeId) -> StorageResult<Vec<Feature>>;

    /// Deletes all feature values of objects of the given type
    async fn delete_feature_values(&self, mapobject_type_id: MapobjectTypeId)
        -> StorageResult<usize>;

    /// Deletes features of the type that are not listed in `keep`
    async fn retain_features(
        &self,
        mapobject_type_id: MapobjectTypeId,
        keep: &BTreeSet<FeatureId>,
    ) -> StorageResult<usize>;

    async fn get_or_create_segmentation_layer(
        &self,
        mapobject_type_id: MapobjectTypeId,
        tpoint: usize,
        zplane: usize,
    ) -> StorageResult<SegmentationLayer>;

    async fn segmentation_layers(&self) -> StorageResult<Vec<SegmentationLayer>>;

    async fn update_zoom_thresholds(
        &self,
        layer_id: SegmentationLayerId,
        polygon_threshold: u32,
        centroid_threshold: u32,
    ) -> StorageResult<()>;

    /// Deletes objects of the type segmented in the site, cascading to their
    /// segmentations and feature values.
    async fn delete_mapobjects(
        &self,
        mapobject_type_id: MapobjectTypeId,
        site_id: SiteId,
    ) -> StorageResult<usize>;

    async fn insert_mapobjects(
        &self,
        mapobject_type_id: MapobjectTypeId,
        site_id: SiteId,
        count: usize,
    ) -> StorageResult<Vec<MapobjectId>>;

    async fn insert_segmentations(&self, segmentations: Vec<Segmentation>) -> StorageResult<()>;

    async fn insert_feature_values(&self, values: Vec<FeatureValues>) -> StorageResult<()>;

    /// Labelled outlines of objects of the type segmented in the site
    async fn segmentations(
        &self,
        mapobject_type_id: MapobjectTypeId,
        site_id: SiteId,
        tpoint: usize,
        zplane: usize,
    ) -> StorageResult<Vec<(i64, Polygon)>>;

    /// Deletes objects whose polygon is empty or degenerate
    async fn delete_invalid_mapobjects(&self) -> StorageResult<usize>;

    /// Deletes analysis objects without any segmentation
    async fn delete_missing_mapobjects(&self) -> StorageResult<usize>;

    /// The unique structural object type of the level and all its objects.
    ///
    /// Fails with [`StorageError::NotUnique`](super::StorageError::NotUnique)
    /// when no type or more than one type references the level.
    async fn reference_objects(&self, level: HierarchyLevel) -> StorageResult<ReferenceObjects>;

    /// Feature values of objects of the type that intersect `geometry`,
    /// grouped by time point in ascending order.
    async fn intersecting_feature_values(
        &self,
        mapobject_type_id: MapobjectTypeId,
        geometry: &Polygon,
    ) -> StorageResult<Vec<TimepointValues>>;

    /// Number of objects of the type that intersect `geometry`, per time
    /// point of their segmentation layer.
    async fn intersecting_mapobject_counts(
        &self,
        mapobject_type_id: MapobjectTypeId,
        geometry: &Polygon,
    ) -> StorageResult<BTreeMap<usize, usize>>;
}
