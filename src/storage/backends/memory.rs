//! In-memory persistence backend
//!
//! Used by tests and by local runs of the binary, which load and save the
//! whole experiment as a JSON snapshot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::geometry::{Point, Polygon};
use crate::image::IllumStats;
use crate::storage::{
    error::{StorageError, StorageResult},
    traits::ExperimentStore,
    types::*,
};

/// Complete persisted state of one experiment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub next_id: i64,
    pub max_zoom_level: u32,
    pub sites: BTreeMap<SiteId, Site>,
    pub channels: BTreeMap<ChannelId, Channel>,
    pub image_files: Vec<ChannelImageFile>,
    pub illumstats: BTreeMap<ChannelId, IllumStats>,
    pub mapobject_types: BTreeMap<MapobjectTypeId, MapobjectType>,
    pub mapobjects: BTreeMap<MapobjectId, Mapobject>,
    pub segmentations: Vec<Segmentation>,
    pub segmentation_layers: BTreeMap<SegmentationLayerId, SegmentationLayer>,
    pub features: BTreeMap<FeatureId, Feature>,
    pub feature_values: Vec<FeatureValues>,
}

impl ExperimentSnapshot {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove_mapobjects(&mut self, ids: &BTreeSet<MapobjectId>) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let before = self.mapobjects.len();
        self.mapobjects.retain(|id, _| !ids.contains(id));
        self.segmentations.retain(|s| !ids.contains(&s.mapobject_id));
        self.feature_values.retain(|v| !ids.contains(&v.mapobject_id));
        before - self.mapobjects.len()
    }

    fn mapobject_ids_of_type(&self, mapobject_type_id: MapobjectTypeId) -> BTreeSet<MapobjectId> {
        self.mapobjects
            .values()
            .filter(|m| m.mapobject_type_id == mapobject_type_id)
            .map(|m| m.id)
            .collect()
    }

    /// Feature values of all objects of the type
    pub fn feature_values_of_type(&self, mapobject_type_id: MapobjectTypeId) -> Vec<&FeatureValues> {
        let ids = self.mapobject_ids_of_type(mapobject_type_id);
        self.feature_values
            .iter()
            .filter(|v| ids.contains(&v.mapobject_id))
            .collect()
    }

    pub fn mapobject_type_by_name(&self, name: &str) -> Option<&MapobjectType> {
        self.mapobject_types.values().find(|t| t.name == name)
    }
}

/// Mutex-guarded experiment store kept entirely in memory
#[derive(Clone, Default)]
pub struct InMemoryExperimentStore {
    state: Arc<RwLock<ExperimentSnapshot>>,
}

impl InMemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: ExperimentSnapshot) -> Self {
        Self {
            state: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// Load a snapshot previously written by [`save`](Self::save)
    pub async fn load(path: &Path) -> StorageResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let snapshot: ExperimentSnapshot = serde_json::from_str(&content)?;
        debug!("Loaded experiment snapshot from {}", path.display());
        Ok(Self::from_snapshot(snapshot))
    }

    pub async fn save(&self, path: &Path) -> StorageResult<()> {
        let json = serde_json::to_string_pretty(&*self.state.read().await)?;
        tokio::fs::write(path, json).await?;
        debug!("Saved experiment snapshot to {}", path.display());
        Ok(())
    }

    /// Copy of the current state for inspection
    pub async fn snapshot(&self) -> ExperimentSnapshot {
        self.state.read().await.clone()
    }

    pub async fn set_max_zoom_level(&self, level: u32) {
        self.state.write().await.max_zoom_level = level;
    }

    pub async fn add_site(&self, site: Site) {
        let mut state = self.state.write().await;
        state.next_id = state.next_id.max(site.id);
        state.sites.insert(site.id, site);
    }

    pub async fn add_channel(&self, name: &str, bit_depth: u32) -> ChannelId {
        let mut state = self.state.write().await;
        let id = state.allocate_id();
        state.channels.insert(
            id,
            Channel {
                id,
                name: name.to_string(),
                bit_depth,
            },
        );
        id
    }

    pub async fn add_image_file(
        &self,
        site_id: SiteId,
        channel_id: ChannelId,
        tpoint: usize,
        zplane: usize,
        location: &str,
    ) -> i64 {
        let mut state = self.state.write().await;
        let id = state.allocate_id();
        state.image_files.push(ChannelImageFile {
            id,
            site_id,
            channel_id,
            tpoint,
            zplane,
            location: location.to_string(),
            y_shift: 0,
            x_shift: 0,
        });
        id
    }

    pub async fn add_illumstats(&self, channel_id: ChannelId, stats: IllumStats) {
        self.state.write().await.illumstats.insert(channel_id, stats);
    }

    /// Adds a structural object of a hierarchy level, creating the level's
    /// object type on first use.
    pub async fn add_reference_object(
        &self,
        level: HierarchyLevel,
        site_id: Option<SiteId>,
        outline: Polygon,
    ) -> StorageResult<MapobjectId> {
        let mapobject_type = self
            .get_or_create_mapobject_type(level.as_str(), Some(level))
            .await?;
        let layer = self
            .get_or_create_segmentation_layer(mapobject_type.id, 0, 0)
            .await?;
        let mut state = self.state.write().await;
        let id = state.allocate_id();
        state.mapobjects.insert(
            id,
            Mapobject {
                id,
                mapobject_type_id: mapobject_type.id,
                site_id,
            },
        );
        let centroid = outline.centroid().unwrap_or(Point::new(0.0, 0.0));
        state.segmentations.push(Segmentation {
            mapobject_id: id,
            segmentation_layer_id: layer.id,
            label: id,
            geom_polygon: Some(outline),
            geom_centroid: centroid,
        });
        Ok(id)
    }
}

#[async_trait]
impl ExperimentStore for InMemoryExperimentStore {
    async fn sites(&self) -> StorageResult<Vec<Site>> {
        Ok(self.state.read().await.sites.values().cloned().collect())
    }

    async fn site(&self, id: SiteId) -> StorageResult<Site> {
        self.state
            .read()
            .await
            .sites
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("site {}", id)))
    }

    async fn channel(&self, name: &str) -> StorageResult<Channel> {
        self.state
            .read()
            .await
            .channels
            .values()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("channel \"{}\"", name)))
    }

    async fn channel_image_files(
        &self,
        site_id: SiteId,
        channel_id: ChannelId,
    ) -> StorageResult<Vec<ChannelImageFile>> {
        Ok(self
            .state
            .read()
            .await
            .image_files
            .iter()
            .filter(|f| f.site_id == site_id && f.channel_id == channel_id)
            .cloned()
            .collect())
    }

    async fn image_file_locations(
        &self,
        channel_names: &[String],
        site_ids: &[SiteId],
    ) -> StorageResult<Vec<String>> {
        let state = self.state.read().await;
        let channel_ids: BTreeSet<ChannelId> = state
            .channels
            .values()
            .filter(|c| channel_names.contains(&c.name))
            .map(|c| c.id)
            .collect();
        Ok(state
            .image_files
            .iter()
            .filter(|f| channel_ids.contains(&f.channel_id) && site_ids.contains(&f.site_id))
            .map(|f| f.location.clone())
            .collect())
    }

    async fn illumstats(&self, channel_id: ChannelId) -> StorageResult<Option<IllumStats>> {
        Ok(self.state.read().await.illumstats.get(&channel_id).cloned())
    }

    async fn max_zoom_level(&self) -> StorageResult<u32> {
        Ok(self.state.read().await.max_zoom_level)
    }

    async fn get_or_create_mapobject_type(
        &self,
        name: &str,
        ref_type: Option<HierarchyLevel>,
    ) -> StorageResult<MapobjectType> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.mapobject_type_by_name(name) {
            return Ok(existing.clone());
        }
        let id = state.allocate_id();
        let mapobject_type = MapobjectType {
            id,
            name: name.to_string(),
            ref_type,
        };
        state.mapobject_types.insert(id, mapobject_type.clone());
        Ok(mapobject_type)
    }

    async fn mapobject_type(&self, name: &str) -> StorageResult<Option<MapobjectType>> {
        Ok(self.state.read().await.mapobject_type_by_name(name).cloned())
    }

    async fn mapobject_types(&self) -> StorageResult<Vec<MapobjectType>> {
        Ok(self.state.read().await.mapobject_types.values().cloned().collect())
    }

    async fn delete_leaf_mapobject_types(&self, keep: &BTreeSet<String>) -> StorageResult<usize> {
        let mut state = self.state.write().await;
        let type_ids: BTreeSet<MapobjectTypeId> = state
            .mapobject_types
            .values()
            .filter(|t| t.is_leaf() && !keep.contains(&t.name))
            .map(|t| t.id)
            .collect();
        let object_ids: BTreeSet<MapobjectId> = state
            .mapobjects
            .values()
            .filter(|m| type_ids.contains(&m.mapobject_type_id))
            .map(|m| m.id)
            .collect();
        state.remove_mapobjects(&object_ids);
        state
            .segmentation_layers
            .retain(|_, l| !type_ids.contains(&l.mapobject_type_id));
        state
            .features
            .retain(|_, f| !type_ids.contains(&f.mapobject_type_id));
        state.mapobject_types.retain(|id, _| !type_ids.contains(id));
        Ok(type_ids.len())
    }

    async fn get_or_create_feature(
        &self,
        name: &str,
        mapobject_type_id: MapobjectTypeId,
        is_aggregate: bool,
    ) -> StorageResult<FeatureId> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .features
            .values()
            .find(|f| f.name == name && f.mapobject_type_id == mapobject_type_id)
        {
            return Ok(existing.id);
        }
        let id = state.allocate_id();
        state.features.insert(
            id,
            Feature {
                id,
                name: name.to_string(),
                mapobject_type_id,
                is_aggregate,
            },
        );
        Ok(id)
    }

    async fn features(&self, mapobject_type_id: MapobjectTypeId) -> StorageResult<Vec<Feature>> {
        Ok(self
            .state
            .read()
            .await
            .features
            .values()
            .filter(|f| f.mapobject_type_id == mapobject_type_id)
            .cloned()
            .collect())
    }

    async fn delete_feature_values(
        &self,
        mapobject_type_id: MapobjectTypeId,
    ) -> StorageResult<usize> {
        let mut state = self.state.write().await;
        let ids = state.mapobject_ids_of_type(mapobject_type_id);
        let before = state.feature_values.len();
        state.feature_values.retain(|v| !ids.contains(&v.mapobject_id));
        Ok(before - state.feature_values.len())
    }

    async fn retain_features(
        &self,
        mapobject_type_id: MapobjectTypeId,
        keep: &BTreeSet<FeatureId>,
    ) -> StorageResult<usize> {
        let mut state = self.state.write().await;
        let removed: BTreeSet<FeatureId> = state
            .features
            .values()
            .filter(|f| f.mapobject_type_id == mapobject_type_id && !keep.contains(&f.id))
            .map(|f| f.id)
            .collect();
        state.features.retain(|id, _| !removed.contains(id));
        for values in state.feature_values.iter_mut() {
            values.values.retain(|id, _| !removed.contains(id));
        }
        Ok(removed.len())
    }

    async fn get_or_create_segmentation_layer(
        &self,
        mapobject_type_id: MapobjectTypeId,
        tpoint: usize,
        zplane: usize,
    ) -> StorageResult<SegmentationLayer> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.segmentation_layers.values().find(|l| {
            l.mapobject_type_id == mapobject_type_id && l.tpoint == tpoint && l.zplane == zplane
        }) {
            return Ok(existing.clone());
        }
        let id = state.allocate_id();
        let layer = SegmentationLayer {
            id,
            mapobject_type_id,
            tpoint,
            zplane,
            polygon_threshold: 0,
            centroid_threshold: 0,
        };
        state.segmentation_layers.insert(id, layer.clone());
        Ok(layer)
    }

    async fn segmentation_layers(&self) -> StorageResult<Vec<SegmentationLayer>> {
        Ok(self
            .state
            .read()
            .await
            .segmentation_layers
            .values()
            .cloned()
            .collect())
    }

    async fn update_zoom_thresholds(
        &self,
        layer_id: SegmentationLayerId,
        polygon_threshold: u32,
        centroid_threshold: u32,
    ) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let layer = state
            .segmentation_layers
            .get_mut(&layer_id)
            .ok_or_else(|| StorageError::not_found(format!("segmentation layer {}", layer_id)))?;
        layer.polygon_threshold = polygon_threshold;
        layer.centroid_threshold = centroid_threshold;
        Ok(())
    }

    async fn delete_mapobjects(
        &self,
        mapobject_type_id: MapobjectTypeId,
        site_id: SiteId,
    ) -> StorageResult<usize> {
        let mut state = self.state.write().await;
        let ids: BTreeSet<MapobjectId> = state
            .mapobjects
            .values()
            .filter(|m| m.mapobject_type_id == mapobject_type_id && m.site_id == Some(site_id))
            .map(|m| m.id)
            .collect();
        Ok(state.remove_mapobjects(&ids))
    }

    async fn insert_mapobjects(
        &self,
        mapobject_type_id: MapobjectTypeId,
        site_id: SiteId,
        count: usize,
    ) -> StorageResult<Vec<MapobjectId>> {
        let mut state = self.state.write().await;
        if !state.mapobject_types.contains_key(&mapobject_type_id) {
            return Err(StorageError::not_found(format!(
                "mapobject type {}",
                mapobject_type_id
            )));
        }
        let ids: Vec<MapobjectId> = (0..count).map(|_| state.allocate_id()).collect();
        for &id in &ids {
            state.mapobjects.insert(
                id,
                Mapobject {
                    id,
                    mapobject_type_id,
                    site_id: Some(site_id),
                },
            );
        }
        Ok(ids)
    }

    async fn insert_segmentations(&self, segmentations: Vec<Segmentation>) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if let Some(orphan) = segmentations
            .iter()
            .find(|s| !state.mapobjects.contains_key(&s.mapobject_id))
        {
            return Err(StorageError::conflict(format!(
                "segmentation references unknown mapobject {}",
                orphan.mapobject_id
            )));
        }
        state.segmentations.extend(segmentations);
        Ok(())
    }

    async fn insert_feature_values(&self, values: Vec<FeatureValues>) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if let Some(orphan) = values
            .iter()
            .find(|v| !state.mapobjects.contains_key(&v.mapobject_id))
        {
            return Err(StorageError::conflict(format!(
                "feature values reference unknown mapobject {}",
                orphan.mapobject_id
            )));
        }
        state.feature_values.extend(values);
        Ok(())
    }

    async fn segmentations(
        &self,
        mapobject_type_id: MapobjectTypeId,
        site_id: SiteId,
        tpoint: usize,
        zplane: usize,
    ) -> StorageResult<Vec<(i64, Polygon)>> {
        let state = self.state.read().await;
        let layer_ids: BTreeSet<SegmentationLayerId> = state
            .segmentation_layers
            .values()
            .filter(|l| {
                l.mapobject_type_id == mapobject_type_id && l.tpoint == tpoint && l.zplane == zplane
            })
            .map(|l| l.id)
            .collect();
        Ok(state
            .segmentations
            .iter()
            .filter(|s| layer_ids.contains(&s.segmentation_layer_id))
            .filter(|s| {
                state
                    .mapobjects
                    .get(&s.mapobject_id)
                    .is_some_and(|m| m.site_id == Some(site_id))
            })
            .filter_map(|s| s.geom_polygon.clone().map(|p| (s.label, p)))
            .collect())
    }

    async fn delete_invalid_mapobjects(&self) -> StorageResult<usize> {
        let mut state = self.state.write().await;
        let ids: BTreeSet<MapobjectId> = state
            .segmentations
            .iter()
            .filter(|s| s.geom_polygon.as_ref().is_some_and(Polygon::is_empty))
            .map(|s| s.mapobject_id)
            .collect();
        Ok(state.remove_mapobjects(&ids))
    }

    async fn delete_missing_mapobjects(&self) -> StorageResult<usize> {
        let mut state = self.state.write().await;
        let segmented: BTreeSet<MapobjectId> =
            state.segmentations.iter().map(|s| s.mapobject_id).collect();
        let leaf_types: BTreeSet<MapobjectTypeId> = state
            .mapobject_types
            .values()
            .filter(|t| t.is_leaf())
            .map(|t| t.id)
            .collect();
        let ids: BTreeSet<MapobjectId> = state
            .mapobjects
            .values()
            .filter(|m| leaf_types.contains(&m.mapobject_type_id) && !segmented.contains(&m.id))
            .map(|m| m.id)
            .collect();
        Ok(state.remove_mapobjects(&ids))
    }

    async fn reference_objects(&self, level: HierarchyLevel) -> StorageResult<ReferenceObjects> {
        let state = self.state.read().await;
        let types: Vec<&MapobjectType> = state
            .mapobject_types
            .values()
            .filter(|t| t.ref_type == Some(level))
            .collect();
        let [mapobject_type] = types[..] else {
            return Err(StorageError::not_unique(format!(
                "expected one mapobject type referencing \"{}\", found {}",
                level,
                types.len()
            )));
        };
        let ids = state.mapobject_ids_of_type(mapobject_type.id);
        let mut seen = BTreeSet::new();
        let objects = state
            .segmentations
            .iter()
            .filter(|s| ids.contains(&s.mapobject_id))
            .filter_map(|s| {
                let geometry = s.geom_polygon.clone()?;
                seen.insert(s.mapobject_id).then_some(ReferenceObject {
                    mapobject_id: s.mapobject_id,
                    geometry,
                })
            })
            .collect();
        Ok(ReferenceObjects {
            mapobject_type: mapobject_type.clone(),
            objects,
        })
    }

    async fn intersecting_feature_values(
        &self,
        mapobject_type_id: MapobjectTypeId,
        geometry: &Polygon,
    ) -> StorageResult<Vec<TimepointValues>> {
        let state = self.state.read().await;
        let ids = state.mapobject_ids_of_type(mapobject_type_id);
        let intersecting: BTreeSet<MapobjectId> = state
            .segmentations
            .iter()
            .filter(|s| ids.contains(&s.mapobject_id))
            .filter(|s| match &s.geom_polygon {
                Some(polygon) => polygon.intersects(geometry),
                None => geometry.contains_point(&s.geom_centroid),
            })
            .map(|s| s.mapobject_id)
            .collect();
        let mut grouped: BTreeMap<usize, Vec<BTreeMap<FeatureId, f64>>> = BTreeMap::new();
        for values in state
            .feature_values
            .iter()
            .filter(|v| intersecting.contains(&v.mapobject_id))
        {
            grouped
                .entry(values.tpoint)
                .or_default()
                .push(values.values.clone());
        }
        Ok(grouped
            .into_iter()
            .map(|(tpoint, values)| TimepointValues { tpoint, values })
            .collect())
    }

    async fn intersecting_mapobject_counts(
        &self,
        mapobject_type_id: MapobjectTypeId,
        geometry: &Polygon,
    ) -> StorageResult<BTreeMap<usize, usize>> {
        let state = self.state.read().await;
        let ids = state.mapobject_ids_of_type(mapobject_type_id);
        let mut per_tpoint: BTreeMap<usize, BTreeSet<MapobjectId>> = BTreeMap::new();
        for segmentation in state
            .segmentations
            .iter()
            .filter(|s| ids.contains(&s.mapobject_id))
        {
            let hit = match &segmentation.geom_polygon {
                Some(polygon) => polygon.intersects(geometry),
                None => geometry.contains_point(&segmentation.geom_centroid),
            };
            let Some(layer) = state
                .segmentation_layers
                .get(&segmentation.segmentation_layer_id)
            else {
                continue;
            };
            if hit {
                per_tpoint
                    .entry(layer.tpoint)
                    .or_default()
                    .insert(segmentation.mapobject_id);
            }
        }
        Ok(per_tpoint
            .into_iter()
            .map(|(tpoint, objects)| (tpoint, objects.len()))
            .collect())
    }
}
