//! Bottom-up aggregation of object features over the containment hierarchy
//!
//! After all jobs of a step finished, the features of every analysis (leaf)
//! object type are summarized per site, and the site aggregates are rolled
//! up to wells and plates. Aggregates are stored as features of the
//! structural object type of each level.

pub mod statistics;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::{
    round_feature_value, ExperimentStore, FeatureId, FeatureValues, HierarchyLevel, MapobjectId,
    ReferenceObjects, SegmentationLayer, TimepointValues,
};
pub use statistics::{aggregate_feature_name, count_feature_name, Statistic};

/// Aggregate values per reference object and time point
type Accumulated = BTreeMap<(MapobjectId, usize), BTreeMap<FeatureId, f64>>;

/// Outcome of one collect run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationReport {
    pub deleted_invalid: usize,
    pub deleted_missing: usize,
    /// Names of the aggregate features present at each level
    pub levels: BTreeMap<HierarchyLevel, Vec<String>>,
}

impl AggregationReport {
    pub fn features(&self, level: HierarchyLevel) -> &[String] {
        self.levels.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub struct HierarchicalAggregator {
    store: Arc<dyn ExperimentStore>,
}

impl HierarchicalAggregator {
    pub fn new(store: Arc<dyn ExperimentStore>) -> Self {
        Self { store }
    }

    /// Cleans up and recomputes the aggregates of all hierarchy levels.
    pub async fn run(&self) -> Result<AggregationReport> {
        let (deleted_invalid, deleted_missing) = self.cleanup().await?;
        let mut report = AggregationReport {
            deleted_invalid,
            deleted_missing,
            ..Default::default()
        };
        report
            .levels
            .insert(HierarchyLevel::finest(), self.aggregate().await?);
        for level in HierarchyLevel::ALL.into_iter().skip(1) {
            report.levels.insert(level, self.rollup(level).await?);
        }
        Ok(report)
    }

    /// Refreshes zoom thresholds, removes invalid and missing objects and
    /// drops the aggregate values of all structural types.
    ///
    /// Feature catalog entries stay so that re-aggregation reuses their ids.
    pub async fn cleanup(&self) -> Result<(usize, usize)> {
        let (polygon_threshold, centroid_threshold) =
            SegmentationLayer::zoom_thresholds(self.store.max_zoom_level().await?);
        for layer in self.store.segmentation_layers().await? {
            self.store
                .update_zoom_thresholds(layer.id, polygon_threshold, centroid_threshold)
                .await?;
        }

        let invalid = self.store.delete_invalid_mapobjects().await?;
        let missing = self.store.delete_missing_mapobjects().await?;
        info!(
            "deleted {} invalid and {} missing objects",
            invalid, missing
        );

        for mapobject_type in self.store.mapobject_types().await? {
            if mapobject_type.is_leaf() {
                continue;
            }
            let deleted = self.store.delete_feature_values(mapobject_type.id).await?;
            debug!(
                "deleted {} aggregate values of type \"{}\"",
                deleted, mapobject_type.name
            );
        }
        Ok((invalid, missing))
    }

    /// Summarizes the features of every leaf type over the objects of the
    /// finest level. Returns the names of the aggregate features.
    pub async fn aggregate(&self) -> Result<Vec<String>> {
        let level = HierarchyLevel::finest();
        let reference = self.store.reference_objects(level).await?;
        let ref_type_id = reference.mapobject_type.id;
        let mut generated = BTreeMap::new();
        let mut accumulated = Accumulated::new();

        for leaf in self.store.mapobject_types().await? {
            if !leaf.is_leaf() {
                continue;
            }
            info!("aggregate objects \"{}\" per {}", leaf.name, level);
            let features = self.store.features(leaf.id).await?;

            if features.is_empty() {
                let name = count_feature_name(&leaf.name);
                let id = self
                    .store
                    .get_or_create_feature(&name, ref_type_id, true)
                    .await?;
                generated.insert(id, name);
                for object in &reference.objects {
                    let counts = self
                        .store
                        .intersecting_mapobject_counts(leaf.id, &object.geometry)
                        .await?;
                    for (tpoint, count) in counts {
                        accumulated
                            .entry((object.mapobject_id, tpoint))
                            .or_default()
                            .insert(id, count as f64);
                    }
                }
                continue;
            }

            let mut derived = Vec::with_capacity(features.len() * Statistic::ALL.len());
            for feature in &features {
                for statistic in Statistic::ALL {
                    let name = aggregate_feature_name(&feature.name, &leaf.name, statistic);
                    let id = self
                        .store
                        .get_or_create_feature(&name, ref_type_id, true)
                        .await?;
                    generated.insert(id, name);
                    derived.push((feature.id, statistic, id));
                }
            }
            for object in &reference.objects {
                let groups = self
                    .store
                    .intersecting_feature_values(leaf.id, &object.geometry)
                    .await?;
                for group in groups {
                    let values = accumulated
                        .entry((object.mapobject_id, group.tpoint))
                        .or_default();
                    summarize(&group, &derived, values);
                }
            }
        }

        self.finish_level(level, &reference, generated, accumulated)
            .await
    }

    /// Rolls the aggregates of the next finer level up to `level`, keeping
    /// their names and re-applying the statistic named by their suffix.
    pub async fn rollup(&self, level: HierarchyLevel) -> Result<Vec<String>> {
        let Some(finer) = level.finer() else {
            return self.aggregate().await;
        };
        info!("roll up aggregates from {} to {}", finer, level);
        let source = self.store.reference_objects(finer).await?;
        let reference = self.store.reference_objects(level).await?;
        let mut generated = BTreeMap::new();
        let mut accumulated = Accumulated::new();

        let mut derived = Vec::new();
        for feature in self.store.features(source.mapobject_type.id).await? {
            if !feature.is_aggregate {
                continue;
            }
            let Some(statistic) = Statistic::from_feature_name(&feature.name) else {
                debug!("skip feature \"{}\" without statistic suffix", feature.name);
                continue;
            };
            let id = self
                .store
                .get_or_create_feature(&feature.name, reference.mapobject_type.id, true)
                .await?;
            generated.insert(id, feature.name);
            derived.push((feature.id, statistic.rollup(), id));
        }

        for object in &reference.objects {
            let groups = self
                .store
                .intersecting_feature_values(source.mapobject_type.id, &object.geometry)
                .await?;
            for group in groups {
                let values = accumulated
                    .entry((object.mapobject_id, group.tpoint))
                    .or_default();
                summarize(&group, &derived, values);
            }
        }

        self.finish_level(level, &reference, generated, accumulated)
            .await
    }

    /// Writes the accumulated values and prunes aggregate features of the
    /// level that were not produced by this run.
    async fn finish_level(
        &self,
        level: HierarchyLevel,
        reference: &ReferenceObjects,
        generated: BTreeMap<FeatureId, String>,
        accumulated: Accumulated,
    ) -> Result<Vec<String>> {
        let records: Vec<FeatureValues> = accumulated
            .into_iter()
            .map(|((mapobject_id, tpoint), values)| FeatureValues {
                mapobject_id,
                tpoint,
                values,
            })
            .collect();
        info!(
            "insert {} aggregate records for {} features at {} level",
            records.len(),
            generated.len(),
            level
        );
        self.store.insert_feature_values(records).await?;

        let keep: BTreeSet<FeatureId> = generated.keys().copied().collect();
        let pruned = self
            .store
            .retain_features(reference.mapobject_type.id, &keep)
            .await?;
        if pruned > 0 {
            debug!("pruned {} stale aggregate features of {}", pruned, level);
        }

        let mut names: Vec<String> = generated.into_values().collect();
        names.sort();
        Ok(names)
    }
}

/// Applies each `(source feature, statistic, target feature)` triple to the
/// values of one time point. Objects lacking the source feature count as
/// missing.
fn summarize(
    group: &TimepointValues,
    derived: &[(FeatureId, Statistic, FeatureId)],
    values: &mut BTreeMap<FeatureId, f64>,
) {
    for &(source_id, statistic, target) in derived {
        let column: Vec<f64> = group
            .values
            .iter()
            .map(|row| row.get(&source_id).copied().unwrap_or(f64::NAN))
            .collect();
        values.insert(target, round_feature_value(statistic.apply(&column)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::geometry::{Point, Polygon};
    use crate::storage::{InMemoryExperimentStore, MapobjectTypeId, Segmentation, Site};

    /// Two sites in one well, one well in one plate, with a gap between sites.
    async fn hierarchy() -> (Arc<InMemoryExperimentStore>, Vec<MapobjectId>) {
        let store = Arc::new(InMemoryExperimentStore::new());
        store.set_max_zoom_level(6).await;
        let mut sites = Vec::new();
        for (id, x) in [(1, 0.0), (2, 20.0)] {
            store
                .add_site(Site {
                    id,
                    y_offset: 0,
                    x_offset: 0,
                    aligned_height: 10,
                    aligned_width: 10,
                    origin: Point::new(x, 0.0),
                })
                .await;
            let site = store
                .add_reference_object(
                    HierarchyLevel::Site,
                    Some(id),
                    Polygon::rectangle(x, 0.0, 10.0, 10.0),
                )
                .await
                .unwrap();
            sites.push(site);
        }
        store
            .add_reference_object(
                HierarchyLevel::Well,
                None,
                Polygon::rectangle(-1.0, -1.0, 32.0, 12.0),
            )
            .await
            .unwrap();
        store
            .add_reference_object(
                HierarchyLevel::Plate,
                None,
                Polygon::rectangle(-2.0, -2.0, 34.0, 14.0),
            )
            .await
            .unwrap();
        (store, sites)
    }

    /// Adds leaf objects with one `area` value each at the given positions
    async fn add_cells(
        store: &InMemoryExperimentStore,
        site_id: i64,
        cells: &[(f64, f64, Option<f64>)],
    ) -> MapobjectTypeId {
        let cell_type = store.get_or_create_mapobject_type("Cells", None).await.unwrap();
        let area = store
            .get_or_create_feature("area", cell_type.id, false)
            .await
            .unwrap();
        let layer = store
            .get_or_create_segmentation_layer(cell_type.id, 0, 0)
            .await
            .unwrap();
        let ids = store
            .insert_mapobjects(cell_type.id, site_id, cells.len())
            .await
            .unwrap();
        let mut segmentations = Vec::new();
        let mut values = Vec::new();
        for (index, (&id, &(x, y, value))) in ids.iter().zip(cells).enumerate() {
            let polygon = Polygon::rectangle(x, y, 1.0, 1.0);
            segmentations.push(Segmentation {
                mapobject_id: id,
                segmentation_layer_id: layer.id,
                label: index as i64 + 1,
                geom_centroid: polygon.centroid().unwrap(),
                geom_polygon: Some(polygon),
            });
            values.push(FeatureValues {
                mapobject_id: id,
                tpoint: 0,
                values: BTreeMap::from([(area, value.unwrap_or(f64::NAN))]),
            });
        }
        store.insert_segmentations(segmentations).await.unwrap();
        store.insert_feature_values(values).await.unwrap();
        cell_type.id
    }

    fn value_of(
        snapshot: &crate::storage::ExperimentSnapshot,
        mapobject_id: MapobjectId,
        feature: &str,
    ) -> f64 {
        let owner = snapshot.mapobjects[&mapobject_id].mapobject_type_id;
        let feature = snapshot
            .features
            .values()
            .find(|f| f.name == feature && f.mapobject_type_id == owner)
            .unwrap_or_else(|| panic!("feature {} missing", feature));
        snapshot
            .feature_values
            .iter()
            .filter(|v| v.mapobject_id == mapobject_id)
            .find_map(|v| v.values.get(&feature.id).copied())
            .unwrap_or_else(|| panic!("no value of {} for {}", feature.name, mapobject_id))
    }

    #[tokio::test]
    async fn test_site_statistics_and_rollup() {
        let (store, sites) = hierarchy().await;
        add_cells(&store, 1, &[(1.0, 1.0, Some(2.0)), (4.0, 4.0, Some(4.0))]).await;
        add_cells(&store, 2, &[(21.0, 1.0, Some(9.0)), (24.0, 4.0, None)]).await;

        let aggregator = HierarchicalAggregator::new(store.clone());
        let report = aggregator.run().await.unwrap();
        assert_eq!(report.features(HierarchyLevel::Site).len(), 5);
        assert_eq!(
            report.features(HierarchyLevel::Plate),
            report.features(HierarchyLevel::Site)
        );

        let snapshot = store.snapshot().await;
        assert_eq!(value_of(&snapshot, sites[0], "area_Cells_Mean"), 3.0);
        assert_eq!(value_of(&snapshot, sites[0], "area_Cells_Count"), 2.0);
        assert_eq!(value_of(&snapshot, sites[1], "area_Cells_Sum"), 9.0);
        assert_eq!(value_of(&snapshot, sites[1], "area_Cells_Min"), 9.0);

        let well = snapshot.mapobject_type_by_name("Well").unwrap().id;
        let well_object = snapshot
            .mapobjects
            .values()
            .find(|m| m.mapobject_type_id == well)
            .unwrap()
            .id;
        assert_eq!(value_of(&snapshot, well_object, "area_Cells_Count"), 4.0);
        assert_eq!(value_of(&snapshot, well_object, "area_Cells_Max"), 9.0);
        assert_eq!(value_of(&snapshot, well_object, "area_Cells_Min"), 2.0);
        assert_eq!(value_of(&snapshot, well_object, "area_Cells_Mean"), 6.0);
    }

    #[tokio::test]
    async fn test_leaf_without_features_is_counted() {
        let (store, sites) = hierarchy().await;
        let nuclei = store.get_or_create_mapobject_type("Nuclei", None).await.unwrap();
        let layer = store
            .get_or_create_segmentation_layer(nuclei.id, 0, 0)
            .await
            .unwrap();
        let ids = store.insert_mapobjects(nuclei.id, 1, 3).await.unwrap();
        let segmentations = ids
            .iter()
            .enumerate()
            .map(|(i, &id)| {
                let polygon = Polygon::rectangle(1.0 + 2.0 * i as f64, 1.0, 1.0, 1.0);
                Segmentation {
                    mapobject_id: id,
                    segmentation_layer_id: layer.id,
                    label: i as i64 + 1,
                    geom_centroid: polygon.centroid().unwrap(),
                    geom_polygon: Some(polygon),
                }
            })
            .collect();
        store.insert_segmentations(segmentations).await.unwrap();

        let report = HierarchicalAggregator::new(store.clone()).run().await.unwrap();
        assert_eq!(
            report.features(HierarchyLevel::Site).to_vec(),
            vec!["Nuclei_Count".to_string()]
        );
        let snapshot = store.snapshot().await;
        assert_eq!(value_of(&snapshot, sites[0], "Nuclei_Count"), 3.0);
    }

    #[tokio::test]
    async fn test_rerun_reuses_feature_ids() {
        let (store, _) = hierarchy().await;
        add_cells(&store, 1, &[(1.0, 1.0, Some(1.23456789))]).await;
        let aggregator = HierarchicalAggregator::new(store.clone());
        aggregator.run().await.unwrap();
        let first = store.snapshot().await;
        aggregator.run().await.unwrap();
        let second = store.snapshot().await;

        assert_eq!(first.features, second.features);
        assert_eq!(first.feature_values.len(), second.feature_values.len());
        let site = second.mapobject_type_by_name("Site").unwrap().id;
        let site_object = second
            .mapobjects
            .values()
            .find(|m| m.mapobject_type_id == site && m.site_id == Some(1))
            .unwrap()
            .id;
        assert_eq!(value_of(&second, site_object, "area_Cells_Sum"), 1.234568);
    }

    #[tokio::test]
    async fn test_structural_types_gain_only_aggregates() {
        let (store, _) = hierarchy().await;
        add_cells(&store, 1, &[(1.0, 1.0, Some(2.0))]).await;
        HierarchicalAggregator::new(store.clone()).run().await.unwrap();
        let snapshot = store.snapshot().await;
        for feature in snapshot.features.values() {
            let owner = &snapshot.mapobject_types[&feature.mapobject_type_id];
            assert_eq!(owner.is_leaf(), !feature.is_aggregate, "{}", feature.name);
        }
    }

    #[tokio::test]
    async fn test_missing_level_is_descriptor_error() {
        let store = Arc::new(InMemoryExperimentStore::new());
        let err = HierarchicalAggregator::new(store).run().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Descriptor);
    }
}
