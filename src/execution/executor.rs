//! Runs a pipeline for the sites of one job batch
//!
//! Every site goes through three phases: its inputs are loaded into a fresh
//! [`DataStore`], the active modules run in declared order against that
//! store, and the object collections the pipeline declares as outputs are
//! persisted together with their measurements.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backend::{BackendFactory, BackendRegistry};
use super::handles::{apply_outputs, resolve_inputs, HandleValue};
use super::objects::{ObjectOutline, SegmentedObjectCollection};
use super::partition::JobBatch;
use super::pipeline::{ModuleSpec, Pipeline};
use super::store::DataStore;
use crate::error::{Error, Result};
use crate::image::{ImageArray, ImageReader};
use crate::storage::{
    round_feature_value, ExperimentStore, FeatureId, FeatureValues, MapobjectTypeId, Segmentation,
    SegmentationLayer, SiteId,
};

pub struct ModulePipelineExecutor {
    pipeline: Arc<Pipeline>,
    store: Arc<dyn ExperimentStore>,
    images: Arc<dyn ImageReader>,
    backends: BackendRegistry,
    figures_dir: PathBuf,
    feature_ids: HashMap<MapobjectTypeId, HashMap<String, FeatureId>>,
}

impl ModulePipelineExecutor {
    pub fn new(
        pipeline: Arc<Pipeline>,
        store: Arc<dyn ExperimentStore>,
        images: Arc<dyn ImageReader>,
        backends: BackendFactory,
        figures_dir: PathBuf,
    ) -> Self {
        Self {
            pipeline,
            store,
            images,
            backends: BackendRegistry::new(backends),
            figures_dir,
            feature_ids: HashMap::new(),
        }
    }

    /// Location of the figure of `module` for `site_id`
    pub fn figure_path(figures_dir: &Path, module: &str, site_id: SiteId) -> PathBuf {
        figures_dir.join(format!("{}_site{}.json", module, site_id))
    }

    /// Processes all sites of the batch one after the other.
    pub async fn run_job(&mut self, batch: &JobBatch) -> Result<()> {
        info!(
            "run job {} with {} sites and {} modules",
            batch.id,
            batch.len(),
            self.pipeline.modules.len()
        );
        self.backends
            .start_all(self.pipeline.languages())
            .await?;
        for &site_id in &batch.site_ids {
            info!("process site {}", site_id);
            let mut store = self.load_pipeline_input(site_id).await?;
            self.run_pipeline(&mut store, batch.plot).await?;
            self.save_pipeline_outputs(&mut store).await?;
        }
        Ok(())
    }

    pub async fn load_pipeline_input(&self, site_id: SiteId) -> Result<DataStore> {
        let site = self.store.site(site_id).await?;
        let window = site.alignment_window();
        let mut data = DataStore::new(site_id, site.aligned_height, site.aligned_width);

        for channel_input in &self.pipeline.input.channels {
            info!("load images for channel \"{}\"", channel_input.name);
            let channel = self.store.channel(&channel_input.name).await?;
            let files = self.store.channel_image_files(site_id, channel.id).await?;
            let tpoints: Vec<usize> = distinct(files.iter().map(|f| f.tpoint));
            let zplanes: Vec<usize> = distinct(files.iter().map(|f| f.zplane));
            let mut array = ImageArray::zeros(vec![
                site.aligned_height,
                site.aligned_width,
                zplanes.len().max(1),
                tpoints.len().max(1),
            ]);
            let stats = if channel_input.correct {
                let stats = self.store.illumstats(channel.id).await?.ok_or_else(|| {
                    Error::descriptor(format!(
                        "No illumination statistics found for channel \"{}\"",
                        channel.name
                    ))
                })?;
                Some(stats)
            } else {
                None
            };

            for file in &files {
                let mut image = self.images.read(&file.location).await?;
                if let Some(stats) = &stats {
                    debug!("correct image {} for illumination artifacts", file.location);
                    image = image.correct(stats, channel.bit_depth)?;
                }
                let image = image.align(&window, file.y_shift, file.x_shift);
                let z = zplanes.binary_search(&file.zplane).unwrap_or(0);
                let t = tpoints.binary_search(&file.tpoint).unwrap_or(0);
                array.insert_plane(&image, z, t)?;
            }
            data.observe_planes(zplanes.len(), tpoints.len());
            data.insert(channel_input.name.clone(), HandleValue::Image(array));
        }

        for object_input in &self.pipeline.input.objects {
            info!("load objects of type \"{}\"", object_input.name);
            let mapobject_type = self
                .store
                .mapobject_type(&object_input.name)
                .await?
                .ok_or_else(|| {
                    Error::descriptor(format!(
                        "Input objects \"{}\" do not exist",
                        object_input.name
                    ))
                })?;
            let layers: Vec<SegmentationLayer> = self
                .store
                .segmentation_layers()
                .await?
                .into_iter()
                .filter(|l| l.mapobject_type_id == mapobject_type.id)
                .collect();
            let mut outlines = Vec::new();
            for layer in &layers {
                let segmentations = self
                    .store
                    .segmentations(mapobject_type.id, site_id, layer.tpoint, layer.zplane)
                    .await?;
                outlines.extend(segmentations.into_iter().map(|(label, polygon)| {
                    ObjectOutline {
                        tpoint: layer.tpoint,
                        zplane: layer.zplane,
                        label,
                        polygon: polygon.translate(-site.origin.x, -site.origin.y),
                    }
                }));
            }
            let n_zplanes = layers.iter().map(|l| l.zplane + 1).max().unwrap_or(1);
            let n_tpoints = layers.iter().map(|l| l.tpoint + 1).max().unwrap_or(1);
            let collection = SegmentedObjectCollection::from_outlines(&object_input.name, outlines);
            let labels =
                collection.label_image(site.aligned_height, site.aligned_width, n_zplanes, n_tpoints)?;
            data.observe_planes(n_zplanes, n_tpoints);
            data.insert(object_input.name.clone(), HandleValue::Image(labels));
            data.insert_objects(collection);
        }

        data.squeeze_arrays();
        Ok(data)
    }

    /// Runs the active modules in order. Module `k + 1` only starts after the
    /// outputs of module `k` were written to the store.
    pub async fn run_pipeline(&mut self, data: &mut DataStore, plot: bool) -> Result<()> {
        let pipeline = Arc::clone(&self.pipeline);
        for module in &pipeline.modules {
            self.run_module(module, data, plot).await?;
        }
        Ok(())
    }

    async fn run_module(&mut self, module: &ModuleSpec, data: &mut DataStore, plot: bool) -> Result<()> {
        info!("run module \"{}\"", module.name);
        let inputs = resolve_inputs(&module.name, &module.handles.input, data, plot)?;
        let backend = self.backends.get(module.language).await?;
        backend.bind(inputs)?;
        backend.execute(module).await?;
        let outputs = backend.collect(&module.handles.output)?;
        apply_outputs(&module.name, &module.handles.output, outputs, data)?;

        if plot && module.handles.plot_enabled() {
            match data.take_current_figure() {
                Some(figure) => {
                    let path = Self::figure_path(&self.figures_dir, &module.name, data.site_id());
                    tokio::fs::create_dir_all(&self.figures_dir).await?;
                    tokio::fs::write(&path, figure).await?;
                    debug!("wrote figure {}", path.display());
                    data.record_figure(path);
                }
                None => warn!("module \"{}\" produced no figure", module.name),
            }
        }
        Ok(())
    }

    pub async fn save_pipeline_outputs(&mut self, data: &mut DataStore) -> Result<()> {
        let site = self.store.site(data.site_id()).await?;
        let input_objects: BTreeSet<String> = self
            .pipeline
            .input_object_names()
            .into_iter()
            .map(String::from)
            .collect();

        for output in &self.pipeline.output.objects {
            let collection = data.objects_mut(&output.name).ok_or_else(|| {
                Error::descriptor(format!(
                    "Output objects \"{}\" were not created by the pipeline",
                    output.name
                ))
            })?;
            collection.save = true;
            collection.represent_as_polygons = output.as_polygons;
        }
        let to_save: Vec<SegmentedObjectCollection> = data
            .object_collections()
            .filter(|c| c.save)
            .cloned()
            .collect();

        let (polygon_threshold, centroid_threshold) =
            SegmentationLayer::zoom_thresholds(self.store.max_zoom_level().await?);

        for collection in to_save {
            let name = collection.name().to_string();
            if input_objects.contains(&name) {
                info!("objects \"{}\" were loaded as input, not saving them", name);
                continue;
            }
            info!("save objects \"{}\" of site {}", name, site.id);
            let mapobject_type = self.store.get_or_create_mapobject_type(&name, None).await?;
            if !mapobject_type.is_leaf() {
                return Err(Error::descriptor(format!(
                    "Output objects \"{}\" clash with a structural object type",
                    name
                )));
            }
            let deleted = self
                .store
                .delete_mapobjects(mapobject_type.id, site.id)
                .await?;
            if deleted > 0 {
                debug!("deleted {} previous objects of type \"{}\"", deleted, name);
            }

            let labels: Vec<i64> = collection.labels().into_iter().collect();
            let ids = self
                .store
                .insert_mapobjects(mapobject_type.id, site.id, labels.len())
                .await?;
            let mapobject_ids: BTreeMap<i64, i64> = labels.into_iter().zip(ids).collect();

            let mut segmentations = Vec::new();
            for ((tpoint, zplane), plane) in collection.iter_planes() {
                let layer = self
                    .store
                    .get_or_create_segmentation_layer(mapobject_type.id, tpoint, zplane)
                    .await?;
                self.store
                    .update_zoom_thresholds(layer.id, polygon_threshold, centroid_threshold)
                    .await?;
                for (label, polygon) in plane {
                    if polygon.is_empty() {
                        warn!(
                            "skip empty polygon of object {} of type \"{}\" at site {}",
                            label, name, site.id
                        );
                        continue;
                    }
                    let Some(&mapobject_id) = mapobject_ids.get(label) else {
                        continue;
                    };
                    let polygon = polygon.translate(site.origin.x, site.origin.y);
                    let Some(centroid) = polygon.centroid() else {
                        continue;
                    };
                    segmentations.push(Segmentation {
                        mapobject_id,
                        segmentation_layer_id: layer.id,
                        label: *label,
                        geom_polygon: collection.represent_as_polygons.then_some(polygon),
                        geom_centroid: centroid,
                    });
                }
            }
            debug!("insert {} segmentations of type \"{}\"", segmentations.len(), name);
            self.store.insert_segmentations(segmentations).await?;

            for table in collection.measurements() {
                if table.is_empty() {
                    warn!(
                        "empty measurements of objects \"{}\" at time point {}",
                        name, table.tpoint
                    );
                    continue;
                }
                let mut feature_ids = Vec::with_capacity(table.columns.len());
                for column in &table.columns {
                    feature_ids.push(self.feature_id(mapobject_type.id, column).await?);
                }
                let mut records = Vec::with_capacity(table.rows.len());
                for (label, row) in &table.rows {
                    let Some(&mapobject_id) = mapobject_ids.get(label) else {
                        warn!("measured object {} of type \"{}\" has no outline", label, name);
                        continue;
                    };
                    let values = feature_ids
                        .iter()
                        .zip(row)
                        .map(|(&id, value)| (id, value.map_or(f64::NAN, round_feature_value)))
                        .collect();
                    records.push(FeatureValues {
                        mapobject_id,
                        tpoint: table.tpoint,
                        values,
                    });
                }
                debug!(
                    "insert {} feature values of objects \"{}\" at time point {}",
                    records.len(),
                    name,
                    table.tpoint
                );
                self.store.insert_feature_values(records).await?;
            }
        }
        Ok(())
    }

    /// Feature id by name, loading the type's features on first use
    async fn feature_id(&mut self, mapobject_type_id: MapobjectTypeId, name: &str) -> Result<FeatureId> {
        if !self.feature_ids.contains_key(&mapobject_type_id) {
            let known = self
                .store
                .features(mapobject_type_id)
                .await?
                .into_iter()
                .map(|f| (f.name, f.id))
                .collect();
            self.feature_ids.insert(mapobject_type_id, known);
        }
        let lookup = self.feature_ids.entry(mapobject_type_id).or_default();
        if let Some(&id) = lookup.get(name) {
            return Ok(id);
        }
        let id = self
            .store
            .get_or_create_feature(name, mapobject_type_id, false)
            .await?;
        lookup.insert(name.to_string(), id);
        Ok(id)
    }
}

fn distinct(values: impl Iterator<Item = usize>) -> Vec<usize> {
    values.collect::<BTreeSet<_>>().into_iter().collect()
}
