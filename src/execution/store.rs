//! Per-site data store shared by the modules of one pipeline run

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use super::handles::HandleValue;
use super::objects::SegmentedObjectCollection;
use crate::storage::SiteId;

/// Values produced and consumed by the modules of one pipeline run.
///
/// A store is owned by exactly one site's execution; modules only reach it
/// through their declared handles.
#[derive(Debug, Clone)]
pub struct DataStore {
    site_id: SiteId,
    height: usize,
    width: usize,
    n_zplanes: usize,
    n_tpoints: usize,
    pipe: HashMap<String, HandleValue>,
    objects: BTreeMap<String, SegmentedObjectCollection>,
    current_figure: Option<String>,
    figures: Vec<PathBuf>,
}

impl DataStore {
    pub fn new(site_id: SiteId, height: usize, width: usize) -> Self {
        Self {
            site_id,
            height,
            width,
            n_zplanes: 1,
            n_tpoints: 1,
            pipe: HashMap::new(),
            objects: BTreeMap::new(),
            current_figure: None,
            figures: Vec::new(),
        }
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn n_zplanes(&self) -> usize {
        self.n_zplanes
    }

    pub fn n_tpoints(&self) -> usize {
        self.n_tpoints
    }

    pub fn get(&self, key: &str) -> Option<&HandleValue> {
        self.pipe.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pipe.contains_key(key)
    }

    pub fn objects(&self, name: &str) -> Option<&SegmentedObjectCollection> {
        self.objects.get(name)
    }

    pub fn object_collections(&self) -> impl Iterator<Item = &SegmentedObjectCollection> {
        self.objects.values()
    }

    pub fn current_figure(&self) -> Option<&str> {
        self.current_figure.as_deref()
    }

    /// Figure files written for this site so far
    pub fn figures(&self) -> &[PathBuf] {
        &self.figures
    }

    /// Grows the plane counts used when rasterizing objects
    pub(crate) fn observe_planes(&mut self, n_zplanes: usize, n_tpoints: usize) {
        self.n_zplanes = self.n_zplanes.max(n_zplanes);
        self.n_tpoints = self.n_tpoints.max(n_tpoints);
    }

    pub(crate) fn insert(&mut self, key: impl Into<String>, value: HandleValue) {
        self.pipe.insert(key.into(), value);
    }

    pub(crate) fn insert_objects(&mut self, collection: SegmentedObjectCollection) {
        self.objects.insert(collection.name().to_string(), collection);
    }

    pub(crate) fn objects_mut(&mut self, name: &str) -> Option<&mut SegmentedObjectCollection> {
        self.objects.get_mut(name)
    }

    pub(crate) fn set_current_figure(&mut self, figure: String) {
        self.current_figure = Some(figure);
    }

    pub(crate) fn take_current_figure(&mut self) -> Option<String> {
        self.current_figure.take()
    }

    pub(crate) fn record_figure(&mut self, path: PathBuf) {
        self.figures.push(path);
    }

    /// Drops singleton dimensions of every image in the store
    pub(crate) fn squeeze_arrays(&mut self) {
        for value in self.pipe.values_mut() {
            if let HandleValue::Image(image) = value {
                *image = std::mem::take(image).squeeze();
            }
        }
    }
}
