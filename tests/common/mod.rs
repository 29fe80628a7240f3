//! Experiment fixtures shared by the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use tmengine::execution::{
    BackendFactory, HandleValue, HandleValues, MeasurementTable, NativeModules, ObjectOutline,
    ObjectsValue,
};
use tmengine::geometry::{Point, Polygon};
use tmengine::image::{ImageArray, InMemoryImageReader};
use tmengine::storage::{
    ExperimentSnapshot, HierarchyLevel, InMemoryExperimentStore, MapobjectId, Site,
};
use tmengine::workflow::{ResourceRequest, StepCommand, StepContext, WorkflowDescriptor};

pub const SITE_SIZE: usize = 10;
const SITE_SPACING: f64 = 20.0;
const SITES_PER_WELL: usize = 3;

const SEGMENT_HANDLES: &str = r#"
input:
  - name: image
    type: IntensityImage
    key: DAPI
output:
  - name: objects
    type: SegmentedObjects
    key: Cells
"#;

const MEASURE_HANDLES: &str = r#"
input:
  - name: objects
    type: SegmentedObjects
    key: Cells
  - name: image
    type: IntensityImage
    key: DAPI
output:
  - name: features
    type: Measurement
    objects: Cells
"#;

/// An experiment with sites in a row, grouped into wells of three sites on
/// one plate. Every site image is filled with the site id.
pub struct ExperimentFixture {
    pub dir: TempDir,
    pub store: Arc<InMemoryExperimentStore>,
    pub images: Arc<InMemoryImageReader>,
    pub wells: Vec<MapobjectId>,
    pub plate: MapobjectId,
}

impl ExperimentFixture {
    pub async fn new(sites: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryExperimentStore::new());
        let images = Arc::new(InMemoryImageReader::new());
        store.set_max_zoom_level(6).await;
        let channel = store.add_channel("DAPI", 16).await;

        for index in 0..sites {
            let id = index as i64 + 1;
            let x = index as f64 * SITE_SPACING;
            store
                .add_site(Site {
                    id,
                    y_offset: 0,
                    x_offset: 0,
                    aligned_height: SITE_SIZE,
                    aligned_width: SITE_SIZE,
                    origin: Point::new(x, 0.0),
                })
                .await;
            store
                .add_reference_object(
                    HierarchyLevel::Site,
                    Some(id),
                    Polygon::rectangle(x, 0.0, SITE_SIZE as f64, SITE_SIZE as f64),
                )
                .await
                .unwrap();

            let location = format!("images/dapi_site{}.json", id);
            let image = ImageArray::new(
                vec![SITE_SIZE, SITE_SIZE],
                vec![id as f64; SITE_SIZE * SITE_SIZE],
            )
            .unwrap();
            let path = dir.path().join(&location);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, serde_json::to_string(&image).unwrap()).unwrap();
            store.add_image_file(id, channel, 0, 0, &location).await;
            images.insert(location, image).await;
        }

        let mut wells = Vec::new();
        for first in (0..sites).step_by(SITES_PER_WELL) {
            let count = SITES_PER_WELL.min(sites - first);
            let x = first as f64 * SITE_SPACING - 1.0;
            let width = (count - 1) as f64 * SITE_SPACING + SITE_SIZE as f64 + 2.0;
            let well = store
                .add_reference_object(
                    HierarchyLevel::Well,
                    None,
                    Polygon::rectangle(x, -1.0, width, SITE_SIZE as f64 + 2.0),
                )
                .await
                .unwrap();
            wells.push(well);
        }
        let plate = store
            .add_reference_object(
                HierarchyLevel::Plate,
                None,
                Polygon::rectangle(
                    -2.0,
                    -2.0,
                    sites as f64 * SITE_SPACING + 4.0,
                    SITE_SIZE as f64 + 4.0,
                ),
            )
            .await
            .unwrap();

        Self {
            dir,
            store,
            images,
            wells,
            plate,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes a segment + measure pipeline under `pipelines/<name>`
    pub fn write_pipeline(&self, name: &str) -> PathBuf {
        self.write_pipeline_with(name, "segment")
    }

    pub fn write_pipeline_with(&self, name: &str, segment_module: &str) -> PathBuf {
        let location = self.path().join("pipelines").join(name);
        std::fs::create_dir_all(location.join("handles")).unwrap();
        std::fs::write(location.join("handles/segment.handles.yaml"), SEGMENT_HANDLES).unwrap();
        std::fs::write(location.join("handles/measure.handles.yaml"), MEASURE_HANDLES).unwrap();
        std::fs::write(
            location.join("pipeline.yaml"),
            format!(
                r#"
input:
  channels:
    - name: DAPI
output:
  objects:
    - name: Cells
pipeline:
  - source: {}
    handles: handles/segment.handles.yaml
  - source: measure
    handles: handles/measure.handles.yaml
"#,
                segment_module
            ),
        )
        .unwrap();
        location
    }

    /// Writes a pipeline of one module file `modules/segment.py` holding
    /// `script`, run by the configured Python interpreter
    pub fn write_script_pipeline(&self, name: &str, script: &str) -> PathBuf {
        let location = self.path().join("pipelines").join(name);
        std::fs::create_dir_all(location.join("handles")).unwrap();
        std::fs::create_dir_all(location.join("modules")).unwrap();
        std::fs::write(location.join("modules/segment.py"), script).unwrap();
        std::fs::write(
            location.join("handles/segment.handles.yaml"),
            "input: []\noutput: []\n",
        )
        .unwrap();
        std::fs::write(
            location.join("pipeline.yaml"),
            "pipeline:\n  - source: modules/segment.py\n    handles: handles/segment.handles.yaml\n",
        )
        .unwrap();
        location
    }

    pub fn write_workflow(&self, lines: &[&str]) -> PathBuf {
        let path = self.path().join("workflow.yaml");
        let yaml = lines
            .iter()
            .map(|line| format!("- {}\n", line))
            .collect::<String>();
        std::fs::write(&path, yaml).unwrap();
        path
    }

    pub fn variables(&self) -> HashMap<String, String> {
        HashMap::from([(
            "experiment_dir".to_string(),
            self.path().display().to_string(),
        )])
    }

    pub fn commands(&self, lines: &[&str]) -> Vec<StepCommand> {
        let path = self.write_workflow(lines);
        WorkflowDescriptor::load(&path)
            .unwrap()
            .commands(&self.variables())
            .unwrap()
    }

    pub fn context(&self) -> StepContext {
        StepContext {
            experiment_dir: self.path().to_path_buf(),
            store: self.store.clone(),
            images: self.images.clone(),
            backends: BackendFactory::native(native_modules()),
            resources: ResourceRequest::default(),
            lock_dir: self.path().join(".locks"),
        }
    }

    pub async fn save(&self) -> PathBuf {
        let path = self.path().join("experiment.json");
        self.store.save(&path).await.unwrap();
        path
    }
}

/// Two square cells per site when the site image is non-empty
fn segment(inputs: &HandleValues) -> Result<HandleValues, String> {
    let Some(HandleValue::Image(image)) = inputs.get("image") else {
        return Err("image missing".into());
    };
    let outlines = if image.pixel(0, 0) > 0.0 {
        vec![
            ObjectOutline {
                tpoint: 0,
                zplane: 0,
                label: 1,
                polygon: Polygon::rectangle(1.0, 1.0, 2.0, 2.0),
            },
            ObjectOutline {
                tpoint: 0,
                zplane: 0,
                label: 2,
                polygon: Polygon::rectangle(5.0, 5.0, 2.0, 2.0),
            },
        ]
    } else {
        Vec::new()
    };
    Ok(HandleValues::from([(
        "objects".to_string(),
        HandleValue::Objects(ObjectsValue { outlines }),
    )]))
}

/// Area of each cell and the intensity at the image origin
fn measure(inputs: &HandleValues) -> Result<HandleValues, String> {
    let (Some(HandleValue::Objects(objects)), Some(HandleValue::Image(image))) =
        (inputs.get("objects"), inputs.get("image"))
    else {
        return Err("inputs missing".into());
    };
    let mut table = MeasurementTable::new(0, vec!["area".into(), "intensity".into()]);
    for outline in &objects.outlines {
        table = table.with_row(
            outline.label,
            vec![Some(outline.polygon.area()), Some(image.pixel(0, 0))],
        );
    }
    Ok(HandleValues::from([(
        "features".to_string(),
        HandleValue::Measurement(vec![table]),
    )]))
}

/// Rejects every site
fn reject(_: &HandleValues) -> Result<HandleValues, String> {
    Err("segmentation failed".into())
}

pub fn native_modules() -> NativeModules {
    NativeModules::new()
        .with("segment", segment)
        .with("measure", measure)
        .with("reject", reject)
}

/// Value of the feature named `feature` owned by the object's type
pub fn value_of(snapshot: &ExperimentSnapshot, mapobject_id: MapobjectId, feature: &str) -> f64 {
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

/// Sorted feature names of an object type
pub fn feature_names(snapshot: &ExperimentSnapshot, type_name: &str) -> Vec<String> {
    let Some(mapobject_type) = snapshot.mapobject_type_by_name(type_name) else {
        return Vec::new();
    };
    let mut names: Vec<String> = snapshot
        .features
        .values()
        .filter(|f| f.mapobject_type_id == mapobject_type.id)
        .map(|f| f.name.clone())
        .collect();
    names.sort();
    names
}
