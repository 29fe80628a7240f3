//! Typed handles connecting module inputs and outputs to the data store
//!
//! A module only sees the store through the handles declared in its
//! `*.handles.yaml` file. Input handles are resolved from the store (or from
//! constant values) before the module runs; output handles are written back
//! once it returned.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, trace};

use super::objects::{MeasurementTable, ObjectsValue, SegmentedObjectCollection};
use super::store::DataStore;
use crate::error::{Error, Result};
use crate::image::ImageArray;

/// Declared type of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleType {
    IntensityImage,
    LabelImage,
    BinaryImage,
    SegmentedObjects,
    Numeric,
    Character,
    Boolean,
    Plot,
    Measurement,
    Figure,
}

impl HandleType {
    /// Whether `value` may be bound to a handle of this type
    pub fn accepts(&self, value: &HandleValue) -> bool {
        match (self, value) {
            (Self::IntensityImage | Self::LabelImage, HandleValue::Image(_)) => true,
            (Self::BinaryImage, HandleValue::Image(image)) => {
                image.data().iter().all(|&v| v == 0.0 || v == 1.0)
            }
            (Self::SegmentedObjects, HandleValue::Objects(_)) => true,
            (Self::Numeric, HandleValue::Numeric(_)) => true,
            (Self::Character, HandleValue::Character(_)) => true,
            (Self::Boolean | Self::Plot, HandleValue::Boolean(_)) => true,
            (Self::Measurement, HandleValue::Measurement(_)) => true,
            (Self::Figure, HandleValue::Figure(_)) => true,
            _ => false,
        }
    }
}

/// Value bound to a handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum HandleValue {
    Image(ImageArray),
    Numeric(f64),
    Character(String),
    Boolean(bool),
    Objects(ObjectsValue),
    Measurement(Vec<MeasurementTable>),
    Figure(String),
}

impl HandleValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Image(_) => "Image",
            Self::Numeric(_) => "Numeric",
            Self::Character(_) => "Character",
            Self::Boolean(_) => "Boolean",
            Self::Objects(_) => "Objects",
            Self::Measurement(_) => "Measurement",
            Self::Figure(_) => "Figure",
        }
    }
}

/// Handle values keyed by handle name
pub type HandleValues = BTreeMap<String, HandleValue>;

/// Declaration of one handle in a handles descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub handle_type: HandleType,
    /// Store entry the handle reads from or writes to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Constant value of an input handle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Object type a measurement refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objects: Option<String>,
}

impl HandleDescriptor {
    pub fn keyed(name: &str, handle_type: HandleType, key: &str) -> Self {
        Self {
            name: name.to_string(),
            handle_type,
            key: Some(key.to_string()),
            value: None,
            objects: None,
        }
    }

    pub fn constant(name: &str, handle_type: HandleType, value: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            handle_type,
            key: None,
            value: Some(value),
            objects: None,
        }
    }

    pub fn measurement(name: &str, objects: &str) -> Self {
        Self {
            name: name.to_string(),
            handle_type: HandleType::Measurement,
            key: None,
            value: None,
            objects: Some(objects.to_string()),
        }
    }

    /// Typed constant of an input handle
    fn constant_value(&self) -> Result<HandleValue> {
        let value = self.value.as_ref().ok_or_else(|| {
            Error::descriptor(format!(
                "Input handle \"{}\" has neither a key nor a value",
                self.name
            ))
        })?;
        let typed = match self.handle_type {
            HandleType::Numeric => value.as_f64().map(HandleValue::Numeric),
            HandleType::Character => value.as_str().map(|s| HandleValue::Character(s.into())),
            HandleType::Boolean | HandleType::Plot => value.as_bool().map(HandleValue::Boolean),
            _ => None,
        };
        typed.ok_or_else(|| {
            Error::descriptor(format!(
                "Value {} of input handle \"{}\" is not a valid {:?}",
                value, self.name, self.handle_type
            ))
        })
    }
}

/// Contents of a `*.handles.yaml` file
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleHandles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub input: Vec<HandleDescriptor>,
    #[serde(default)]
    pub output: Vec<HandleDescriptor>,
}

impl ModuleHandles {
    pub fn new(input: Vec<HandleDescriptor>, output: Vec<HandleDescriptor>) -> Self {
        Self {
            version: None,
            input,
            output,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::descriptor(format!("Cannot read handles file {}: {}", path.display(), e))
        })?;
        let handles: Self = serde_yaml::from_str(&content).map_err(|e| {
            Error::descriptor(format!("Invalid handles file {}: {}", path.display(), e))
        })?;
        handles.validate()?;
        Ok(handles)
    }

    pub fn validate(&self) -> Result<()> {
        for (direction, handles) in [("input", &self.input), ("output", &self.output)] {
            let mut names = HashSet::new();
            for handle in handles {
                if !names.insert(handle.name.as_str()) {
                    return Err(Error::descriptor(format!(
                        "Duplicate {} handle \"{}\"",
                        direction, handle.name
                    )));
                }
            }
        }
        for handle in &self.output {
            let complete = match handle.handle_type {
                HandleType::Measurement => handle.objects.is_some(),
                HandleType::Figure => true,
                _ => handle.key.is_some(),
            };
            if !complete {
                return Err(Error::descriptor(format!(
                    "Output handle \"{}\" of type {:?} does not name its destination",
                    handle.name, handle.handle_type
                )));
            }
        }
        Ok(())
    }

    /// Whether the module's plot input is switched on
    pub fn plot_enabled(&self) -> bool {
        self.input.iter().any(|h| {
            h.handle_type == HandleType::Plot
                && h.value.as_ref().and_then(serde_json::Value::as_bool) == Some(true)
        })
    }
}

/// A handle bound to its value
#[derive(Debug, Clone, PartialEq)]
pub struct Handle {
    pub descriptor: HandleDescriptor,
    pub value: HandleValue,
}

impl Handle {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Binds the module's input handles to values from the store.
///
/// Plot handles are only switched on when plotting was requested for the
/// run; otherwise modules run headless.
pub fn resolve_inputs(
    module: &str,
    descriptors: &[HandleDescriptor],
    store: &DataStore,
    plot: bool,
) -> Result<Vec<Handle>> {
    let mut handles = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        let value = match (&descriptor.key, descriptor.handle_type) {
            (_, HandleType::Plot) => {
                let enabled = descriptor
                    .value
                    .as_ref()
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                HandleValue::Boolean(enabled && plot)
            }
            (Some(key), HandleType::SegmentedObjects) => store
                .objects(key)
                .map(|collection| HandleValue::Objects(collection.to_value()))
                .ok_or_else(|| missing_key(module, descriptor, key))?,
            (Some(key), _) => store
                .get(key)
                .cloned()
                .ok_or_else(|| missing_key(module, descriptor, key))?,
            (None, _) => descriptor.constant_value()?,
        };
        if !descriptor.handle_type.accepts(&value) {
            return Err(Error::execution(
                module,
                format!(
                    "Input handle \"{}\" expects {:?} but the store holds {}",
                    descriptor.name,
                    descriptor.handle_type,
                    value.kind()
                ),
            ));
        }
        trace!("bind input handle \"{}\" of module \"{}\"", descriptor.name, module);
        handles.push(Handle {
            descriptor: descriptor.clone(),
            value,
        });
    }
    Ok(handles)
}

fn missing_key(module: &str, descriptor: &HandleDescriptor, key: &str) -> Error {
    Error::execution(
        module,
        format!(
            "Input handle \"{}\" requests \"{}\" which no previous module produced",
            descriptor.name, key
        ),
    )
}

/// Writes the values a module returned into the store.
pub fn apply_outputs(
    module: &str,
    descriptors: &[HandleDescriptor],
    mut values: HandleValues,
    store: &mut DataStore,
) -> Result<()> {
    for descriptor in descriptors {
        let value = values.remove(&descriptor.name).ok_or_else(|| {
            Error::execution(
                module,
                format!("Module did not return output handle \"{}\"", descriptor.name),
            )
        })?;
        if !descriptor.handle_type.accepts(&value) {
            return Err(Error::execution(
                module,
                format!(
                    "Output handle \"{}\" expects {:?} but the module returned {}",
                    descriptor.name,
                    descriptor.handle_type,
                    value.kind()
                ),
            ));
        }
        match (value, descriptor.key.as_deref(), descriptor.objects.as_deref()) {
            (HandleValue::Objects(objects), Some(key), _) => {
                let collection = SegmentedObjectCollection::from_outlines(key, objects.outlines);
                let labels = collection
                    .label_image(
                        store.height(),
                        store.width(),
                        store.n_zplanes(),
                        store.n_tpoints(),
                    )?
                    .squeeze();
                debug!(
                    "module \"{}\" segmented {} objects of type \"{}\"",
                    module,
                    collection.labels().len(),
                    key
                );
                store.insert(key, HandleValue::Image(labels));
                store.insert_objects(collection);
            }
            (HandleValue::Measurement(tables), _, Some(objects)) => {
                let collection = store.objects_mut(objects).ok_or_else(|| {
                    Error::execution(
                        module,
                        format!(
                            "Measurement \"{}\" refers to unknown objects \"{}\"",
                            descriptor.name, objects
                        ),
                    )
                })?;
                for table in tables {
                    collection.add_measurement(table)?;
                }
            }
            (HandleValue::Figure(figure), _, _) => store.set_current_figure(figure),
            (value, Some(key), _) => store.insert(key, value),
            (_, None, _) => {
                return Err(Error::descriptor(format!(
                    "Output handle \"{}\" does not name its destination",
                    descriptor.name
                )))
            }
        }
    }
    if !values.is_empty() {
        debug!(
            "module \"{}\" returned undeclared handles {:?}, ignoring",
            module,
            values.keys().collect::<Vec<_>>()
        );
    }
    Ok(())
}
