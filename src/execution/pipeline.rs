//! Pipeline descriptors and the module list built from them
//!
//! A step's `pipeline.yaml` declares the channels and objects loaded for
//! each site, the object types persisted afterwards and the ordered list of
//! modules with their handles files:
//!
//! ```yaml
//! input:
//!   channels:
//!     - name: DAPI
//!       correct: true
//!   objects: []
//! output:
//!   objects:
//!     - name: Nuclei
//!       as_polygons: true
//! pipeline:
//!   - source: modules/smooth.py
//!     handles: handles/smooth.handles.yaml
//!     active: true
//!   - source: segment_primary
//!     handles: handles/segment_primary.handles.yaml
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::backend::{Language, NativeModules};
use super::handles::ModuleHandles;
use crate::error::{Error, Result};

/// File name of the pipeline descriptor inside a step location
pub const PIPELINE_FILE: &str = "pipeline.yaml";

static ENV_VAR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)\}|\$([a-zA-Z_][a-zA-Z0-9_]*)")
        .expect("Valid regex pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInput {
    pub name: String,
    /// Apply illumination correction when loading
    #[serde(default)]
    pub correct: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInput {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectOutput {
    pub name: String,
    #[serde(default = "default_true")]
    pub as_polygons: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineInput {
    #[serde(default)]
    pub channels: Vec<ChannelInput>,
    #[serde(default)]
    pub objects: Vec<ObjectInput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineOutput {
    #[serde(default)]
    pub objects: Vec<ObjectOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub source: String,
    pub handles: PathBuf,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub language: Option<Language>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    #[serde(default)]
    pub input: PipelineInput,
    #[serde(default)]
    pub output: PipelineOutput,
    #[serde(default)]
    pub pipeline: Vec<ModuleEntry>,
}

impl PipelineDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::descriptor(format!(
                "Cannot read pipeline description {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            Error::descriptor(format!(
                "Invalid pipeline description {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Where a module's code lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    /// Script run by an external interpreter
    File(PathBuf),
    /// Name of a registered native module
    Native(String),
}

/// One stage of a pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSpec {
    pub name: String,
    pub source: ModuleSource,
    pub language: Language,
    pub handles: ModuleHandles,
}

impl ModuleSpec {
    pub fn native(name: &str, implementation: &str, handles: ModuleHandles) -> Self {
        Self {
            name: name.to_string(),
            source: ModuleSource::Native(implementation.to_string()),
            language: Language::Native,
            handles,
        }
    }
}

/// Active modules of a step in execution order plus its declared inputs
/// and outputs
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    pub input: PipelineInput,
    pub output: PipelineOutput,
    pub modules: Vec<ModuleSpec>,
}

impl Pipeline {
    /// Loads `pipeline.yaml` and the handles files it references from the
    /// step location.
    pub fn load(step_location: &Path) -> Result<Self> {
        let descriptor = PipelineDescriptor::load(&step_location.join(PIPELINE_FILE))?;
        Self::build(descriptor, step_location)
    }

    pub fn build(descriptor: PipelineDescriptor, step_location: &Path) -> Result<Self> {
        let mut modules = Vec::new();
        for entry in descriptor.pipeline {
            if !entry.active {
                debug!("skip inactive module \"{}\"", entry.source);
                continue;
            }
            let handles_path = if entry.handles.is_absolute() {
                entry.handles.clone()
            } else {
                step_location.join(&entry.handles)
            };
            let handles = ModuleHandles::load(&handles_path)?;
            let name = module_name(&handles_path)?;
            let (source, language) = if entry.source.contains('/') {
                let path = complete_path(&entry.source, step_location)?;
                let language = match entry.language {
                    Some(language) => language,
                    None => Language::from_path(&path).ok_or_else(|| {
                        Error::descriptor(format!(
                            "Language of module file {} cannot be determined",
                            path.display()
                        ))
                    })?,
                };
                (ModuleSource::File(path), language)
            } else {
                (ModuleSource::Native(entry.source.clone()), Language::Native)
            };
            modules.push(ModuleSpec {
                name,
                source,
                language,
                handles,
            });
        }
        Ok(Self {
            input: descriptor.input,
            output: descriptor.output,
            modules,
        })
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.input.channels.iter().map(|c| c.name.clone()).collect()
    }

    pub fn input_object_names(&self) -> BTreeSet<&str> {
        self.input.objects.iter().map(|o| o.name.as_str()).collect()
    }

    /// Fails when a module names a native implementation that is not
    /// registered.
    pub fn check_native_modules(&self, registered: &NativeModules) -> Result<()> {
        for module in &self.modules {
            if let ModuleSource::Native(implementation) = &module.source {
                if !registered.contains(implementation) {
                    return Err(Error::descriptor(format!(
                        "No native module named \"{}\" for module \"{}\"",
                        implementation, module.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Distinct languages of the modules
    pub fn languages(&self) -> BTreeSet<Language> {
        self.modules.iter().map(|m| m.language).collect()
    }
}

/// Module name taken from its handles file, `smooth.handles.yaml` -> `smooth`
fn module_name(handles_path: &Path) -> Result<String> {
    let file_name = handles_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::descriptor(format!("Invalid handles file {}", handles_path.display()))
        })?;
    let name = [".handles.yaml", ".handles.yml", ".yaml", ".yml"]
        .iter()
        .find_map(|suffix| file_name.strip_suffix(suffix))
        .unwrap_or(file_name);
    Ok(name.to_string())
}

/// Expands environment variables and `~` in a module path and resolves it
/// against the step location. The file must exist.
pub fn complete_path(source: &str, step_location: &Path) -> Result<PathBuf> {
    let expanded = ENV_VAR_REGEX.replace_all(source, |caps: &regex::Captures| {
        let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
    });
    let path = match expanded.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(expanded.as_ref()),
        },
        None => PathBuf::from(expanded.as_ref()),
    };
    let path = if path.is_absolute() {
        path
    } else {
        step_location.join(path)
    };
    if !path.exists() {
        return Err(Error::descriptor(format!(
            "Module file does not exist: {}",
            path.display()
        )));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::execution::HandleValues;
    use tempfile::TempDir;

    const HANDLES: &str = "input: []\noutput: []\n";

    fn write(dir: &Path, relative: &str, content: &str) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_load_pipeline() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "modules/smooth.py", "");
        write(dir.path(), "handles/smooth.handles.yaml", HANDLES);
        write(dir.path(), "handles/segment.handles.yaml", HANDLES);
        write(dir.path(), "handles/skipped.handles.yaml", HANDLES);
        write(
            dir.path(),
            PIPELINE_FILE,
            r#"
input:
  channels:
    - name: DAPI
      correct: true
output:
  objects:
    - name: Nuclei
pipeline:
  - source: modules/smooth.py
    handles: handles/smooth.handles.yaml
  - source: segment_primary
    handles: handles/segment.handles.yaml
  - source: modules/missing.py
    handles: handles/skipped.handles.yaml
    active: false
"#,
        );
        let pipeline = Pipeline::load(dir.path()).unwrap();
        assert_eq!(pipeline.modules.len(), 2);
        assert_eq!(pipeline.modules[0].name, "smooth");
        assert_eq!(pipeline.modules[0].language, Language::Python);
        assert_eq!(
            pipeline.modules[0].source,
            ModuleSource::File(dir.path().join("modules/smooth.py"))
        );
        assert_eq!(
            pipeline.modules[1].source,
            ModuleSource::Native("segment_primary".into())
        );
        assert_eq!(pipeline.channel_names(), vec!["DAPI"]);
        assert!(pipeline.output.objects[0].as_polygons);
        assert!(pipeline.input.channels[0].correct);
    }

    #[test]
    fn test_missing_module_file_is_descriptor_error() {
        let dir = TempDir::new().unwrap();
        let err = complete_path("modules/absent.py", dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Descriptor);
        assert!(err.to_string().contains("Module file does not exist"));
    }

    #[test]
    fn test_complete_path_expands_variables() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "lib/m.R", "");
        std::env::set_var("TMENGINE_TEST_MODULE_DIR", dir.path());
        let path = complete_path("${TMENGINE_TEST_MODULE_DIR}/lib/m.R", Path::new("/")).unwrap();
        assert_eq!(path, dir.path().join("lib/m.R"));
        let path = complete_path("$TMENGINE_TEST_MODULE_DIR/lib/m.R", Path::new("/")).unwrap();
        assert_eq!(path, dir.path().join("lib/m.R"));
    }

    #[test]
    fn test_malformed_descriptors_are_descriptor_errors() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), PIPELINE_FILE, "input: [unclosed");
        let err = PipelineDescriptor::load(&dir.path().join(PIPELINE_FILE)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Descriptor);
        assert!(err.to_string().contains("Invalid pipeline description"));

        write(dir.path(), "h/bad.handles.yaml", "input: {name: [");
        write(
            dir.path(),
            PIPELINE_FILE,
            "pipeline:\n  - source: smooth\n    handles: h/bad.handles.yaml\n",
        );
        let err = Pipeline::load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Descriptor);
        assert!(err.to_string().contains("Invalid handles file"));
    }

    #[test]
    fn test_unregistered_native_module_is_descriptor_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "h/segment.handles.yaml", HANDLES);
        write(
            dir.path(),
            PIPELINE_FILE,
            "pipeline:\n  - source: segment_primary\n    handles: h/segment.handles.yaml\n",
        );
        let pipeline = Pipeline::load(dir.path()).unwrap();

        let err = pipeline
            .check_native_modules(&NativeModules::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Descriptor);
        assert!(err.to_string().contains("segment_primary"));

        fn segment_primary(_: &HandleValues) -> std::result::Result<HandleValues, String> {
            Ok(HandleValues::new())
        }
        let registered = NativeModules::new().with("segment_primary", segment_primary);
        assert!(pipeline.check_native_modules(&registered).is_ok());
    }

    #[test]
    fn test_unknown_suffix_requires_language() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "modules/tool.sh", "");
        write(dir.path(), "h/tool.handles.yaml", HANDLES);
        let descriptor = PipelineDescriptor {
            pipeline: vec![ModuleEntry {
                source: "modules/tool.sh".into(),
                handles: "h/tool.handles.yaml".into(),
                active: true,
                language: None,
            }],
            ..Default::default()
        };
        let err = Pipeline::build(descriptor.clone(), dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Descriptor);

        let mut descriptor = descriptor;
        descriptor.pipeline[0].language = Some(Language::Julia);
        let pipeline = Pipeline::build(descriptor, dir.path()).unwrap();
        assert_eq!(pipeline.modules[0].language, Language::Julia);
    }
}
