//! Backend for modules compiled into the engine

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{take_outputs, BackendError, ExecutionBackend, Language};
use crate::execution::handles::{Handle, HandleDescriptor, HandleValues};
use crate::execution::pipeline::{ModuleSource, ModuleSpec};

/// A pipeline module implemented in Rust.
///
/// Receives the bound input values by handle name and returns output values
/// by handle name; an `Err` fails the module.
pub trait NativeModule: Send + Sync {
    fn run(&self, inputs: &HandleValues) -> Result<HandleValues, String>;
}

impl<F> NativeModule for F
where
    F: Fn(&HandleValues) -> Result<HandleValues, String> + Send + Sync,
{
    fn run(&self, inputs: &HandleValues) -> Result<HandleValues, String> {
        self(inputs)
    }
}

/// Native modules addressable by name from pipeline descriptors
#[derive(Clone, Default)]
pub struct NativeModules {
    modules: HashMap<String, Arc<dyn NativeModule>>,
}

impl NativeModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, module: impl NativeModule + 'static) {
        self.modules.insert(name.into(), Arc::new(module));
    }

    pub fn with(mut self, name: impl Into<String>, module: impl NativeModule + 'static) -> Self {
        self.register(name, module);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NativeModule>> {
        self.modules.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }
}

impl std::fmt::Debug for NativeModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.modules.keys().collect();
        names.sort();
        f.debug_struct("NativeModules").field("modules", &names).finish()
    }
}

pub struct NativeBackend {
    modules: Arc<NativeModules>,
    started: bool,
    inputs: HandleValues,
    produced: HandleValues,
    last_module: String,
}

impl NativeBackend {
    pub fn new(modules: Arc<NativeModules>) -> Self {
        Self {
            modules,
            started: false,
            inputs: HandleValues::new(),
            produced: HandleValues::new(),
            last_module: String::new(),
        }
    }
}

#[async_trait]
impl ExecutionBackend for NativeBackend {
    fn language(&self) -> Language {
        Language::Native
    }

    async fn start(&mut self) -> Result<(), BackendError> {
        self.started = true;
        Ok(())
    }

    fn bind(&mut self, inputs: Vec<Handle>) -> Result<(), BackendError> {
        self.inputs = inputs
            .into_iter()
            .map(|handle| (handle.descriptor.name, handle.value))
            .collect();
        Ok(())
    }

    async fn execute(&mut self, module: &ModuleSpec) -> Result<(), BackendError> {
        if !self.started {
            return Err(BackendError::NotStarted(Language::Native));
        }
        let ModuleSource::Native(name) = &module.source else {
            return Err(BackendError::Unavailable {
                language: Language::Native,
                reason: format!("module \"{}\" is not a native module", module.name),
            });
        };
        let implementation = self
            .modules
            .get(name)
            .ok_or_else(|| BackendError::UnknownModule(name.clone()))?;
        debug!("run native module \"{}\"", module.name);
        self.produced = implementation
            .run(&self.inputs)
            .map_err(|message| BackendError::ModuleFailed {
                module: module.name.clone(),
                message,
            })?;
        self.last_module = module.name.clone();
        Ok(())
    }

    fn collect(&mut self, outputs: &[HandleDescriptor]) -> Result<HandleValues, BackendError> {
        take_outputs(&self.last_module, &mut self.produced, outputs)
    }
}
