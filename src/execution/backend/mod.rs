//! Language backends that execute pipeline modules
//!
//! Each language a pipeline uses gets one backend per job. Backends are
//! started lazily on first use and live until the job finishes, so that
//! interpreter startup is paid once per job rather than once per site.

pub mod native;
pub mod process;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use super::handles::{Handle, HandleDescriptor, HandleValues};
use super::pipeline::ModuleSpec;
use crate::subprocess::{ProcessError, SubprocessManager};

pub use native::{NativeBackend, NativeModule, NativeModules};
pub use process::ProcessBackend;

/// Implementation language of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Language {
    #[serde(alias = "python")]
    Python,
    #[serde(alias = "r")]
    R,
    #[serde(alias = "matlab")]
    Matlab,
    #[serde(alias = "julia")]
    Julia,
    /// Modules compiled into the engine
    #[serde(alias = "native")]
    Native,
}

impl Language {
    /// Language of a module file derived from its suffix
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "py" => Some(Self::Python),
            "r" | "R" => Some(Self::R),
            "m" => Some(Self::Matlab),
            "jl" => Some(Self::Julia),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "Python",
            Self::R => "R",
            Self::Matlab => "Matlab",
            Self::Julia => "Julia",
            Self::Native => "Native",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{language} backend is unavailable: {reason}")]
    Unavailable { language: Language, reason: String },

    #[error("{0} backend was used before it was started")]
    NotStarted(Language),

    #[error("Module \"{module}\" failed: {message}")]
    ModuleFailed { module: String, message: String },

    #[error("No native module named \"{0}\"")]
    UnknownModule(String),

    #[error("Module \"{module}\" returned invalid output: {message}")]
    InvalidOutput { module: String, message: String },

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
}

/// Executes modules of one language.
///
/// A backend keeps interpreter state between calls and is confined to the
/// job that started it.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn language(&self) -> Language;

    async fn start(&mut self) -> Result<(), BackendError>;

    /// Makes the input values available to the next `execute` call
    fn bind(&mut self, inputs: Vec<Handle>) -> Result<(), BackendError>;

    async fn execute(&mut self, module: &ModuleSpec) -> Result<(), BackendError>;

    /// Values of the declared output handles produced by the last module
    fn collect(&mut self, outputs: &[HandleDescriptor]) -> Result<HandleValues, BackendError>;
}

/// Takes the declared outputs out of the values a module produced.
fn take_outputs(
    module: &str,
    produced: &mut HandleValues,
    outputs: &[HandleDescriptor],
) -> Result<HandleValues, BackendError> {
    let mut collected = HandleValues::new();
    for descriptor in outputs {
        let value = produced
            .remove(&descriptor.name)
            .ok_or_else(|| BackendError::InvalidOutput {
                module: module.to_string(),
                message: format!("missing output handle \"{}\"", descriptor.name),
            })?;
        collected.insert(descriptor.name.clone(), value);
    }
    produced.clear();
    Ok(collected)
}

/// Creates backends for the languages a job needs
#[derive(Clone)]
pub struct BackendFactory {
    native: Arc<NativeModules>,
    subprocess: SubprocessManager,
    interpreters: HashMap<Language, String>,
    module_timeout: Option<Duration>,
}

impl BackendFactory {
    /// `interpreters` maps each external language to the command line that
    /// runs a module file, e.g. `python3` or `julia --startup-file=no`.
    pub fn new(
        native: Arc<NativeModules>,
        subprocess: SubprocessManager,
        interpreters: HashMap<Language, String>,
    ) -> Self {
        Self {
            native,
            subprocess,
            interpreters,
            module_timeout: None,
        }
    }

    /// Kills interpreter runs of a single module exceeding `timeout`
    pub fn with_module_timeout(mut self, timeout: Duration) -> Self {
        self.module_timeout = Some(timeout);
        self
    }

    /// Factory serving only native modules
    pub fn native(native: NativeModules) -> Self {
        Self::new(
            Arc::new(native),
            SubprocessManager::production(),
            HashMap::new(),
        )
    }

    /// Native modules pipelines may refer to by name
    pub fn native_modules(&self) -> &NativeModules {
        &self.native
    }

    pub fn create(&self, language: Language) -> Result<Box<dyn ExecutionBackend>, BackendError> {
        if language == Language::Native {
            return Ok(Box::new(NativeBackend::new(Arc::clone(&self.native))));
        }
        let command_line =
            self.interpreters
                .get(&language)
                .ok_or_else(|| BackendError::Unavailable {
                    language,
                    reason: "no interpreter configured".to_string(),
                })?;
        let mut words =
            shell_words::split(command_line).map_err(|e| BackendError::Unavailable {
                language,
                reason: format!("invalid interpreter command \"{}\": {}", command_line, e),
            })?;
        if words.is_empty() {
            return Err(BackendError::Unavailable {
                language,
                reason: "empty interpreter command".to_string(),
            });
        }
        let program = words.remove(0);
        Ok(Box::new(ProcessBackend::new(
            language,
            program,
            words,
            self.subprocess.clone(),
        )
        .with_timeout(self.module_timeout)))
    }
}

/// Backends of one job, keyed by language and started at most once
pub struct BackendRegistry {
    factory: BackendFactory,
    backends: HashMap<Language, Box<dyn ExecutionBackend>>,
}

impl BackendRegistry {
    pub fn new(factory: BackendFactory) -> Self {
        Self {
            factory,
            backends: HashMap::new(),
        }
    }

    /// The started backend of `language`, starting it on first use
    pub async fn get(
        &mut self,
        language: Language,
    ) -> Result<&mut dyn ExecutionBackend, BackendError> {
        if !self.backends.contains_key(&language) {
            info!("start {} backend", language);
            let mut backend = self.factory.create(language)?;
            backend.start().await?;
            self.backends.insert(language, backend);
        }
        self.backends
            .get_mut(&language)
            .map(|backend| backend.as_mut() as &mut dyn ExecutionBackend)
            .ok_or(BackendError::NotStarted(language))
    }

    /// Starts the backends of all given languages up front
    pub async fn start_all(
        &mut self,
        languages: impl IntoIterator<Item = Language>,
    ) -> Result<(), BackendError> {
        for language in languages {
            self.get(language).await?;
        }
        Ok(())
    }

    pub fn is_started(&self, language: Language) -> bool {
        self.backends.contains_key(&language)
    }
}

impl Drop for BackendRegistry {
    fn drop(&mut self) {
        if !self.backends.is_empty() {
            debug!("shut down {} backends", self.backends.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_from_suffix() {
        assert_eq!(
            Language::from_path(Path::new("modules/smooth.py")),
            Some(Language::Python)
        );
        assert_eq!(Language::from_path(Path::new("a/b.R")), Some(Language::R));
        assert_eq!(Language::from_path(Path::new("a/b.r")), Some(Language::R));
        assert_eq!(Language::from_path(Path::new("a/b.m")), Some(Language::Matlab));
        assert_eq!(Language::from_path(Path::new("a/b.jl")), Some(Language::Julia));
        assert_eq!(Language::from_path(Path::new("a/b.sh")), None);
        assert_eq!(Language::from_path(Path::new("a/b")), None);
    }

    #[test]
    fn test_language_deserializes_either_case() {
        let lang: Language = serde_yaml::from_str("python").unwrap();
        assert_eq!(lang, Language::Python);
        let lang: Language = serde_yaml::from_str("Julia").unwrap();
        assert_eq!(lang, Language::Julia);
    }

    #[tokio::test]
    async fn test_registry_starts_each_language_once() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("python3")
            .with_args(|args| args == ["--version"])
            .returns_stdout("Python 3.12.1\n")
            .finish();
        let factory = BackendFactory::new(
            Arc::new(NativeModules::new()),
            subprocess,
            HashMap::from([(Language::Python, "python3".to_string())]),
        );
        let mut registry = BackendRegistry::new(factory);
        registry
            .start_all([Language::Python, Language::Python, Language::Native])
            .await
            .unwrap();
        assert!(registry.is_started(Language::Python));
        assert!(registry.is_started(Language::Native));
        assert!(mock.verify_called("python3", 1));
    }

    #[test]
    fn test_backends_are_shareable_across_tasks() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn ExecutionBackend>();
        assert_send_sync::<BackendRegistry>();
    }

    #[tokio::test]
    async fn test_unconfigured_language_is_unavailable() {
        let mut registry = BackendRegistry::new(BackendFactory::native(NativeModules::new()));
        let err = registry.get(Language::Matlab).await.err().unwrap();
        assert!(matches!(err, BackendError::Unavailable { .. }));
    }
}
