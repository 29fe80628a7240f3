//! Engine configuration
//!
//! Read from `<experiment_dir>/tmengine.toml` or an explicit path, then
//! overridden by `TMENGINE_*` environment variables:
//!
//! ```toml
//! log_level = "debug"
//! max_parallel_jobs = 8
//! lock_dir = "/scratch/locks"
//!
//! [resources]
//! duration = "4h"
//! memory_mb = 8192
//! cores = 2
//!
//! [interpreters]
//! python = "python3"
//! julia = "julia --startup-file=no"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::execution::Language;
use crate::workflow::ResourceRequest;

pub const CONFIG_FILE: &str = "tmengine.toml";
const ENV_PREFIX: &str = "TMENGINE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default log filter when neither `-v` nor `RUST_LOG` is given
    pub log_level: Option<String>,
    /// Run jobs of one step executed concurrently by the local submitter
    pub max_parallel_jobs: usize,
    /// Resources of jobs whose step command requests none
    pub resources: ResourceRequest,
    /// Command line running a module file, keyed by lowercase language name
    pub interpreters: BTreeMap<String, String>,
    pub lock_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let interpreters = [("python", "python3"), ("r", "Rscript"), ("julia", "julia")]
            .into_iter()
            .map(|(language, command)| (language.to_string(), command.to_string()))
            .collect();
        Self {
            log_level: None,
            max_parallel_jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            resources: ResourceRequest::default(),
            interpreters,
            lock_dir: None,
        }
    }
}

impl EngineConfig {
    /// Loads the explicit config file, else `tmengine.toml` of the
    /// experiment directory when present, else the defaults. Environment
    /// overrides are applied last.
    pub fn load(experiment_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = experiment_dir.join(CONFIG_FILE);
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    debug!("no {} in {}, using defaults", CONFIG_FILE, experiment_dir.display());
                    Self::default()
                }
            }
        };
        config.merge_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&contents)?;
        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn merge_env_vars(&mut self) -> Result<()> {
        self.merge_env_from(|name| std::env::var(name).ok())
    }

    /// Applies `TMENGINE_*` overrides looked up through `lookup`
    pub fn merge_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(log_level) = var("LOG_LEVEL") {
            self.log_level = Some(log_level);
        }

        if let Some(jobs) = var("MAX_PARALLEL_JOBS") {
            self.max_parallel_jobs = jobs.parse().map_err(|_| {
                Error::Config(format!(
                    "{}MAX_PARALLEL_JOBS must be a positive integer, got \"{}\"",
                    ENV_PREFIX, jobs
                ))
            })?;
        }

        if let Some(lock_dir) = var("LOCK_DIR") {
            self.lock_dir = Some(PathBuf::from(lock_dir));
        }

        for (suffix, language) in [
            ("PYTHON", "python"),
            ("R", "r"),
            ("MATLAB", "matlab"),
            ("JULIA", "julia"),
        ] {
            if let Some(command) = var(suffix) {
                self.interpreters.insert(language.to_string(), command);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_jobs == 0 {
            return Err(Error::Config(
                "max_parallel_jobs must be at least 1".to_string(),
            ));
        }
        self.resources
            .validate()
            .map_err(|e| Error::Config(format!("Invalid default resources: {}", e)))?;
        self.interpreters().map(|_| ())
    }

    /// Interpreter commands keyed by language
    pub fn interpreters(&self) -> Result<HashMap<Language, String>> {
        self.interpreters
            .iter()
            .map(|(name, command)| {
                let language = match name.to_lowercase().as_str() {
                    "python" => Language::Python,
                    "r" => Language::R,
                    "matlab" => Language::Matlab,
                    "julia" => Language::Julia,
                    _ => {
                        return Err(Error::Config(format!(
                            "Unknown interpreter language \"{}\"",
                            name
                        )))
                    }
                };
                Ok((language, command.clone()))
            })
            .collect()
    }

    /// Directory of the collect lock files: the configured one, else
    /// `~/.tmengine/locks`, else `.locks` in the experiment directory.
    pub fn lock_dir(&self, experiment_dir: &Path) -> PathBuf {
        if let Some(dir) = &self.lock_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .map(|home| home.join(".tmengine").join("locks"))
            .unwrap_or_else(|| experiment_dir.join(".locks"))
    }
}
