//! Workflow descriptors and the step command lines they contain
//!
//! A workflow descriptor is a YAML list of command lines, one per step:
//!
//! ```yaml
//! - image-analysis {experiment_dir} --pipeline segmentation --batch-size 10
//! - image-analysis {experiment_dir} --pipeline measurement --batch-size 10
//! ```
//!
//! A line is split into words first and `{name}` placeholders are then
//! substituted inside each word, so values may contain spaces or quotes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};

static PLACEHOLDER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\}").expect("Valid regex pattern"));

/// Ordered step command lines of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowDescriptor {
    pub steps: Vec<String>,
}

impl WorkflowDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::descriptor(format!(
                "Cannot read workflow description {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let descriptor: Self = serde_yaml::from_str(content)?;
        if descriptor.steps.is_empty() {
            return Err(Error::descriptor("Workflow description lists no steps"));
        }
        Ok(descriptor)
    }

    /// Parses every line after substituting `variables`.
    pub fn commands(&self, variables: &HashMap<String, String>) -> Result<Vec<StepCommand>> {
        self.steps
            .iter()
            .map(|line| StepCommand::parse(line, variables))
            .collect()
    }
}

/// Replaces `{name}` placeholders in one word; unknown names are a
/// descriptor error.
pub fn substitute(word: &str, variables: &HashMap<String, String>) -> Result<String> {
    if let Some(caps) = PLACEHOLDER_REGEX
        .captures_iter(word)
        .find(|caps| !variables.contains_key(&caps[1]))
    {
        return Err(Error::descriptor(format!(
            "Unknown variable \"{}\" in step command word: {}",
            &caps[1], word
        )));
    }
    Ok(PLACEHOLDER_REGEX
        .replace_all(word, |caps: &regex::Captures| {
            variables.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned())
}

/// A step's program name with its positional arguments and `--key value`
/// options. A bare `--flag` is stored as `"true"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCommand {
    pub program: String,
    pub positional: Vec<String>,
    pub options: BTreeMap<String, String>,
}

impl StepCommand {
    pub fn parse(line: &str, variables: &HashMap<String, String>) -> Result<Self> {
        let words = shell_words::split(line)
            .map_err(|e| Error::descriptor(format!("Invalid step command \"{}\": {}", line, e)))?;
        let words = words
            .iter()
            .map(|word| substitute(word, variables))
            .collect::<Result<Vec<_>>>()?;
        Self::from_words(words)
    }

    pub fn from_words(words: Vec<String>) -> Result<Self> {
        let mut words = words.into_iter().peekable();
        let program = words
            .next()
            .ok_or_else(|| Error::descriptor("Empty step command"))?;
        let mut positional = Vec::new();
        let mut options = BTreeMap::new();
        while let Some(word) = words.next() {
            let Some(key) = word.strip_prefix("--") else {
                positional.push(word);
                continue;
            };
            if let Some((key, value)) = key.split_once('=') {
                options.insert(key.to_string(), value.to_string());
                continue;
            }
            let value = match words.peek() {
                Some(next) if !next.starts_with("--") => words.next().unwrap_or_default(),
                _ => "true".to_string(),
            };
            options.insert(key.to_string(), value);
        }
        Ok(Self {
            program,
            positional,
            options,
        })
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.option(key), Some("true"))
    }

    /// Typed option value; an unparsable value is a descriptor error.
    pub fn parse_option<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.option(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| {
                    Error::descriptor(format!(
                        "Invalid value \"{}\" for option --{} of {}: {}",
                        raw, key, self.program, e
                    ))
                })
            })
            .transpose()
    }

    pub fn required_option(&self, key: &str) -> Result<&str> {
        self.option(key).ok_or_else(|| {
            Error::descriptor(format!(
                "Step {} requires option --{}",
                self.program, key
            ))
        })
    }

    /// The command line as it would be typed
    pub fn to_words(&self) -> Vec<String> {
        let mut words = vec![self.program.clone()];
        words.extend(self.positional.iter().cloned());
        for (key, value) in &self.options {
            words.push(format!("--{}", key));
            if value != "true" {
                words.push(value.clone());
            }
        }
        words
    }
}

impl std::fmt::Display for StepCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&shell_words::join(self.to_words()))
    }
}
