//! Jobs a step hands to the submission layer

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::execution::JobBatch;

/// Resources requested from the cluster scheduler for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(with = "humantime_serde", default = "default_duration")]
    pub duration: Duration,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_cores")]
    pub cores: u32,
}

fn default_duration() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_memory_mb() -> u64 {
    2048
}

fn default_cores() -> u32 {
    1
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            duration: default_duration(),
            memory_mb: default_memory_mb(),
            cores: default_cores(),
        }
    }
}

impl ResourceRequest {
    pub fn validate(&self) -> Result<()> {
        if self.cores == 0 {
            return Err(Error::descriptor("Number of cores must be positive"));
        }
        if self.memory_mb == 0 {
            return Err(Error::descriptor("Memory must be positive"));
        }
        if self.duration.is_zero() {
            return Err(Error::descriptor("Duration must be positive"));
        }
        Ok(())
    }

    /// Parses `HH:MM:SS` or a humantime duration such as `90m`.
    pub fn parse_duration(value: &str) -> Result<Duration> {
        let parts: Vec<&str> = value.split(':').collect();
        if let [hours, minutes, seconds] = parts[..] {
            let parse = |part: &str| {
                part.parse::<u64>().map_err(|_| {
                    Error::descriptor(format!("Invalid duration \"{}\", expected HH:MM:SS", value))
                })
            };
            let (hours, minutes, seconds) = (parse(hours)?, parse(minutes)?, parse(seconds)?);
            if minutes >= 60 || seconds >= 60 {
                return Err(Error::descriptor(format!(
                    "Invalid duration \"{}\", expected HH:MM:SS",
                    value
                )));
            }
            return Ok(Duration::from_secs(hours * 3600 + minutes * 60 + seconds));
        }
        humantime_serde::re::humantime::parse_duration(value)
            .map_err(|e| Error::descriptor(format!("Invalid duration \"{}\": {}", value, e)))
    }
}

/// One fan-out job of a step, processing one batch of sites
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunJob {
    /// One-based, equal to the batch id
    pub id: usize,
    pub batch: JobBatch,
    pub resources: ResourceRequest,
    /// Command line that runs this job on a remote host
    pub arguments: Vec<String>,
}

/// The single job that runs after all run jobs of a step finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectJob {
    pub resources: ResourceRequest,
}

/// All jobs of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepJobs {
    pub step: String,
    pub run: Vec<RunJob>,
    pub collect: Option<CollectJob>,
}

impl StepJobs {
    pub fn batches(&self) -> impl Iterator<Item = &JobBatch> {
        self.run.iter().map(|job| &job.batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            ResourceRequest::parse_duration("02:30:15").unwrap(),
            Duration::from_secs(2 * 3600 + 30 * 60 + 15)
        );
        assert_eq!(
            ResourceRequest::parse_duration("90m").unwrap(),
            Duration::from_secs(90 * 60)
        );
        assert!(ResourceRequest::parse_duration("01:75:00").is_err());
        assert!(ResourceRequest::parse_duration("soon").is_err());
    }

    #[test]
    fn test_validate_resources() {
        assert!(ResourceRequest::default().validate().is_ok());
        let request = ResourceRequest {
            cores: 0,
            ..Default::default()
        };
        assert!(request.validate().is_err());
        let request = ResourceRequest {
            memory_mb: 0,
            ..Default::default()
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_resources_from_toml() {
        let request: ResourceRequest = toml::from_str("duration = \"1h 30m\"\ncores = 4").unwrap();
        assert_eq!(request.duration, Duration::from_secs(5400));
        assert_eq!(request.cores, 4);
        assert_eq!(request.memory_mb, 2048);
    }
}
