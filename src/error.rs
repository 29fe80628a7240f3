use thiserror::Error;

use crate::execution::backend::BackendError;
use crate::storage::StorageError;

/// How an error propagates through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or inconsistent step, pipeline or handle descriptors
    Descriptor,
    /// Required inputs or expected outputs of the previous step are absent
    UpstreamContract,
    /// Failure inside a module or its language backend
    Execution,
    /// I/O, persistence, serialization and locking failures
    Infrastructure,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Descriptor error: {0}")]
    Descriptor(String),

    #[error("Next step error: {0}")]
    NextStep(String),

    #[error("Execution error in module \"{module}\": {message}")]
    Execution { module: String, message: String },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl Error {
    pub fn descriptor(message: impl Into<String>) -> Self {
        Error::Descriptor(message.into())
    }

    pub fn next_step(message: impl Into<String>) -> Self {
        Error::NextStep(message.into())
    }

    pub fn execution(module: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Execution {
            module: module.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            // every YAML document the engine reads is a descriptor
            Error::Descriptor(_) | Error::Yaml(_) => ErrorKind::Descriptor,
            Error::NextStep(_) => ErrorKind::UpstreamContract,
            Error::Execution { .. } | Error::Backend(_) => ErrorKind::Execution,
            Error::Persistence(StorageError::NotUnique(_)) => ErrorKind::Descriptor,
            Error::Persistence(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Lock(_) => ErrorKind::Infrastructure,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::descriptor("missing module").kind(),
            ErrorKind::Descriptor
        );
        assert_eq!(
            Error::next_step("outputs missing").kind(),
            ErrorKind::UpstreamContract
        );
        assert_eq!(
            Error::execution("smooth", "boom").kind(),
            ErrorKind::Execution
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(Error::from(io).kind(), ErrorKind::Infrastructure);
        let yaml = serde_yaml::from_str::<Vec<String>>("[unclosed").unwrap_err();
        assert_eq!(Error::from(yaml).kind(), ErrorKind::Descriptor);
    }

    #[test]
    fn test_error_messages() {
        let err = Error::execution("smooth", "division by zero");
        assert_eq!(
            err.to_string(),
            "Execution error in module \"smooth\": division by zero"
        );
        let err = Error::descriptor("Batch size must be 1 when plotting is active.");
        assert!(err.to_string().starts_with("Descriptor error:"));
    }
}
