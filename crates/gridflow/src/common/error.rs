use thiserror::Error;

use crate::common::error::GridError::Generic;

#[derive(Debug, Error)]
pub enum GridError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("No resources available: {0}")]
    NoResources(String),
    #[error("Submission failed: {0}")]
    Submission(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Data staging failed: {0}")]
    DataStaging(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Task {0} is not attached to any controller")]
    Detached(String),
    #[error("Task {0} is already attached to a different controller")]
    AlreadyAttached(String),
    #[error("Unknown job: {0}")]
    UnknownJob(String),
    #[error("Error: {0}")]
    Generic(String),
}

impl GridError {
    /// Transient failures that a driver may log and retry on its next cycle.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GridError::Io(_)
                | GridError::Submission(_)
                | GridError::Auth(_)
                | GridError::DataStaging(_)
                | GridError::UnknownJob(_)
                | GridError::NoResources(_)
                | GridError::Generic(_)
        )
    }
}

impl From<serde_json::error::Error> for GridError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::Generic(format!("Serialization error: {e}"))
    }
}

impl From<anyhow::Error> for GridError {
    fn from(error: anyhow::Error) -> Self {
        Self::Generic(format!("{error:#}"))
    }
}

impl From<toml::de::Error> for GridError {
    fn from(error: toml::de::Error) -> Self {
        Self::Config(error.to_string())
    }
}

impl From<String> for GridError {
    fn from(e: String) -> Self {
        Generic(e)
    }
}

pub fn invalid_operation<T>(message: impl Into<String>) -> crate::Result<T> {
    Err(GridError::InvalidOperation(message.into()))
}
