//! Error taxonomy for export job processing.

use execport_store::StoreError;
use thiserror::Error;

/// Message recorded on jobs whose filters matched nothing.
pub const NO_EXECUTIONS_MESSAGE: &str = "No executions found matching request filters";

pub type Result<T> = std::result::Result<T, ExportError>;

#[derive(Error, Debug)]
pub enum ExportError {
    /// First page came back empty. Terminal, never retried.
    #[error("{}", NO_EXECUTIONS_MESSAGE)]
    NoExecutions,

    /// Execution store could not be read
    #[error("Failed to fetch executions: {0:#}")]
    Fetch(anyhow::Error),

    #[error("Failed to upload archive: {0:#}")]
    Upload(anyhow::Error),

    /// Archive was uploaded but the READY transition failed; this attempt's
    /// upload has already been rolled back.
    #[error("Failed to record completed export: {0}")]
    StatusUpdate(StoreError),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Blocking archive task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ExportError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoExecutions
            | Self::StatusUpdate(_)
            | Self::Serialization(_)
            | Self::Config(_) => false,
            Self::Store(e) => !e.is_superseded(),
            Self::Fetch(_) | Self::Upload(_) | Self::Archive(_) | Self::Io(_) | Self::Join(_) => {
                true
            }
        }
    }

    /// The job now belongs to another worker or has already settled; nothing
    /// more may be written to it.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Store(e) | Self::StatusUpdate(e) if e.is_superseded())
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for ExportError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
