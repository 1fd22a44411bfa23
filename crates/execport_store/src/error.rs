//! Error types for the job store.

use execport_ids::ExportJobId;
use thiserror::Error;

use crate::types::ExportStatus;

/// Job store result type.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Job store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (creating the database directory)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Export job not found: {0}")]
    NotFound(ExportJobId),

    /// Another worker holds (or took over) the lease on this job.
    #[error("Lease on export job {job_id} is not held by {owner}")]
    LeaseLost { job_id: ExportJobId, owner: String },

    /// Status transitions are monotonic: QUEUED -> READY|FAILED -> EXPIRED.
    #[error("Export job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: ExportJobId,
        from: ExportStatus,
        to: ExportStatus,
    },

    /// Row held a value this version does not understand.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// True when the caller lost ownership of the job and must stop touching it.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost { .. })
    }

    /// True when the job moved on without the caller: another worker holds
    /// the lease, or the job already reached a status the caller can't leave.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::LeaseLost { .. } | Self::InvalidTransition { .. })
    }
}
