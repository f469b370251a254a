//! Ingestion error type.

use address_map_database::DbError;
use address_map_extract::ExtractError;
use address_map_location_models::DatasetStatus;

/// Errors surfaced by the ingestion pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The request is invalid; nothing was written.
    #[error("{0}")]
    Validation(String),

    /// Unknown dataset id.
    #[error("Dataset {0} not found")]
    NotFound(i64),

    /// The dataset is not in a state that allows the operation.
    #[error("Dataset {id} cannot be reprocessed while {status}")]
    Conflict {
        /// Dataset id.
        id: i64,
        /// Status observed when the request was rejected.
        status: DatasetStatus,
    },

    /// The raw file backing the dataset no longer exists.
    #[error("Source file for dataset {id} no longer exists: {path}")]
    SourceMissing {
        /// Dataset id.
        id: i64,
        /// Recorded file path.
        path: String,
    },

    /// Store read or write failure.
    #[error(transparent)]
    Persistence(#[from] DbError),

    /// The source file could not be read.
    #[error(transparent)]
    Extract(ExtractError),

    /// Filesystem error while storing a raw upload.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path that caused the error.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Processing was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The worker pool no longer accepts jobs.
    #[error("Worker pool is shut down")]
    ShutDown,

    /// A background task panicked or was dropped.
    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<ExtractError> for IngestError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Cancelled => Self::Cancelled,
            other => Self::Extract(other),
        }
    }
}

impl IngestError {
    /// Wraps an I/O error with the path it occurred at.
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
