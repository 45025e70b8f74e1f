//! Error types for the ingestion loop

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Geometry(#[from] otf_geometry::GeometryError),

    #[error("Malformed integration output {path}: {reason}")]
    MalformedOutput { path: PathBuf, reason: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] serde_json::Error),

    #[error("Failed to write output: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Output {} is already published for '{}'", .output.display(), .owner)]
    OutputConflict { output: PathBuf, owner: String },

    #[error("File '{0}' was never discovered by a scan")]
    UnknownFile(String),

    #[error("Processing '{name}' failed: {source}")]
    FileFailed {
        name: String,
        #[source]
        source: Box<IngestError>,
    },
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedOutput {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn persist(path: impl Into<PathBuf>, err: tempfile::PersistError) -> Self {
        Self::Persist {
            path: path.into(),
            source: err.error,
        }
    }
}
