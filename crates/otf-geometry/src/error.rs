//! Error types for geometry, image decoding and integration

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for geometry operations
pub type Result<T> = std::result::Result<T, GeometryError>;

#[derive(Error, Debug)]
pub enum GeometryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF decoding failed: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Invalid PONI file at line {line}: {reason}")]
    Poni { line: usize, reason: String },

    #[error("PONI file is missing required key '{0}'")]
    MissingKey(&'static str),

    #[error("Detector '{0}' does not declare a pixel size")]
    UnsupportedDetector(String),

    #[error("Radial unit '{0}' needs a wavelength but the calibration has none")]
    MissingWavelength(String),

    #[error("Shape mismatch: image is {image:?}, {what} is {other:?}")]
    ShapeMismatch {
        what: &'static str,
        image: (usize, usize),
        other: (usize, usize),
    },

    #[error("No valid pixels left after masking")]
    NoValidPixels,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unsupported image {path}: {reason}")]
    UnsupportedImage { path: PathBuf, reason: String },

    #[error("Invalid detector config: {0}")]
    Json(#[from] serde_json::Error),
}
