//! Crate error types
//!
//! Library code returns [`FormscanError`]; the CLI glue wraps it in `anyhow`.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the extraction core and its collaborators
#[derive(Debug, Error)]
pub enum FormscanError {
    /// OCR backend is missing or cannot be run. Fatal before a batch starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// Input file could not be read or decoded
    #[error("cannot decode image {path}")]
    Decode { path: PathBuf },

    /// A single OCR call failed (crop, backend failure, timeout)
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Profile catalog violated one of its invariants
    #[error("invalid profile '{name}': {reason}")]
    InvalidProfile { name: String, reason: String },

    /// Named profile does not exist
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Crate result alias
pub type Result<T> = std::result::Result<T, FormscanError>;
