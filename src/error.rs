//! Error types for colorgan.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the colorgan library.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to load an image file.
    #[error("failed to load image from {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// No usable images were found under the dataset root.
    #[error("no images found under {0}")]
    EmptyDataset(PathBuf),

    /// A loss evaluated to NaN or infinity.
    #[error("non-finite {name} at batch {batch}: {value}")]
    NonFiniteLoss {
        name: &'static str,
        batch: usize,
        value: f32,
    },

    /// Invalid configuration value.
    #[error("invalid configuration {name}: {reason}")]
    InvalidConfig { name: &'static str, reason: String },

    /// Failed to save or load a model record.
    #[error("model record error: {0}")]
    Record(#[from] burn::record::RecorderError),

    /// Tensor data could not be read back from the backend.
    #[error("tensor data error: {0}")]
    TensorData(String),

    /// Failed to read or write persisted training state.
    #[error("training state error: {0}")]
    State(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for colorgan operations.
pub type Result<T> = std::result::Result<T, Error>;
