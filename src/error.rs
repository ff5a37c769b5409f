//! Custom error types for pix2pix.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the pix2pix library.
#[derive(Error, Debug)]
pub enum Error {
    /// Raster bytes could not be decoded into an image.
    #[error("failed to decode image: {source}")]
    ImageDecode {
        #[source]
        source: image::ImageError,
    },

    /// Failed to encode the output raster.
    #[error("failed to encode image as {format}: {source}")]
    ImageEncode {
        format: &'static str,
        #[source]
        source: image::ImageError,
    },

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

    /// The request payload is not an acceptable data URL.
    #[error("malformed data URL: {reason}")]
    DataUrl { reason: String },

    /// The data URL payload is not valid base64.
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// No checkpoint exists at the expected location.
    #[error("checkpoint not found at {path}")]
    CheckpointMissing { path: PathBuf },

    /// The checkpoint file could not be read.
    #[error("failed to read checkpoint {path}: {source}")]
    CheckpointRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint file is not a valid tensor archive.
    #[error("invalid checkpoint format: {source}")]
    CheckpointFormat {
        #[source]
        source: safetensors::SafeTensorError,
    },

    /// A checkpoint parameter is stored with an unsupported element type.
    #[error("parameter {name} has dtype {dtype}, expected F32")]
    ParameterDtype { name: String, dtype: String },

    /// A parameter the architecture needs is absent from the checkpoint.
    #[error("checkpoint is missing parameter {name}")]
    MissingParameter { name: String },

    /// A checkpoint parameter does not have the shape the architecture expects.
    #[error("parameter {name} has shape {actual:?}, expected {expected:?}")]
    ParameterShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The network wiring is inconsistent. Never caused by request data.
    #[error("generator architecture violated: {reason}")]
    Architecture { reason: String },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Tensor reshape or concatenation failed.
    #[error("tensor layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
}

impl Error {
    /// Whether the error was caused by the caller's input rather than the service.
    #[must_use]
    pub const fn is_request_error(&self) -> bool {
        matches!(
            self,
            Self::ImageDecode { .. } | Self::DataUrl { .. } | Self::Base64(_)
        )
    }
}

/// Result type alias for pix2pix operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_errors_are_classified() {
        let err = Error::DataUrl {
            reason: "missing payload".to_string(),
        };
        assert!(err.is_request_error());

        let err = Error::Architecture {
            reason: "skip mismatch".to_string(),
        };
        assert!(!err.is_request_error());

        let err = Error::CheckpointMissing {
            path: PathBuf::from("checkpoints/pix2pix/ckpt-40.safetensors"),
        };
        assert!(!err.is_request_error());
    }
}
