use std::path::PathBuf;

use async_openai::error::OpenAIError;
use image::ImageError;
use thiserror::Error;

/// Errors raised while captioning a single clip or setting up a batch.
///
/// Batch runs never propagate per-file errors; they are rendered into the
/// file's outcome instead. Only [`CaptionError::InvalidFolder`] aborts a batch.
#[derive(Debug, Error)]
pub(crate) enum CaptionError {
    #[error("Failed to open video {path}: {reason}")]
    VideoOpen { path: PathBuf, reason: String },

    #[error("No frames extracted from {path}")]
    NoFramesExtracted { path: PathBuf },

    #[error("Inference endpoint error: {0}")]
    Endpoint(String),

    #[error("Invalid target folder: {0}")]
    InvalidFolder(PathBuf),

    #[error("Unsupported file extension: {0}")]
    UnsupportedExtension(PathBuf),

    #[error("Failed to decode frame: {0}")]
    FrameDecode(String),

    #[error("Failed to build chat request: {0}")]
    InvalidRequest(#[from] OpenAIError),

    #[error("Image encoding error: {0}")]
    Image(#[from] ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for CaptionError {
    fn from(error: reqwest::Error) -> Self {
        CaptionError::Endpoint(error.to_string())
    }
}
