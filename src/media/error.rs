//! Media error types

use thiserror::Error;

/// Errors that can occur in the media pipeline
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Delta frame without a matching reference; keyframe required")]
    NeedKeyframe,

    #[error("Corrupt frame: {0}")]
    Corrupt(String),

    #[error("Unsupported resolution: {width}x{height}")]
    UnsupportedResolution { width: u32, height: u32 },

    #[error("Codec not available: {0}")]
    CodecUnavailable(&'static str),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Render failed: {0}")]
    Render(String),

    #[error("{count} consecutive media errors, last: {last}")]
    TooManyErrors { count: u32, last: String },
}
