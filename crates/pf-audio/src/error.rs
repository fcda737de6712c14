//! Audio error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio device found")]
    NoDevice,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device init failed: {0}")]
    DeviceInitFailed(String),

    #[error("Sound system is already open")]
    AlreadyOpen,

    #[error("Buffer size {actual} does not match the configured {expected} frames")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("Unsupported buffer size: {0}")]
    UnsupportedBufferSize(usize),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Backend error: {0}")]
    BackendError(String),
}

pub type AudioResult<T> = Result<T, AudioError>;
