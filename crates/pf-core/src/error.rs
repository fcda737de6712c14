//! Error types for PipeForge

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine lifecycle violation: {0}")]
    Lifecycle(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Buffer size {0} exceeds the maximum of {1} frames")]
    BufferTooLarge(usize, usize),

    #[error("Unknown audio group: {0}")]
    UnknownAudioGroup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type EngineResult<T> = Result<T, EngineError>;
