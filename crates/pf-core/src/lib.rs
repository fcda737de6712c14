//! pf-core: Shared types, configuration, and errors for PipeForge
//!
//! This crate provides the foundational types used across all PipeForge
//! crates.

mod config;
mod error;
mod sample;

pub use config::*;
pub use error::*;
pub use sample::*;

/// Maximum number of frames per audio period the engine supports.
pub const MAX_FRAME_SIZE: usize = 2048;

/// Number of channels a mix bus carries. This value cannot be changed at
/// present.
pub const MAX_OUTPUT_CHANNELS: usize = 2;
