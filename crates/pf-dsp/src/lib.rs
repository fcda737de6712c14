//! pf-dsp: Per-voice and per-output DSP for PipeForge
//!
//! Provides the building blocks the sound engine runs per period:
//! - Fader (linear gain ramps with velocity-volume smoothing)
//! - Resampler (linear and polyphase windowed-sinc interpolation)
//! - Tone-balance biquad filter
//! - Per-output algorithmic reverb

mod fader;
mod filter;
mod resample;
mod reverb;

pub use fader::*;
pub use filter::*;
pub use resample::*;
pub use reverb::*;
