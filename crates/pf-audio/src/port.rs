//! Audio-device port interface
//!
//! A port wraps one platform audio device. The sound system initializes
//! it with the session's fixed format, opens it, and starts its stream;
//! from then on the driver's real-time callback pushes each period
//! through the [`PortHandle`](crate::PortHandle) it was given. Backends
//! must reject a sample-rate or buffer-size change from `start_stream`.

use pf_core::Sample;

use crate::{AudioResult, PortHandle};

/// Fixed session format a port is initialized with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortParams {
    pub channels: usize,
    pub sample_rate: u32,
    pub samples_per_buffer: usize,
    pub desired_latency_ms: u32,
    /// Device index within the sound system
    pub index: usize,
}

/// One platform audio output device
pub trait SoundPort: Send {
    fn name(&self) -> &str;

    /// Open the device (no audio flowing yet).
    fn open(&mut self) -> AudioResult<()>;

    /// Start the driver callback. Must fail when the driver settles on a
    /// different sample rate or buffer size than the init params.
    fn start_stream(&mut self) -> AudioResult<()>;

    fn close(&mut self);

    /// Latency the driver actually provides (ms).
    fn actual_latency_ms(&self) -> f64;
}

/// Port without a driver behind it; periods are produced by whoever
/// holds the [`PortHandle`]. Serves the tests and headless rendering.
pub struct LoopbackPort {
    name: String,
    params: PortParams,
    handle: PortHandle,
    open: bool,
}

impl LoopbackPort {
    pub fn new(name: impl Into<String>, params: PortParams, handle: PortHandle) -> Self {
        Self {
            name: name.into(),
            params,
            handle,
            open: false,
        }
    }

    pub fn params(&self) -> PortParams {
        self.params
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Run one driver callback worth of audio.
    pub fn render_period(&self, out: &mut [Sample]) -> bool {
        self.handle.render(out)
    }
}

impl SoundPort for LoopbackPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> AudioResult<()> {
        self.open = true;
        Ok(())
    }

    fn start_stream(&mut self) -> AudioResult<()> {
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn actual_latency_ms(&self) -> f64 {
        self.params.samples_per_buffer as f64 * 1000.0 / self.params.sample_rate as f64
    }
}
