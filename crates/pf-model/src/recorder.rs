//! Recorder sink interface
//!
//! The engine schedules a recorder task downstream of the output (or
//! downmix) tasks and hands it each period's mixed audio. Encoding and
//! file I/O happen behind this trait, outside the audio path's ownership.

use parking_lot::Mutex;
use pf_core::Sample;

/// Destination for recorded audio
pub trait RecorderSink: Send + Sync {
    fn set_sample_rate(&self, sample_rate: u32);

    /// Sample width of the target format (2, 3 or 4 bytes)
    fn set_bytes_per_sample(&self, bytes: u8);

    /// One period of interleaved audio from one recorded task
    fn write_block(&self, interleaved: &[Sample], channels: usize);
}

/// Sink that discards everything (recording disabled)
#[derive(Debug, Default)]
pub struct NullRecorderSink;

impl RecorderSink for NullRecorderSink {
    fn set_sample_rate(&self, _sample_rate: u32) {}
    fn set_bytes_per_sample(&self, _bytes: u8) {}
    fn write_block(&self, _interleaved: &[Sample], _channels: usize) {}
}

/// Sink that keeps everything in memory; used by tests
#[derive(Debug, Default)]
pub struct CaptureRecorderSink {
    samples: Mutex<Vec<Sample>>,
}

impl CaptureRecorderSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captured(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }
}

impl RecorderSink for CaptureRecorderSink {
    fn set_sample_rate(&self, _sample_rate: u32) {}

    fn set_bytes_per_sample(&self, _bytes: u8) {}

    fn write_block(&self, interleaved: &[Sample], _channels: usize) {
        self.samples.lock().extend_from_slice(interleaved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink_accumulates() {
        let sink = CaptureRecorderSink::new();
        sink.write_block(&[0.1, 0.2], 2);
        sink.write_block(&[0.3, 0.4], 2);
        assert_eq!(sink.captured(), vec![0.1, 0.2, 0.3, 0.4]);
    }
}
