//! Per-voice section stream
//!
//! Pulls stereo frames out of a decoded section at a fractional rate.
//! Sustained sections loop; releases run off the end and report
//! exhaustion, after which the voice is returned to the pool.

use std::sync::Arc;

use pf_core::{InterpolationType, Sample};
use pf_dsp::interpolate;
use pf_model::AudioSection;

/// Streaming state over one audio section
#[derive(Debug, Clone, Default)]
pub struct SamplerStream {
    section: Option<Arc<AudioSection>>,
    interpolation: InterpolationType,
    /// Integer part of the read position (frames)
    pos_index: usize,
    /// Fractional part of the read position [0, 1)
    pos_frac: Sample,
    /// Source frames consumed per output frame
    increment: Sample,
}

impl SamplerStream {
    /// Start reading `section` from the top at `increment` source frames
    /// per output frame.
    pub fn init(
        &mut self,
        section: Arc<AudioSection>,
        interpolation: InterpolationType,
        increment: Sample,
    ) {
        self.section = Some(section);
        self.interpolation = interpolation;
        self.pos_index = 0;
        self.pos_frac = 0.0;
        self.increment = increment.max(1e-6);
    }

    /// Start reading `section` with the resample phase of `other`, so a
    /// crossfade hand-over continues without a phase step.
    pub fn init_aligned(
        &mut self,
        section: Arc<AudioSection>,
        interpolation: InterpolationType,
        other: &SamplerStream,
    ) {
        self.section = Some(section);
        self.interpolation = interpolation;
        self.pos_index = 0;
        self.pos_frac = other.pos_frac;
        self.increment = if other.increment > 0.0 {
            other.increment
        } else {
            1.0
        };
    }

    pub fn is_initialized(&self) -> bool {
        self.section.is_some()
    }

    pub fn increment(&self) -> Sample {
        self.increment
    }

    /// Current integer read position (frames into the section).
    pub fn position(&self) -> usize {
        self.pos_index
    }

    /// Read `n_frames` interleaved stereo frames into `out`.
    ///
    /// Returns false once the section is exhausted; the remainder of the
    /// block is zero-filled and the stream stays exhausted.
    pub fn read_block(&mut self, out: &mut [Sample], n_frames: usize) -> bool {
        debug_assert!(out.len() >= n_frames * 2);

        let Some(section) = self.section.clone() else {
            out[..n_frames * 2].fill(0.0);
            return false;
        };
        let data = section.data();
        let channels = section.channels();
        let length = section.length();
        let loop_region = section.loop_region();

        for frame in 0..n_frames {
            if self.pos_index >= length && loop_region.is_none() {
                out[frame * 2..n_frames * 2].fill(0.0);
                return false;
            }

            let (left, right) = interpolate(
                self.interpolation,
                data,
                channels,
                self.pos_index,
                self.pos_frac,
            );
            out[frame * 2] = left;
            out[frame * 2 + 1] = right;

            self.pos_frac += self.increment;
            let carry = self.pos_frac as usize;
            self.pos_index += carry;
            self.pos_frac -= carry as Sample;

            if let Some(region) = loop_region {
                if self.pos_index >= region.end {
                    self.pos_index -= region.end - region.start;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(frames: usize, value: Sample) -> Arc<AudioSection> {
        Arc::new(AudioSection::new(vec![value; frames * 2], 2, 44100))
    }

    #[test]
    fn test_uninitialized_stream_is_exhausted() {
        let mut stream = SamplerStream::default();
        let mut out = vec![1.0; 8];
        assert!(!stream.read_block(&mut out, 4));
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_unity_rate_reads_constant() {
        let mut stream = SamplerStream::default();
        stream.init(section(64, 0.5), InterpolationType::Linear, 1.0);

        let mut out = vec![0.0; 32 * 2];
        assert!(stream.read_block(&mut out, 32));
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-12));
        assert_eq!(stream.position(), 32);
    }

    #[test]
    fn test_exhaustion_zero_fills() {
        let mut stream = SamplerStream::default();
        stream.init(section(16, 0.5), InterpolationType::Linear, 1.0);

        let mut out = vec![1.0; 32 * 2];
        assert!(!stream.read_block(&mut out, 32));
        // The tail past the section is silence.
        assert!(out[17 * 2..].iter().all(|&s| s == 0.0));
        // Still exhausted on the next read.
        assert!(!stream.read_block(&mut out, 32));
    }

    #[test]
    fn test_loop_region_wraps() {
        let mut data = vec![0.0; 8 * 2];
        for frame in 0..8 {
            data[frame * 2] = frame as Sample;
            data[frame * 2 + 1] = frame as Sample;
        }
        let looped = Arc::new(AudioSection::new(data, 2, 44100).with_loop(2, 6));

        let mut stream = SamplerStream::default();
        stream.init(looped, InterpolationType::Linear, 1.0);

        let mut out = vec![0.0; 16 * 2];
        assert!(stream.read_block(&mut out, 16));
        // 0 1 2 3 4 5 then wraps to 2 3 4 5 2 3 ...
        assert_eq!(out[0], 0.0);
        assert_eq!(out[5 * 2], 5.0);
        assert_eq!(out[6 * 2], 2.0);
        assert_eq!(out[10 * 2], 2.0);
    }

    #[test]
    fn test_double_rate_skips_frames() {
        let mut data = vec![0.0; 8 * 2];
        for frame in 0..8 {
            data[frame * 2] = frame as Sample;
            data[frame * 2 + 1] = frame as Sample;
        }
        let mut stream = SamplerStream::default();
        stream.init(
            Arc::new(AudioSection::new(data, 2, 44100)),
            InterpolationType::Linear,
            2.0,
        );

        let mut out = vec![0.0; 4 * 2];
        assert!(stream.read_block(&mut out, 4));
        assert_eq!(out[0], 0.0);
        assert_eq!(out[2], 2.0);
        assert_eq!(out[4], 4.0);
    }

    #[test]
    fn test_aligned_init_carries_phase() {
        let mut a = SamplerStream::default();
        a.init(section(64, 0.5), InterpolationType::Linear, 0.75);
        let mut out = vec![0.0; 8 * 2];
        a.read_block(&mut out, 5);

        let mut b = SamplerStream::default();
        b.init_aligned(section(64, 0.3), InterpolationType::Linear, &a);
        assert_eq!(b.increment(), 0.75);
        assert!((b.pos_frac - a.pos_frac).abs() < 1e-12);
        assert_eq!(b.position(), 0);
    }
}
