//! Per-output algorithmic reverb
//!
//! A fixed Schroeder topology (four parallel combs into two series
//! allpasses per channel) with a pre-delay line. One instance serves one
//! output task; configured once at engine build and reset between
//! sessions.

use pf_core::{ReverbConfig, Sample};

/// Base comb delays (samples at 44.1 kHz), mutually prime
const COMB_TUNINGS: [usize; 4] = [1116, 1277, 1422, 1617];
/// Allpass delays (samples at 44.1 kHz)
const ALLPASS_TUNINGS: [usize; 2] = [556, 441];
/// Offset added to every line on odd channels to decorrelate the field
const CHANNEL_SPREAD: usize = 23;
const ALLPASS_FEEDBACK: Sample = 0.5;

#[derive(Debug, Clone)]
struct DelayLine {
    buffer: Vec<Sample>,
    pos: usize,
}

impl DelayLine {
    fn new(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            pos: 0,
        }
    }

    #[inline]
    fn read(&self) -> Sample {
        self.buffer[self.pos]
    }

    #[inline]
    fn write_advance(&mut self, value: Sample) {
        self.buffer[self.pos] = value;
        self.pos += 1;
        if self.pos >= self.buffer.len() {
            self.pos = 0;
        }
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.pos = 0;
    }
}

#[derive(Debug, Clone)]
struct ChannelReverb {
    predelay: DelayLine,
    combs: Vec<DelayLine>,
    allpasses: Vec<DelayLine>,
    feedback: Sample,
}

impl ChannelReverb {
    fn new(config: &ReverbConfig, channel: usize, sample_rate: u32) -> Self {
        let scale = sample_rate as f64 / 44100.0;
        let spread = (channel % 2) * CHANNEL_SPREAD;
        let predelay_len = ((config.predelay_ms / 1000.0) * sample_rate as f64) as usize;

        Self {
            predelay: DelayLine::new(predelay_len),
            combs: COMB_TUNINGS
                .iter()
                .map(|&t| DelayLine::new(((t + spread) as f64 * scale) as usize))
                .collect(),
            allpasses: ALLPASS_TUNINGS
                .iter()
                .map(|&t| DelayLine::new(((t + spread) as f64 * scale) as usize))
                .collect(),
            // Feedback below 1 keeps every comb stable.
            feedback: (0.7 + 0.28 * config.decay.clamp(0.0, 1.0)).min(0.98),
        }
    }

    #[inline]
    fn tick(&mut self, dry: Sample) -> Sample {
        let input = self.predelay.read();
        self.predelay.write_advance(dry);

        let mut wet = 0.0;
        for comb in &mut self.combs {
            let out = comb.read();
            comb.write_advance(input + out * self.feedback);
            wet += out;
        }
        wet *= 0.25;

        for allpass in &mut self.allpasses {
            let delayed = allpass.read();
            let out = delayed - ALLPASS_FEEDBACK * wet;
            allpass.write_advance(wet + ALLPASS_FEEDBACK * delayed);
            wet = out;
        }
        wet
    }

    fn clear(&mut self) {
        self.predelay.clear();
        for line in self.combs.iter_mut().chain(self.allpasses.iter_mut()) {
            line.clear();
        }
    }
}

/// Reverb for one output task, processing its interleaved buffer in place
#[derive(Debug, Default)]
pub struct Reverb {
    channels: Vec<ChannelReverb>,
    n_channels: usize,
    wet: Sample,
}

impl Reverb {
    pub fn new(n_channels: usize) -> Self {
        Self {
            channels: Vec::new(),
            n_channels,
            wet: 0.0,
        }
    }

    /// Configure for a session; a disabled config leaves `process` a no-op.
    pub fn setup(&mut self, config: &ReverbConfig, sample_rate: u32) {
        if config.enabled {
            self.channels = (0..self.n_channels)
                .map(|channel| ChannelReverb::new(config, channel, sample_rate))
                .collect();
            self.wet = config.wet.clamp(0.0, 1.0);
        } else {
            self.channels.clear();
            self.wet = 0.0;
        }
    }

    pub fn is_active(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Add the wet signal onto `n_frames` of interleaved audio.
    pub fn process(&mut self, buffer: &mut [Sample], n_frames: usize) {
        if self.channels.is_empty() {
            return;
        }
        for frame in 0..n_frames {
            for (channel, state) in self.channels.iter_mut().enumerate() {
                let at = frame * self.n_channels + channel;
                let dry = buffer[at];
                buffer[at] = dry + self.wet * state.tick(dry);
            }
        }
    }

    /// Drop all tail state (between sessions).
    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_reverb_is_passthrough() {
        let mut reverb = Reverb::new(2);
        reverb.setup(&ReverbConfig::default(), 44100);
        assert!(!reverb.is_active());

        let mut buf = vec![0.5; 32];
        reverb.process(&mut buf, 16);
        assert!(buf.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_enabled_reverb_produces_tail() {
        let config = ReverbConfig {
            enabled: true,
            predelay_ms: 0.0,
            decay: 0.5,
            wet: 0.5,
        };
        let mut reverb = Reverb::new(2);
        reverb.setup(&config, 44100);
        assert!(reverb.is_active());

        // One impulse period, then silence in.
        let mut buf = vec![0.0; 2048 * 2];
        buf[0] = 1.0;
        buf[1] = 1.0;
        reverb.process(&mut buf, 2048);

        let mut tail = vec![0.0; 2048 * 2];
        reverb.process(&mut tail, 2048);
        assert!(tail.iter().any(|&s| s.abs() > 1e-9));

        reverb.reset();
        let mut after_reset = vec![0.0; 2048 * 2];
        reverb.process(&mut after_reset, 2048);
        assert!(after_reset.iter().all(|&s| s.abs() < 1e-12));
    }
}
