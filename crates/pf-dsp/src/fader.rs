//! Per-voice gain envelope
//!
//! A fader multiplies four components per frame:
//! - the attack ramp: 0 -> target over a crossfade length (or an instant
//!   jump for voices that start at full level)
//! - the decay envelope: 1 -> 0 once a fade-out is scheduled; independent
//!   of the attack ramp so a crossfading release can still be given a
//!   decay tail
//! - the velocity volume, smoothed across each block so concurrent
//!   updates from the control thread cannot click
//! - an external per-period volume (windchest level x tremulant output),
//!   also smoothed across the block

use pf_core::Sample;

/// Linear gain ramps with block-rate velocity/external smoothing
#[derive(Debug, Clone)]
pub struct Fader {
    /// Current attack-ramp gain
    gain: Sample,
    /// Attack-ramp destination
    target_gain: Sample,
    /// Per-frame ramp step while `remaining > 0`
    increment: Sample,
    /// Frames left in the attack ramp
    remaining: usize,
    /// Decay envelope (1 until armed, then ramps to 0)
    decay_gain: Sample,
    decay_increment: Sample,
    decay_remaining: usize,
    decaying: bool,
    /// Velocity volume applied on top of the ramps
    velocity_volume: Sample,
    /// Velocity volume the next block ramps to
    next_velocity_volume: Sample,
    /// External volume seen by the previous block (None before first block)
    last_external: Option<Sample>,
}

impl Default for Fader {
    fn default() -> Self {
        Self {
            gain: 0.0,
            target_gain: 0.0,
            increment: 0.0,
            remaining: 0,
            decay_gain: 1.0,
            decay_increment: 0.0,
            decay_remaining: 0,
            decaying: false,
            velocity_volume: 1.0,
            next_velocity_volume: 1.0,
            last_external: None,
        }
    }
}

impl Fader {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Start at `target` immediately (new attack voices). Clears any
    /// pending decay.
    pub fn setup(&mut self, target: Sample, velocity_volume: Sample) {
        self.gain = target;
        self.target_gain = target;
        self.increment = 0.0;
        self.remaining = 0;
        self.decay_gain = 1.0;
        self.decay_increment = 0.0;
        self.decay_remaining = 0;
        self.decaying = false;
        self.velocity_volume = velocity_volume;
        self.next_velocity_volume = velocity_volume;
        self.last_external = None;
    }

    /// Ramp in from silence to `target` over `crossfade_samples` (the
    /// rising half of a crossfade). Clears any pending decay.
    pub fn setup_crossfade(
        &mut self,
        target: Sample,
        velocity_volume: Sample,
        crossfade_samples: usize,
    ) {
        if crossfade_samples == 0 {
            self.setup(target, velocity_volume);
            return;
        }
        self.gain = 0.0;
        self.target_gain = target;
        self.remaining = crossfade_samples;
        self.increment = target / crossfade_samples as Sample;
        self.decay_gain = 1.0;
        self.decay_increment = 0.0;
        self.decay_remaining = 0;
        self.decaying = false;
        self.velocity_volume = velocity_volume;
        self.next_velocity_volume = velocity_volume;
    }

    /// Schedule a fade to silence over `samples`. Idempotent while a
    /// decay is already running.
    pub fn start_decreasing_volume(&mut self, samples: usize) {
        if self.decaying {
            return;
        }
        self.decaying = true;
        if samples == 0 {
            self.decay_gain = 0.0;
            self.decay_increment = 0.0;
            self.decay_remaining = 0;
        } else {
            self.decay_remaining = samples;
            self.decay_increment = -self.decay_gain / samples as Sample;
        }
    }

    /// True once no sample this fader produces can be non-zero.
    pub fn is_silent(&self) -> bool {
        (self.decaying && self.decay_gain == 0.0)
            || (self.gain == 0.0 && self.target_gain == 0.0)
    }

    pub fn velocity_volume(&self) -> Sample {
        self.next_velocity_volume
    }

    /// Update the velocity volume; takes effect smoothly over the next
    /// processed block. Safe to call with a stale value.
    pub fn set_velocity_volume(&mut self, volume: Sample) {
        self.next_velocity_volume = volume;
    }

    /// Apply the fader to `n_frames` of interleaved stereo, scaled by the
    /// external `volume`.
    pub fn process(&mut self, n_frames: usize, buffer: &mut [Sample], volume: Sample) {
        debug_assert!(buffer.len() >= n_frames * 2);
        if n_frames == 0 {
            return;
        }

        let external_start = self.last_external.unwrap_or(volume);
        let external_step = (volume - external_start) / n_frames as Sample;
        let velocity_step =
            (self.next_velocity_volume - self.velocity_volume) / n_frames as Sample;

        let mut external = external_start;
        let mut velocity = self.velocity_volume;

        for frame in 0..n_frames {
            if self.remaining > 0 {
                self.gain += self.increment;
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.gain = self.target_gain;
                }
            }
            if self.decaying && self.decay_remaining > 0 {
                self.decay_gain += self.decay_increment;
                self.decay_remaining -= 1;
                if self.decay_remaining == 0 {
                    self.decay_gain = 0.0;
                }
            }
            external += external_step;
            velocity += velocity_step;

            let total = self.gain * self.decay_gain * velocity * external;
            buffer[frame * 2] *= total;
            buffer[frame * 2 + 1] *= total;
        }

        self.velocity_volume = self.next_velocity_volume;
        self.last_external = Some(volume);
    }
}
