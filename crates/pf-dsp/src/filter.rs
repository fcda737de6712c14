//! Tone-balance biquad filter (Transposed Direct Form II)
//!
//! TDF-II is numerically optimal for floating-point arithmetic,
//! minimizing quantization noise and ensuring stability.

use pf_core::Sample;
use std::f64::consts::PI;

/// Biquad coefficients
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// Low-shelf filter coefficients
    pub fn low_shelf(freq: f64, gain_db: f64, sample_rate: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / 2.0 * std::f64::consts::SQRT_2;
        let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

        let b0 = a * ((a + 1.0) - (a - 1.0) * cos_omega + two_sqrt_a_alpha);
        let b1 = 2.0 * a * ((a - 1.0) - (a + 1.0) * cos_omega);
        let b2 = a * ((a + 1.0) - (a - 1.0) * cos_omega - two_sqrt_a_alpha);
        let a0 = (a + 1.0) + (a - 1.0) * cos_omega + two_sqrt_a_alpha;
        let a1 = -2.0 * ((a - 1.0) + (a + 1.0) * cos_omega);
        let a2 = (a + 1.0) + (a - 1.0) * cos_omega - two_sqrt_a_alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// High-shelf filter coefficients
    pub fn high_shelf(freq: f64, gain_db: f64, sample_rate: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / 2.0 * std::f64::consts::SQRT_2;
        let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

        let b0 = a * ((a + 1.0) + (a - 1.0) * cos_omega + two_sqrt_a_alpha);
        let b1 = -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_omega);
        let b2 = a * ((a + 1.0) + (a - 1.0) * cos_omega - two_sqrt_a_alpha);
        let a0 = (a + 1.0) - (a - 1.0) * cos_omega + two_sqrt_a_alpha;
        let a1 = 2.0 * ((a - 1.0) - (a + 1.0) * cos_omega);
        let a2 = (a + 1.0) - (a - 1.0) * cos_omega - two_sqrt_a_alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// Tone-balance setting for one pipe: a spectral tilt in [-1, +1].
///
/// Negative values darken (cut highs), positive values brighten. 0 is
/// neutral and bypasses the filter entirely.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneBalance {
    pub value: f64,
}

impl ToneBalance {
    /// Maximum shelf gain at full tilt (dB)
    const RANGE_DB: f64 = 12.0;
    /// Shelf corner frequency (Hz)
    const PIVOT_HZ: f64 = 2000.0;

    pub const NEUTRAL: Self = Self { value: 0.0 };

    pub fn new(value: f64) -> Self {
        Self {
            value: value.clamp(-1.0, 1.0),
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.value == 0.0
    }

    /// Shelf coefficients for this tilt, or None when neutral.
    pub fn filter(&self, sample_rate: f64) -> Option<BiquadCoeffs> {
        if self.is_neutral() {
            return None;
        }
        let gain_db = self.value * Self::RANGE_DB;
        Some(BiquadCoeffs::high_shelf(Self::PIVOT_HZ, gain_db, sample_rate))
    }
}

/// One TDF-II biquad section
#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    z1: f64,
    z2: f64,
}

impl BiquadState {
    #[inline]
    fn tick(&mut self, coeffs: &BiquadCoeffs, x: Sample) -> Sample {
        let y = coeffs.b0 * x + self.z1;
        self.z1 = coeffs.b1 * x - coeffs.a1 * y + self.z2;
        self.z2 = coeffs.b2 * x - coeffs.a2 * y;
        y
    }
}

/// Per-voice stereo tone-balance filter state
#[derive(Debug, Clone, Default)]
pub struct ToneFilter {
    coeffs: Option<BiquadCoeffs>,
    left: BiquadState,
    right: BiquadState,
}

impl ToneFilter {
    /// Arm the filter for a voice; clears any previous state.
    pub fn init(&mut self, coeffs: Option<BiquadCoeffs>) {
        self.coeffs = coeffs;
        self.left = BiquadState::default();
        self.right = BiquadState::default();
    }

    pub fn is_to_apply(&self) -> bool {
        self.coeffs.is_some()
    }

    /// Filter `n_frames` of interleaved stereo in place.
    pub fn process_buffer(&mut self, n_frames: usize, buffer: &mut [Sample]) {
        let Some(coeffs) = self.coeffs else {
            return;
        };
        for frame in 0..n_frames {
            buffer[frame * 2] = self.left.tick(&coeffs, buffer[frame * 2]);
            buffer[frame * 2 + 1] = self.right.tick(&coeffs, buffer[frame * 2 + 1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neutral_tone_balance_bypasses() {
        assert!(ToneBalance::NEUTRAL.filter(44100.0).is_none());

        let mut filter = ToneFilter::default();
        filter.init(None);
        assert!(!filter.is_to_apply());

        let mut buf = vec![0.5; 16];
        filter.process_buffer(8, &mut buf);
        assert!(buf.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_tilt_changes_signal() {
        let mut filter = ToneFilter::default();
        filter.init(ToneBalance::new(1.0).filter(44100.0));
        assert!(filter.is_to_apply());

        let mut buf = vec![0.5; 64];
        filter.process_buffer(32, &mut buf);
        assert!(buf.iter().any(|&s| (s - 0.5).abs() > 1e-6));
    }

    #[test]
    fn test_shelf_dc_gain() {
        // A high shelf leaves DC roughly unchanged.
        let coeffs = BiquadCoeffs::high_shelf(2000.0, 12.0, 44100.0);
        let mut state = BiquadState::default();
        let mut last = 0.0;
        for _ in 0..4000 {
            last = state.tick(&coeffs, 1.0);
        }
        assert!((last - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_tone_balance_clamps() {
        assert_eq!(ToneBalance::new(3.0).value, 1.0);
        assert_eq!(ToneBalance::new(-2.0).value, -1.0);
    }
}
