//! Fractional-rate sample interpolation
//!
//! Two qualities, selected per session:
//! - Linear: two-point interpolation, exact on constant signals
//! - Polyphase: 8-tap windowed-sinc with 64 precomputed sub-phases

use once_cell::sync::Lazy;
use pf_core::{InterpolationType, Sample};

/// Taps per polyphase sub-filter
pub const POLYPHASE_TAPS: usize = 8;
/// Number of precomputed fractional phases
pub const POLYPHASE_PHASES: usize = 64;
/// Frames of history an aligned stream must preserve
pub const BLOCK_HISTORY: usize = POLYPHASE_TAPS / 2;

/// Precomputed windowed-sinc bank, `SINC_TABLE[phase][tap]`.
///
/// Each row is normalized to unity DC gain so a constant input stays
/// constant through resampling.
static SINC_TABLE: Lazy<Vec<[Sample; POLYPHASE_TAPS]>> = Lazy::new(|| {
    let mut table = Vec::with_capacity(POLYPHASE_PHASES);

    for phase in 0..POLYPHASE_PHASES {
        let frac = phase as Sample / POLYPHASE_PHASES as Sample;
        let mut row = [0.0; POLYPHASE_TAPS];
        let mut sum = 0.0;

        for (tap, coeff) in row.iter_mut().enumerate() {
            // Offset of this tap from the interpolation point.
            let t = tap as Sample - (POLYPHASE_TAPS as Sample / 2.0 - 1.0) - frac;
            let sinc = if t.abs() < 1e-12 {
                1.0
            } else {
                let x = std::f64::consts::PI * t;
                x.sin() / x
            };
            // Blackman window over the tap span.
            let w = {
                let n = (t + POLYPHASE_TAPS as Sample / 2.0) / POLYPHASE_TAPS as Sample;
                let n = n.clamp(0.0, 1.0);
                0.42 - 0.5 * (2.0 * std::f64::consts::PI * n).cos()
                    + 0.08 * (4.0 * std::f64::consts::PI * n).cos()
            };
            *coeff = sinc * w;
            sum += *coeff;
        }
        if sum.abs() > 1e-12 {
            for coeff in &mut row {
                *coeff /= sum;
            }
        }
        table.push(row);
    }
    table
});

#[inline]
fn frame(data: &[Sample], channels: usize, index: usize) -> (Sample, Sample) {
    let n_frames = data.len() / channels;
    if index >= n_frames {
        return (0.0, 0.0);
    }
    if channels == 1 {
        let s = data[index];
        (s, s)
    } else {
        (data[index * channels], data[index * channels + 1])
    }
}

/// Two-point linear interpolation at `index + frac`.
#[inline]
pub fn interpolate_linear(
    data: &[Sample],
    channels: usize,
    index: usize,
    frac: Sample,
) -> (Sample, Sample) {
    let (l0, r0) = frame(data, channels, index);
    let (l1, r1) = frame(data, channels, index + 1);
    (l0 + (l1 - l0) * frac, r0 + (r1 - r0) * frac)
}

/// Windowed-sinc interpolation at `index + frac`.
///
/// Taps outside the section read as 0 (the section head/tail fades are
/// already part of the decoded data).
#[inline]
pub fn interpolate_polyphase(
    data: &[Sample],
    channels: usize,
    index: usize,
    frac: Sample,
) -> (Sample, Sample) {
    let phase = ((frac * POLYPHASE_PHASES as Sample) as usize).min(POLYPHASE_PHASES - 1);
    let row = &SINC_TABLE[phase];
    let center = POLYPHASE_TAPS / 2 - 1;

    let mut left = 0.0;
    let mut right = 0.0;
    for (tap, &coeff) in row.iter().enumerate() {
        let at = index + tap;
        if at < center {
            continue;
        }
        let (l, r) = frame(data, channels, at - center);
        left += l * coeff;
        right += r * coeff;
    }
    (left, right)
}

/// Interpolate one output frame with the configured quality.
#[inline]
pub fn interpolate(
    interpolation: InterpolationType,
    data: &[Sample],
    channels: usize,
    index: usize,
    frac: Sample,
) -> (Sample, Sample) {
    match interpolation {
        InterpolationType::Linear => interpolate_linear(data, channels, index, frac),
        InterpolationType::Polyphase => interpolate_polyphase(data, channels, index, frac),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_exact_on_grid() {
        let data = [0.0, 0.0, 1.0, -1.0, 0.5, 0.25];
        assert_eq!(interpolate_linear(&data, 2, 1, 0.0), (1.0, -1.0));
    }

    #[test]
    fn test_linear_midpoint() {
        let data = [0.0, 0.0, 1.0, 1.0];
        let (l, r) = interpolate_linear(&data, 2, 0, 0.5);
        assert!((l - 0.5).abs() < 1e-12);
        assert!((r - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_linear_mono_duplicates() {
        let data = [0.25, 0.75];
        let (l, r) = interpolate_linear(&data, 1, 0, 0.5);
        assert_eq!(l, r);
        assert!((l - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_linear_past_end_reads_silence() {
        let data = [1.0, 1.0];
        let (l, _) = interpolate_linear(&data, 2, 0, 0.5);
        assert!((l - 0.5).abs() < 1e-12); // second point is silence
    }

    #[test]
    fn test_polyphase_preserves_dc() {
        let data = vec![0.5; 64];
        let (l, r) = interpolate_polyphase(&data, 1, 16, 0.37);
        assert!((l - 0.5).abs() < 1e-9);
        assert!((r - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_polyphase_zero_phase_near_identity() {
        let mut data = vec![0.0; 32];
        data[16] = 1.0;
        let (l, _) = interpolate_polyphase(&data, 1, 16, 0.0);
        assert!((l - 1.0).abs() < 0.05);
    }
}
