//! Sample types and atomic helpers

use std::sync::atomic::{AtomicU64, Ordering};

/// Type alias for audio samples (always f64 for maximum precision)
pub type Sample = f64;

/// Stereo sample pair
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    #[inline]
    pub const fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    #[inline]
    pub const fn mono(value: Sample) -> Self {
        Self {
            left: value,
            right: value,
        }
    }
}

/// Lock-free f64 cell (bit-cast through an `AtomicU64`)
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Store `value` if it exceeds the current value.
    ///
    /// Not atomic as a read-modify-write; adequate for meter peaks where a
    /// lost update only delays the peak by one period.
    #[inline]
    pub fn store_max(&self, value: f64) {
        if value > self.load() {
            self.store(value);
        }
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Decibel value wrapper
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Decibels(pub f64);

impl Decibels {
    pub const ZERO: Self = Self(0.0);

    #[inline]
    pub fn from_gain(gain: f64) -> Self {
        if gain <= 0.0 {
            Self(f64::NEG_INFINITY)
        } else {
            Self(20.0 * gain.log10())
        }
    }

    #[inline]
    pub fn to_gain(self) -> f64 {
        if self.0 <= -144.0 {
            0.0
        } else {
            10.0_f64.powf(self.0 / 20.0)
        }
    }
}

impl Default for Decibels {
    fn default() -> Self {
        Self::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decibel_round_trip() {
        let db = Decibels(-6.0);
        let gain = db.to_gain();
        assert!((gain - 0.501187).abs() < 1e-5);
        assert!((Decibels::from_gain(gain).0 - -6.0).abs() < 1e-9);
    }

    #[test]
    fn test_decibel_silence() {
        assert_eq!(Decibels(-144.0).to_gain(), 0.0);
        assert_eq!(Decibels::from_gain(0.0).to_gain(), 0.0);
    }

    #[test]
    fn test_atomic_f64() {
        let a = AtomicF64::new(0.25);
        assert_eq!(a.load(), 0.25);
        a.store(1.5);
        assert_eq!(a.load(), 1.5);
        a.store_max(0.5);
        assert_eq!(a.load(), 1.5);
        a.store_max(2.0);
        assert_eq!(a.load(), 2.0);
    }
}
