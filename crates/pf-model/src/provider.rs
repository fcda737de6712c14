//! Sound providers: the per-pipe audio sources
//!
//! A provider owns one or more decoded attack and release sections plus
//! tuning and voicing metadata. The engine never decodes audio itself; a
//! section hands out its interleaved samples ready to stream.

use std::sync::Arc;

use pf_core::Sample;
use pf_dsp::ToneBalance;

/// Which wave-tremulant setting a section was recorded with.
///
/// A release must match the attack it follows: a pipe sampled with the
/// tremulant running decays differently from one sampled without.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaveTremulantState {
    /// Section is valid for either setting
    #[default]
    Any,
    Off,
    On,
}

impl WaveTremulantState {
    pub fn matches(&self, other: WaveTremulantState) -> bool {
        matches!(self, WaveTremulantState::Any)
            || matches!(other, WaveTremulantState::Any)
            || *self == other
    }
}

/// Loop region of a sustained section (frame indices, end exclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionLoop {
    pub start: usize,
    pub end: usize,
}

/// One decoded attack or release region of a provider
#[derive(Debug, Clone)]
pub struct AudioSection {
    data: Arc<[Sample]>,
    channels: usize,
    sample_rate: u32,
    norm_gain: Sample,
    release_crossfade_ms: u32,
    supports_alignment: bool,
    wave_tremulant_state: WaveTremulantState,
    loop_region: Option<SectionLoop>,
}

impl AudioSection {
    /// Wrap interleaved decoded samples. `channels` must be 1 or 2.
    pub fn new(data: Vec<Sample>, channels: usize, sample_rate: u32) -> Self {
        assert!(channels == 1 || channels == 2);
        Self {
            data: data.into(),
            channels,
            sample_rate,
            norm_gain: 1.0,
            release_crossfade_ms: 0,
            supports_alignment: true,
            wave_tremulant_state: WaveTremulantState::Any,
            loop_region: None,
        }
    }

    pub fn with_norm_gain(mut self, norm_gain: Sample) -> Self {
        self.norm_gain = norm_gain;
        self
    }

    pub fn with_release_crossfade_ms(mut self, ms: u32) -> Self {
        self.release_crossfade_ms = ms;
        self
    }

    pub fn with_loop(mut self, start: usize, end: usize) -> Self {
        assert!(start < end && end <= self.length());
        self.loop_region = Some(SectionLoop { start, end });
        self
    }

    pub fn with_wave_tremulant_state(mut self, state: WaveTremulantState) -> Self {
        self.wave_tremulant_state = state;
        self
    }

    pub fn with_alignment_support(mut self, supported: bool) -> Self {
        self.supports_alignment = supported;
        self
    }

    pub fn data(&self) -> &[Sample] {
        &self.data
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Section length in frames.
    pub fn length(&self) -> usize {
        self.data.len() / self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn norm_gain(&self) -> Sample {
        self.norm_gain
    }

    pub fn release_crossfade_ms(&self) -> u32 {
        self.release_crossfade_ms
    }

    pub fn supports_stream_alignment(&self) -> bool {
        self.supports_alignment
    }

    pub fn wave_tremulant_state_for(&self) -> WaveTremulantState {
        self.wave_tremulant_state
    }

    pub fn loop_region(&self) -> Option<SectionLoop> {
        self.loop_region
    }
}

/// Audio source of one pipe (or one tremulant wave)
pub trait SoundProvider: Send + Sync {
    /// Linear playback gain (includes voicing amplitude)
    fn gain(&self) -> Sample;

    /// Effective source rate in Hz: the section sample rate with the
    /// pipe's pitch correction applied. The stream advances
    /// `tuning / session_rate` source frames per output frame.
    fn tuning(&self) -> Sample;

    /// MIDI key of the pipe; 0 when unknown
    fn midi_key_number(&self) -> u32;

    /// Volume factor for a key velocity (0-127)
    fn velocity_volume(&self, velocity: u8) -> Sample;

    /// Attack section for the velocity and the interval since the
    /// previous event on this pipe
    fn attack(&self, velocity: u8, event_interval_ms: u32) -> Option<Arc<AudioSection>>;

    /// Release section matching a wave-tremulant state
    fn release(
        &self,
        wave_tremulant: WaveTremulantState,
        event_interval_ms: u32,
    ) -> Option<Arc<AudioSection>>;

    /// Crossfade length for attack-switch transitions (ms)
    fn attack_switch_crossfade_ms(&self) -> u32;

    /// Maximum release length (ms); 0 = play the full release
    fn release_tail_ms(&self) -> u32;

    fn tone_balance(&self) -> ToneBalance;
}

/// Stable identity of a provider, used as the weak-ID on voice handles.
pub fn provider_tag(provider: &Arc<dyn SoundProvider>) -> usize {
    Arc::as_ptr(provider) as *const () as usize
}

/// In-memory provider over pre-decoded sections.
///
/// Serves the organ-model loader's output as well as the engine tests.
pub struct MemorySoundProvider {
    gain: Sample,
    tuning: Sample,
    midi_key: u32,
    velocity_sensitive: bool,
    attack_sections: Vec<Arc<AudioSection>>,
    release_sections: Vec<Arc<AudioSection>>,
    attack_switch_crossfade_ms: u32,
    release_tail_ms: u32,
    tone_balance: ToneBalance,
}

impl MemorySoundProvider {
    pub fn new(tuning: Sample) -> Self {
        Self {
            gain: 1.0,
            tuning,
            midi_key: 0,
            velocity_sensitive: false,
            attack_sections: Vec::new(),
            release_sections: Vec::new(),
            attack_switch_crossfade_ms: 10,
            release_tail_ms: 0,
            tone_balance: ToneBalance::NEUTRAL,
        }
    }

    pub fn with_gain(mut self, gain: Sample) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_midi_key(mut self, key: u32) -> Self {
        self.midi_key = key;
        self
    }

    pub fn with_velocity_sensitivity(mut self, sensitive: bool) -> Self {
        self.velocity_sensitive = sensitive;
        self
    }

    pub fn with_attack(mut self, section: AudioSection) -> Self {
        self.attack_sections.push(Arc::new(section));
        self
    }

    pub fn with_release(mut self, section: AudioSection) -> Self {
        self.release_sections.push(Arc::new(section));
        self
    }

    pub fn with_attack_switch_crossfade_ms(mut self, ms: u32) -> Self {
        self.attack_switch_crossfade_ms = ms;
        self
    }

    pub fn with_release_tail_ms(mut self, ms: u32) -> Self {
        self.release_tail_ms = ms;
        self
    }

    pub fn with_tone_balance(mut self, balance: ToneBalance) -> Self {
        self.tone_balance = balance;
        self
    }
}

impl SoundProvider for MemorySoundProvider {
    fn gain(&self) -> Sample {
        self.gain
    }

    fn tuning(&self) -> Sample {
        self.tuning
    }

    fn midi_key_number(&self) -> u32 {
        self.midi_key
    }

    fn velocity_volume(&self, velocity: u8) -> Sample {
        if self.velocity_sensitive {
            velocity.min(127) as Sample / 127.0
        } else {
            1.0
        }
    }

    fn attack(&self, _velocity: u8, _event_interval_ms: u32) -> Option<Arc<AudioSection>> {
        self.attack_sections.first().cloned()
    }

    fn release(
        &self,
        wave_tremulant: WaveTremulantState,
        _event_interval_ms: u32,
    ) -> Option<Arc<AudioSection>> {
        self.release_sections
            .iter()
            .find(|s| s.wave_tremulant_state_for().matches(wave_tremulant))
            .or_else(|| self.release_sections.first())
            .cloned()
    }

    fn attack_switch_crossfade_ms(&self) -> u32 {
        self.attack_switch_crossfade_ms
    }

    fn release_tail_ms(&self) -> u32 {
        self.release_tail_ms
    }

    fn tone_balance(&self) -> ToneBalance {
        self.tone_balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_section(value: Sample, frames: usize) -> AudioSection {
        AudioSection::new(vec![value; frames * 2], 2, 44100)
    }

    #[test]
    fn test_section_length_and_channels() {
        let section = constant_section(0.5, 256);
        assert_eq!(section.length(), 256);
        assert_eq!(section.channels(), 2);
        assert_eq!(section.norm_gain(), 1.0);
    }

    #[test]
    fn test_wave_tremulant_matching() {
        assert!(WaveTremulantState::Any.matches(WaveTremulantState::On));
        assert!(WaveTremulantState::On.matches(WaveTremulantState::Any));
        assert!(WaveTremulantState::On.matches(WaveTremulantState::On));
        assert!(!WaveTremulantState::On.matches(WaveTremulantState::Off));
    }

    #[test]
    fn test_release_selection_by_tremulant_state() {
        let provider = MemorySoundProvider::new(44100.0)
            .with_release(
                constant_section(0.1, 64).with_wave_tremulant_state(WaveTremulantState::Off),
            )
            .with_release(
                constant_section(0.2, 64).with_wave_tremulant_state(WaveTremulantState::On),
            );

        let with_trem = provider.release(WaveTremulantState::On, 0).unwrap();
        assert_eq!(with_trem.data()[0], 0.2);

        let without = provider.release(WaveTremulantState::Off, 0).unwrap();
        assert_eq!(without.data()[0], 0.1);
    }

    #[test]
    fn test_provider_tag_identity() {
        let a: Arc<dyn SoundProvider> = Arc::new(MemorySoundProvider::new(44100.0));
        let b: Arc<dyn SoundProvider> = Arc::new(MemorySoundProvider::new(44100.0));
        assert_eq!(provider_tag(&a), provider_tag(&a.clone()));
        assert_ne!(provider_tag(&a), provider_tag(&b));
    }

    #[test]
    fn test_velocity_volume() {
        let flat = MemorySoundProvider::new(44100.0);
        assert_eq!(flat.velocity_volume(1), 1.0);

        let sensitive = MemorySoundProvider::new(44100.0).with_velocity_sensitivity(true);
        assert!((sensitive.velocity_volume(127) - 1.0).abs() < 1e-12);
        assert!(sensitive.velocity_volume(64) < 1.0);
    }
}
