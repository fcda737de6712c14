//! Voice state: the sampler and its shared control handle
//!
//! A `Sampler` is owned by exactly one place at a time: the pool's free
//! list, a task's pending-adds queue, or a task's active list. The organ
//! model keeps only a `SamplerHandle` (the voice's `VoiceControl`), whose
//! fields are atomics so stop/switch/velocity requests can land while the
//! audio threads are processing the voice.
//!
//! Handles survive pool reuse: a reused slot publishes its new provider
//! tag into the same control, so a stale handle's provider check fails
//! exactly like the original's pointer-identity test.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use pf_core::{AtomicF64, Sample};
use pf_dsp::{Fader, ToneFilter};
use pf_model::{provider_tag, SoundProvider, WaveTremulantState};

use crate::stream::SamplerStream;

/// Task ID of the detached-release windchest
pub const DETACHED_RELEASE_TASK_ID: i32 = 0;

/// `id > 0`: windchest index; `id = 0`: detached windchest; `id < 0`:
/// tremulant index `-id - 1`.
#[inline]
pub fn is_windchest_task(task_id: i32) -> bool {
    task_id >= 0
}

#[inline]
pub fn windchest_task_index(task_id: i32) -> usize {
    task_id as usize
}

#[inline]
pub fn tremulant_task_index(task_id: i32) -> usize {
    (-task_id - 1) as usize
}

/// Cross-thread face of one voice.
///
/// The control thread writes scheduling requests here; the task owning the
/// voice reads them at the top of each period. One writer per field, plain
/// relaxed loads elsewhere; staleness of at most one period is by contract.
#[derive(Debug)]
pub struct VoiceControl {
    /// Identity of the provider this slot currently plays (0 = dead slot)
    provider_tag: AtomicUsize,
    /// Absolute sample time the voice must start releasing (0 = none)
    stop_time: AtomicU64,
    /// Absolute sample time of a requested attack switch (0 = none)
    new_attack_time: AtomicU64,
    /// Start delay of the voice, re-applied to stop/switch requests
    delay_samples: AtomicU64,
    velocity: AtomicU32,
    velocity_volume: AtomicF64,
}

impl Default for VoiceControl {
    fn default() -> Self {
        Self {
            provider_tag: AtomicUsize::new(0),
            stop_time: AtomicU64::new(0),
            new_attack_time: AtomicU64::new(0),
            delay_samples: AtomicU64::new(0),
            velocity: AtomicU32::new(0),
            velocity_volume: AtomicF64::new(1.0),
        }
    }
}

impl VoiceControl {
    /// Arm the control for a newly started voice.
    pub fn publish(&self, tag: usize, delay_samples: u64, velocity: u8, velocity_volume: Sample) {
        self.stop_time.store(0, Ordering::Relaxed);
        self.new_attack_time.store(0, Ordering::Relaxed);
        self.delay_samples.store(delay_samples, Ordering::Relaxed);
        self.velocity.store(velocity as u32, Ordering::Relaxed);
        self.velocity_volume.store(velocity_volume);
        // Tag last: a concurrent stop_sample on a stale handle must not
        // observe the new tag with old request fields.
        self.provider_tag.store(tag, Ordering::Release);
    }

    /// Kill the control when the voice returns to the pool.
    pub fn clear(&self) {
        self.provider_tag.store(0, Ordering::Release);
        self.stop_time.store(0, Ordering::Relaxed);
        self.new_attack_time.store(0, Ordering::Relaxed);
    }

    pub fn is_for(&self, provider: &Arc<dyn SoundProvider>) -> bool {
        let tag = self.provider_tag.load(Ordering::Acquire);
        tag != 0 && tag == provider_tag(provider)
    }

    pub fn delay_samples(&self) -> u64 {
        self.delay_samples.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self, at: u64) {
        self.stop_time.store(at, Ordering::Relaxed);
    }

    pub fn request_new_attack(&self, at: u64) {
        self.new_attack_time.store(at, Ordering::Relaxed);
    }

    pub fn stop_time(&self) -> u64 {
        self.stop_time.load(Ordering::Relaxed)
    }

    pub fn new_attack_time(&self) -> u64 {
        self.new_attack_time.load(Ordering::Relaxed)
    }

    pub fn take_stop_time(&self) -> u64 {
        self.stop_time.swap(0, Ordering::Relaxed)
    }

    pub fn take_new_attack_time(&self) -> u64 {
        self.new_attack_time.swap(0, Ordering::Relaxed)
    }

    pub fn set_velocity(&self, velocity: u8, velocity_volume: Sample) {
        self.velocity.store(velocity as u32, Ordering::Relaxed);
        self.velocity_volume.store(velocity_volume);
    }

    pub fn velocity(&self) -> u8 {
        self.velocity.load(Ordering::Relaxed) as u8
    }

    pub fn velocity_volume(&self) -> Sample {
        self.velocity_volume.load()
    }
}

/// Stable handle the organ model keeps per sounding pipe
pub type SamplerHandle = Arc<VoiceControl>;

/// One voice slot: streaming position, envelopes, and routing
pub struct Sampler {
    pub control: SamplerHandle,
    pub provider: Option<Arc<dyn SoundProvider>>,
    pub stream: SamplerStream,
    pub fader: Fader,
    pub tone_filter: ToneFilter,
    pub velocity: u8,
    pub delay_samples: u64,
    /// Absolute sample time the voice becomes audible
    pub start_time: u64,
    pub is_release: bool,
    /// Periods the release machinery failed to service this voice
    pub drop_counter: u8,
    pub task_id: i32,
    pub audio_group_id: usize,
    pub wave_tremulant_state: WaveTremulantState,
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            control: Arc::new(VoiceControl::default()),
            provider: None,
            stream: SamplerStream::default(),
            fader: Fader::default(),
            tone_filter: ToneFilter::default(),
            velocity: 0,
            delay_samples: 0,
            start_time: 0,
            is_release: false,
            drop_counter: 0,
            task_id: DETACHED_RELEASE_TASK_ID,
            audio_group_id: 0,
            wave_tremulant_state: WaveTremulantState::Any,
        }
    }

    /// Reset everything except the control handle (which stays shared with
    /// whoever still holds the old handle).
    pub fn reset(&mut self) {
        self.provider = None;
        self.stream = SamplerStream::default();
        self.fader.reset();
        self.tone_filter.init(None);
        self.velocity = 0;
        self.delay_samples = 0;
        self.start_time = 0;
        self.is_release = false;
        self.drop_counter = 0;
        self.task_id = DETACHED_RELEASE_TASK_ID;
        self.audio_group_id = 0;
        self.wave_tremulant_state = WaveTremulantState::Any;
    }

    /// Duplicate the playing state into `target` (attack-switch decay
    /// copy). The target keeps its own control handle.
    pub fn copy_playing_state_to(&self, target: &mut Sampler) {
        target.provider = self.provider.clone();
        target.stream = self.stream.clone();
        target.fader = self.fader.clone();
        target.tone_filter = self.tone_filter.clone();
        target.velocity = self.velocity;
        target.delay_samples = self.delay_samples;
        target.start_time = self.start_time;
        target.is_release = self.is_release;
        target.drop_counter = 0;
        target.task_id = self.task_id;
        target.audio_group_id = self.audio_group_id;
        target.wave_tremulant_state = self.wave_tremulant_state;
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_model::MemorySoundProvider;

    #[test]
    fn test_task_id_encoding() {
        assert!(is_windchest_task(DETACHED_RELEASE_TASK_ID));
        assert!(is_windchest_task(3));
        assert!(!is_windchest_task(-1));
        assert_eq!(windchest_task_index(3), 3);
        assert_eq!(tremulant_task_index(-1), 0);
        assert_eq!(tremulant_task_index(-4), 3);
    }

    #[test]
    fn test_control_identity_after_clear() {
        let provider: Arc<dyn SoundProvider> = Arc::new(MemorySoundProvider::new(44100.0));
        let control = VoiceControl::default();
        assert!(!control.is_for(&provider));

        control.publish(provider_tag(&provider), 0, 64, 1.0);
        assert!(control.is_for(&provider));

        control.clear();
        assert!(!control.is_for(&provider));
    }

    #[test]
    fn test_take_stop_time_consumes() {
        let control = VoiceControl::default();
        control.request_stop(42);
        assert_eq!(control.stop_time(), 42);
        assert_eq!(control.take_stop_time(), 42);
        assert_eq!(control.stop_time(), 0);
    }

    #[test]
    fn test_sampler_reset_keeps_control() {
        let mut sampler = Sampler::new();
        let handle = sampler.control.clone();
        sampler.task_id = 5;
        sampler.reset();
        assert_eq!(sampler.task_id, DETACHED_RELEASE_TASK_ID);
        assert!(Arc::ptr_eq(&handle, &sampler.control));
    }
}
