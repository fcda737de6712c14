//! The organ sound engine
//!
//! Lifecycle (steps 2-3 repeat for a restart with new parameters):
//!
//! 1. `OrganEngine::new(organ_model, sample_store)` + configuration
//!    setters (or `set_from_config`)
//! 2. `build_and_start(layouts, n_samples_per_buffer, sample_rate,
//!    recorder)` — builds the task graph, spawns workers, starts serving
//!    `get_audio_output`
//! 3. `stop_and_destroy()` — drains the workers and tears the graph down
//!
//! The engine object is shared (`Arc`) between the control thread and the
//! audio callbacks; everything the per-period code touches lives in an
//! `EngineCore` the tasks reference directly, so no task ever points back
//! at the engine.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use pf_core::{AudioOutputLayout, InterpolationType, ReverbConfig, Sample, SoundConfig,
    MAX_FRAME_SIZE};
use pf_model::{provider_tag, OrganModel, RecorderSink, SampleStore, SoundProvider,
    WaveTremulantState};

use crate::pool::SamplerPool;
use crate::scheduler::Scheduler;
use crate::tasks::{GroupTask, OutputTask, RecorderTask, ReleaseTask, SoundTask, TouchTask,
    TremulantTask, WindchestTask};
use crate::thread::SoundWorker;
use crate::voice::{is_windchest_task, tremulant_task_index, windchest_task_index, Sampler,
    SamplerHandle, DETACHED_RELEASE_TASK_ID};

/// Release-voice age before the soft limit may accelerate its decay
pub const RELEASE_AGE_SAMPLES: u64 = 172 * 16;
/// Accelerated decay length under polyphony pressure (ms)
const LIMIT_DECAY_MS: u32 = 370;
/// Minimum windchest level considered audible when spawning a release
const MIN_AUDIBLE_LEVEL: f64 = 1e-10;

/// What a task does with a voice after processing it for a period
pub enum VoiceDisposition {
    Keep,
    HandToRelease,
    ReturnToPool,
}

/// Engine lifecycle: monotone through BUILT -> WORKING -> USED on
/// start/attach, reverse on detach/stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
pub enum Lifecycle {
    Idle = 0,
    Built = 1,
    Working = 2,
    Used = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Lifecycle::Built,
            2 => Lifecycle::Working,
            3 => Lifecycle::Used,
            _ => Lifecycle::Idle,
        }
    }
}

/// Shared per-session state the task graph runs against
pub struct EngineCore {
    sample_rate: u32,
    n_samples_per_buffer: usize,
    interpolation: InterpolationType,
    is_polyphony_limiting: bool,
    polyphony_soft_limit: usize,
    is_scaled_releases: bool,
    is_release_alignment: bool,
    is_randomize_speaking: bool,
    /// Period-sample clock; written only by the last callback of a period
    current_time: AtomicU64,
    pool: SamplerPool,
    used_polyphony_peak: AtomicUsize,
    rng: Mutex<ChaCha8Rng>,
    release_tx: Sender<Sampler>,
    group_tx: Vec<Sender<Sampler>>,
    tremulant_tx: Vec<Sender<Sampler>>,
    /// Per windchest-task-ID volume applied to detached release gains
    /// (base x master amplitude; index 0 is the detached chest itself)
    windchest_release_volumes: Vec<Sample>,
}

impl EngineCore {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn n_samples_per_buffer(&self) -> usize {
        self.n_samples_per_buffer
    }

    pub fn time(&self) -> u64 {
        self.current_time.load(Ordering::Relaxed)
    }

    pub fn pool(&self) -> &SamplerPool {
        &self.pool
    }

    pub fn ms_to_samples(&self, ms: u32) -> usize {
        (self.sample_rate as u64 * ms as u64 / 1000) as usize
    }

    pub fn samples_diff_to_ms(&self, from_samples: u64, to_samples: u64) -> u32 {
        let diff = to_samples.saturating_sub(from_samples);
        (diff * 1000 / self.sample_rate as u64).min(u32::MAX as u64) as u32
    }

    /// Pitch jitter for a new voice, uniform in +/-(2^(1/1200) - 1).
    fn random_factor(&self) -> Sample {
        if !self.is_randomize_speaking {
            return 1.0;
        }
        let spread = 2.0_f64.powf(1.0 / 1200.0) - 1.0;
        1.0 + self.rng.lock().random_range(-1.0..1.0) * spread
    }

    /// Route a voice onto the task its `task_id` names.
    fn pass_voice(&self, voice: Sampler) {
        if is_windchest_task(voice.task_id) {
            let group = voice.audio_group_id.min(self.group_tx.len() - 1);
            let _ = self.group_tx[group].send(voice);
        } else {
            let index = tremulant_task_index(voice.task_id);
            if index < self.tremulant_tx.len() {
                let _ = self.tremulant_tx[index].send(voice);
            } else {
                self.pool.release(voice);
            }
        }
    }

    fn start_voice(&self, voice: Sampler) {
        self.pass_voice(voice);
    }

    pub fn return_sampler(&self, voice: Sampler) {
        self.pool.release(voice);
    }

    pub fn hand_to_release(&self, voice: Sampler) {
        let _ = self.release_tx.send(voice);
    }

    /// Process one voice for the period, accumulating into `out`.
    ///
    /// `scratch` is the caller's block-sized work buffer; `volume` is the
    /// owning windchest's period volume (1 for tremulant voices).
    pub fn process_voice(
        &self,
        out: &mut [Sample],
        scratch: &mut [Sample],
        voice: &mut Sampler,
        volume: Sample,
    ) -> VoiceDisposition {
        let n_frames = self.n_samples_per_buffer;
        let now = self.time();

        // Pull the control thread's latest requests into the voice.
        voice.velocity = voice.control.velocity();
        voice.fader.set_velocity_volume(voice.control.velocity_volume());

        let due = voice.start_time <= now;
        if due {
            if voice.is_release
                && ((self.is_polyphony_limiting
                    && self.pool.used_count() >= self.polyphony_soft_limit
                    && now - voice.start_time > RELEASE_AGE_SAMPLES)
                    || voice.drop_counter > 1)
            {
                voice
                    .fader
                    .start_decreasing_volume(self.ms_to_samples(LIMIT_DECAY_MS));
            }

            let block = &mut scratch[..n_frames * 2];
            if !voice.stream.read_block(block, n_frames) {
                voice.provider = None;
            }
            voice.fader.process(n_frames, block, volume);
            if voice.tone_filter.is_to_apply() {
                voice.tone_filter.process_buffer(n_frames, block);
            }
            for (out_sample, block_sample) in out[..n_frames * 2].iter_mut().zip(block.iter()) {
                *out_sample += *block_sample;
            }

            let stop = voice.control.stop_time();
            let new_attack = voice.control.new_attack_time();
            if (stop != 0 && stop <= now) || (new_attack != 0 && new_attack <= now) {
                return VoiceDisposition::HandToRelease;
            }
        }

        if voice.provider.is_none() || (due && voice.fader.is_silent()) {
            VoiceDisposition::ReturnToPool
        } else {
            VoiceDisposition::Keep
        }
    }

    /// Service one voice pulled off the release queue, then put it back
    /// on its task.
    pub fn process_release(&self, mut voice: Sampler) {
        let stop = voice.control.take_stop_time();
        let new_attack = voice.control.take_new_attack_time();

        if stop != 0 {
            self.create_release_sampler(&mut voice);
        } else if new_attack != 0 {
            self.switch_to_another_attack(&mut voice);
        }
        self.pass_voice(voice);
    }

    /// Spawn the voice that plays `provider`'s release while `voice`
    /// itself crossfades out.
    fn create_release_sampler(&self, voice: &mut Sampler) {
        let Some(provider) = voice.provider.clone() else {
            return;
        };
        let now = self.time();
        let held_ms = self.samples_diff_to_ms(voice.start_time, now);
        let release_section = provider.release(voice.wave_tremulant_state, held_ms);

        let crossfade = self.ms_to_samples(match &release_section {
            Some(section) => section.release_crossfade_ms(),
            None => provider.attack_switch_crossfade_ms(),
        });
        voice.fader.start_decreasing_volume(crossfade);
        voice.is_release = true;

        let not_a_tremulant = is_windchest_task(voice.task_id);
        let windchest_volume = if not_a_tremulant {
            self.windchest_release_volumes[windchest_task_index(voice.task_id)
                .min(self.windchest_release_volumes.len() - 1)]
        } else {
            1.0
        };

        let Some(release_section) = release_section else {
            return;
        };
        // Minimum audible level, not a float-equality test: a chest at
        // silence gets no release voice at all.
        if windchest_volume <= MIN_AUDIBLE_LEVEL || release_section.channels() == 0 {
            return;
        }

        let Some(mut new_voice) = self.pool.acquire() else {
            // Starvation: the stopping voice keeps fading on its own and
            // becomes eligible for the fast decay path.
            voice.drop_counter = voice.drop_counter.saturating_add(1);
            return;
        };

        let mut gain_target = provider.gain() * release_section.norm_gain();
        let mut gain_decay_ms: u32 = 0;

        if not_a_tremulant {
            // The release moves to the detached chest, so the source
            // chest's volume has to be folded into the gain target.
            gain_target *= windchest_volume;

            if self.is_scaled_releases {
                let time_ms = held_ms as f64;

                // Attack duration estimated from pipe pitch: 50 ms at the
                // treble end, 500 ms for the longest basses.
                let mut key = provider.midi_key_number();
                if key > 133 || key == 0 {
                    key = 60;
                }
                let attack_duration = if key >= 96 {
                    50.0
                } else if key < 24 {
                    500.0
                } else {
                    500.0 + (24.0 - key as f64) * 6.25
                };
                if time_ms < attack_duration {
                    let x = time_ms / attack_duration;
                    gain_target *= 0.2 + 0.8 * (2.0 * x - x * x);
                }

                // Room reverberation is not fully formed on staccato
                // notes; shorten the release accordingly. Time to full
                // reverb is estimated from the release length.
                let ttr = (60 * release_section.length()
                    / release_section.sample_rate().max(1) as usize
                    + 40)
                    .clamp(100, 350) as f64;
                if time_ms < ttr {
                    gain_decay_ms = (ttr + 6000.0 * time_ms / ttr) as u32;
                }
            }
        }

        new_voice.provider = Some(provider.clone());
        new_voice.start_time = now + 1;
        new_voice.wave_tremulant_state = release_section.wave_tremulant_state_for();
        new_voice
            .fader
            .setup_crossfade(gain_target, voice.fader.velocity_volume(), crossfade);

        let release_tail = provider.release_tail_ms();
        if release_tail > 0 && (release_tail < gain_decay_ms || gain_decay_ms == 0) {
            gain_decay_ms = release_tail;
        }
        if gain_decay_ms > 0 {
            new_voice
                .fader
                .start_decreasing_volume(self.ms_to_samples(gain_decay_ms));
        }

        if self.is_release_alignment && release_section.supports_stream_alignment() {
            new_voice
                .stream
                .init_aligned(release_section, self.interpolation, &voice.stream);
        } else {
            new_voice.stream.init(
                release_section,
                self.interpolation,
                provider.tuning() / self.sample_rate as Sample,
            );
        }
        new_voice.is_release = true;
        new_voice.task_id = if not_a_tremulant {
            // Detached from the source chest so tremulants stop acting on
            // the tail.
            DETACHED_RELEASE_TASK_ID
        } else {
            voice.task_id
        };
        new_voice.audio_group_id = voice.audio_group_id;
        new_voice.velocity = voice.velocity;
        new_voice.delay_samples = voice.delay_samples;
        new_voice
            .tone_filter
            .init(provider.tone_balance().filter(self.sample_rate as f64));
        new_voice.control.publish(
            provider_tag(&provider),
            new_voice.delay_samples,
            new_voice.velocity,
            voice.fader.velocity_volume(),
        );

        self.start_voice(new_voice);
        voice.start_time = now;
    }

    /// Crossfade the voice onto another attack section (wave tremulant
    /// switched on or off): a decaying copy keeps the old stream while
    /// the original restarts on the new section, phase-aligned.
    fn switch_to_another_attack(&self, voice: &mut Sampler) {
        let Some(provider) = voice.provider.clone() else {
            return;
        };
        if voice.is_release {
            return;
        }
        let Some(section) = provider.attack(voice.velocity, 1000) else {
            return;
        };
        let Some(mut copy) = self.pool.acquire() else {
            return;
        };

        let now = self.time();
        let gain_target = provider.gain() * section.norm_gain();
        let crossfade = self.ms_to_samples(provider.attack_switch_crossfade_ms());

        voice.copy_playing_state_to(&mut copy);
        copy.is_release = true;
        copy.start_time = now;
        copy.fader.start_decreasing_volume(crossfade);
        copy.control.publish(
            provider_tag(&provider),
            copy.delay_samples,
            copy.velocity,
            copy.fader.velocity_volume(),
        );
        copy.tone_filter
            .init(provider.tone_balance().filter(self.sample_rate as f64));

        voice.wave_tremulant_state = section.wave_tremulant_state_for();
        voice
            .stream
            .init_aligned(section, self.interpolation, &copy.stream);
        voice.start_time = now + 1;
        voice
            .fader
            .setup_crossfade(gain_target, copy.fader.velocity_volume(), crossfade);
        voice.is_release = false;

        self.start_voice(copy);
    }

    /// Acquire and start a voice for a pipe or tremulant event.
    fn start_sample(
        &self,
        provider: &Arc<dyn SoundProvider>,
        task_id: i32,
        audio_group: usize,
        velocity: u8,
        delay_ms: u32,
        prev_event_time: u64,
        is_release: bool,
    ) -> (Option<SamplerHandle>, u64) {
        let delay_samples = delay_ms as u64 * self.sample_rate as u64 / 1000;
        let start_time = self.time() + delay_samples;
        let event_interval_ms = self.samples_diff_to_ms(prev_event_time, start_time);

        if is_windchest_task(task_id) {
            if windchest_task_index(task_id) >= self.windchest_release_volumes.len() {
                return (None, start_time);
            }
        } else if tremulant_task_index(task_id) >= self.tremulant_tx.len() {
            return (None, start_time);
        }

        let section = if is_release {
            provider.release(WaveTremulantState::Any, event_interval_ms)
        } else {
            provider.attack(velocity, event_interval_ms)
        };
        let Some(section) = section.filter(|s| s.channels() > 0) else {
            return (None, start_time);
        };

        let Some(mut voice) = self.pool.acquire() else {
            // Expected at full polyphony; the meter saturates instead.
            log::debug!("sampler pool exhausted, dropping voice");
            return (None, start_time);
        };

        let velocity_volume = provider.velocity_volume(velocity);
        voice.provider = Some(provider.clone());
        voice.wave_tremulant_state = section.wave_tremulant_state_for();
        voice.velocity = velocity;
        voice.stream.init(
            section.clone(),
            self.interpolation,
            self.random_factor() * provider.tuning() / self.sample_rate as Sample,
        );
        voice
            .fader
            .setup(provider.gain() * section.norm_gain(), velocity_volume);
        voice.delay_samples = delay_samples;
        voice.start_time = start_time;
        voice
            .tone_filter
            .init(provider.tone_balance().filter(self.sample_rate as f64));
        voice.is_release = is_release;
        voice.task_id = task_id;
        voice.audio_group_id = audio_group.min(self.group_tx.len() - 1);
        voice.control.publish(
            provider_tag(provider),
            delay_samples,
            velocity,
            velocity_volume,
        );

        let handle = voice.control.clone();
        self.start_voice(voice);
        (Some(handle), start_time)
    }
}

struct BuiltEngine {
    core: Arc<EngineCore>,
    scheduler: Arc<Scheduler>,
    output_tasks: Vec<Arc<OutputTask>>,
    workers: Vec<SoundWorker>,
}

/// Sound engine for one loaded organ
pub struct OrganEngine {
    organ_model: Arc<dyn OrganModel>,
    sample_store: Arc<dyn SampleStore>,

    // Configuration (set before build)
    n_audio_groups: usize,
    n_aux_threads: usize,
    is_downmix: bool,
    n_release_repeats: usize,
    is_polyphony_limiting: bool,
    hard_polyphony: usize,
    is_scaled_releases: bool,
    is_release_alignment: bool,
    is_randomize_speaking: bool,
    interpolation: InterpolationType,
    reverb_config: ReverbConfig,
    volume_db: i32,
    amplitude: Sample,
    rng_seed: Option<u64>,

    state: AtomicU8,
    built: RwLock<Option<BuiltEngine>>,
}

impl OrganEngine {
    pub fn new(organ_model: Arc<dyn OrganModel>, sample_store: Arc<dyn SampleStore>) -> Self {
        let mut engine = Self {
            organ_model,
            sample_store,
            n_audio_groups: 1,
            n_aux_threads: 0,
            is_downmix: false,
            n_release_repeats: 1,
            is_polyphony_limiting: true,
            hard_polyphony: 2048,
            is_scaled_releases: true,
            is_release_alignment: true,
            is_randomize_speaking: true,
            interpolation: InterpolationType::Linear,
            reverb_config: ReverbConfig::default(),
            volume_db: 0,
            amplitude: 1.0,
            rng_seed: None,
            state: AtomicU8::new(Lifecycle::Idle as u8),
            built: RwLock::new(None),
        };
        engine.set_volume(-15);
        engine
    }

    /// Read every engine parameter out of a session configuration.
    pub fn set_from_config(&mut self, config: &SoundConfig) {
        self.n_audio_groups = config.audio_group_count();
        self.n_aux_threads = config.concurrency;
        self.is_downmix = config.record_downmix;
        self.n_release_repeats = config.release_concurrency.max(1);
        self.is_polyphony_limiting = config.manage_polyphony;
        self.set_hard_polyphony(config.polyphony_limit);
        self.is_scaled_releases = config.scale_release;
        self.is_release_alignment = config.release_alignment;
        self.is_randomize_speaking = config.randomize_speaking;
        self.interpolation = config.interpolation;
        self.reverb_config = config.reverb;
        self.set_volume(config.volume_db);
    }

    pub fn set_n_audio_groups(&mut self, n: usize) {
        self.n_audio_groups = n.max(1);
    }

    pub fn set_n_aux_threads(&mut self, n: usize) {
        self.n_aux_threads = n;
    }

    pub fn set_downmix(&mut self, downmix: bool) {
        self.is_downmix = downmix;
    }

    pub fn set_n_release_repeats(&mut self, n: usize) {
        self.n_release_repeats = n.max(1);
    }

    pub fn set_polyphony_limiting(&mut self, limiting: bool) {
        self.is_polyphony_limiting = limiting;
    }

    pub fn hard_polyphony(&self) -> usize {
        self.hard_polyphony
    }

    pub fn set_hard_polyphony(&mut self, polyphony: usize) {
        self.hard_polyphony = polyphony.max(1);
    }

    /// Soft limit: release decay accelerates beyond this voice count.
    pub fn polyphony_soft_limit(&self) -> usize {
        self.hard_polyphony * 3 / 4
    }

    pub fn set_scaled_releases(&mut self, enabled: bool) {
        self.is_scaled_releases = enabled;
    }

    pub fn set_release_alignment(&mut self, enabled: bool) {
        self.is_release_alignment = enabled;
    }

    pub fn set_randomize_speaking(&mut self, enabled: bool) {
        self.is_randomize_speaking = enabled;
    }

    pub fn set_interpolation_type(&mut self, interpolation: InterpolationType) {
        self.interpolation = interpolation;
    }

    pub fn set_reverb_config(&mut self, config: ReverbConfig) {
        self.reverb_config = config;
    }

    pub fn volume(&self) -> i32 {
        self.volume_db
    }

    /// Master gain in dB; stored alongside the derived linear amplitude.
    pub fn set_volume(&mut self, volume_db: i32) {
        self.volume_db = volume_db;
        self.amplitude = 10.0_f64.powf(volume_db as f64 * 0.05);
    }

    pub fn amplitude(&self) -> Sample {
        self.amplitude
    }

    /// Fix the pitch-randomization RNG for reproducible runs.
    pub fn set_rng_seed(&mut self, seed: Option<u64>) {
        self.rng_seed = seed;
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_lifecycle(&self, state: Lifecycle) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_idle(&self) -> bool {
        self.lifecycle() == Lifecycle::Idle
    }

    /// True while the engine serves audio (WORKING or USED).
    pub fn is_working(&self) -> bool {
        self.lifecycle() >= Lifecycle::Working
    }

    /// True while the audio system is connected.
    pub fn is_used(&self) -> bool {
        self.lifecycle() >= Lifecycle::Used
    }

    /// Switch between WORKING and USED; called by the sound system on
    /// attach/detach.
    pub fn set_used(&self, used: bool) {
        let state = self.lifecycle();
        assert!(
            state >= Lifecycle::Working,
            "set_used in lifecycle state {:?}",
            state
        );
        self.set_lifecycle(if used {
            Lifecycle::Used
        } else {
            Lifecycle::Working
        });
    }

    pub fn sample_rate(&self) -> u32 {
        self.built
            .read()
            .as_ref()
            .map_or(0, |built| built.core.sample_rate)
    }

    pub fn n_samples_per_buffer(&self) -> usize {
        self.built
            .read()
            .as_ref()
            .map_or(0, |built| built.core.n_samples_per_buffer)
    }

    /// Current period-sample clock.
    pub fn time(&self) -> u64 {
        self.built.read().as_ref().map_or(0, |built| built.core.time())
    }

    pub fn used_sampler_count(&self) -> usize {
        self.built
            .read()
            .as_ref()
            .map_or(0, |built| built.core.pool.used_count())
    }

    /// Build the task graph and start serving audio.
    pub fn build_and_start(
        &self,
        layouts: &[AudioOutputLayout],
        n_samples_per_buffer: usize,
        sample_rate: u32,
        recorder: Arc<dyn RecorderSink>,
    ) {
        self.build_engine(layouts, n_samples_per_buffer, sample_rate, recorder);
        self.start_engine();
    }

    /// Stop serving audio and destroy the task graph.
    ///
    /// The audio system must already be disconnected.
    pub fn stop_and_destroy(&self) {
        self.stop_engine();
        self.destroy_engine();
    }

    fn build_engine(
        &self,
        layouts: &[AudioOutputLayout],
        n_samples_per_buffer: usize,
        sample_rate: u32,
        recorder: Arc<dyn RecorderSink>,
    ) {
        assert_eq!(self.lifecycle(), Lifecycle::Idle, "build in non-idle state");
        assert!(!layouts.is_empty(), "at least one output layout required");
        assert!(
            n_samples_per_buffer > 0 && n_samples_per_buffer <= MAX_FRAME_SIZE,
            "unsupported buffer size {}",
            n_samples_per_buffer
        );
        assert!(sample_rate > 0);

        let n_groups = self.n_audio_groups;
        let n_tremulants = self.organ_model.tremulant_count();
        let n_windchests = self.organ_model.windchest_count();

        let (release_tx, release_rx) = unbounded();
        let (group_tx, group_rx): (Vec<_>, Vec<_>) = (0..n_groups).map(|_| unbounded()).unzip();
        let (tremulant_tx, tremulant_rx): (Vec<_>, Vec<_>) =
            (0..n_tremulants).map(|_| unbounded()).unzip();

        let mut windchest_release_volumes = vec![1.0];
        for windchest_n in 1..=n_windchests {
            windchest_release_volumes
                .push(self.organ_model.windchest_volume(windchest_n) * self.amplitude);
        }

        let core = Arc::new(EngineCore {
            sample_rate,
            n_samples_per_buffer,
            interpolation: self.interpolation,
            is_polyphony_limiting: self.is_polyphony_limiting,
            polyphony_soft_limit: self.polyphony_soft_limit(),
            is_scaled_releases: self.is_scaled_releases,
            is_release_alignment: self.is_release_alignment,
            is_randomize_speaking: self.is_randomize_speaking,
            current_time: AtomicU64::new(1),
            pool: SamplerPool::new(self.hard_polyphony),
            used_polyphony_peak: AtomicUsize::new(0),
            rng: Mutex::new(match self.rng_seed {
                Some(seed) => ChaCha8Rng::seed_from_u64(seed),
                None => ChaCha8Rng::from_os_rng(),
            }),
            release_tx,
            group_tx,
            tremulant_tx,
            windchest_release_volumes,
        });

        // Tremulant tasks, one per model tremulant.
        let tremulant_tasks: Vec<Arc<TremulantTask>> = tremulant_rx
            .into_iter()
            .map(|rx| Arc::new(TremulantTask::new(Arc::clone(&core), rx)))
            .collect();

        // Windchest tasks: the detached-release chest at index 0, then one
        // per model windchest wired to its tremulants.
        let mut windchest_tasks = vec![Arc::new(WindchestTask::new(1.0, Vec::new()))];
        for windchest_n in 1..=n_windchests {
            let tremulants = self
                .organ_model
                .windchest_tremulants(windchest_n)
                .into_iter()
                .filter(|&index| index < tremulant_tasks.len())
                .map(|index| Arc::clone(&tremulant_tasks[index]))
                .collect();
            windchest_tasks.push(Arc::new(WindchestTask::new(
                self.organ_model.windchest_volume(windchest_n) * self.amplitude,
                tremulants,
            )));
        }

        // Audio-group tasks hold the voices.
        let group_tasks: Vec<Arc<GroupTask>> = group_rx
            .into_iter()
            .map(|rx| {
                Arc::new(GroupTask::new(
                    Arc::clone(&core),
                    rx,
                    windchest_tasks.clone(),
                ))
            })
            .collect();

        // Per-device output tasks.
        let output_tasks: Vec<Arc<OutputTask>> = layouts
            .iter()
            .map(|layout| {
                Arc::new(OutputTask::new(
                    layout.channels,
                    layout.linear_factors(n_groups),
                    n_samples_per_buffer,
                    group_tasks.clone(),
                ))
            })
            .collect();

        let downmix_task = self
            .is_downmix
            .then(|| Arc::new(OutputTask::downmix(n_samples_per_buffer, group_tasks.clone())));

        // The recorder reads the downmix when present, else every device.
        let recorder_inputs = match &downmix_task {
            Some(task) => vec![Arc::clone(task)],
            None => output_tasks.clone(),
        };
        recorder.set_sample_rate(sample_rate);
        let recorder_task = Arc::new(RecorderTask::new(recorder_inputs, recorder));

        for task in &output_tasks {
            task.setup_reverb(&self.reverb_config, sample_rate);
        }
        if let Some(task) = &downmix_task {
            task.setup_reverb(&self.reverb_config, sample_rate);
        }

        let release_task = Arc::new(ReleaseTask::new(Arc::clone(&core), release_rx));
        let touch_task = Arc::new(TouchTask::new(Arc::clone(&self.sample_store)));

        let scheduler = Arc::new(Scheduler::new());
        scheduler.set_repeat_count(self.n_release_repeats);
        for task in &tremulant_tasks {
            scheduler.add(Arc::clone(task) as Arc<dyn SoundTask>);
        }
        for task in &windchest_tasks {
            scheduler.add(Arc::clone(task) as Arc<dyn SoundTask>);
        }
        for task in &group_tasks {
            scheduler.add(Arc::clone(task) as Arc<dyn SoundTask>);
        }
        if let Some(task) = &downmix_task {
            scheduler.add(Arc::clone(task) as Arc<dyn SoundTask>);
        }
        for task in &output_tasks {
            scheduler.add(Arc::clone(task) as Arc<dyn SoundTask>);
        }
        scheduler.add(Arc::clone(&recorder_task) as Arc<dyn SoundTask>);
        scheduler.add(Arc::clone(&release_task) as Arc<dyn SoundTask>);
        scheduler.add(Arc::clone(&touch_task) as Arc<dyn SoundTask>);

        let workers = (0..self.n_aux_threads)
            .map(|index| SoundWorker::spawn(index, Arc::clone(&scheduler)))
            .collect();

        log::info!(
            "engine built: {} groups, {} windchests, {} tremulants, {} outputs, {} workers",
            n_groups,
            n_windchests,
            n_tremulants,
            output_tasks.len(),
            self.n_aux_threads
        );

        *self.built.write() = Some(BuiltEngine {
            core,
            scheduler,
            output_tasks,
            workers,
        });
        self.set_lifecycle(Lifecycle::Built);
    }

    fn start_engine(&self) {
        assert_eq!(self.lifecycle(), Lifecycle::Built, "start in non-built state");
        let built = self.built.read();
        let built = built.as_ref().expect("built engine present");

        built.scheduler.clear_tasks();
        built.core.pool.return_all();
        built.core.current_time.store(1, Ordering::Relaxed);
        built.core.used_polyphony_peak.store(0, Ordering::Relaxed);
        built.scheduler.reset();
        built.scheduler.resume_giving_work();
        self.set_lifecycle(Lifecycle::Working);
    }

    fn stop_engine(&self) {
        assert_eq!(self.lifecycle(), Lifecycle::Working, "stop in non-working state");
        let built = self.built.read();
        let built = built.as_ref().expect("built engine present");

        built.scheduler.pause_giving_work();
        for worker in &built.workers {
            worker.wait_for_idle();
        }
        self.set_lifecycle(Lifecycle::Built);
    }

    fn destroy_engine(&self) {
        assert_eq!(self.lifecycle(), Lifecycle::Built, "destroy in non-built state");
        let built = self.built.write().take().expect("built engine present");

        for worker in built.workers {
            worker.stop_and_join();
        }
        built.scheduler.clear();
        self.set_lifecycle(Lifecycle::Idle);
        log::info!("engine destroyed");
    }

    /// Fill one device's period buffer.
    ///
    /// `is_last` marks the final callback of the period: its finish must
    /// complete the whole remaining chain before returning.
    pub fn get_audio_output(&self, output_index: usize, is_last: bool, out: &mut [Sample]) {
        if self.is_working() {
            let built = self.built.read();
            let built = built.as_ref().expect("working engine is built");
            let task = &built.output_tasks[output_index];
            task.finish(is_last, None);
            task.copy_buffer_to(out);
        } else {
            out.fill(0.0);
        }
    }

    /// Advance one period: drain the scheduler, step the clock, publish
    /// the polyphony peak, re-arm every task.
    pub fn next_period(&self) {
        let built = self.built.read();
        let Some(built) = built.as_ref() else {
            return;
        };

        built.scheduler.exec(None);

        built
            .core
            .current_time
            .fetch_add(built.core.n_samples_per_buffer as u64, Ordering::Relaxed);
        let used = built.core.pool.used_count();
        built
            .core
            .used_polyphony_peak
            .fetch_max(used, Ordering::Relaxed);

        built.scheduler.reset();
    }

    /// Wake all worker threads (the next period's pre-compute).
    pub fn wakeup_threads(&self) {
        let built = self.built.read();
        if let Some(built) = built.as_ref() {
            for worker in &built.workers {
                worker.wakeup();
            }
        }
    }

    /// Meter snapshot: `[polyphony fraction, ch0 peak, ch1 peak, ...]`
    /// across all outputs. Resets the collected peaks.
    pub fn meter_info(&self) -> Vec<f64> {
        let built = self.built.read();
        let Some(built) = built.as_ref() else {
            return vec![0.0];
        };

        let peak = built.core.used_polyphony_peak.swap(0, Ordering::Relaxed);
        let mut info = vec![(peak as f64 / self.hard_polyphony as f64).min(1.0)];
        for task in &built.output_tasks {
            info.extend(task.meter_info());
            task.reset_meter_info();
        }
        info
    }

    /// Start a pipe voice. Returns the stable handle (None when no
    /// section matches or the pool is exhausted) and the absolute start
    /// time in period samples.
    pub fn start_pipe_sample(
        &self,
        provider: &Arc<dyn SoundProvider>,
        windchest_n: usize,
        audio_group: usize,
        velocity: u8,
        delay_ms: u32,
        prev_event_time: u64,
        is_release: bool,
    ) -> (Option<SamplerHandle>, u64) {
        let built = self.built.read();
        let Some(built) = built.as_ref() else {
            return (None, 0);
        };
        built.core.start_sample(
            provider,
            windchest_n as i32,
            audio_group,
            velocity,
            delay_ms,
            prev_event_time,
            is_release,
        )
    }

    /// Start a tremulant wave voice on tremulant `tremulant_n` (1-based).
    pub fn start_tremulant_sample(
        &self,
        provider: &Arc<dyn SoundProvider>,
        tremulant_n: usize,
        prev_event_time: u64,
    ) -> Option<SamplerHandle> {
        let built = self.built.read();
        let built = built.as_ref()?;
        built
            .core
            .start_sample(provider, -(tremulant_n as i32), 0, 0x7f, 0, prev_event_time, false)
            .0
    }

    /// Schedule the release of a voice. Returns the scheduled stop time,
    /// or 0 when the handle no longer belongs to `provider` (the slot
    /// was reused).
    pub fn stop_sample(&self, provider: &Arc<dyn SoundProvider>, handle: &SamplerHandle) -> u64 {
        if !handle.is_for(provider) {
            return 0;
        }
        let built = self.built.read();
        let Some(built) = built.as_ref() else {
            return 0;
        };
        let stop_time = built.core.time() + handle.delay_samples();
        handle.request_stop(stop_time);
        stop_time
    }

    /// Request an attack-section switch (wave tremulant transitions).
    pub fn switch_sample(&self, provider: &Arc<dyn SoundProvider>, handle: &SamplerHandle) {
        if !handle.is_for(provider) {
            return;
        }
        let built = self.built.read();
        if let Some(built) = built.as_ref() {
            handle.request_new_attack(built.core.time() + handle.delay_samples());
        }
    }

    /// Adjust a sounding voice's velocity volume. Concurrent with the
    /// processing thread; a stale value for one period is acceptable.
    pub fn update_velocity(
        &self,
        provider: &Arc<dyn SoundProvider>,
        handle: &SamplerHandle,
        velocity: u8,
    ) {
        if handle.is_for(provider) {
            handle.set_velocity(velocity, provider.velocity_volume(velocity));
        }
    }
}

impl Drop for OrganEngine {
    fn drop(&mut self) {
        if self.lifecycle() == Lifecycle::Working {
            self.stop_engine();
        }
        if self.lifecycle() == Lifecycle::Built {
            self.destroy_engine();
        }
    }
}
