//! Output task (one per device; the downmix task is the 2-channel
//! unity-mapped variant feeding the recorder)
//!
//! Mixes the audio-group buffers through the device's scale-factor
//! matrix, applies the per-output reverb, clamps to [-1, +1] and tracks
//! per-channel peaks for the meter. Non-repeat: once done for a period,
//! every further `finish` returns immediately and the device callback
//! just copies the buffer out.

use std::sync::Arc;

use parking_lot::Mutex;
use pf_core::{AtomicF64, ReverbConfig, Sample};
use pf_dsp::Reverb;

use crate::tasks::{worker_should_stop, GroupTask, SoundTask, TaskState, AUDIOOUTPUT_GROUP};
use crate::thread::WorkerHandle;

const CLAMP_MIN: Sample = -1.0;
const CLAMP_MAX: Sample = 1.0;

struct OutputInner {
    buffer: Vec<Sample>,
    reverb: Reverb,
}

pub struct OutputTask {
    channels: usize,
    n_frames: usize,
    /// Linear gains, `scale_factors[channel * outputs * 2 + group * 2 + side]`
    scale_factors: Vec<Sample>,
    outputs: Vec<Arc<GroupTask>>,
    inner: Mutex<OutputInner>,
    meter: Vec<AtomicF64>,
    state: TaskState,
}

impl OutputTask {
    pub fn new(
        channels: usize,
        scale_factors: Vec<Sample>,
        n_frames: usize,
        outputs: Vec<Arc<GroupTask>>,
    ) -> Self {
        debug_assert_eq!(scale_factors.len(), channels * outputs.len() * 2);
        Self {
            channels,
            n_frames,
            scale_factors,
            outputs,
            inner: Mutex::new(OutputInner {
                buffer: vec![0.0; channels * n_frames],
                reverb: Reverb::new(channels),
            }),
            meter: (0..channels).map(|_| AtomicF64::new(0.0)).collect(),
            state: TaskState::default(),
        }
    }

    /// The downmix variant: stereo, each group's L to channel 0 and R to
    /// channel 1 at unity.
    pub fn downmix(n_frames: usize, outputs: Vec<Arc<GroupTask>>) -> Self {
        let width = outputs.len() * 2;
        let mut scale_factors = vec![0.0; 2 * width];
        for group in 0..outputs.len() {
            scale_factors[group * 2] = 1.0;
            scale_factors[width + group * 2 + 1] = 1.0;
        }
        Self::new(2, scale_factors, n_frames, outputs)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn setup_reverb(&self, config: &ReverbConfig, sample_rate: u32) {
        self.inner.lock().reverb.setup(config, sample_rate);
    }

    /// Copy this period's mix into a device buffer (after `finish`).
    pub fn copy_buffer_to(&self, dest: &mut [Sample]) {
        let inner = self.inner.lock();
        let len = dest.len().min(inner.buffer.len());
        dest[..len].copy_from_slice(&inner.buffer[..len]);
    }

    /// Hand this period's mix to a reader (recorder path).
    pub fn with_buffer(&self, f: &mut dyn FnMut(&[Sample], usize)) {
        let inner = self.inner.lock();
        f(&inner.buffer, self.channels);
    }

    /// Per-channel peaks since the last reset.
    pub fn meter_info(&self) -> Vec<f64> {
        self.meter.iter().map(|m| m.load()).collect()
    }

    pub fn reset_meter_info(&self) {
        for meter in &self.meter {
            meter.store(0.0);
        }
    }

    fn compute(&self, inner: &mut OutputInner, worker: Option<&WorkerHandle>) -> bool {
        inner.buffer.fill(0.0);

        let stop = self.state.is_stop();
        let n_cols = self.outputs.len() * 2;
        for channel in 0..self.channels {
            for col in 0..n_cols {
                let factor = self.scale_factors[channel * n_cols + col];
                if factor == 0.0 {
                    continue;
                }

                let output = &self.outputs[col / 2];
                output.finish(stop, worker);
                if worker_should_stop(worker) {
                    return false;
                }
                output.add_channel_to(
                    &mut inner.buffer,
                    self.channels,
                    channel,
                    col % 2,
                    factor,
                    self.n_frames,
                );
            }
        }

        inner.reverb.process(&mut inner.buffer, self.n_frames);

        // Clamp and feed the per-channel peak meter.
        for frame in 0..self.n_frames {
            for channel in 0..self.channels {
                let at = frame * self.channels + channel;
                let clamped = inner.buffer[at].clamp(CLAMP_MIN, CLAMP_MAX);
                inner.buffer[at] = clamped;
                self.meter[channel].store_max(clamped.abs());
            }
        }
        true
    }
}

impl SoundTask for OutputTask {
    fn run(&self, worker: Option<&WorkerHandle>) {
        if self.state.is_done() {
            return;
        }
        let Some(mut inner) = self.inner.try_lock() else {
            return;
        };
        if self.state.is_done() {
            return;
        }
        if self.compute(&mut inner, worker) {
            self.state.set_done();
        }
    }

    fn finish(&self, stop: bool, worker: Option<&WorkerHandle>) {
        if stop {
            self.state.mark_stop();
        }
        if self.state.is_done() {
            return;
        }
        if stop {
            let mut inner = self.inner.lock();
            if !self.state.is_done() && self.compute(&mut inner, worker) {
                self.state.set_done();
            }
        } else {
            self.run(worker);
        }
    }

    fn reset(&self) {
        self.state.reset();
    }

    fn clear(&self) {
        self.inner.lock().reverb.reset();
        self.reset_meter_info();
    }

    fn group(&self) -> u32 {
        AUDIOOUTPUT_GROUP
    }

    fn is_done(&self) -> bool {
        self.state.is_done()
    }
}
