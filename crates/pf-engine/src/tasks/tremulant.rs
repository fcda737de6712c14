//! Tremulant task
//!
//! Mixes the tremulant's wave voices into a private buffer and publishes
//! one modulation value per period: `1 + mean(buffer)`. Windchest tasks
//! multiply their volume by that value. With no wave voice sounding the
//! output is exactly 1 (no modulation).

use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use pf_core::{AtomicF64, Sample};

use crate::engine::{EngineCore, VoiceDisposition};
use crate::tasks::{worker_should_stop, SoundTask, TaskState, TREMULANT_GROUP};
use crate::thread::WorkerHandle;
use crate::voice::Sampler;

struct TremulantInner {
    voices: Vec<Sampler>,
    buffer: Vec<Sample>,
    scratch: Vec<Sample>,
}

pub struct TremulantTask {
    core: Arc<EngineCore>,
    pending_rx: Receiver<Sampler>,
    inner: Mutex<TremulantInner>,
    output: AtomicF64,
    state: TaskState,
}

impl TremulantTask {
    pub fn new(core: Arc<EngineCore>, pending_rx: Receiver<Sampler>) -> Self {
        let items = core.n_samples_per_buffer() * 2;
        Self {
            core,
            pending_rx,
            inner: Mutex::new(TremulantInner {
                voices: Vec::new(),
                buffer: vec![0.0; items],
                scratch: vec![0.0; items],
            }),
            output: AtomicF64::new(1.0),
            state: TaskState::default(),
        }
    }

    /// This period's modulation value (valid once the task is done).
    pub fn output(&self) -> Sample {
        self.output.load()
    }

    pub fn active_voice_count(&self) -> usize {
        self.inner.lock().voices.len()
    }

    fn compute(&self, inner: &mut TremulantInner, worker: Option<&WorkerHandle>) -> bool {
        let n_frames = self.core.n_samples_per_buffer();
        inner.buffer[..n_frames * 2].fill(0.0);

        while let Ok(voice) = self.pending_rx.try_recv() {
            inner.voices.push(voice);
        }

        let TremulantInner {
            voices,
            buffer,
            scratch,
        } = inner;
        let mut index = 0;
        while index < voices.len() {
            if worker_should_stop(worker) {
                return false;
            }
            match self.core.process_voice(buffer, scratch, &mut voices[index], 1.0) {
                VoiceDisposition::Keep => index += 1,
                VoiceDisposition::HandToRelease => {
                    let voice = voices.swap_remove(index);
                    self.core.hand_to_release(voice);
                }
                VoiceDisposition::ReturnToPool => {
                    let voice = voices.swap_remove(index);
                    self.core.return_sampler(voice);
                }
            }
        }

        let sum: Sample = buffer[..n_frames * 2].iter().sum();
        let value = 1.0 + sum / (n_frames * 2) as Sample;
        self.output.store(value.max(0.0));
        true
    }
}

impl SoundTask for TremulantTask {
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
        let mut inner = self.inner.lock();
        while let Ok(voice) = self.pending_rx.try_recv() {
            inner.voices.push(voice);
        }
        for voice in inner.voices.drain(..) {
            self.core.return_sampler(voice);
        }
        self.output.store(1.0);
    }

    fn group(&self) -> u32 {
        TREMULANT_GROUP
    }

    fn is_done(&self) -> bool {
        self.state.is_done()
    }
}
