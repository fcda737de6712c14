//! Audio-group task
//!
//! Owns the active pipe voices routed to one audio group and mixes them
//! into an interleaved stereo buffer. Per voice it finishes the owning
//! windchest task first and processes the voice at that windchest's
//! period volume. Output tasks pull this buffer through `add_channel_to`.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use pf_core::Sample;

use crate::engine::{EngineCore, VoiceDisposition};
use crate::tasks::{worker_should_stop, SoundTask, TaskState, WindchestTask, AUDIOGROUP_GROUP};
use crate::thread::WorkerHandle;
use crate::voice::{windchest_task_index, Sampler};

struct GroupInner {
    voices: Vec<Sampler>,
    buffer: Vec<Sample>,
    scratch: Vec<Sample>,
}

pub struct GroupTask {
    core: Arc<EngineCore>,
    pending_rx: Receiver<Sampler>,
    /// All windchest tasks, indexed by windchest task ID (0 = detached)
    windchests: Vec<Arc<WindchestTask>>,
    inner: Mutex<GroupInner>,
    state: TaskState,
}

impl GroupTask {
    pub fn new(
        core: Arc<EngineCore>,
        pending_rx: Receiver<Sampler>,
        windchests: Vec<Arc<WindchestTask>>,
    ) -> Self {
        let items = core.n_samples_per_buffer() * 2;
        Self {
            core,
            pending_rx,
            windchests,
            inner: Mutex::new(GroupInner {
                voices: Vec::new(),
                buffer: vec![0.0; items],
                scratch: vec![0.0; items],
            }),
            state: TaskState::default(),
        }
    }

    pub fn active_voice_count(&self) -> usize {
        self.inner.lock().voices.len()
    }

    /// Add `factor x` channel `src_channel` of this group's mix into
    /// channel `dest_channel` of an interleaved `dest` buffer.
    pub fn add_channel_to(
        &self,
        dest: &mut [Sample],
        dest_channels: usize,
        dest_channel: usize,
        src_channel: usize,
        factor: Sample,
        n_frames: usize,
    ) {
        let inner = self.inner.lock();
        for frame in 0..n_frames {
            dest[frame * dest_channels + dest_channel] +=
                inner.buffer[frame * 2 + src_channel] * factor;
        }
    }

    fn compute(&self, inner: &mut GroupInner, worker: Option<&WorkerHandle>) -> bool {
        let n_frames = self.core.n_samples_per_buffer();
        inner.buffer[..n_frames * 2].fill(0.0);

        while let Ok(voice) = self.pending_rx.try_recv() {
            inner.voices.push(voice);
        }

        let stop = self.state.is_stop();
        let GroupInner {
            voices,
            buffer,
            scratch,
        } = inner;
        let mut index = 0;
        while index < voices.len() {
            if worker_should_stop(worker) {
                return false;
            }
            let windchest = &self.windchests[windchest_task_index(voices[index].task_id)];
            windchest.finish(stop, worker);
            let volume = windchest.volume();

            match self
                .core
                .process_voice(buffer, scratch, &mut voices[index], volume)
            {
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
        true
    }
}

impl SoundTask for GroupTask {
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
        inner.buffer.fill(0.0);
    }

    fn group(&self) -> u32 {
        AUDIOGROUP_GROUP
    }

    fn cost(&self) -> u32 {
        // Voice mixing dominates the period; sort it first in its group.
        1
    }

    fn is_done(&self) -> bool {
        self.state.is_done()
    }
}
