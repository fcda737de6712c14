//! Release task
//!
//! Drains the queue of voices whose stop or attack-switch instant has
//! passed, spawns the matching release (or aligned new-attack) voice, and
//! re-routes everything back onto its task. Scheduled as a repeat group:
//! the scheduler hands it out `release_concurrency` times per period so
//! several threads can split a large release burst.

use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::engine::EngineCore;
use crate::tasks::{worker_should_stop, SoundTask, TaskState, RELEASE_GROUP};
use crate::thread::WorkerHandle;
use crate::voice::Sampler;

pub struct ReleaseTask {
    core: Arc<EngineCore>,
    queue_rx: Receiver<Sampler>,
    state: TaskState,
}

impl ReleaseTask {
    pub fn new(core: Arc<EngineCore>, queue_rx: Receiver<Sampler>) -> Self {
        Self {
            core,
            queue_rx,
            state: TaskState::default(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.queue_rx.len()
    }
}

impl SoundTask for ReleaseTask {
    fn run(&self, worker: Option<&WorkerHandle>) {
        while let Ok(voice) = self.queue_rx.try_recv() {
            self.core.process_release(voice);
            if worker_should_stop(worker) {
                return;
            }
        }
    }

    fn finish(&self, stop: bool, worker: Option<&WorkerHandle>) {
        if stop {
            self.state.mark_stop();
        }
        self.run(worker);
    }

    fn reset(&self) {
        self.state.reset();
    }

    fn clear(&self) {
        // Voices queued from a previous run go straight back to the pool.
        while let Ok(voice) = self.queue_rx.try_recv() {
            self.core.return_sampler(voice);
        }
    }

    fn group(&self) -> u32 {
        RELEASE_GROUP
    }

    fn is_repeat(&self) -> bool {
        true
    }

    fn is_done(&self) -> bool {
        // Repeat task: the scheduler's hand-out counter is the period
        // bound, not a done flag.
        false
    }
}
