//! Windchest task
//!
//! Publishes the windchest's volume for the period: the enclosure-derived
//! base level (with the engine's master amplitude folded in) modulated by
//! every tremulant assigned to this chest. Group tasks read the value
//! per voice; no audio flows through this task.

use std::sync::Arc;

use pf_core::{AtomicF64, Sample};

use crate::tasks::{SoundTask, TaskState, TremulantTask, WINDCHEST_GROUP};
use crate::thread::WorkerHandle;

pub struct WindchestTask {
    /// Enclosure volume x engine amplitude (1.0 for the detached chest)
    base_volume: Sample,
    tremulants: Vec<Arc<TremulantTask>>,
    volume: AtomicF64,
    state: TaskState,
}

impl WindchestTask {
    pub fn new(base_volume: Sample, tremulants: Vec<Arc<TremulantTask>>) -> Self {
        Self {
            base_volume,
            tremulants,
            volume: AtomicF64::new(base_volume),
            state: TaskState::default(),
        }
    }

    /// This period's modulated volume (valid once the task is done).
    pub fn volume(&self) -> Sample {
        self.volume.load()
    }

    pub fn base_volume(&self) -> Sample {
        self.base_volume
    }
}

impl SoundTask for WindchestTask {
    fn run(&self, worker: Option<&WorkerHandle>) {
        if self.state.is_done() {
            return;
        }
        let stop = self.state.is_stop();
        let mut volume = self.base_volume;
        for tremulant in &self.tremulants {
            tremulant.finish(stop, worker);
            volume *= tremulant.output();
        }
        self.volume.store(volume);
        self.state.set_done();
    }

    fn finish(&self, stop: bool, worker: Option<&WorkerHandle>) {
        if stop {
            self.state.mark_stop();
        }
        // Purely scalar work: a concurrent runner computes the same value,
        // so there is no lock to wait out.
        if !self.state.is_done() {
            self.run(worker);
        }
    }

    fn reset(&self) {
        self.state.reset();
    }

    fn clear(&self) {
        self.volume.store(self.base_volume);
    }

    fn group(&self) -> u32 {
        WINDCHEST_GROUP
    }

    fn is_done(&self) -> bool {
        self.state.is_done()
    }
}
