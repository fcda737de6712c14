//! Recorder task
//!
//! Scheduled downstream of the output (or downmix) tasks: finishes each
//! configured input and hands its period buffer to the recorder sink.
//! Encoding happens behind the sink, outside the task graph.

use std::sync::Arc;

use parking_lot::Mutex;
use pf_model::RecorderSink;

use crate::tasks::{OutputTask, SoundTask, TaskState, AUDIOOUTPUT_GROUP};
use crate::thread::WorkerHandle;

pub struct RecorderTask {
    inputs: Vec<Arc<OutputTask>>,
    sink: Arc<dyn RecorderSink>,
    /// Single-runner guard so blocks reach the sink in period order
    write_lock: Mutex<()>,
    state: TaskState,
}

impl RecorderTask {
    pub fn new(inputs: Vec<Arc<OutputTask>>, sink: Arc<dyn RecorderSink>) -> Self {
        Self {
            inputs,
            sink,
            write_lock: Mutex::new(()),
            state: TaskState::default(),
        }
    }

    fn compute(&self, worker: Option<&WorkerHandle>) {
        let stop = self.state.is_stop();
        for input in &self.inputs {
            input.finish(stop, worker);
            input.with_buffer(&mut |buffer, channels| {
                self.sink.write_block(buffer, channels);
            });
        }
    }
}

impl SoundTask for RecorderTask {
    fn run(&self, worker: Option<&WorkerHandle>) {
        if self.state.is_done() {
            return;
        }
        let Some(_guard) = self.write_lock.try_lock() else {
            return;
        };
        if self.state.is_done() {
            return;
        }
        self.compute(worker);
        self.state.set_done();
    }

    fn finish(&self, stop: bool, worker: Option<&WorkerHandle>) {
        if stop {
            self.state.mark_stop();
        }
        if self.state.is_done() {
            return;
        }
        if stop {
            let _guard = self.write_lock.lock();
            if !self.state.is_done() {
                self.compute(worker);
                self.state.set_done();
            }
        } else {
            self.run(worker);
        }
    }

    fn reset(&self) {
        self.state.reset();
    }

    fn group(&self) -> u32 {
        AUDIOOUTPUT_GROUP
    }

    fn is_done(&self) -> bool {
        self.state.is_done()
    }
}
