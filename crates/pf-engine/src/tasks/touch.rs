//! Touch task
//!
//! Walks the sample store one page batch per period, reading a sample
//! from each page to keep resident what the next stop registration will
//! need. Lowest priority: only reached once everything audible is done.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pf_model::SampleStore;

use crate::tasks::{worker_should_stop, SoundTask, TaskState, TOUCH_GROUP};
use crate::thread::WorkerHandle;

/// Pages visited per period
const PAGES_PER_RUN: usize = 16;

pub struct TouchTask {
    store: Arc<dyn SampleStore>,
    cursor: AtomicUsize,
    state: TaskState,
}

impl TouchTask {
    pub fn new(store: Arc<dyn SampleStore>) -> Self {
        Self {
            store,
            cursor: AtomicUsize::new(0),
            state: TaskState::default(),
        }
    }
}

impl SoundTask for TouchTask {
    fn run(&self, worker: Option<&WorkerHandle>) {
        if self.state.is_done() {
            return;
        }
        let page_count = self.store.page_count();
        if page_count > 0 {
            for _ in 0..PAGES_PER_RUN.min(page_count) {
                if worker_should_stop(worker) {
                    return;
                }
                let page = self.cursor.fetch_add(1, Ordering::Relaxed) % page_count;
                self.store.touch_page(page);
            }
        }
        self.state.set_done();
    }

    fn finish(&self, stop: bool, worker: Option<&WorkerHandle>) {
        if stop {
            self.state.mark_stop();
        }
        if !self.state.is_done() {
            self.run(worker);
        }
    }

    fn reset(&self) {
        self.state.reset();
    }

    fn clear(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }

    fn group(&self) -> u32 {
        TOUCH_GROUP
    }

    fn is_done(&self) -> bool {
        self.state.is_done()
    }
}
