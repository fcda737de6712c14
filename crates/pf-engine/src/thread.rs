//! Worker threads
//!
//! Each worker drains the scheduler, then parks on a condition variable
//! until the last audio callback of a period wakes it. Stop is observed
//! before each task pull and at task-internal boundaries via the
//! `WorkerHandle` passed down into task code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::scheduler::Scheduler;

/// Cancellation view handed to running tasks
#[derive(Debug, Default)]
pub struct WorkerHandle {
    stop: AtomicBool,
}

impl WorkerHandle {
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct WorkerState {
    wake_ticket: u64,
    idle: bool,
}

struct WorkerShared {
    scheduler: Arc<Scheduler>,
    handle: WorkerHandle,
    state: Mutex<WorkerState>,
    cond: Condvar,
}

/// One auxiliary scheduler-draining thread
pub struct SoundWorker {
    shared: Arc<WorkerShared>,
    join: Option<JoinHandle<()>>,
}

impl SoundWorker {
    pub fn spawn(index: usize, scheduler: Arc<Scheduler>) -> Self {
        let shared = Arc::new(WorkerShared {
            scheduler,
            handle: WorkerHandle::default(),
            state: Mutex::new(WorkerState::default()),
            cond: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name(format!("pf-worker-{}", index))
            .spawn(move || Self::worker_loop(thread_shared))
            .expect("failed to spawn sound worker");

        Self {
            shared,
            join: Some(join),
        }
    }

    fn worker_loop(shared: Arc<WorkerShared>) {
        let mut last_ticket = 0;

        loop {
            {
                let mut state = shared.state.lock();
                state.idle = true;
                shared.cond.notify_all();
                while state.wake_ticket == last_ticket && !shared.handle.should_stop() {
                    shared.cond.wait(&mut state);
                }
                last_ticket = state.wake_ticket;
                state.idle = false;
            }
            if shared.handle.should_stop() {
                break;
            }

            shared.scheduler.exec(Some(&shared.handle));
        }

        let mut state = shared.state.lock();
        state.idle = true;
        shared.cond.notify_all();
    }

    /// Kick the worker into another scheduler pass.
    pub fn wakeup(&self) {
        let mut state = self.shared.state.lock();
        state.wake_ticket += 1;
        self.shared.cond.notify_all();
    }

    /// Block until the worker has drained its current pass.
    pub fn wait_for_idle(&self) {
        let mut state = self.shared.state.lock();
        while !state.idle {
            self.shared.cond.wait(&mut state);
        }
    }

    /// Request exit and join the thread.
    pub fn stop_and_join(mut self) {
        self.shared.handle.request_stop();
        self.shared.cond.notify_all();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SoundWorker {
    fn drop(&mut self) {
        self.shared.handle.request_stop();
        self.shared.cond.notify_all();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_starts_idle_and_stops() {
        let scheduler = Arc::new(Scheduler::new());
        let worker = SoundWorker::spawn(0, scheduler);
        worker.wait_for_idle();
        worker.stop_and_join();
    }

    #[test]
    fn test_wakeup_returns_to_idle() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.resume_giving_work();

        let worker = SoundWorker::spawn(1, scheduler);
        worker.wait_for_idle();
        for _ in 0..10 {
            worker.wakeup();
        }
        worker.wait_for_idle();
        worker.stop_and_join();
    }
}
