//! Task scheduler
//!
//! Keeps the period's tasks sorted by priority group and hands them out
//! to whoever asks: the audio thread at the period boundary and the
//! worker threads in between. Hand-outs are counted per entry so the
//! RELEASE group can be re-entered a configurable number of times per
//! period; everything else runs at most once (the per-task done flag and
//! single-runner lock make extra hand-outs harmless).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::tasks::SoundTask;
use crate::thread::WorkerHandle;

struct Entry {
    task: Arc<dyn SoundTask>,
    repeat: bool,
    runs_left: AtomicU32,
}

pub struct Scheduler {
    entries: RwLock<Vec<Entry>>,
    giving_work: AtomicBool,
    repeat_count: AtomicU32,
    generation: AtomicU64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            giving_work: AtomicBool::new(false),
            repeat_count: AtomicU32::new(1),
            generation: AtomicU64::new(0),
        }
    }

    /// How often repeat-group tasks are handed out per period.
    pub fn set_repeat_count(&self, count: usize) {
        self.repeat_count
            .store(count.max(1) as u32, Ordering::Relaxed);
    }

    /// Insert a task, keeping the list ordered by (group, cost desc).
    pub fn add(&self, task: Arc<dyn SoundTask>) {
        let key = (task.group(), std::cmp::Reverse(task.cost()));
        let repeat = task.is_repeat();
        let mut entries = self.entries.write();
        let at = entries
            .iter()
            .position(|e| (e.task.group(), std::cmp::Reverse(e.task.cost())) > key)
            .unwrap_or(entries.len());
        entries.insert(
            at,
            Entry {
                task,
                repeat,
                runs_left: AtomicU32::new(0),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn task_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Monotonic period counter, bumped by `reset`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Prepare all tasks for a new period.
    pub fn reset(&self) {
        let repeat_count = self.repeat_count.load(Ordering::Relaxed);
        let entries = self.entries.read();
        for entry in entries.iter() {
            entry.task.reset();
            entry
                .runs_left
                .store(if entry.repeat { repeat_count } else { 1 }, Ordering::Relaxed);
        }
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset the per-session state of every task (start of a run).
    pub fn clear_tasks(&self) {
        let entries = self.entries.read();
        for entry in entries.iter() {
            entry.task.clear();
        }
    }

    /// Stop handing out tasks (drains the queue on engine stop).
    pub fn pause_giving_work(&self) {
        self.giving_work.store(false, Ordering::Release);
    }

    pub fn resume_giving_work(&self) {
        self.giving_work.store(true, Ordering::Release);
    }

    pub fn is_giving_work(&self) -> bool {
        self.giving_work.load(Ordering::Acquire)
    }

    fn next(&self) -> Option<Arc<dyn SoundTask>> {
        if !self.is_giving_work() {
            return None;
        }
        let entries = self.entries.read();
        for entry in entries.iter() {
            if !entry.repeat && entry.task.is_done() {
                continue;
            }
            let claimed = entry
                .runs_left
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                    (left > 0).then(|| left - 1)
                })
                .is_ok();
            if claimed {
                return Some(Arc::clone(&entry.task));
            }
        }
        None
    }

    /// Pull and run tasks until the queue is drained (or paused, or the
    /// calling worker is told to stop).
    pub fn exec(&self, worker: Option<&WorkerHandle>) {
        loop {
            if let Some(handle) = worker {
                if handle.should_stop() {
                    return;
                }
            }
            let Some(task) = self.next() else {
                return;
            };
            task.run(worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTask {
        group: u32,
        repeat: bool,
        runs: AtomicUsize,
        done: AtomicBool,
        order: Arc<parking_lot::Mutex<Vec<u32>>>,
    }

    impl CountingTask {
        fn new(group: u32, repeat: bool, order: Arc<parking_lot::Mutex<Vec<u32>>>) -> Self {
            Self {
                group,
                repeat,
                runs: AtomicUsize::new(0),
                done: AtomicBool::new(false),
                order,
            }
        }
    }

    impl SoundTask for CountingTask {
        fn run(&self, _worker: Option<&WorkerHandle>) {
            self.runs.fetch_add(1, Ordering::Relaxed);
            self.order.lock().push(self.group);
            if !self.repeat {
                self.done.store(true, Ordering::Relaxed);
            }
        }

        fn finish(&self, _stop: bool, worker: Option<&WorkerHandle>) {
            if !self.is_done() {
                self.run(worker);
            }
        }

        fn reset(&self) {
            self.done.store(false, Ordering::Relaxed);
        }

        fn group(&self) -> u32 {
            self.group
        }

        fn is_repeat(&self) -> bool {
            self.repeat
        }

        fn is_done(&self) -> bool {
            self.done.load(Ordering::Relaxed)
        }
    }

    fn scheduler_with(tasks: &[Arc<CountingTask>]) -> Scheduler {
        let scheduler = Scheduler::new();
        for task in tasks {
            scheduler.add(Arc::clone(task) as Arc<dyn SoundTask>);
        }
        scheduler
    }

    #[test]
    fn test_priority_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let tasks = vec![
            Arc::new(CountingTask::new(700, false, Arc::clone(&order))),
            Arc::new(CountingTask::new(10, false, Arc::clone(&order))),
            Arc::new(CountingTask::new(100, false, Arc::clone(&order))),
        ];
        let scheduler = scheduler_with(&tasks);
        scheduler.set_repeat_count(1);
        scheduler.resume_giving_work();
        scheduler.reset();
        scheduler.exec(None);

        assert_eq!(*order.lock(), vec![10, 100, 700]);
        assert!(tasks.iter().all(|t| t.runs.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_repeat_group_reentered() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let release = Arc::new(CountingTask::new(160, true, Arc::clone(&order)));
        let scheduler = scheduler_with(&[Arc::clone(&release)]);
        scheduler.set_repeat_count(3);
        scheduler.resume_giving_work();
        scheduler.reset();
        scheduler.exec(None);

        assert_eq!(release.runs.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_paused_scheduler_gives_nothing() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let task = Arc::new(CountingTask::new(10, false, Arc::clone(&order)));
        let scheduler = scheduler_with(&[Arc::clone(&task)]);
        scheduler.reset();
        scheduler.exec(None); // never resumed
        assert_eq!(task.runs.load(Ordering::Relaxed), 0);

        scheduler.resume_giving_work();
        scheduler.pause_giving_work();
        scheduler.exec(None);
        assert_eq!(task.runs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_reset_bumps_generation_and_rearms() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let task = Arc::new(CountingTask::new(10, false, Arc::clone(&order)));
        let scheduler = scheduler_with(&[Arc::clone(&task)]);
        scheduler.resume_giving_work();

        let generation = scheduler.generation();
        scheduler.reset();
        scheduler.exec(None);
        scheduler.reset();
        scheduler.exec(None);

        assert_eq!(scheduler.generation(), generation + 2);
        assert_eq!(task.runs.load(Ordering::Relaxed), 2);
    }
}
