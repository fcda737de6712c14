//! Sampler pool
//!
//! Fixed-capacity recycler for voice slots. The free list is a bounded
//! channel: acquire pops, release pushes, both O(1) and lock-free, and
//! the capacity is the hard polyphony limit. An empty pop is the
//! expected overload behavior (the new voice is dropped), surfaced to
//! the meter rather than the caller.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::voice::Sampler;

pub struct SamplerPool {
    free_tx: Sender<Sampler>,
    free_rx: Receiver<Sampler>,
    capacity: usize,
    used: AtomicUsize,
}

impl SamplerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (free_tx, free_rx) = bounded(capacity);
        for _ in 0..capacity {
            free_tx
                .send(Sampler::new())
                .expect("free list sized to capacity");
        }
        Self {
            free_tx,
            free_rx,
            capacity,
            used: AtomicUsize::new(0),
        }
    }

    /// Hard polyphony limit.
    pub fn usage_limit(&self) -> usize {
        self.capacity
    }

    /// Voices currently outside the free list (pending or active).
    pub fn used_count(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Take a reset slot, or None when the hard limit is reached.
    pub fn acquire(&self) -> Option<Sampler> {
        let sampler = self.free_rx.try_recv().ok()?;
        self.used.fetch_add(1, Ordering::Relaxed);
        Some(sampler)
    }

    /// Return a voice; its control is killed so stale handles miss.
    pub fn release(&self, mut sampler: Sampler) {
        sampler.control.clear();
        sampler.reset();
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(1))
            });
        // Cannot overflow: every slot out there came from this list.
        let _ = self.free_tx.try_send(sampler);
    }

    /// Rebuild the free list with fresh slots and zero the usage count.
    ///
    /// Only valid while no task holds voices (engine start, before any
    /// period has run).
    pub fn return_all(&self) {
        while self.free_rx.try_recv().is_ok() {}
        for _ in 0..self.capacity {
            if self.free_tx.try_send(Sampler::new()).is_err() {
                break;
            }
        }
        self.used.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_up_to_capacity() {
        let pool = SamplerPool::new(3);
        assert_eq!(pool.usage_limit(), 3);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!(pool.used_count(), 3);
        assert!(pool.acquire().is_none());

        pool.release(b);
        assert_eq!(pool.used_count(), 2);
        assert!(pool.acquire().is_some());

        pool.release(a);
        pool.release(c);
    }

    #[test]
    fn test_release_kills_control() {
        let pool = SamplerPool::new(1);
        let sampler = pool.acquire().unwrap();
        let handle = sampler.control.clone();
        handle.request_stop(7);

        pool.release(sampler);
        assert_eq!(handle.stop_time(), 0);
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn test_return_all_resets_usage() {
        let pool = SamplerPool::new(2);
        let _leaked = pool.acquire().unwrap();
        assert_eq!(pool.used_count(), 1);

        pool.return_all();
        assert_eq!(pool.used_count(), 0);
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_concurrent_acquire_release() {
        use std::sync::Arc;

        let pool = Arc::new(SamplerPool::new(64));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            threads.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    if let Some(sampler) = pool.acquire() {
                        pool.release(sampler);
                    }
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(pool.used_count(), 0);
    }
}
