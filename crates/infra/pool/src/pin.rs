//! Worker pinning
//!
//! A pool keeps one cache per worker. Before touching a worker's private
//! slot, the calling thread pins itself to that worker: for as long as it is
//! pinned, no other thread is handed the same worker index. The pool unpins
//! before it returns and never runs user code while pinned.
//!
//! Hosts with their own scheduler implement [`Pinner`]. Two implementations
//! ship with the crate:
//! - [`ThreadPinner`]: claims one of `available_parallelism` worker slots
//!   per pinned section, with thread affinity
//! - [`ManualPinner`]: each worker thread is bound to a fixed index up front

use crate::error::PoolError;
use crossbeam::utils::CachePadded;
use once_cell::sync::Lazy;
use std::cell::Cell;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

/// Capability that maps the calling thread to an exclusive worker slot
pub trait Pinner: Send + Sync {
    /// Pin the calling thread and return its worker index
    ///
    /// Until the matching [`Pinner::unpin`], no other thread may be given the
    /// same index. Must be O(1) in the uncontended case and must not allocate.
    fn pin(&self) -> usize;

    /// Release the pin taken by the last [`Pinner::pin`] on this thread
    fn unpin(&self);

    /// Number of worker slots; every index returned by `pin` is below it
    fn workers(&self) -> usize;
}

impl<P: Pinner + ?Sized> Pinner for Arc<P> {
    #[inline]
    fn pin(&self) -> usize {
        (**self).pin()
    }

    #[inline]
    fn unpin(&self) {
        (**self).unpin();
    }

    #[inline]
    fn workers(&self) -> usize {
        (**self).workers()
    }
}

/// RAII pin, unpins when dropped
pub(crate) struct PinGuard<'a, P: Pinner> {
    pinner: &'a P,
    index: usize,
}

impl<'a, P: Pinner> PinGuard<'a, P> {
    /// Pin through `pinner`
    ///
    /// # Panics
    /// Panics if the pinner hands out an index outside `0..workers()`; the
    /// pool's per-worker arrays cannot be kept consistent past that point.
    #[inline]
    pub(crate) fn new(pinner: &'a P) -> Self {
        let index = pinner.pin();
        let workers = pinner.workers();
        if index >= workers {
            pinner.unpin();
            panic!("pinner returned worker index {index} but exposes only {workers} workers");
        }
        Self { pinner, index }
    }

    #[inline(always)]
    pub(crate) const fn index(&self) -> usize {
        self.index
    }
}

impl<P: Pinner> Drop for PinGuard<'_, P> {
    #[inline]
    fn drop(&mut self) {
        self.pinner.unpin();
    }
}

/// Process-wide worker slots used by [`ThreadPinner`]
static THREAD_SLOTS: Lazy<Box<[CachePadded<AtomicBool>]>> = Lazy::new(|| {
    let workers = thread::available_parallelism().map_or(1, NonZeroUsize::get);
    (0..workers)
        .map(|_| CachePadded::new(AtomicBool::new(false)))
        .collect()
});

/// Spreads the first preferred slot of new threads
static NEXT_AFFINITY: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Slot this thread claimed last, tried first on the next pin
    static AFFINITY: Cell<usize> = Cell::new(NEXT_AFFINITY.fetch_add(1, Ordering::Relaxed));
    /// Slot currently held by this thread
    static HELD: Cell<usize> = const { Cell::new(0) };
    /// Pin nesting depth of this thread
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Default pinner for plain OS threads
///
/// Worker slots are a process-wide table sized to the machine's available
/// parallelism, shared by every pool. A pin claims a free slot with a CAS,
/// preferring the one this thread used last so that a thread keeps hitting
/// the same per-worker cache. If every slot is taken the caller yields and
/// retries; pinned sections are short and never block, so this is brief.
///
/// # Performance
/// The retry is a spin, not a bounded step. With more threads than slots, a
/// slot holder that gets preempted stalls every other caller until it is
/// scheduled again, so `put` and `get` are only non-blocking while threads
/// do not outnumber slots. Hosts that need the hard guarantee bind workers
/// with [`ManualPinner`] or their own [`Pinner`].
///
/// Pinning is re-entrant: a thread that already holds a slot gets the same
/// index back and only the outermost unpin releases it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPinner;

impl Pinner for ThreadPinner {
    fn pin(&self) -> usize {
        let depth = DEPTH.get();
        if depth > 0 {
            DEPTH.set(depth + 1);
            return HELD.get();
        }

        let slots = &**THREAD_SLOTS;
        let workers = slots.len();
        let start = AFFINITY.get() % workers;
        loop {
            for offset in 0..workers {
                let index = (start + offset) % workers;
                if slots[index]
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    AFFINITY.set(index);
                    HELD.set(index);
                    DEPTH.set(1);
                    return index;
                }
            }
            thread::yield_now();
        }
    }

    fn unpin(&self) {
        let depth = DEPTH.get();
        assert!(depth > 0, "unpin without a matching pin");
        if depth == 1 {
            THREAD_SLOTS[HELD.get()].store(false, Ordering::Release);
        }
        DEPTH.set(depth - 1);
    }

    fn workers(&self) -> usize {
        THREAD_SLOTS.len()
    }
}

thread_local! {
    /// Index bound by [`ManualPinner::bind_current_thread`]
    static BOUND: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Pinner for hosts that run a fixed set of worker threads
///
/// Each worker thread binds itself to its index once; pinning is then a
/// thread-local read. The host guarantees that no two live threads share an
/// index. The binding is per thread and is seen by every `ManualPinner`.
#[derive(Debug, Clone, Copy)]
pub struct ManualPinner {
    workers: usize,
}

impl ManualPinner {
    /// Create a pinner with `workers` slots
    ///
    /// # Errors
    /// Returns an error if `workers` is zero.
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        if workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        Ok(Self { workers })
    }

    /// Bind the calling thread to worker `index`
    ///
    /// # Errors
    /// Returns an error if `index` is not below the worker count.
    pub fn bind_current_thread(&self, index: usize) -> Result<(), PoolError> {
        if index >= self.workers {
            return Err(PoolError::WorkerOutOfRange {
                index,
                workers: self.workers,
            });
        }
        BOUND.set(Some(index));
        Ok(())
    }

    /// Remove the calling thread's binding
    pub fn unbind_current_thread(&self) {
        BOUND.set(None);
    }

    /// Index the calling thread is bound to, if any
    #[must_use]
    pub fn current(&self) -> Option<usize> {
        BOUND.get()
    }
}

impl Pinner for ManualPinner {
    fn pin(&self) -> usize {
        match BOUND.get() {
            Some(index) => index,
            None => panic!("thread {:?} is not bound to a worker", thread::current().id()),
        }
    }

    fn unpin(&self) {}

    fn workers(&self) -> usize {
        self.workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn test_thread_pinner_is_reentrant() {
        let pinner = ThreadPinner;
        let outer = pinner.pin();
        let inner = pinner.pin();
        assert_eq!(outer, inner);
        pinner.unpin();
        // Still held by the outer pin.
        assert!(THREAD_SLOTS[outer].load(Ordering::Acquire));
        pinner.unpin();
        assert_eq!(DEPTH.get(), 0);
    }

    #[test]
    fn test_thread_pinner_hands_out_distinct_slots() {
        let pinner = ThreadPinner;
        let workers = pinner.workers();
        let barrier = Barrier::new(workers);

        let indices: Vec<usize> = thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    s.spawn(|| {
                        let index = pinner.pin();
                        // Everyone holds a slot at the same time here.
                        barrier.wait();
                        pinner.unpin();
                        index
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut sorted = indices;
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), workers);
    }

    #[test]
    fn test_manual_pinner_binding() {
        let pinner = ManualPinner::new(3).unwrap();
        assert!(matches!(
            pinner.bind_current_thread(3),
            Err(PoolError::WorkerOutOfRange { index: 3, workers: 3 })
        ));
        pinner.bind_current_thread(2).unwrap();
        assert_eq!(pinner.pin(), 2);
        pinner.unpin();
        pinner.unbind_current_thread();
        assert_eq!(pinner.current(), None);
    }

    #[test]
    #[should_panic(expected = "is not bound to a worker")]
    fn test_manual_pinner_unbound_thread_panics() {
        let pinner = ManualPinner::new(1).unwrap();
        pinner.unbind_current_thread();
        pinner.pin();
    }
}
