//! Growable chain of ring segments
//!
//! A doubly-linked list of [`Ring`]s. The producer only ever pushes into the
//! newest ring; once it fills up a new ring of twice the capacity (capped)
//! is linked after it. Consumers drain the oldest ring and unlink it once it
//! is exhausted. Unlinked rings are retired through the epoch collector
//! because a racing consumer may still be reading them.

use super::ring::Ring;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crossbeam::epoch::{self, Atomic, Owned, Shared};
use std::fmt;
use std::sync::atomic::Ordering;

struct Link<T> {
    ring: Ring<T>,
    // Written by the producer when it grows the chain.
    next: Atomic<Link<T>>,
    // Read by the producer, cleared by the consumer that unlinks our
    // predecessor.
    prev: Atomic<Link<T>>,
}

impl<T> Link<T> {
    fn new(capacity: usize) -> Self {
        Self {
            ring: Ring::new_unchecked(capacity),
            next: Atomic::null(),
            prev: Atomic::null(),
        }
    }
}

/// Single-producer, multi-consumer queue of unbounded size
pub struct Chain<T> {
    head: Atomic<Link<T>>,
    tail: Atomic<Link<T>>,
    initial_capacity: usize,
    max_capacity: usize,
}

unsafe impl<T: Send> Send for Chain<T> {}
unsafe impl<T: Send> Sync for Chain<T> {}

impl<T> Default for Chain<T> {
    fn default() -> Self {
        let config = PoolConfig::default();
        Self::new_unchecked(config.initial_segment_capacity, config.max_segment_capacity)
    }
}

impl<T> Chain<T> {
    /// Create an empty chain sized by `config`
    ///
    /// No ring is allocated until the first push.
    ///
    /// # Errors
    /// Returns an error if `config` fails [`PoolConfig::validate`].
    pub fn with_config(config: &PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self::new_unchecked(
            config.initial_segment_capacity,
            config.max_segment_capacity,
        ))
    }

    pub(crate) const fn new_unchecked(initial_capacity: usize, max_capacity: usize) -> Self {
        Self {
            head: Atomic::null(),
            tail: Atomic::null(),
            initial_capacity,
            max_capacity,
        }
    }

    /// Push a value into the newest ring, growing the chain when it is full
    ///
    /// # Safety
    /// Only one thread, the producer, may call `push_head` or `pop_head` on
    /// this chain, and never concurrently with itself.
    pub unsafe fn push_head(&self, value: T) {
        let guard = &epoch::pin();

        let mut head = self.head.load(Ordering::Relaxed, guard);
        if head.is_null() {
            head = Owned::new(Link::new(self.initial_capacity)).into_shared(guard);
            self.head.store(head, Ordering::Relaxed);
            self.tail.store(head, Ordering::Release);
        }

        // SAFETY: the newest link always has a null `next`, so no consumer
        // ever unlinks it.
        let link = unsafe { head.deref() };
        // SAFETY: forwarded single-producer contract
        let value = match unsafe { link.ring.push_head(value) } {
            Ok(()) => return,
            Err(value) => value,
        };

        let capacity = (link.ring.capacity() << 1).min(self.max_capacity);
        let fresh = Owned::new(Link::new(capacity));
        fresh.prev.store(head, Ordering::Relaxed);
        // SAFETY: the ring is not shared yet
        let pushed = unsafe { fresh.ring.push_head(value) };
        debug_assert!(pushed.is_ok(), "fresh ring rejected a push");

        let fresh = fresh.into_shared(guard);
        self.head.store(fresh, Ordering::Relaxed);
        link.next.store(fresh, Ordering::Release);
    }

    /// Pop the most recently pushed value, walking from the newest ring back
    ///
    /// # Safety
    /// Same single-producer contract as [`Chain::push_head`].
    pub unsafe fn pop_head(&self) -> Option<T> {
        let guard = &epoch::pin();

        let mut link = self.head.load(Ordering::Relaxed, guard);
        // SAFETY: links reachable under the guard are retired, not freed
        while let Some(current) = unsafe { link.as_ref() } {
            // SAFETY: forwarded single-producer contract
            if let Some(value) = unsafe { current.ring.pop_head() } {
                return Some(value);
            }
            link = current.prev.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Pop the oldest value
    ///
    /// Safe to call from any number of threads concurrently.
    pub fn pop_tail(&self) -> Option<T> {
        let guard = &epoch::pin();

        let mut link = self.tail.load(Ordering::Acquire, guard);
        loop {
            // SAFETY: links reachable under the guard are retired, not freed
            let current = unsafe { link.as_ref() }?;

            // Load the successor before popping. Once a successor exists the
            // producer never pushes into `current` again, so if the pop
            // below fails `current` is empty for good.
            let next = current.next.load(Ordering::Acquire, guard);
            if let Some(value) = current.ring.pop_tail() {
                return Some(value);
            }
            if next.is_null() {
                return None;
            }

            if self
                .tail
                .compare_exchange(link, next, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                // SAFETY: `next` is non-null and only retired after it is
                // itself unlinked from the tail.
                unsafe { next.deref() }
                    .prev
                    .store(Shared::null(), Ordering::Release);
                // SAFETY: `link` is unreachable from the chain now and only
                // the thread that won the CAS retires it.
                unsafe { guard.defer_destroy(link) };
            }
            link = next;
        }
    }

    /// Capacities of the live rings, oldest first
    pub fn segment_capacities(&self) -> Vec<usize> {
        let guard = &epoch::pin();

        let mut capacities = Vec::new();
        let mut link = self.tail.load(Ordering::Acquire, guard);
        // SAFETY: links reachable under the guard are retired, not freed
        while let Some(current) = unsafe { link.as_ref() } {
            capacities.push(current.ring.capacity());
            link = current.next.load(Ordering::Acquire, guard);
        }
        capacities
    }

    /// Check if every ring in the chain is empty
    ///
    /// Only a snapshot under concurrent access.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();

        let mut link = self.tail.load(Ordering::Acquire, guard);
        // SAFETY: links reachable under the guard are retired, not freed
        while let Some(current) = unsafe { link.as_ref() } {
            if !current.ring.is_empty() {
                return false;
            }
            link = current.next.load(Ordering::Acquire, guard);
        }
        true
    }
}

impl<T> Drop for Chain<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent access. Links already
        // unlinked from the tail belong to the epoch collector; everything
        // from the tail onwards is still ours.
        unsafe {
            let guard = epoch::unprotected();
            let mut link = self.tail.load(Ordering::Relaxed, guard);
            while !link.is_null() {
                let next = link.deref().next.load(Ordering::Relaxed, guard);
                drop(link.into_owned());
                link = next;
            }
        }
    }
}

impl<T> fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("segments", &self.segment_capacities())
            .finish()
    }
}
