//! Fixed-size lock-free ring segment
//!
//! A single-producer, multi-consumer queue. The producer can push and pop at
//! the head; any number of consumers can pop at the tail.
//!
//! # Features
//! - **Packed indices**: head and tail are two 32-bit halves of one `AtomicU64`,
//!   so fullness checks and pops are a single compare-and-swap
//! - **Prompt release**: a popped slot is cleared immediately, the ring never
//!   keeps a value alive after handing it out
//! - **Explicit presence**: every slot carries its own occupied flag, there is no
//!   sentinel value and a zero-valued payload is an ordinary payload

use crate::config::check_capacity;
use crate::error::PoolError;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// Head lives in the upper 32 bits, tail in the lower 32 bits.
const INDEX_BITS: u32 = 32;
const INDEX_MASK: u64 = 0xFFFF_FFFF;
const HEAD_ONE: u64 = 1 << INDEX_BITS;

#[inline(always)]
const fn pack(head: u32, tail: u32) -> u64 {
    ((head as u64) << INDEX_BITS) | (tail as u64)
}

#[inline(always)]
#[allow(clippy::cast_possible_truncation)]
const fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> INDEX_BITS) as u32, (packed & INDEX_MASK) as u32)
}

/// One ring slot
///
/// `occupied` is set by the producer before publishing the head and cleared
/// by whoever popped the slot once the value has been moved out.
struct Slot<T> {
    occupied: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn empty() -> Self {
        Self {
            occupied: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Move the value out and mark the slot free
    ///
    /// # Safety
    /// The caller must own the slot through a successful index CAS.
    #[inline(always)]
    unsafe fn take(&self) -> T {
        // SAFETY: the winning CAS reserved this slot for us and the
        // producer published the value before advancing the head.
        let value = unsafe { (*self.value.get()).assume_init_read() };
        self.occupied.store(false, Ordering::Release);
        value
    }
}

/// Lock-free fixed-capacity ring segment
pub struct Ring<T> {
    head_tail: AtomicU64,
    slots: Box<[Slot<T>]>,
    mask: u32,
}

unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Create a ring holding up to `capacity` values
    ///
    /// # Errors
    /// Returns an error if `capacity` is not a power of two or exceeds
    /// [`crate::constants::RING_CAPACITY_LIMIT`].
    pub fn with_capacity(capacity: usize) -> Result<Self, PoolError> {
        check_capacity(capacity)?;
        Ok(Self::new_unchecked(capacity))
    }

    /// Create a ring from an already validated capacity
    pub(crate) fn new_unchecked(capacity: usize) -> Self {
        Self::starting_at(capacity, 0)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn starting_at(capacity: usize, index: u32) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity).map(|_| Slot::empty()).collect();
        Self {
            head_tail: AtomicU64::new(pack(index, index)),
            slots,
            // Capacity is at most 2^30, the mask fits in 32 bits
            mask: (capacity - 1) as u32,
        }
    }

    /// Maximum number of values the ring holds
    #[inline(always)]
    pub const fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    /// Number of values currently queued
    ///
    /// Only a snapshot under concurrent access.
    #[inline]
    pub fn len(&self) -> usize {
        let (head, tail) = unpack(self.head_tail.load(Ordering::Acquire));
        head.wrapping_sub(tail) as usize
    }

    /// Check if the ring is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    fn slot(&self, index: u32) -> &Slot<T> {
        &self.slots[(index & self.mask) as usize]
    }

    /// Push a value at the head
    ///
    /// Hands the value back if the ring is full, or if a consumer that
    /// reserved the target slot is still moving its value out.
    ///
    /// # Safety
    /// Only one thread, the producer, may call `push_head` or `pop_head` on
    /// this ring, and never concurrently with itself.
    #[inline]
    pub unsafe fn push_head(&self, value: T) -> Result<(), T> {
        let (head, tail) = unpack(self.head_tail.load(Ordering::Acquire));
        if tail.wrapping_add(self.mask + 1) == head {
            return Err(value);
        }

        let slot = self.slot(head);
        if slot.occupied.load(Ordering::Acquire) {
            // A tail consumer is still draining this slot.
            return Err(value);
        }

        // SAFETY: the slot lies outside [tail, head) and its previous
        // occupant has been moved out, so nobody else can touch it.
        unsafe { (*slot.value.get()).write(value) };
        slot.occupied.store(true, Ordering::Relaxed);

        // Only the producer moves the head, a plain add publishes the slot.
        self.head_tail.fetch_add(HEAD_ONE, Ordering::Release);
        Ok(())
    }

    /// Pop the most recently pushed value
    ///
    /// # Safety
    /// Same single-producer contract as [`Ring::push_head`].
    #[inline]
    pub unsafe fn pop_head(&self) -> Option<T> {
        let mut packed = self.head_tail.load(Ordering::Acquire);
        let slot = loop {
            let (head, tail) = unpack(packed);
            if head == tail {
                return None;
            }

            let head = head.wrapping_sub(1);
            match self.head_tail.compare_exchange_weak(
                packed,
                pack(head, tail),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break self.slot(head),
                Err(current) => packed = current,
            }
        };

        // SAFETY: the CAS moved the head below this slot, tail consumers
        // can no longer reach it.
        Some(unsafe { slot.take() })
    }

    /// Pop the oldest value
    ///
    /// Safe to call from any number of threads concurrently.
    #[inline]
    pub fn pop_tail(&self) -> Option<T> {
        let mut packed = self.head_tail.load(Ordering::Acquire);
        let slot = loop {
            let (head, tail) = unpack(packed);
            if head == tail {
                return None;
            }

            match self.head_tail.compare_exchange_weak(
                packed,
                pack(head, tail.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break self.slot(tail),
                Err(current) => packed = current,
            }
        };

        // SAFETY: advancing the tail past this slot made it ours. The
        // producer will not reuse it until `take` clears the occupied flag.
        Some(unsafe { slot.take() })
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if *slot.occupied.get_mut() {
                // SAFETY: occupied slots hold an initialized value and we
                // have exclusive access.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
