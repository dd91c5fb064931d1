//! Sharded object pool
//!
//! Each worker owns a [`Local`] cache: a private single-value slot that only
//! that worker touches, plus a [`Chain`] the worker pushes to and pops from
//! at the head and that every other worker may steal from at the tail.
//!
//! # Memory Layout
//! - `current`: generation of per-worker locals filled by `put`
//! - `victim`: the previous generation, only drained by `get`
//! - every `Local` is cache-padded so neighbouring workers never share a line
//!
//! Generations are moved and discarded by the [`Registry`] decay step and
//! freed through the epoch collector.

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::pin::{PinGuard, Pinner, ThreadPinner};
use crate::queue::Chain;
use crate::registry::{Generations, Registry};
use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Factory producing a fresh value when the pool is empty
pub type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// Per-worker cache
struct Local<T> {
    // Only the worker pinned to this index reads or writes it.
    private: UnsafeCell<Option<T>>,
    // Owner pushes/pops the head, anyone pops the tail.
    shared: Chain<T>,
}

// SAFETY: `private` is only accessed by the thread pinned to this worker,
// the chain is synchronized internally.
unsafe impl<T: Send> Sync for Local<T> {}

impl<T> Local<T> {
    fn new(config: &PoolConfig) -> Self {
        Self {
            private: UnsafeCell::new(None),
            shared: Chain::new_unchecked(
                config.initial_segment_capacity,
                config.max_segment_capacity,
            ),
        }
    }

    /// Store into the private slot, or the chain head if it is taken
    ///
    /// # Safety
    /// The caller must be pinned to this local's worker.
    #[inline]
    unsafe fn put(&self, value: T) {
        // SAFETY: pinned, nobody else touches `private`
        let private = unsafe { &mut *self.private.get() };
        if private.is_none() {
            *private = Some(value);
        } else {
            // SAFETY: the pinned worker is the chain's only producer
            unsafe { self.shared.push_head(value) };
        }
    }

    /// # Safety
    /// The caller must be pinned to this local's worker.
    #[inline]
    unsafe fn take_private(&self) -> Option<T> {
        // SAFETY: pinned, nobody else touches `private`
        unsafe { (*self.private.get()).take() }
    }
}

/// One allocation of per-worker locals
struct Generation<T> {
    locals: Box<[CachePadded<Local<T>>]>,
}

impl<T> Generation<T> {
    fn new(workers: usize, config: &PoolConfig) -> Self {
        Self {
            locals: (0..workers)
                .map(|_| CachePadded::new(Local::new(config)))
                .collect(),
        }
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.locals.len()
    }

    #[inline(always)]
    fn local(&self, worker: usize) -> &Local<T> {
        &self.locals[worker]
    }
}

struct Inner<T, P> {
    id: u64,
    me: Weak<Self>,
    current: CachePadded<Atomic<Generation<T>>>,
    victim: CachePadded<Atomic<Generation<T>>>,
    factory: Option<Factory<T>>,
    pinner: P,
    registry: Arc<Registry>,
    config: PoolConfig,
}

impl<T: Send + 'static, P: Pinner + 'static> Inner<T, P> {
    /// Pin the caller and return its worker's generation
    #[inline]
    fn pin<'g>(&self, guard: &'g Guard) -> (PinGuard<'_, P>, &'g Generation<T>) {
        let pin = PinGuard::new(&self.pinner);
        let current = self.current.load(Ordering::Acquire, guard);
        // SAFETY: generations are retired through the epoch collector
        if let Some(generation) = unsafe { current.as_ref() } {
            if pin.index() < generation.len() {
                return (pin, generation);
            }
        }
        drop(pin);
        self.pin_slow(guard)
    }

    #[cold]
    fn pin_slow<'g>(&self, guard: &'g Guard) -> (PinGuard<'_, P>, &'g Generation<T>) {
        // Lock first, then pin: a pinned thread must never wait on the lock.
        let mut sets = self.registry.lock();
        let pin = PinGuard::new(&self.pinner);

        let current = self.current.load(Ordering::Acquire, guard);
        // SAFETY: generations are retired through the epoch collector
        if let Some(generation) = unsafe { current.as_ref() } {
            if pin.index() < generation.len() {
                return (pin, generation);
            }
        }

        if current.is_null() {
            let me: Weak<dyn Generations> = self.me.clone();
            sets.register(self.id, me);
        }

        let workers = self.pinner.workers();
        let fresh = Owned::new(Generation::new(workers, &self.config)).into_shared(guard);
        let previous = self.current.swap(fresh, Ordering::AcqRel, guard);
        if !previous.is_null() {
            // The worker count grew, the narrower generation is dropped.
            // SAFETY: unreachable from the pool now
            unsafe { guard.defer_destroy(previous) };
        }
        debug!(pool = self.id, workers, "allocated pool generation");

        // SAFETY: just published, retired only through the epoch collector
        (pin, unsafe { fresh.deref() })
    }

    /// Steal from other workers, then fall back to the victim generation
    #[cold]
    fn get_slow(&self, worker: usize, generation: &Generation<T>, guard: &Guard) -> Option<T> {
        let workers = generation.len();
        for offset in 1..=workers {
            let local = generation.local((worker + offset) % workers);
            if let Some(value) = local.shared.pop_tail() {
                return Some(value);
            }
        }

        let victim = self.victim.load(Ordering::Acquire, guard);
        // SAFETY: generations are retired through the epoch collector
        let old = unsafe { victim.as_ref() }?;
        if worker >= old.len() {
            return None;
        }

        // SAFETY: still pinned to `worker`
        if let Some(value) = unsafe { old.local(worker).take_private() } {
            return Some(value);
        }
        let workers = old.len();
        for offset in 0..workers {
            let local = old.local((worker + offset) % workers);
            if let Some(value) = local.shared.pop_tail() {
                return Some(value);
            }
        }

        // The victim is exhausted; release it now rather than at the next
        // decay step. Compare first so a concurrently demoted generation
        // is left alone.
        if self
            .victim
            .compare_exchange(victim, Shared::null(), Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            // SAFETY: unreachable from the pool now
            unsafe { guard.defer_destroy(victim) };
        }
        None
    }
}

impl<T: Send + 'static, P: Pinner + 'static> Generations for Inner<T, P> {
    fn demote(&self, guard: &Guard) {
        let current = self.current.swap(Shared::null(), Ordering::AcqRel, guard);
        let previous = self.victim.swap(current, Ordering::AcqRel, guard);
        if !previous.is_null() {
            // SAFETY: unreachable from the pool now
            unsafe { guard.defer_destroy(previous) };
        }
    }

    fn discard_victim(&self, guard: &Guard) -> bool {
        let victim = self.victim.swap(Shared::null(), Ordering::AcqRel, guard);
        if victim.is_null() {
            return false;
        }
        // SAFETY: unreachable from the pool now
        unsafe { guard.defer_destroy(victim) };
        true
    }
}

impl<T, P> Drop for Inner<T, P> {
    fn drop(&mut self) {
        self.registry.deregister(self.id);

        // SAFETY: the last handle is gone, nobody can load these pointers.
        unsafe {
            let guard = epoch::unprotected();
            for generation in [&*self.current, &*self.victim] {
                let generation = generation.swap(Shared::null(), Ordering::Relaxed, guard);
                if !generation.is_null() {
                    drop(generation.into_owned());
                }
            }
        }
    }
}

/// Sharded object pool with generational decay
///
/// `put` hands a value to the pool, `get` takes an arbitrary one back.
/// Values are cached per worker and stolen across workers on a miss. A
/// value left in the pool is discarded after at most two decay steps of its
/// [`Registry`].
///
/// The handle is cheap to clone; clones share the same pool.
///
/// # Example
/// ```
/// use shardpool::Pool;
///
/// let pool = Pool::with_factory(|| Vec::<u8>::with_capacity(1024));
/// let mut buf = pool.get().unwrap_or_default();
/// buf.extend_from_slice(b"payload");
/// buf.clear();
/// pool.put(buf);
/// ```
pub struct Pool<T, P = ThreadPinner> {
    inner: Arc<Inner<T, P>>,
}

impl<T, P> Clone for Pool<T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Create an empty pool without a factory
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(PoolConfig::default(), ThreadPinner, Registry::global(), None)
    }

    /// Create an empty pool that calls `factory` when it has nothing to give
    #[must_use]
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::from_parts(
            PoolConfig::default(),
            ThreadPinner,
            Registry::global(),
            Some(Box::new(factory)),
        )
    }

    /// Start building a pool with a custom configuration, pinner or registry
    #[must_use]
    pub fn builder() -> PoolBuilder<T> {
        PoolBuilder::new()
    }
}

impl<T: Send + 'static> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static, P: Pinner + 'static> Pool<T, P> {
    fn from_parts(
        config: PoolConfig,
        pinner: P,
        registry: Arc<Registry>,
        factory: Option<Factory<T>>,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| Inner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            current: CachePadded::new(Atomic::null()),
            victim: CachePadded::new(Atomic::null()),
            factory,
            pinner,
            registry,
            config,
        });
        Self { inner }
    }

    /// Add a value to the pool
    ///
    /// Accepts `T` or `Option<T>`; `None` is ignored.
    pub fn put(&self, value: impl Into<Option<T>>) {
        let Some(value) = value.into() else {
            return;
        };
        if diagnostics::drop_submission() {
            return;
        }

        let guard = &epoch::pin();
        let (pin, generation) = self.inner.pin(guard);
        // SAFETY: pinned to this worker until `pin` drops
        unsafe { generation.local(pin.index()).put(value) };
    }

    /// Take an arbitrary value from the pool
    ///
    /// Falls back to the factory, called while unpinned, when the pool is
    /// empty. Returns `None` only if there is no factory.
    pub fn get(&self) -> Option<T> {
        let value = {
            let guard = &epoch::pin();
            let (pin, generation) = self.inner.pin(guard);
            let worker = pin.index();
            let local = generation.local(worker);
            // SAFETY: pinned to this worker until `pin` drops
            unsafe { local.take_private() }
                // SAFETY: the pinned worker is the chain's only producer
                .or_else(|| unsafe { local.shared.pop_head() })
                .or_else(|| self.inner.get_slow(worker, generation, guard))
        };

        value.or_else(|| self.inner.factory.as_ref().map(|factory| factory()))
    }

    /// Width of the current generation, 0 before first use or after decay
    pub fn workers(&self) -> usize {
        let guard = &epoch::pin();
        let current = self.inner.current.load(Ordering::Acquire, guard);
        // SAFETY: generations are retired through the epoch collector
        unsafe { current.as_ref() }.map_or(0, Generation::len)
    }

    /// Check if the pool holds a victim generation
    pub fn has_victim(&self) -> bool {
        let guard = &epoch::pin();
        !self.inner.victim.load(Ordering::Acquire, guard).is_null()
    }

    /// Configuration the pool was built with
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Registry that decays this pool
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }
}

impl<T, P> fmt::Debug for Pool<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("factory", &self.inner.factory.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for pools with a custom configuration, pinner, registry or factory
pub struct PoolBuilder<T, P = ThreadPinner> {
    config: PoolConfig,
    pinner: P,
    registry: Option<Arc<Registry>>,
    factory: Option<Factory<T>>,
}

impl<T> PoolBuilder<T> {
    fn new() -> Self {
        Self {
            config: PoolConfig::default(),
            pinner: ThreadPinner,
            registry: None,
            factory: None,
        }
    }
}

impl<T, P> PoolBuilder<T, P> {
    /// Segment sizing for the per-worker chains
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Registry that decays the pool, the global one by default
    #[must_use]
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Factory called by `get` when the pool is empty
    #[must_use]
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Worker pinning strategy, [`ThreadPinner`] by default
    #[must_use]
    pub fn pinner<Q: Pinner>(self, pinner: Q) -> PoolBuilder<T, Q> {
        PoolBuilder {
            config: self.config,
            pinner,
            registry: self.registry,
            factory: self.factory,
        }
    }

    /// Validate the configuration and create the pool
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the pinner
    /// exposes no workers.
    pub fn build(self) -> Result<Pool<T, P>, PoolError>
    where
        T: Send + 'static,
        P: Pinner + 'static,
    {
        self.config.validate()?;
        if self.pinner.workers() == 0 {
            return Err(PoolError::NoWorkers);
        }
        Ok(Pool::from_parts(
            self.config,
            self.pinner,
            self.registry.unwrap_or_else(Registry::global),
            self.factory,
        ))
    }
}

#[cfg(feature = "race-diagnostics")]
mod diagnostics {
    use rand::Rng;

    /// Randomly drop one in four submissions
    #[inline]
    pub(super) fn drop_submission() -> bool {
        rand::thread_rng().gen_ratio(1, 4)
    }
}

#[cfg(not(feature = "race-diagnostics"))]
mod diagnostics {
    #[inline(always)]
    pub(super) const fn drop_submission() -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::ManualPinner;

    fn pool(workers: usize) -> Pool<u32, ManualPinner> {
        Pool::builder()
            .pinner(ManualPinner::new(workers).unwrap())
            .registry(Arc::new(Registry::new()))
            .build()
            .unwrap()
    }

    #[test]
    #[cfg_attr(feature = "race-diagnostics", ignore = "submissions are dropped at random")]
    fn test_private_slot_fills_first() {
        let pool = pool(1);
        pool.pinner().bind_current_thread(0).unwrap();

        pool.put(1);
        pool.put(2);
        pool.put(3);

        let guard = &epoch::pin();
        // SAFETY: just populated by `put`, no decay runs on this private registry
        let generation = unsafe { pool.inner.current.load(Ordering::Acquire, guard).deref() };
        let local = generation.local(0);
        // SAFETY: bound to worker 0
        assert_eq!(unsafe { local.take_private() }, Some(1));
        assert_eq!(local.shared.pop_tail(), Some(2));
        assert_eq!(local.shared.pop_tail(), Some(3));
    }

    #[test]
    #[cfg_attr(feature = "race-diagnostics", ignore = "submissions are dropped at random")]
    fn test_generation_is_lazy_and_registered_once() {
        let pool = pool(3);
        pool.pinner().bind_current_thread(1).unwrap();
        assert_eq!(pool.workers(), 0);

        pool.put(7);
        pool.put(8);
        assert_eq!(pool.workers(), 3);

        let report = pool.registry().decay();
        assert_eq!(report.demoted, 1);
        assert_eq!(pool.workers(), 0);
        assert!(pool.has_victim());
    }

    #[test]
    #[cfg_attr(feature = "race-diagnostics", ignore = "submissions are dropped at random")]
    fn test_demote_replaces_previous_victim() {
        let pool = pool(1);
        pool.pinner().bind_current_thread(0).unwrap();

        pool.put(1);
        pool.registry().decay();
        pool.put(2);
        // First step already made `1` a victim; this one drops it.
        pool.registry().decay();

        assert_eq!(pool.get(), Some(2));
        assert_eq!(pool.get(), None);
    }

    impl<T: Send + 'static, P: Pinner + 'static> Pool<T, P> {
        fn pinner(&self) -> &P {
            &self.inner.pinner
        }
    }
}
