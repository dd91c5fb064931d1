//! Generation registry and the decay protocol
//!
//! Every pool that has allocated per-worker caches is tracked here. A decay
//! step ages all of them by one generation:
//! - pools decayed last step lose their victim generation
//! - pools used since then have their current generation demoted to victim
//!
//! A value therefore survives at most one decay step after its last use,
//! whatever the pool size. Decay runs whenever the host calls
//! [`Registry::decay`], typically from a timer (see [`DecayTimer`]).

use crate::constants::DECAY_THREAD_NAME;
use crate::error::PoolError;
use crossbeam::channel::{self, select};
use crossbeam::epoch::{self, Guard};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use std::mem;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Generation transitions the registry drives on a pool
pub(crate) trait Generations: Send + Sync {
    /// Move the current generation into the victim slot, discarding the
    /// previous victim
    fn demote(&self, guard: &Guard);

    /// Discard the victim generation, returns whether one was present
    fn discard_victim(&self, guard: &Guard) -> bool;
}

struct Entry {
    id: u64,
    pool: Weak<dyn Generations>,
}

/// Registry sets, guarded by the registry lock
pub(crate) struct Sets {
    /// Pools with a non-empty current generation
    current: Vec<Entry>,
    /// Pools that may still hold a victim generation
    victims: Vec<Entry>,
}

impl Sets {
    pub(crate) fn register(&mut self, id: u64, pool: Weak<dyn Generations>) {
        trace!(pool = id, "registering pool generation");
        self.current.push(Entry { id, pool });
    }
}

/// Outcome of one decay step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecayReport {
    /// Pools whose current generation became their victim
    pub demoted: usize,
    /// Pools whose victim generation was discarded
    pub discarded: usize,
}

static GLOBAL: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::new()));

/// Tracks live pools and runs the decay step over them
pub struct Registry {
    sets: Mutex<Sets>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry
    ///
    /// Pools built against it are only decayed by this registry's
    /// [`Registry::decay`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            sets: Mutex::new(Sets {
                current: Vec::new(),
                victims: Vec::new(),
            }),
        }
    }

    /// Process-wide registry used by pools built without an explicit one
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Take the registry lock
    ///
    /// Pools hold it while allocating a generation so that allocation and
    /// registration are atomic with respect to decay.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Sets> {
        self.sets.lock()
    }

    /// Forget a pool that is being destroyed
    pub(crate) fn deregister(&self, id: u64) {
        let mut sets = self.sets.lock();
        sets.current.retain(|entry| entry.id != id);
        sets.victims.retain(|entry| entry.id != id);
        trace!(pool = id, "deregistered pool");
    }

    /// Run one decay step over every registered pool
    ///
    /// Holds the registry lock throughout, so decay steps never overlap
    /// each other or a generation allocation. Retired generations are freed
    /// through the epoch collector once no thread can still be reading them.
    pub fn decay(&self) -> DecayReport {
        let guard = &epoch::pin();
        let mut report = DecayReport::default();

        // Strong references are released after the lock: dropping the last
        // one destroys the pool, which deregisters itself.
        let mut alive = Vec::new();
        {
            let mut sets = self.sets.lock();
            let victims = mem::take(&mut sets.victims);
            let current = mem::take(&mut sets.current);

            for entry in &victims {
                if let Some(pool) = entry.pool.upgrade() {
                    if pool.discard_victim(guard) {
                        report.discarded += 1;
                    }
                    alive.push(pool);
                }
            }

            let mut demoted = Vec::with_capacity(current.len());
            for entry in current {
                if let Some(pool) = entry.pool.upgrade() {
                    pool.demote(guard);
                    report.demoted += 1;
                    alive.push(pool);
                    demoted.push(entry);
                }
            }
            sets.victims = demoted;
        }
        drop(alive);

        debug!(
            demoted = report.demoted,
            discarded = report.discarded,
            "pool decay step"
        );
        report
    }

    /// Run [`Registry::decay`] on a background thread every `interval`
    ///
    /// The thread stops when the returned [`DecayTimer`] is stopped or
    /// dropped.
    ///
    /// # Errors
    /// Returns an error if `interval` is zero or the thread cannot be spawned.
    pub fn spawn_decay_timer(self: &Arc<Self>, interval: Duration) -> Result<DecayTimer, PoolError> {
        if interval.is_zero() {
            return Err(PoolError::ZeroInterval);
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let registry = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(DECAY_THREAD_NAME.to_string())
            .spawn(move || {
                let ticker = channel::tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            registry.decay();
                        }
                        // Disconnected when the timer handle goes away.
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;

        info!(?interval, "decay timer started");
        Ok(DecayTimer {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

/// Handle to a background decay thread
#[derive(Debug)]
pub struct DecayTimer {
    stop: Option<channel::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DecayTimer {
    /// Stop the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the channel and wakes the thread.
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("decay thread panicked");
            } else {
                info!("decay timer stopped");
            }
        }
    }
}

impl Drop for DecayTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
