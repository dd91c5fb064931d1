//! Sharded Object Pool
//!
//! Concurrent cache of interchangeable values for reuse across threads.
//!
//! Key Design Principles:
//! - Per-worker caches: a private slot plus a lock-free segment chain
//! - Work stealing from other workers' chains on a local miss
//! - Generational decay: cached values are released after at most two
//!   decay steps, independent of how large a pool grew
//! - Epoch-based reclamation for retired segments and generations
//!
//! Hot path (`put`/`get` hitting the caller's own worker) performs no locking
//! and no allocation.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod constants;
pub mod error;
pub mod pin;
pub mod queue;
pub mod registry;

mod pool;

// Re-exports
pub use config::PoolConfig;
pub use error::PoolError;
pub use pin::{ManualPinner, Pinner, ThreadPinner};
pub use pool::{Factory, Pool, PoolBuilder};
pub use queue::{Chain, Ring};
pub use registry::{DecayReport, DecayTimer, Registry};

/// Run one decay step on the process-wide registry
///
/// Hosts call this periodically, or start
/// [`Registry::spawn_decay_timer`] on [`Registry::global`].
pub fn decay() -> DecayReport {
    Registry::global().decay()
}
