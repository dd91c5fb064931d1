//! Error types for pool construction

use thiserror::Error;

/// Errors reported while building pools, queues and decay triggers.
///
/// `put` and `get` never fail; emptiness and fullness are handled internally.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Ring capacity must be a power of two
    #[error("Segment capacity {capacity} is not a power of two")]
    NotPowerOfTwo {
        /// Rejected capacity
        capacity: usize,
    },

    /// Ring capacity above the packed-index limit
    #[error("Segment capacity {capacity} exceeds limit {limit}")]
    CapacityTooLarge {
        /// Rejected capacity
        capacity: usize,
        /// Largest allowed capacity
        limit: usize,
    },

    /// Chain would start larger than it is allowed to grow
    #[error("Initial segment capacity {initial} exceeds maximum {max}")]
    CapacityOrder {
        /// Configured initial capacity
        initial: usize,
        /// Configured maximum capacity
        max: usize,
    },

    /// Worker index outside the pinner's range
    #[error("Worker index {index} out of range for {workers} workers")]
    WorkerOutOfRange {
        /// Requested index
        index: usize,
        /// Number of worker slots
        workers: usize,
    },

    /// A pinner needs at least one worker slot
    #[error("Pinner must expose at least one worker")]
    NoWorkers,

    /// Decay timer interval of zero
    #[error("Decay interval must be non-zero")]
    ZeroInterval,

    /// Background decay thread could not be started
    #[error("Failed to spawn decay thread: {0}")]
    Spawn(#[from] std::io::Error),
}
