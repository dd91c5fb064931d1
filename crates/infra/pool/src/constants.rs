//! Pool constants
//!
//! Single source of truth for segment sizing limits and benchmark sizes.

/// Capacity of the first ring segment a worker chain allocates
pub const DEFAULT_INITIAL_SEGMENT_CAPACITY: usize = 8;

/// Hard upper bound on a single ring segment.
///
/// Fullness is detected by letting head run `capacity` positions ahead of
/// tail, so a segment may use at most a quarter of the 32-bit index space.
pub const RING_CAPACITY_LIMIT: usize = 1 << 30;

/// Default cap for chain growth
pub const DEFAULT_MAX_SEGMENT_CAPACITY: usize = RING_CAPACITY_LIMIT;

/// Name given to the background decay thread
pub const DECAY_THREAD_NAME: &str = "shardpool-decay";

/// Benchmark sizes
pub mod bench {
    /// Values pushed before a steady-state benchmark starts
    pub const BENCH_PREFILL: usize = 1024;
    /// Ring capacity used by the raw queue benchmarks
    pub const BENCH_RING_CAPACITY: usize = 4096;
    /// Threads used by the contended benchmarks
    pub const BENCH_THREADS: usize = 4;
}
