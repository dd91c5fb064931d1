//! Pool configuration

use crate::constants::{
    DEFAULT_INITIAL_SEGMENT_CAPACITY, DEFAULT_MAX_SEGMENT_CAPACITY, RING_CAPACITY_LIMIT,
};
use crate::error::PoolError;
use serde::{Deserialize, Serialize};

/// Sizing of the per-worker segment chains.
///
/// Missing fields fall back to their defaults when deserialized, so a host
/// can override only what it cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Capacity of the first segment of each worker chain
    pub initial_segment_capacity: usize,
    /// Capacity at which chain growth stops doubling
    pub max_segment_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_segment_capacity: DEFAULT_INITIAL_SEGMENT_CAPACITY,
            max_segment_capacity: DEFAULT_MAX_SEGMENT_CAPACITY,
        }
    }
}

impl PoolConfig {
    /// Check both capacities and their ordering
    ///
    /// # Errors
    /// Returns an error if either capacity is not a power of two, exceeds
    /// [`RING_CAPACITY_LIMIT`], or if the initial capacity exceeds the maximum.
    pub fn validate(&self) -> Result<(), PoolError> {
        check_capacity(self.initial_segment_capacity)?;
        check_capacity(self.max_segment_capacity)?;
        if self.initial_segment_capacity > self.max_segment_capacity {
            return Err(PoolError::CapacityOrder {
                initial: self.initial_segment_capacity,
                max: self.max_segment_capacity,
            });
        }
        Ok(())
    }
}

/// Validate a single ring capacity
pub(crate) fn check_capacity(capacity: usize) -> Result<(), PoolError> {
    if !capacity.is_power_of_two() {
        return Err(PoolError::NotPowerOfTwo { capacity });
    }
    if capacity > RING_CAPACITY_LIMIT {
        return Err(PoolError::CapacityTooLarge {
            capacity,
            limit: RING_CAPACITY_LIMIT,
        });
    }
    Ok(())
}
