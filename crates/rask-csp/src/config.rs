// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime policy knobs.
//!
//! None of these change channel semantics. They bound queue growth, size
//! dispatcher batches and set the timer coalescing window.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Pending operations allowed on either side of one channel.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1024;
/// Parks between two cleanup passes over a pending queue.
pub const DEFAULT_MAX_DIRTY: usize = 64;
/// Tasks run per dispatcher tick.
pub const DEFAULT_DISPATCH_BATCH_SIZE: usize = 1024;
/// Timeouts whose deadlines fall this close together share a channel.
pub const DEFAULT_TIMEOUT_RESOLUTION: Duration = Duration::from_millis(10);
/// Highest skip-list level a timer entry can reach.
pub const DEFAULT_TIMER_MAX_LEVEL: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RuntimeConfig {
    pub max_queue_size: usize,
    pub max_dirty: usize,
    pub dispatch_batch_size: usize,
    pub timeout_resolution: Duration,
    pub timer_max_level: usize,
    /// Fixed seed for `alts` permutations and skip-list levels. `None`
    /// seeds from OS entropy.
    pub seed: Option<u64>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_dirty: DEFAULT_MAX_DIRTY,
            dispatch_batch_size: DEFAULT_DISPATCH_BATCH_SIZE,
            timeout_resolution: DEFAULT_TIMEOUT_RESOLUTION,
            timer_max_level: DEFAULT_TIMER_MAX_LEVEL,
            seed: None,
        }
    }

    pub fn with_max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    pub fn with_max_dirty(mut self, n: usize) -> Self {
        self.max_dirty = n;
        self
    }

    /// Batch size is clamped to at least one task per tick.
    pub fn with_dispatch_batch_size(mut self, n: usize) -> Self {
        self.dispatch_batch_size = n.max(1);
        self
    }

    pub fn with_timeout_resolution(mut self, resolution: Duration) -> Self {
        self.timeout_resolution = resolution;
        self
    }

    pub fn with_timer_max_level(mut self, level: usize) -> Self {
        self.timer_max_level = level;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub(crate) fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            max_queue_size: self.max_queue_size,
            max_dirty: self.max_dirty,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The part of the config each channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_queue_size: usize,
    pub max_dirty: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        RuntimeConfig::new().queue_limits()
    }
}
