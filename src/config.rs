//! Simulator and per-fiber configuration.

use crate::error::{Result, SimError};
use serde::{Deserialize, Serialize};

/// Bit set of fiber run flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunFlags(u8);

impl RunFlags {
    /// No flags set.
    pub const NONE: RunFlags = RunFlags(0);
    /// The fiber never reads input and is skipped during fan-out.
    pub const PRODUCE_ONLY: RunFlags = RunFlags(1);

    const ALL: u8 = 1;

    /// Builds flags from raw bits, rejecting unknown bits.
    pub fn from_bits(bits: u8) -> Option<RunFlags> {
        (bits & !Self::ALL == 0).then_some(RunFlags(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: RunFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RunFlags) {
        self.0 |= other.0;
    }
}

/// Scheduling policy of a single fiber. Mutable at runtime by the fiber itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiberRunConfig {
    /// Scheduler calls allowed between forced yields. Must be non-zero.
    pub max_func_count: u32,
    /// How far (in microseconds) the fiber clock may run past the group clock.
    pub look_ahead_offset_us: u64,
    pub flags: RunFlags,
}

impl Default for FiberRunConfig {
    fn default() -> Self {
        Self {
            max_func_count: 50,
            look_ahead_offset_us: 40_000,
            flags: RunFlags::NONE,
        }
    }
}

impl FiberRunConfig {
    pub fn is_produce_only(&self) -> bool {
        self.flags.contains(RunFlags::PRODUCE_ONLY)
    }

    /// Checks a config on its own.
    pub fn validate(&self) -> Result<()> {
        if self.max_func_count == 0 || RunFlags::from_bits(self.flags.bits()).is_none() {
            return Err(SimError::Invalid);
        }
        Ok(())
    }

    /// Checks a replacement for `self`. The produce-only bit can be set but never cleared.
    pub fn validate_transition(&self, next: &FiberRunConfig) -> Result<()> {
        next.validate()?;
        if self.is_produce_only() && !next.is_produce_only() {
            return Err(SimError::Invalid);
        }
        Ok(())
    }
}

/// Default fiber stack size: 128 KiB, or 1 MiB when debug assertions are on.
pub const fn default_stack_size() -> usize {
    if cfg!(debug_assertions) {
        1024 * 1024
    } else {
        128 * 1024
    }
}

/// Default fiber-local queue capacity.
pub const DEFAULT_FIBER_QUEUE_SIZE: usize = 128;

/// Global simulator sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Output channel capacity, rounded up to a power of two. Staging holds four times this.
    pub out_queue_size: usize,
    /// Minimum group input channel capacity, rounded up to a power of two.
    pub group_queue_size: usize,
    /// Pending deferred wakes per group.
    pub future_wakes_capacity: usize,
    /// Input buffers drained from a group channel per main-loop pass.
    pub input_batch_size: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            out_queue_size: 1024,
            group_queue_size: 128,
            future_wakes_capacity: 32,
            input_batch_size: 16,
        }
    }
}

impl SimulatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.out_queue_size == 0
            || self.group_queue_size == 0
            || self.future_wakes_capacity == 0
            || self.input_batch_size == 0
        {
            return Err(SimError::Invalid);
        }
        Ok(())
    }
}
