//! Hardware configuration record handed to the scheduler, allocator, and
//! emission backend.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};

/// What the scheduler does with a parallelism factor below the burst minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurstPolicy {
    /// Fail with `AttributeValidation`.
    #[default]
    Reject,
    /// Raise the factor to the burst minimum.
    Widen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HwConfig {
    /// Data-path (memory interface) width in bits.
    pub bus_width: u32,
    /// Allocation granularity in bytes.
    pub chunk_size: u64,
    /// Size of the byte-addressable memory image.
    pub memory_bound: u64,
    pub burst_policy: BurstPolicy,
}

impl Default for HwConfig {
    fn default() -> Self {
        HwConfig {
            bus_width: 32,
            chunk_size: 64,
            memory_bound: 1 << 20,
            burst_policy: BurstPolicy::Reject,
        }
    }
}

impl HwConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bus_width(mut self, bus_width: u32) -> Self {
        self.bus_width = bus_width;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_memory_bound(mut self, memory_bound: u64) -> Self {
        self.memory_bound = memory_bound;
        self
    }

    pub fn with_burst_policy(mut self, burst_policy: BurstPolicy) -> Self {
        self.burst_policy = burst_policy;
        self
    }

    pub fn validate(&self) -> CompileResult<()> {
        if self.bus_width == 0 {
            return Err(CompileError::Config("bus_width must be > 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(CompileError::Config("chunk_size must be > 0".into()));
        }
        if self.memory_bound == 0 {
            return Err(CompileError::Config("memory_bound must be > 0".into()));
        }
        Ok(())
    }

    /// Minimum number of `width`-bit elements one bus transfer must move.
    pub fn burst_elements(&self, width: u32) -> usize {
        self.bus_width.div_ceil(width) as usize
    }

    /// Parse a JSON record; missing fields keep their defaults.
    pub fn from_json(text: &str) -> CompileResult<Self> {
        let config: HwConfig = serde_json::from_str(text)
            .map_err(|e| CompileError::Config(format!("malformed config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> CompileResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CompileError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_json(&text)
    }
}
