//! Simulation settings, independent of the hardware configuration record.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Cycles held in reset before the verifier addresses the design.
    pub warmup_cycles: u64,
    /// Cycles the design may run before the simulation times out.
    pub max_cycles: u64,
    /// Byte the memory image is filled with, so unwritten outputs never compare equal by accident.
    pub fill_byte: u8,
    /// Seed for stimulus generation.
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            warmup_cycles: 100,
            max_cycles: 1_000_000,
            fill_byte: 100,
            seed: 0,
        }
    }
}

impl SimConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_warmup_cycles(mut self, warmup_cycles: u64) -> Self {
        self.warmup_cycles = warmup_cycles;
        self
    }

    pub fn with_max_cycles(mut self, max_cycles: u64) -> Self {
        self.max_cycles = max_cycles;
        self
    }

    pub fn with_fill_byte(mut self, fill_byte: u8) -> Self {
        self.fill_byte = fill_byte;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.max_cycles == 0 {
            return Err(SimError::Config("max_cycles must be > 0".into()));
        }
        Ok(())
    }

    pub fn from_json(text: &str) -> SimResult<Self> {
        let config: SimConfig = serde_json::from_str(text)
            .map_err(|e| SimError::Config(format!("malformed config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> SimResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SimError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_json(&text)
    }
}
