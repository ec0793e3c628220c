//! Boundary with the hardware emission backend.
//!
//! The backend receives an immutable [`Design`] (scheduled graph, memory map,
//! configuration record, parameter blob) and returns a module handle exposing
//! named control and data ports.

use std::fmt;
use std::sync::Arc;

use crate::config::HwConfig;
use crate::context::CompileContext;
use crate::error::CompileResult;
use crate::ir::graph::{Graph, TensorId};
use crate::memory::{MemoryMap, RegionKind};

/// Memory-mapped control interface (start strobe, status, base addresses).
pub const CONTROL_PORT: &str = "saxi";
/// Byte-addressable data interface into the memory image.
pub const DATA_PORT: &str = "maxi";
pub const CLOCK_PORT: &str = "CLK";
/// Active-low reset.
pub const RESET_PORT: &str = "RESETN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Control,
    Data,
    Clock,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub name: String,
    pub kind: PortKind,
    /// Data width in bits.
    pub width: u32,
}

impl Port {
    pub fn new(name: &str, kind: PortKind, width: u32) -> Self {
        Port {
            name: name.to_string(),
            kind,
            width,
        }
    }

    /// The four ports every accelerator module exposes.
    pub fn standard(bus_width: u32) -> Vec<Port> {
        vec![
            Port::new(CONTROL_PORT, PortKind::Control, 32),
            Port::new(DATA_PORT, PortKind::Data, bus_width),
            Port::new(CLOCK_PORT, PortKind::Clock, 1),
            Port::new(RESET_PORT, PortKind::Reset, 1),
        ]
    }
}

/// Everything the backend needs, frozen once emission starts.
#[derive(Debug, Clone)]
pub struct Design {
    pub name: String,
    pub graph: Graph,
    pub memory: MemoryMap,
    pub config: HwConfig,
    /// Variables then constants, chunk-aligned; indexed only by `memory.param_offsets`.
    pub param_blob: Vec<u8>,
}

impl Design {
    pub fn inputs(&self) -> Vec<TensorId> {
        self.graph.placeholders()
    }

    pub fn outputs(&self) -> Vec<TensorId> {
        self.graph.outputs()
    }

    pub fn param_base(&self) -> CompileResult<u64> {
        Ok(self.memory.region(RegionKind::Parameters)?.base)
    }

    pub fn scratch_base(&self) -> CompileResult<u64> {
        Ok(self.memory.region(RegionKind::Scratch)?.base)
    }
}

/// Opaque handle to an emitted hardware module.
pub trait ModuleHandle: fmt::Debug {
    fn name(&self) -> &str;

    fn ports(&self) -> &[Port];

    fn port(&self, name: &str) -> Option<&Port> {
        self.ports().iter().find(|p| p.name == name)
    }
}

pub trait EmitBackend {
    type Module: ModuleHandle;

    fn emit(&mut self, ctx: &mut CompileContext, design: Arc<Design>) -> CompileResult<Self::Module>;
}
