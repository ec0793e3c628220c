//! Quantizing compiler from neural-network graphs to scheduled, memory-mapped
//! accelerator designs.

pub mod config;
pub mod context;
pub mod emit;
pub mod error;
pub mod eval;
pub mod ingest;
pub mod ir;
pub mod kernels;
pub mod memory;
pub mod pipeline;
pub mod quantize;
pub mod schedule;

pub use config::{BurstPolicy, HwConfig};
pub use context::CompileContext;
pub use emit::{Design, EmitBackend, ModuleHandle, Port, PortKind};
pub use error::{CompileError, CompileResult, Stage};
pub use ingest::GraphBuilder;
pub use pipeline::{compile, Compilation};
pub use quantize::{quantize, QuantizedGraph, ValueRanges};
pub use schedule::{apply_attributes, schedule, AttrRequest, AttrRequests, ScheduledGraph};
