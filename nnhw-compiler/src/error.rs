//! Compiler error taxonomy.
//!
//! Every variant is fatal for the compilation it was raised in and names the
//! offending tensor, operator, or region together with the violated constraint.

use std::fmt;

/// Pipeline stage that raised an error. Stages run strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Ingest,
    Quantize,
    Schedule,
    Allocate,
    Emit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Ingest => "ingest",
            Stage::Quantize => "quantize",
            Stage::Schedule => "schedule",
            Stage::Allocate => "allocate",
            Stage::Emit => "emit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// Structural problem while building or querying the graph.
    #[error("graph error: {0}")]
    Graph(String),

    /// Invalid hardware configuration record.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No numeric range could be declared, observed, or propagated for a tensor.
    #[error("range inference failed for tensor `{tensor}`: {reason}")]
    RangeInference { tensor: String, reason: String },

    /// The declared dtype is narrower than the configured value range requires.
    #[error("tensor `{tensor}` needs {needed} bits for its value range but is declared {declared} bits wide")]
    BitWidth {
        tensor: String,
        needed: u32,
        declared: u32,
    },

    /// A parallelism or burst-alignment constraint was violated.
    #[error("invalid attributes for operator `{op}`: {bound}")]
    AttributeValidation { op: String, bound: String },

    /// The memory image would grow past the configured bound.
    #[error("address overflow while placing `{entity}`: end offset {end:#x} exceeds memory bound {bound:#x}")]
    AddressOverflow { entity: String, end: u64, bound: u64 },

    /// The emission backend refused the design.
    #[error("emission of module `{module}` failed: {reason}")]
    Emit { module: String, reason: String },
}

impl CompileError {
    pub fn range(tensor: impl Into<String>, reason: impl Into<String>) -> Self {
        CompileError::RangeInference {
            tensor: tensor.into(),
            reason: reason.into(),
        }
    }

    pub fn attribute(op: impl Into<String>, bound: impl Into<String>) -> Self {
        CompileError::AttributeValidation {
            op: op.into(),
            bound: bound.into(),
        }
    }

    /// Stage that raised this error.
    pub fn stage(&self) -> Stage {
        match self {
            CompileError::Graph(_) | CompileError::Config(_) => Stage::Ingest,
            CompileError::RangeInference { .. } | CompileError::BitWidth { .. } => {
                Stage::Quantize
            }
            CompileError::AttributeValidation { .. } => Stage::Schedule,
            CompileError::AddressOverflow { .. } => Stage::Allocate,
            CompileError::Emit { .. } => Stage::Emit,
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;
