//! Co-simulation error taxonomy.
//!
//! Compilation failures are wrapped unchanged. Everything else is raised by
//! the verifier, the memory image, or the hardware model. A mismatching output
//! is not an error: it ends up in the [`VerifyReport`](crate::verifier::VerifyReport).

use nnhw_compiler::CompileError;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// The design did not signal completion within the cycle bound.
    #[error("simulation of `{module}` timed out after {cycles} cycles")]
    Timeout { module: String, cycles: u64 },

    /// A verifier step was requested from the wrong state.
    #[error("cannot {action} while the verifier is {state}")]
    InvalidTransition { state: String, action: &'static str },

    #[error("module `{module}` has no `{port}` port")]
    MissingPort { module: String, port: String },

    #[error("access of {len} bytes at {addr:#x} is outside the {size} byte memory image")]
    OutOfBounds { addr: u64, len: u64, size: u64 },

    /// The hardware wrote into a region that is read-only during simulation.
    #[error("write at {addr:#x} hits protected `{region}`")]
    ProtectedWrite { region: String, addr: u64 },

    /// Control register offset not in the register map.
    #[error("unknown control register {0:#x}")]
    UnknownRegister(u32),

    /// A tensor cannot be placed in or read from the memory image.
    #[error("layout error for tensor `{tensor}`: {reason}")]
    Layout { tensor: String, reason: String },

    #[error("invalid simulation config: {0}")]
    Config(String),
}

pub type SimResult<T> = Result<T, SimError>;
