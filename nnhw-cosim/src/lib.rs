//! Bit-exact co-simulation of compiled accelerator designs.
//!
//! A design compiled by `nnhw_compiler` is emitted into a simulated module,
//! driven through the control protocol against a memory image, and its outputs
//! are compared with the fixed-point reference.

pub mod behavioral;
pub mod clock;
pub mod config;
pub mod error;
pub mod hardware;
pub mod memory;
pub mod protocol;
pub mod scenario;
pub mod stimulus;
pub mod verifier;

pub use behavioral::{BehavioralBackend, BehavioralModule};
pub use clock::{Clock, CycleClock};
pub use config::SimConfig;
pub use error::{SimError, SimResult};
pub use hardware::Dut;
pub use memory::MemoryImage;
pub use stimulus::Stimulus;
pub use verifier::{Mismatch, Verdict, Verifier, VerifierState, VerifyReport};
