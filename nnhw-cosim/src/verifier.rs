//! Co-simulation verifier.
//!
//! Drives one emitted module through a single run and compares what it wrote
//! against the reference results, element by element:
//!
//! ```text
//! Idle ─address─▶ Addressed ─start─▶ Running ─wait─▶ Waiting ─▶ Verifying ─verify─▶ Done(Passed | Failed)
//! ```
//!
//! 1. **address**: hold the module in reset for the warm-up cycles, write
//!    inputs, the parameter blob, and the references into the memory image,
//!    program the control registers, then write-protect everything the module
//!    only reads
//! 2. **start**: strobe `START`
//! 3. **wait**: clock the module until `STATUS.done`, or fail with a timeout
//! 4. **verify**: exact comparison over every output's logical shape
//!
//! Each step is only valid from its source state.

use std::fmt;
use std::sync::Arc;

use nnhw_compiler::emit::{Design, CLOCK_PORT, CONTROL_PORT, DATA_PORT, RESET_PORT};
use nnhw_compiler::memory::RegionKind;

use crate::clock::Clock;
use crate::config::SimConfig;
use crate::error::{SimError, SimResult};
use crate::hardware::Dut;
use crate::memory::MemoryImage;
use crate::protocol::{
    REG_GLOBAL_ADDR, REG_HANDSHAKE_ADDR, REG_START, REG_STATUS, START_STROBE, STATUS_DONE,
};
use crate::stimulus::Stimulus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Passed => f.write_str("PASSED"),
            Verdict::Failed => f.write_str("FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierState {
    Idle,
    Addressed,
    Running,
    Waiting,
    Verifying,
    Done(Verdict),
}

impl fmt::Display for VerifierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifierState::Idle => f.write_str("idle"),
            VerifierState::Addressed => f.write_str("addressed"),
            VerifierState::Running => f.write_str("running"),
            VerifierState::Waiting => f.write_str("waiting"),
            VerifierState::Verifying => f.write_str("verifying"),
            VerifierState::Done(verdict) => write!(f, "done ({verdict})"),
        }
    }
}

/// One output element that differs from its reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub output: String,
    /// Logical row-major index.
    pub index: usize,
    pub expected: i64,
    pub actual: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub module: String,
    /// Cycles from the start strobe to `STATUS.done`.
    pub cycles: u64,
    /// Operators the module reported complete through the handshake word.
    /// Advisory only; the verdict rests on the element comparison.
    pub handshake: u32,
    /// Output elements compared.
    pub checked: usize,
    pub mismatches: Vec<Mismatch>,
    pub verdict: Verdict,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Passed
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# execution cycles: {}", self.cycles)?;
        write!(f, "# verify: {}", self.verdict)
    }
}

fn register(value: u64, what: &str) -> SimResult<u32> {
    u32::try_from(value)
        .map_err(|_| SimError::Config(format!("{what} {value:#x} does not fit a control register")))
}

pub struct Verifier<D, C> {
    design: Arc<Design>,
    dut: D,
    clock: C,
    config: SimConfig,
    stimulus: Stimulus,
    image: MemoryImage,
    state: VerifierState,
    started_at: u64,
    cycles: u64,
    handshake: u32,
}

impl<D: Dut, C: Clock> Verifier<D, C> {
    /// Resolve the module's ports and allocate the memory image.
    pub fn new(
        design: Arc<Design>,
        dut: D,
        clock: C,
        stimulus: Stimulus,
        config: SimConfig,
    ) -> SimResult<Self> {
        config.validate()?;
        for port in [CONTROL_PORT, DATA_PORT, CLOCK_PORT, RESET_PORT] {
            if dut.port(port).is_none() {
                return Err(SimError::MissingPort {
                    module: dut.name().to_string(),
                    port: port.to_string(),
                });
            }
        }
        let data = dut.port(DATA_PORT).map_or(0, |p| p.width);
        if data != design.config.bus_width {
            return Err(SimError::Config(format!(
                "`{DATA_PORT}` is {data} bits wide, design expects {}",
                design.config.bus_width
            )));
        }
        let image = MemoryImage::new(design.memory.end, config.fill_byte);
        Ok(Verifier {
            design,
            dut,
            clock,
            config,
            stimulus,
            image,
            state: VerifierState::Idle,
            started_at: 0,
            cycles: 0,
            handshake: 0,
        })
    }

    pub fn state(&self) -> VerifierState {
        self.state
    }

    pub fn image(&self) -> &MemoryImage {
        &self.image
    }

    pub fn dut(&self) -> &D {
        &self.dut
    }

    fn require(&self, want: VerifierState, action: &'static str) -> SimResult<()> {
        if self.state == want {
            Ok(())
        } else {
            Err(SimError::InvalidTransition {
                state: self.state.to_string(),
                action,
            })
        }
    }

    /// Idle → Addressed.
    pub fn address(&mut self) -> SimResult<()> {
        self.require(VerifierState::Idle, "address")?;
        let design = Arc::clone(&self.design);
        let graph = &design.graph;

        self.dut.reset();
        for _ in 0..self.config.warmup_cycles {
            self.clock.tick();
            self.dut.step(&mut self.image)?;
        }

        for id in design.inputs() {
            let t = graph.tensor(id);
            let (Some(addr), Some(values)) = (t.addr(), self.stimulus.inputs.get(&id)) else {
                return Err(SimError::Layout {
                    tensor: t.name.clone(),
                    reason: "input has no address or no stimulus".into(),
                });
            };
            self.image.load_tensor(addr, t, values)?;
            log::debug!(
                "input `{}` at {addr:#x}, row stride {}",
                t.name,
                t.aligned.as_ref().map_or(0, |a| a.lanes)
            );
        }
        self.image.write(design.param_base()?, &design.param_blob)?;
        for &(id, addr) in &design.memory.reference {
            let t = graph.tensor(id);
            let values = self.stimulus.reference(id).ok_or_else(|| SimError::Layout {
                tensor: t.name.clone(),
                reason: "no reference values".into(),
            })?;
            self.image.load_tensor(addr, t, values)?;
        }

        let handshake = design.memory.handshake_addr;
        self.image.write_u32(handshake, 0)?;
        self.dut
            .write_control(REG_GLOBAL_ADDR, register(design.scratch_base()?, "scratch base")?)?;
        self.dut
            .write_control(REG_HANDSHAKE_ADDR, register(handshake, "handshake address")?)?;

        for id in design.inputs() {
            let t = graph.tensor(id);
            if let Some(addr) = t.addr() {
                self.image.protect(format!("input {}", t.name), addr, t.memory_size());
            }
        }
        for (kind, name) in [
            (RegionKind::Parameters, "parameters"),
            (RegionKind::Reference, "reference"),
        ] {
            let region = design.memory.region(kind)?;
            self.image.protect(name, region.base, region.size);
        }

        log::info!("addressed `{}`", self.dut.name());
        self.state = VerifierState::Addressed;
        Ok(())
    }

    /// Addressed → Running.
    pub fn start(&mut self) -> SimResult<()> {
        self.require(VerifierState::Addressed, "start")?;
        self.dut.write_control(REG_START, START_STROBE)?;
        self.started_at = self.clock.cycles();
        self.state = VerifierState::Running;
        Ok(())
    }

    /// Running → Waiting → Verifying. Returns the cycles the module took.
    pub fn wait(&mut self) -> SimResult<u64> {
        self.require(VerifierState::Running, "wait")?;
        self.state = VerifierState::Waiting;
        loop {
            let now = self.clock.tick();
            self.dut.step(&mut self.image)?;
            let elapsed = now.saturating_sub(self.started_at);
            if self.dut.read_control(REG_STATUS)? & STATUS_DONE != 0 {
                self.cycles = elapsed;
                break;
            }
            if elapsed >= self.config.max_cycles {
                log::error!("`{}` still busy after {elapsed} cycles", self.dut.name());
                return Err(SimError::Timeout {
                    module: self.dut.name().to_string(),
                    cycles: elapsed,
                });
            }
        }

        let counter = self.image.read_u32(self.design.memory.handshake_addr)?;
        self.handshake = counter;
        if counter as usize != self.design.graph.ops.len() {
            log::warn!(
                "handshake counter is {counter}, expected {}",
                self.design.graph.ops.len()
            );
        }
        self.image.unprotect_all();
        log::info!("`{}` finished in {} cycles", self.dut.name(), self.cycles);
        self.state = VerifierState::Verifying;
        Ok(self.cycles)
    }

    /// Verifying → Done.
    pub fn verify(&mut self) -> SimResult<VerifyReport> {
        self.require(VerifierState::Verifying, "verify")?;
        let graph = &self.design.graph;
        let mut mismatches = Vec::new();
        let mut checked = 0;
        for &(id, ref_addr) in &self.design.memory.reference {
            let t = graph.tensor(id);
            let addr = t.addr().ok_or_else(|| SimError::Layout {
                tensor: t.name.clone(),
                reason: "output has no address".into(),
            })?;
            let actual = self.image.read_tensor(addr, t)?;
            let expected = self.image.read_tensor(ref_addr, t)?;
            checked += actual.len();
            for (index, (&a, &e)) in actual.iter().zip(&expected).enumerate() {
                if a != e {
                    log::debug!("{}[{index}]: expected {e}, got {a}", t.name);
                    mismatches.push(Mismatch {
                        output: t.name.clone(),
                        index,
                        expected: e,
                        actual: a,
                    });
                }
            }
        }

        let verdict = if mismatches.is_empty() {
            Verdict::Passed
        } else {
            log::warn!("{} of {checked} elements differ", mismatches.len());
            Verdict::Failed
        };
        self.state = VerifierState::Done(verdict);
        Ok(VerifyReport {
            module: self.dut.name().to_string(),
            cycles: self.cycles,
            handshake: self.handshake,
            checked,
            mismatches,
            verdict,
        })
    }

    /// All four steps in order.
    pub fn run(&mut self) -> SimResult<VerifyReport> {
        self.address()?;
        self.start()?;
        self.wait()?;
        self.verify()
    }
}
