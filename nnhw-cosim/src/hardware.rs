//! Device-under-test interface driven by the verifier.

use nnhw_compiler::ModuleHandle;

use crate::error::{SimError, SimResult};
use crate::memory::MemoryImage;
use crate::protocol::{
    reg_name, REG_GLOBAL_ADDR, REG_HANDSHAKE_ADDR, REG_START, REG_STATUS, START_STROBE,
    STATUS_BUSY,
};

/// A simulated module: control registers on `saxi`, the memory image on
/// `maxi`, and one [`step`](Dut::step) per rising edge of `CLK`.
pub trait Dut: ModuleHandle {
    /// Pulse `RESETN` low: clears registers and any in-flight work.
    fn reset(&mut self);

    fn write_control(&mut self, reg: u32, value: u32) -> SimResult<()>;

    fn read_control(&self, reg: u32) -> SimResult<u32>;

    /// Advance one clock edge.
    fn step(&mut self, mem: &mut MemoryImage) -> SimResult<()>;
}

/// The register file every module exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlRegs {
    /// Latched start request, consumed by the module on its next edge.
    pub start: bool,
    pub status: u32,
    pub global_addr: u32,
    pub handshake_addr: u32,
}

impl ControlRegs {
    pub fn write(&mut self, reg: u32, value: u32) -> SimResult<()> {
        log::debug!("saxi write {} = {value:#x}", reg_name(reg));
        match reg {
            // a start while busy is ignored, like the hardware does
            REG_START => self.start = value & START_STROBE != 0 && self.status & STATUS_BUSY == 0,
            REG_GLOBAL_ADDR => self.global_addr = value,
            REG_HANDSHAKE_ADDR => self.handshake_addr = value,
            // read-only
            REG_STATUS => {}
            _ => return Err(SimError::UnknownRegister(reg)),
        }
        Ok(())
    }

    pub fn read(&self, reg: u32) -> SimResult<u32> {
        match reg {
            REG_START => Ok(self.start as u32),
            REG_STATUS => Ok(self.status),
            REG_GLOBAL_ADDR => Ok(self.global_addr),
            REG_HANDSHAKE_ADDR => Ok(self.handshake_addr),
            _ => Err(SimError::UnknownRegister(reg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_read_only() {
        let mut regs = ControlRegs::default();
        regs.write(REG_STATUS, 0xff).unwrap();
        assert_eq!(regs.read(REG_STATUS).unwrap(), 0);
    }

    #[test]
    fn start_ignored_while_busy() {
        let mut regs = ControlRegs::default();
        regs.write(REG_START, START_STROBE).unwrap();
        assert!(regs.start);
        regs.start = false;
        regs.status = STATUS_BUSY;
        regs.write(REG_START, START_STROBE).unwrap();
        assert!(!regs.start);
    }

    #[test]
    fn unknown_register() {
        let mut regs = ControlRegs::default();
        assert!(matches!(regs.write(0x40, 1), Err(SimError::UnknownRegister(0x40))));
        assert!(regs.read(0x44).is_err());
    }
}
