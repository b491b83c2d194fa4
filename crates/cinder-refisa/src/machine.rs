//! Process state of a reference-ISA program: registers, flat little-endian memory and a minimal
//! system call interface.
//!
//! System calls are selected by `r0`:
//!
//! | `r0` | effect |
//! |------|--------|
//! | 0 | exit with status `r1` |
//! | 1 | append `r1` to the output log, `r0 = 0` |
//! | other | `r0 = 0xffff_ffff` |

use cinder_dbt::ir::MemSize;
use cinder_dbt::{CodeSource, GuestAddr, GuestFault, ProcessState, RegId};
use thiserror::Error;
use tracing::{debug, trace};

use crate::isa::{FLAGS, MASK32, REG_COUNT};

pub const SYS_EXIT: u32 = 0;
pub const SYS_WRITE: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("image of {len} bytes at {addr:#x} does not fit in {mem_size} bytes of memory")]
    ImageTooLarge {
        addr: GuestAddr,
        len: usize,
        mem_size: usize,
    },
}

#[derive(Clone, Debug)]
pub struct RefMachine {
    regs: [u32; REG_COUNT],
    pc: GuestAddr,
    mem: Vec<u8>,
    exit_status: Option<u32>,
    output: Vec<u32>,
    syscalls: u64,
}

impl RefMachine {
    pub fn new(mem_size: usize) -> Self {
        Self {
            regs: [0; REG_COUNT],
            pc: 0,
            mem: vec![0; mem_size],
            exit_status: None,
            output: Vec::new(),
            syscalls: 0,
        }
    }

    /// Machine with `image` loaded at `addr` and the pc pointing at it.
    pub fn with_image(mem_size: usize, addr: GuestAddr, image: &[u8]) -> Result<Self, MachineError> {
        let mut machine = Self::new(mem_size);
        machine.load_image(addr, image)?;
        machine.pc = addr;
        Ok(machine)
    }

    pub fn load_image(&mut self, addr: GuestAddr, image: &[u8]) -> Result<(), MachineError> {
        let too_large = MachineError::ImageTooLarge {
            addr,
            len: image.len(),
            mem_size: self.mem.len(),
        };
        let start = usize::try_from(addr).map_err(|_| too_large.clone())?;
        let end = start
            .checked_add(image.len())
            .filter(|end| *end <= self.mem.len())
            .ok_or(too_large)?;
        self.mem[start..end].copy_from_slice(image);
        Ok(())
    }

    pub fn reg(&self, reg: RegId) -> u32 {
        self.regs[reg.index()]
    }

    pub fn set_reg(&mut self, reg: RegId, value: u32) {
        self.regs[reg.index()] = value;
    }

    pub fn regs(&self) -> &[u32] {
        &self.regs
    }

    pub fn flags(&self) -> u32 {
        self.regs[FLAGS.index()]
    }

    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }

    pub fn output(&self) -> &[u32] {
        &self.output
    }

    pub fn syscalls(&self) -> u64 {
        self.syscalls
    }

    pub fn memory(&self) -> &[u8] {
        &self.mem
    }

    fn range(&self, addr: GuestAddr, len: usize) -> Result<std::ops::Range<usize>, GuestFault> {
        let fault = GuestFault::MemoryFault { addr };
        let start = usize::try_from(addr).map_err(|_| fault.clone())?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.mem.len())
            .ok_or(fault)?;
        Ok(start..end)
    }

    pub fn load_u32(&self, addr: GuestAddr) -> Result<u32, GuestFault> {
        let r = self.range(addr, 4)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.mem[r]);
        Ok(u32::from_le_bytes(word))
    }

    pub fn store_u32(&mut self, addr: GuestAddr, value: u32) -> Result<(), GuestFault> {
        let r = self.range(addr, 4)?;
        self.mem[r].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

impl CodeSource for RefMachine {
    fn fetch(&self, pc: GuestAddr, buf: &mut [u8]) -> usize {
        let Ok(start) = usize::try_from(pc) else {
            return 0;
        };
        let Some(avail) = self.mem.get(start..) else {
            return 0;
        };
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        n
    }
}

impl ProcessState for RefMachine {
    fn pc(&self) -> GuestAddr {
        self.pc
    }

    fn set_pc(&mut self, pc: GuestAddr) {
        self.pc = pc & MASK32;
    }

    fn finished(&self) -> bool {
        self.exit_status.is_some()
    }

    fn read_reg(&self, reg: RegId) -> u64 {
        u64::from(self.reg(reg))
    }

    fn write_reg(&mut self, reg: RegId, value: u64) {
        self.set_reg(reg, value as u32);
    }

    fn load(&self, addr: GuestAddr, size: MemSize) -> Result<u64, GuestFault> {
        let r = self.range(addr, size.bytes())?;
        let mut buf = [0u8; 8];
        buf[..size.bytes()].copy_from_slice(&self.mem[r]);
        Ok(u64::from_le_bytes(buf))
    }

    fn store(&mut self, addr: GuestAddr, value: u64, size: MemSize) -> Result<(), GuestFault> {
        let r = self.range(addr, size.bytes())?;
        self.mem[r].copy_from_slice(&value.to_le_bytes()[..size.bytes()]);
        Ok(())
    }

    fn system_call(&mut self) {
        self.syscalls += 1;
        let number = self.regs[0];
        let arg = self.regs[1];
        trace!(target: "cinder_refisa::machine", number, arg, "system call");
        match number {
            SYS_EXIT => {
                debug!(target: "cinder_refisa::machine", "guest exited with status {arg}");
                self.exit_status = Some(arg);
            }
            SYS_WRITE => {
                self.output.push(arg);
                self.regs[0] = 0;
            }
            _ => self.regs[0] = u32::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_must_fit() {
        assert!(RefMachine::with_image(16, 0, &[0; 16]).is_ok());
        assert_eq!(
            RefMachine::with_image(16, 4, &[0; 16]).unwrap_err(),
            MachineError::ImageTooLarge {
                addr: 4,
                len: 16,
                mem_size: 16
            }
        );
    }

    #[test]
    fn out_of_range_access_faults() {
        let mut m = RefMachine::new(8);
        m.store_u32(4, 0xdead_beef).unwrap();
        assert_eq!(m.load_u32(4), Ok(0xdead_beef));
        assert_eq!(m.load_u32(6), Err(GuestFault::MemoryFault { addr: 6 }));
        assert_eq!(
            m.store(u64::MAX, 0, MemSize::U8),
            Err(GuestFault::MemoryFault { addr: u64::MAX })
        );
    }

    #[test]
    fn fetch_reports_short_reads() {
        let m = RefMachine::new(6);
        let mut buf = [0xaa; 4];
        assert_eq!(m.fetch(4, &mut buf), 2);
        assert_eq!(m.fetch(6, &mut buf), 0);
        assert_eq!(m.fetch(100, &mut buf), 0);
    }

    #[test]
    fn exit_and_write_system_calls() {
        let mut m = RefMachine::new(4);
        m.set_reg(RegId(0), SYS_WRITE);
        m.set_reg(RegId(1), 42);
        m.system_call();
        assert_eq!(m.output(), &[42]);
        assert_eq!(m.reg(RegId(0)), 0);
        assert!(!m.finished());

        m.set_reg(RegId(1), 3);
        m.system_call();
        assert!(m.finished());
        assert_eq!(m.exit_status(), Some(3));
    }
}
