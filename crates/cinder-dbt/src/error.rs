use thiserror::Error;

use crate::arch::GuestAddr;
use crate::ir::BlockId;

/// Fault visible to the guest program. Recoverable: it terminates the current path only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestFault {
    #[error("bad instruction at {pc:#x}: [{}]", hex_bytes(.bytes))]
    BadInstruction { pc: GuestAddr, bytes: Vec<u8> },
    #[error("memory fault at {addr:#x}")]
    MemoryFault { addr: GuestAddr },
}

impl GuestFault {
    /// Build a [`GuestFault::BadInstruction`] from the raw bytes at the faulting pc.
    pub fn bad_instruction(pc: GuestAddr, bytes: &[u8]) -> Self {
        GuestFault::BadInstruction {
            pc,
            bytes: bytes.to_vec(),
        }
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("a compiled trace for {pc:#x} is already cached")]
    DuplicateEntry { pc: GuestAddr },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("decoder reported no successor for {pc:#x} but left block {block} unterminated")]
    UnterminatedPath { pc: GuestAddr, block: u32 },
    #[error("finished trace at {entry:#x} has an unterminated or unresolved block {}", .block.0)]
    UnresolvedEdge { entry: GuestAddr, block: BlockId },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenError {
    #[error("host code generator rejected trace at {entry:#x}: {reason}")]
    Rejected { entry: GuestAddr, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("guest fault: {0}")]
    Fault(#[from] GuestFault),
    #[error("translation failed: {0}")]
    Translate(#[from] TranslateError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_instruction_reports_pc_and_bytes() {
        let fault = GuestFault::bad_instruction(0x1004, &[0xff, 0x01, 0x00, 0x7f]);
        assert_eq!(
            fault.to_string(),
            "bad instruction at 0x1004: [ff 01 00 7f]"
        );
    }
}
