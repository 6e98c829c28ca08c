//! Error taxonomy for the core.
//!
//! Every fallible operation in the memory, register, MMU, decoder,
//! executor, and interrupt components returns [`CoreError`]. Variants are
//! siblings, not a chain — nothing here wraps another `CoreError`, mirroring
//! the flat per-component error enums the rest of this codebase favors.

use thiserror::Error;

/// The single error type threaded through the core.
///
/// [`CoreError::PageFault`] is the only variant [`crate::cpu::Cpu::step`]
/// catches itself; every other variant is fatal and propagates unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Translation failed; `error_code` follows the x86 #PF convention
    /// (bit 0 = present, bit 1 = write).
    #[error("page fault at {vaddr:#018x} (error code {error_code:#x})")]
    PageFault { vaddr: u64, error_code: u64 },

    /// A memory access (after translation) fell outside the backing buffer.
    #[error("out of bounds access at {addr:#018x} ({len} bytes)")]
    OutOfBounds { addr: u64, len: usize },

    /// The decoder reached a byte sequence with no matching handler.
    #[error("unknown opcode at {rip:#018x}: {bytes:02x?}")]
    UnknownOpcode { rip: u64, bytes: Vec<u8> },

    /// A register index or name did not resolve to a known register.
    #[error("bad register index {index}")]
    BadRegister { index: u8 },

    /// An operand size outside {1, 2, 4, 8} reached a register/ALU op.
    #[error("bad operand size {size}")]
    BadOperandSize { size: u8 },

    /// The IDT gate for a delivered vector was not present.
    #[error("double fault delivering vector {vector}")]
    DoubleFault { vector: u8 },

    /// An I/O device misbehaved; devices must not panic, but if the host's
    /// device implementation reports failure, it surfaces here.
    #[error("I/O error: {0}")]
    Io(String),
}
