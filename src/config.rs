//! Construction-time configuration for a [`crate::cpu::Cpu`].
//!
//! The host owns the main loop and the boot image (`spec.md` §6); all the
//! core needs up front is how big its physical memory is and where
//! execution starts. Grouping that into one descriptor, rather than a
//! positional argument list on `Cpu::new`, keeps the constructor stable as
//! more initial-state knobs get added.

/// Initial state for a freshly constructed [`crate::cpu::Cpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuConfig {
    /// Size in bytes of the flat physical memory buffer (C1).
    pub memory_size: usize,

    /// Initial value of RIP. The canonical boot scenario uses `0x7C00`.
    pub initial_rip: u64,

    /// Initial value of RSP. `0` lets a boot sector set its own stack before
    /// the first PUSH/CALL.
    pub initial_rsp: u64,
}

impl Default for CpuConfig {
    /// One megabyte of memory, RIP parked at the canonical boot sector
    /// load address, no stack configured yet.
    fn default() -> Self {
        Self {
            memory_size: 1 << 20,
            initial_rip: 0x7C00,
            initial_rsp: 0,
        }
    }
}

impl CpuConfig {
    /// Convenience constructor for the common case of only needing to pick
    /// a memory size.
    #[must_use]
    pub fn with_memory_size(memory_size: usize) -> Self {
        Self {
            memory_size,
            ..Self::default()
        }
    }
}
