//! The top-level [`Cpu`]: wires the register file, physical memory, I/O
//! bus, MMU, mode manager, and interrupt unit together and drives the
//! fetch-decode-execute loop (`spec.md` §4.7, §5).

use crate::config::CpuConfig;
use crate::decode::ByteStream;
use crate::errors::CoreError;
use crate::exec;
use crate::interrupt::InterruptUnit;
use crate::io::IoBus;
use crate::memory::{Access, PhysAddr, PhysicalMemory, VirtAddr};
use crate::mmu;
use crate::mmu::paging::setup_identity_paging;
use crate::mode::CpuMode;
use crate::registers::RegisterFile;

/// What a single [`Cpu::step`] accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// An instruction (or an interrupt delivery) ran; execution continues.
    Running,
    /// The core is halted and no interrupt is pending: `step` is a no-op
    /// until one is raised.
    Halted,
}

/// C3+C1+C2+C4+C8+C9, wired together: the full emulated processor.
pub struct Cpu {
    regs: RegisterFile,
    mem: PhysicalMemory,
    io: IoBus,
    interrupts: InterruptUnit,
    mode: CpuMode,
    halted: bool,
}

impl Cpu {
    #[must_use]
    pub fn new(config: CpuConfig) -> Self {
        let mut regs = RegisterFile::new();
        regs.set_rip(config.initial_rip);
        regs.write_gpr64(crate::registers::Gpr::Rsp, config.initial_rsp);

        Self {
            regs,
            mem: PhysicalMemory::new(config.memory_size),
            io: IoBus::new(),
            interrupts: InterruptUnit::new(),
            mode: CpuMode::Real,
            halted: false,
        }
    }

    #[must_use]
    pub fn registers(&self) -> &RegisterFile {
        &self.regs
    }

    #[must_use]
    pub fn memory(&self) -> &PhysicalMemory {
        &self.mem
    }

    #[must_use]
    pub fn memory_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.mem
    }

    #[must_use]
    pub fn io_bus_mut(&mut self) -> &mut IoBus {
        &mut self.io
    }

    #[must_use]
    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn raise_interrupt(&mut self, vector: u8) {
        self.interrupts.raise(vector);
    }

    /// Builds an identity page-table mapping and returns the PML4 physical
    /// address; callers load it into CR3 themselves via
    /// [`RegisterFile::set_cr3`] (`spec.md` §6).
    pub fn setup_identity_paging(
        &mut self,
        vstart: u64,
        pstart: u64,
        size_bytes: u64,
        tables_base: u64,
    ) -> Result<PhysAddr, CoreError> {
        setup_identity_paging(&mut self.mem, vstart, pstart, size_bytes, tables_base)
    }

    /// Recomputes [`CpuMode`] from CR0/CR4/EFER. Call after any write to
    /// those registers (`spec.md` §4.9); MOV-to-CR and WRMSR do this
    /// themselves inside `step`.
    pub fn recompute_mode(&mut self) {
        let derived = CpuMode::derive(&self.regs);
        if derived != self.mode {
            log::debug!("mode transition: {:?} -> {:?}", self.mode, derived);
        }
        self.mode = derived;
    }

    fn translate(&self, vaddr: VirtAddr, access: Access) -> Result<PhysAddr, CoreError> {
        mmu::translate(&self.mem, self.mode, self.regs.cr3(), vaddr, 1, access)
    }

    /// Reads `buf.len()` bytes starting at `vaddr`, translating one byte at
    /// a time so an access straddling a page boundary is split across the
    /// two pages' mappings rather than assumed contiguous in physical
    /// memory (`spec.md` §4.4 edge cases).
    fn read_virt_bytes(&mut self, vaddr: VirtAddr, buf: &mut [u8]) -> Result<(), CoreError> {
        for (i, slot) in buf.iter_mut().enumerate() {
            let addr = VirtAddr::new(vaddr.as_u64().wrapping_add(i as u64));
            let phys = self.translate(addr, Access::Read)?;
            *slot = self.mem.read_u8(phys)?;
        }
        Ok(())
    }

    fn write_virt_bytes(&mut self, vaddr: VirtAddr, data: &[u8]) -> Result<(), CoreError> {
        for (i, byte) in data.iter().enumerate() {
            let addr = VirtAddr::new(vaddr.as_u64().wrapping_add(i as u64));
            let phys = self.translate(addr, Access::Write)?;
            self.mem.write_u8(phys, *byte)?;
        }
        Ok(())
    }

    pub(crate) fn read_virt_sized(&mut self, vaddr: VirtAddr, size: u8) -> Result<u64, CoreError> {
        let mut buf = [0u8; 8];
        self.read_virt_bytes(vaddr, &mut buf[..size as usize])?;
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn write_virt_sized(&mut self, vaddr: VirtAddr, value: u64, size: u8) -> Result<(), CoreError> {
        let bytes = value.to_le_bytes();
        self.write_virt_bytes(vaddr, &bytes[..size as usize])
    }

    pub(crate) fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    pub(crate) fn regs_mut(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    pub(crate) fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    /// Runs one step of the algorithm in `spec.md` §4.7:
    ///
    /// 1. If IF is set and a vector is pending, deliver it — that alone is
    ///    the whole step.
    /// 2. Else if halted and nothing is pending, do nothing and report
    ///    [`StepOutcome::Halted`].
    /// 3. Else decode and execute exactly one instruction. A page fault
    ///    raised while doing so rewinds RIP and is delivered as vector 14
    ///    instead of propagating.
    pub fn step(&mut self) -> Result<StepOutcome, CoreError> {
        if self.regs.rflags().if_ {
            if let Some(vector) = self.interrupts.pop_pending() {
                self.deliver(vector, None)?;
                self.halted = false;
                return Ok(StepOutcome::Running);
            }
        }

        if self.halted {
            return Ok(StepOutcome::Halted);
        }

        let rip_start = self.regs.rip();
        match exec::decode_and_execute(self) {
            Ok(()) => Ok(StepOutcome::Running),
            Err(CoreError::PageFault { vaddr, error_code }) => {
                self.regs.set_rip(rip_start);
                self.regs.set_cr2(vaddr);
                self.deliver(14, Some(error_code))?;
                Ok(StepOutcome::Running)
            }
            Err(other) => Err(other),
        }
    }

    fn deliver(&mut self, vector: u8, error_code: Option<u64>) -> Result<(), CoreError> {
        let mode = self.mode;
        let cr3 = self.regs.cr3();
        let mut view = InterruptMemoryView { mem: &mut self.mem, mode, cr3 };
        crate::interrupt::deliver(&mut self.regs, vector, error_code, &mut view)
    }

    pub(crate) fn iretq(&mut self) -> Result<(), CoreError> {
        let mode = self.mode;
        let cr3 = self.regs.cr3();
        let mut view = InterruptMemoryView { mem: &mut self.mem, mode, cr3 };
        crate::interrupt::iretq(&mut self.regs, &mut view)
    }

    pub(crate) fn fetch_instruction_stream(&self) -> CodeFetcher<'_> {
        CodeFetcher {
            mem: &self.mem,
            regs: &self.regs,
            mode: self.mode,
            cr3: self.regs.cr3(),
            cursor: self.regs.rip(),
        }
    }
}

/// Adapts [`PhysicalMemory`] + the MMU to the [`crate::interrupt::VirtMemory`]
/// view the interrupt unit needs for gate lookups and stack pushes/pops.
struct InterruptMemoryView<'a> {
    mem: &'a mut PhysicalMemory,
    mode: CpuMode,
    cr3: u64,
}

impl<'a> crate::interrupt::VirtMemory for InterruptMemoryView<'a> {
    fn read_u64(&mut self, addr: u64) -> Result<u64, CoreError> {
        let phys = mmu::translate(self.mem, self.mode, self.cr3, VirtAddr::new(addr), 8, Access::Read)?;
        self.mem.read_u64(phys)
    }

    fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), CoreError> {
        let phys = mmu::translate(self.mem, self.mode, self.cr3, VirtAddr::new(addr), 8, Access::Write)?;
        self.mem.write_u64(phys, value)
    }
}

/// Pulls instruction bytes for the decoder, one at a time, through the MMU
/// with [`Access::Execute`]. Also carries a register-file reference so
/// ModR/M resolution can read base/index GPRs without a separate borrow of
/// the owning [`Cpu`].
pub(crate) struct CodeFetcher<'a> {
    mem: &'a PhysicalMemory,
    regs: &'a RegisterFile,
    mode: CpuMode,
    cr3: u64,
    cursor: u64,
}

impl<'a> CodeFetcher<'a> {
    pub(crate) fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Repositions the cursor to resume fetching from `addr`; used between
    /// executor sub-steps that each grab a fresh fetcher (`spec.md` §4.7).
    pub(crate) fn seek(&mut self, addr: u64) {
        self.cursor = addr;
    }

    pub(crate) fn regs(&self) -> &'a RegisterFile {
        self.regs
    }
}

impl<'a> ByteStream for CodeFetcher<'a> {
    fn fetch_u8(&mut self) -> Result<u8, CoreError> {
        let phys = mmu::translate(self.mem, self.mode, self.cr3, VirtAddr::new(self.cursor), 1, Access::Execute)?;
        let byte = self.mem.read_u8(phys)?;
        self.cursor += 1;
        Ok(byte)
    }

    fn current_addr(&self) -> u64 {
        self.cursor
    }
}
