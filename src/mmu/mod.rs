//! MMU / translator (C4): maps virtual to physical addresses using the
//! current CPU mode and paging state, raising page faults on failure.

pub mod paging;

use crate::errors::CoreError;
use crate::memory::{Access, PhysAddr, PhysicalMemory, VirtAddr};
use crate::mode::CpuMode;
use paging::{PageTableEntry, PAGE_SIZE_1G, PAGE_SIZE_2M, PAGE_SIZE_4K};

/// Translates `vaddr` for an access of `size` bytes, per `spec.md` §4.4.
///
/// - In [`CpuMode::Real`], translation is the identity.
/// - When paging is not fully armed for long mode (mode isn't
///   [`CpuMode::Long`], i.e. any of PG/PAE/LME is still clear), translation
///   is also the identity, but a warning is logged — this lets bootstrap
///   code run before its own paging setup executes.
/// - In [`CpuMode::Long`], a real 4-level walk is performed.
pub fn translate(
    mem: &PhysicalMemory,
    mode: CpuMode,
    cr3: u64,
    vaddr: VirtAddr,
    size: u8,
    access: Access,
) -> Result<PhysAddr, CoreError> {
    let _ = size; // informational: callers are responsible for per-page splitting.

    match mode {
        CpuMode::Real => Ok(PhysAddr::new(vaddr.as_u64())),
        CpuMode::Long => walk(mem, cr3, vaddr, access),
        _ => {
            log::warn!(
                "mmu: paging not armed in mode {mode:?}, treating {vaddr} as identity-mapped"
            );
            Ok(PhysAddr::new(vaddr.as_u64()))
        }
    }
}

fn walk(
    mem: &PhysicalMemory,
    cr3: u64,
    vaddr: VirtAddr,
    access: Access,
) -> Result<PhysAddr, CoreError> {
    let raw = vaddr.as_u64();
    let pml4_index = (raw >> 39) & 0x1FF;
    let pdpt_index = (raw >> 30) & 0x1FF;
    let pd_index = (raw >> 21) & 0x1FF;
    let pt_index = (raw >> 12) & 0x1FF;

    let pml4_base = PhysAddr::new(cr3 & !0xFFF);
    let pml4_entry = read_entry(mem, pml4_base, pml4_index)?;
    ensure_present(pml4_entry, vaddr)?;

    let pdpt_base = PhysAddr::new(pml4_entry.frame_addr());
    let pdpt_entry = read_entry(mem, pdpt_base, pdpt_index)?;
    ensure_present(pdpt_entry, vaddr)?;
    if pdpt_entry.page_size() {
        ensure_writable(pdpt_entry, access, vaddr)?;
        let offset = raw & (PAGE_SIZE_1G - 1);
        return Ok(PhysAddr::new(pdpt_entry.frame_addr() + offset));
    }

    let pd_base = PhysAddr::new(pdpt_entry.frame_addr());
    let pd_entry = read_entry(mem, pd_base, pd_index)?;
    ensure_present(pd_entry, vaddr)?;
    if pd_entry.page_size() {
        ensure_writable(pd_entry, access, vaddr)?;
        let offset = raw & (PAGE_SIZE_2M - 1);
        return Ok(PhysAddr::new(pd_entry.frame_addr() + offset));
    }

    let pt_base = PhysAddr::new(pd_entry.frame_addr());
    let pt_entry = read_entry(mem, pt_base, pt_index)?;
    ensure_present(pt_entry, vaddr)?;
    ensure_writable(pt_entry, access, vaddr)?;

    let offset = raw & (PAGE_SIZE_4K - 1);
    Ok(PhysAddr::new(pt_entry.frame_addr() + offset))
}

fn read_entry(mem: &PhysicalMemory, table_base: PhysAddr, index: u64) -> Result<PageTableEntry, CoreError> {
    let raw = mem.read_u64(table_base + index * 8)?;
    Ok(PageTableEntry::from_u64(raw))
}

fn ensure_present(entry: PageTableEntry, vaddr: VirtAddr) -> Result<(), CoreError> {
    if entry.present() {
        Ok(())
    } else {
        Err(CoreError::PageFault {
            vaddr: vaddr.as_u64(),
            error_code: 0,
        })
    }
}

fn ensure_writable(entry: PageTableEntry, access: Access, vaddr: VirtAddr) -> Result<(), CoreError> {
    if access == Access::Write && !entry.writable() {
        Err(CoreError::PageFault {
            vaddr: vaddr.as_u64(),
            error_code: 1,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::paging::setup_identity_paging;

    #[test]
    fn long_mode_identity_map_round_trips() {
        let mut mem = PhysicalMemory::new(0x30_0000);
        let pml4 = setup_identity_paging(&mut mem, 0, 0, 0x20_0000, 0x10_0000).unwrap();

        for offset in [0u64, 0x1000, 0x7C00, 0x1F_F000] {
            let phys = translate(&mem, CpuMode::Long, pml4.as_u64(), VirtAddr::new(offset), 1, Access::Execute)
                .unwrap();
            assert_eq!(phys.as_u64(), offset);
        }
    }

    #[test]
    fn unmapped_address_raises_page_fault_with_code_zero() {
        let mut mem = PhysicalMemory::new(0x30_0000);
        let pml4 = setup_identity_paging(&mut mem, 0, 0, 0x20_0000, 0x10_0000).unwrap();

        let err = translate(&mem, CpuMode::Long, pml4.as_u64(), VirtAddr::new(0x40_0000), 1, Access::Read)
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::PageFault { vaddr: 0x40_0000, error_code: 0 }
        );
    }

    #[test]
    fn non_long_mode_is_identity_with_no_table_walk() {
        let mem = PhysicalMemory::new(0x10_000);
        let phys = translate(&mem, CpuMode::Protected, 0, VirtAddr::new(0x1234), 1, Access::Read).unwrap();
        assert_eq!(phys.as_u64(), 0x1234);
    }
}
