//! x86 page-table entry format and the host-facing
//! [`setup_identity_paging`] helper (`spec.md` §6).
//!
//! Page tables are guest data: they live inside the emulated
//! [`PhysicalMemory`] buffer like any other memory the guest can read or
//! write, so they are encoded/decoded as raw 64-bit entries rather than
//! modeled as a host-side structure the way a real kernel's own page
//! tables would be.

use modular_bitfield::bitfield;
use modular_bitfield::prelude::B51;

use crate::errors::CoreError;
use crate::memory::PhysAddr;
use crate::memory::PhysicalMemory;

pub const PAGE_SIZE_4K: u64 = 1 << 12;
pub const PAGE_SIZE_2M: u64 = 1 << 21;
pub const PAGE_SIZE_1G: u64 = 1 << 30;

/// Flag bits of a page-table entry. The physical frame address (bits
/// 12..=51) is kept out of this bitfield and masked in/out of the raw
/// entry directly, the way [`PageTableEntry`] does it.
#[bitfield]
#[derive(Clone, Copy, Default)]
#[repr(u64)]
pub struct PageTableFlags {
    pub present: bool,
    pub writable: bool,
    pub user_accessible: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub page_size: bool,
    pub global: bool,
    #[skip]
    __: B51,
}

/// A single 64-bit paging-structure entry, at any of the four levels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageTableEntry {
    entry: u64,
}

impl PageTableEntry {
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    #[must_use]
    pub fn from_u64(raw: u64) -> Self {
        Self { entry: raw }
    }

    #[must_use]
    pub fn to_u64(self) -> u64 {
        self.entry
    }

    #[must_use]
    pub fn present(self) -> bool {
        self.entry & 0x1 != 0
    }

    #[must_use]
    pub fn writable(self) -> bool {
        self.entry & 0x2 != 0
    }

    #[must_use]
    pub fn page_size(self) -> bool {
        self.entry & 0x80 != 0
    }

    /// The physical frame this entry points to (for a leaf, the mapped
    /// page; for a non-leaf, the next-level table).
    #[must_use]
    pub fn frame_addr(self) -> u64 {
        self.entry & Self::ADDR_MASK
    }

    #[must_use]
    pub fn new(frame_addr: u64, flags: PageTableFlags) -> Self {
        Self {
            entry: (frame_addr & Self::ADDR_MASK) | u64::from(flags),
        }
    }
}

/// Builds a PML4→PDPT→PD→PT identity mapping of `[vstart, vstart+size)` to
/// `[pstart, pstart+size)`, with P=1, R/W=1, U/S=1, using 4 KiB pages laid
/// out starting at `tables_base`. Returns the physical address of the
/// PML4, ready to be loaded into CR3.
///
/// `size_bytes` must be a multiple of 4 KiB.
pub fn setup_identity_paging(
    mem: &mut PhysicalMemory,
    vstart: u64,
    pstart: u64,
    size_bytes: u64,
    tables_base: u64,
) -> Result<PhysAddr, CoreError> {
    if size_bytes % PAGE_SIZE_4K != 0 {
        return Err(CoreError::BadOperandSize {
            size: u8::try_from(size_bytes % PAGE_SIZE_4K).unwrap_or(u8::MAX),
        });
    }

    let mut allocator = TableAllocator::new(tables_base);
    let pml4_addr = allocator.alloc(mem)?;

    let flags = PageTableFlags::new()
        .with_present(true)
        .with_writable(true)
        .with_user_accessible(true);

    let mut pdpt_cache: std::collections::HashMap<u64, PhysAddr> = std::collections::HashMap::new();
    let mut pd_cache: std::collections::HashMap<(u64, u64), PhysAddr> = std::collections::HashMap::new();
    let mut pt_cache: std::collections::HashMap<(u64, u64, u64), PhysAddr> = std::collections::HashMap::new();

    let page_count = size_bytes / PAGE_SIZE_4K;
    for page in 0..page_count {
        let vaddr = vstart + page * PAGE_SIZE_4K;
        let paddr = pstart + page * PAGE_SIZE_4K;

        let idx4 = (vaddr >> 39) & 0x1FF;
        let idx3 = (vaddr >> 30) & 0x1FF;
        let idx2 = (vaddr >> 21) & 0x1FF;
        let idx1 = (vaddr >> 12) & 0x1FF;

        let pdpt_addr = match pdpt_cache.get(&idx4) {
            Some(addr) => *addr,
            None => {
                let addr = allocator.alloc(mem)?;
                write_entry(mem, pml4_addr, idx4, PageTableEntry::new(addr.as_u64(), flags))?;
                pdpt_cache.insert(idx4, addr);
                addr
            }
        };

        let pd_addr = match pd_cache.get(&(idx4, idx3)) {
            Some(addr) => *addr,
            None => {
                let addr = allocator.alloc(mem)?;
                write_entry(mem, pdpt_addr, idx3, PageTableEntry::new(addr.as_u64(), flags))?;
                pd_cache.insert((idx4, idx3), addr);
                addr
            }
        };

        let pt_addr = match pt_cache.get(&(idx4, idx3, idx2)) {
            Some(addr) => *addr,
            None => {
                let addr = allocator.alloc(mem)?;
                write_entry(mem, pd_addr, idx2, PageTableEntry::new(addr.as_u64(), flags))?;
                pt_cache.insert((idx4, idx3, idx2), addr);
                addr
            }
        };

        write_entry(mem, pt_addr, idx1, PageTableEntry::new(paddr, flags))?;
    }

    Ok(pml4_addr)
}

fn write_entry(
    mem: &mut PhysicalMemory,
    table_base: PhysAddr,
    index: u64,
    entry: PageTableEntry,
) -> Result<(), CoreError> {
    mem.write_u64(table_base + index * 8, entry.to_u64())
}

/// Hands out successive 4 KiB-aligned table frames starting at a base
/// address, zeroing each as it is allocated.
struct TableAllocator {
    next: u64,
}

impl TableAllocator {
    fn new(base: u64) -> Self {
        Self { next: base }
    }

    fn alloc(&mut self, mem: &mut PhysicalMemory) -> Result<PhysAddr, CoreError> {
        let addr = PhysAddr::new(self.next);
        mem.load(addr, &[0u8; PAGE_SIZE_4K as usize])?;
        self.next += PAGE_SIZE_4K;
        Ok(addr)
    }
}
