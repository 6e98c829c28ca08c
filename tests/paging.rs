//! End-to-end scenario 3: paging smoke test. A guest program rides real
//! mode through protected mode into long mode (CR3/CR4.PAE/EFER.LME/CR0.PG)
//! against an identity-mapped page-table tree the host built with
//! [`Cpu::setup_identity_paging`], then exercises the MMU through an actual
//! memory-operand instruction instead of poking physical memory directly.

use vemu64::{Cpu, CpuConfig, CpuMode, PhysAddr};

fn load(cpu: &mut Cpu, addr: u64, bytes: &[u8]) {
    cpu.memory_mut().load(PhysAddr::new(addr), bytes).unwrap();
}

#[test]
fn identity_mapped_long_mode_round_trips_a_memory_write() {
    let mut cpu = Cpu::new(CpuConfig::with_memory_size(0x21_0000));
    let pml4 = cpu.setup_identity_paging(0, 0, 0x20_0000, 0x20_0000).unwrap();
    assert_eq!(pml4.as_u64(), 0x20_0000);

    #[rustfmt::skip]
    let program: &[u8] = &[
        0x66, 0xB8, 0x00, 0x00, 0x20, 0x00, // mov eax, 0x200000   (pml4 addr)
        0x0F, 0x22, 0xD8,                   // mov cr3, eax
        0x66, 0xB8, 0x20, 0x00, 0x00, 0x00, // mov eax, 0x20       (CR4.PAE)
        0x0F, 0x22, 0xE0,                   // mov cr4, eax
        0x66, 0xB9, 0x80, 0x00, 0x00, 0xC0, // mov ecx, 0xC0000080 (EFER MSR)
        0x66, 0xB8, 0x00, 0x01, 0x00, 0x00, // mov eax, 0x100      (EFER.LME)
        0x0F, 0x30,                         // wrmsr
        0x66, 0xB8, 0x01, 0x00, 0x00, 0x80, // mov eax, 0x80000001 (CR0.PE|PG)
        0x0F, 0x22, 0xC0,                   // mov cr0, eax        (enters long mode)

        0xBB, 0x00, 0x10, 0x00, 0x00,       // mov ebx, 0x1000
        0x66, 0xC7, 0x03, 0xAD, 0xDE,       // mov word ptr [ebx], 0xDEAD
    ];
    load(&mut cpu, 0x7C00, program);

    for _ in 0..9 {
        cpu.step().unwrap();
    }
    assert_eq!(cpu.mode(), CpuMode::Long);
    assert_eq!(cpu.registers().cr3(), 0x20_0000);

    for _ in 0..2 {
        cpu.step().unwrap();
    }

    assert_eq!(cpu.memory().read_u16(PhysAddr::new(0x1000)).unwrap(), 0xDEAD);
}
