//! End-to-end scenario 6: HLT and interrupt wakeup. A real-mode guest loads
//! an IDT, enables interrupts, and halts; the host then raises an interrupt
//! the way a device model would, and the next `step` must wake the CPU and
//! redirect through the gate rather than silently staying halted.

use vemu64::{Cpu, CpuConfig, PhysAddr, StepOutcome};

fn load(cpu: &mut Cpu, addr: u64, bytes: &[u8]) {
    cpu.memory_mut().load(PhysAddr::new(addr), bytes).unwrap();
}

#[test]
fn hlt_parks_the_cpu_until_an_external_interrupt_wakes_it() {
    let mut cpu = Cpu::new(CpuConfig {
        initial_rsp: 0x9000,
        ..CpuConfig::default()
    });
    let rsp0 = cpu.registers().read("rsp").unwrap();

    let handler = 0x7D00u64;
    let selector = 0x0010u16;
    let low = (handler & 0xFFFF)
        | (u64::from(selector) << 16)
        | (0x80u64 << 40)
        | (((handler >> 16) & 0xFFFF) << 48);
    let high = (handler >> 32) & 0xFFFF_FFFF;
    let idt_base = 0x2000u64;
    cpu.memory_mut().write_u64(PhysAddr::new(idt_base + 32 * 16), low).unwrap();
    cpu.memory_mut().write_u64(PhysAddr::new(idt_base + 32 * 16 + 8), high).unwrap();
    cpu.memory_mut().write_u16(PhysAddr::new(0x1000), 0xFFF).unwrap();
    cpu.memory_mut().write_u64(PhysAddr::new(0x1002), idt_base).unwrap();

    #[rustfmt::skip]
    let program: &[u8] = &[
        0xBB, 0x00, 0x10, 0x00, 0x00, // mov ebx, 0x1000
        0x0F, 0x01, 0x13,             // lidt [ebx]
        0xFB,                         // sti
        0xF4,                         // hlt
    ];
    load(&mut cpu, 0x7C00, program);

    for _ in 0..4 {
        assert_eq!(cpu.step().unwrap(), StepOutcome::Running);
    }
    assert_eq!(cpu.step().unwrap(), StepOutcome::Halted);
    assert!(cpu.is_halted());

    cpu.raise_interrupt(32);
    assert_eq!(cpu.step().unwrap(), StepOutcome::Running);
    assert!(!cpu.is_halted());
    assert_eq!(cpu.registers().rip(), handler);
    // Vector 32 carries no hardware error code: four 8-byte slots, not five.
    assert_eq!(cpu.registers().read("rsp").unwrap(), rsp0 - 4 * 8);
}
