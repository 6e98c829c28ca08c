//! End-to-end scenario 5: near CALL/RET. The call target is placed so the
//! displacement lands exactly on the `ret`, with a one-byte `nop` sandwiched
//! in between standing in for "the rest of the caller" — proving the pushed
//! return address is the call's own next instruction, not the call site.

use vemu64::{Cpu, CpuConfig};

fn load(cpu: &mut Cpu, addr: u64, bytes: &[u8]) {
    cpu.memory_mut().load(vemu64::PhysAddr::new(addr), bytes).unwrap();
}

#[test]
fn call_pushes_the_next_instruction_and_ret_restores_it() {
    let mut cpu = Cpu::new(CpuConfig {
        initial_rsp: 0x9000,
        ..CpuConfig::default()
    });
    let rsp0 = cpu.registers().read("rsp").unwrap();

    #[rustfmt::skip]
    let program: &[u8] = &[
        0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0x0F, 0x22, 0xC0,             // mov cr0, eax   (enters protected mode)

        0xE8, 0x01, 0x00, 0x00, 0x00, // call +1        (call target is the ret below)
        0x90,                         // nop            (the true "next instruction")
        0xC3,                         // ret
    ];
    load(&mut cpu, 0x7C00, program);

    for _ in 0..3 {
        cpu.step().unwrap();
    }
    assert_eq!(cpu.mode(), vemu64::CpuMode::Protected);

    let nop_addr = 0x7C00 + 13;
    let ret_addr = 0x7C00 + 14;
    assert_eq!(cpu.registers().rip(), ret_addr);
    // Protected mode pushes a 4-byte return address, not 8.
    assert_eq!(cpu.registers().read("rsp").unwrap(), rsp0 - 4);

    cpu.step().unwrap();
    assert_eq!(cpu.registers().rip(), nop_addr, "ret must land on the instruction after call, not the call site");
    assert_eq!(cpu.registers().read("rsp").unwrap(), rsp0, "rsp must be fully restored after the matching ret");
}
