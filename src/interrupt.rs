//! Interrupt unit (C8): a FIFO of pending vectors, IDT gate parsing, and
//! delivery/IRETQ stack-frame handling, per `spec.md` §4.8.

use std::collections::VecDeque;

use crate::errors::CoreError;
use crate::registers::{DescriptorTableReg, RFlags, RegisterFile};

/// The virtual-memory view the interrupt unit needs: 64-bit reads (to load
/// IDT gates and pop a stack frame) and writes (to push one). Kept as a
/// single trait, rather than a pair of closures, so one mutable borrow of
/// the backing memory covers a whole delivery or IRETQ.
pub trait VirtMemory {
    fn read_u64(&mut self, addr: u64) -> Result<u64, CoreError>;
    fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), CoreError>;
}

/// Vectors that push a hardware error code ahead of the vector itself:
/// #DF(8), #TS(10), #NP(11), #SS(12), #GP(13), #PF(14), #AC(17).
#[must_use]
pub fn has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17)
}

/// A single 16-byte IDT gate, decoded far enough to dispatch: present bit,
/// handler offset, and code selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDescriptor {
    pub offset: u64,
    pub selector: u16,
    pub present: bool,
}

impl GateDescriptor {
    /// Decodes a gate from the two 64-bit words stored at `base`.
    ///
    /// Layout (`spec.md` §3): offset[15:0] @ bits 0..16 of the low word,
    /// selector @ bits 16..32, type/attributes byte @ bits 40..48 (bit 7 =
    /// present) of the low word; offset[31:16] @ bits 48..64 of the low
    /// word; offset[63:32] @ bits 0..32 of the high word.
    #[must_use]
    pub fn decode(low: u64, high: u64) -> Self {
        let offset_low = low & 0xFFFF;
        let offset_mid = (low >> 48) & 0xFFFF;
        let offset_high = high & 0xFFFF_FFFF;
        let selector = ((low >> 16) & 0xFFFF) as u16;
        let attr = (low >> 40) & 0xFF;
        Self {
            offset: offset_low | (offset_mid << 16) | (offset_high << 32),
            selector,
            present: attr & 0x80 != 0,
        }
    }
}

/// Reads the gate for `vector` out of the IDT described by `idtr`.
pub fn read_gate(
    idtr: DescriptorTableReg,
    vector: u8,
    mem: &mut dyn VirtMemory,
) -> Result<GateDescriptor, CoreError> {
    let gate_base = idtr.base + u64::from(vector) * 16;
    let low = mem.read_u64(gate_base)?;
    let high = mem.read_u64(gate_base + 8)?;
    Ok(GateDescriptor::decode(low, high))
}

/// Delivers `vector`: pushes RFLAGS, the current code selector, and RIP
/// (each as a full 64-bit stack slot), followed by the hardware error code
/// when `vector` carries one, followed by the vector number itself, then
/// loads RIP/CS from the gate.
///
/// Escalates to [`CoreError::DoubleFault`] when the gate isn't present.
pub fn deliver(
    regs: &mut RegisterFile,
    vector: u8,
    error_code: Option<u64>,
    mem: &mut dyn VirtMemory,
) -> Result<(), CoreError> {
    let gate = read_gate(regs.idtr(), vector, mem)?;
    if !gate.present {
        log::error!("no IDT gate present for vector {vector}, escalating to a double fault");
        return Err(CoreError::DoubleFault { vector });
    }

    let rflags_word = regs.rflags().assemble();
    let cs = u64::from(regs.segment(crate::registers::Segment::Cs));
    let rip = regs.rip();

    let mut push = |regs: &mut RegisterFile, value: u64| -> Result<(), CoreError> {
        let rsp = regs.read_gpr64(crate::registers::Gpr::Rsp).wrapping_sub(8);
        regs.write_gpr64(crate::registers::Gpr::Rsp, rsp);
        mem.write_u64(rsp, value)
    };

    push(regs, rflags_word)?;
    push(regs, cs)?;
    push(regs, rip)?;
    if let Some(code) = error_code {
        push(regs, code)?;
    }
    push(regs, u64::from(vector))?;

    regs.set_segment(crate::registers::Segment::Cs, gate.selector);
    regs.set_rip(gate.offset);
    Ok(())
}

/// Unwinds a [`deliver`]ed frame: pops the vector number, discards the
/// error-code slot if that vector carries one, then pops RIP, discards the
/// saved selector, and restores RFLAGS.
pub fn iretq(regs: &mut RegisterFile, mem: &mut dyn VirtMemory) -> Result<(), CoreError> {
    let mut pop = |regs: &mut RegisterFile| -> Result<u64, CoreError> {
        let rsp = regs.read_gpr64(crate::registers::Gpr::Rsp);
        let value = mem.read_u64(rsp)?;
        regs.write_gpr64(crate::registers::Gpr::Rsp, rsp.wrapping_add(8));
        Ok(value)
    };

    let vector = pop(&mut *regs)? as u8;
    if has_error_code(vector) {
        let _discarded = pop(&mut *regs)?;
    }
    let rip = pop(&mut *regs)?;
    let _selector = pop(&mut *regs)?;
    let rflags_word = pop(&mut *regs)?;

    regs.set_rip(rip);
    regs.set_rflags(RFlags::disassemble(rflags_word));
    Ok(())
}

/// C8: the FIFO of vectors raised by [`IoDevice`](crate::io::IoDevice)s or
/// by `spec.md` §4.7's own synchronous faults, waiting for IF to permit
/// delivery.
#[derive(Debug, Default)]
pub struct InterruptUnit {
    pending: VecDeque<u8>,
}

impl InterruptUnit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, vector: u8) {
        self.pending.push_back(vector);
    }

    pub fn pop_pending(&mut self) -> Option<u8> {
        self.pending.pop_front()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Gpr;

    fn present_gate(offset: u64, selector: u16) -> (u64, u64) {
        let low = (offset & 0xFFFF)
            | (u64::from(selector) << 16)
            | (0x80 << 40)
            | (((offset >> 16) & 0xFFFF) << 48);
        let high = (offset >> 32) & 0xFFFF_FFFF;
        (low, high)
    }

    struct FlatMemory(Vec<u8>);

    impl VirtMemory for FlatMemory {
        fn read_u64(&mut self, addr: u64) -> Result<u64, CoreError> {
            let start = addr as usize;
            Ok(u64::from_le_bytes(self.0[start..start + 8].try_into().unwrap()))
        }

        fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), CoreError> {
            let start = addr as usize;
            self.0[start..start + 8].copy_from_slice(&value.to_le_bytes());
            Ok(())
        }
    }

    #[test]
    fn gate_decode_round_trips_offset_and_selector() {
        let (low, high) = present_gate(0xDEAD_BEEF_1234, 0x08);
        let gate = GateDescriptor::decode(low, high);
        assert_eq!(gate.offset, 0xDEAD_BEEF_1234);
        assert_eq!(gate.selector, 0x08);
        assert!(gate.present);
    }

    #[test]
    fn deliver_pushes_five_slots_for_an_error_code_vector() {
        let mut regs = RegisterFile::new();
        regs.write_gpr64(Gpr::Rsp, 0x9000);
        regs.set_idtr(DescriptorTableReg { base: 0x1000, limit: 0xFFF });

        let mut backing = vec![0u8; 0x10_000];
        let (low, high) = present_gate(0x4000, 0x08);
        backing[0x1000 + 14 * 16..0x1000 + 14 * 16 + 8].copy_from_slice(&low.to_le_bytes());
        backing[0x1000 + 14 * 16 + 8..0x1000 + 14 * 16 + 16].copy_from_slice(&high.to_le_bytes());
        let mut mem = FlatMemory(backing);

        deliver(&mut regs, 14, Some(0x1), &mut mem).unwrap();
        assert_eq!(regs.read_gpr64(Gpr::Rsp), 0x9000 - 5 * 8);
        assert_eq!(regs.rip(), 0x4000);
    }

    #[test]
    fn interrupt_queue_is_fifo() {
        let mut unit = InterruptUnit::new();
        unit.raise(32);
        unit.raise(33);
        assert_eq!(unit.pop_pending(), Some(32));
        assert_eq!(unit.pop_pending(), Some(33));
        assert_eq!(unit.pop_pending(), None);
    }

    #[test]
    fn vector_14_carries_an_error_code_vector_32_does_not() {
        assert!(has_error_code(14));
        assert!(!has_error_code(32));
    }
}
