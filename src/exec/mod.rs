//! Instruction executor (C7): the opcode dispatch table, keyed on
//! `(opcode, /reg)` for the Group encodings, implementing the subset of
//! x86-64 in `spec.md` §4.7.

use crate::cpu::Cpu;
use crate::decode::{
    self, decode_modrm, fetch_i32, fetch_i8, fetch_u16, fetch_u32, fetch_u64, AddrWidth, ByteStream,
    Opcode, Operand, Prefixes, Rex,
};
use crate::errors::CoreError;
use crate::flags::{self, ShiftKind};
use crate::memory::VirtAddr;
use crate::mode::CpuMode;
use crate::registers::{Gpr, Segment, ViewWidth};

/// The eight opcode families sharing the `Eb,Gb`/`Ev,Gv`/`Gb,Eb`/`Gv,Ev`/
/// `AL,ib`/`eAX,iz` layout (`spec.md` §4.7).
#[derive(Debug, Clone, Copy)]
enum ArithOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

fn arith_family(byte: u8) -> Option<(ArithOp, u8)> {
    const FAMILIES: [(u8, ArithOp); 8] = [
        (0x00, ArithOp::Add),
        (0x08, ArithOp::Or),
        (0x10, ArithOp::Adc),
        (0x18, ArithOp::Sbb),
        (0x20, ArithOp::And),
        (0x28, ArithOp::Sub),
        (0x30, ArithOp::Xor),
        (0x38, ArithOp::Cmp),
    ];
    for (base, op) in FAMILIES {
        if (base..base + 6).contains(&byte) {
            return Some((op, byte - base));
        }
    }
    None
}

/// Decodes and executes exactly one instruction (or interrupt handling is
/// handled by [`Cpu::step`] before this is ever called). Advances RIP to
/// just past the consumed bytes, unless a control-flow opcode sets it
/// explicitly.
pub fn decode_and_execute(cpu: &mut Cpu) -> Result<(), CoreError> {
    let mode = cpu.mode();

    let (prefixes, opcode, after_prefix_cursor) = {
        let mut fetcher = cpu.fetch_instruction_stream();
        let (prefixes, opcode) = decode::decode_prefixes(&mut fetcher)?;
        (prefixes, opcode, fetcher.cursor())
    };

    let operand_size = decode::effective_operand_size(mode, &prefixes);
    let addr_size = decode::effective_address_size(mode, &prefixes);
    let stack_size = stack_operand_size(mode, &prefixes);

    let mut exec = Executor {
        cpu,
        prefixes,
        operand_size,
        addr_size,
        stack_size,
        cursor: after_prefix_cursor,
    };
    exec.dispatch(opcode)
}

fn stack_operand_size(mode: CpuMode, prefixes: &Prefixes) -> ViewWidth {
    if mode == CpuMode::Long {
        if prefixes.operand_override { ViewWidth::Word } else { ViewWidth::Qword }
    } else {
        decode::effective_operand_size(mode, prefixes)
    }
}

/// Holds the per-instruction decode state while `dispatch` walks the
/// opcode tables; `cursor` tracks how many bytes have been consumed so
/// `finish` can set RIP to just past them.
struct Executor<'a> {
    cpu: &'a mut Cpu,
    prefixes: Prefixes,
    operand_size: ViewWidth,
    addr_size: AddrWidth,
    stack_size: ViewWidth,
    cursor: u64,
}

impl<'a> Executor<'a> {
    /// Grabs a fresh fetcher positioned at `self.cursor` (bytes already
    /// consumed by the prefix/opcode decode or a previous call here), runs
    /// `f`, then records how far it advanced. Each call's fetcher borrows
    /// `self.cpu` immutably and is dropped before `f` returns, so the
    /// mutable borrows `dispatch_one`/`dispatch_two` need afterward (to
    /// write registers or memory) never overlap with it.
    fn with_fetcher<T>(
        &mut self,
        f: impl FnOnce(&mut dyn ByteStream, &crate::registers::RegisterFile) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let mut fetcher = self.cpu.fetch_instruction_stream();
        fetcher.seek(self.cursor);
        let regs = fetcher.regs();
        let result = f(&mut fetcher, regs)?;
        self.cursor = fetcher.cursor();
        Ok(result)
    }

    fn modrm(&mut self, width: ViewWidth) -> Result<(u8, Operand, u8), CoreError> {
        let rex = self.prefixes.rex;
        let addr_size = self.addr_size;
        self.with_fetcher(|stream, regs| {
            let result = decode_modrm(stream, addr_size, rex, width, regs)?;
            Ok((result.reg, result.rm, result.mod_bits))
        })
    }

    fn imm8(&mut self) -> Result<u8, CoreError> {
        self.with_fetcher(|stream, _| stream.fetch_u8())
    }

    fn imm_i8(&mut self) -> Result<i8, CoreError> {
        self.with_fetcher(|stream, _| fetch_i8(stream))
    }

    fn imm16(&mut self) -> Result<u16, CoreError> {
        self.with_fetcher(|stream, _| fetch_u16(stream))
    }

    fn imm32(&mut self) -> Result<u32, CoreError> {
        self.with_fetcher(|stream, _| fetch_u32(stream))
    }

    fn imm_i32(&mut self) -> Result<i32, CoreError> {
        self.with_fetcher(|stream, _| fetch_i32(stream))
    }

    fn imm64(&mut self) -> Result<u64, CoreError> {
        self.with_fetcher(|stream, _| fetch_u64(stream))
    }

    /// `iz`: imm16 for a 16-bit operand size, otherwise a sign-extended
    /// imm32 (`spec.md` §4.7, Group-1 / arithmetic-family immediates).
    fn imm_z(&mut self) -> Result<i64, CoreError> {
        if self.operand_size == ViewWidth::Word {
            Ok(i64::from(self.imm16()? as i16))
        } else {
            Ok(i64::from(self.imm_i32()?))
        }
    }

    fn read_operand(&mut self, op: Operand) -> Result<u64, CoreError> {
        match op {
            Operand::Register { index, width, high_byte } => {
                self.cpu.regs().read_view(index, width, high_byte)
            }
            Operand::Memory { addr, size } => self.cpu.read_virt_sized(addr, size),
        }
    }

    fn write_operand(&mut self, op: Operand, value: u64) -> Result<(), CoreError> {
        match op {
            Operand::Register { index, width, high_byte } => {
                self.cpu.regs_mut().write_view(index, value, width, high_byte)
            }
            Operand::Memory { addr, size } => self.cpu.write_virt_sized(addr, value, size),
        }
    }

    fn push(&mut self, value: u64) -> Result<(), CoreError> {
        let size = self.stack_size.bytes();
        let rsp = self.cpu.regs().read_gpr64(Gpr::Rsp).wrapping_sub(u64::from(size));
        self.cpu.regs_mut().write_gpr64(Gpr::Rsp, rsp);
        self.cpu.write_virt_sized(VirtAddr::new(rsp), value, size)
    }

    fn pop(&mut self) -> Result<u64, CoreError> {
        let size = self.stack_size.bytes();
        let rsp = self.cpu.regs().read_gpr64(Gpr::Rsp);
        let value = self.cpu.read_virt_sized(VirtAddr::new(rsp), size)?;
        self.cpu.regs_mut().write_gpr64(Gpr::Rsp, rsp.wrapping_add(u64::from(size)));
        Ok(value)
    }

    /// Advances RIP to just past the bytes this instruction consumed.
    /// Control-flow opcodes call this first (it's still the fall-through
    /// address they need, e.g. to compute a CALL's return address or a
    /// Jcc's not-taken path) and then overwrite RIP again if the branch
    /// is taken.
    fn finish(&mut self) {
        self.cpu.regs_mut().set_rip(self.cursor);
    }

    fn set_rip_absolute(&mut self, rip: u64) {
        self.cpu.regs_mut().set_rip(rip);
    }

    fn arith(&mut self, op: ArithOp, dest: Operand, src_value: u64, width: ViewWidth) -> Result<(), CoreError> {
        let dest_value = self.read_operand(dest)?;
        let size = width.bytes();
        let current = self.cpu.registers().rflags();
        let (result, new_flags) = match op {
            ArithOp::Add => {
                let (r, f) = flags::add(dest_value, src_value, false, size);
                (r, f.apply(current))
            }
            ArithOp::Adc => {
                let (r, f) = flags::add(dest_value, src_value, current.cf, size);
                (r, f.apply(current))
            }
            ArithOp::Sub | ArithOp::Cmp => {
                let (r, f) = flags::sub(dest_value, src_value, false, size);
                (r, f.apply(current))
            }
            ArithOp::Sbb => {
                let (r, f) = flags::sub(dest_value, src_value, current.cf, size);
                (r, f.apply(current))
            }
            ArithOp::And => {
                let r = dest_value & src_value;
                (r, flags::logic(r, size).apply(current))
            }
            ArithOp::Or => {
                let r = dest_value | src_value;
                (r, flags::logic(r, size).apply(current))
            }
            ArithOp::Xor => {
                let r = dest_value ^ src_value;
                (r, flags::logic(r, size).apply(current))
            }
        };
        self.cpu.regs_mut().set_rflags(new_flags);
        if !matches!(op, ArithOp::Cmp) {
            self.write_operand(dest, result)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, opcode: Opcode) -> Result<(), CoreError> {
        match opcode {
            Opcode::One(byte) => self.dispatch_one(byte)?,
            Opcode::Two(byte) => self.dispatch_two(byte)?,
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch_one(&mut self, byte: u8) -> Result<(), CoreError> {
        if let Some((op, variant)) = arith_family(byte) {
            return self.dispatch_arith_family(op, variant);
        }

        match byte {
            0x50..=0x57 => {
                let reg = Rex::extend(self.prefixes.rex.map_or(false, |r| r.b), byte - 0x50);
                let value = self.cpu.regs().read_gpr64_raw(reg)?;
                self.push(value)?;
                self.finish();
            }
            0x58..=0x5F => {
                let reg = Rex::extend(self.prefixes.rex.map_or(false, |r| r.b), byte - 0x58);
                let value = self.pop()?;
                self.cpu.regs_mut().write_gpr64_raw(reg, value)?;
                self.finish();
            }
            0x72 | 0x73 | 0x74 | 0x75 | 0x7C | 0x7D | 0x7E | 0x7F => {
                let disp = self.imm_i8()?;
                let taken = self.condition(byte);
                self.finish();
                if taken {
                    let target = (self.cpu.registers().rip() as i64).wrapping_add(i64::from(disp)) as u64;
                    self.set_rip_absolute(target);
                }
            }
            0xEB => {
                let disp = self.imm_i8()?;
                self.finish();
                let target = (self.cpu.registers().rip() as i64).wrapping_add(i64::from(disp)) as u64;
                self.set_rip_absolute(target);
            }
            0x81 => self.group1(ImmKind::Z)?,
            0x83 => self.group1(ImmKind::SignExtendedByte)?,
            0x84 => {
                let (reg, rm, _) = self.modrm(ViewWidth::Byte)?;
                let reg_op = Operand::Register { index: reg, width: ViewWidth::Byte, high_byte: self.prefixes.rex.is_none() && (4..8).contains(&reg) };
                let reg_val = self.read_operand(reg_op)?;
                let rm_val = self.read_operand(rm)?;
                let result = rm_val & reg_val;
                let flags = flags::logic(result, 1).apply(self.cpu.registers().rflags());
                self.cpu.regs_mut().set_rflags(flags);
                self.finish();
            }
            0x85 => {
                let (reg, rm, _) = self.modrm(self.operand_size)?;
                let reg_op = Operand::Register { index: reg, width: self.operand_size, high_byte: false };
                let reg_val = self.read_operand(reg_op)?;
                let rm_val = self.read_operand(rm)?;
                let result = rm_val & reg_val;
                let flags = flags::logic(result, self.operand_size.bytes()).apply(self.cpu.registers().rflags());
                self.cpu.regs_mut().set_rflags(flags);
                self.finish();
            }
            0xA8 => {
                let imm = self.imm8()?;
                let al = self.cpu.regs().read_view(Gpr::Rax as u8, ViewWidth::Byte, false)?;
                let result = al & u64::from(imm);
                let flags = flags::logic(result, 1).apply(self.cpu.registers().rflags());
                self.cpu.regs_mut().set_rflags(flags);
                self.finish();
            }
            0xA9 => {
                let imm = self.imm_z()? as u64;
                let eax = self.cpu.regs().read_view(Gpr::Rax as u8, self.operand_size, false)?;
                let result = eax & imm;
                let flags = flags::logic(result, self.operand_size.bytes()).apply(self.cpu.registers().rflags());
                self.cpu.regs_mut().set_rflags(flags);
                self.finish();
            }
            0x88 => {
                let (reg, rm, _) = self.modrm(ViewWidth::Byte)?;
                let reg_op = Operand::Register { index: reg, width: ViewWidth::Byte, high_byte: self.prefixes.rex.is_none() && (4..8).contains(&reg) };
                let value = self.read_operand(reg_op)?;
                self.write_operand(rm, value)?;
                self.finish();
            }
            0x89 => {
                let (reg, rm, _) = self.modrm(self.operand_size)?;
                let reg_op = Operand::Register { index: reg, width: self.operand_size, high_byte: false };
                let value = self.read_operand(reg_op)?;
                self.write_operand(rm, value)?;
                self.finish();
            }
            0x8A => {
                let (reg, rm, _) = self.modrm(ViewWidth::Byte)?;
                let value = self.read_operand(rm)?;
                let high_byte = self.prefixes.rex.is_none() && (4..8).contains(&reg);
                self.cpu.regs_mut().write_view(reg, value, ViewWidth::Byte, high_byte)?;
                self.finish();
            }
            0x8B => {
                let (reg, rm, _) = self.modrm(self.operand_size)?;
                let value = self.read_operand(rm)?;
                self.cpu.regs_mut().write_view(reg, value, self.operand_size, false)?;
                self.finish();
            }
            0x8D => {
                let (reg, rm, _) = self.modrm(self.operand_size)?;
                match rm {
                    Operand::Memory { addr, .. } => {
                        self.cpu.regs_mut().write_view(reg, addr.as_u64(), self.operand_size, false)?;
                    }
                    Operand::Register { .. } => return Err(CoreError::UnknownOpcode { rip: self.cpu.registers().rip(), bytes: vec![0x8D] }),
                }
                self.finish();
            }
            0x8E => {
                let (reg, rm, _) = self.modrm(ViewWidth::Word)?;
                let value = self.read_operand(rm)? as u16;
                if let Some(seg) = segment_from_index(reg) {
                    self.cpu.regs_mut().set_segment(seg, value);
                }
                self.finish();
            }
            0x90 => self.finish(),
            0xB0..=0xB7 => {
                let reg = Rex::extend(self.prefixes.rex.map_or(false, |r| r.b), byte - 0xB0);
                let imm = self.imm8()?;
                let high_byte = self.prefixes.rex.is_none() && (4..8).contains(&(byte - 0xB0));
                self.cpu.regs_mut().write_view(reg, u64::from(imm), ViewWidth::Byte, high_byte)?;
                self.finish();
            }
            0xB8..=0xBF => {
                let reg = Rex::extend(self.prefixes.rex.map_or(false, |r| r.b), byte - 0xB8);
                let imm = if self.operand_size == ViewWidth::Qword { self.imm64()? } else { u64::from(self.imm32()?) };
                self.cpu.regs_mut().write_view(reg, imm, self.operand_size, false)?;
                self.finish();
            }
            0xC0 => self.group2(ViewWidth::Byte, ImmKind::Raw8)?,
            0xC1 => self.group2(self.operand_size, ImmKind::Raw8)?,
            0xC2 => {
                let imm = self.imm16()?;
                let rip = self.pop()?;
                let rsp = self.cpu.regs().read_gpr64(Gpr::Rsp).wrapping_add(u64::from(imm));
                self.cpu.regs_mut().write_gpr64(Gpr::Rsp, rsp);
                self.set_rip_absolute(rip);
            }
            0xC3 => {
                let rip = self.pop()?;
                self.set_rip_absolute(rip);
            }
            0xC6 => {
                let (_, rm, _) = self.modrm(ViewWidth::Byte)?;
                let imm = self.imm8()?;
                self.write_operand(rm, u64::from(imm))?;
                self.finish();
            }
            0xC7 => {
                let (_, rm, _) = self.modrm(self.operand_size)?;
                let imm = self.imm_z()? as u64;
                self.write_operand(rm, imm)?;
                self.finish();
            }
            0x8F => {
                // POP r/m: the destination operand is decoded against
                // pre-pop register state (notably RSP, if the operand
                // addresses through it) and only then written with the
                // popped value, rather than re-resolving the address after
                // RSP has moved.
                let (_, rm, _) = self.modrm(self.stack_size)?;
                let value = self.pop()?;
                match rm {
                    Operand::Register { index, .. } => {
                        self.cpu.regs_mut().write_view(index, value, self.stack_size, false)?;
                    }
                    Operand::Memory { addr, .. } => {
                        self.cpu.write_virt_sized(addr, value, self.stack_size.bytes())?;
                    }
                }
                self.finish();
            }
            0xCF => {
                self.cpu.iretq()?;
            }
            0xE4 => {
                let port = u16::from(self.imm8()?);
                let value = self.cpu.io_bus_mut().port_in(port, 1);
                self.cpu.regs_mut().write_view(Gpr::Rax as u8, u64::from(value), ViewWidth::Byte, false)?;
                self.finish();
            }
            0xE6 => {
                let port = u16::from(self.imm8()?);
                let value = self.cpu.regs().read_view(Gpr::Rax as u8, ViewWidth::Byte, false)? as u32;
                self.cpu.io_bus_mut().port_out(port, value, 1);
                self.finish();
            }
            0xEC => {
                let port = self.cpu.regs().read_view(Gpr::Rdx as u8, ViewWidth::Word, false)? as u16;
                let value = self.cpu.io_bus_mut().port_in(port, 1);
                self.cpu.regs_mut().write_view(Gpr::Rax as u8, u64::from(value), ViewWidth::Byte, false)?;
                self.finish();
            }
            0xEE => {
                let port = self.cpu.regs().read_view(Gpr::Rdx as u8, ViewWidth::Word, false)? as u16;
                let value = self.cpu.regs().read_view(Gpr::Rax as u8, ViewWidth::Byte, false)? as u32;
                self.cpu.io_bus_mut().port_out(port, value, 1);
                self.finish();
            }
            0xE8 => {
                let disp = self.imm_i32()?;
                self.finish();
                let return_addr = self.cpu.registers().rip();
                self.push(return_addr)?;
                let target = (return_addr as i64).wrapping_add(i64::from(disp)) as u64;
                self.set_rip_absolute(target);
            }
            0xEA => {
                let offset = self.imm32()?;
                let selector = self.imm16()?;
                self.cpu.regs_mut().set_segment(Segment::Cs, selector);
                self.set_rip_absolute(u64::from(offset));
            }
            0xFA => {
                let mut flags = self.cpu.registers().rflags();
                flags.if_ = false;
                self.cpu.regs_mut().set_rflags(flags);
                self.finish();
            }
            0xFB => {
                let mut flags = self.cpu.registers().rflags();
                flags.if_ = true;
                self.cpu.regs_mut().set_rflags(flags);
                self.finish();
            }
            0xF4 => {
                self.finish();
                self.cpu.set_halted(true);
            }
            0xFE => {
                let (reg, rm, _) = self.modrm(ViewWidth::Byte)?;
                let value = self.read_operand(rm)?;
                let current = self.cpu.registers().rflags();
                let (result, new_flags) = match reg {
                    0 => flags::inc(value, 1, current),
                    1 => flags::dec(value, 1, current),
                    _ => return Err(CoreError::UnknownOpcode { rip: self.cpu.registers().rip(), bytes: vec![0xFE, reg] }),
                };
                self.write_operand(rm, result)?;
                self.cpu.regs_mut().set_rflags(new_flags);
                self.finish();
            }
            0xFF => self.group5()?,
            0xAC => {
                // EFLAGS.DF isn't modeled (`spec.md` Non-goals); RSI always
                // advances forward.
                let addr = VirtAddr::new(self.cpu.regs().read_gpr64(Gpr::Rsi));
                let value = self.cpu.read_virt_sized(addr, 1)?;
                self.cpu.regs_mut().write_view(Gpr::Rax as u8, value, ViewWidth::Byte, false)?;
                let rsi = self.cpu.regs().read_gpr64(Gpr::Rsi).wrapping_add(1);
                self.cpu.regs_mut().write_gpr64(Gpr::Rsi, rsi);
                self.finish();
            }
            0x0F => unreachable!("two-byte escape handled by the prefix loop"),
            _ => {
                return Err(CoreError::UnknownOpcode { rip: self.cpu.registers().rip(), bytes: vec![byte] });
            }
        }
        Ok(())
    }

    fn dispatch_arith_family(&mut self, op: ArithOp, variant: u8) -> Result<(), CoreError> {
        match variant {
            0 => {
                let (reg, rm, _) = self.modrm(ViewWidth::Byte)?;
                let high_byte = self.prefixes.rex.is_none() && (4..8).contains(&reg);
                let reg_op = Operand::Register { index: reg, width: ViewWidth::Byte, high_byte };
                let src = self.read_operand(reg_op)?;
                self.arith(op, rm, src, ViewWidth::Byte)?;
                self.finish();
            }
            1 => {
                let (reg, rm, _) = self.modrm(self.operand_size)?;
                let reg_op = Operand::Register { index: reg, width: self.operand_size, high_byte: false };
                let src = self.read_operand(reg_op)?;
                self.arith(op, rm, src, self.operand_size)?;
                self.finish();
            }
            2 => {
                let (reg, rm, _) = self.modrm(ViewWidth::Byte)?;
                let high_byte = self.prefixes.rex.is_none() && (4..8).contains(&reg);
                let reg_op = Operand::Register { index: reg, width: ViewWidth::Byte, high_byte };
                let src = self.read_operand(rm)?;
                self.arith(op, reg_op, src, ViewWidth::Byte)?;
                self.finish();
            }
            3 => {
                let (reg, rm, _) = self.modrm(self.operand_size)?;
                let reg_op = Operand::Register { index: reg, width: self.operand_size, high_byte: false };
                let src = self.read_operand(rm)?;
                self.arith(op, reg_op, src, self.operand_size)?;
                self.finish();
            }
            4 => {
                let imm = self.imm8()?;
                let dest = Operand::Register { index: Gpr::Rax as u8, width: ViewWidth::Byte, high_byte: false };
                self.arith(op, dest, u64::from(imm), ViewWidth::Byte)?;
                self.finish();
            }
            5 => {
                let imm = self.imm_z()? as u64;
                let dest = Operand::Register { index: Gpr::Rax as u8, width: self.operand_size, high_byte: false };
                self.arith(op, dest, imm, self.operand_size)?;
                self.finish();
            }
            _ => unreachable!("arith_family variant is 0..=5"),
        }
        Ok(())
    }

    fn condition(&self, byte: u8) -> bool {
        let flags = self.cpu.registers().rflags();
        match byte {
            0x72 => flags.cf,
            0x73 => !flags.cf,
            0x74 => flags.zf,
            0x75 => !flags.zf,
            0x7C => flags.sf != flags.of,
            0x7D => flags.sf == flags.of,
            0x7E => flags.zf || (flags.sf != flags.of),
            0x7F => !flags.zf && (flags.sf == flags.of),
            _ => unreachable!("only called for Jcc opcodes"),
        }
    }

    fn condition_two(&self, byte: u8) -> bool {
        let flags = self.cpu.registers().rflags();
        match byte {
            0x84 => flags.zf,
            0x85 => !flags.zf,
            _ => unreachable!("only called for two-byte Jcc opcodes"),
        }
    }

    fn group1(&mut self, imm_kind: ImmKind) -> Result<(), CoreError> {
        let (reg, rm, _) = self.modrm(self.operand_size)?;
        let imm = match imm_kind {
            ImmKind::Z => self.imm_z()? as u64,
            ImmKind::SignExtendedByte => self.imm_i8()? as i64 as u64,
            ImmKind::Raw8 => u64::from(self.imm8()?),
        };
        let op = match reg {
            0 => ArithOp::Add,
            1 => ArithOp::Or,
            2 => ArithOp::Adc,
            3 => ArithOp::Sbb,
            4 => ArithOp::And,
            5 => ArithOp::Sub,
            6 => ArithOp::Xor,
            7 => ArithOp::Cmp,
            _ => unreachable!("3-bit field"),
        };
        self.arith(op, rm, imm, self.operand_size)?;
        self.finish();
        Ok(())
    }

    fn group2(&mut self, width: ViewWidth, imm_kind: ImmKind) -> Result<(), CoreError> {
        let (reg, rm, _) = self.modrm(width)?;
        let count = match imm_kind {
            ImmKind::Raw8 => u32::from(self.imm8()?),
            _ => unreachable!("Group-2 shifts always take a raw imm8 count"),
        };
        let modulus = if self.operand_size == ViewWidth::Qword { 64 } else { 32 };
        let count = count % modulus;
        let value = self.read_operand(rm)?;
        let current = self.cpu.registers().rflags();
        let kind = match reg {
            4 => ShiftKind::Shl,
            5 => ShiftKind::Shr,
            7 => ShiftKind::Sar,
            _ => return Err(CoreError::UnknownOpcode { rip: self.cpu.registers().rip(), bytes: vec![0xC0, reg] }),
        };
        let (result, new_flags) = flags::shift(kind, value, count, width.bytes(), current);
        self.write_operand(rm, result)?;
        self.cpu.regs_mut().set_rflags(new_flags);
        self.finish();
        Ok(())
    }

    fn group5(&mut self) -> Result<(), CoreError> {
        let (reg, rm, _) = self.modrm(self.operand_size)?;
        match reg {
            0 | 1 => {
                let value = self.read_operand(rm)?;
                let current = self.cpu.registers().rflags();
                let (result, new_flags) = if reg == 0 {
                    flags::inc(value, self.operand_size.bytes(), current)
                } else {
                    flags::dec(value, self.operand_size.bytes(), current)
                };
                self.write_operand(rm, result)?;
                self.cpu.regs_mut().set_rflags(new_flags);
                self.finish();
            }
            6 => {
                // PUSH r/m follows the same 64-bit-in-long-mode stack
                // default as plain PUSH reg, independent of this
                // instruction's own operand-size attribute, so the operand
                // decoded above (tagged with `operand_size`) is re-read at
                // `stack_size` instead of trusted as-is.
                let value = match rm {
                    Operand::Register { index, .. } => self.cpu.regs().read_view(index, self.stack_size, false)?,
                    Operand::Memory { addr, .. } => self.cpu.read_virt_sized(addr, self.stack_size.bytes())?,
                };
                self.finish();
                self.push(value)?;
            }
            2 => {
                let target = self.read_operand(rm)?;
                self.finish();
                let return_addr = self.cpu.registers().rip();
                self.push(return_addr)?;
                self.set_rip_absolute(target);
            }
            4 => {
                let target = self.read_operand(rm)?;
                self.finish();
                self.set_rip_absolute(target);
            }
            _ => {
                return Err(CoreError::UnknownOpcode { rip: self.cpu.registers().rip(), bytes: vec![0xFF, reg] });
            }
        }
        Ok(())
    }

    fn dispatch_two(&mut self, byte: u8) -> Result<(), CoreError> {
        match byte {
            0x01 => {
                let (reg, rm, _) = self.modrm(self.operand_size)?;
                let addr = match rm {
                    Operand::Memory { addr, .. } => addr,
                    Operand::Register { .. } => {
                        return Err(CoreError::UnknownOpcode { rip: self.cpu.registers().rip(), bytes: vec![0x0F, 0x01, reg] })
                    }
                };
                match reg {
                    2 | 3 => {
                        // LIDT/LGDT memory operand: 16-bit limit followed by
                        // a 64-bit base (the legacy 32-bit-base encoding
                        // isn't modeled; `spec.md` targets long mode).
                        let limit = self.cpu.read_virt_sized(addr, 2)? as u16;
                        let base = self.cpu.read_virt_sized(addr + 2, 8)?;
                        let table = crate::registers::DescriptorTableReg { base, limit };
                        if reg == 2 {
                            self.cpu.regs_mut().set_idtr(table);
                        } else {
                            self.cpu.regs_mut().set_gdtr(table);
                        }
                    }
                    _ => return Err(CoreError::UnknownOpcode { rip: self.cpu.registers().rip(), bytes: vec![0x0F, 0x01, reg] }),
                }
                self.finish();
            }
            0x20 => {
                let (cr, rm, _) = self.modrm(ViewWidth::Qword)?;
                let value = match cr {
                    0 => self.cpu.registers().cr0().bits(),
                    2 => self.cpu.registers().cr2(),
                    3 => self.cpu.registers().cr3(),
                    4 => self.cpu.registers().cr4().bits(),
                    _ => return Err(CoreError::UnknownOpcode { rip: self.cpu.registers().rip(), bytes: vec![0x0F, 0x20, cr] }),
                };
                self.write_operand(rm, value)?;
                self.finish();
            }
            0x22 => {
                let (cr, rm, _) = self.modrm(ViewWidth::Qword)?;
                let value = self.read_operand(rm)?;
                match cr {
                    0 => self.cpu.regs_mut().set_cr0(value),
                    2 => self.cpu.regs_mut().set_cr2(value),
                    3 => self.cpu.regs_mut().set_cr3(value),
                    4 => self.cpu.regs_mut().set_cr4(value),
                    _ => return Err(CoreError::UnknownOpcode { rip: self.cpu.registers().rip(), bytes: vec![0x0F, 0x22, cr] }),
                }
                self.cpu.recompute_mode();
                self.finish();
            }
            0x30 => {
                let msr = self.cpu.regs().read_view(Gpr::Rcx as u8, ViewWidth::Dword, false)?;
                if msr == EFER_MSR {
                    let low = self.cpu.regs().read_view(Gpr::Rax as u8, ViewWidth::Dword, false)?;
                    self.cpu.regs_mut().set_efer(low);
                    self.cpu.recompute_mode();
                }
                self.finish();
            }
            0x32 => {
                let msr = self.cpu.regs().read_view(Gpr::Rcx as u8, ViewWidth::Dword, false)?;
                let value = if msr == EFER_MSR { self.cpu.registers().efer().bits() } else { 0 };
                self.cpu.regs_mut().write_view(Gpr::Rax as u8, value & 0xFFFF_FFFF, ViewWidth::Dword, false)?;
                self.cpu.regs_mut().write_view(Gpr::Rdx as u8, value >> 32, ViewWidth::Dword, false)?;
                self.finish();
            }
            0x84 | 0x85 => {
                let disp = self.imm_i32()?;
                let taken = self.condition_two(byte);
                self.finish();
                if taken {
                    let target = (self.cpu.registers().rip() as i64).wrapping_add(i64::from(disp)) as u64;
                    self.set_rip_absolute(target);
                }
            }
            0xB6 => {
                let (reg, rm, _) = self.modrm(ViewWidth::Byte)?;
                let value = self.read_operand(rm)?;
                self.cpu.regs_mut().write_view(reg, value, self.operand_size, false)?;
                self.finish();
            }
            0xB7 => {
                let (reg, rm, _) = self.modrm(ViewWidth::Word)?;
                let value = self.read_operand(rm)?;
                self.cpu.regs_mut().write_view(reg, value, self.operand_size, false)?;
                self.finish();
            }
            _ => {
                return Err(CoreError::UnknownOpcode { rip: self.cpu.registers().rip(), bytes: vec![0x0F, byte] });
            }
        }
        Ok(())
    }
}

const EFER_MSR: u64 = 0xC000_0080;

#[derive(Debug, Clone, Copy)]
enum ImmKind {
    Z,
    SignExtendedByte,
    Raw8,
}

fn segment_from_index(index: u8) -> Option<Segment> {
    match index {
        0 => Some(Segment::Cs),
        1 => Some(Segment::Ds),
        2 => Some(Segment::Ss),
        3 => Some(Segment::Es),
        4 => Some(Segment::Fs),
        5 => Some(Segment::Gs),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use crate::memory::PhysAddr;

    fn load_code(cpu: &mut Cpu, rip: u64, bytes: &[u8]) {
        cpu.memory_mut().load(PhysAddr::new(rip), bytes).unwrap();
    }

    fn new_cpu_at(rip: u64) -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::default());
        cpu.regs_mut().set_rip(rip);
        cpu
    }

    /// A CPU with just CR0.PE set: `effective_operand_size` defaults to
    /// 32-bit here (only real mode defaults to 16-bit), and since mode
    /// isn't `Long`, `stack_operand_size` falls back to the same 32-bit
    /// default rather than forcing 64-bit — so it needs no page tables
    /// (`mmu::translate` identity-maps every non-real, non-long mode).
    fn new_protected_mode_cpu_at(rip: u64) -> Cpu {
        let mut cpu = new_cpu_at(rip);
        cpu.regs_mut().set_cr0(1);
        cpu.recompute_mode();
        cpu
    }

    /// A CPU with PE/PG/PAE/LME all set and an identity page-table
    /// mapping covering the whole address space, so `stack_operand_size`
    /// takes its long-mode-specific 64-bit-by-default branch and memory
    /// accesses still resolve (`CpuMode::Long` is the one mode
    /// `mmu::translate` insists on walking real tables for).
    fn new_long_mode_cpu_at(rip: u64) -> Cpu {
        let mut cpu = new_cpu_at(rip);
        let pml4 = cpu.setup_identity_paging(0, 0, 0x10_0000, 0xF_0000).unwrap();
        cpu.regs_mut().set_cr3(pml4.as_u64());
        cpu.regs_mut().set_cr0(1 | (1 << 31));
        cpu.regs_mut().set_cr4(1 << 5);
        cpu.regs_mut().set_efer(1 << 8);
        cpu.recompute_mode();
        cpu
    }

    #[test]
    fn add_eax_ecx_sets_result_and_flags() {
        let mut cpu = new_protected_mode_cpu_at(0x7C00);
        cpu.regs_mut().write_view(Gpr::Rax as u8, 10, ViewWidth::Dword, false).unwrap();
        cpu.regs_mut().write_view(Gpr::Rcx as u8, 5, ViewWidth::Dword, false).unwrap();
        // ADD EAX, ECX (01 C8)
        load_code(&mut cpu, 0x7C00, &[0x01, 0xC8]);
        decode_and_execute(&mut cpu).unwrap();
        assert_eq!(cpu.registers().read_view(Gpr::Rax as u8, ViewWidth::Dword, false).unwrap(), 15);
        assert!(!cpu.registers().rflags().zf);
        assert_eq!(cpu.registers().rip(), 0x7C02);
    }

    #[test]
    fn sub_to_zero_sets_zero_flag() {
        let mut cpu = new_protected_mode_cpu_at(0x7C00);
        cpu.regs_mut().write_view(Gpr::Rax as u8, 7, ViewWidth::Dword, false).unwrap();
        cpu.regs_mut().write_view(Gpr::Rcx as u8, 7, ViewWidth::Dword, false).unwrap();
        // SUB EAX, ECX (29 C8)
        load_code(&mut cpu, 0x7C00, &[0x29, 0xC8]);
        decode_and_execute(&mut cpu).unwrap();
        assert_eq!(cpu.registers().read_view(Gpr::Rax as u8, ViewWidth::Dword, false).unwrap(), 0);
        assert!(cpu.registers().rflags().zf);
    }

    #[test]
    fn cmp_does_not_write_back_the_destination() {
        let mut cpu = new_protected_mode_cpu_at(0x7C00);
        cpu.regs_mut().write_view(Gpr::Rax as u8, 3, ViewWidth::Dword, false).unwrap();
        cpu.regs_mut().write_view(Gpr::Rcx as u8, 3, ViewWidth::Dword, false).unwrap();
        // CMP EAX, ECX (39 C8)
        load_code(&mut cpu, 0x7C00, &[0x39, 0xC8]);
        decode_and_execute(&mut cpu).unwrap();
        assert_eq!(cpu.registers().read_view(Gpr::Rax as u8, ViewWidth::Dword, false).unwrap(), 3);
        assert!(cpu.registers().rflags().zf);
    }

    #[test]
    fn je_is_taken_when_zero_flag_set() {
        let mut cpu = new_cpu_at(0x7C00);
        let mut flags = cpu.registers().rflags();
        flags.zf = true;
        cpu.regs_mut().set_rflags(flags);
        // JE +0x10 (74 10)
        load_code(&mut cpu, 0x7C00, &[0x74, 0x10]);
        decode_and_execute(&mut cpu).unwrap();
        assert_eq!(cpu.registers().rip(), 0x7C12);
    }

    #[test]
    fn jne_is_not_taken_when_zero_flag_set() {
        let mut cpu = new_cpu_at(0x7C00);
        let mut flags = cpu.registers().rflags();
        flags.zf = true;
        cpu.regs_mut().set_rflags(flags);
        // JNE +0x10 (75 10)
        load_code(&mut cpu, 0x7C00, &[0x75, 0x10]);
        decode_and_execute(&mut cpu).unwrap();
        assert_eq!(cpu.registers().rip(), 0x7C02);
    }

    #[test]
    fn push_then_pop_round_trips_through_the_stack() {
        let mut cpu = new_protected_mode_cpu_at(0x7C00);
        cpu.regs_mut().write_gpr64(Gpr::Rsp, 0x9000);
        cpu.regs_mut().write_gpr64(Gpr::Rax, 0xDEAD_BEEF);
        // PUSH RAX (50)
        load_code(&mut cpu, 0x7C00, &[0x50]);
        decode_and_execute(&mut cpu).unwrap();
        assert_eq!(cpu.registers().read_gpr64(Gpr::Rsp), 0x8FFC);

        // POP RBX (5B)
        load_code(&mut cpu, 0x7C01, &[0x5B]);
        decode_and_execute(&mut cpu).unwrap();
        assert_eq!(cpu.registers().read_gpr64(Gpr::Rbx), 0xDEAD_BEEF);
        assert_eq!(cpu.registers().read_gpr64(Gpr::Rsp), 0x9000);
    }

    #[test]
    fn call_pushes_return_address_and_ret_restores_it() {
        let mut cpu = new_protected_mode_cpu_at(0x7C00);
        cpu.regs_mut().write_gpr64(Gpr::Rsp, 0x9000);
        // CALL +5 (E8 05 00 00 00): 5 bytes consumed puts the return
        // address at 0x7C05, and the displacement is relative to that,
        // landing at 0x7C0A.
        load_code(&mut cpu, 0x7C00, &[0xE8, 0x05, 0x00, 0x00, 0x00]);
        decode_and_execute(&mut cpu).unwrap();
        assert_eq!(cpu.registers().rip(), 0x7C0A);
        assert_eq!(cpu.registers().read_gpr64(Gpr::Rsp), 0x8FFC);

        // RET (C3) at the call target.
        load_code(&mut cpu, 0x7C0A, &[0xC3]);
        decode_and_execute(&mut cpu).unwrap();
        assert_eq!(cpu.registers().rip(), 0x7C05);
        assert_eq!(cpu.registers().read_gpr64(Gpr::Rsp), 0x9000);
    }

    #[test]
    fn push_rm_follows_stack_operand_size_not_the_instructions_own() {
        let mut cpu = new_long_mode_cpu_at(0x7C00);
        cpu.regs_mut().write_gpr64(Gpr::Rsp, 0x9000);
        cpu.regs_mut().write_gpr64(Gpr::Rax, 0x1122_3344_5566_7788);
        // PUSH RAX via the FF/6 encoding (FF F0) instead of the short form.
        load_code(&mut cpu, 0x7C00, &[0xFF, 0xF0]);
        decode_and_execute(&mut cpu).unwrap();
        assert_eq!(cpu.registers().read_gpr64(Gpr::Rsp), 0x8FF8);
        let phys = cpu.memory().read_u64(PhysAddr::new(0x8FF8)).unwrap();
        assert_eq!(phys, 0x1122_3344_5566_7788);
    }

    #[test]
    fn pop_rm_writes_through_memory() {
        let mut cpu = new_protected_mode_cpu_at(0x7C00);
        cpu.regs_mut().write_gpr64(Gpr::Rsp, 0x9000);
        cpu.memory_mut().write_u32(PhysAddr::new(0x9000), 0xCAFE_BABE).unwrap();
        cpu.regs_mut().write_gpr64(Gpr::Rbx, 0x2000);
        // POP [RBX] (8F 03)
        load_code(&mut cpu, 0x7C00, &[0x8F, 0x03]);
        decode_and_execute(&mut cpu).unwrap();
        assert_eq!(cpu.registers().read_gpr64(Gpr::Rsp), 0x9004);
        assert_eq!(cpu.memory().read_u32(PhysAddr::new(0x2000)).unwrap(), 0xCAFE_BABE);
    }

    #[test]
    fn mov_rm32_imm32_writes_to_memory() {
        let mut cpu = new_protected_mode_cpu_at(0x7C00);
        cpu.regs_mut().write_gpr64(Gpr::Rbx, 0x500);
        // MOV DWORD PTR [RBX], 0x12345678 (C7 03 78 56 34 12)
        load_code(&mut cpu, 0x7C00, &[0xC7, 0x03, 0x78, 0x56, 0x34, 0x12]);
        decode_and_execute(&mut cpu).unwrap();
        assert_eq!(cpu.memory().read_u32(PhysAddr::new(0x500)).unwrap(), 0x1234_5678);
    }

    #[test]
    fn hlt_halts_the_cpu() {
        let mut cpu = new_cpu_at(0x7C00);
        load_code(&mut cpu, 0x7C00, &[0xF4]);
        decode_and_execute(&mut cpu).unwrap();
        assert!(cpu.is_halted());
        assert_eq!(cpu.registers().rip(), 0x7C01);
    }

    #[test]
    fn unknown_opcode_is_reported_with_the_faulting_byte() {
        let mut cpu = new_cpu_at(0x7C00);
        load_code(&mut cpu, 0x7C00, &[0x0F, 0xFF]);
        let err = decode_and_execute(&mut cpu).unwrap_err();
        assert!(matches!(err, CoreError::UnknownOpcode { bytes, .. } if bytes == vec![0x0F, 0xFF]));
    }

    #[test]
    fn mov_cr0_then_recompute_mode_enters_protected_mode() {
        let mut cpu = new_cpu_at(0x7C00);
        cpu.regs_mut().write_gpr64(Gpr::Rax, 1); // PE bit
        // MOV CR0, RAX (0F 22 C0)
        load_code(&mut cpu, 0x7C00, &[0x0F, 0x22, 0xC0]);
        decode_and_execute(&mut cpu).unwrap();
        assert_eq!(cpu.mode(), CpuMode::Protected);
    }
}
