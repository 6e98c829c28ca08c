//! ModR/M and SIB resolution (`spec.md` §4.5): turns the `mod`/`reg`/`rm`
//! byte (and, when present, the SIB byte and displacement) into a concrete
//! [`Operand`].

use super::{fetch_i8, fetch_i32, fetch_u16, AddrWidth, ByteStream, Rex};
use crate::errors::CoreError;
use crate::memory::VirtAddr;
use crate::registers::{RegisterFile, ViewWidth};

/// A decoded operand: either a register view or a resolved memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register { index: u8, width: ViewWidth, high_byte: bool },
    Memory { addr: VirtAddr, size: u8 },
}

/// The result of resolving a ModR/M (+ SIB + displacement) byte sequence.
#[derive(Debug, Clone, Copy)]
pub struct ModRmResult {
    /// The `reg` field, already extended by REX.R. For Group opcodes this
    /// is the sub-opcode selector rather than a register.
    pub reg: u8,
    pub rm: Operand,
    pub mod_bits: u8,
}

/// Decodes a ModR/M byte (and whatever it implies follows) from `stream`.
///
/// `width` is the width to tag a register-direct `rm` or a memory operand
/// with; callers pick it per-opcode (most instructions share it with their
/// `reg` operand, byte-opcodes always pass [`ViewWidth::Byte`]).
pub fn decode_modrm(
    stream: &mut dyn ByteStream,
    addr_width: AddrWidth,
    rex: Option<Rex>,
    width: ViewWidth,
    regs: &RegisterFile,
) -> Result<ModRmResult, CoreError> {
    let byte = stream.fetch_u8()?;
    let mod_bits = byte >> 6;
    let reg_raw = (byte >> 3) & 0x7;
    let rm_raw = byte & 0x7;

    let reg = Rex::extend(rex.map_or(false, |r| r.r), reg_raw);

    if mod_bits == 0b11 {
        let index = Rex::extend(rex.map_or(false, |r| r.b), rm_raw);
        let high_byte = width == ViewWidth::Byte && rex.is_none() && (4..8).contains(&rm_raw);
        return Ok(ModRmResult {
            reg,
            rm: Operand::Register { index, width, high_byte },
            mod_bits,
        });
    }

    let addr = match addr_width {
        AddrWidth::Addr16 => decode_mem16(stream, mod_bits, rm_raw, regs)?,
        AddrWidth::Addr32 | AddrWidth::Addr64 => {
            decode_mem_wide(stream, addr_width, mod_bits, rm_raw, rex, regs)?
        }
    };

    Ok(ModRmResult { reg, rm: Operand::Memory { addr, size: width.bytes() }, mod_bits })
}

fn decode_mem16(
    stream: &mut dyn ByteStream,
    mod_bits: u8,
    rm_raw: u8,
    regs: &RegisterFile,
) -> Result<VirtAddr, CoreError> {
    use crate::registers::Gpr;

    let (base, index): (Option<Gpr>, Option<Gpr>) = match rm_raw {
        0 => (Some(Gpr::Rbx), Some(Gpr::Rsi)),
        1 => (Some(Gpr::Rbx), Some(Gpr::Rdi)),
        2 => (Some(Gpr::Rbp), Some(Gpr::Rsi)),
        3 => (Some(Gpr::Rbp), Some(Gpr::Rdi)),
        4 => (Some(Gpr::Rsi), None),
        5 => (Some(Gpr::Rdi), None),
        6 => (Some(Gpr::Rbp), None),
        7 => (Some(Gpr::Rbx), None),
        _ => unreachable!("3-bit field"),
    };

    let mut offset: u32 = 0;
    let no_base = mod_bits == 0 && rm_raw == 6;
    if !no_base {
        if let Some(b) = base {
            offset = offset.wrapping_add(regs.read_gpr64(b) as u16 as u32);
        }
    }
    if let Some(i) = index {
        offset = offset.wrapping_add(regs.read_gpr64(i) as u16 as u32);
    }

    let disp: i32 = match mod_bits {
        0 if rm_raw == 6 => i32::from(fetch_u16(stream)? as i16),
        0 => 0,
        1 => i32::from(fetch_i8(stream)?),
        2 => i32::from(fetch_u16(stream)? as i16),
        _ => unreachable!("mod==3 handled by caller"),
    };

    let effective = (offset as i32).wrapping_add(disp) as u32 & 0xFFFF;
    Ok(VirtAddr::new(u64::from(effective)))
}

fn decode_mem_wide(
    stream: &mut dyn ByteStream,
    addr_width: AddrWidth,
    mod_bits: u8,
    rm_raw: u8,
    rex: Option<Rex>,
    regs: &RegisterFile,
) -> Result<VirtAddr, CoreError> {
    let mask = if addr_width == AddrWidth::Addr32 { 0xFFFF_FFFF } else { u64::MAX };
    let rex_b = rex.map_or(false, |r| r.b);
    let rex_x = rex.map_or(false, |r| r.x);

    if rm_raw == 4 {
        let sib = stream.fetch_u8()?;
        let scale = 1u64 << (sib >> 6);
        let index_raw = (sib >> 3) & 0x7;
        let base_raw = sib & 0x7;

        let index_val = if index_raw == 4 && !rex_x {
            0
        } else {
            let index_reg = Rex::extend(rex_x, index_raw);
            regs.read_gpr64_raw(index_reg)? & mask
        };

        let (base_val, disp_on_no_base) = if base_raw == 5 && mod_bits == 0 {
            (0, true)
        } else {
            let base_reg = Rex::extend(rex_b, base_raw);
            (regs.read_gpr64_raw(base_reg)? & mask, false)
        };

        let disp: i64 = match mod_bits {
            0 if disp_on_no_base => i64::from(fetch_i32(stream)?),
            0 => 0,
            1 => i64::from(fetch_i8(stream)?),
            2 => i64::from(fetch_i32(stream)?),
            _ => unreachable!("mod==3 handled by caller"),
        };

        let effective = (base_val as i64)
            .wrapping_add((index_val as i64).wrapping_mul(scale as i64))
            .wrapping_add(disp) as u64
            & mask;
        return Ok(VirtAddr::new(effective));
    }

    if rm_raw == 5 && mod_bits == 0 {
        let disp = fetch_i32(stream)?;
        let rip_relative_base = stream.current_addr();
        let effective = (rip_relative_base as i64).wrapping_add(i64::from(disp)) as u64 & mask;
        return Ok(VirtAddr::new(effective));
    }

    let base_reg = Rex::extend(rex_b, rm_raw);
    let base_val = regs.read_gpr64_raw(base_reg)? & mask;

    let disp: i64 = match mod_bits {
        0 => 0,
        1 => i64::from(fetch_i8(stream)?),
        2 => i64::from(fetch_i32(stream)?),
        _ => unreachable!("mod==3 handled by caller"),
    };

    let effective = (base_val as i64).wrapping_add(disp) as u64 & mask;
    Ok(VirtAddr::new(effective))
}
