//! Operand decoder (C5): prefixes, opcode resolution, and ModR/M + SIB
//! addressing, per `spec.md` §4.5.

pub mod modrm;

use crate::errors::CoreError;
use crate::memory::VirtAddr;
use crate::mode::CpuMode;
use crate::registers::{Segment, ViewWidth};

pub use modrm::{decode_modrm, ModRmResult, Operand};

/// A source of instruction bytes, positioned at the guest's current
/// instruction pointer. Implementors fetch through the MMU so a fault
/// mid-instruction surfaces as a normal [`CoreError::PageFault`].
pub trait ByteStream {
    fn fetch_u8(&mut self) -> Result<u8, CoreError>;
    /// The guest virtual address the *next* `fetch_u8` will read from.
    fn current_addr(&self) -> u64;
}

pub fn fetch_u16(stream: &mut dyn ByteStream) -> Result<u16, CoreError> {
    let lo = stream.fetch_u8()?;
    let hi = stream.fetch_u8()?;
    Ok(u16::from_le_bytes([lo, hi]))
}

pub fn fetch_u32(stream: &mut dyn ByteStream) -> Result<u32, CoreError> {
    let mut bytes = [0u8; 4];
    for b in &mut bytes {
        *b = stream.fetch_u8()?;
    }
    Ok(u32::from_le_bytes(bytes))
}

pub fn fetch_u64(stream: &mut dyn ByteStream) -> Result<u64, CoreError> {
    let mut bytes = [0u8; 8];
    for b in &mut bytes {
        *b = stream.fetch_u8()?;
    }
    Ok(u64::from_le_bytes(bytes))
}

pub fn fetch_i8(stream: &mut dyn ByteStream) -> Result<i8, CoreError> {
    Ok(stream.fetch_u8()? as i8)
}

pub fn fetch_i32(stream: &mut dyn ByteStream) -> Result<i32, CoreError> {
    Ok(fetch_u32(stream)? as i32)
}

/// REX prefix (0x40-0x4F), present only outside real mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rex {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

impl Rex {
    fn from_byte(byte: u8) -> Self {
        Self {
            w: byte & 0b1000 != 0,
            r: byte & 0b0100 != 0,
            x: byte & 0b0010 != 0,
            b: byte & 0b0001 != 0,
        }
    }

    /// Extends a raw 3-bit reg/rm/base/index field with the matching REX bit.
    #[must_use]
    pub fn extend(bit: bool, field: u8) -> u8 {
        field | (u8::from(bit) << 3)
    }
}

/// The address-size attribute of an instruction; distinct from operand
/// width since they're controlled by separate prefixes/defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrWidth {
    Addr16,
    Addr32,
    Addr64,
}

/// Prefix bytes consumed ahead of the opcode.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prefixes {
    pub operand_override: bool,
    pub address_override: bool,
    pub rex: Option<Rex>,
    pub segment: Option<Segment>,
    pub rep: bool,
    pub repne: bool,
    pub lock: bool,
}

/// A one- or two-byte (`0F xx`) opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    One(u8),
    Two(u8),
}

/// Consumes the legacy/REX prefix run and the opcode byte(s) that follow,
/// per the decode loop in `spec.md` §4.5.
pub fn decode_prefixes(stream: &mut dyn ByteStream) -> Result<(Prefixes, Opcode), CoreError> {
    let mut prefixes = Prefixes::default();

    loop {
        let byte = stream.fetch_u8()?;
        match byte {
            0x66 => prefixes.operand_override = true,
            0x67 => prefixes.address_override = true,
            0x2E => prefixes.segment = Some(Segment::Cs),
            0x36 => prefixes.segment = Some(Segment::Ss),
            0x3E => prefixes.segment = Some(Segment::Ds),
            0x26 => prefixes.segment = Some(Segment::Es),
            0x64 => prefixes.segment = Some(Segment::Fs),
            0x65 => prefixes.segment = Some(Segment::Gs),
            0xF0 => prefixes.lock = true,
            0xF2 => prefixes.repne = true,
            0xF3 => prefixes.rep = true,
            0x40..=0x4F => {
                prefixes.rex = Some(Rex::from_byte(byte));
                let opcode_byte = stream.fetch_u8()?;
                return finish_opcode(stream, prefixes, opcode_byte);
            }
            other => return finish_opcode(stream, prefixes, other),
        }
    }
}

fn finish_opcode(
    stream: &mut dyn ByteStream,
    prefixes: Prefixes,
    first: u8,
) -> Result<(Prefixes, Opcode), CoreError> {
    if first == 0x0F {
        let second = stream.fetch_u8()?;
        Ok((prefixes, Opcode::Two(second)))
    } else {
        Ok((prefixes, Opcode::One(first)))
    }
}

/// The operand-size attribute: real mode defaults to 16 bits, protected
/// and long mode default to 32; `0x66` toggles it, and REX.W always wins
/// (forces 64-bit, `spec.md` §4.5).
#[must_use]
pub fn effective_operand_size(mode: CpuMode, prefixes: &Prefixes) -> ViewWidth {
    if let Some(rex) = prefixes.rex {
        if rex.w {
            return ViewWidth::Qword;
        }
    }
    let default_16 = matches!(mode, CpuMode::Real);
    match (default_16, prefixes.operand_override) {
        (true, false) => ViewWidth::Word,
        (true, true) => ViewWidth::Dword,
        (false, false) => ViewWidth::Dword,
        (false, true) => ViewWidth::Word,
    }
}

/// The address-size attribute, independent of operand size.
#[must_use]
pub fn effective_address_size(mode: CpuMode, prefixes: &Prefixes) -> AddrWidth {
    let default_16 = matches!(mode, CpuMode::Real);
    match (mode, default_16, prefixes.address_override) {
        (_, true, false) => AddrWidth::Addr16,
        (_, true, true) => AddrWidth::Addr32,
        (CpuMode::Long, false, false) => AddrWidth::Addr64,
        (CpuMode::Long, false, true) => AddrWidth::Addr32,
        (_, false, false) => AddrWidth::Addr32,
        (_, false, true) => AddrWidth::Addr16,
    }
}

/// Resolves a relative branch displacement against the address immediately
/// following the full instruction (`rip_after`).
#[must_use]
pub fn branch_target(rip_after: u64, disp: i64) -> VirtAddr {
    VirtAddr::new((rip_after as i64).wrapping_add(disp) as u64)
}
