//! Flags unit (C6): computes CF/ZF/SF/OF for arithmetic and logical
//! operations, per `spec.md` §4.6.

use crate::registers::RFlags;

fn mask(size: u8) -> u64 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        4 => 0xFFFF_FFFF,
        _ => u64::MAX,
    }
}

fn msb(value: u64, size: u8) -> bool {
    let shift = size.saturating_mul(8).saturating_sub(1);
    (value >> shift) & 1 != 0
}

/// CF/ZF/SF/OF produced by an ADD/ADC/SUB/SBB/CMP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArithFlags {
    pub cf: bool,
    pub zf: bool,
    pub sf: bool,
    pub of: bool,
}

impl ArithFlags {
    /// Merges into `current`, preserving IF (arithmetic never touches it).
    #[must_use]
    pub fn apply(self, current: RFlags) -> RFlags {
        RFlags {
            cf: self.cf,
            zf: self.zf,
            sf: self.sf,
            if_: current.if_,
            of: self.of,
        }
    }
}

/// Computes `op1 + op2 + carry_in` at `size` bytes, returning the masked
/// result and its flags. `carry_in` is 0 for plain ADD, the incoming carry
/// for ADC.
#[must_use]
pub fn add(op1: u64, op2: u64, carry_in: bool, size: u8) -> (u64, ArithFlags) {
    let m = mask(size);
    let a = op1 & m;
    let b = op2 & m;
    let c = u64::from(carry_in);

    let wide = u128::from(a) + u128::from(b) + u128::from(c);
    let result = (wide as u64) & m;

    let cf = wide > u128::from(m);
    let sa = msb(a, size);
    let sb = msb(b, size);
    let sr = msb(result, size);
    let of = (sa == sb) && (sa != sr);

    (
        result,
        ArithFlags { cf, zf: result == 0, sf: sr, of },
    )
}

/// Computes `op1 - op2 - carry_in` at `size` bytes. Used for SUB (carry_in
/// = 0), CMP (same as SUB, result simply isn't written back), and SBB
/// (carry_in = incoming CF).
#[must_use]
pub fn sub(op1: u64, op2: u64, carry_in: bool, size: u8) -> (u64, ArithFlags) {
    let m = mask(size);
    let a = op1 & m;
    let b = op2 & m;
    let c = u64::from(carry_in);

    let effective_b = (i128::from(b) + i128::from(c)) as u64 & m;
    let wide_result = (i128::from(a) - i128::from(b) - i128::from(c)) & i128::from(u128::MAX);
    let result = (wide_result as u64) & m;

    let cf = u128::from(a) < u128::from(b) + u128::from(c);
    let sa = msb(a, size);
    let sb = msb(effective_b, size);
    let sr = msb(result, size);
    let of = (sa != sb) && (sa != sr);

    (
        result,
        ArithFlags { cf, zf: result == 0, sf: sr, of },
    )
}

/// AND/OR/XOR/TEST: CF and OF are always cleared; ZF/SF come from the
/// (already masked) result.
#[must_use]
pub fn logic(result: u64, size: u8) -> ArithFlags {
    let masked = result & mask(size);
    ArithFlags {
        cf: false,
        zf: masked == 0,
        sf: msb(masked, size),
        of: false,
    }
}

/// INC/DEC: CF is preserved from `current`; OF/SF/ZF are computed as for
/// ADD/SUB by 1.
#[must_use]
pub fn inc(op1: u64, size: u8, current: RFlags) -> (u64, RFlags) {
    let (result, flags) = add(op1, 1, false, size);
    (
        result,
        RFlags { cf: current.cf, zf: flags.zf, sf: flags.sf, if_: current.if_, of: flags.of },
    )
}

#[must_use]
pub fn dec(op1: u64, size: u8, current: RFlags) -> (u64, RFlags) {
    let (result, flags) = sub(op1, 1, false, size);
    (
        result,
        RFlags { cf: current.cf, zf: flags.zf, sf: flags.sf, if_: current.if_, of: flags.of },
    )
}

/// The three shift opcodes covered by Group-2 (`spec.md` §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Shl,
    Shr,
    Sar,
}

/// SHL/SHR/SAR by `count` (already reduced mod 64 for 64-bit operands, mod
/// 32 otherwise, per `spec.md` §4.6). CF/OF follow the standard x86 rules;
/// for `count == 0` nothing is defined to change, so flags and value pass
/// through unmodified.
#[must_use]
pub fn shift(kind: ShiftKind, operand: u64, count: u32, size: u8, current: RFlags) -> (u64, RFlags) {
    if count == 0 {
        return (operand & mask(size), current);
    }

    let width = u32::from(size) * 8;
    let m = mask(size);
    let value = operand & m;

    let (result, cf) = match kind {
        ShiftKind::Shl => {
            if count >= width {
                (0, false)
            } else {
                let result = (value << count) & m;
                let cf = (value >> (width - count)) & 1 != 0;
                (result, cf)
            }
        }
        ShiftKind::Shr => {
            if count >= width {
                (0, false)
            } else {
                let result = value >> count;
                let cf = (value >> (count - 1)) & 1 != 0;
                (result, cf)
            }
        }
        ShiftKind::Sar => {
            let sign_extended = sign_extend(value, size);
            if count >= width {
                let all_ones = sign_extended < 0;
                (if all_ones { m } else { 0 }, msb(value, size))
            } else {
                let result = ((sign_extended >> count) as u64) & m;
                let cf = (value >> (count - 1)) & 1 != 0;
                (result, cf)
            }
        }
    };

    let of = if count == 1 {
        match kind {
            ShiftKind::Shl => msb(result, size) != cf,
            ShiftKind::Shr => msb(value, size),
            ShiftKind::Sar => false,
        }
    } else {
        current.of
    };

    (
        result,
        RFlags { cf, zf: result == 0, sf: msb(result, size), if_: current.if_, of },
    )
}

fn sign_extend(value: u64, size: u8) -> i64 {
    let shift = 64 - u32::from(size) * 8;
    ((value << shift) as i64) >> shift
}
