//! Shift/rotate arithmetic unit
//!
//! Pure functions: each returns the shifted value together with the last bit
//! shifted out, and the caller decides which flags to commit. A zero count
//! returns the operand unchanged; its carry is meaningless (false, or the
//! incoming carry for RCL/RCR) and callers skip flag updates for it.
//!
//! Rotates take their count modulo the operand width (RCL/RCR modulo
//! width + 1); shifts by at least the width shift everything out.

/// Shifted value plus the carry-out bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftResult<T> {
    pub result: T,
    pub carry: bool,
}

impl<T> ShiftResult<T> {
    #[inline]
    fn new(result: T, carry: bool) -> Self {
        Self { result, carry }
    }
}

/// Group 2 operation selected by the ModR/M reg field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    /// Decode the opcode extension of C0/C1/D0-D3.
    ///
    /// /4 is SHL (SAL is the same operation). /6 is routed to SHR, the same
    /// handler as /5.
    pub fn from_field(field: u8) -> Self {
        match field & 0x07 {
            0 => ShiftOp::Rol,
            1 => ShiftOp::Ror,
            2 => ShiftOp::Rcl,
            3 => ShiftOp::Rcr,
            4 => ShiftOp::Shl,
            5 | 6 => ShiftOp::Shr,
            7 => ShiftOp::Sar,
            _ => unreachable!(),
        }
    }

    /// True for the operations that also set ZF/SF from the result
    pub fn is_shift(self) -> bool {
        matches!(self, ShiftOp::Shl | ShiftOp::Shr | ShiftOp::Sar)
    }
}

/// Reduce a raw count for an 8-bit operand
#[inline]
pub fn normalize_count8(count: u8) -> u8 {
    count % 8
}

/// Reduce a raw count for a 32-bit operand
#[inline]
pub fn normalize_count32(count: u8) -> u8 {
    count % 32
}

pub fn rol8(value: u8, count: u8) -> ShiftResult<u8> {
    if count == 0 {
        return ShiftResult::new(value, false);
    }
    let result = value.rotate_left(count as u32 % 8);
    ShiftResult::new(result, (result & 0x01) != 0)
}

pub fn ror8(value: u8, count: u8) -> ShiftResult<u8> {
    if count == 0 {
        return ShiftResult::new(value, false);
    }
    let result = value.rotate_right(count as u32 % 8);
    ShiftResult::new(result, (result & 0x80) != 0)
}

/// Rotate left through carry: a 9-bit rotation of CF:value
pub fn rcl8(value: u8, count: u8, carry: bool) -> ShiftResult<u8> {
    let n = (count % 9) as u32;
    if n == 0 {
        return ShiftResult::new(value, carry);
    }
    let wide = ((carry as u16) << 8) | value as u16;
    let rotated = ((wide << n) | (wide >> (9 - n))) & 0x1FF;
    ShiftResult::new(rotated as u8, (rotated & 0x100) != 0)
}

/// Rotate right through carry: a 9-bit rotation of CF:value
pub fn rcr8(value: u8, count: u8, carry: bool) -> ShiftResult<u8> {
    let n = (count % 9) as u32;
    if n == 0 {
        return ShiftResult::new(value, carry);
    }
    let wide = ((carry as u16) << 8) | value as u16;
    let rotated = ((wide >> n) | (wide << (9 - n))) & 0x1FF;
    ShiftResult::new(rotated as u8, (rotated & 0x100) != 0)
}

pub fn shl8(value: u8, count: u8) -> ShiftResult<u8> {
    if count == 0 {
        return ShiftResult::new(value, false);
    }
    let wide = (value as u32).checked_shl(count as u32).unwrap_or(0);
    ShiftResult::new(wide as u8, (wide & 0x100) != 0)
}

pub fn shr8(value: u8, count: u8) -> ShiftResult<u8> {
    if count == 0 {
        return ShiftResult::new(value, false);
    }
    let value = value as u32;
    let result = value.checked_shr(count as u32).unwrap_or(0);
    let carry = value.checked_shr(count as u32 - 1).unwrap_or(0) & 1;
    ShiftResult::new(result as u8, carry != 0)
}

/// Arithmetic right shift: the sign bit is replicated
pub fn sar8(value: u8, count: u8) -> ShiftResult<u8> {
    if count == 0 {
        return ShiftResult::new(value, false);
    }
    let signed = value as i8 as i32;
    let result = signed >> (count as u32).min(31);
    let carry = (signed >> (count as u32 - 1).min(31)) & 1;
    ShiftResult::new(result as u8, carry != 0)
}

pub fn rol32(value: u32, count: u8) -> ShiftResult<u32> {
    if count == 0 {
        return ShiftResult::new(value, false);
    }
    let result = value.rotate_left(count as u32 % 32);
    ShiftResult::new(result, (result & 0x01) != 0)
}

pub fn ror32(value: u32, count: u8) -> ShiftResult<u32> {
    if count == 0 {
        return ShiftResult::new(value, false);
    }
    let result = value.rotate_right(count as u32 % 32);
    ShiftResult::new(result, (result & 0x8000_0000) != 0)
}

const MASK33: u64 = 0x1_FFFF_FFFF;

/// Rotate left through carry: a 33-bit rotation of CF:value
pub fn rcl32(value: u32, count: u8, carry: bool) -> ShiftResult<u32> {
    let n = (count % 33) as u32;
    if n == 0 {
        return ShiftResult::new(value, carry);
    }
    let wide = ((carry as u64) << 32) | value as u64;
    let rotated = ((wide << n) | (wide >> (33 - n))) & MASK33;
    ShiftResult::new(rotated as u32, (rotated >> 32) != 0)
}

/// Rotate right through carry: a 33-bit rotation of CF:value
pub fn rcr32(value: u32, count: u8, carry: bool) -> ShiftResult<u32> {
    let n = (count % 33) as u32;
    if n == 0 {
        return ShiftResult::new(value, carry);
    }
    let wide = ((carry as u64) << 32) | value as u64;
    let rotated = ((wide >> n) | (wide << (33 - n))) & MASK33;
    ShiftResult::new(rotated as u32, (rotated >> 32) != 0)
}

pub fn shl32(value: u32, count: u8) -> ShiftResult<u32> {
    if count == 0 {
        return ShiftResult::new(value, false);
    }
    let wide = (value as u64).checked_shl(count as u32).unwrap_or(0);
    ShiftResult::new(wide as u32, ((wide >> 32) & 1) != 0)
}

pub fn shr32(value: u32, count: u8) -> ShiftResult<u32> {
    if count == 0 {
        return ShiftResult::new(value, false);
    }
    let value = value as u64;
    let result = value.checked_shr(count as u32).unwrap_or(0);
    let carry = value.checked_shr(count as u32 - 1).unwrap_or(0) & 1;
    ShiftResult::new(result as u32, carry != 0)
}

pub fn sar32(value: u32, count: u8) -> ShiftResult<u32> {
    if count == 0 {
        return ShiftResult::new(value, false);
    }
    let signed = value as i32 as i64;
    let result = signed >> (count as u32).min(63);
    let carry = (signed >> (count as u32 - 1).min(63)) & 1;
    ShiftResult::new(result as u32, carry != 0)
}

/// Apply `op` to an 8-bit operand; `carry` feeds RCL/RCR only
pub fn shift8(op: ShiftOp, value: u8, count: u8, carry: bool) -> ShiftResult<u8> {
    match op {
        ShiftOp::Rol => rol8(value, count),
        ShiftOp::Ror => ror8(value, count),
        ShiftOp::Rcl => rcl8(value, count, carry),
        ShiftOp::Rcr => rcr8(value, count, carry),
        ShiftOp::Shl => shl8(value, count),
        ShiftOp::Shr => shr8(value, count),
        ShiftOp::Sar => sar8(value, count),
    }
}

/// Apply `op` to a 32-bit operand; `carry` feeds RCL/RCR only
pub fn shift32(op: ShiftOp, value: u32, count: u8, carry: bool) -> ShiftResult<u32> {
    match op {
        ShiftOp::Rol => rol32(value, count),
        ShiftOp::Ror => ror32(value, count),
        ShiftOp::Rcl => rcl32(value, count, carry),
        ShiftOp::Rcr => rcr32(value, count, carry),
        ShiftOp::Shl => shl32(value, count),
        ShiftOp::Shr => shr32(value, count),
        ShiftOp::Sar => sar32(value, count),
    }
}
