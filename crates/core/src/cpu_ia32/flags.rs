//! EFLAGS engine
//!
//! Two ways of updating flags live side by side: the bulk updaters for
//! additive, subtractive and logical results, and one setter per flag for
//! instructions (shifts, rotates, INC/DEC) with their own rules.

use super::Emulator;

// Flag bit positions in EFLAGS
pub const FLAG_CF: u32 = 1 << 0; // Carry Flag
pub const FLAG_ZF: u32 = 1 << 6; // Zero Flag
pub const FLAG_SF: u32 = 1 << 7; // Sign Flag
pub const FLAG_IF: u32 = 1 << 9; // Interrupt Enable Flag
pub const FLAG_DF: u32 = 1 << 10; // Direction Flag
pub const FLAG_OF: u32 = 1 << 11; // Overflow Flag

impl Emulator {
    #[inline]
    fn set_flag(&mut self, flag: u32, value: bool) {
        if value {
            self.eflags |= flag;
        } else {
            self.eflags &= !flag;
        }
    }

    #[inline]
    fn get_flag(&self, flag: u32) -> bool {
        (self.eflags & flag) != 0
    }

    pub fn set_carry_flag(&mut self, is_carry: bool) {
        self.set_flag(FLAG_CF, is_carry);
    }

    pub fn set_zero_flag(&mut self, is_zero: bool) {
        self.set_flag(FLAG_ZF, is_zero);
    }

    pub fn set_sign_flag(&mut self, is_sign: bool) {
        self.set_flag(FLAG_SF, is_sign);
    }

    pub fn set_int_flag(&mut self, is_enabled: bool) {
        self.set_flag(FLAG_IF, is_enabled);
    }

    pub fn set_direction_flag(&mut self, is_down: bool) {
        self.set_flag(FLAG_DF, is_down);
    }

    pub fn set_overflow_flag(&mut self, is_overflow: bool) {
        self.set_flag(FLAG_OF, is_overflow);
    }

    #[inline]
    pub fn is_carry(&self) -> bool {
        self.get_flag(FLAG_CF)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.get_flag(FLAG_ZF)
    }

    #[inline]
    pub fn is_sign(&self) -> bool {
        self.get_flag(FLAG_SF)
    }

    #[inline]
    pub fn is_int_enabled(&self) -> bool {
        self.get_flag(FLAG_IF)
    }

    #[inline]
    pub fn is_direction_down(&self) -> bool {
        self.get_flag(FLAG_DF)
    }

    #[inline]
    pub fn is_overflow(&self) -> bool {
        self.get_flag(FLAG_OF)
    }

    /// Flags after `result = value1 + value2` computed in 64 bits
    pub fn update_eflags_add(&mut self, value1: u32, value2: u32, result: u64) {
        let sign1 = value1 >> 31;
        let sign2 = value2 >> 31;
        let signr = ((result >> 31) & 1) as u32;

        self.set_carry_flag((result >> 32) != 0);
        self.set_zero_flag(result as u32 == 0);
        self.set_sign_flag(signr != 0);
        self.set_overflow_flag(sign1 == sign2 && sign1 != signr);
    }

    /// Flags after `result = value1 - value2` computed as a wrapping 64-bit
    /// subtraction, so a borrow shows up above bit 31
    pub fn update_eflags_sub(&mut self, value1: u32, value2: u32, result: u64) {
        let sign1 = value1 >> 31;
        let sign2 = value2 >> 31;
        let signr = ((result >> 31) & 1) as u32;

        self.set_carry_flag((result >> 32) != 0);
        self.set_zero_flag(result as u32 == 0);
        self.set_sign_flag(signr != 0);
        self.set_overflow_flag(sign1 != sign2 && sign1 != signr);
    }

    pub fn update_eflags_add8(&mut self, value1: u8, value2: u8, result: u16) {
        let sign1 = value1 >> 7;
        let sign2 = value2 >> 7;
        let signr = ((result >> 7) & 1) as u8;

        self.set_carry_flag((result >> 8) != 0);
        self.set_zero_flag(result as u8 == 0);
        self.set_sign_flag(signr != 0);
        self.set_overflow_flag(sign1 == sign2 && sign1 != signr);
    }

    pub fn update_eflags_sub8(&mut self, value1: u8, value2: u8, result: u16) {
        let sign1 = value1 >> 7;
        let sign2 = value2 >> 7;
        let signr = ((result >> 7) & 1) as u8;

        self.set_carry_flag((result >> 8) != 0);
        self.set_zero_flag(result as u8 == 0);
        self.set_sign_flag(signr != 0);
        self.set_overflow_flag(sign1 != sign2 && sign1 != signr);
    }

    /// AND/OR/XOR/TEST: CF and OF cleared
    pub fn update_eflags_logic32(&mut self, result: u32) {
        self.set_carry_flag(false);
        self.set_overflow_flag(false);
        self.set_zero_flag(result == 0);
        self.set_sign_flag((result & 0x8000_0000) != 0);
    }

    pub fn update_eflags_logic8(&mut self, result: u8) {
        self.set_carry_flag(false);
        self.set_overflow_flag(false);
        self.set_zero_flag(result == 0);
        self.set_sign_flag((result & 0x80) != 0);
    }

    /// Evaluate a Jcc condition code.
    ///
    /// Returns None for the parity conditions (0xA, 0xB): PF is not modelled.
    pub fn check_condition(&self, condition: u8) -> Option<bool> {
        let taken = match condition & 0x0F {
            0x0 => self.is_overflow(),                   // O
            0x1 => !self.is_overflow(),                  // NO
            0x2 => self.is_carry(),                      // B/C
            0x3 => !self.is_carry(),                     // NB/NC
            0x4 => self.is_zero(),                       // E/Z
            0x5 => !self.is_zero(),                      // NE/NZ
            0x6 => self.is_carry() || self.is_zero(),    // BE
            0x7 => !self.is_carry() && !self.is_zero(),  // NBE
            0x8 => self.is_sign(),                       // S
            0x9 => !self.is_sign(),                      // NS
            0xC => self.is_sign() != self.is_overflow(), // L
            0xD => self.is_sign() == self.is_overflow(), // NL
            0xE => self.is_zero() || (self.is_sign() != self.is_overflow()), // LE
            0xF => !self.is_zero() && (self.is_sign() == self.is_overflow()), // NLE
            _ => return None,
        };
        Some(taken)
    }
}
