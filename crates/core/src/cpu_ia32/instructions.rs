//! Opcode dispatch and instruction handlers
//!
//! The dispatcher consumes the opcode byte; every handler then starts with
//! EIP on the byte after it and advances EIP past exactly what it consumes.

use super::shift::{self, ShiftOp};
use super::{CpuError, Emulator, ModRm, Register, Result, SegmentRegister, CL};
use crate::logging::{log, LogCategory, LogLevel};

/// Group 1 operation selected by the ModR/M reg field of 80/81/83
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    fn from_field(field: u8) -> Self {
        match field & 0x07 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            7 => AluOp::Cmp,
            _ => unreachable!(),
        }
    }
}

/// Where a group 2 instruction takes its count from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShiftCount {
    Imm8,
    One,
    Cl,
}

impl Emulator {
    /// Fetch, decode and execute one instruction at EIP.
    ///
    /// A halted CPU executes nothing until an interrupt is delivered.
    pub fn execute_one_instruction(&mut self) -> Result<()> {
        if self.halted {
            return Ok(());
        }

        self.instruction_eip = self.eip;
        let opcode = self.get_code8(0)?;

        log(LogCategory::CPU, LogLevel::Trace, || {
            format!(
                "{:08X}: {:02X}  EAX={:08X} ECX={:08X} EDX={:08X} EBX={:08X} ESP={:08X} EFLAGS={:08X}",
                self.eip,
                opcode,
                self.registers[0],
                self.registers[1],
                self.registers[2],
                self.registers[3],
                self.registers[4],
                self.eflags
            )
        });

        self.advance_eip(1);

        match opcode {
            // ADD r/m32, r32 (0x01)
            0x01 => self.alu_rm32_r32(AluOp::Add)?,
            // ADD r32, r/m32 (0x03)
            0x03 => self.alu_r32_rm32(AluOp::Add)?,
            // ADD EAX, imm32 (0x05)
            0x05 => self.alu_eax_imm32(AluOp::Add)?,
            // PUSH ES (0x06)
            0x06 => self.push_segment_register(SegmentRegister::Es)?,
            // POP ES (0x07)
            0x07 => self.pop_segment_register(SegmentRegister::Es)?,
            // OR r/m32, r32 (0x09)
            0x09 => self.alu_rm32_r32(AluOp::Or)?,
            // OR r32, r/m32 (0x0B)
            0x0B => self.alu_r32_rm32(AluOp::Or)?,
            // PUSH CS (0x0E)
            0x0E => self.push_segment_register(SegmentRegister::Cs)?,
            // PUSH SS (0x16)
            0x16 => self.push_segment_register(SegmentRegister::Ss)?,
            // POP SS (0x17)
            0x17 => self.pop_segment_register(SegmentRegister::Ss)?,
            // PUSH DS (0x1E)
            0x1E => self.push_segment_register(SegmentRegister::Ds)?,
            // POP DS (0x1F)
            0x1F => self.pop_segment_register(SegmentRegister::Ds)?,
            // AND r/m32, r32 (0x21)
            0x21 => self.alu_rm32_r32(AluOp::And)?,
            // AND r32, r/m32 (0x23)
            0x23 => self.alu_r32_rm32(AluOp::And)?,
            // SUB r/m32, r32 (0x29)
            0x29 => self.alu_rm32_r32(AluOp::Sub)?,
            // SUB r32, r/m32 (0x2B)
            0x2B => self.alu_r32_rm32(AluOp::Sub)?,
            // XOR r/m32, r32 (0x31)
            0x31 => self.alu_rm32_r32(AluOp::Xor)?,
            // XOR r32, r/m32 (0x33)
            0x33 => self.alu_r32_rm32(AluOp::Xor)?,
            // CMP r/m8, r8 (0x38)
            0x38 => {
                let modrm = self.parse_modrm()?;
                let rm8 = self.get_rm8(&modrm)?;
                let r8 = self.get_r8(&modrm);
                self.alu8(AluOp::Cmp, rm8, r8);
            }
            // CMP r/m32, r32 (0x39)
            0x39 => self.alu_rm32_r32(AluOp::Cmp)?,
            // CMP r32, r/m32 (0x3B)
            0x3B => self.alu_r32_rm32(AluOp::Cmp)?,
            // CMP AL, imm8 (0x3C)
            0x3C => {
                let imm = self.get_code8(0)?;
                self.advance_eip(1);
                let al = self.get_register8(super::AL);
                self.alu8(AluOp::Cmp, al, imm);
            }
            // CMP EAX, imm32 (0x3D)
            0x3D => self.alu_eax_imm32(AluOp::Cmp)?,
            // INC r32 (0x40-0x47)
            0x40..=0x47 => {
                let reg = Register::from_field(opcode - 0x40);
                let value = self.get_register32(reg);
                let result = self.inc32(value);
                self.set_register32(reg, result);
            }
            // DEC r32 (0x48-0x4F)
            0x48..=0x4F => {
                let reg = Register::from_field(opcode - 0x48);
                let value = self.get_register32(reg);
                let result = self.dec32(value);
                self.set_register32(reg, result);
            }
            // PUSH r32 (0x50-0x57)
            0x50..=0x57 => {
                let value = self.get_register32(Register::from_field(opcode - 0x50));
                self.push32(value)?;
            }
            // POP r32 (0x58-0x5F)
            0x58..=0x5F => {
                let value = self.pop32()?;
                self.set_register32(Register::from_field(opcode - 0x58), value);
            }
            // Operand-size prefix (0x66)
            0x66 => self.operand_size_prefixed()?,
            // PUSH imm32 (0x68)
            0x68 => {
                let value = self.get_code32(0)?;
                self.advance_eip(4);
                self.push32(value)?;
            }
            // PUSH imm8, sign-extended (0x6A)
            0x6A => {
                let value = self.get_sign_code8(0)?;
                self.advance_eip(1);
                self.push32(value as u32)?;
            }
            // Jcc rel8 (0x70-0x7F)
            0x70..=0x7F => {
                let taken = self
                    .check_condition(opcode & 0x0F)
                    .ok_or(CpuError::UnimplementedOpcode {
                        opcode,
                        eip: self.instruction_eip,
                    })?;
                let diff = self.get_sign_code8(0)?;
                self.advance_eip(1);
                if taken {
                    self.eip = self.eip.wrapping_add(diff as u32);
                }
            }
            // Group 1 r/m8, imm8 (0x80)
            0x80 => {
                let modrm = self.parse_modrm()?;
                let imm = self.get_code8(0)?;
                self.advance_eip(1);
                let value = self.get_rm8(&modrm)?;
                if let Some(result) = self.alu8(AluOp::from_field(modrm.opcode()), value, imm) {
                    self.set_rm8(&modrm, result)?;
                }
            }
            // Group 1 r/m32, imm32 (0x81)
            0x81 => {
                let modrm = self.parse_modrm()?;
                let imm = self.get_code32(0)?;
                self.advance_eip(4);
                self.alu_rm32_imm(&modrm, imm)?;
            }
            // Group 1 r/m32, imm8 sign-extended (0x83)
            0x83 => {
                let modrm = self.parse_modrm()?;
                let imm = self.get_sign_code8(0)? as u32;
                self.advance_eip(1);
                self.alu_rm32_imm(&modrm, imm)?;
            }
            // TEST r/m32, r32 (0x85)
            0x85 => {
                let modrm = self.parse_modrm()?;
                let result = self.get_rm32(&modrm)? & self.get_r32(&modrm);
                self.update_eflags_logic32(result);
            }
            // MOV r/m8, r8 (0x88)
            0x88 => {
                let modrm = self.parse_modrm()?;
                let value = self.get_r8(&modrm);
                self.set_rm8(&modrm, value)?;
            }
            // MOV r/m32, r32 (0x89)
            0x89 => {
                let modrm = self.parse_modrm()?;
                let value = self.get_r32(&modrm);
                self.set_rm32(&modrm, value)?;
            }
            // MOV r8, r/m8 (0x8A)
            0x8A => {
                let modrm = self.parse_modrm()?;
                let value = self.get_rm8(&modrm)?;
                self.set_r8(&modrm, value);
            }
            // MOV r32, r/m32 (0x8B)
            0x8B => {
                let modrm = self.parse_modrm()?;
                let value = self.get_rm32(&modrm)?;
                self.set_r32(&modrm, value);
            }
            // MOV r/m32, Sreg (0x8C)
            0x8C => self.mov_rm32_sreg(opcode)?,
            // LEA r32, m (0x8D)
            0x8D => {
                let modrm = self.parse_modrm()?;
                let address = self.calc_memory_address(&modrm)?;
                self.set_r32(&modrm, address);
            }
            // MOV Sreg, r/m32 (0x8E)
            0x8E => self.mov_sreg_rm32(opcode)?,
            // NOP (0x90)
            0x90 => {}
            // MOV r8, imm8 (0xB0-0xB7)
            0xB0..=0xB7 => {
                let value = self.get_code8(0)?;
                self.advance_eip(1);
                self.set_register8(opcode - 0xB0, value);
            }
            // MOV r32, imm32 (0xB8-0xBF)
            0xB8..=0xBF => {
                let value = self.get_code32(0)?;
                self.advance_eip(4);
                self.set_register32(Register::from_field(opcode - 0xB8), value);
            }
            // Group 2 r/m8, imm8 (0xC0)
            0xC0 => self.shift_rm8(ShiftCount::Imm8)?,
            // Group 2 r/m32, imm8 (0xC1)
            0xC1 => self.shift_rm32(ShiftCount::Imm8)?,
            // RET imm16 (0xC2)
            0xC2 => {
                let release = self.get_code16(0)?;
                self.eip = self.pop32()?;
                let esp = self.get_register32(Register::Esp);
                self.set_register32(Register::Esp, esp.wrapping_add(release as u32));
            }
            // RET (0xC3)
            0xC3 => self.eip = self.pop32()?,
            // LES r32, m16:32 (0xC4)
            0xC4 => self.les()?,
            // LDS r32, m16:32 (0xC5)
            0xC5 => self.lds()?,
            // MOV r/m8, imm8 (0xC6)
            0xC6 => {
                let modrm = self.parse_modrm()?;
                self.require_sub_opcode(opcode, &modrm, 0)?;
                let value = self.get_code8(0)?;
                self.advance_eip(1);
                self.set_rm8(&modrm, value)?;
            }
            // MOV r/m32, imm32 (0xC7)
            0xC7 => {
                let modrm = self.parse_modrm()?;
                self.require_sub_opcode(opcode, &modrm, 0)?;
                let value = self.get_code32(0)?;
                self.advance_eip(4);
                self.set_rm32(&modrm, value)?;
            }
            // LEAVE (0xC9)
            0xC9 => {
                let ebp = self.get_register32(Register::Ebp);
                self.set_register32(Register::Esp, ebp);
                let value = self.pop32()?;
                self.set_register32(Register::Ebp, value);
            }
            // RET far (0xCB)
            0xCB => self.ret_far()?,
            // INT imm8 (0xCD)
            0xCD => self.int_imm8()?,
            // IRET (0xCF)
            0xCF => self.iret()?,
            // Group 2 r/m8, 1 (0xD0)
            0xD0 => self.shift_rm8(ShiftCount::One)?,
            // Group 2 r/m32, 1 (0xD1)
            0xD1 => self.shift_rm32(ShiftCount::One)?,
            // Group 2 r/m8, CL (0xD2)
            0xD2 => self.shift_rm8(ShiftCount::Cl)?,
            // Group 2 r/m32, CL (0xD3)
            0xD3 => self.shift_rm32(ShiftCount::Cl)?,
            // IN AL, imm8 (0xE4)
            0xE4 => {
                let port = self.get_code8(0)? as u16;
                self.advance_eip(1);
                self.in_al(port);
            }
            // OUT imm8, AL (0xE6)
            0xE6 => {
                let port = self.get_code8(0)? as u16;
                self.advance_eip(1);
                self.out_al(port);
            }
            // CALL rel32 (0xE8)
            0xE8 => {
                let diff = self.get_sign_code32(0)?;
                self.advance_eip(4);
                self.push32(self.eip)?;
                self.eip = self.eip.wrapping_add(diff as u32);
            }
            // JMP rel32 (0xE9)
            0xE9 => {
                let diff = self.get_sign_code32(0)?;
                self.advance_eip(4);
                self.eip = self.eip.wrapping_add(diff as u32);
            }
            // JMP rel8 (0xEB)
            0xEB => {
                let diff = self.get_sign_code8(0)?;
                self.advance_eip(1);
                self.eip = self.eip.wrapping_add(diff as u32);
            }
            // IN AL, DX (0xEC)
            0xEC => {
                let port = self.get_register32(Register::Edx) as u16;
                self.in_al(port);
            }
            // OUT DX, AL (0xEE)
            0xEE => {
                let port = self.get_register32(Register::Edx) as u16;
                self.out_al(port);
            }
            // HLT (0xF4)
            0xF4 => self.halted = true,
            // CLI (0xFA)
            0xFA => self.set_int_flag(false),
            // STI (0xFB)
            0xFB => self.set_int_flag(true),
            // CLD (0xFC)
            0xFC => self.set_direction_flag(false),
            // STD (0xFD)
            0xFD => self.set_direction_flag(true),
            // Group 5 r/m32 (0xFF)
            0xFF => self.group5_rm32(opcode)?,
            _ => return Err(self.unimplemented_opcode(opcode)),
        }

        self.cycles += 1;
        Ok(())
    }

    fn unimplemented_opcode(&self, opcode: u8) -> CpuError {
        let error = CpuError::UnimplementedOpcode {
            opcode,
            eip: self.instruction_eip,
        };
        log(LogCategory::Stubs, LogLevel::Error, || error.to_string());
        error
    }

    fn unimplemented_sub_opcode(&self, opcode: u8, modrm: &ModRm) -> CpuError {
        let error = CpuError::UnimplementedSubOpcode {
            opcode,
            sub_opcode: modrm.opcode(),
            eip: self.instruction_eip,
        };
        log(LogCategory::Stubs, LogLevel::Error, || error.to_string());
        error
    }

    fn require_sub_opcode(&self, opcode: u8, modrm: &ModRm, expected: u8) -> Result<()> {
        if modrm.opcode() == expected {
            Ok(())
        } else {
            Err(self.unimplemented_sub_opcode(opcode, modrm))
        }
    }

    /// Only `MOV r/m16, imm16` is decoded after a 0x66 prefix. Any other
    /// prefixed opcode is reported against the prefix byte.
    fn operand_size_prefixed(&mut self) -> Result<()> {
        let opcode = self.get_code8(0)?;
        self.advance_eip(1);
        match opcode {
            // MOV r/m16, imm16 (0x66 0xC7)
            0xC7 => {
                let modrm = self.parse_modrm()?;
                self.require_sub_opcode(opcode, &modrm, 0)?;
                let value = self.get_code16(0)?;
                self.advance_eip(2);
                self.set_rm16(&modrm, value)
            }
            _ => Err(self.unimplemented_opcode(0x66)),
        }
    }

    // Arithmetic

    /// Apply a group 1 operation and update flags. Returns the value to store,
    /// or None for CMP.
    fn alu32(&mut self, op: AluOp, value1: u32, value2: u32) -> Option<u32> {
        let carry_in = self.is_carry() as u64;
        match op {
            AluOp::Add | AluOp::Adc => {
                let carry = if op == AluOp::Adc { carry_in } else { 0 };
                let result = value1 as u64 + value2 as u64 + carry;
                self.update_eflags_add(value1, value2, result);
                Some(result as u32)
            }
            AluOp::Sub | AluOp::Sbb | AluOp::Cmp => {
                let borrow = if op == AluOp::Sbb { carry_in } else { 0 };
                let result = (value1 as u64)
                    .wrapping_sub(value2 as u64)
                    .wrapping_sub(borrow);
                self.update_eflags_sub(value1, value2, result);
                (op != AluOp::Cmp).then_some(result as u32)
            }
            AluOp::Or | AluOp::And | AluOp::Xor => {
                let result = match op {
                    AluOp::Or => value1 | value2,
                    AluOp::And => value1 & value2,
                    _ => value1 ^ value2,
                };
                self.update_eflags_logic32(result);
                Some(result)
            }
        }
    }

    fn alu8(&mut self, op: AluOp, value1: u8, value2: u8) -> Option<u8> {
        let carry_in = self.is_carry() as u16;
        match op {
            AluOp::Add | AluOp::Adc => {
                let carry = if op == AluOp::Adc { carry_in } else { 0 };
                let result = value1 as u16 + value2 as u16 + carry;
                self.update_eflags_add8(value1, value2, result);
                Some(result as u8)
            }
            AluOp::Sub | AluOp::Sbb | AluOp::Cmp => {
                let borrow = if op == AluOp::Sbb { carry_in } else { 0 };
                let result = (value1 as u16)
                    .wrapping_sub(value2 as u16)
                    .wrapping_sub(borrow);
                self.update_eflags_sub8(value1, value2, result);
                (op != AluOp::Cmp).then_some(result as u8)
            }
            AluOp::Or | AluOp::And | AluOp::Xor => {
                let result = match op {
                    AluOp::Or => value1 | value2,
                    AluOp::And => value1 & value2,
                    _ => value1 ^ value2,
                };
                self.update_eflags_logic8(result);
                Some(result)
            }
        }
    }

    fn alu_rm32_r32(&mut self, op: AluOp) -> Result<()> {
        let modrm = self.parse_modrm()?;
        let rm32 = self.get_rm32(&modrm)?;
        let r32 = self.get_r32(&modrm);
        if let Some(result) = self.alu32(op, rm32, r32) {
            self.set_rm32(&modrm, result)?;
        }
        Ok(())
    }

    fn alu_r32_rm32(&mut self, op: AluOp) -> Result<()> {
        let modrm = self.parse_modrm()?;
        let r32 = self.get_r32(&modrm);
        let rm32 = self.get_rm32(&modrm)?;
        if let Some(result) = self.alu32(op, r32, rm32) {
            self.set_r32(&modrm, result);
        }
        Ok(())
    }

    fn alu_eax_imm32(&mut self, op: AluOp) -> Result<()> {
        let imm = self.get_code32(0)?;
        self.advance_eip(4);
        let eax = self.get_register32(Register::Eax);
        if let Some(result) = self.alu32(op, eax, imm) {
            self.set_register32(Register::Eax, result);
        }
        Ok(())
    }

    fn alu_rm32_imm(&mut self, modrm: &ModRm, imm: u32) -> Result<()> {
        let value = self.get_rm32(modrm)?;
        if let Some(result) = self.alu32(AluOp::from_field(modrm.opcode()), value, imm) {
            self.set_rm32(modrm, result)?;
        }
        Ok(())
    }

    /// INC leaves CF alone
    fn inc32(&mut self, value: u32) -> u32 {
        let carry = self.is_carry();
        let result = value as u64 + 1;
        self.update_eflags_add(value, 1, result);
        self.set_carry_flag(carry);
        result as u32
    }

    /// DEC leaves CF alone
    fn dec32(&mut self, value: u32) -> u32 {
        let carry = self.is_carry();
        let result = (value as u64).wrapping_sub(1);
        self.update_eflags_sub(value, 1, result);
        self.set_carry_flag(carry);
        result as u32
    }

    // Shifts and rotates

    fn shift_count(&mut self, source: ShiftCount) -> Result<u8> {
        match source {
            ShiftCount::Imm8 => {
                let count = self.get_code8(0)?;
                self.advance_eip(1);
                Ok(count)
            }
            ShiftCount::One => Ok(1),
            ShiftCount::Cl => Ok(self.get_register8(CL)),
        }
    }

    fn shift_rm8(&mut self, source: ShiftCount) -> Result<()> {
        let modrm = self.parse_modrm()?;
        let op = ShiftOp::from_field(modrm.opcode());
        let count = shift::normalize_count8(self.shift_count(source)?);
        if count == 0 {
            return Ok(());
        }

        let value = self.get_rm8(&modrm)?;
        let shifted = shift::shift8(op, value, count, self.is_carry());
        self.set_rm8(&modrm, shifted.result)?;
        self.update_eflags_shift(op, count, value as u32, shifted.result as u32, shifted.carry, 8);
        Ok(())
    }

    fn shift_rm32(&mut self, source: ShiftCount) -> Result<()> {
        let modrm = self.parse_modrm()?;
        let op = ShiftOp::from_field(modrm.opcode());
        let count = shift::normalize_count32(self.shift_count(source)?);
        if count == 0 {
            return Ok(());
        }

        let value = self.get_rm32(&modrm)?;
        let shifted = shift::shift32(op, value, count, self.is_carry());
        self.set_rm32(&modrm, shifted.result)?;
        self.update_eflags_shift(op, count, value, shifted.result, shifted.carry, 32);
        Ok(())
    }

    /// Commit CF (and OF for single-bit counts, ZF/SF for shifts) after a
    /// non-zero group 2 operation on a `width`-bit operand
    fn update_eflags_shift(
        &mut self,
        op: ShiftOp,
        count: u8,
        original: u32,
        result: u32,
        carry: bool,
        width: u32,
    ) {
        let msb = |value: u32| (value >> (width - 1)) & 1 != 0;

        self.set_carry_flag(carry);
        if count == 1 {
            let overflow = match op {
                ShiftOp::Rol | ShiftOp::Rcl | ShiftOp::Shl => msb(result) != carry,
                ShiftOp::Ror | ShiftOp::Rcr => msb(result) != ((result >> (width - 2)) & 1 != 0),
                ShiftOp::Shr => msb(original),
                ShiftOp::Sar => false,
            };
            self.set_overflow_flag(overflow);
        }
        if op.is_shift() {
            self.set_zero_flag(result == 0);
            self.set_sign_flag(msb(result));
        }
    }

    // Segment register moves

    fn mov_rm32_sreg(&mut self, opcode: u8) -> Result<()> {
        let modrm = self.parse_modrm()?;
        let seg = SegmentRegister::from_sreg_field(modrm.reg)
            .ok_or_else(|| self.unimplemented_sub_opcode(opcode, &modrm))?;
        let selector = self.get_segment_register(seg);
        match modrm.address {
            None => self.set_rm32(&modrm, selector as u32),
            Some(address) => self.set_memory16(address, selector),
        }
    }

    fn mov_sreg_rm32(&mut self, opcode: u8) -> Result<()> {
        let modrm = self.parse_modrm()?;
        // CS can only be loaded by a far transfer
        let seg = match SegmentRegister::from_sreg_field(modrm.reg) {
            Some(SegmentRegister::Cs) | None => {
                return Err(self.unimplemented_sub_opcode(opcode, &modrm))
            }
            Some(seg) => seg,
        };
        let selector = match modrm.address {
            None => self.get_rm32(&modrm)? as u16,
            Some(address) => self.get_memory16(address)?,
        };
        self.set_segment_register(seg, selector);
        Ok(())
    }

    // Port I/O

    fn in_al(&mut self, port: u16) {
        let value = self.io.read8(port);
        self.set_register8(super::AL, value);
        log(LogCategory::IO, LogLevel::Trace, || {
            format!("IN  {:04X} -> {:02X}", port, value)
        });
    }

    fn out_al(&mut self, port: u16) {
        let value = self.get_register8(super::AL);
        log(LogCategory::IO, LogLevel::Trace, || {
            format!("OUT {:04X} <- {:02X}", port, value)
        });
        self.io.write8(port, value);
    }

    // Group 5

    fn group5_rm32(&mut self, opcode: u8) -> Result<()> {
        let modrm = self.parse_modrm()?;
        match modrm.opcode() {
            // INC r/m32
            0 => {
                let value = self.get_rm32(&modrm)?;
                let result = self.inc32(value);
                self.set_rm32(&modrm, result)
            }
            // DEC r/m32
            1 => {
                let value = self.get_rm32(&modrm)?;
                let result = self.dec32(value);
                self.set_rm32(&modrm, result)
            }
            // CALL r/m32
            2 => {
                let target = self.get_rm32(&modrm)?;
                self.push32(self.eip)?;
                self.eip = target;
                Ok(())
            }
            // JMP r/m32
            4 => {
                self.eip = self.get_rm32(&modrm)?;
                Ok(())
            }
            // PUSH r/m32
            6 => {
                let value = self.get_rm32(&modrm)?;
                self.push32(value)
            }
            _ => Err(self.unimplemented_sub_opcode(opcode, &modrm)),
        }
    }
}
