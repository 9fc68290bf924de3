//! ModR/M + SIB operand decoding
//!
//! `parse_modrm` is the single place that understands 32-bit addressing
//! forms. Handlers then read and write "the rm operand" or "the reg operand"
//! through the accessors below without caring whether it is a register or a
//! memory cell.

use super::{CpuError, Emulator, Register, Result};

/// Decoded ModR/M byte plus everything consumed after it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    /// Raw ModR/M byte
    pub byte: u8,
    /// Bits 7-6
    pub mode: u8,
    /// Bits 5-3: register operand or opcode extension
    pub reg: u8,
    /// Bits 2-0
    pub rm: u8,
    /// SIB byte, when one followed
    pub sib: Option<u8>,
    /// Sign-extended displacement (0 when none was encoded)
    pub disp: i32,
    /// Effective address of a memory operand; None in register mode
    pub address: Option<u32>,
}

impl ModRm {
    /// Split a ModR/M byte into (mod, reg, rm)
    #[inline]
    pub fn decode(byte: u8) -> (u8, u8, u8) {
        let mode = (byte >> 6) & 0x03; // Bits 7-6
        let reg = (byte >> 3) & 0x07; // Bits 5-3
        let rm = byte & 0x07; // Bits 2-0
        (mode, reg, rm)
    }

    /// The reg field read as an opcode extension
    #[inline]
    pub fn opcode(&self) -> u8 {
        self.reg
    }

    #[inline]
    pub fn is_register(&self) -> bool {
        self.mode == 0b11
    }
}

impl Emulator {
    /// Consume ModR/M, optional SIB and displacement bytes at EIP and
    /// compute the effective address of a memory operand.
    pub fn parse_modrm(&mut self) -> Result<ModRm> {
        let byte = self.get_code8(0)?;
        self.advance_eip(1);
        let (mode, reg, rm) = ModRm::decode(byte);

        let mut modrm = ModRm {
            byte,
            mode,
            reg,
            rm,
            sib: None,
            disp: 0,
            address: None,
        };
        if mode == 0b11 {
            return Ok(modrm);
        }

        // Base (and scaled index) part of the address
        let mut base_disp32 = false;
        let base = if rm == 0b100 {
            let sib = self.get_code8(0)?;
            self.advance_eip(1);
            modrm.sib = Some(sib);
            let scale = (sib >> 6) & 0x03;
            let index = (sib >> 3) & 0x07;
            let base = sib & 0x07;

            // Index 100 encodes "no index"
            let scaled_index = if index == 0b100 {
                0
            } else {
                self.get_register32(Register::from_field(index)) << scale
            };
            let base_value = if base == 0b101 && mode == 0b00 {
                base_disp32 = true;
                0
            } else {
                self.get_register32(Register::from_field(base))
            };
            base_value.wrapping_add(scaled_index)
        } else if rm == 0b101 && mode == 0b00 {
            // [disp32]
            base_disp32 = true;
            0
        } else {
            self.get_register32(Register::from_field(rm))
        };

        modrm.disp = match mode {
            0b00 if base_disp32 => {
                let disp = self.get_sign_code32(0)?;
                self.advance_eip(4);
                disp
            }
            0b00 => 0,
            0b01 => {
                let disp = self.get_sign_code8(0)?;
                self.advance_eip(1);
                disp
            }
            0b10 => {
                let disp = self.get_sign_code32(0)?;
                self.advance_eip(4);
                disp
            }
            _ => unreachable!(),
        };

        modrm.address = Some(base.wrapping_add(modrm.disp as u32));
        Ok(modrm)
    }

    /// Effective address of a memory operand. A register operand here is a
    /// malformed encoding for the current instruction.
    pub fn calc_memory_address(&self, modrm: &ModRm) -> Result<u32> {
        match modrm.address {
            Some(address) => Ok(address),
            None => Err(CpuError::MalformedModRm {
                opcode: self.get_memory8(self.instruction_eip)?,
                modrm: modrm.byte,
                eip: self.instruction_eip,
            }),
        }
    }

    pub fn get_rm8(&self, modrm: &ModRm) -> Result<u8> {
        match modrm.address {
            None => Ok(self.get_register8(modrm.rm)),
            Some(address) => self.get_memory8(address),
        }
    }

    pub fn set_rm8(&mut self, modrm: &ModRm, value: u8) -> Result<()> {
        match modrm.address {
            None => {
                self.set_register8(modrm.rm, value);
                Ok(())
            }
            Some(address) => self.set_memory8(address, value),
        }
    }

    pub fn get_rm32(&self, modrm: &ModRm) -> Result<u32> {
        match modrm.address {
            None => Ok(self.get_register32(Register::from_field(modrm.rm))),
            Some(address) => self.get_memory32(address),
        }
    }

    pub fn set_rm32(&mut self, modrm: &ModRm, value: u32) -> Result<()> {
        match modrm.address {
            None => {
                self.set_register32(Register::from_field(modrm.rm), value);
                Ok(())
            }
            Some(address) => self.set_memory32(address, value),
        }
    }

    /// 16-bit store; a register operand keeps its upper half
    pub fn set_rm16(&mut self, modrm: &ModRm, value: u16) -> Result<()> {
        match modrm.address {
            None => {
                let reg = Register::from_field(modrm.rm);
                let upper = self.get_register32(reg) & 0xFFFF_0000;
                self.set_register32(reg, upper | value as u32);
                Ok(())
            }
            Some(address) => self.set_memory16(address, value),
        }
    }

    #[inline]
    pub fn get_r8(&self, modrm: &ModRm) -> u8 {
        self.get_register8(modrm.reg)
    }

    #[inline]
    pub fn set_r8(&mut self, modrm: &ModRm, value: u8) {
        self.set_register8(modrm.reg, value);
    }

    #[inline]
    pub fn get_r32(&self, modrm: &ModRm) -> u32 {
        self.get_register32(Register::from_field(modrm.reg))
    }

    #[inline]
    pub fn set_r32(&mut self, modrm: &ModRm, value: u32) {
        self.set_register32(Register::from_field(modrm.reg), value);
    }
}
