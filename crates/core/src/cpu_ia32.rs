//! 32-bit x86 CPU core
//!
//! One [`Emulator`] value owns the entire machine: register file, EFLAGS,
//! segment and control registers, the instruction pointer and the flat RAM
//! buffer. Every component is an `impl Emulator` block operating on that single
//! context:
//!
//! - access layer and instruction fetch (this file)
//! - `modrm`: ModR/M + SIB operand decoding and the rm/reg operand accessors
//! - `flags`: EFLAGS engine
//! - `shift`: pure shift/rotate arithmetic
//! - `interrupt`: INT/IRET/far returns, IDT delivery, IRQ injection
//! - `instructions`: opcode dispatch
//!
//! The run loop lives outside the core and drives
//! [`Emulator::execute_one_instruction`]. Anything the CPU cannot execute is
//! reported as a [`CpuError`] rather than terminating the process.

mod flags;
mod instructions;
mod interrupt;
mod io;
mod memory;
mod modrm;
pub mod shift;

#[cfg(test)]
mod tests;

pub use flags::{FLAG_CF, FLAG_DF, FLAG_IF, FLAG_OF, FLAG_SF, FLAG_ZF};
pub use interrupt::{
    InterruptHandler, IRQ_COM1, IRQ_ERROR, IRQ_IDE, IRQ_KBD, IRQ_SPURIOUS, IRQ_TIMER, T_IRQ0,
};
pub use io::{IoPorts, NullIo};
pub use memory::FlatMemory;
pub use modrm::ModRm;
pub use shift::{ShiftOp, ShiftResult};

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cpu_ia32_protected::{privilege_level, DescriptorTableRegister};
use crate::logging::{log, LogCategory, LogLevel};
use crate::Cpu;

/// Fatal conditions raised while executing an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("Not implemented: Op: {opcode:02X} at EIP={eip:#010X}")]
    UnimplementedOpcode { opcode: u8, eip: u32 },
    #[error("Not implemented: Op: {opcode:02X} with ModR/M Op: {sub_opcode} at EIP={eip:#010X}")]
    UnimplementedSubOpcode { opcode: u8, sub_opcode: u8, eip: u32 },
    #[error("Memory access out of range: address {address:#010X} (memory size {size:#X})")]
    MemoryOutOfRange { address: u32, size: usize },
    #[error("Malformed ModR/M {modrm:02X} for Op: {opcode:02X} at EIP={eip:#010X}")]
    MalformedModRm { opcode: u8, modrm: u8, eip: u32 },
    #[error("Invalid interrupt gate for vector {vector:#04X}")]
    InvalidInterruptGate { vector: u8 },
    #[error("General protection: INT {vector:#04X} through gate with DPL {dpl} from CPL {cpl}")]
    GeneralProtection { vector: u8, cpl: u8, dpl: u8 },
}

pub type Result<T> = std::result::Result<T, CpuError>;

pub const REGISTERS_COUNT: usize = 8;
pub const SEGMENT_REGISTERS_COUNT: usize = 6;
pub const CONTROL_REGISTERS_COUNT: usize = 5;

/// General purpose registers, in the order of the ModR/M reg field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Register {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Register {
    pub const ALL: [Register; REGISTERS_COUNT] = [
        Register::Eax,
        Register::Ecx,
        Register::Edx,
        Register::Ebx,
        Register::Esp,
        Register::Ebp,
        Register::Esi,
        Register::Edi,
    ];

    /// Register selected by a 3-bit instruction field (upper bits ignored)
    #[inline]
    pub fn from_field(field: u8) -> Self {
        Self::ALL[(field & 0x07) as usize]
    }

    pub fn name(self) -> &'static str {
        match self {
            Register::Eax => "EAX",
            Register::Ecx => "ECX",
            Register::Edx => "EDX",
            Register::Ebx => "EBX",
            Register::Esp => "ESP",
            Register::Ebp => "EBP",
            Register::Esi => "ESI",
            Register::Edi => "EDI",
        }
    }
}

// 8-bit register indices. AL..BL alias the low byte of EAX..EBX, AH..BH the
// second byte of the same registers.
pub const AL: u8 = 0;
pub const CL: u8 = 1;
pub const DL: u8 = 2;
pub const BL: u8 = 3;
pub const AH: u8 = 4;
pub const CH: u8 = 5;
pub const DH: u8 = 6;
pub const BH: u8 = 7;

/// Segment registers, in storage order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SegmentRegister {
    Cs = 0,
    Ds = 1,
    Es = 2,
    Ss = 3,
    Fs = 4,
    Gs = 5,
}

impl SegmentRegister {
    pub const ALL: [SegmentRegister; SEGMENT_REGISTERS_COUNT] = [
        SegmentRegister::Cs,
        SegmentRegister::Ds,
        SegmentRegister::Es,
        SegmentRegister::Ss,
        SegmentRegister::Fs,
        SegmentRegister::Gs,
    ];

    /// Segment register named by the reg field of MOV Sreg forms, which uses
    /// the hardware order ES, CS, SS, DS, FS, GS
    pub fn from_sreg_field(field: u8) -> Option<Self> {
        match field {
            0 => Some(SegmentRegister::Es),
            1 => Some(SegmentRegister::Cs),
            2 => Some(SegmentRegister::Ss),
            3 => Some(SegmentRegister::Ds),
            4 => Some(SegmentRegister::Fs),
            5 => Some(SegmentRegister::Gs),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SegmentRegister::Cs => "CS",
            SegmentRegister::Ds => "DS",
            SegmentRegister::Es => "ES",
            SegmentRegister::Ss => "SS",
            SegmentRegister::Fs => "FS",
            SegmentRegister::Gs => "GS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlRegister {
    Cr0 = 0,
    Cr1 = 1,
    Cr2 = 2,
    Cr3 = 3,
    Cr4 = 4,
}

/// EFLAGS value after reset: only the always-one reserved bit 1
const EFLAGS_RESET: u32 = 0x0000_0002;

/// Construction-time parameters of an [`Emulator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Size of the flat RAM buffer in bytes
    pub memory_size: usize,
    /// EIP after reset
    pub initial_eip: u32,
    /// ESP after reset
    pub initial_esp: u32,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            memory_size: 1024 * 1024,
            initial_eip: 0x7C00,
            initial_esp: 0x7C00,
        }
    }
}

/// Serializable snapshot of everything except RAM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    pub eflags: u32,
    pub registers: [u32; REGISTERS_COUNT],
    pub segment_registers: [u16; SEGMENT_REGISTERS_COUNT],
    pub control_registers: [u32; CONTROL_REGISTERS_COUNT],
    pub eip: u32,
    pub idtr: DescriptorTableRegister,
    pub halted: bool,
    pub cycles: u64,
}

/// 32-bit x86 CPU state and execution engine
pub struct Emulator {
    /// EFLAGS; see the `FLAG_*` constants for the modelled bits
    pub eflags: u32,
    /// General purpose registers indexed by [`Register`]
    pub registers: [u32; REGISTERS_COUNT],
    /// Selectors indexed by [`SegmentRegister`]
    pub segment_registers: [u16; SEGMENT_REGISTERS_COUNT],
    /// CR0-CR4, indexed by [`ControlRegister`]
    pub control_registers: [u32; CONTROL_REGISTERS_COUNT],
    /// Address of the next byte to fetch
    pub eip: u32,
    /// Interrupt descriptor table register
    pub idtr: DescriptorTableRegister,
    /// Instructions executed since reset
    pub cycles: u64,

    memory: FlatMemory,
    halted: bool,
    /// EIP of the instruction currently being executed, for diagnostics
    instruction_eip: u32,
    io: Box<dyn IoPorts>,
    interrupt_handlers: HashMap<u8, Box<dyn InterruptHandler>>,
    config: EmulatorConfig,
}

impl Emulator {
    /// Create an emulator with `memory_size` bytes of zeroed RAM
    pub fn new(memory_size: usize, eip: u32, esp: u32) -> Self {
        Self::with_config(EmulatorConfig {
            memory_size,
            initial_eip: eip,
            initial_esp: esp,
        })
    }

    pub fn with_config(config: EmulatorConfig) -> Self {
        let mut emu = Self {
            eflags: EFLAGS_RESET,
            registers: [0; REGISTERS_COUNT],
            segment_registers: [0; SEGMENT_REGISTERS_COUNT],
            control_registers: [0; CONTROL_REGISTERS_COUNT],
            eip: 0,
            idtr: DescriptorTableRegister::default(),
            cycles: 0,
            memory: FlatMemory::new(config.memory_size),
            halted: false,
            instruction_eip: 0,
            io: Box::new(NullIo),
            interrupt_handlers: HashMap::new(),
            config,
        };
        emu.reset();
        emu
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Reset the CPU to its initial state (preserves memory, I/O and
    /// registered interrupt handlers)
    pub fn reset(&mut self) {
        self.eflags = EFLAGS_RESET;
        self.registers = [0; REGISTERS_COUNT];
        self.registers[Register::Esp as usize] = self.config.initial_esp;
        self.segment_registers = [0; SEGMENT_REGISTERS_COUNT];
        self.control_registers = [0; CONTROL_REGISTERS_COUNT];
        self.eip = self.config.initial_eip;
        self.instruction_eip = self.eip;
        self.idtr = DescriptorTableRegister::default();
        self.cycles = 0;
        self.halted = false;
    }

    /// Attach the port I/O collaborator used by IN/OUT
    pub fn set_io(&mut self, io: Box<dyn IoPorts>) {
        self.io = io;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Current privilege level: the RPL of CS
    #[inline]
    pub fn cpl(&self) -> u8 {
        privilege_level(self.get_segment_register(SegmentRegister::Cs))
    }

    pub fn memory_size(&self) -> usize {
        self.memory.len()
    }

    /// Copy a machine image into RAM at `address`
    pub fn load_image(&mut self, address: u32, image: &[u8]) -> Result<()> {
        self.memory.load(address, image)?;
        log(LogCategory::Memory, LogLevel::Debug, || {
            format!("Loaded {} bytes at {:#010X}", image.len(), address)
        });
        Ok(())
    }

    // Memory access

    #[inline]
    pub fn get_memory8(&self, address: u32) -> Result<u8> {
        self.memory.read(address)
    }

    /// Little-endian 16-bit read
    pub fn get_memory16(&self, address: u32) -> Result<u16> {
        let low = self.get_memory8(address)? as u16;
        let high = self.get_memory8(address.wrapping_add(1))? as u16;
        Ok((high << 8) | low)
    }

    /// Little-endian 32-bit read, one byte at a time
    pub fn get_memory32(&self, address: u32) -> Result<u32> {
        let mut value = 0u32;
        for i in 0..4 {
            value |= (self.get_memory8(address.wrapping_add(i))? as u32) << (i * 8);
        }
        Ok(value)
    }

    #[inline]
    pub fn set_memory8(&mut self, address: u32, value: u8) -> Result<()> {
        self.memory.write(address, value)
    }

    pub fn set_memory16(&mut self, address: u32, value: u16) -> Result<()> {
        self.set_memory8(address, (value & 0xFF) as u8)?;
        self.set_memory8(address.wrapping_add(1), (value >> 8) as u8)
    }

    pub fn set_memory32(&mut self, address: u32, value: u32) -> Result<()> {
        for i in 0..4 {
            self.set_memory8(address.wrapping_add(i), (value >> (i * 8)) as u8)?;
        }
        Ok(())
    }

    // Register access

    /// Read an 8-bit register (AL, CL, DL, BL, AH, CH, DH, BH)
    #[inline]
    pub fn get_register8(&self, index: u8) -> u8 {
        debug_assert!(
            index < 8,
            "Invalid 8-bit register index: {} (must be 0-7)",
            index
        );
        let index = index & 0x07;
        if index < 4 {
            (self.registers[index as usize] & 0xFF) as u8
        } else {
            ((self.registers[(index - 4) as usize] >> 8) & 0xFF) as u8
        }
    }

    /// Write an 8-bit register, leaving the other 24 bits of the owner intact
    #[inline]
    pub fn set_register8(&mut self, index: u8, value: u8) {
        debug_assert!(
            index < 8,
            "Invalid 8-bit register index: {} (must be 0-7)",
            index
        );
        let index = index & 0x07;
        if index < 4 {
            let reg = &mut self.registers[index as usize];
            *reg = (*reg & 0xFFFF_FF00) | value as u32;
        } else {
            let reg = &mut self.registers[(index - 4) as usize];
            *reg = (*reg & 0xFFFF_00FF) | ((value as u32) << 8);
        }
    }

    #[inline]
    pub fn get_register32(&self, reg: Register) -> u32 {
        self.registers[reg as usize]
    }

    #[inline]
    pub fn set_register32(&mut self, reg: Register, value: u32) {
        self.registers[reg as usize] = value;
    }

    #[inline]
    pub fn get_segment_register(&self, seg: SegmentRegister) -> u16 {
        self.segment_registers[seg as usize]
    }

    #[inline]
    pub fn set_segment_register(&mut self, seg: SegmentRegister, value: u16) {
        self.segment_registers[seg as usize] = value;
    }

    pub fn get_control_register(&self, cr: ControlRegister) -> u32 {
        self.control_registers[cr as usize]
    }

    pub fn set_control_register(&mut self, cr: ControlRegister, value: u32) {
        self.control_registers[cr as usize] = value;
    }

    // Instruction fetch. None of these move EIP: the caller advances it by
    // exactly the bytes it consumed.

    #[inline]
    pub fn get_code8(&self, offset: u32) -> Result<u8> {
        self.get_memory8(self.eip.wrapping_add(offset))
    }

    #[inline]
    pub fn get_sign_code8(&self, offset: u32) -> Result<i32> {
        Ok(self.get_code8(offset)? as i8 as i32)
    }

    pub fn get_code16(&self, offset: u32) -> Result<u16> {
        self.get_memory16(self.eip.wrapping_add(offset))
    }

    pub fn get_code32(&self, offset: u32) -> Result<u32> {
        self.get_memory32(self.eip.wrapping_add(offset))
    }

    pub fn get_sign_code32(&self, offset: u32) -> Result<i32> {
        Ok(self.get_code32(offset)? as i32)
    }

    #[inline]
    pub(crate) fn advance_eip(&mut self, count: u32) {
        self.eip = self.eip.wrapping_add(count);
    }

    // Stack

    /// ESP -= 4, then store `value` at the new ESP
    pub fn push32(&mut self, value: u32) -> Result<()> {
        let address = self.get_register32(Register::Esp).wrapping_sub(4);
        self.set_memory32(address, value)?;
        self.set_register32(Register::Esp, address);
        Ok(())
    }

    /// Load the dword at ESP, then ESP += 4
    pub fn pop32(&mut self) -> Result<u32> {
        let address = self.get_register32(Register::Esp);
        let value = self.get_memory32(address)?;
        self.set_register32(Register::Esp, address.wrapping_add(4));
        Ok(value)
    }

    /// Selectors occupy a full 32-bit stack slot
    pub fn push_segment_register(&mut self, seg: SegmentRegister) -> Result<()> {
        self.push32(self.get_segment_register(seg) as u32)
    }

    pub fn pop_segment_register(&mut self, seg: SegmentRegister) -> Result<()> {
        let value = self.pop32()?;
        self.set_segment_register(seg, value as u16);
        Ok(())
    }

    // Save states

    pub fn snapshot(&self) -> CpuState {
        CpuState {
            eflags: self.eflags,
            registers: self.registers,
            segment_registers: self.segment_registers,
            control_registers: self.control_registers,
            eip: self.eip,
            idtr: self.idtr,
            halted: self.halted,
            cycles: self.cycles,
        }
    }

    pub fn restore(&mut self, state: &CpuState) {
        self.eflags = state.eflags;
        self.registers = state.registers;
        self.segment_registers = state.segment_registers;
        self.control_registers = state.control_registers;
        self.eip = state.eip;
        self.instruction_eip = state.eip;
        self.idtr = state.idtr;
        self.halted = state.halted;
        self.cycles = state.cycles;
    }

    /// Human-readable register dump for diagnostics
    pub fn dump_registers(&self) -> String {
        let mut out = String::new();
        for reg in Register::ALL {
            out.push_str(&format!("{} = {:08X}\n", reg.name(), self.get_register32(reg)));
        }
        out.push_str(&format!("EIP = {:08X}\n", self.eip));
        out.push_str(&format!(
            "EFLAGS = {:08X} [{}{}{}{}{}{}]\n",
            self.eflags,
            if self.is_overflow() { 'O' } else { '-' },
            if self.is_direction_down() { 'D' } else { '-' },
            if self.is_int_enabled() { 'I' } else { '-' },
            if self.is_sign() { 'S' } else { '-' },
            if self.is_zero() { 'Z' } else { '-' },
            if self.is_carry() { 'C' } else { '-' },
        ));
        let segments: Vec<String> = SegmentRegister::ALL
            .iter()
            .map(|&seg| format!("{}={:04X}", seg.name(), self.get_segment_register(seg)))
            .collect();
        out.push_str(&segments.join(" "));
        out.push('\n');
        out.push_str(&format!(
            "CR0 = {:08X} CR3 = {:08X}\n",
            self.get_control_register(ControlRegister::Cr0),
            self.get_control_register(ControlRegister::Cr3)
        ));
        out
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Self::with_config(EmulatorConfig::default())
    }
}

impl fmt::Debug for Emulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emulator")
            .field("eflags", &format_args!("{:08X}", self.eflags))
            .field("registers", &self.registers)
            .field("segment_registers", &self.segment_registers)
            .field("eip", &format_args!("{:08X}", self.eip))
            .field("halted", &self.halted)
            .field("memory_size", &self.memory.len())
            .finish_non_exhaustive()
    }
}

impl Cpu for Emulator {
    type Error = CpuError;

    fn reset(&mut self) {
        Emulator::reset(self);
    }

    fn step(&mut self) -> Result<()> {
        self.execute_one_instruction()
    }

    fn save_state(&self) -> Value {
        serde_json::to_value(self.snapshot()).unwrap_or_default()
    }

    fn load_state(&mut self, v: &Value) -> std::result::Result<(), serde_json::Error> {
        let state: CpuState = serde_json::from_value(v.clone())?;
        self.restore(&state);
        Ok(())
    }
}
