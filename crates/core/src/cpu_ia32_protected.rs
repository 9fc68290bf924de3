//! Protected mode structures used by interrupt delivery
//!
//! The core runs with a flat memory model, so segment descriptors are never
//! consulted for address translation. What protected mode does contribute is
//! privilege: the requested privilege level carried in the low two bits of
//! every selector, and the interrupt descriptor table whose gates name the
//! handler's code selector, entry offset and required privilege.

use serde::{Deserialize, Serialize};

/// Mask selecting the requested privilege level (RPL) of a selector
pub const SELECTOR_RPL_MASK: u16 = 0x0003;

/// Size in bytes of one IDT gate descriptor
pub const GATE_DESCRIPTOR_SIZE: u32 = 8;

/// Requested privilege level (ring 0-3) of a segment selector
#[inline]
pub fn privilege_level(selector: u16) -> u8 {
    (selector & SELECTOR_RPL_MASK) as u8
}

/// Descriptor Table Register (IDTR)
///
/// Contains the linear base address and the limit (size in bytes - 1) of a
/// descriptor table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorTableRegister {
    pub base: u32,
    pub limit: u16,
}

impl DescriptorTableRegister {
    pub fn new(base: u32, limit: u16) -> Self {
        Self { base, limit }
    }

    /// Linear address of gate `vector`, or None when the whole 8-byte entry
    /// does not fit under the limit.
    pub fn gate_address(&self, vector: u8) -> Option<u32> {
        let offset = (vector as u32) * GATE_DESCRIPTOR_SIZE;
        if offset + (GATE_DESCRIPTOR_SIZE - 1) > self.limit as u32 {
            return None;
        }
        Some(self.base.wrapping_add(offset))
    }
}

/// 32-bit gate types accepted in the IDT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    /// Clears IF on entry
    Interrupt,
    /// Leaves IF untouched
    Trap,
}

/// IDT gate descriptor (8 bytes)
///
/// Format:
/// - Bytes 0-1: Handler offset (bits 0-15)
/// - Bytes 2-3: Code segment selector
/// - Byte 4: Reserved
/// - Byte 5: Type and attributes (P, DPL, type)
/// - Bytes 6-7: Handler offset (bits 16-31)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDescriptor {
    pub offset: u32,
    pub selector: u16,
    pub type_attributes: u8,
}

impl GateDescriptor {
    /// Parse a gate descriptor from 8 bytes in memory
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        let offset_low = u16::from_le_bytes([bytes[0], bytes[1]]);
        let selector = u16::from_le_bytes([bytes[2], bytes[3]]);
        let offset_high = u16::from_le_bytes([bytes[6], bytes[7]]);

        Self {
            offset: (offset_low as u32) | ((offset_high as u32) << 16),
            selector,
            type_attributes: bytes[5],
        }
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        (self.type_attributes & gate_attributes::PRESENT) != 0
    }

    /// Descriptor privilege level: the least privileged ring allowed to
    /// reach this gate with a software INT
    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.type_attributes & gate_attributes::DPL_MASK) >> 5
    }

    /// None for task gates, 16-bit gates and anything else we do not deliver
    pub fn kind(&self) -> Option<GateKind> {
        match self.type_attributes & gate_attributes::TYPE_MASK {
            gate_attributes::INTERRUPT_GATE_32 => Some(GateKind::Interrupt),
            gate_attributes::TRAP_GATE_32 => Some(GateKind::Trap),
            _ => None,
        }
    }
}

/// Type/attribute byte fields of a gate descriptor
pub mod gate_attributes {
    pub const TYPE_MASK: u8 = 0x0F;
    pub const INTERRUPT_GATE_32: u8 = 0x0E;
    pub const TRAP_GATE_32: u8 = 0x0F;
    pub const DPL_MASK: u8 = 0x60;
    pub const PRESENT: u8 = 0x80;
}
