//! Interrupts and privilege transitions
//!
//! Software INT, hardware IRQ injection, IRET, far returns and far pointer
//! loads. Vectors are first offered to registered [`InterruptHandler`]s;
//! anything unclaimed is delivered through the IDT located by `idtr`.

use super::{CpuError, Emulator, Register, Result, SegmentRegister};
use crate::cpu_ia32_protected::{privilege_level, GateDescriptor, GateKind};
use crate::logging::{log, LogCategory, LogLevel};

/// IRQ 0 is delivered as vector T_IRQ0
pub const T_IRQ0: u8 = 32;

pub const IRQ_TIMER: u8 = 0;
pub const IRQ_KBD: u8 = 1;
pub const IRQ_COM1: u8 = 4;
pub const IRQ_IDE: u8 = 14;
pub const IRQ_ERROR: u8 = 19;
pub const IRQ_SPURIOUS: u8 = 31;

/// Service routine for one interrupt vector, implemented outside the CPU
/// (BIOS calls, device models).
///
/// Returning `Ok(true)` claims the vector: nothing is pushed and execution
/// continues at the current EIP. `Ok(false)` passes it on to the IDT.
pub trait InterruptHandler {
    fn handle(&mut self, emu: &mut Emulator, vector: u8) -> Result<bool>;
}

impl<F> InterruptHandler for F
where
    F: FnMut(&mut Emulator, u8) -> Result<bool>,
{
    fn handle(&mut self, emu: &mut Emulator, vector: u8) -> Result<bool> {
        self(emu, vector)
    }
}

impl Emulator {
    /// Install `handler` for `vector`, replacing any previous one
    pub fn register_interrupt_handler<H>(&mut self, vector: u8, handler: H)
    where
        H: InterruptHandler + 'static,
    {
        self.interrupt_handlers.insert(vector, Box::new(handler));
    }

    pub fn unregister_interrupt_handler(&mut self, vector: u8) -> bool {
        self.interrupt_handlers.remove(&vector).is_some()
    }

    /// Dispatch `vector`. EIP must already point past the instruction that
    /// raised it (or at the next instruction for a hardware interrupt).
    pub fn handle_interrupt(&mut self, vector: u8, is_software: bool) -> Result<()> {
        // The handler is taken out of the registry while it runs so it can
        // borrow the emulator mutably.
        if let Some(mut handler) = self.interrupt_handlers.remove(&vector) {
            let claimed = handler.handle(self, vector);
            self.interrupt_handlers.entry(vector).or_insert(handler);
            if claimed? {
                log(LogCategory::Interrupts, LogLevel::Trace, || {
                    format!("INT {:02X}h serviced by registered handler", vector)
                });
                return Ok(());
            }
        }

        self.deliver_through_idt(vector, is_software)
    }

    fn deliver_through_idt(&mut self, vector: u8, is_software: bool) -> Result<()> {
        let address = self
            .idtr
            .gate_address(vector)
            .ok_or(CpuError::InvalidInterruptGate { vector })?;

        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.get_memory8(address.wrapping_add(i as u32))?;
        }
        let gate = GateDescriptor::from_bytes(&bytes);

        let kind = match gate.kind() {
            Some(kind) if gate.is_present() => kind,
            _ => return Err(CpuError::InvalidInterruptGate { vector }),
        };

        let cpl = self.cpl();
        if is_software && gate.dpl() < cpl {
            return Err(CpuError::GeneralProtection {
                vector,
                cpl,
                dpl: gate.dpl(),
            });
        }

        // Entering a more privileged ring saves the interrupted stack so
        // that IRET can restore it.
        let new_cpl = privilege_level(gate.selector);
        if new_cpl < cpl {
            let esp = self.get_register32(Register::Esp);
            self.push_segment_register(SegmentRegister::Ss)?;
            self.push32(esp)?;
        }

        self.push32(self.eflags)?;
        self.push_segment_register(SegmentRegister::Cs)?;
        self.push32(self.eip)?;

        if kind == GateKind::Interrupt {
            self.set_int_flag(false);
        }

        log(LogCategory::Interrupts, LogLevel::Debug, || {
            format!(
                "INT {:02X}h -> {:04X}:{:08X} (CPL {} -> {}, {})",
                vector,
                gate.selector,
                gate.offset,
                cpl,
                new_cpl,
                if is_software { "software" } else { "hardware" }
            )
        });

        self.set_segment_register(SegmentRegister::Cs, gate.selector);
        self.eip = gate.offset;
        self.halted = false;
        Ok(())
    }

    /// Inject hardware interrupt `irq`. Returns false without side effects
    /// when interrupts are disabled.
    pub fn raise_irq(&mut self, irq: u8) -> Result<bool> {
        if !self.is_int_enabled() {
            return Ok(false);
        }
        self.handle_interrupt(T_IRQ0.wrapping_add(irq), false)?;
        self.halted = false;
        Ok(true)
    }

    /// INT imm8 (0xCD)
    pub(super) fn int_imm8(&mut self) -> Result<()> {
        let vector = self.get_code8(0)?;
        self.advance_eip(1);
        self.handle_interrupt(vector, true)
    }

    /// IRET (0xCF)
    ///
    /// EFLAGS is restored wholesale, without masking privileged bits.
    pub(super) fn iret(&mut self) -> Result<()> {
        let cpl = self.cpl();

        self.eip = self.pop32()?;
        self.pop_segment_register(SegmentRegister::Cs)?;
        self.eflags = self.pop32()?;

        let new_cpl = self.cpl();
        if new_cpl > cpl {
            let esp = self.pop32()?;
            let ss = self.pop32()?;
            self.set_register32(Register::Esp, esp);
            self.set_segment_register(SegmentRegister::Ss, ss as u16);
        }

        log(LogCategory::Interrupts, LogLevel::Debug, || {
            format!(
                "IRET -> {:04X}:{:08X} (CPL {} -> {})",
                self.get_segment_register(SegmentRegister::Cs),
                self.eip,
                cpl,
                new_cpl
            )
        });
        Ok(())
    }

    /// RET far (0xCB): same-privilege return only
    pub(super) fn ret_far(&mut self) -> Result<()> {
        self.eip = self.pop32()?;
        self.pop_segment_register(SegmentRegister::Cs)
    }

    /// LES (0xC4)
    pub(super) fn les(&mut self) -> Result<()> {
        self.load_far_pointer(SegmentRegister::Es)
    }

    /// LDS (0xC5)
    pub(super) fn lds(&mut self) -> Result<()> {
        self.load_far_pointer(SegmentRegister::Ds)
    }

    /// Selector (16 bits) at the operand address, offset (32 bits) right
    /// after it
    fn load_far_pointer(&mut self, seg: SegmentRegister) -> Result<()> {
        let modrm = self.parse_modrm()?;
        let address = self.calc_memory_address(&modrm)?;
        let selector = self.get_memory16(address)?;
        let offset = self.get_memory32(address.wrapping_add(2))?;
        self.set_segment_register(seg, selector);
        self.set_r32(&modrm, offset);
        Ok(())
    }
}
