//! Instruction-level tests for the 32-bit x86 core
//!
//! Tests are organized by topic:
//! - `tests_scenarios`: access layer, stack, data movement and control flow
//! - `tests_flags`: arithmetic flag updates and conditional jumps
//! - `tests_shifts`: group 2 shift/rotate instructions
//! - `tests_addressing`: ModR/M, SIB, LEA and far pointer loads
//! - `tests_interrupts`: INT, IRET, far returns, IDT delivery and IRQs

mod tests_scenarios;

use super::Emulator;

/// Load address and initial EIP of every test program
pub(super) const CODE_BASE: u32 = 0x7C00;
/// Initial ESP
pub(super) const STACK_TOP: u32 = 0x9000;

/// Emulator with 64 KiB of RAM and `program` loaded at `CODE_BASE`
pub(super) fn emulator_with_program(program: &[u8]) -> Emulator {
    let mut emu = Emulator::new(0x10000, CODE_BASE, STACK_TOP);
    emu.load_image(CODE_BASE, program)
        .expect("program fits in memory");
    emu
}

/// Execute `count` instructions, failing the test on any CPU error
pub(super) fn run(emu: &mut Emulator, count: usize) {
    for _ in 0..count {
        if let Err(e) = emu.execute_one_instruction() {
            panic!("unexpected CPU error: {e}\n{}", emu.dump_registers());
        }
    }
}
