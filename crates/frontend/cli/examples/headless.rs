use std::cell::Cell;
use std::rc::Rc;

use x86emu_core::cpu_ia32::{IRQ_TIMER, T_IRQ0};
use x86emu_core::{Cpu, Emulator, Register};

/// Sums 1..=10 into EAX, then halts waiting for the timer.
const PROGRAM: [u8; 12] = [
    0xB9, 0x0A, 0x00, 0x00, 0x00, // MOV ECX, 10
    0x01, 0xC8, // ADD EAX, ECX
    0x49, // DEC ECX
    0x75, 0xFB, // JNZ -5
    0xFB, // STI
    0xF4, // HLT
];

fn main() {
    let mut emu = Emulator::new(0x10000, 0x7C00, 0x7C00);
    if let Err(e) = emu.load_image(0x7C00, &PROGRAM) {
        eprintln!("load failed: {}", e);
        return;
    }

    let ticks = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&ticks);
    emu.register_interrupt_handler(
        T_IRQ0 + IRQ_TIMER,
        move |_: &mut Emulator, _: u8| -> Result<bool, x86emu_core::CpuError> {
            counter.set(counter.get() + 1);
            Ok(true)
        },
    );

    while !emu.is_halted() {
        if let Err(e) = emu.step() {
            eprintln!("{}\n{}", e, emu.dump_registers());
            return;
        }
    }
    println!("Headless run: EAX={} after {} instructions", emu.get_register32(Register::Eax), emu.cycles);

    match emu.raise_irq(IRQ_TIMER) {
        Ok(delivered) => println!(
            "Timer IRQ delivered: {}, ticks: {}, halted: {}",
            delivered,
            ticks.get(),
            emu.is_halted()
        ),
        Err(e) => eprintln!("IRQ failed: {}", e),
    }
    match serde_json::to_string_pretty(&emu.save_state()) {
        Ok(state) => println!("Save-state: {}", state),
        Err(e) => eprintln!("save failed: {}", e),
    }
}
