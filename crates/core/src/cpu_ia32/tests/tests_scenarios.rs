//! Tests for the access layer, stack and general instruction flow

use std::cell::RefCell;
use std::rc::Rc;

use super::{emulator_with_program, run, CODE_BASE, STACK_TOP};
use crate::cpu_ia32::{
    ControlRegister, CpuError, Emulator, IoPorts, Register, SegmentRegister, AH, AL, BH, BL, CH,
    CL, DH, DL,
};

#[test]
fn test_register8_aliasing() {
    let mut emu = Emulator::new(0x100, 0, 0);
    let low = [AL, CL, DL, BL];
    let high = [AH, CH, DH, BH];

    for (i, reg) in [Register::Eax, Register::Ecx, Register::Edx, Register::Ebx]
        .into_iter()
        .enumerate()
    {
        emu.set_register32(reg, 0x1122_3344);

        emu.set_register8(low[i], 0xAA);
        assert_eq!(emu.get_register32(reg), 0x1122_33AA, "low byte of {}", reg.name());
        assert_eq!(emu.get_register8(low[i]), 0xAA);

        emu.set_register8(high[i], 0xBB);
        assert_eq!(emu.get_register32(reg), 0x1122_BBAA, "high byte of {}", reg.name());
        assert_eq!(emu.get_register8(high[i]), 0xBB);
        assert_eq!(emu.get_register8(low[i]), 0xAA, "high write leaves low byte");
    }

    // ESP..EDI have no 8-bit aliases
    for reg in [Register::Esp, Register::Ebp, Register::Esi, Register::Edi] {
        assert_eq!(emu.get_register32(reg), 0);
    }
}

#[test]
fn test_memory32_is_little_endian() {
    let mut emu = Emulator::new(0x100, 0, 0);
    emu.set_memory32(0x10, 0x1234_5678).unwrap();
    assert_eq!(emu.get_memory8(0x10).unwrap(), 0x78);
    assert_eq!(emu.get_memory8(0x13).unwrap(), 0x12);
    assert_eq!(emu.get_memory16(0x11).unwrap(), 0x3456);

    // Unaligned access is fine
    emu.set_memory32(0x21, 0xAABB_CCDD).unwrap();
    assert_eq!(emu.get_memory32(0x21).unwrap(), 0xAABB_CCDD);
}

#[test]
fn test_memory_out_of_range() {
    let mut emu = Emulator::new(0x100, 0, 0);
    assert_eq!(
        emu.get_memory8(0x100),
        Err(CpuError::MemoryOutOfRange {
            address: 0x100,
            size: 0x100
        })
    );
    // A dword straddling the end fails as a whole read
    assert!(emu.get_memory32(0xFE).is_err());
    assert!(emu.set_memory32(0xFD, 0).is_err());
    assert!(emu.set_memory32(0xFC, 0).is_ok());
}

#[test]
fn test_fetch_does_not_move_eip() {
    let emu = emulator_with_program(&[0xB8, 0x78, 0x56, 0x34, 0x12, 0xFE]);
    assert_eq!(emu.get_code8(0).unwrap(), 0xB8);
    assert_eq!(emu.get_code32(1).unwrap(), 0x1234_5678);
    assert_eq!(emu.get_code16(1).unwrap(), 0x5678);
    assert_eq!(emu.get_sign_code8(5).unwrap(), -2);
    assert_eq!(emu.get_sign_code32(1).unwrap(), 0x1234_5678);
    assert_eq!(emu.eip, CODE_BASE);
}

#[test]
fn test_push_pop_roundtrip() {
    let mut emu = emulator_with_program(&[]);
    for value in [0u32, 1, 0x8000_0000, 0xFFFF_FFFF, 0xDEAD_BEEF] {
        emu.push32(value).unwrap();
        assert_eq!(emu.get_register32(Register::Esp), STACK_TOP - 4);
        assert_eq!(emu.get_memory32(STACK_TOP - 4).unwrap(), value);
        assert_eq!(emu.pop32().unwrap(), value);
        assert_eq!(emu.get_register32(Register::Esp), STACK_TOP);
    }
}

#[test]
fn test_push_pop_registers() {
    // PUSH EAX; PUSH EBX; POP ECX; POP EDX
    let mut emu = emulator_with_program(&[0x50, 0x53, 0x59, 0x5A]);
    emu.set_register32(Register::Eax, 0x1111_1111);
    emu.set_register32(Register::Ebx, 0x2222_2222);
    run(&mut emu, 4);

    assert_eq!(emu.get_register32(Register::Ecx), 0x2222_2222);
    assert_eq!(emu.get_register32(Register::Edx), 0x1111_1111);
    assert_eq!(emu.get_register32(Register::Esp), STACK_TOP);
}

#[test]
fn test_push_immediates() {
    // PUSH 0x12345678; PUSH -2
    let mut emu = emulator_with_program(&[0x68, 0x78, 0x56, 0x34, 0x12, 0x6A, 0xFE]);
    run(&mut emu, 2);
    assert_eq!(emu.pop32().unwrap(), 0xFFFF_FFFE, "imm8 is sign-extended");
    assert_eq!(emu.pop32().unwrap(), 0x1234_5678);
    assert_eq!(emu.eip, CODE_BASE + 7);
}

#[test]
fn test_segment_push_pop() {
    // PUSH DS; POP ES; PUSH CS; POP SS
    let mut emu = emulator_with_program(&[0x1E, 0x07, 0x0E, 0x17]);
    emu.set_segment_register(SegmentRegister::Ds, 0x0023);
    emu.set_segment_register(SegmentRegister::Cs, 0x0008);
    run(&mut emu, 4);

    assert_eq!(emu.get_segment_register(SegmentRegister::Es), 0x0023);
    assert_eq!(emu.get_segment_register(SegmentRegister::Ss), 0x0008);
    assert_eq!(emu.get_register32(Register::Esp), STACK_TOP);
}

#[test]
fn test_ret_pops_eip() {
    let mut emu = emulator_with_program(&[0xC3]);
    emu.push32(0x0000_1234).unwrap();
    run(&mut emu, 1);

    assert_eq!(emu.eip, 0x1234);
    assert_eq!(emu.get_register32(Register::Esp), STACK_TOP);
}

#[test]
fn test_ret_imm16_releases_arguments() {
    let mut emu = emulator_with_program(&[0xC2, 0x08, 0x00]);
    emu.push32(0xAAAA_AAAA).unwrap();
    emu.push32(0xBBBB_BBBB).unwrap();
    emu.push32(0x0000_2000).unwrap();
    run(&mut emu, 1);

    assert_eq!(emu.eip, 0x2000);
    assert_eq!(emu.get_register32(Register::Esp), STACK_TOP);
}

#[test]
fn test_mov_rm32_imm32_to_register() {
    // MOV EBX, 0x12345678 via C7 /0
    let mut emu = emulator_with_program(&[0xC7, 0xC3, 0x78, 0x56, 0x34, 0x12]);
    run(&mut emu, 1);

    assert_eq!(emu.get_register32(Register::Ebx), 0x1234_5678);
    assert_eq!(emu.eip, CODE_BASE + 6, "opcode + ModR/M + imm32");
}

#[test]
fn test_mov_rm32_imm32_rejects_other_sub_opcodes() {
    let mut emu = emulator_with_program(&[0xC7, 0xCB, 0, 0, 0, 0]);
    let err = emu.execute_one_instruction().unwrap_err();
    assert_eq!(
        err,
        CpuError::UnimplementedSubOpcode {
            opcode: 0xC7,
            sub_opcode: 1,
            eip: CODE_BASE
        }
    );
}

#[test]
fn test_mov_forms() {
    let program = [
        0xB8, 0x44, 0x33, 0x22, 0x11, // MOV EAX, 0x11223344
        0x89, 0xC1, // MOV ECX, EAX
        0xB4, 0x99, // MOV AH, 0x99
        0x88, 0xE2, // MOV DL, AH
        0x8B, 0xD9, // MOV EBX, ECX
        0x8A, 0xF8, // MOV BH, AL
    ];
    let mut emu = emulator_with_program(&program);
    run(&mut emu, 6);

    assert_eq!(emu.get_register32(Register::Eax), 0x1122_9944);
    assert_eq!(emu.get_register32(Register::Ecx), 0x1122_3344);
    assert_eq!(emu.get_register8(DL), 0x99);
    assert_eq!(emu.get_register32(Register::Ebx), 0x1122_4444);
    assert_eq!(emu.eip, CODE_BASE + program.len() as u32);
}

#[test]
fn test_mov_segment_registers() {
    // MOV DS, AX; MOV [0x100], DS; MOV EDX, SS
    let program = [
        0x8E, 0xD8, // MOV DS, EAX
        0x8C, 0x1D, 0x00, 0x01, 0x00, 0x00, // MOV [0x100], DS
        0x8C, 0xD2, // MOV EDX, SS
    ];
    let mut emu = emulator_with_program(&program);
    emu.set_register32(Register::Eax, 0xFFFF_0010);
    emu.set_segment_register(SegmentRegister::Ss, 0x0018);
    emu.set_memory32(0x100, 0xAAAA_AAAA).unwrap();
    run(&mut emu, 3);

    assert_eq!(emu.get_segment_register(SegmentRegister::Ds), 0x0010);
    assert_eq!(emu.get_memory32(0x100).unwrap(), 0xAAAA_0010, "16-bit store");
    assert_eq!(emu.get_register32(Register::Edx), 0x0000_0018);
}

#[test]
fn test_mov_to_cs_is_rejected() {
    let mut emu = emulator_with_program(&[0x8E, 0xC8]);
    assert!(matches!(
        emu.execute_one_instruction(),
        Err(CpuError::UnimplementedSubOpcode {
            opcode: 0x8E,
            sub_opcode: 1,
            ..
        })
    ));
}

#[test]
fn test_call_and_ret() {
    let program = [
        0xE8, 0x03, 0x00, 0x00, 0x00, // CALL +3
        0xF4, // HLT
        0x90, // NOP (skipped)
        0x90, // NOP (skipped)
        0xB8, 0x2A, 0x00, 0x00, 0x00, // MOV EAX, 42
        0xC3, // RET
    ];
    let mut emu = emulator_with_program(&program);

    run(&mut emu, 1);
    assert_eq!(emu.eip, CODE_BASE + 8);
    assert_eq!(emu.get_memory32(STACK_TOP - 4).unwrap(), CODE_BASE + 5);

    run(&mut emu, 3);
    assert_eq!(emu.get_register32(Register::Eax), 42);
    assert!(emu.is_halted());
    assert_eq!(emu.eip, CODE_BASE + 6);
}

#[test]
fn test_call_and_jmp_through_rm32() {
    let program = [
        0xFF, 0xD3, // CALL EBX
        0xFF, 0x25, 0x00, 0x02, 0x00, 0x00, // JMP [0x200]
    ];
    let mut emu = emulator_with_program(&program);
    emu.set_register32(Register::Ebx, CODE_BASE + 2);
    emu.set_memory32(0x200, 0x3000).unwrap();
    run(&mut emu, 2);

    assert_eq!(emu.eip, 0x3000);
    assert_eq!(emu.pop32().unwrap(), CODE_BASE + 2, "return address");
}

#[test]
fn test_group5_inc_dec_push() {
    let program = [
        0xFF, 0x05, 0x00, 0x02, 0x00, 0x00, // INC dword [0x200]
        0xFF, 0xC9, // DEC ECX
        0xFF, 0x35, 0x00, 0x02, 0x00, 0x00, // PUSH dword [0x200]
    ];
    let mut emu = emulator_with_program(&program);
    emu.set_memory32(0x200, 0x0000_00FF).unwrap();
    run(&mut emu, 3);

    assert_eq!(emu.get_memory32(0x200).unwrap(), 0x100);
    assert_eq!(emu.get_register32(Register::Ecx), 0xFFFF_FFFF);
    assert_eq!(emu.pop32().unwrap(), 0x100);
}

#[test]
fn test_jumps() {
    let program = [
        0xEB, 0x02, // JMP +2
        0xF4, 0xF4, // (skipped)
        0xE9, 0xFA, 0xFF, 0xFF, 0xFF, // JMP -6 (lands on the second skipped byte)
    ];
    let mut emu = emulator_with_program(&program);
    run(&mut emu, 1);
    assert_eq!(emu.eip, CODE_BASE + 4);
    run(&mut emu, 1);
    assert_eq!(emu.eip, CODE_BASE + 3);
}

#[test]
fn test_leave_frame() {
    let program = [
        0x55, // PUSH EBP
        0x89, 0xE5, // MOV EBP, ESP
        0x83, 0xEC, 0x10, // SUB ESP, 16
        0xC9, // LEAVE
    ];
    let mut emu = emulator_with_program(&program);
    emu.set_register32(Register::Ebp, 0xCAFE);
    run(&mut emu, 3);
    assert_eq!(emu.get_register32(Register::Esp), STACK_TOP - 4 - 16);

    run(&mut emu, 1);
    assert_eq!(emu.get_register32(Register::Esp), STACK_TOP);
    assert_eq!(emu.get_register32(Register::Ebp), 0xCAFE);
}

#[test]
fn test_counting_loop() {
    // ECX = 5; EAX = 0; loop: ADD EAX, 3; DEC ECX; JNZ loop
    let program = [
        0xB9, 0x05, 0x00, 0x00, 0x00, // MOV ECX, 5
        0x31, 0xC0, // XOR EAX, EAX
        0x05, 0x03, 0x00, 0x00, 0x00, // ADD EAX, 3
        0x49, // DEC ECX
        0x75, 0xF8, // JNZ -8
        0xF4, // HLT
    ];
    let mut emu = emulator_with_program(&program);

    let mut steps = 0;
    while !emu.is_halted() {
        emu.execute_one_instruction().unwrap();
        steps += 1;
        assert!(steps < 100, "loop did not terminate");
    }

    assert_eq!(emu.get_register32(Register::Eax), 15);
    assert_eq!(emu.get_register32(Register::Ecx), 0);
    assert_eq!(emu.cycles, 2 + 5 * 3 + 1);
}

#[test]
fn test_halted_cpu_does_not_execute() {
    let mut emu = emulator_with_program(&[0xF4, 0x40]);
    run(&mut emu, 3);
    assert!(emu.is_halted());
    assert_eq!(emu.eip, CODE_BASE + 1);
    assert_eq!(emu.get_register32(Register::Eax), 0);
    assert_eq!(emu.cycles, 1);
}

#[test]
fn test_flag_instructions() {
    let mut emu = emulator_with_program(&[0xFB, 0xFD, 0xFA, 0xFC]);
    run(&mut emu, 2);
    assert!(emu.is_int_enabled());
    assert!(emu.is_direction_down());
    run(&mut emu, 2);
    assert!(!emu.is_int_enabled());
    assert!(!emu.is_direction_down());
}

#[test]
fn test_unimplemented_opcode() {
    let mut emu = emulator_with_program(&[0x90, 0x0F, 0x0B]);
    run(&mut emu, 1);

    let err = emu.execute_one_instruction().unwrap_err();
    assert_eq!(
        err,
        CpuError::UnimplementedOpcode {
            opcode: 0x0F,
            eip: CODE_BASE + 1
        }
    );
    assert_eq!(err.to_string(), "Not implemented: Op: 0F at EIP=0x00007C01");
}

#[test]
fn test_mov_rm16_imm16() {
    let program = [
        0x66, 0xC7, 0x03, 0x34, 0x12, // MOV word [EBX], 0x1234
        0x66, 0xC7, 0xC1, 0xCD, 0xAB, // MOV CX, 0xABCD
    ];
    let mut emu = emulator_with_program(&program);
    emu.set_register32(Register::Ebx, 0x2000);
    emu.set_memory32(0x2000, 0xFFFF_FFFF).unwrap();
    emu.set_register32(Register::Ecx, 0x5555_0000);

    run(&mut emu, 1);
    assert_eq!(emu.get_memory32(0x2000).unwrap(), 0xFFFF_1234, "only two bytes stored");
    assert_eq!(emu.eip, CODE_BASE + 5);

    run(&mut emu, 1);
    assert_eq!(emu.get_register32(Register::Ecx), 0x5555_ABCD);
    assert_eq!(emu.eip, CODE_BASE + 10);
    assert_eq!(emu.cycles, 2, "prefix and opcode count as one instruction");
}

#[test]
fn test_operand_size_prefix_other_opcodes() {
    let mut emu = emulator_with_program(&[0x66, 0x90]);
    assert_eq!(
        emu.execute_one_instruction(),
        Err(CpuError::UnimplementedOpcode {
            opcode: 0x66,
            eip: CODE_BASE
        })
    );

    // MOV r/m16, imm16 only exists as /0
    let mut emu = emulator_with_program(&[0x66, 0xC7, 0xC8, 0x00, 0x00]);
    assert_eq!(
        emu.execute_one_instruction(),
        Err(CpuError::UnimplementedSubOpcode {
            opcode: 0xC7,
            sub_opcode: 1,
            eip: CODE_BASE
        })
    );
}

#[test]
fn test_fetch_past_end_of_memory() {
    let mut emu = Emulator::new(0x100, 0xFF, 0x80);
    emu.set_memory8(0xFF, 0xB8).unwrap();
    assert!(matches!(
        emu.execute_one_instruction(),
        Err(CpuError::MemoryOutOfRange { address: 0x100, .. })
    ));
}

/// Records OUT writes, answers IN with a fixed byte
struct RecordingIo {
    writes: Rc<RefCell<Vec<(u16, u8)>>>,
}

impl IoPorts for RecordingIo {
    fn read8(&mut self, port: u16) -> u8 {
        (port & 0xFF) as u8 ^ 0x5A
    }

    fn write8(&mut self, port: u16, value: u8) {
        self.writes.borrow_mut().push((port, value));
    }
}

#[test]
fn test_port_io() {
    let program = [
        0xE4, 0x60, // IN AL, 0x60
        0xE6, 0x80, // OUT 0x80, AL
        0xEC, // IN AL, DX
        0xEE, // OUT DX, AL
    ];
    let writes = Rc::new(RefCell::new(Vec::new()));
    let mut emu = emulator_with_program(&program);
    emu.set_io(Box::new(RecordingIo {
        writes: Rc::clone(&writes),
    }));
    emu.set_register32(Register::Edx, 0x03F8);

    run(&mut emu, 2);
    assert_eq!(emu.get_register8(AL), 0x60 ^ 0x5A);
    run(&mut emu, 2);
    assert_eq!(emu.get_register8(AL), 0xF8 ^ 0x5A);

    assert_eq!(
        *writes.borrow(),
        vec![(0x0080, 0x60 ^ 0x5A), (0x03F8, 0xF8 ^ 0x5A)]
    );
    assert_eq!(emu.eip, CODE_BASE + 6);
}

#[test]
fn test_null_io_reads_all_ones() {
    let mut emu = emulator_with_program(&[0xEC]);
    run(&mut emu, 1);
    assert_eq!(emu.get_register8(AL), 0xFF);
}

#[test]
fn test_snapshot_restore() {
    let mut emu = emulator_with_program(&[0x40]);
    emu.set_register32(Register::Esi, 0x1234);
    emu.set_segment_register(SegmentRegister::Gs, 0x30);
    emu.set_control_register(ControlRegister::Cr3, 0x0010_0000);
    let state = emu.snapshot();

    run(&mut emu, 1);
    emu.set_register32(Register::Esi, 0);
    emu.set_control_register(ControlRegister::Cr3, 0);
    emu.restore(&state);

    assert_eq!(emu.snapshot(), state);
    assert_eq!(emu.eip, CODE_BASE);
    assert_eq!(emu.get_register32(Register::Esi), 0x1234);
    assert_eq!(emu.get_control_register(ControlRegister::Cr3), 0x0010_0000);
    assert!(emu.dump_registers().contains("CR3 = 00100000"));
}

#[test]
fn test_reset_keeps_memory() {
    let mut emu = emulator_with_program(&[0x40]);
    run(&mut emu, 1);
    emu.set_control_register(ControlRegister::Cr0, 1);
    emu.reset();

    assert_eq!(emu.eip, CODE_BASE);
    assert_eq!(emu.get_control_register(ControlRegister::Cr0), 0);
    assert_eq!(emu.memory_size(), 0x10000);
    assert_eq!(emu.get_register32(Register::Eax), 0);
    assert_eq!(emu.get_register32(Register::Esp), STACK_TOP);
    assert_eq!(emu.get_memory8(CODE_BASE).unwrap(), 0x40);
}
