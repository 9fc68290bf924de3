//! Core primitives of the x86emu 32-bit x86 emulator.

pub mod cpu_ia32;
pub mod cpu_ia32_protected;
pub mod logging;

pub use cpu_ia32::{CpuError, Emulator, EmulatorConfig, Register, SegmentRegister};

use serde_json::Value;

/// A CPU-like component that can be stepped one instruction at a time.
pub trait Cpu {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reset to initial power-on state
    fn reset(&mut self);

    /// Execute exactly one instruction
    fn step(&mut self) -> Result<(), Self::Error>;

    /// Return a JSON-serializable save state for debugging.
    /// Save states carry registers only, never RAM contents.
    fn save_state(&self) -> Value;

    /// Load a JSON save state produced by `save_state`.
    fn load_state(&mut self, v: &Value) -> Result<(), serde_json::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_trait_steps_emulator() {
        let mut emu = Emulator::new(0x1000, 0x100, 0x800);
        emu.load_image(0x100, &[0x90, 0x90]).expect("load");

        let cpu: &mut dyn Cpu<Error = CpuError> = &mut emu;
        cpu.step().expect("step");
        cpu.step().expect("step");

        assert_eq!(emu.eip, 0x102);
        assert_eq!(emu.cycles, 2);
    }

    #[test]
    fn cpu_trait_save_load_roundtrip() {
        let mut emu = Emulator::new(0x1000, 0x100, 0x800);
        emu.set_register32(Register::Ebx, 0xDEAD_BEEF);
        emu.set_segment_register(SegmentRegister::Ss, 0x0010);

        let v = emu.save_state();
        let s = serde_json::to_string(&v).expect("serialize");
        let v2: serde_json::Value = serde_json::from_str(&s).expect("deserialize");

        let mut other = Emulator::new(0x1000, 0, 0);
        other.load_state(&v2).expect("load state");
        assert_eq!(other.get_register32(Register::Ebx), 0xDEAD_BEEF);
        assert_eq!(other.get_segment_register(SegmentRegister::Ss), 0x0010);
        assert_eq!(other.eip, 0x100);
        assert_eq!(other.get_register32(Register::Esp), 0x800);
    }

    #[test]
    fn load_state_rejects_garbage() {
        let mut emu = Emulator::default();
        let bad = serde_json::json!({"eflags": "not a number"});
        assert!(emu.load_state(&bad).is_err());
    }

    #[test]
    fn default_config_deserializes_from_partial_json() {
        let config: EmulatorConfig =
            serde_json::from_str(r#"{"memory_size": 65536}"#).expect("config");
        assert_eq!(config.memory_size, 65536);
        assert_eq!(config.initial_eip, 0x7C00);
    }
}
