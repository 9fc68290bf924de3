//! Port-mapped I/O boundary
//!
//! Devices (PIT, keyboard controller, UART, ...) live outside the core. The
//! CPU only knows this trait and calls it synchronously from `IN`/`OUT`.

use crate::logging::{log, LogCategory, LogLevel};

/// Port I/O interface implemented by whatever sits on the other side of the bus
pub trait IoPorts {
    /// Read a byte from I/O port
    fn read8(&mut self, port: u16) -> u8;

    /// Write a byte to I/O port
    fn write8(&mut self, port: u16, value: u8);
}

/// Nothing attached: reads float high, writes vanish
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIo;

impl IoPorts for NullIo {
    fn read8(&mut self, port: u16) -> u8 {
        log(LogCategory::Stubs, LogLevel::Debug, || {
            format!("IN from unconnected port {:04X}", port)
        });
        0xFF
    }

    fn write8(&mut self, port: u16, value: u8) {
        log(LogCategory::Stubs, LogLevel::Debug, || {
            format!("OUT {:02X} to unconnected port {:04X}", value, port)
        });
    }
}
