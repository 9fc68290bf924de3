//! Flat emulated RAM

use super::{CpuError, Result};

/// Byte-addressable RAM backing the whole emulated address space.
///
/// Every access is checked against the buffer extent; there is no open bus
/// value to fall back on.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    data: Vec<u8>,
}

impl FlatMemory {
    /// Zero-filled memory of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    fn check(&self, address: u32) -> Result<usize> {
        let index = address as usize;
        if index < self.data.len() {
            Ok(index)
        } else {
            Err(CpuError::MemoryOutOfRange {
                address,
                size: self.data.len(),
            })
        }
    }

    #[inline]
    pub fn read(&self, address: u32) -> Result<u8> {
        let index = self.check(address)?;
        Ok(self.data[index])
    }

    #[inline]
    pub fn write(&mut self, address: u32, value: u8) -> Result<()> {
        let index = self.check(address)?;
        self.data[index] = value;
        Ok(())
    }

    /// Copy `bytes` to `address`. Nothing is written unless the whole range
    /// fits.
    pub fn load(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        let start = address as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= self.data.len())
            .ok_or(CpuError::MemoryOutOfRange {
                address,
                size: self.data.len(),
            })?;
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}
