//! Device Backing Store.
//!
//! A flat byte array sized to the device's advertised capacity. Every access
//! is bounds checked as a whole before any byte is touched, so a failed
//! write never leaves a partial update behind.

use crate::common::DeviceError;

/// Addressable device memory.
#[derive(Clone, Debug)]
pub struct BackingStore {
    data: Vec<u8>,
}

impl BackingStore {
    /// Creates a store of `capacity` bytes, every byte set to `fill`.
    pub fn new(capacity: u64, fill: u8) -> Self {
        Self {
            data: vec![fill; capacity as usize],
        }
    }

    /// Returns the capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    /// Checks that `[address, address + length)` lies inside the store.
    pub fn check(&self, address: u64, length: usize) -> Result<(), DeviceError> {
        self.span(address, length).map(|_| ())
    }

    fn span(&self, address: u64, length: usize) -> Result<std::ops::Range<usize>, DeviceError> {
        let end = address.checked_add(length as u64);
        match end {
            Some(end) if end <= self.capacity() => Ok(address as usize..end as usize),
            _ => Err(DeviceError::OutOfRange {
                address,
                length,
                capacity: self.capacity(),
            }),
        }
    }

    /// Reads `length` bytes at `address`.
    pub fn read(&self, address: u64, length: usize) -> Result<Vec<u8>, DeviceError> {
        let span = self.span(address, length)?;
        Ok(self.data[span].to_vec())
    }

    /// Writes `bytes` at `address`.
    pub fn write(&mut self, address: u64, bytes: &[u8]) -> Result<(), DeviceError> {
        let span = self.span(address, bytes.len())?;
        self.data[span].copy_from_slice(bytes);
        Ok(())
    }

    /// Fills `[address, address + length)` with `value`.
    pub fn fill(&mut self, address: u64, length: usize, value: u8) -> Result<(), DeviceError> {
        let span = self.span(address, length)?;
        self.data[span].fill(value);
        Ok(())
    }
}
