//! Configuration Space and MMIO Registers.
//!
//! Each device exposes a 4 KiB PCIe-style configuration space reached with
//! CfgRd/CfgWr and an optional MMIO register window reached with
//! MemRd/MemWr. Identification dwords are read-only; every other dword is
//! plain read/write storage.

use super::backing::BackingStore;
use crate::common::constants::CONFIG_SPACE_SIZE;
use crate::common::DeviceError;
use crate::fabric::hdm::AddressRange;

/// Offset of the vendor/device id dword.
pub const REG_ID: u16 = 0x00;

/// Offset of the revision/class code dword.
pub const REG_CLASS: u16 = 0x08;

/// Class code of a CXL memory device (memory controller, CXL subclass).
pub const CLASS_CXL_MEMORY: u32 = 0x05_02_10;

/// Class code of a processing accelerator.
pub const CLASS_ACCELERATOR: u32 = 0x12_00_00;

const READ_ONLY: [u16; 2] = [REG_ID, REG_CLASS];

/// A 4 KiB configuration space.
#[derive(Clone, Debug)]
pub struct ConfigSpace {
    regs: Vec<u8>,
}

impl ConfigSpace {
    /// Creates a configuration space advertising the given identity.
    pub fn new(vendor_id: u16, device_id: u16, class_code: u32) -> Self {
        let mut regs = vec![0u8; CONFIG_SPACE_SIZE];
        regs[0..2].copy_from_slice(&vendor_id.to_le_bytes());
        regs[2..4].copy_from_slice(&device_id.to_le_bytes());
        regs[8..12].copy_from_slice(&((class_code & 0x00ff_ffff) << 8).to_le_bytes());
        Self { regs }
    }

    fn offset(register: u16) -> Result<usize, DeviceError> {
        let offset = register as usize;
        if offset % 4 != 0 || offset + 4 > CONFIG_SPACE_SIZE {
            return Err(DeviceError::Unsupported(format!(
                "config register {register:#x} is not a valid dword"
            )));
        }
        Ok(offset)
    }

    /// Reads one dword.
    pub fn read(&self, register: u16) -> Result<u32, DeviceError> {
        let o = Self::offset(register)?;
        Ok(u32::from_le_bytes([
            self.regs[o],
            self.regs[o + 1],
            self.regs[o + 2],
            self.regs[o + 3],
        ]))
    }

    /// Writes the bytes of `value` selected by `byte_enable`.
    ///
    /// Writes to read-only identification dwords are silently dropped, as
    /// on real hardware.
    pub fn write(&mut self, register: u16, value: u32, byte_enable: u8) -> Result<(), DeviceError> {
        let o = Self::offset(register)?;
        if READ_ONLY.contains(&register) {
            log::debug!("[cfg] ignoring write to read-only register {:#x}", register);
            return Ok(());
        }
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            if byte_enable & (1 << i) != 0 {
                self.regs[o + i] = *byte;
            }
        }
        Ok(())
    }

    pub fn vendor_id(&self) -> u16 {
        u16::from_le_bytes([self.regs[0], self.regs[1]])
    }

    pub fn device_id(&self) -> u16 {
        u16::from_le_bytes([self.regs[2], self.regs[3]])
    }
}

/// A memory-mapped register window.
#[derive(Clone, Debug)]
pub struct MmioWindow {
    range: AddressRange,
    regs: BackingStore,
}

impl MmioWindow {
    pub fn new(range: AddressRange) -> Self {
        Self {
            range,
            regs: BackingStore::new(range.size, 0),
        }
    }

    pub fn range(&self) -> &AddressRange {
        &self.range
    }

    fn offset(&self, address: u64, length: usize) -> Result<u64, DeviceError> {
        if !self.range.contains_span(address, length as u64) {
            return Err(DeviceError::Unmapped { address });
        }
        Ok(address - self.range.base)
    }

    /// Reads `length` bytes at host address `address`.
    pub fn read(&self, address: u64, length: usize) -> Result<Vec<u8>, DeviceError> {
        let offset = self.offset(address, length)?;
        self.regs.read(offset, length)
    }

    /// Writes `bytes` at host address `address`.
    pub fn write(&mut self, address: u64, bytes: &[u8]) -> Result<(), DeviceError> {
        let offset = self.offset(address, bytes.len())?;
        self.regs.write(offset, bytes)
    }
}
