//! Bias Table.
//!
//! Tracks host/device bias for each 64-byte block of device memory. Blocks
//! start in host bias; only explicit flips change them. Device-biased
//! blocks are stored sparsely.

use std::collections::BTreeSet;

use crate::common::constants::CACHE_LINE_SHIFT;
use crate::common::{AccessType, Bias, DeviceError};

#[derive(Clone, Debug, Default)]
pub struct BiasTable {
    device_blocks: BTreeSet<u64>,
}

impl BiasTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn block(address: u64) -> u64 {
        address >> CACHE_LINE_SHIFT
    }

    /// Returns the bias of the block containing `address`.
    pub fn bias(&self, address: u64) -> Bias {
        if self.device_blocks.contains(&Self::block(address)) {
            Bias::DeviceBias
        } else {
            Bias::HostBias
        }
    }

    /// Sets the bias of the block containing `address`.
    pub fn set(&mut self, address: u64, bias: Bias) {
        let block = Self::block(address);
        match bias {
            Bias::DeviceBias => {
                self.device_blocks.insert(block);
            }
            Bias::HostBias => {
                self.device_blocks.remove(&block);
            }
        }
    }

    /// Checks that every block in `[address, address + length)` permits
    /// `access`.
    ///
    /// Only the sparse set of device-biased blocks is walked, so the cost
    /// does not grow with `length`.
    pub fn check(&self, address: u64, length: usize, access: AccessType) -> Result<(), DeviceError> {
        let first = Self::block(address);
        let last = Self::block(address.saturating_add(length.max(1) as u64 - 1));
        let in_range = || self.device_blocks.range(first..=last).copied();
        let violation = |block: u64, bias: Bias| DeviceError::BiasViolation {
            address: (block << CACHE_LINE_SHIFT).max(address),
            bias,
            access,
        };

        if !Bias::DeviceBias.permits(access) {
            if let Some(block) = in_range().next() {
                return Err(violation(block, Bias::DeviceBias));
            }
        }
        if !Bias::HostBias.permits(access) {
            // First block of the range missing from the device set.
            let mut expected = first;
            for block in in_range() {
                if block != expected {
                    break;
                }
                expected += 1;
            }
            if expected <= last {
                return Err(violation(expected, Bias::HostBias));
            }
        }
        Ok(())
    }

    /// Returns the number of blocks currently in device bias.
    pub fn device_biased(&self) -> usize {
        self.device_blocks.len()
    }
}
