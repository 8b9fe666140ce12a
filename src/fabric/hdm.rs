//! Host-Managed Device Memory Decoders.
//!
//! A switch decoder claims a window of host physical address space and
//! spreads it across up to 16 downstream ports, `granularity` bytes at a
//! time. A device decoder performs the inverse: it strips the way-selection
//! bits from a host physical address to obtain a dense device address.

use serde::Serialize;

use crate::common::{PortId, TopologyError};

/// Supported interleave granularities in bytes.
pub const GRANULARITIES: [u64; 7] = [256, 512, 1024, 2048, 4096, 8192, 16384];

/// Supported interleave way counts.
pub const WAYS: [u8; 5] = [1, 2, 4, 8, 16];

/// A half-open address range `[base, base + size)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AddressRange {
    pub base: u64,
    pub size: u64,
}

impl AddressRange {
    pub fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// Returns the first address past the range.
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }

    /// Returns `true` if `[address, address + len)` lies entirely inside.
    pub fn contains_span(&self, address: u64, len: u64) -> bool {
        len > 0 && self.contains(address) && address.saturating_add(len) <= self.end()
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

fn check_interleave(range: &AddressRange, granularity: u64, ways: u8) -> Result<(), TopologyError> {
    if !GRANULARITIES.contains(&granularity) {
        return Err(TopologyError::InvalidTopology(format!(
            "interleave granularity {granularity} is not one of {GRANULARITIES:?}"
        )));
    }
    if !WAYS.contains(&ways) {
        return Err(TopologyError::InvalidTopology(format!(
            "interleave ways {ways} is not one of {WAYS:?}"
        )));
    }
    if range.size == 0 {
        return Err(TopologyError::InvalidTopology(format!(
            "HDM range at {:#x} has zero size",
            range.base
        )));
    }
    let stride = granularity * ways as u64;
    if range.base % stride != 0 || range.size % stride != 0 {
        return Err(TopologyError::InvalidTopology(format!(
            "HDM range {:#x}+{:#x} is not aligned to the {stride:#x}-byte interleave set",
            range.base, range.size
        )));
    }
    Ok(())
}

/// Switch-side decoder mapping a host address window to downstream ports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HdmDecoder {
    range: AddressRange,
    granularity: u64,
    targets: Vec<PortId>,
}

impl HdmDecoder {
    /// Creates a decoder interleaving `range` across `targets`.
    ///
    /// The number of targets is the interleave way count.
    pub fn new(range: AddressRange, granularity: u64, targets: Vec<PortId>) -> Result<Self, TopologyError> {
        let ways = u8::try_from(targets.len()).unwrap_or(u8::MAX);
        check_interleave(&range, granularity, ways)?;
        Ok(Self {
            range,
            granularity,
            targets,
        })
    }

    pub fn range(&self) -> &AddressRange {
        &self.range
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    pub fn ways(&self) -> u8 {
        self.targets.len() as u8
    }

    pub fn targets(&self) -> &[PortId] {
        &self.targets
    }

    /// Selects the downstream port owning `hpa`, if it is in range.
    pub fn target(&self, hpa: u64) -> Option<PortId> {
        if !self.range.contains(hpa) {
            return None;
        }
        let way = (hpa / self.granularity) % self.targets.len() as u64;
        self.targets.get(way as usize).copied()
    }

    /// Builds the matching decoder for the device at `port`.
    pub fn device_decoder(&self, port: PortId) -> Option<DeviceDecoder> {
        let position = self.targets.iter().position(|&t| t == port)?;
        Some(DeviceDecoder {
            range: self.range,
            granularity: self.granularity,
            ways: self.ways(),
            position: position as u8,
        })
    }
}

/// Device-side decoder translating host to device physical addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceDecoder {
    range: AddressRange,
    granularity: u64,
    ways: u8,
    position: u8,
}

impl DeviceDecoder {
    /// Creates a decoder for the device at interleave `position`.
    pub fn new(range: AddressRange, granularity: u64, ways: u8, position: u8) -> Result<Self, TopologyError> {
        check_interleave(&range, granularity, ways)?;
        if position >= ways {
            return Err(TopologyError::InvalidTopology(format!(
                "interleave position {position} out of range for {ways} ways"
            )));
        }
        Ok(Self {
            range,
            granularity,
            ways,
            position,
        })
    }

    pub fn range(&self) -> &AddressRange {
        &self.range
    }

    /// Returns the number of device bytes backing this decoder.
    pub fn device_size(&self) -> u64 {
        self.range.size / self.ways as u64
    }

    /// Translates `hpa` to a device physical address.
    ///
    /// Returns `None` if the address is outside the window or selects a
    /// different interleave way.
    pub fn translate(&self, hpa: u64) -> Option<u64> {
        if !self.range.contains(hpa) {
            return None;
        }
        let ways = self.ways as u64;
        if (hpa / self.granularity) % ways != self.position as u64 {
            return None;
        }
        let offset = hpa - self.range.base;
        let chunk = offset / (self.granularity * ways);
        Some(chunk * self.granularity + offset % self.granularity)
    }
}
