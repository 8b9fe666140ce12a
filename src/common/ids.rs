//! Identifier newtypes.
//!
//! Ports are stored by stable index in the fabric arena, links are numbered
//! per process, tags correlate requests with responses on one link, and
//! `Bdf` is the PCIe bus/device/function routing identity used by CXL.io.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a port inside a fabric or node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PortId(pub u8);

impl PortId {
    /// Returns the raw port number.
    pub fn val(self) -> u8 {
        self.0
    }

    /// Returns the port number as an arena index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port{}", self.0)
    }
}

/// Identifier of one transport link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link{}", self.0)
    }
}

/// Transaction tag, unique among outstanding requests of one engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Tag(pub u16);

impl Tag {
    /// Returns the raw tag value.
    pub fn val(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// PCIe bus/device/function identity.
///
/// Encoded on the wire as 16 bits: bus (8), device (5), function (3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Bdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl Bdf {
    /// Creates a new BDF, masking device and function to their field widths.
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device: device & 0x1f,
            function: function & 0x7,
        }
    }

    /// Packs the identity into its 16-bit wire form.
    pub fn to_u16(self) -> u16 {
        ((self.bus as u16) << 8) | (((self.device & 0x1f) as u16) << 3) | (self.function & 0x7) as u16
    }

    /// Unpacks a 16-bit wire value.
    pub fn from_u16(raw: u16) -> Self {
        Self {
            bus: (raw >> 8) as u8,
            device: ((raw >> 3) & 0x1f) as u8,
            function: (raw & 0x7) as u8,
        }
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

impl FromStr for Bdf {
    type Err = String;

    /// Parses the `bb:dd.f` notation (hexadecimal fields).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bus, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed BDF '{s}'"))?;
        let (device, function) = rest
            .split_once('.')
            .ok_or_else(|| format!("malformed BDF '{s}'"))?;
        let bus = u8::from_str_radix(bus, 16).map_err(|e| format!("bad bus in '{s}': {e}"))?;
        let device =
            u8::from_str_radix(device, 16).map_err(|e| format!("bad device in '{s}': {e}"))?;
        let function =
            u8::from_str_radix(function, 16).map_err(|e| format!("bad function in '{s}': {e}"))?;
        if device > 0x1f || function > 0x7 {
            return Err(format!("BDF '{s}' out of range"));
        }
        Ok(Self::new(bus, device, function))
    }
}
