//! Access and Protocol Classification.
//!
//! This module defines small enums used across layers: which CXL
//! sub-protocol a packet belongs to, which side of the link originated a
//! memory access, and the bias state of a device memory block.

use serde::{Deserialize, Serialize};
use std::fmt;

/// CXL sub-protocol carried by a packet.
///
/// The discriminant is the 4-bit protocol nibble written into every packet
/// envelope on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// CXL.io, the PCIe transaction-layer compatible protocol.
    Io = 1,
    /// CXL.mem, host-managed device memory accesses.
    Mem = 2,
    /// CXL.cache, device coherent caching of host memory.
    Cache = 3,
}

impl ProtocolKind {
    /// All protocol kinds in wire order.
    pub const ALL: [ProtocolKind; 3] = [ProtocolKind::Io, ProtocolKind::Mem, ProtocolKind::Cache];

    /// Decodes a protocol nibble.
    pub fn from_nibble(value: u8) -> Option<Self> {
        match value {
            1 => Some(ProtocolKind::Io),
            2 => Some(ProtocolKind::Mem),
            3 => Some(ProtocolKind::Cache),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Io => write!(f, "CXL.io"),
            ProtocolKind::Mem => write!(f, "CXL.mem"),
            ProtocolKind::Cache => write!(f, "CXL.cache"),
        }
    }
}

/// Originator of an access against device memory.
///
/// Bias checks depend on who is touching the block: the host through
/// CXL.mem, or the device's own compute engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    /// Host access arriving over CXL.mem.
    Host,

    /// Device-local access issued by the accelerator itself.
    Device,
}

/// Coherence bias of a cache-line-aligned block of device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
pub enum Bias {
    /// The host may access the block without a coherence round trip.
    #[default]
    HostBias,
    /// The device owns the block; host accesses must wait for a flip back.
    DeviceBias,
}

impl Bias {
    /// Returns `true` if an access of the given type is legal under this bias.
    pub fn permits(self, access: AccessType) -> bool {
        matches!(
            (self, access),
            (Bias::HostBias, AccessType::Host) | (Bias::DeviceBias, AccessType::Device)
        )
    }
}
