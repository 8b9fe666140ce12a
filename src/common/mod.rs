//! Common utilities and types used throughout the CXL fabric emulator.
//!
//! This module provides the identifier newtypes, protocol constants and the
//! error taxonomy shared by the codec, transaction engines, fabric, device
//! models and transport.

/// Common constants used throughout the emulator.
pub mod constants;

/// Access classification shared by device models and the host.
pub mod data;

/// Error types for every layer of the emulator.
pub mod error;

/// Identifier newtypes (ports, links, tags, bus/device/function).
pub mod ids;

pub use data::{AccessType, Bias, ProtocolKind};
pub use error::{
    CxlError, DeviceError, EngineError, FormatError, RouteError, TopologyError, TransportError,
};
pub use ids::{Bdf, LinkId, PortId, Tag};

pub use constants::{CACHE_LINE_SIZE, DEFAULT_FLIT_SIZE};
