//! Error taxonomy.
//!
//! Each layer reports its own error type:
//!
//! * `FormatError`: malformed bytes. Always fatal to the frame or link that
//!   produced them.
//! * `EngineError`, `RouteError`, `DeviceError`: protocol-level violations
//!   reported to the caller and never silently corrected. `UnknownTag` and
//!   `AmbiguousRoute` indicate a broken emulation setup.
//! * `TransportError`: connection-level failures which take the link down
//!   and abort every transaction outstanding on it.
//! * `TopologyError`: rejected configuration, raised before anything runs.
//!
//! `CxlError` gathers all of them for callers that span layers.

use thiserror::Error;

use super::data::{AccessType, Bias, ProtocolKind};
use super::ids::{LinkId, PortId, Tag};
use crate::port::LinkState;
use crate::txn::{MessageClass, TxnState};

/// Malformed or unrepresentable binary data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("buffer truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("field '{field}' value {value:#x} exceeds {width} bits")]
    FieldOverflow {
        field: &'static str,
        width: u32,
        value: u64,
    },

    #[error("reserved field '{field}' is non-zero ({value:#x})")]
    ReservedNonZero { field: &'static str, value: u64 },

    #[error("unknown protocol nibble {0:#x}")]
    UnknownProtocol(u8),

    #[error("unknown {protocol} {field} value {value:#x}")]
    UnknownOpcode {
        protocol: ProtocolKind,
        field: &'static str,
        value: u64,
    },

    #[error("length mismatch: declared {declared} bytes, found {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("address {address:#x} is not {alignment}-byte aligned")]
    Misaligned { address: u64, alignment: u64 },

    #[error("packet of {size} bytes does not fit a {capacity}-byte flit")]
    PacketTooLarge { size: usize, capacity: usize },

    #[error("non-zero flit padding at offset {offset}")]
    NonZeroPadding { offset: usize },

    #[error("flit slot mask {mask:#06x} does not match {count} slots")]
    SlotMask { mask: u16, count: u8 },

    #[error("flit carries {count} packets, more than {max} slots")]
    TooManySlots { count: usize, max: usize },

    #[error("unknown flit kind {0:#x}")]
    UnknownFlitKind(u8),

    #[error("frame length {length} outside [{min}, {max}]")]
    FrameLength { length: usize, min: usize, max: usize },
}

/// Transaction engine and port violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("no {class:?} credit available")]
    NoCredit { class: MessageClass },

    #[error("no outstanding transaction with tag {tag}")]
    UnknownTag { tag: Tag },

    #[error("tag space exhausted ({limit} tags outstanding)")]
    TagsExhausted { limit: u32 },

    #[error("transaction {tag} already resolved as {state:?}")]
    AlreadyCompleted { tag: Tag, state: TxnState },

    #[error("duplicate {part} for tag {tag}")]
    DuplicateResponse { tag: Tag, part: &'static str },

    #[error("{actual} packet offered to {expected} engine")]
    WrongProtocol {
        expected: ProtocolKind,
        actual: ProtocolKind,
    },

    #[error("not a request this engine may originate: {0}")]
    NotARequest(String),

    #[error("not a response: {0}")]
    NotAResponse(String),

    #[error("credit pool {class:?} would exceed its limit of {limit}")]
    CreditOverflow { class: MessageClass, limit: u32 },

    #[error("link is {state:?}")]
    LinkDown { state: LinkState },

    #[error("{0} is not enabled on this port")]
    ProtocolDisabled(ProtocolKind),
}

/// Fabric routing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no route for {what} arriving on {ingress}")]
    Unroutable { ingress: PortId, what: String },

    #[error("{what} matches {count} route entries")]
    AmbiguousRoute { what: String, count: usize },

    #[error("unknown port {0}")]
    UnknownPort(PortId),
}

/// Device model failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("access {address:#x}+{length} exceeds capacity {capacity:#x}")]
    OutOfRange {
        address: u64,
        length: usize,
        capacity: u64,
    },

    #[error("{access:?} access to {address:#x} under {bias:?}")]
    BiasViolation {
        address: u64,
        bias: Bias,
        access: AccessType,
    },

    #[error("host address {address:#x} is not decoded by this device")]
    Unmapped { address: u64 },

    #[error("unsupported request: {0}")]
    Unsupported(String),
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot connect to {peer}: {reason}")]
    ConnectionError { peer: String, reason: String },

    #[error("{0} is closed")]
    Closed(LinkId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Topology configuration failures.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("cannot parse topology: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot read topology: {0}")]
    Io(#[from] std::io::Error),
}

/// Umbrella error for operations that span several layers.
#[derive(Debug, Error)]
pub enum CxlError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("transaction {tag} resolved as {state:?}")]
    TransactionFailed { tag: Tag, state: TxnState },

    #[error("poisoned data returned for {address:#x}")]
    Poisoned { address: u64 },

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("protocol violation on {link} by {packet}: {source}")]
    ProtocolViolation {
        link: LinkId,
        packet: String,
        source: EngineError,
    },

    #[error("component has shut down")]
    Shutdown,
}
