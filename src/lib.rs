//! CXL Fabric Emulator Library.
//!
//! This crate emulates a Compute Express Link fabric: a host root port, a
//! switch and CXL devices exchanging CXL.io, CXL.mem and CXL.cache packets
//! packed into flits over framed links.
//!
//! # Architecture
//!
//! * **Codec**: Bit-exact packet encodings, flit packing and transport framing.
//! * **Transactions**: Per-protocol engines with tags, credits and deadlines.
//! * **Fabric**: Switch ports, HDM decoders, route table and arbitration.
//! * **Devices**: Type-3 memory expanders and Type-1/Type-2 accelerators.
//! * **Simulation**: One async event loop per component, linked over TCP.
//!
//! # Modules
//!
//! * `codec`: Packet, flit and frame encoding.
//! * `common`: Identifiers, constants and the error taxonomy.
//! * `config`: Topology loading and validation.
//! * `device`: Device models and their storage.
//! * `fabric`: Fabric context, routing and interleaving.
//! * `port`: Ports, link state and outbound queues.
//! * `sim`: Host, device and switch event loops.
//! * `stats`: Counters and printable summaries.
//! * `transport`: Framed async links and flit capture.
//! * `txn`: Transaction engines, credits and tags.

/// Bit-exact encoding of CXL.io, CXL.mem and CXL.cache packets.
///
/// Packs packets into fixed-size flits and flits into length-prefixed frames.
pub mod codec;

/// Shared identifiers, constants and error types.
pub mod common;

/// Topology configuration loaded from TOML.
///
/// Validates the description into an immutable `Topology` before anything
/// runs.
pub mod config;

/// Behavioural device models with configuration space, MMIO and memory.
pub mod device;

/// The switch: ports, HDM decoders, route table and round-robin arbitration.
pub mod fabric;

/// Link endpoints owning transaction engines and outbound queues.
pub mod port;

/// Per-component async event loops and their handles.
pub mod sim;

/// Traffic and transaction statistics.
pub mod stats;

/// Framed links over TCP or in-memory streams.
pub mod transport;

/// Request/response correlation, credit flow control and deadlines.
pub mod txn;
