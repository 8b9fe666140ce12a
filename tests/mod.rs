//! Test module organization.
//!
//! This module organizes all integration tests for the CXL fabric emulator.

/// Packet codec encoding, decoding and validation tests.
mod codec_tests;


/// Device model, bias and coherence tests.
mod device_tests;

/// Transaction engine and port tests.
mod engine_tests;


/// Flit packing and framing tests.
mod flit_tests;

/// Host node behaviour over a bare link.
mod node_tests;

/// Codec and flit properties over generated packets.
mod property_tests;


/// Framed link and capture tests.
mod transport_tests;
