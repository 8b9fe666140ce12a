//! Packet and Flit Codec.
//!
//! Pure transformations between typed protocol messages and their binary
//! form. A `Packet` is a tagged variant over the three CXL sub-protocols;
//! every encoded packet starts with a 2-byte envelope:
//!
//! ```text
//!  0        4                  16
//! +--------+-------------------+------------------------+
//! | proto  |   total length    | protocol body ...      |
//! +--------+-------------------+------------------------+
//! ```
//!
//! `proto` is the `ProtocolKind` nibble and `total length` counts every byte
//! of the packet, envelope included. Decoding checks the declared length
//! against the buffer before touching the body.
//!
//! Flits (`flit`) carry one or more packets, and frames (`frame`) carry one
//! flit over a byte stream.

pub mod bits;
pub mod cache;
pub mod flit;
pub mod frame;
pub mod io;
pub mod mem;

use bits::{BitReader, BitWriter};
use crate::common::{FormatError, ProtocolKind};

pub use cache::CachePacket;
pub use flit::{pack, unpack, ControlMessage, Flit, FlitBody};
pub use io::IoPacket;
pub use mem::MemPacket;

/// Size of the protocol/length envelope in bytes.
pub const ENVELOPE_LEN: usize = 2;

/// Largest total packet length the 12-bit envelope field can express.
pub const MAX_PACKET_LEN: usize = 0xfff;

/// A protocol-tagged CXL message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Io(IoPacket),
    Mem(MemPacket),
    Cache(CachePacket),
}

impl Packet {
    /// Returns the sub-protocol of this packet.
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Packet::Io(_) => ProtocolKind::Io,
            Packet::Mem(_) => ProtocolKind::Mem,
            Packet::Cache(_) => ProtocolKind::Cache,
        }
    }

    /// Returns the total encoded size in bytes, envelope included.
    pub fn encoded_len(&self) -> usize {
        ENVELOPE_LEN
            + match self {
                Packet::Io(p) => p.body_len(),
                Packet::Mem(p) => p.body_len(),
                Packet::Cache(p) => p.body_len(),
            }
    }

    /// Encodes the packet.
    ///
    /// # Returns
    ///
    /// The encoded bytes, or a `FormatError` if any field exceeds its
    /// declared width or a payload does not match its declared length.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut w = BitWriter::new();
        w.put("protocol", 4, self.kind() as u64)?;
        w.reserved(12);
        match self {
            Packet::Io(p) => p.encode_body(&mut w)?,
            Packet::Mem(p) => p.encode_body(&mut w)?,
            Packet::Cache(p) => p.encode_body(&mut w)?,
        }
        let mut buf = w.finish();
        let len = buf.len();
        if len > MAX_PACKET_LEN {
            return Err(FormatError::FieldOverflow {
                field: "packet_length",
                width: 12,
                value: len as u64,
            });
        }
        buf[0] |= (len >> 8) as u8 & 0x0f;
        buf[1] = len as u8;
        Ok(buf)
    }

    /// Decodes exactly one packet occupying the whole of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        let (packet, used) = Self::decode_prefix(buf)?;
        if used != buf.len() {
            return Err(FormatError::LengthMismatch {
                declared: used,
                actual: buf.len(),
            });
        }
        Ok(packet)
    }

    /// Decodes one packet from the start of `buf`.
    ///
    /// # Returns
    ///
    /// The packet and the number of bytes it occupied.
    pub fn decode_prefix(buf: &[u8]) -> Result<(Self, usize), FormatError> {
        if buf.len() < ENVELOPE_LEN {
            return Err(FormatError::Truncated {
                needed: ENVELOPE_LEN,
                available: buf.len(),
            });
        }
        let nibble = buf[0] >> 4;
        let kind = ProtocolKind::from_nibble(nibble).ok_or(FormatError::UnknownProtocol(nibble))?;
        let declared = (((buf[0] & 0x0f) as usize) << 8) | buf[1] as usize;
        if declared < ENVELOPE_LEN {
            return Err(FormatError::LengthMismatch {
                declared,
                actual: ENVELOPE_LEN,
            });
        }
        if buf.len() < declared {
            return Err(FormatError::Truncated {
                needed: declared,
                available: buf.len(),
            });
        }

        let body = &buf[ENVELOPE_LEN..declared];
        let mut r = BitReader::new(body);
        let packet = match kind {
            ProtocolKind::Io => Packet::Io(IoPacket::decode_body(&mut r)?),
            ProtocolKind::Mem => Packet::Mem(MemPacket::decode_body(&mut r)?),
            ProtocolKind::Cache => Packet::Cache(CachePacket::decode_body(&mut r)?),
        };
        if r.remaining_bytes() != 0 {
            return Err(FormatError::LengthMismatch {
                declared,
                actual: declared - r.remaining_bytes(),
            });
        }
        Ok((packet, declared))
    }

    /// Returns a short human readable description used in logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Packet::Io(p) => format!("CXL.io {:?} tag={:#x} addr={:#x}", p.op, p.tag, p.address),
            Packet::Mem(p) => match p.address() {
                Some(addr) => format!("CXL.mem {:?} addr={:#x}", p.channel(), addr),
                None => format!("CXL.mem {:?}", p.channel()),
            },
            Packet::Cache(p) => format!("CXL.cache {:?} cache_id={}", p.channel(), p.cache_id()),
        }
    }
}

impl From<IoPacket> for Packet {
    fn from(p: IoPacket) -> Self {
        Packet::Io(p)
    }
}

impl From<MemPacket> for Packet {
    fn from(p: MemPacket) -> Self {
        Packet::Mem(p)
    }
}

impl From<CachePacket> for Packet {
    fn from(p: CachePacket) -> Self {
        Packet::Cache(p)
    }
}

/// Encodes a packet. See [`Packet::encode`].
pub fn encode(packet: &Packet) -> Result<Vec<u8>, FormatError> {
    packet.encode()
}

/// Decodes a packet. See [`Packet::decode`].
pub fn decode(buf: &[u8]) -> Result<Packet, FormatError> {
    Packet::decode(buf)
}
