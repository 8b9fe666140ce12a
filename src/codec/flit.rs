//! Flit Packing.
//!
//! A flit is the fixed-size unit exchanged on a link. Data flits multiplex
//! whole packets of any sub-protocol into up to 16 slots; control flits
//! carry one sideband message used for the connection handshake.
//!
//! ```text
//!  0      4      8            16                 32
//! +------+------+------------+------------------+------------------------+
//! | kind | rsvd | slot count |    valid mask    | packets | zero padding |
//! +------+------+------------+------------------+------------------------+
//! ```
//!
//! The valid mask has one bit per occupied slot, lowest bit first, so a flit
//! carrying `n` packets has mask `(1 << n) - 1`. Packets are laid out back to
//! back in slot order and never split across flits. Unused bytes up to the
//! flit capacity are zero and are verified to be zero on decode.

use super::Packet;
use crate::common::FormatError;

/// Size of the flit header in bytes.
pub const FLIT_HEADER_LEN: usize = 4;

/// Maximum number of packets in one data flit.
pub const MAX_SLOTS: usize = 16;

const KIND_DATA: u8 = 1;
const KIND_CONTROL: u8 = 2;

/// Sideband message carried by a control flit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    /// Request to bind the sender to switch port `port`.
    ConnectRequest { port: u8 },
    /// The binding was accepted.
    ConnectAccept,
    /// The binding was refused (unknown or already bound port).
    ConnectReject,
    /// The sender is closing the link.
    Disconnect,
}

impl ControlMessage {
    fn encode(self) -> [u8; 2] {
        match self {
            ControlMessage::ConnectRequest { port } => [1, port],
            ControlMessage::ConnectAccept => [2, 0],
            ControlMessage::ConnectReject => [3, 0],
            ControlMessage::Disconnect => [4, 0],
        }
    }

    fn decode(raw: [u8; 2]) -> Result<Self, FormatError> {
        let msg = match raw[0] {
            1 => return Ok(ControlMessage::ConnectRequest { port: raw[1] }),
            2 => ControlMessage::ConnectAccept,
            3 => ControlMessage::ConnectReject,
            4 => ControlMessage::Disconnect,
            other => return Err(FormatError::UnknownFlitKind(other)),
        };
        if raw[1] != 0 {
            return Err(FormatError::ReservedNonZero {
                field: "control.arg",
                value: raw[1] as u64,
            });
        }
        Ok(msg)
    }
}

/// Contents of a flit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlitBody {
    Packets(Vec<Packet>),
    Control(ControlMessage),
}

/// A fixed-capacity link transfer unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flit {
    capacity: usize,
    body: FlitBody,
}

impl Flit {
    /// Creates a control flit.
    pub fn control(capacity: usize, message: ControlMessage) -> Self {
        Self {
            capacity,
            body: FlitBody::Control(message),
        }
    }

    /// Returns the fixed capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the flit contents.
    pub fn body(&self) -> &FlitBody {
        &self.body
    }

    /// Returns the packets carried, in slot order. Control flits carry none.
    pub fn packets(&self) -> &[Packet] {
        match &self.body {
            FlitBody::Packets(packets) => packets,
            FlitBody::Control(_) => &[],
        }
    }

    /// Returns the control message, if this is a control flit.
    pub fn control_message(&self) -> Option<ControlMessage> {
        match self.body {
            FlitBody::Control(msg) => Some(msg),
            FlitBody::Packets(_) => None,
        }
    }

    /// Encodes the flit to exactly `capacity` bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::with_capacity(self.capacity);
        match &self.body {
            FlitBody::Packets(packets) => {
                if packets.len() > MAX_SLOTS {
                    return Err(FormatError::TooManySlots {
                        count: packets.len(),
                        max: MAX_SLOTS,
                    });
                }
                let mask = slot_mask(packets.len());
                buf.push(KIND_DATA << 4);
                buf.push(packets.len() as u8);
                buf.extend_from_slice(&mask.to_be_bytes());
                for packet in packets {
                    buf.extend_from_slice(&packet.encode()?);
                }
            }
            FlitBody::Control(msg) => {
                buf.extend_from_slice(&[KIND_CONTROL << 4, 0, 0, 0]);
                buf.extend_from_slice(&msg.encode());
            }
        }
        if buf.len() > self.capacity {
            return Err(FormatError::PacketTooLarge {
                size: buf.len(),
                capacity: self.capacity,
            });
        }
        buf.resize(self.capacity, 0);
        Ok(buf)
    }

    /// Decodes a flit. The capacity is the length of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < FLIT_HEADER_LEN {
            return Err(FormatError::Truncated {
                needed: FLIT_HEADER_LEN,
                available: bytes.len(),
            });
        }
        if bytes[0] & 0x0f != 0 {
            return Err(FormatError::ReservedNonZero {
                field: "flit.rsvd",
                value: (bytes[0] & 0x0f) as u64,
            });
        }
        let count = bytes[1];
        let mask = u16::from_be_bytes([bytes[2], bytes[3]]);
        let mut offset = FLIT_HEADER_LEN;

        let body = match bytes[0] >> 4 {
            KIND_DATA => {
                if count as usize > MAX_SLOTS {
                    return Err(FormatError::TooManySlots {
                        count: count as usize,
                        max: MAX_SLOTS,
                    });
                }
                if mask != slot_mask(count as usize) {
                    return Err(FormatError::SlotMask { mask, count });
                }
                let mut packets = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (packet, used) = Packet::decode_prefix(&bytes[offset..])?;
                    packets.push(packet);
                    offset += used;
                }
                FlitBody::Packets(packets)
            }
            KIND_CONTROL => {
                if count != 0 || mask != 0 {
                    return Err(FormatError::SlotMask { mask, count });
                }
                if bytes.len() < FLIT_HEADER_LEN + 2 {
                    return Err(FormatError::Truncated {
                        needed: FLIT_HEADER_LEN + 2,
                        available: bytes.len(),
                    });
                }
                let msg = ControlMessage::decode([bytes[offset], bytes[offset + 1]])?;
                offset += 2;
                FlitBody::Control(msg)
            }
            other => return Err(FormatError::UnknownFlitKind(other)),
        };

        if let Some(pos) = bytes[offset..].iter().position(|&b| b != 0) {
            return Err(FormatError::NonZeroPadding {
                offset: offset + pos,
            });
        }
        Ok(Self {
            capacity: bytes.len(),
            body,
        })
    }
}

fn slot_mask(count: usize) -> u16 {
    ((1u32 << count) - 1) as u16
}

/// Greedily fills one flit from the head of `queued`.
///
/// Packets are taken in arrival order until the next one would overflow the
/// capacity or the slots run out; a packet is never split.
///
/// # Arguments
///
/// * `capacity` - Flit size in bytes
/// * `queued` - Packets awaiting transmission, oldest first
///
/// # Returns
///
/// The filled flit and the packets that did not fit, still in order. Fails
/// with `PacketTooLarge` if the first packet alone cannot fit an empty flit.
pub fn pack(capacity: usize, queued: Vec<Packet>) -> Result<(Flit, Vec<Packet>), FormatError> {
    let mut used = FLIT_HEADER_LEN;
    let mut taken = Vec::new();
    let mut rest = queued.into_iter();
    let mut remaining = Vec::new();

    for packet in rest.by_ref() {
        let size = packet.encoded_len();
        if taken.is_empty() && FLIT_HEADER_LEN + size > capacity {
            return Err(FormatError::PacketTooLarge { size, capacity });
        }
        if used + size > capacity || taken.len() == MAX_SLOTS {
            remaining.push(packet);
            break;
        }
        used += size;
        taken.push(packet);
    }
    remaining.extend(rest);

    Ok((
        Flit {
            capacity,
            body: FlitBody::Packets(taken),
        },
        remaining,
    ))
}

/// Returns the packets of a flit in slot order.
pub fn unpack(flit: &Flit) -> Vec<Packet> {
    flit.packets().to_vec()
}
