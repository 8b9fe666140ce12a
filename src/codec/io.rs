//! CXL.io Packet Codec.
//!
//! CXL.io carries PCIe-style transaction layer packets. The emulator models
//! the subset needed for enumeration and register access: memory read/write,
//! configuration read/write and their completions.
//!
//! Header layout (18 bytes, after the 2-byte envelope):
//!
//! ```text
//!  0      8       14          24              40          50     53    56
//! +------+-------+-----------+---------------+-----------+------+-----+
//! | fmt  | rsvd  | length_dw | requester BDF |    tag    | stat | rsv |
//! +------+-------+-----------+---------------+-----------+------+-----+
//!  56    60    64              80                                   144
//! +-----+-----+---------------+-------------------------------------+
//! | fbe | lbe | completer BDF |               address               |
//! +-----+-----+---------------+-------------------------------------+
//! ```
//!
//! MemWr, CfgWr and CplD are followed by `length_dw * 4` payload bytes.

use super::bits::{wire_enum, BitReader, BitWriter};
use crate::common::{Bdf, FormatError, ProtocolKind};

/// Fixed header size of a CXL.io packet body in bytes.
pub const IO_HEADER_LEN: usize = 18;

/// Largest register offset addressable in configuration space.
pub const MAX_CFG_REGISTER: u64 = 0xffc;

wire_enum! {
    /// CXL.io transaction type (PCIe fmt/type byte).
    pub enum IoOp (ProtocolKind::Io, "fmt_type") {
        MemRd = 0x20,
        MemWr = 0x60,
        CfgRd = 0x04,
        CfgWr = 0x44,
        Cpl = 0x0a,
        CplD = 0x4a,
    }
}

impl IoOp {
    /// Returns `true` if the packet carries a DW payload.
    pub fn carries_data(self) -> bool {
        matches!(self, IoOp::MemWr | IoOp::CfgWr | IoOp::CplD)
    }

    /// Returns `true` for completions.
    pub fn is_completion(self) -> bool {
        matches!(self, IoOp::Cpl | IoOp::CplD)
    }
}

wire_enum! {
    /// Completion status.
    pub enum CplStatus (ProtocolKind::Io, "status") {
        Success = 0,
        UnsupportedRequest = 1,
        ConfigRetry = 2,
        CompleterAbort = 4,
    }
}

/// A CXL.io transaction layer packet.
///
/// `address` is interpreted per operation: a DW-aligned memory address for
/// MemRd/MemWr, a DW-aligned register offset for CfgRd/CfgWr, and the lower
/// address of the originating request for completions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IoPacket {
    pub op: IoOp,
    pub length_dw: u16,
    pub requester: Bdf,
    pub tag: u16,
    pub status: CplStatus,
    pub first_be: u8,
    pub last_be: u8,
    pub completer: Bdf,
    pub address: u64,
    pub payload: Vec<u8>,
}

impl IoPacket {
    fn blank(op: IoOp, requester: Bdf) -> Self {
        Self {
            op,
            length_dw: 0,
            requester,
            tag: 0,
            status: CplStatus::Success,
            first_be: 0,
            last_be: 0,
            completer: Bdf::default(),
            address: 0,
            payload: Vec::new(),
        }
    }

    /// Builds a memory read of `length_dw` dwords at `address`.
    pub fn mem_read(requester: Bdf, address: u64, length_dw: u16) -> Self {
        Self {
            length_dw,
            first_be: 0xf,
            last_be: if length_dw > 1 { 0xf } else { 0 },
            address,
            ..Self::blank(IoOp::MemRd, requester)
        }
    }

    /// Builds a memory write of `data` (a whole number of dwords) at `address`.
    pub fn mem_write(requester: Bdf, address: u64, data: Vec<u8>) -> Self {
        let length_dw = (data.len() / 4) as u16;
        Self {
            length_dw,
            first_be: 0xf,
            last_be: if length_dw > 1 { 0xf } else { 0 },
            address,
            payload: data,
            ..Self::blank(IoOp::MemWr, requester)
        }
    }

    /// Builds a configuration read of one dword from `target`.
    pub fn cfg_read(requester: Bdf, target: Bdf, register: u16) -> Self {
        Self {
            length_dw: 1,
            first_be: 0xf,
            completer: target,
            address: register as u64,
            ..Self::blank(IoOp::CfgRd, requester)
        }
    }

    /// Builds a configuration write of one dword to `target`.
    pub fn cfg_write(requester: Bdf, target: Bdf, register: u16, value: u32) -> Self {
        Self {
            length_dw: 1,
            first_be: 0xf,
            completer: target,
            address: register as u64,
            payload: value.to_le_bytes().to_vec(),
            ..Self::blank(IoOp::CfgWr, requester)
        }
    }

    /// Builds a data-less completion for `request`.
    pub fn completion(request: &IoPacket, completer: Bdf, status: CplStatus) -> Self {
        Self {
            tag: request.tag,
            status,
            completer,
            address: request.address & 0x7f,
            ..Self::blank(IoOp::Cpl, request.requester)
        }
    }

    /// Builds a successful completion carrying `data` for `request`.
    pub fn completion_with_data(request: &IoPacket, completer: Bdf, data: Vec<u8>) -> Self {
        Self {
            length_dw: (data.len() / 4) as u16,
            tag: request.tag,
            completer,
            address: request.address & 0x7f,
            payload: data,
            ..Self::blank(IoOp::CplD, request.requester)
        }
    }

    /// Returns the encoded body size (header plus payload).
    pub fn body_len(&self) -> usize {
        IO_HEADER_LEN + self.payload.len()
    }

    fn check_layout(&self) -> Result<(), FormatError> {
        let expected = if self.op.carries_data() {
            self.length_dw as usize * 4
        } else {
            0
        };
        if self.payload.len() != expected {
            return Err(FormatError::LengthMismatch {
                declared: expected,
                actual: self.payload.len(),
            });
        }
        match self.op {
            IoOp::MemRd | IoOp::MemWr if self.address % 4 != 0 => Err(FormatError::Misaligned {
                address: self.address,
                alignment: 4,
            }),
            IoOp::CfgRd | IoOp::CfgWr if self.address % 4 != 0 => Err(FormatError::Misaligned {
                address: self.address,
                alignment: 4,
            }),
            IoOp::CfgRd | IoOp::CfgWr if self.address > MAX_CFG_REGISTER => {
                Err(FormatError::FieldOverflow {
                    field: "register",
                    width: 12,
                    value: self.address,
                })
            }
            _ => Ok(()),
        }
    }

    /// Appends the packet body to `w`.
    pub fn encode_body(&self, w: &mut BitWriter) -> Result<(), FormatError> {
        self.check_layout()?;
        w.put("fmt_type", 8, self.op.to_raw())?;
        w.reserved(6);
        w.put("length_dw", 10, self.length_dw as u64)?;
        w.put("requester", 16, self.requester.to_u16() as u64)?;
        w.put("tag", 10, self.tag as u64)?;
        w.put("status", 3, self.status.to_raw())?;
        w.reserved(3);
        w.put("first_be", 4, self.first_be as u64)?;
        w.put("last_be", 4, self.last_be as u64)?;
        w.put("completer", 16, self.completer.to_u16() as u64)?;
        w.put("address", 64, self.address)?;
        w.put_bytes(&self.payload);
        Ok(())
    }

    /// Parses a packet body from `r`.
    pub fn decode_body(r: &mut BitReader<'_>) -> Result<Self, FormatError> {
        let op = IoOp::from_raw(r.take(8)?)?;
        r.reserved("io.rsvd0", 6)?;
        let length_dw = r.take(10)? as u16;
        let requester = Bdf::from_u16(r.take(16)? as u16);
        let tag = r.take(10)? as u16;
        let status = CplStatus::from_raw(r.take(3)?)?;
        r.reserved("io.rsvd1", 3)?;
        let first_be = r.take(4)? as u8;
        let last_be = r.take(4)? as u8;
        let completer = Bdf::from_u16(r.take(16)? as u16);
        let address = r.take(64)?;
        let payload = if op.carries_data() {
            r.take_bytes(length_dw as usize * 4)?.to_vec()
        } else {
            Vec::new()
        };
        let packet = Self {
            op,
            length_dw,
            requester,
            tag,
            status,
            first_be,
            last_be,
            completer,
            address,
            payload,
        };
        packet.check_layout()?;
        Ok(packet)
    }
}
