//! CXL.mem Packet Codec.
//!
//! CXL.mem moves cache lines between the host (master) and device memory
//! (subordinate). Six channels are modelled:
//!
//! * M2S Req: reads and invalidations, no data.
//! * M2S RwD: writes carrying one 64-byte line.
//! * M2S BIRsp: host answer to a device back-invalidate snoop.
//! * S2M BISnp: device back-invalidate snoop.
//! * S2M NDR: no-data response (write and invalidate completions).
//! * S2M DRS: data response carrying one 64-byte line.
//!
//! Every body starts with a 4-bit channel selector. Addresses are carried as
//! 46-bit line numbers (`address >> 6`), so byte addresses must be line
//! aligned and below 2^52.

use super::bits::{wire_enum, BitReader, BitWriter};
use crate::common::constants::{CACHE_LINE_SHIFT, CACHE_LINE_SIZE, PHYS_ADDR_BITS};
use crate::common::{FormatError, ProtocolKind};

wire_enum! {
    /// CXL.mem channel selector.
    pub enum MemChannel (ProtocolKind::Mem, "channel") {
        M2sReq = 0,
        M2sRwd = 1,
        M2sBiRsp = 2,
        S2mBiSnp = 3,
        S2mNdr = 4,
        S2mDrs = 5,
    }
}

wire_enum! {
    /// M2S request opcodes.
    pub enum M2sReqOp (ProtocolKind::Mem, "m2s_req_opcode") {
        MemInv = 0,
        MemRd = 1,
        MemRdData = 2,
        MemSpecRd = 8,
    }
}

wire_enum! {
    /// M2S request-with-data opcodes.
    pub enum M2sRwdOp (ProtocolKind::Mem, "m2s_rwd_opcode") {
        MemWr = 1,
        MemWrPtl = 2,
    }
}

wire_enum! {
    /// Snoop type attached to M2S requests.
    pub enum SnpType (ProtocolKind::Mem, "snp_type") {
        NoOp = 0,
        SnpData = 1,
        SnpCur = 2,
        SnpInv = 3,
    }
}

wire_enum! {
    /// Back-invalidate response opcodes.
    pub enum BiRspOp (ProtocolKind::Mem, "birsp_opcode") {
        BiRspI = 0,
        BiRspS = 1,
        BiRspE = 2,
    }
}

wire_enum! {
    /// Back-invalidate snoop opcodes.
    pub enum BiSnpOp (ProtocolKind::Mem, "bisnp_opcode") {
        BiSnpCur = 0,
        BiSnpData = 1,
        BiSnpInv = 2,
    }
}

wire_enum! {
    /// No-data response opcodes.
    pub enum NdrOp (ProtocolKind::Mem, "ndr_opcode") {
        Cmp = 0,
        CmpS = 1,
        CmpE = 2,
        CmpM = 3,
        BiConflictAck = 4,
    }
}

wire_enum! {
    /// Data response opcodes.
    pub enum DrsOp (ProtocolKind::Mem, "drs_opcode") {
        MemData = 0,
    }
}

/// Meta field value meaning "no meta update".
pub const META_FIELD_NOOP: u8 = 3;

/// M2S request without data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct M2sReq {
    pub op: M2sReqOp,
    pub snp_type: SnpType,
    pub meta_field: u8,
    pub meta_value: u8,
    pub tag: u16,
    pub address: u64,
    pub ld_id: u8,
}

/// M2S request carrying a data line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct M2sRwd {
    pub op: M2sRwdOp,
    pub snp_type: SnpType,
    pub meta_field: u8,
    pub meta_value: u8,
    pub poison: bool,
    pub tag: u16,
    pub address: u64,
    pub ld_id: u8,
    pub data: Vec<u8>,
}

/// Host response to a back-invalidate snoop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct M2sBiRsp {
    pub op: BiRspOp,
    pub bi_id: u16,
    pub bi_tag: u16,
}

/// Device back-invalidate snoop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S2mBiSnp {
    pub op: BiSnpOp,
    pub bi_id: u16,
    pub bi_tag: u16,
    pub address: u64,
}

/// No-data response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S2mNdr {
    pub op: NdrOp,
    pub meta_field: u8,
    pub meta_value: u8,
    pub poison: bool,
    pub tag: u16,
    pub ld_id: u8,
}

/// Data response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S2mDrs {
    pub op: DrsOp,
    pub meta_field: u8,
    pub meta_value: u8,
    pub poison: bool,
    pub tag: u16,
    pub ld_id: u8,
    pub data: Vec<u8>,
}

/// A CXL.mem message on one of the six channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemPacket {
    M2sReq(M2sReq),
    M2sRwd(M2sRwd),
    M2sBiRsp(M2sBiRsp),
    S2mBiSnp(S2mBiSnp),
    S2mNdr(S2mNdr),
    S2mDrs(S2mDrs),
}

impl MemPacket {
    /// Builds a plain host read of one line.
    pub fn mem_read(address: u64) -> Self {
        MemPacket::M2sReq(M2sReq {
            op: M2sReqOp::MemRd,
            snp_type: SnpType::NoOp,
            meta_field: META_FIELD_NOOP,
            meta_value: 0,
            tag: 0,
            address,
            ld_id: 0,
        })
    }

    /// Builds a full-line host write.
    pub fn mem_write(address: u64, data: Vec<u8>) -> Self {
        MemPacket::M2sRwd(M2sRwd {
            op: M2sRwdOp::MemWr,
            snp_type: SnpType::NoOp,
            meta_field: META_FIELD_NOOP,
            meta_value: 0,
            poison: false,
            tag: 0,
            address,
            ld_id: 0,
            data,
        })
    }

    /// Builds a data response for the request carrying `tag`.
    pub fn data_response(tag: u16, ld_id: u8, data: Vec<u8>, poison: bool) -> Self {
        MemPacket::S2mDrs(S2mDrs {
            op: DrsOp::MemData,
            meta_field: META_FIELD_NOOP,
            meta_value: 0,
            poison,
            tag,
            ld_id,
            data,
        })
    }

    /// Builds a no-data completion for the request carrying `tag`.
    pub fn completion(op: NdrOp, tag: u16, ld_id: u8, poison: bool) -> Self {
        MemPacket::S2mNdr(S2mNdr {
            op,
            meta_field: META_FIELD_NOOP,
            meta_value: 0,
            poison,
            tag,
            ld_id,
        })
    }

    /// Returns the channel this message travels on.
    pub fn channel(&self) -> MemChannel {
        match self {
            MemPacket::M2sReq(_) => MemChannel::M2sReq,
            MemPacket::M2sRwd(_) => MemChannel::M2sRwd,
            MemPacket::M2sBiRsp(_) => MemChannel::M2sBiRsp,
            MemPacket::S2mBiSnp(_) => MemChannel::S2mBiSnp,
            MemPacket::S2mNdr(_) => MemChannel::S2mNdr,
            MemPacket::S2mDrs(_) => MemChannel::S2mDrs,
        }
    }

    /// Returns the line address for address-bearing channels.
    pub fn address(&self) -> Option<u64> {
        match self {
            MemPacket::M2sReq(m) => Some(m.address),
            MemPacket::M2sRwd(m) => Some(m.address),
            MemPacket::S2mBiSnp(m) => Some(m.address),
            MemPacket::M2sBiRsp(_) | MemPacket::S2mNdr(_) | MemPacket::S2mDrs(_) => None,
        }
    }

    /// Returns the encoded body size.
    pub fn body_len(&self) -> usize {
        match self {
            MemPacket::M2sReq(_) => 11,
            MemPacket::M2sRwd(_) => 11 + CACHE_LINE_SIZE,
            MemPacket::M2sBiRsp(_) => 5,
            MemPacket::S2mBiSnp(_) => 11,
            MemPacket::S2mNdr(_) => 5,
            MemPacket::S2mDrs(_) => 5 + CACHE_LINE_SIZE,
        }
    }

    /// Appends the packet body to `w`.
    pub fn encode_body(&self, w: &mut BitWriter) -> Result<(), FormatError> {
        w.put("channel", 4, self.channel().to_raw())?;
        match self {
            MemPacket::M2sReq(m) => {
                w.put("m2s_req_opcode", 4, m.op.to_raw())?;
                w.put("snp_type", 3, m.snp_type.to_raw())?;
                w.put("meta_field", 2, m.meta_field as u64)?;
                w.put("meta_value", 2, m.meta_value as u64)?;
                w.reserved(1);
                w.put("tag", 16, m.tag as u64)?;
                w.put("ld_id", 4, m.ld_id as u64)?;
                w.reserved(4);
                put_line_address(w, m.address)?;
            }
            MemPacket::M2sRwd(m) => {
                w.put("m2s_rwd_opcode", 4, m.op.to_raw())?;
                w.put("snp_type", 3, m.snp_type.to_raw())?;
                w.put("meta_field", 2, m.meta_field as u64)?;
                w.put("meta_value", 2, m.meta_value as u64)?;
                w.put_flag("poison", m.poison)?;
                w.put("tag", 16, m.tag as u64)?;
                w.put("ld_id", 4, m.ld_id as u64)?;
                w.reserved(4);
                put_line_address(w, m.address)?;
                put_line(w, &m.data)?;
            }
            MemPacket::M2sBiRsp(m) => {
                w.put("birsp_opcode", 4, m.op.to_raw())?;
                w.put("bi_id", 12, m.bi_id as u64)?;
                w.reserved(4);
                w.put("bi_tag", 12, m.bi_tag as u64)?;
                w.reserved(4);
            }
            MemPacket::S2mBiSnp(m) => {
                w.put("bisnp_opcode", 4, m.op.to_raw())?;
                w.put("bi_id", 12, m.bi_id as u64)?;
                w.reserved(4);
                w.put("bi_tag", 12, m.bi_tag as u64)?;
                w.reserved(4);
                put_line_address(w, m.address)?;
            }
            MemPacket::S2mNdr(m) => {
                w.put("ndr_opcode", 3, m.op.to_raw())?;
                w.put("meta_field", 2, m.meta_field as u64)?;
                w.put("meta_value", 2, m.meta_value as u64)?;
                w.put_flag("poison", m.poison)?;
                w.reserved(4);
                w.put("tag", 16, m.tag as u64)?;
                w.put("ld_id", 4, m.ld_id as u64)?;
                w.reserved(4);
            }
            MemPacket::S2mDrs(m) => {
                w.put("drs_opcode", 3, m.op.to_raw())?;
                w.put("meta_field", 2, m.meta_field as u64)?;
                w.put("meta_value", 2, m.meta_value as u64)?;
                w.put_flag("poison", m.poison)?;
                w.reserved(4);
                w.put("tag", 16, m.tag as u64)?;
                w.put("ld_id", 4, m.ld_id as u64)?;
                w.reserved(4);
                put_line(w, &m.data)?;
            }
        }
        Ok(())
    }

    /// Parses a packet body from `r`.
    pub fn decode_body(r: &mut BitReader<'_>) -> Result<Self, FormatError> {
        let channel = MemChannel::from_raw(r.take(4)?)?;
        let packet = match channel {
            MemChannel::M2sReq => {
                let op = M2sReqOp::from_raw(r.take(4)?)?;
                let snp_type = SnpType::from_raw(r.take(3)?)?;
                let meta_field = r.take(2)? as u8;
                let meta_value = r.take(2)? as u8;
                r.reserved("m2s_req.rsvd0", 1)?;
                let tag = r.take(16)? as u16;
                let ld_id = r.take(4)? as u8;
                r.reserved("m2s_req.rsvd1", 4)?;
                let address = take_line_address(r)?;
                MemPacket::M2sReq(M2sReq {
                    op,
                    snp_type,
                    meta_field,
                    meta_value,
                    tag,
                    address,
                    ld_id,
                })
            }
            MemChannel::M2sRwd => {
                let op = M2sRwdOp::from_raw(r.take(4)?)?;
                let snp_type = SnpType::from_raw(r.take(3)?)?;
                let meta_field = r.take(2)? as u8;
                let meta_value = r.take(2)? as u8;
                let poison = r.take_flag()?;
                let tag = r.take(16)? as u16;
                let ld_id = r.take(4)? as u8;
                r.reserved("m2s_rwd.rsvd0", 4)?;
                let address = take_line_address(r)?;
                let data = r.take_bytes(CACHE_LINE_SIZE)?.to_vec();
                MemPacket::M2sRwd(M2sRwd {
                    op,
                    snp_type,
                    meta_field,
                    meta_value,
                    poison,
                    tag,
                    address,
                    ld_id,
                    data,
                })
            }
            MemChannel::M2sBiRsp => {
                let op = BiRspOp::from_raw(r.take(4)?)?;
                let bi_id = r.take(12)? as u16;
                r.reserved("birsp.rsvd0", 4)?;
                let bi_tag = r.take(12)? as u16;
                r.reserved("birsp.rsvd1", 4)?;
                MemPacket::M2sBiRsp(M2sBiRsp { op, bi_id, bi_tag })
            }
            MemChannel::S2mBiSnp => {
                let op = BiSnpOp::from_raw(r.take(4)?)?;
                let bi_id = r.take(12)? as u16;
                r.reserved("bisnp.rsvd0", 4)?;
                let bi_tag = r.take(12)? as u16;
                r.reserved("bisnp.rsvd1", 4)?;
                let address = take_line_address(r)?;
                MemPacket::S2mBiSnp(S2mBiSnp {
                    op,
                    bi_id,
                    bi_tag,
                    address,
                })
            }
            MemChannel::S2mNdr | MemChannel::S2mDrs => {
                let raw_op = r.take(3)?;
                let meta_field = r.take(2)? as u8;
                let meta_value = r.take(2)? as u8;
                let poison = r.take_flag()?;
                r.reserved("s2m.rsvd0", 4)?;
                let tag = r.take(16)? as u16;
                let ld_id = r.take(4)? as u8;
                r.reserved("s2m.rsvd1", 4)?;
                if channel == MemChannel::S2mNdr {
                    MemPacket::S2mNdr(S2mNdr {
                        op: NdrOp::from_raw(raw_op)?,
                        meta_field,
                        meta_value,
                        poison,
                        tag,
                        ld_id,
                    })
                } else {
                    let data = r.take_bytes(CACHE_LINE_SIZE)?.to_vec();
                    MemPacket::S2mDrs(S2mDrs {
                        op: DrsOp::from_raw(raw_op)?,
                        meta_field,
                        meta_value,
                        poison,
                        tag,
                        ld_id,
                        data,
                    })
                }
            }
        };
        Ok(packet)
    }
}

/// Writes a line-aligned physical address as a 46-bit line number plus
/// two reserved bits.
pub(super) fn put_line_address(w: &mut BitWriter, address: u64) -> Result<(), FormatError> {
    if address & (CACHE_LINE_SIZE as u64 - 1) != 0 {
        return Err(FormatError::Misaligned {
            address,
            alignment: CACHE_LINE_SIZE as u64,
        });
    }
    w.put(
        "address",
        PHYS_ADDR_BITS - CACHE_LINE_SHIFT,
        address >> CACHE_LINE_SHIFT,
    )?;
    w.reserved(2);
    Ok(())
}

pub(super) fn take_line_address(r: &mut BitReader<'_>) -> Result<u64, FormatError> {
    let line = r.take(PHYS_ADDR_BITS - CACHE_LINE_SHIFT)?;
    r.reserved("address.rsvd", 2)?;
    Ok(line << CACHE_LINE_SHIFT)
}

/// Writes exactly one cache line of data.
pub(super) fn put_line(w: &mut BitWriter, data: &[u8]) -> Result<(), FormatError> {
    if data.len() != CACHE_LINE_SIZE {
        return Err(FormatError::LengthMismatch {
            declared: CACHE_LINE_SIZE,
            actual: data.len(),
        });
    }
    w.put_bytes(data);
    Ok(())
}
