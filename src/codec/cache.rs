//! CXL.cache Packet Codec.
//!
//! CXL.cache lets a device coherently cache host memory. Requests from the
//! device (D2H) are tagged with a CQID chosen by the device; snoops from the
//! host (H2D) are tagged with a UQID chosen by the host. Responses and data
//! messages echo the tag of the request they answer.
//!
//! Every body starts with a 4-bit channel selector; addresses use the same
//! 46-bit line-number encoding as CXL.mem.

use super::bits::{wire_enum, BitReader, BitWriter};
use super::mem::{put_line, put_line_address, take_line_address};
use crate::common::constants::CACHE_LINE_SIZE;
use crate::common::{FormatError, ProtocolKind};

wire_enum! {
    /// CXL.cache channel selector.
    pub enum CacheChannel (ProtocolKind::Cache, "channel") {
        D2hReq = 0,
        D2hRsp = 1,
        D2hData = 2,
        H2dReq = 3,
        H2dRsp = 4,
        H2dData = 5,
    }
}

wire_enum! {
    /// Device-to-host request opcodes.
    pub enum D2hReqOp (ProtocolKind::Cache, "d2h_req_opcode") {
        RdCurr = 0x01,
        RdOwn = 0x02,
        RdShared = 0x03,
        RdAny = 0x04,
        RdOwnNoData = 0x05,
        ItoMWr = 0x06,
        WrCur = 0x07,
        CleanEvict = 0x08,
        DirtyEvict = 0x09,
        CleanEvictNoData = 0x0a,
        WoWrInv = 0x0b,
        WrInv = 0x0d,
        CacheFlushed = 0x0e,
    }
}

impl D2hReqOp {
    /// Returns `true` if the host answers with a data line.
    pub fn expects_data(self) -> bool {
        matches!(
            self,
            D2hReqOp::RdCurr | D2hReqOp::RdOwn | D2hReqOp::RdShared | D2hReqOp::RdAny
        )
    }

    /// Returns `true` if the host answers with a GO response.
    ///
    /// RdCurr is an uncached read and completes on data alone.
    pub fn expects_go(self) -> bool {
        !matches!(self, D2hReqOp::RdCurr)
    }
}

wire_enum! {
    /// Device-to-host snoop response opcodes.
    pub enum D2hRspOp (ProtocolKind::Cache, "d2h_rsp_opcode") {
        RspIHitI = 0x04,
        RspVHitV = 0x06,
        RspIHitSE = 0x05,
        RspSHitSE = 0x01,
        RspSFwdM = 0x07,
        RspIFwdM = 0x0f,
        RspVFwdV = 0x16,
    }
}

impl D2hRspOp {
    /// Returns `true` if the response is accompanied by a D2H data line.
    pub fn forwards_data(self) -> bool {
        matches!(self, D2hRspOp::RspSFwdM | D2hRspOp::RspIFwdM | D2hRspOp::RspVFwdV)
    }
}

wire_enum! {
    /// Host-to-device snoop opcodes.
    pub enum H2dReqOp (ProtocolKind::Cache, "h2d_req_opcode") {
        SnpData = 1,
        SnpInv = 2,
        SnpCur = 3,
    }
}

wire_enum! {
    /// Host-to-device response opcodes.
    pub enum H2dRspOp (ProtocolKind::Cache, "h2d_rsp_opcode") {
        WritePull = 0x1,
        Go = 0x4,
        GoWritePull = 0x5,
        ExtCmp = 0x6,
        GoErr = 0x8,
    }
}

wire_enum! {
    /// Cache state granted by a GO response.
    pub enum CacheState (ProtocolKind::Cache, "cache_state") {
        Invalid = 0x3,
        Shared = 0x1,
        Exclusive = 0x2,
        Modified = 0x6,
        Error = 0x4,
    }
}

/// Device-to-host request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct D2hReq {
    pub op: D2hReqOp,
    pub non_temporal: bool,
    pub cqid: u16,
    pub cache_id: u8,
    pub address: u64,
}

/// Device-to-host snoop response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct D2hRsp {
    pub op: D2hRspOp,
    pub uqid: u16,
    pub cache_id: u8,
}

/// Device-to-host data line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct D2hData {
    pub bogus: bool,
    pub poison: bool,
    pub uqid: u16,
    pub cache_id: u8,
    pub data: Vec<u8>,
}

/// Host-to-device snoop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct H2dReq {
    pub op: H2dReqOp,
    pub uqid: u16,
    pub cache_id: u8,
    pub address: u64,
}

/// Host-to-device response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct H2dRsp {
    pub op: H2dRspOp,
    pub state: CacheState,
    pub cqid: u16,
    pub cache_id: u8,
}

/// Host-to-device data line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct H2dData {
    pub go_err: bool,
    pub poison: bool,
    pub cqid: u16,
    pub cache_id: u8,
    pub data: Vec<u8>,
}

/// A CXL.cache message on one of the six channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachePacket {
    D2hReq(D2hReq),
    D2hRsp(D2hRsp),
    D2hData(D2hData),
    H2dReq(H2dReq),
    H2dRsp(H2dRsp),
    H2dData(H2dData),
}

impl CachePacket {
    /// Builds a device request for the line at `address`.
    pub fn d2h_request(op: D2hReqOp, cache_id: u8, address: u64) -> Self {
        CachePacket::D2hReq(D2hReq {
            op,
            non_temporal: false,
            cqid: 0,
            cache_id,
            address,
        })
    }

    /// Builds a host snoop for the line at `address`.
    pub fn h2d_snoop(op: H2dReqOp, cache_id: u8, address: u64) -> Self {
        CachePacket::H2dReq(H2dReq {
            op,
            uqid: 0,
            cache_id,
            address,
        })
    }

    /// Returns the channel this message travels on.
    pub fn channel(&self) -> CacheChannel {
        match self {
            CachePacket::D2hReq(_) => CacheChannel::D2hReq,
            CachePacket::D2hRsp(_) => CacheChannel::D2hRsp,
            CachePacket::D2hData(_) => CacheChannel::D2hData,
            CachePacket::H2dReq(_) => CacheChannel::H2dReq,
            CachePacket::H2dRsp(_) => CacheChannel::H2dRsp,
            CachePacket::H2dData(_) => CacheChannel::H2dData,
        }
    }

    /// Returns the cache id used to route H2D traffic to its device.
    pub fn cache_id(&self) -> u8 {
        match self {
            CachePacket::D2hReq(m) => m.cache_id,
            CachePacket::D2hRsp(m) => m.cache_id,
            CachePacket::D2hData(m) => m.cache_id,
            CachePacket::H2dReq(m) => m.cache_id,
            CachePacket::H2dRsp(m) => m.cache_id,
            CachePacket::H2dData(m) => m.cache_id,
        }
    }

    /// Returns the encoded body size.
    pub fn body_len(&self) -> usize {
        match self {
            CachePacket::D2hReq(_) => 10,
            CachePacket::D2hRsp(_) => 4,
            CachePacket::D2hData(_) => 3 + CACHE_LINE_SIZE,
            CachePacket::H2dReq(_) => 9,
            CachePacket::H2dRsp(_) => 4,
            CachePacket::H2dData(_) => 3 + CACHE_LINE_SIZE,
        }
    }

    /// Appends the packet body to `w`.
    pub fn encode_body(&self, w: &mut BitWriter) -> Result<(), FormatError> {
        w.put("channel", 4, self.channel().to_raw())?;
        match self {
            CachePacket::D2hReq(m) => {
                w.put("d2h_req_opcode", 5, m.op.to_raw())?;
                w.put_flag("nt", m.non_temporal)?;
                w.reserved(2);
                w.put("cqid", 12, m.cqid as u64)?;
                w.put("cache_id", 4, m.cache_id as u64)?;
                w.reserved(4);
                put_line_address(w, m.address)?;
            }
            CachePacket::D2hRsp(m) => {
                w.put("d2h_rsp_opcode", 5, m.op.to_raw())?;
                w.reserved(3);
                w.put("uqid", 12, m.uqid as u64)?;
                w.put("cache_id", 4, m.cache_id as u64)?;
                w.reserved(4);
            }
            CachePacket::D2hData(m) => {
                w.put_flag("bogus", m.bogus)?;
                w.put_flag("poison", m.poison)?;
                w.reserved(2);
                w.put("uqid", 12, m.uqid as u64)?;
                w.put("cache_id", 4, m.cache_id as u64)?;
                put_line(w, &m.data)?;
            }
            CachePacket::H2dReq(m) => {
                w.put("h2d_req_opcode", 3, m.op.to_raw())?;
                w.reserved(1);
                w.put("uqid", 12, m.uqid as u64)?;
                w.put("cache_id", 4, m.cache_id as u64)?;
                put_line_address(w, m.address)?;
            }
            CachePacket::H2dRsp(m) => {
                w.put("h2d_rsp_opcode", 4, m.op.to_raw())?;
                w.put("cache_state", 4, m.state.to_raw())?;
                w.put("cqid", 12, m.cqid as u64)?;
                w.put("cache_id", 4, m.cache_id as u64)?;
                w.reserved(4);
            }
            CachePacket::H2dData(m) => {
                w.put_flag("go_err", m.go_err)?;
                w.put_flag("poison", m.poison)?;
                w.reserved(2);
                w.put("cqid", 12, m.cqid as u64)?;
                w.put("cache_id", 4, m.cache_id as u64)?;
                put_line(w, &m.data)?;
            }
        }
        Ok(())
    }

    /// Parses a packet body from `r`.
    pub fn decode_body(r: &mut BitReader<'_>) -> Result<Self, FormatError> {
        let channel = CacheChannel::from_raw(r.take(4)?)?;
        let packet = match channel {
            CacheChannel::D2hReq => {
                let op = D2hReqOp::from_raw(r.take(5)?)?;
                let non_temporal = r.take_flag()?;
                r.reserved("d2h_req.rsvd0", 2)?;
                let cqid = r.take(12)? as u16;
                let cache_id = r.take(4)? as u8;
                r.reserved("d2h_req.rsvd1", 4)?;
                let address = take_line_address(r)?;
                CachePacket::D2hReq(D2hReq {
                    op,
                    non_temporal,
                    cqid,
                    cache_id,
                    address,
                })
            }
            CacheChannel::D2hRsp => {
                let op = D2hRspOp::from_raw(r.take(5)?)?;
                r.reserved("d2h_rsp.rsvd0", 3)?;
                let uqid = r.take(12)? as u16;
                let cache_id = r.take(4)? as u8;
                r.reserved("d2h_rsp.rsvd1", 4)?;
                CachePacket::D2hRsp(D2hRsp { op, uqid, cache_id })
            }
            CacheChannel::D2hData => {
                let bogus = r.take_flag()?;
                let poison = r.take_flag()?;
                r.reserved("d2h_data.rsvd0", 2)?;
                let uqid = r.take(12)? as u16;
                let cache_id = r.take(4)? as u8;
                let data = r.take_bytes(CACHE_LINE_SIZE)?.to_vec();
                CachePacket::D2hData(D2hData {
                    bogus,
                    poison,
                    uqid,
                    cache_id,
                    data,
                })
            }
            CacheChannel::H2dReq => {
                let op = H2dReqOp::from_raw(r.take(3)?)?;
                r.reserved("h2d_req.rsvd0", 1)?;
                let uqid = r.take(12)? as u16;
                let cache_id = r.take(4)? as u8;
                let address = take_line_address(r)?;
                CachePacket::H2dReq(H2dReq {
                    op,
                    uqid,
                    cache_id,
                    address,
                })
            }
            CacheChannel::H2dRsp => {
                let op = H2dRspOp::from_raw(r.take(4)?)?;
                let state = CacheState::from_raw(r.take(4)?)?;
                let cqid = r.take(12)? as u16;
                let cache_id = r.take(4)? as u8;
                r.reserved("h2d_rsp.rsvd0", 4)?;
                CachePacket::H2dRsp(H2dRsp {
                    op,
                    state,
                    cqid,
                    cache_id,
                })
            }
            CacheChannel::H2dData => {
                let go_err = r.take_flag()?;
                let poison = r.take_flag()?;
                r.reserved("h2d_data.rsvd0", 2)?;
                let cqid = r.take(12)? as u16;
                let cache_id = r.take(4)? as u8;
                let data = r.take_bytes(CACHE_LINE_SIZE)?.to_vec();
                CachePacket::H2dData(H2dData {
                    go_err,
                    poison,
                    cqid,
                    cache_id,
                    data,
                })
            }
        };
        Ok(packet)
    }
}
