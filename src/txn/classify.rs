//! Per-Protocol Message Semantics.
//!
//! Maps concrete packets onto what the transaction engine needs to know:
//! which credit class a request consumes, which response parts complete it,
//! and where the tag lives in each message. Matching is exhaustive over the
//! protocol variants so an unexpected message is always reported.

use super::{MessageClass, Role};
use crate::codec::cache::{CachePacket, H2dRspOp};
use crate::codec::io::IoOp;
use crate::codec::mem::{M2sReqOp, MemPacket};
use crate::codec::Packet;
use crate::common::constants::{CACHE_TAG_BITS, IO_TAG_BITS, MEM_TAG_BITS};
use crate::common::{EngineError, ProtocolKind, Tag};

/// One half of a possibly two-part completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Part {
    /// A response or completion message.
    Rsp,
    /// A data-carrying message.
    Data,
}

impl Part {
    pub fn name(self) -> &'static str {
        match self {
            Part::Rsp => "response",
            Part::Data => "data",
        }
    }
}

/// Parts still required before a transaction completes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Parts {
    pub rsp: bool,
    pub data: bool,
}

impl Parts {
    const RSP: Parts = Parts {
        rsp: true,
        data: false,
    };
    const DATA: Parts = Parts {
        rsp: false,
        data: true,
    };

    pub fn requires(self, part: Part) -> bool {
        match part {
            Part::Rsp => self.rsp,
            Part::Data => self.data,
        }
    }
}

/// Credit class and completion requirement of a request.
#[derive(Clone, Copy, Debug)]
pub struct RequestInfo {
    pub class: MessageClass,
    pub need: Parts,
}

/// Returns the width of the tag space used by an engine.
pub fn tag_bits(kind: ProtocolKind, role: Role) -> u32 {
    match (kind, role) {
        (ProtocolKind::Io, _) => IO_TAG_BITS,
        (ProtocolKind::Mem, Role::Host) => MEM_TAG_BITS,
        (ProtocolKind::Mem, Role::Device) => CACHE_TAG_BITS,
        (ProtocolKind::Cache, _) => CACHE_TAG_BITS,
    }
}

/// Classifies a request the engine is about to originate.
///
/// Fails with `NotARequest` for responses and for requests that flow in the
/// other direction (a host engine cannot originate D2H traffic).
pub fn classify_request(packet: &Packet, role: Role) -> Result<RequestInfo, EngineError> {
    let info = match (packet, role) {
        (Packet::Io(p), Role::Host) if !p.op.is_completion() => RequestInfo {
            class: MessageClass::IoReq,
            need: Parts::RSP,
        },
        (Packet::Mem(MemPacket::M2sReq(m)), Role::Host) => RequestInfo {
            class: MessageClass::M2sReq,
            need: match m.op {
                M2sReqOp::MemInv => Parts::RSP,
                M2sReqOp::MemRd | M2sReqOp::MemRdData | M2sReqOp::MemSpecRd => Parts::DATA,
            },
        },
        (Packet::Mem(MemPacket::M2sRwd(_)), Role::Host) => RequestInfo {
            class: MessageClass::M2sRwd,
            need: Parts::RSP,
        },
        (Packet::Mem(MemPacket::S2mBiSnp(_)), Role::Device) => RequestInfo {
            class: MessageClass::S2mBiSnp,
            need: Parts::RSP,
        },
        (Packet::Cache(CachePacket::D2hReq(r)), Role::Device) => RequestInfo {
            class: MessageClass::D2hReq,
            need: Parts {
                rsp: r.op.expects_go(),
                data: r.op.expects_data(),
            },
        },
        (Packet::Cache(CachePacket::H2dReq(_)), Role::Host) => RequestInfo {
            class: MessageClass::H2dReq,
            need: Parts::RSP,
        },
        _ => return Err(EngineError::NotARequest(packet.describe())),
    };
    Ok(info)
}

/// Extracts the tag and part of a response addressed to an engine of `role`.
pub fn classify_response(packet: &Packet, role: Role) -> Result<(Tag, Part), EngineError> {
    let found = match (packet, role) {
        (Packet::Io(p), Role::Host) if p.op.is_completion() => (Tag(p.tag), Part::Rsp),
        (Packet::Mem(MemPacket::S2mNdr(m)), Role::Host) => (Tag(m.tag), Part::Rsp),
        (Packet::Mem(MemPacket::S2mDrs(m)), Role::Host) => (Tag(m.tag), Part::Data),
        (Packet::Mem(MemPacket::M2sBiRsp(m)), Role::Device) => (Tag(m.bi_tag), Part::Rsp),
        (Packet::Cache(CachePacket::H2dRsp(m)), Role::Device) => (Tag(m.cqid), Part::Rsp),
        (Packet::Cache(CachePacket::H2dData(m)), Role::Device) => (Tag(m.cqid), Part::Data),
        (Packet::Cache(CachePacket::D2hRsp(m)), Role::Host) => (Tag(m.uqid), Part::Rsp),
        (Packet::Cache(CachePacket::D2hData(m)), Role::Host) => (Tag(m.uqid), Part::Data),
        _ => return Err(EngineError::NotAResponse(packet.describe())),
    };
    Ok(found)
}

/// Adjusts the data requirement once a response part reveals it.
///
/// Snoop responses that forward a dirty line announce a following D2H data
/// message; a GO-Err ends a device read without data.
pub fn refine_need(need: &mut Parts, response: &Packet) {
    match response {
        Packet::Cache(CachePacket::D2hRsp(r)) => need.data = r.op.forwards_data(),
        Packet::Cache(CachePacket::H2dRsp(r)) if r.op == H2dRspOp::GoErr => need.data = false,
        _ => {}
    }
}

/// Writes `tag` into the tag field of a request.
pub fn stamp_tag(packet: &mut Packet, tag: Tag) {
    match packet {
        Packet::Io(p) => p.tag = tag.val(),
        Packet::Mem(MemPacket::M2sReq(m)) => m.tag = tag.val(),
        Packet::Mem(MemPacket::M2sRwd(m)) => m.tag = tag.val(),
        Packet::Mem(MemPacket::S2mBiSnp(m)) => m.bi_tag = tag.val(),
        Packet::Cache(CachePacket::D2hReq(m)) => m.cqid = tag.val(),
        Packet::Cache(CachePacket::H2dReq(m)) => m.uqid = tag.val(),
        Packet::Mem(MemPacket::M2sBiRsp(_))
        | Packet::Mem(MemPacket::S2mNdr(_))
        | Packet::Mem(MemPacket::S2mDrs(_))
        | Packet::Cache(CachePacket::D2hRsp(_))
        | Packet::Cache(CachePacket::D2hData(_))
        | Packet::Cache(CachePacket::H2dRsp(_))
        | Packet::Cache(CachePacket::H2dData(_)) => {}
    }
}

/// Returns `true` for messages that answer a request rather than start one.
pub fn is_response(packet: &Packet) -> bool {
    match packet {
        Packet::Io(p) => matches!(p.op, IoOp::Cpl | IoOp::CplD),
        Packet::Mem(m) => matches!(
            m,
            MemPacket::M2sBiRsp(_) | MemPacket::S2mNdr(_) | MemPacket::S2mDrs(_)
        ),
        Packet::Cache(c) => matches!(
            c,
            CachePacket::D2hRsp(_)
                | CachePacket::D2hData(_)
                | CachePacket::H2dRsp(_)
                | CachePacket::H2dData(_)
        ),
    }
}
