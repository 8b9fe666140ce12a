//! Fabric Context.
//!
//! The fabric owns the switch ports and the route table of one switch. It
//! is built once from a validated `Topology` and passed explicitly to the
//! switch event loop; nothing about it is global.
//!
//! Ports live in an arena sorted by `PortId`. Components that only need to
//! resolve a route are handed the narrow `RouteQuery` capability instead of
//! the fabric itself.
//!
//! Packet flow through the switch:
//!
//! ```text
//!  flit in -> unpack -> ingress.on_packet -> route -> egress.enqueue(source)
//!                                                          |
//!  flit out <- pack <- round-robin across sources <--------+
//! ```
//!
//! A request the switch cannot deliver (no route, or the egress link is
//! down) is answered on the ingress port with an error completion, so the
//! requester fails fast instead of waiting out its deadline.

pub mod arbiter;
pub mod hdm;
pub mod route;

use serde::Serialize;

use crate::codec::cache::{CachePacket, CacheState, D2hRsp, D2hRspOp, H2dData, H2dRsp, H2dRspOp};
use crate::codec::io::{CplStatus, IoPacket};
use crate::codec::mem::{BiRspOp, M2sBiRsp, M2sReqOp, MemPacket, NdrOp};
use crate::codec::{self, Flit, Packet};
use crate::common::constants::CACHE_LINE_SIZE;
use crate::common::{CxlError, EngineError, FormatError, PortId, RouteError};
use crate::config::Topology;
use crate::port::{Inbound, LinkState, Port, PortSnapshot};
use crate::stats::FabricStats;
use crate::txn::TxnFailure;
use route::{RouteQuery, RouteTable};

/// Copy of the fabric's state for monitoring.
#[derive(Clone, Debug, Serialize)]
pub struct FabricSnapshot {
    pub ports: Vec<PortSnapshot>,
    pub stats: FabricStats,
}

/// Switch ports, route table and counters of one switch.
#[derive(Debug)]
pub struct Fabric {
    ports: Vec<Port>,
    routes: RouteTable,
    flit_size: usize,
    stats: FabricStats,
}

impl Fabric {
    /// Creates a fabric from prebuilt ports and routes.
    pub fn new(mut ports: Vec<Port>, routes: RouteTable, flit_size: usize) -> Self {
        ports.sort_by_key(|p| p.id());
        Self {
            ports,
            routes,
            flit_size,
            stats: FabricStats::default(),
        }
    }

    /// Builds the switch described by `topology`.
    ///
    /// Every port starts with its link down. HDM ranges are recorded on the
    /// upstream port and on each downstream port they interleave across.
    pub fn build(topology: &Topology) -> Self {
        let mut ports: Vec<Port> = topology
            .ports
            .iter()
            .map(|spec| {
                Port::new(
                    spec.id,
                    spec.kind,
                    &spec.protocols,
                    &topology.credits,
                    topology.timeout,
                )
            })
            .collect();
        let upstream = topology.routes.upstream();
        for decoder in topology.routes.hdm_decoders() {
            for port in ports.iter_mut() {
                if port.id() == upstream || decoder.targets().contains(&port.id()) {
                    port.add_hdm_range(*decoder.range());
                }
            }
        }
        log::info!(
            "[fabric] built {} ports, upstream {}, {} HDM decoders",
            ports.len(),
            upstream,
            topology.routes.hdm_decoders().len()
        );
        Self::new(ports, topology.routes.clone(), topology.flit_size)
    }

    fn index(&self, id: PortId) -> Result<usize, RouteError> {
        self.ports
            .binary_search_by_key(&id, |p| p.id())
            .map_err(|_| RouteError::UnknownPort(id))
    }

    /// Returns the port with `id`.
    pub fn port(&self, id: PortId) -> Result<&Port, RouteError> {
        self.index(id).map(|i| &self.ports[i])
    }

    fn port_mut(&mut self, id: PortId) -> Result<&mut Port, RouteError> {
        let i = self.index(id)?;
        Ok(&mut self.ports[i])
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn flit_size(&self) -> usize {
        self.flit_size
    }

    pub fn stats(&self) -> &FabricStats {
        &self.stats
    }

    /// Records a flit that failed to decode on `port`'s link.
    pub fn record_format_error(&mut self, port: PortId, err: &FormatError) {
        log::warn!("[fabric] malformed flit on {}: {}", port, err);
        self.stats.format_errors += 1;
    }

    /// Binds an incoming connection to port `id`.
    ///
    /// # Returns
    ///
    /// `true` if the port exists and was unbound; its link is then active.
    pub fn accept_connection(&mut self, id: PortId) -> bool {
        let accepted = match self.port_mut(id) {
            Ok(port) if port.link_state() == LinkState::Down => {
                port.link_training();
                port.link_up();
                true
            }
            _ => false,
        };
        if accepted {
            self.stats.connections_accepted += 1;
        } else {
            log::warn!("[fabric] rejecting connection for {}", id);
            self.stats.connections_rejected += 1;
        }
        accepted
    }

    /// Brings port `id`'s link up.
    pub fn link_up(&mut self, id: PortId) -> Result<(), RouteError> {
        self.port_mut(id)?.link_up();
        Ok(())
    }

    /// Takes port `id`'s link down, dropping its queued packets.
    pub fn link_down(&mut self, id: PortId) -> Result<Vec<TxnFailure>, RouteError> {
        Ok(self.port_mut(id)?.link_down())
    }

    /// Resolves the egress port for `packet` arriving on `source`.
    pub fn route(&self, source: PortId, packet: &Packet) -> Result<PortId, RouteError> {
        self.port(source)?;
        self.routes.route(source, packet)
    }

    /// Forwards one packet that arrived on `source`.
    ///
    /// The packet is queued on the egress port behind earlier packets from
    /// the same source. Failures leave the packet dropped and counted; a
    /// dropped request is answered with an error completion on `source`.
    ///
    /// # Returns
    ///
    /// The egress port.
    pub fn forward(&mut self, source: PortId, packet: Packet) -> Result<PortId, CxlError> {
        let kind = packet.kind();
        let what = packet.describe();
        let ingress = self.port_mut(source)?;
        if !ingress.is_active() {
            let state = ingress.link_state();
            self.stats.dropped_link_down += 1;
            return Err(EngineError::LinkDown { state }.into());
        }
        let packet = match ingress.on_packet(packet) {
            Ok(Inbound::Request(p)) => p,
            Ok(_) => {
                return Err(RouteError::Unroutable {
                    ingress: source,
                    what,
                }
                .into())
            }
            Err(e) => {
                self.stats.dropped_protocol += 1;
                return Err(e.into());
            }
        };

        let target = match self.routes.route(source, &packet) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("[fabric] dropping {}: {}", what, e);
                self.stats.dropped_unroutable += 1;
                self.answer(source, &packet);
                return Err(e.into());
            }
        };
        if let Err(e) = self.port(target)?.check_link(kind) {
            log::warn!("[fabric] cannot queue {} on {}: {}", what, target, e);
            match e {
                EngineError::LinkDown { .. } => self.stats.dropped_link_down += 1,
                _ => self.stats.dropped_protocol += 1,
            }
            self.answer(source, &packet);
            return Err(e.into());
        }
        self.port_mut(target)?.enqueue(source, packet)?;
        log::debug!("[fabric] {} -> {}: {}", source, target, what);
        self.stats.record_forward(kind);
        Ok(target)
    }

    /// Queues the error completion for a dropped `request` on `source`.
    fn answer(&mut self, source: PortId, request: &Packet) {
        let responses = error_completion(request);
        if responses.is_empty() {
            return;
        }
        let Ok(ingress) = self.port_mut(source) else {
            return;
        };
        for response in responses {
            if let Err(e) = ingress.send_response(response) {
                log::warn!("[fabric] cannot answer on {}: {}", source, e);
                return;
            }
        }
        self.stats.error_completions += 1;
    }

    /// Forwards every packet of a data flit received on `source`.
    ///
    /// # Returns
    ///
    /// The errors of packets that could not be forwarded, in flit order.
    pub fn receive_flit(&mut self, source: PortId, flit: &Flit) -> Vec<CxlError> {
        self.stats.flits_rx += 1;
        codec::unpack(flit)
            .into_iter()
            .filter_map(|p| self.forward(source, p).err())
            .collect()
    }

    /// Packs everything queued on port `id` into flits.
    pub fn take_flits(&mut self, id: PortId) -> Result<Vec<Flit>, CxlError> {
        let flit_size = self.flit_size;
        let flits = self.port_mut(id)?.take_flits(flit_size)?;
        self.stats.flits_tx += flits.len() as u64;
        Ok(flits)
    }

    /// Returns the ports with packets waiting to be sent.
    pub fn pending_ports(&self) -> Vec<PortId> {
        self.ports
            .iter()
            .filter(|p| p.queued() > 0)
            .map(|p| p.id())
            .collect()
    }

    /// Takes every link down.
    pub fn teardown(&mut self) {
        log::info!("[fabric] teardown");
        for port in self.ports.iter_mut() {
            port.link_down();
        }
    }

    /// Returns a copy of every port's state and the fabric counters.
    pub fn snapshot(&self) -> FabricSnapshot {
        FabricSnapshot {
            ports: self.ports.iter().map(|p| p.snapshot()).collect(),
            stats: self.stats.clone(),
        }
    }
}

impl RouteQuery for Fabric {
    fn route(&self, ingress: PortId, packet: &Packet) -> Result<PortId, RouteError> {
        Fabric::route(self, ingress, packet)
    }
}

/// Builds the completion that fails `request` at its originator.
///
/// | Request           | Answer                              |
/// |-------------------|-------------------------------------|
/// | CXL.io            | Cpl with Unsupported Request status |
/// | M2S read          | poisoned DRS                        |
/// | M2S write, MemInv | poisoned NDR                        |
/// | S2M BISnp         | BIRspI                              |
/// | D2H request       | GO-Err, or poisoned data for RdCurr |
/// | H2D snoop         | RspIHitI                            |
///
/// Responses get nothing back.
pub fn error_completion(request: &Packet) -> Vec<Packet> {
    let answer: Packet = match request {
        Packet::Io(p) if !p.op.is_completion() => {
            IoPacket::completion(p, p.completer, CplStatus::UnsupportedRequest).into()
        }
        Packet::Mem(MemPacket::M2sReq(req)) if req.op == M2sReqOp::MemInv => {
            MemPacket::completion(NdrOp::Cmp, req.tag, req.ld_id, true).into()
        }
        Packet::Mem(MemPacket::M2sReq(req)) => {
            MemPacket::data_response(req.tag, req.ld_id, vec![0; CACHE_LINE_SIZE], true).into()
        }
        Packet::Mem(MemPacket::M2sRwd(req)) => {
            MemPacket::completion(NdrOp::Cmp, req.tag, req.ld_id, true).into()
        }
        Packet::Mem(MemPacket::S2mBiSnp(snp)) => MemPacket::M2sBiRsp(M2sBiRsp {
            op: BiRspOp::BiRspI,
            bi_id: snp.bi_id,
            bi_tag: snp.bi_tag,
        })
        .into(),
        Packet::Cache(CachePacket::D2hReq(req)) if req.op.expects_go() => {
            CachePacket::H2dRsp(H2dRsp {
                op: H2dRspOp::GoErr,
                state: CacheState::Error,
                cqid: req.cqid,
                cache_id: req.cache_id,
            })
            .into()
        }
        Packet::Cache(CachePacket::D2hReq(req)) => CachePacket::H2dData(H2dData {
            go_err: true,
            poison: true,
            cqid: req.cqid,
            cache_id: req.cache_id,
            data: vec![0; CACHE_LINE_SIZE],
        })
        .into(),
        Packet::Cache(CachePacket::H2dReq(snp)) => CachePacket::D2hRsp(D2hRsp {
            op: D2hRspOp::RspIHitI,
            uqid: snp.uqid,
            cache_id: snp.cache_id,
        })
        .into(),
        _ => return Vec::new(),
    };
    vec![answer]
}
