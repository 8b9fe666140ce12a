//! Fabric Ports.
//!
//! A port is one end of a link: a host root port, a switch's upstream or
//! downstream port, or a device port. Terminal ports (root and device
//! ports) own one transaction engine per enabled protocol; switch ports only
//! forward and therefore own none. Every port has a link state driven by the
//! transport and an outbound queue arbitrated across source ports.

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::codec::{self, Flit, Packet};
use crate::common::{EngineError, FormatError, PortId, ProtocolKind, Tag};
use crate::fabric::arbiter::RoundRobinArbiter;
use crate::fabric::hdm::AddressRange;
use crate::txn::classify;
use crate::txn::{
    CompletedTransaction, CreditLimits, EngineSnapshot, Role, TransactionEngine, TxnFailure,
};

/// Link training state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum LinkState {
    Down,
    Training,
    Active,
}

/// Position of a port in the topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PortKind {
    /// Host root port.
    RootPort,
    /// Switch port facing the host.
    UpstreamSwitchPort,
    /// Switch port facing a device.
    DownstreamSwitchPort,
    /// Device endpoint port.
    DevicePort,
}

impl PortKind {
    /// Returns the engine role of a terminal port, `None` for switch ports.
    pub fn role(self) -> Option<Role> {
        match self {
            PortKind::RootPort => Some(Role::Host),
            PortKind::DevicePort => Some(Role::Device),
            PortKind::UpstreamSwitchPort | PortKind::DownstreamSwitchPort => None,
        }
    }
}

/// Result of handing an arriving packet to a port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A request for the layer above (device model, host, or fabric).
    Request(Packet),
    /// A response that completed one of this port's transactions.
    Completed(CompletedTransaction),
    /// A response part was accepted; the transaction needs more parts.
    Partial,
}

/// Per-port traffic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PortCounters {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub dropped: u64,
}

/// Copy of a port's state for reporting.
#[derive(Clone, Debug, Serialize)]
pub struct PortSnapshot {
    pub id: PortId,
    pub kind: PortKind,
    pub link: LinkState,
    pub queued: usize,
    pub hdm: Vec<AddressRange>,
    pub counters: PortCounters,
    pub engines: Vec<EngineSnapshot>,
}

#[derive(Debug, Default)]
struct EngineSet {
    io: Option<TransactionEngine>,
    mem: Option<TransactionEngine>,
    cache: Option<TransactionEngine>,
}

impl EngineSet {
    fn slot(&mut self, kind: ProtocolKind) -> &mut Option<TransactionEngine> {
        match kind {
            ProtocolKind::Io => &mut self.io,
            ProtocolKind::Mem => &mut self.mem,
            ProtocolKind::Cache => &mut self.cache,
        }
    }

    fn get(&self, kind: ProtocolKind) -> Option<&TransactionEngine> {
        match kind {
            ProtocolKind::Io => self.io.as_ref(),
            ProtocolKind::Mem => self.mem.as_ref(),
            ProtocolKind::Cache => self.cache.as_ref(),
        }
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut TransactionEngine> {
        [&mut self.io, &mut self.mem, &mut self.cache]
            .into_iter()
            .filter_map(|e| e.as_mut())
    }

    fn iter(&self) -> impl Iterator<Item = &TransactionEngine> {
        [&self.io, &self.mem, &self.cache]
            .into_iter()
            .filter_map(|e| e.as_ref())
    }
}

/// A topology node endpoint.
#[derive(Debug)]
pub struct Port {
    id: PortId,
    kind: PortKind,
    link: LinkState,
    protocols: Vec<ProtocolKind>,
    engines: EngineSet,
    outbound: RoundRobinArbiter<Packet>,
    hdm: Vec<AddressRange>,
    counters: PortCounters,
}

impl Port {
    /// Creates a port with its link down.
    ///
    /// # Arguments
    ///
    /// * `id` - Stable port identifier
    /// * `kind` - Topology position; terminal kinds get engines
    /// * `protocols` - Sub-protocols enabled on the link
    /// * `limits` - Credit pool sizes for each engine
    /// * `timeout` - Transaction deadline for each engine
    pub fn new(
        id: PortId,
        kind: PortKind,
        protocols: &[ProtocolKind],
        limits: &CreditLimits,
        timeout: Duration,
    ) -> Self {
        let mut engines = EngineSet::default();
        if let Some(role) = kind.role() {
            for &p in protocols {
                *engines.slot(p) = Some(TransactionEngine::new(p, role, limits, timeout));
            }
        }
        Self {
            id,
            kind,
            link: LinkState::Down,
            protocols: protocols.to_vec(),
            engines,
            outbound: RoundRobinArbiter::new(),
            hdm: Vec::new(),
            counters: PortCounters::default(),
        }
    }

    /// Records an HDM range this port advertises or forwards.
    pub fn add_hdm_range(&mut self, range: AddressRange) {
        self.hdm.push(range);
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub fn is_active(&self) -> bool {
        self.link == LinkState::Active
    }

    pub fn hdm_ranges(&self) -> &[AddressRange] {
        &self.hdm
    }

    pub fn supports(&self, kind: ProtocolKind) -> bool {
        self.protocols.contains(&kind)
    }

    /// Returns the engine for `kind`, if this port owns one.
    pub fn engine(&self, kind: ProtocolKind) -> Option<&TransactionEngine> {
        self.engines.get(kind)
    }

    /// Marks the link as training (connection in progress).
    pub fn link_training(&mut self) {
        log::debug!("[{}] link training", self.id);
        self.link = LinkState::Training;
    }

    /// Marks the link as active.
    pub fn link_up(&mut self) {
        log::info!("[{}] link active", self.id);
        self.link = LinkState::Active;
    }

    /// Takes the link down.
    ///
    /// Queued outbound packets are dropped and every outstanding transaction
    /// is aborted.
    ///
    /// # Returns
    ///
    /// The aborted transactions.
    pub fn link_down(&mut self) -> Vec<TxnFailure> {
        if self.link != LinkState::Down {
            log::warn!("[{}] link down", self.id);
        }
        self.link = LinkState::Down;
        self.counters.dropped += self.outbound.clear() as u64;
        self.engines.iter_mut().flat_map(|e| e.abort_all()).collect()
    }

    /// Checks the link is active and carries protocol `kind`.
    pub fn check_link(&self, kind: ProtocolKind) -> Result<(), EngineError> {
        if self.link != LinkState::Active {
            return Err(EngineError::LinkDown { state: self.link });
        }
        if !self.supports(kind) {
            return Err(EngineError::ProtocolDisabled(kind));
        }
        Ok(())
    }

    /// Originates a request on this port.
    ///
    /// # Returns
    ///
    /// The transaction tag. The tagged request is queued for transmission.
    pub fn send_request(&mut self, request: Packet, now: Instant) -> Result<Tag, EngineError> {
        let kind = request.kind();
        self.check_link(kind)?;
        let engine = self
            .engines
            .slot(kind)
            .as_mut()
            .ok_or(EngineError::ProtocolDisabled(kind))?;
        let (tag, wire) = engine.send_at(request, now)?;
        self.outbound.push(self.id, wire);
        Ok(tag)
    }

    /// Queues a response to a request received on this port.
    pub fn send_response(&mut self, response: Packet) -> Result<(), EngineError> {
        if !classify::is_response(&response) {
            return Err(EngineError::NotAResponse(response.describe()));
        }
        self.check_link(response.kind())?;
        self.outbound.push(self.id, response);
        Ok(())
    }

    /// Queues a packet forwarded from `source` (switch ports).
    pub fn enqueue(&mut self, source: PortId, packet: Packet) -> Result<(), EngineError> {
        self.check_link(packet.kind())?;
        self.outbound.push(source, packet);
        Ok(())
    }

    /// Hands an arriving packet to the port.
    ///
    /// Responses are matched by the engine of their protocol; anything else
    /// is returned as a request. Switch ports return every packet as a
    /// request for the fabric to route.
    pub fn on_packet(&mut self, packet: Packet) -> Result<Inbound, EngineError> {
        let kind = packet.kind();
        if !self.supports(kind) {
            return Err(EngineError::ProtocolDisabled(kind));
        }
        self.counters.rx_packets += 1;
        match self.engines.slot(kind).as_mut() {
            Some(engine) if classify::is_response(&packet) => {
                Ok(match engine.on_receive(packet)? {
                    Some(done) => Inbound::Completed(done),
                    None => Inbound::Partial,
                })
            }
            _ => Ok(Inbound::Request(packet)),
        }
    }

    /// Returns the number of packets waiting to be sent.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Takes the next packet in arbitration order.
    pub fn next_outbound(&mut self) -> Option<(PortId, Packet)> {
        let next = self.outbound.pop();
        if next.is_some() {
            self.counters.tx_packets += 1;
        }
        next
    }

    /// Packs every queued packet into flits of `capacity` bytes.
    pub fn take_flits(&mut self, capacity: usize) -> Result<Vec<Flit>, FormatError> {
        let mut queued = Vec::with_capacity(self.outbound.len());
        while let Some((_, packet)) = self.next_outbound() {
            queued.push(packet);
        }
        let mut flits = Vec::new();
        while !queued.is_empty() {
            let (flit, rest) = codec::pack(capacity, queued)?;
            flits.push(flit);
            queued = rest;
        }
        Ok(flits)
    }

    /// Expires overdue transactions on every engine.
    pub fn tick(&mut self, now: Instant) -> Vec<TxnFailure> {
        self.engines.iter_mut().flat_map(|e| e.tick(now)).collect()
    }

    /// Cancels an outstanding transaction.
    pub fn cancel(&mut self, kind: ProtocolKind, tag: Tag) -> Result<Packet, EngineError> {
        self.engines
            .slot(kind)
            .as_mut()
            .ok_or(EngineError::ProtocolDisabled(kind))?
            .cancel(tag)
    }

    /// Returns a copy of the port's state.
    pub fn snapshot(&self) -> PortSnapshot {
        PortSnapshot {
            id: self.id,
            kind: self.kind,
            link: self.link,
            queued: self.outbound.len(),
            hdm: self.hdm.clone(),
            counters: self.counters,
            engines: self.engines.iter().map(|e| e.snapshot()).collect(),
        }
    }
}
