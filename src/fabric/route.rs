//! Route Table.
//!
//! Routing is decided by the packet's protocol, channel and ingress port:
//!
//! | Traffic                         | Downstream-bound (from upstream)   | Upstream-bound (from a device) |
//! |---------------------------------|------------------------------------|--------------------------------|
//! | CXL.io MemRd/MemWr              | MMIO window containing the address | MMIO window, else upstream     |
//! | CXL.io CfgRd/CfgWr              | bus range containing target bus    | unroutable                     |
//! | CXL.io Cpl/CplD                 | bus range of the requester         | requester bus, else upstream   |
//! | CXL.mem M2S Req/RwD             | HDM decoder for the address        | unroutable                     |
//! | CXL.mem M2S BIRsp               | port owning the BI-ID              | unroutable                     |
//! | CXL.mem S2M BISnp/NDR/DRS       | unroutable                         | upstream                       |
//! | CXL.cache H2D Req/Rsp/Data      | port owning the cache id           | unroutable                     |
//! | CXL.cache D2H Req/Rsp/Data      | unroutable                         | upstream                       |
//!
//! Ranges are checked for overlap when the table is built, and lookups
//! still count matches so a corrupted table is reported as
//! `AmbiguousRoute` rather than silently picking one entry.

use std::collections::BTreeMap;

use super::hdm::{AddressRange, HdmDecoder};
use crate::codec::cache::CachePacket;
use crate::codec::io::IoOp;
use crate::codec::mem::MemPacket;
use crate::codec::Packet;
use crate::common::{PortId, RouteError, TopologyError};

/// Narrow routing capability handed to components that must resolve a
/// target without holding the fabric itself.
pub trait RouteQuery {
    /// Resolves the egress port for `packet` arriving on `ingress`.
    fn route(&self, ingress: PortId, packet: &Packet) -> Result<PortId, RouteError>;
}

/// An inclusive range of PCIe bus numbers behind one port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusRange {
    pub first: u8,
    pub last: u8,
}

impl BusRange {
    pub fn contains(&self, bus: u8) -> bool {
        bus >= self.first && bus <= self.last
    }

    fn overlaps(&self, other: &BusRange) -> bool {
        self.first <= other.last && other.first <= self.last
    }
}

/// Routing state of one switch.
#[derive(Clone, Debug)]
pub struct RouteTable {
    upstream: PortId,
    hdm: Vec<HdmDecoder>,
    mmio: Vec<(AddressRange, PortId)>,
    buses: Vec<(BusRange, PortId)>,
    cache_ids: BTreeMap<u8, PortId>,
    bi_ids: BTreeMap<u16, PortId>,
}

impl RouteTable {
    /// Creates an empty table whose upstream port is `upstream`.
    pub fn new(upstream: PortId) -> Self {
        Self {
            upstream,
            hdm: Vec::new(),
            mmio: Vec::new(),
            buses: Vec::new(),
            cache_ids: BTreeMap::new(),
            bi_ids: BTreeMap::new(),
        }
    }

    pub fn upstream(&self) -> PortId {
        self.upstream
    }

    pub fn hdm_decoders(&self) -> &[HdmDecoder] {
        &self.hdm
    }

    fn check_address_overlap(&self, range: &AddressRange) -> Result<(), TopologyError> {
        let clash = self
            .hdm
            .iter()
            .map(|d| d.range())
            .chain(self.mmio.iter().map(|(r, _)| r))
            .find(|r| r.overlaps(range));
        match clash {
            Some(r) => Err(TopologyError::InvalidTopology(format!(
                "address range {:#x}..{:#x} overlaps {:#x}..{:#x}",
                range.base,
                range.end(),
                r.base,
                r.end()
            ))),
            None => Ok(()),
        }
    }

    /// Adds an HDM decoder. Fails if its window overlaps an existing range.
    pub fn add_hdm(&mut self, decoder: HdmDecoder) -> Result<(), TopologyError> {
        self.check_address_overlap(decoder.range())?;
        if decoder.targets().contains(&self.upstream) {
            return Err(TopologyError::InvalidTopology(format!(
                "HDM decoder at {:#x} targets the upstream port",
                decoder.range().base
            )));
        }
        self.hdm.push(decoder);
        Ok(())
    }

    /// Maps an MMIO window to `port`.
    pub fn add_mmio(&mut self, range: AddressRange, port: PortId) -> Result<(), TopologyError> {
        if range.size == 0 {
            return Err(TopologyError::InvalidTopology(format!(
                "MMIO window at {:#x} has zero size",
                range.base
            )));
        }
        self.check_address_overlap(&range)?;
        self.mmio.push((range, port));
        Ok(())
    }

    /// Maps a bus number range to `port`.
    pub fn add_buses(&mut self, range: BusRange, port: PortId) -> Result<(), TopologyError> {
        if range.first > range.last {
            return Err(TopologyError::InvalidTopology(format!(
                "bus range {}..={} is empty",
                range.first, range.last
            )));
        }
        if let Some((r, p)) = self.buses.iter().find(|(r, _)| r.overlaps(&range)) {
            return Err(TopologyError::InvalidTopology(format!(
                "bus range {}..={} overlaps {}..={} of {p}",
                range.first, range.last, r.first, r.last
            )));
        }
        self.buses.push((range, port));
        Ok(())
    }

    /// Maps a CXL.cache id to `port`.
    pub fn add_cache_id(&mut self, cache_id: u8, port: PortId) -> Result<(), TopologyError> {
        if let Some(owner) = self.cache_ids.insert(cache_id, port) {
            return Err(TopologyError::InvalidTopology(format!(
                "cache id {cache_id} assigned to both {owner} and {port}"
            )));
        }
        Ok(())
    }

    /// Maps a back-invalidate id to `port`.
    pub fn add_bi_id(&mut self, bi_id: u16, port: PortId) -> Result<(), TopologyError> {
        if let Some(owner) = self.bi_ids.insert(bi_id, port) {
            return Err(TopologyError::InvalidTopology(format!(
                "BI-ID {bi_id} assigned to both {owner} and {port}"
            )));
        }
        Ok(())
    }

    /// Returns every port referenced by the table.
    pub fn referenced_ports(&self) -> Vec<PortId> {
        let mut ports: Vec<PortId> = self
            .hdm
            .iter()
            .flat_map(|d| d.targets().iter().copied())
            .chain(self.mmio.iter().map(|(_, p)| *p))
            .chain(self.buses.iter().map(|(_, p)| *p))
            .chain(self.cache_ids.values().copied())
            .chain(self.bi_ids.values().copied())
            .chain(std::iter::once(self.upstream))
            .collect();
        ports.sort();
        ports.dedup();
        ports
    }

    fn by_address(&self, address: u64) -> Result<Option<PortId>, RouteError> {
        let hits: Vec<PortId> = self
            .hdm
            .iter()
            .filter_map(|d| d.target(address))
            .chain(
                self.mmio
                    .iter()
                    .filter(|(r, _)| r.contains(address))
                    .map(|(_, p)| *p),
            )
            .collect();
        single(hits, || format!("address {address:#x}"))
    }

    fn by_mmio(&self, address: u64) -> Result<Option<PortId>, RouteError> {
        let hits: Vec<PortId> = self
            .mmio
            .iter()
            .filter(|(r, _)| r.contains(address))
            .map(|(_, p)| *p)
            .collect();
        single(hits, || format!("MMIO address {address:#x}"))
    }

    fn by_hdm(&self, address: u64) -> Result<Option<PortId>, RouteError> {
        let hits: Vec<PortId> = self.hdm.iter().filter_map(|d| d.target(address)).collect();
        single(hits, || format!("HDM address {address:#x}"))
    }

    fn by_bus(&self, bus: u8) -> Result<Option<PortId>, RouteError> {
        let hits: Vec<PortId> = self
            .buses
            .iter()
            .filter(|(r, _)| r.contains(bus))
            .map(|(_, p)| *p)
            .collect();
        single(hits, || format!("bus {bus:#04x}"))
    }

    /// Returns the port claiming `address` in any address window.
    pub fn lookup_address(&self, address: u64) -> Result<Option<PortId>, RouteError> {
        self.by_address(address)
    }
}

fn single(hits: Vec<PortId>, what: impl FnOnce() -> String) -> Result<Option<PortId>, RouteError> {
    match hits.len() {
        0 => Ok(None),
        1 => Ok(hits.first().copied()),
        count => Err(RouteError::AmbiguousRoute {
            what: what(),
            count,
        }),
    }
}

impl RouteQuery for RouteTable {
    fn route(&self, ingress: PortId, packet: &Packet) -> Result<PortId, RouteError> {
        let from_upstream = ingress == self.upstream;
        let upstream = Some(self.upstream);

        let target = match packet {
            Packet::Io(p) => match p.op {
                IoOp::MemRd | IoOp::MemWr => match self.by_mmio(p.address)? {
                    Some(port) => Some(port),
                    None if !from_upstream => upstream,
                    None => None,
                },
                IoOp::CfgRd | IoOp::CfgWr if from_upstream => self.by_bus(p.completer.bus)?,
                IoOp::CfgRd | IoOp::CfgWr => None,
                IoOp::Cpl | IoOp::CplD => match self.by_bus(p.requester.bus)? {
                    Some(port) => Some(port),
                    None if !from_upstream => upstream,
                    None => None,
                },
            },
            Packet::Mem(m) => match m {
                MemPacket::M2sReq(r) if from_upstream => self.by_hdm(r.address)?,
                MemPacket::M2sRwd(r) if from_upstream => self.by_hdm(r.address)?,
                MemPacket::M2sBiRsp(r) if from_upstream => self.bi_ids.get(&r.bi_id).copied(),
                MemPacket::S2mBiSnp(_) | MemPacket::S2mNdr(_) | MemPacket::S2mDrs(_)
                    if !from_upstream =>
                {
                    upstream
                }
                _ => None,
            },
            Packet::Cache(c) => match c {
                CachePacket::H2dReq(_) | CachePacket::H2dRsp(_) | CachePacket::H2dData(_)
                    if from_upstream =>
                {
                    self.cache_ids.get(&c.cache_id()).copied()
                }
                CachePacket::D2hReq(_) | CachePacket::D2hRsp(_) | CachePacket::D2hData(_)
                    if !from_upstream =>
                {
                    upstream
                }
                _ => None,
            },
        };

        match target {
            Some(port) if port == ingress => Err(RouteError::Unroutable {
                ingress,
                what: format!("{} (would reflect to its ingress)", packet.describe()),
            }),
            Some(port) => Ok(port),
            None => Err(RouteError::Unroutable {
                ingress,
                what: packet.describe(),
            }),
        }
    }
}
