//! Device Models.
//!
//! Behavioural stand-ins for CXL endpoints:
//!
//! * `MemoryExpander`: a Type-3 device serving CXL.mem from a backing store.
//! * `Accelerator`: a Type-1 (CXL.cache only) or Type-2 (CXL.cache and
//!   CXL.mem) device with a MESI line cache and per-block bias tracking.
//!
//! Every model also answers CXL.io configuration and MMIO requests. The
//! `serve_request` dispatcher turns an arriving request packet into the
//! response packets the device sends back; protocol-level failures become
//! poisoned data or an Unsupported Request completion on the wire, while the
//! `DeviceModel` methods report them to direct callers as `DeviceError`s.

pub mod accelerator;
pub mod backing;
pub mod bias;
pub mod cache;
pub mod config_space;
pub mod memory_expander;

use serde::{Deserialize, Serialize};

use crate::codec::cache::{CachePacket, D2hData, D2hRsp, D2hRspOp, H2dReq};
use crate::codec::io::{CplStatus, IoOp, IoPacket};
use crate::codec::mem::{M2sReqOp, MemPacket, NdrOp};
use crate::codec::Packet;
use crate::common::constants::{CACHE_LINE_SIZE, EMULATED_VENDOR_ID};
use crate::common::{Bdf, DeviceError, ProtocolKind};
use crate::config::DeviceSpec;
use crate::fabric::hdm::{AddressRange, DeviceDecoder};
use crate::txn::CompletedTransaction;

pub use accelerator::Accelerator;
pub use backing::BackingStore;
pub use bias::BiasTable;
pub use cache::{DeviceCache, LineState};
pub use config_space::{ConfigSpace, MmioWindow};
pub use memory_expander::MemoryExpander;

/// Kind of emulated device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    /// Type-1: caching accelerator without host-managed memory.
    AcceleratorType1,
    /// Type-2: caching accelerator with host-managed memory.
    AcceleratorType2,
    /// Type-3: memory expander.
    MemoryExpander,
}

impl DeviceKind {
    /// Returns the sub-protocols the device speaks.
    pub fn protocols(self) -> &'static [ProtocolKind] {
        match self {
            DeviceKind::AcceleratorType1 => &[ProtocolKind::Io, ProtocolKind::Cache],
            DeviceKind::AcceleratorType2 => {
                &[ProtocolKind::Io, ProtocolKind::Mem, ProtocolKind::Cache]
            }
            DeviceKind::MemoryExpander => &[ProtocolKind::Io, ProtocolKind::Mem],
        }
    }
}

/// State shared by every device model: identity, configuration space,
/// MMIO window, HDM decoders and backing memory.
#[derive(Clone, Debug)]
pub struct DeviceCore {
    name: String,
    bdf: Bdf,
    config: ConfigSpace,
    mmio: Option<MmioWindow>,
    decoders: Vec<DeviceDecoder>,
    memory: BackingStore,
}

impl DeviceCore {
    /// Creates a device core with `capacity` bytes of memory set to `fill`.
    pub fn new(name: &str, bdf: Bdf, config: ConfigSpace, capacity: u64, fill: u8) -> Self {
        Self {
            name: name.to_string(),
            bdf,
            config,
            mmio: None,
            decoders: Vec::new(),
            memory: BackingStore::new(capacity, fill),
        }
    }

    /// Adds the HDM decoders that map host addresses onto this device.
    pub fn with_decoders(mut self, decoders: Vec<DeviceDecoder>) -> Self {
        self.decoders = decoders;
        self
    }

    /// Adds an MMIO register window.
    pub fn with_mmio(mut self, range: AddressRange) -> Self {
        self.mmio = Some(MmioWindow::new(range));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bdf(&self) -> Bdf {
        self.bdf
    }

    pub fn config(&self) -> &ConfigSpace {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ConfigSpace {
        &mut self.config
    }

    pub fn mmio(&self) -> Option<&MmioWindow> {
        self.mmio.as_ref()
    }

    pub fn mmio_mut(&mut self) -> Option<&mut MmioWindow> {
        self.mmio.as_mut()
    }

    pub fn memory(&self) -> &BackingStore {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut BackingStore {
        &mut self.memory
    }

    /// Translates a host physical address to a device physical address.
    ///
    /// Decoders are stacked in device address space in the order given.
    /// Without decoders the device is directly addressed and the address is
    /// returned unchanged.
    pub fn translate(&self, hpa: u64) -> Result<u64, DeviceError> {
        if self.decoders.is_empty() {
            return Ok(hpa);
        }
        let mut dpa_base = 0;
        for decoder in &self.decoders {
            if let Some(dpa) = decoder.translate(hpa) {
                return Ok(dpa_base + dpa);
            }
            dpa_base += decoder.device_size();
        }
        Err(DeviceError::Unmapped { address: hpa })
    }
}

/// Capability set of an emulated device.
pub trait DeviceModel: Send {
    /// Returns the device kind.
    fn kind(&self) -> DeviceKind;

    /// Returns the shared device state.
    fn core(&self) -> &DeviceCore;

    /// Returns the shared device state mutably.
    fn core_mut(&mut self) -> &mut DeviceCore;

    /// Returns the device name used in logs.
    fn name(&self) -> &str {
        self.core().name()
    }

    /// Serves a host read of device memory at device address `dpa`.
    ///
    /// Fails with `OutOfRange` past the backing store and with
    /// `BiasViolation` if the block is owned by the device.
    fn handle_mem_read(&mut self, dpa: u64, length: usize) -> Result<Vec<u8>, DeviceError>;

    /// Serves a host write of device memory. Validates before mutating.
    fn handle_mem_write(&mut self, dpa: u64, data: &[u8]) -> Result<(), DeviceError>;

    /// Answers a host snoop with a D2H response and optional data.
    fn handle_cache_snoop(&mut self, snoop: &H2dReq) -> Result<Vec<Packet>, DeviceError> {
        Err(DeviceError::Unsupported(format!(
            "{} has no cache to snoop at {:#x}",
            self.name(),
            snoop.address
        )))
    }

    /// Applies the response to a coherence request this device originated
    /// (GO for a D2H request, BIRsp for a back-invalidate snoop).
    fn handle_cache_snoop_response(&mut self, done: &CompletedTransaction) -> Result<(), DeviceError> {
        let _ = done;
        Ok(())
    }

    /// Downcasts the device to an accelerator if applicable.
    fn as_accelerator_mut(&mut self) -> Option<&mut Accelerator> {
        None
    }
}

/// Builds the device model described by `spec`.
pub fn build_device(spec: &DeviceSpec) -> Box<dyn DeviceModel> {
    let class = match spec.kind {
        DeviceKind::MemoryExpander => config_space::CLASS_CXL_MEMORY,
        DeviceKind::AcceleratorType1 | DeviceKind::AcceleratorType2 => {
            config_space::CLASS_ACCELERATOR
        }
    };
    let mut core = DeviceCore::new(
        &spec.name,
        spec.bdf,
        ConfigSpace::new(EMULATED_VENDOR_ID, spec.device_id, class),
        spec.capacity,
        spec.fill,
    )
    .with_decoders(spec.decoders.clone());
    if let Some(range) = spec.mmio {
        core = core.with_mmio(range);
    }
    match spec.kind {
        DeviceKind::MemoryExpander => Box::new(MemoryExpander::new(core)),
        kind => Box::new(Accelerator::new(
            core,
            kind,
            spec.cache_id.unwrap_or(0),
            spec.bi_id,
        )),
    }
}

fn unsupported(request: &IoPacket, bdf: Bdf) -> Packet {
    Packet::Io(IoPacket::completion(request, bdf, CplStatus::UnsupportedRequest))
}

fn serve_io(model: &mut dyn DeviceModel, p: &IoPacket) -> Vec<Packet> {
    let bdf = model.core().bdf();
    let result: Result<Packet, DeviceError> = match p.op {
        IoOp::CfgRd if p.completer == bdf => model
            .core()
            .config()
            .read(p.address as u16)
            .map(|v| Packet::Io(IoPacket::completion_with_data(p, bdf, v.to_le_bytes().to_vec()))),
        IoOp::CfgWr if p.completer == bdf => {
            let value = p
                .payload
                .get(0..4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0);
            model
                .core_mut()
                .config_mut()
                .write(p.address as u16, value, p.first_be)
                .map(|_| Packet::Io(IoPacket::completion(p, bdf, CplStatus::Success)))
        }
        IoOp::MemRd => match model.core().mmio() {
            Some(window) => window
                .read(p.address, p.length_dw as usize * 4)
                .map(|data| Packet::Io(IoPacket::completion_with_data(p, bdf, data))),
            None => Err(DeviceError::Unmapped { address: p.address }),
        },
        IoOp::MemWr => match model.core_mut().mmio_mut() {
            Some(window) => window
                .write(p.address, &p.payload)
                .map(|_| Packet::Io(IoPacket::completion(p, bdf, CplStatus::Success))),
            None => Err(DeviceError::Unmapped { address: p.address }),
        },
        _ => Err(DeviceError::Unsupported(format!("{:?} for {}", p.op, p.completer))),
    };
    match result {
        Ok(packet) => vec![packet],
        Err(e) => {
            log::warn!("[dev {}] CXL.io {:?} rejected: {}", model.name(), p.op, e);
            if p.op.is_completion() {
                Vec::new()
            } else {
                vec![unsupported(p, bdf)]
            }
        }
    }
}

fn read_line(model: &mut dyn DeviceModel, hpa: u64) -> Result<Vec<u8>, DeviceError> {
    let dpa = model.core().translate(hpa)?;
    model.handle_mem_read(dpa, CACHE_LINE_SIZE)
}

fn write_line(model: &mut dyn DeviceModel, hpa: u64, data: &[u8]) -> Result<(), DeviceError> {
    let dpa = model.core().translate(hpa)?;
    model.handle_mem_write(dpa, data)
}

fn serve_mem(model: &mut dyn DeviceModel, m: &MemPacket) -> Vec<Packet> {
    match m {
        MemPacket::M2sReq(req) if req.op == M2sReqOp::MemInv => {
            let poison = match model.core().translate(req.address) {
                Ok(_) => false,
                Err(e) => {
                    log::warn!("[dev {}] MemInv at {:#x}: {}", model.name(), req.address, e);
                    true
                }
            };
            vec![MemPacket::completion(NdrOp::Cmp, req.tag, req.ld_id, poison).into()]
        }
        MemPacket::M2sReq(req) => match read_line(model, req.address) {
            Ok(data) => vec![MemPacket::data_response(req.tag, req.ld_id, data, false).into()],
            Err(e) => {
                log::warn!(
                    "[dev {}] M2S read at {:#x} poisoned: {}",
                    model.name(),
                    req.address,
                    e
                );
                let zeros = vec![0; CACHE_LINE_SIZE];
                vec![MemPacket::data_response(req.tag, req.ld_id, zeros, true).into()]
            }
        },
        MemPacket::M2sRwd(req) => {
            let poison = match write_line(model, req.address, &req.data) {
                Ok(()) => req.poison,
                Err(e) => {
                    log::warn!(
                        "[dev {}] M2S write at {:#x} poisoned: {}",
                        model.name(),
                        req.address,
                        e
                    );
                    true
                }
            };
            vec![MemPacket::completion(NdrOp::Cmp, req.tag, req.ld_id, poison).into()]
        }
        other => {
            log::warn!("[dev {}] unexpected {:?} request", model.name(), other.channel());
            Vec::new()
        }
    }
}

fn serve_cache(model: &mut dyn DeviceModel, c: &CachePacket) -> Vec<Packet> {
    match c {
        CachePacket::H2dReq(snoop) => match model.handle_cache_snoop(snoop) {
            Ok(responses) => responses,
            Err(e) => {
                log::warn!("[dev {}] snoop at {:#x} failed: {}", model.name(), snoop.address, e);
                vec![Packet::Cache(CachePacket::D2hRsp(D2hRsp {
                    op: D2hRspOp::RspIHitI,
                    uqid: snoop.uqid,
                    cache_id: snoop.cache_id,
                }))]
            }
        },
        other => {
            log::warn!("[dev {}] unexpected {:?} request", model.name(), other.channel());
            Vec::new()
        }
    }
}

/// Produces the responses a device sends for an arriving request.
pub fn serve_request(model: &mut dyn DeviceModel, packet: &Packet) -> Vec<Packet> {
    match packet {
        Packet::Io(p) => serve_io(model, p),
        Packet::Mem(m) => serve_mem(model, m),
        Packet::Cache(c) => serve_cache(model, c),
    }
}

/// Builds the D2H response (and forwarded data) for a snoop result.
pub(crate) fn snoop_packets(snoop: &H2dReq, result: cache::SnoopResult) -> Vec<Packet> {
    let mut out = vec![Packet::Cache(CachePacket::D2hRsp(D2hRsp {
        op: result.response,
        uqid: snoop.uqid,
        cache_id: snoop.cache_id,
    }))];
    if let Some(data) = result.forward {
        out.push(Packet::Cache(CachePacket::D2hData(D2hData {
            bogus: false,
            poison: false,
            uqid: snoop.uqid,
            cache_id: snoop.cache_id,
            data,
        })));
    }
    out
}
