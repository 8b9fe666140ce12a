//! Type-1 / Type-2 Accelerator.
//!
//! An accelerator caches host memory through CXL.cache and, for Type-2,
//! exposes its own memory to the host through CXL.mem. Device memory is
//! tracked in 64-byte blocks, each in host or device bias:
//!
//! * Host bias: the host reads and writes freely over CXL.mem; the device's
//!   own compute engine may not touch the block.
//! * Device bias: the device owns the block; host CXL.mem accesses fail.
//!
//! Bias moves only through CXL.cache requests the device sends to the host:
//! `RdOwnNoData` answered by GO(Exclusive) flips a block to device bias,
//! `CleanEvictNoData` answered by GO(Invalid) flips it back. The request
//! builders here return the packet to send; `handle_cache_snoop_response`
//! applies the outcome once the host has answered.

use super::bias::BiasTable;
use super::cache::{DeviceCache, LineState};
use super::{DeviceCore, DeviceKind, DeviceModel};
use crate::codec::cache::{CachePacket, D2hReqOp, H2dReq, H2dRspOp};
use crate::codec::mem::{BiSnpOp, MemPacket, S2mBiSnp};
use crate::codec::Packet;
use crate::common::constants::CACHE_LINE_SIZE;
use crate::common::{AccessType, Bias, DeviceError};
use crate::txn::CompletedTransaction;

/// Number of host lines an accelerator may cache.
pub const DEVICE_CACHE_LINES: usize = 64;

pub struct Accelerator {
    core: DeviceCore,
    kind: DeviceKind,
    cache_id: u8,
    bi_id: u16,
    bias: BiasTable,
    cache: DeviceCache,
}

impl Accelerator {
    /// Creates an accelerator.
    ///
    /// # Arguments
    ///
    /// * `core` - Identity, config space and device memory
    /// * `kind` - `AcceleratorType1` or `AcceleratorType2`
    /// * `cache_id` - CXL.cache id the host uses to snoop this device
    /// * `bi_id` - Back-invalidate id the host uses to answer BISnp
    pub fn new(core: DeviceCore, kind: DeviceKind, cache_id: u8, bi_id: u16) -> Self {
        log::info!(
            "[dev {}] {:?} at {}, cache id {}",
            core.name(),
            kind,
            core.bdf(),
            cache_id
        );
        Self {
            core,
            kind,
            cache_id,
            bi_id,
            bias: BiasTable::new(),
            cache: DeviceCache::new(DEVICE_CACHE_LINES),
        }
    }

    pub fn cache_id(&self) -> u8 {
        self.cache_id
    }

    pub fn bi_id(&self) -> u16 {
        self.bi_id
    }

    /// Returns the bias of the device memory block at `dpa`.
    pub fn bias(&self, dpa: u64) -> Bias {
        self.bias.bias(dpa)
    }

    pub fn bias_table(&self) -> &BiasTable {
        &self.bias
    }

    pub fn cache(&self) -> &DeviceCache {
        &self.cache
    }

    fn require_memory(&self, what: &str) -> Result<(), DeviceError> {
        if self.kind == DeviceKind::AcceleratorType2 {
            Ok(())
        } else {
            Err(DeviceError::Unsupported(format!(
                "{what} on {}: Type-1 devices have no host-managed memory",
                self.core.name()
            )))
        }
    }

    /// Reads device memory from the accelerator's own compute engine.
    pub fn device_read(&self, dpa: u64, length: usize) -> Result<Vec<u8>, DeviceError> {
        self.core.memory().check(dpa, length)?;
        self.bias.check(dpa, length, AccessType::Device)?;
        self.core.memory().read(dpa, length)
    }

    /// Writes device memory from the accelerator's own compute engine.
    pub fn device_write(&mut self, dpa: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.core.memory().check(dpa, data.len())?;
        self.bias.check(dpa, data.len(), AccessType::Device)?;
        self.core.memory_mut().write(dpa, data)
    }

    /// Builds the request that moves the block at `hpa` into device bias.
    pub fn request_device_bias(&self, hpa: u64) -> Result<Packet, DeviceError> {
        self.require_memory("bias flip")?;
        self.core.translate(hpa)?;
        Ok(CachePacket::d2h_request(D2hReqOp::RdOwnNoData, self.cache_id, line(hpa)).into())
    }

    /// Builds the request that returns the block at `hpa` to host bias.
    pub fn release_device_bias(&self, hpa: u64) -> Result<Packet, DeviceError> {
        self.require_memory("bias flip")?;
        self.core.translate(hpa)?;
        Ok(CachePacket::d2h_request(D2hReqOp::CleanEvictNoData, self.cache_id, line(hpa)).into())
    }

    /// Builds a read of one host memory line into the device cache.
    pub fn read_host_line(&self, hpa: u64, exclusive: bool) -> Packet {
        let op = if exclusive {
            D2hReqOp::RdOwn
        } else {
            D2hReqOp::RdShared
        };
        CachePacket::d2h_request(op, self.cache_id, line(hpa)).into()
    }

    /// Returns the cached copy of the host line containing `hpa`.
    pub fn cached_line(&self, hpa: u64) -> Option<&[u8]> {
        self.cache.data(hpa)
    }

    pub fn line_state(&self, hpa: u64) -> LineState {
        self.cache.state(hpa)
    }

    /// Writes into a cached host line the device owns.
    pub fn write_cached(&mut self, hpa: u64, offset: usize, bytes: &[u8]) -> Result<(), DeviceError> {
        self.cache.write(hpa, offset, bytes)
    }

    /// Builds a back-invalidate snoop asking the host to give up the line
    /// at `hpa` in device memory.
    pub fn back_invalidate(&self, hpa: u64) -> Result<Packet, DeviceError> {
        self.require_memory("back-invalidate")?;
        self.core.translate(hpa)?;
        Ok(MemPacket::S2mBiSnp(S2mBiSnp {
            op: BiSnpOp::BiSnpInv,
            bi_id: self.bi_id,
            bi_tag: 0,
            address: line(hpa),
        })
        .into())
    }

    fn apply_go(&mut self, done: &CompletedTransaction, op: D2hReqOp, hpa: u64) -> Result<(), DeviceError> {
        let rsp = match &done.response {
            Some(Packet::Cache(CachePacket::H2dRsp(rsp))) => Some(rsp),
            _ => None,
        };
        if let Some(rsp) = rsp {
            if rsp.op == H2dRspOp::GoErr {
                return Err(DeviceError::Unsupported(format!(
                    "host refused {:?} at {:#x}",
                    op, hpa
                )));
            }
        }
        let granted = rsp
            .map(|r| LineState::from_granted(r.state))
            .unwrap_or(LineState::Invalid);

        match op {
            D2hReqOp::RdOwnNoData => {
                let dpa = self.core.translate(hpa)?;
                if granted.is_writable() {
                    self.bias.set(dpa, Bias::DeviceBias);
                    log::debug!("[dev {}] block {:#x} now in device bias", self.core.name(), dpa);
                }
            }
            D2hReqOp::CleanEvictNoData => {
                let dpa = self.core.translate(hpa)?;
                self.bias.set(dpa, Bias::HostBias);
                log::debug!("[dev {}] block {:#x} back in host bias", self.core.name(), dpa);
            }
            D2hReqOp::RdOwn | D2hReqOp::RdShared | D2hReqOp::RdAny => {
                if let Some(Packet::Cache(CachePacket::H2dData(data))) = &done.data {
                    if data.poison {
                        return Err(DeviceError::Unsupported(format!(
                            "poisoned line returned for {:#x}",
                            hpa
                        )));
                    }
                    if let Some((victim, _)) = self.cache.install(hpa, granted, data.data.clone()) {
                        log::debug!(
                            "[dev {}] evicted dirty line {:#x}",
                            self.core.name(),
                            victim
                        );
                    }
                }
            }
            D2hReqOp::CleanEvict | D2hReqOp::DirtyEvict => {
                self.cache.evict(hpa);
            }
            _ => {}
        }
        Ok(())
    }
}

fn line(address: u64) -> u64 {
    address & !(CACHE_LINE_SIZE as u64 - 1)
}

impl DeviceModel for Accelerator {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn handle_mem_read(&mut self, dpa: u64, length: usize) -> Result<Vec<u8>, DeviceError> {
        self.require_memory("CXL.mem read")?;
        self.core.memory().check(dpa, length)?;
        self.bias.check(dpa, length, AccessType::Host)?;
        self.core.memory().read(dpa, length)
    }

    fn handle_mem_write(&mut self, dpa: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.require_memory("CXL.mem write")?;
        self.core.memory().check(dpa, data.len())?;
        self.bias.check(dpa, data.len(), AccessType::Host)?;
        self.core.memory_mut().write(dpa, data)
    }

    fn handle_cache_snoop(&mut self, snoop: &H2dReq) -> Result<Vec<Packet>, DeviceError> {
        let result = self.cache.snoop(snoop.op, snoop.address);
        log::debug!(
            "[dev {}] {:?} at {:#x} -> {:?}",
            self.core.name(),
            snoop.op,
            snoop.address,
            result.response
        );
        Ok(super::snoop_packets(snoop, result))
    }

    fn handle_cache_snoop_response(&mut self, done: &CompletedTransaction) -> Result<(), DeviceError> {
        match &done.request {
            Packet::Cache(CachePacket::D2hReq(req)) => {
                let (op, hpa) = (req.op, req.address);
                self.apply_go(done, op, hpa)
            }
            Packet::Mem(MemPacket::S2mBiSnp(snp)) => {
                log::debug!(
                    "[dev {}] back-invalidate of {:#x} acknowledged",
                    self.core.name(),
                    snp.address
                );
                Ok(())
            }
            other => Err(DeviceError::Unsupported(format!(
                "unexpected completion for {}",
                other.describe()
            ))),
        }
    }

    fn as_accelerator_mut(&mut self) -> Option<&mut Accelerator> {
        Some(self)
    }
}
