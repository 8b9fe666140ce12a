//! Host Node.
//!
//! The host owns the root port, the host memory that devices cache through
//! CXL.cache, and an async handle through which callers inject accesses.
//! Each access waits for its transaction to resolve; failures come back as
//! errors and are never retried here.
//!
//! Requests the host answers on its own:
//!
//! | From the device           | Host reply                                  |
//! |---------------------------|---------------------------------------------|
//! | RdCurr                    | H2D Data                                    |
//! | RdShared / RdOwn / RdAny  | GO (Shared / Exclusive) and H2D Data        |
//! | RdOwnNoData               | GO (Exclusive)                              |
//! | evictions and writes      | GO (Invalid)                                |
//! | read outside host memory  | GO-Err, or poisoned data for RdCurr         |
//! | S2M BISnp                 | M2S BIRsp (BIRspI)                          |

use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::endpoint::{Arrival, Endpoint, Reply};
use crate::codec::cache::{CachePacket, CacheState, D2hReq, D2hReqOp, H2dData, H2dReqOp, H2dRsp, H2dRspOp};
use crate::codec::io::{CplStatus, IoPacket};
use crate::codec::mem::{BiRspOp, M2sBiRsp, MemPacket};
use crate::codec::Packet;
use crate::common::constants::{CACHE_LINE_SIZE, PHYS_ADDR_BITS};
use crate::common::{Bdf, CxlError, DeviceError};
use crate::device::BackingStore;
use crate::port::PortSnapshot;
use crate::stats::NodeStats;
use crate::transport::LinkEvent;
use crate::txn::CompletedTransaction;

/// Depth of the host command queue.
const COMMAND_QUEUE: usize = 64;

enum HostCommand {
    Request { packet: Packet, reply: Reply },
    Snapshot(oneshot::Sender<PortSnapshot>),
    Stats(oneshot::Sender<NodeStats>),
    PoisonedData,
    HostMemory {
        address: u64,
        data: Option<Vec<u8>>,
        reply: oneshot::Sender<Result<Vec<u8>, CxlError>>,
    },
    Disconnect(oneshot::Sender<()>),
    Reconnect(oneshot::Sender<Result<(), CxlError>>),
    Shutdown,
}

/// Host event loop state.
pub struct HostNode {
    endpoint: Endpoint,
    bdf: Bdf,
    memory: BackingStore,
    tick: std::time::Duration,
    commands: mpsc::Receiver<HostCommand>,
}

impl HostNode {
    /// Starts the host event loop.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Root port already bound to the switch
    /// * `bdf` - Requester id of the root port
    /// * `memory_size` - Size of host memory served to devices
    /// * `tick` - Deadline check period
    pub fn spawn(
        endpoint: Endpoint,
        bdf: Bdf,
        memory_size: u64,
        tick: std::time::Duration,
    ) -> HostHandle {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let node = HostNode {
            endpoint,
            bdf,
            memory: BackingStore::new(memory_size, 0),
            tick,
            commands: rx,
        };
        let task = tokio::spawn(node.run());
        HostHandle {
            bdf,
            commands: tx,
            task: Some(task),
        }
    }

    async fn run(mut self) -> Option<CxlError> {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("[{}] running", self.endpoint.name());

        let mut fault = None;
        loop {
            tokio::select! {
                event = self.endpoint.next_event() => match event {
                    LinkEvent::Frame(bytes) => {
                        if let Ok(received) = self.endpoint.on_frame(bytes) {
                            for arrival in received.arrivals {
                                self.on_arrival(arrival);
                            }
                            fault = received.fault;
                        }
                    }
                    LinkEvent::Closed(reason) => self.endpoint.link_lost(reason),
                },
                cmd = self.commands.recv() => match cmd {
                    None | Some(HostCommand::Shutdown) => break,
                    Some(HostCommand::Reconnect(reply)) => {
                        let _ = reply.send(self.endpoint.reconnect().await);
                    }
                    Some(cmd) => self.on_command(cmd),
                },
                _ = interval.tick() => self.endpoint.tick(Instant::now()),
            }
            self.endpoint.flush();
            if fault.is_some() {
                break;
            }
        }

        self.endpoint.close();
        match &fault {
            Some(e) => log::error!("[{}] stopped: {}", self.endpoint.name(), e),
            None => log::info!("[{}] stopped", self.endpoint.name()),
        }
        fault
    }

    fn on_command(&mut self, cmd: HostCommand) {
        match cmd {
            HostCommand::Request { packet, reply } => self.endpoint.submit(packet, reply),
            HostCommand::Snapshot(reply) => {
                let _ = reply.send(self.endpoint.snapshot());
            }
            HostCommand::Stats(reply) => {
                let _ = reply.send(self.endpoint.stats().clone());
            }
            HostCommand::PoisonedData => self.endpoint.stats_mut().poisoned += 1,
            HostCommand::HostMemory {
                address,
                data,
                reply,
            } => {
                let result = match data {
                    Some(bytes) => self.memory.write(address, &bytes).map(|_| bytes),
                    None => self.memory.read(address, CACHE_LINE_SIZE),
                };
                let _ = reply.send(result.map_err(CxlError::from));
            }
            HostCommand::Disconnect(reply) => {
                self.endpoint.close();
                let _ = reply.send(());
            }
            HostCommand::Reconnect(_) | HostCommand::Shutdown => {}
        }
    }

    fn on_arrival(&mut self, arrival: Arrival) {
        match arrival {
            Arrival::Completed(done) => self.endpoint.complete(done, Ok(())),
            Arrival::Request(packet) => {
                let responses = self.serve(&packet);
                self.endpoint.respond(responses);
            }
        }
    }

    fn serve(&mut self, packet: &Packet) -> Vec<Packet> {
        match packet {
            Packet::Cache(CachePacket::D2hReq(req)) => self.serve_d2h(req),
            Packet::Mem(MemPacket::S2mBiSnp(snp)) => {
                log::debug!("[{}] back-invalidate of {:#x}", self.endpoint.name(), snp.address);
                vec![MemPacket::M2sBiRsp(M2sBiRsp {
                    op: BiRspOp::BiRspI,
                    bi_id: snp.bi_id,
                    bi_tag: snp.bi_tag,
                })
                .into()]
            }
            Packet::Io(p) => {
                log::warn!("[{}] unsupported CXL.io {:?} to host", self.endpoint.name(), p.op);
                vec![IoPacket::completion(p, self.bdf, CplStatus::UnsupportedRequest).into()]
            }
            other => {
                log::warn!("[{}] cannot serve {}", self.endpoint.name(), other.describe());
                Vec::new()
            }
        }
    }

    fn serve_d2h(&mut self, req: &D2hReq) -> Vec<Packet> {
        let go = |op: H2dRspOp, state: CacheState| -> Packet {
            CachePacket::H2dRsp(H2dRsp {
                op,
                state,
                cqid: req.cqid,
                cache_id: req.cache_id,
            })
            .into()
        };
        let data = |bytes: Vec<u8>, poison: bool| -> Packet {
            CachePacket::H2dData(H2dData {
                go_err: poison,
                poison,
                cqid: req.cqid,
                cache_id: req.cache_id,
                data: bytes,
            })
            .into()
        };

        let granted = match req.op {
            D2hReqOp::RdOwn | D2hReqOp::RdAny => CacheState::Exclusive,
            _ => CacheState::Shared,
        };
        match req.op {
            D2hReqOp::RdCurr | D2hReqOp::RdShared | D2hReqOp::RdOwn | D2hReqOp::RdAny => {
                let line = self.memory.read(req.address, CACHE_LINE_SIZE);
                match (req.op, line) {
                    (D2hReqOp::RdCurr, Ok(bytes)) => vec![data(bytes, false)],
                    (D2hReqOp::RdCurr, Err(e)) => {
                        log::warn!("[{}] RdCurr at {:#x}: {}", self.endpoint.name(), req.address, e);
                        vec![data(vec![0; CACHE_LINE_SIZE], true)]
                    }
                    (_, Ok(bytes)) => vec![go(H2dRspOp::Go, granted), data(bytes, false)],
                    (_, Err(e)) => {
                        log::warn!("[{}] {:?} at {:#x}: {}", self.endpoint.name(), req.op, req.address, e);
                        vec![go(H2dRspOp::GoErr, CacheState::Error)]
                    }
                }
            }
            D2hReqOp::RdOwnNoData => vec![go(H2dRspOp::Go, CacheState::Exclusive)],
            _ => vec![go(H2dRspOp::Go, CacheState::Invalid)],
        }
    }
}

/// Caller-side handle to a running host.
pub struct HostHandle {
    bdf: Bdf,
    commands: mpsc::Sender<HostCommand>,
    task: Option<JoinHandle<Option<CxlError>>>,
}

fn line_base(address: u64) -> u64 {
    address & !(CACHE_LINE_SIZE as u64 - 1)
}

/// Returns the end of `[address, address + length)`, failing if the span
/// leaves the physical address space.
fn span_end(address: u64, length: usize) -> Result<u64, CxlError> {
    match address.checked_add(length as u64) {
        Some(end) if end <= 1 << PHYS_ADDR_BITS => Ok(end),
        _ => Err(CxlError::RequestFailed(format!(
            "access of {length} bytes at {address:#x} leaves the {PHYS_ADDR_BITS}-bit address space"
        ))),
    }
}

impl HostHandle {
    /// Returns the root port's requester id.
    pub fn bdf(&self) -> Bdf {
        self.bdf
    }

    /// Issues one request and waits for it to resolve.
    pub async fn request(&self, packet: Packet) -> Result<CompletedTransaction, CxlError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::Request { packet, reply })
            .await
            .map_err(|_| CxlError::Shutdown)?;
        rx.await.map_err(|_| CxlError::Shutdown)?
    }

    async fn note_poisoned(&self) {
        let _ = self.commands.send(HostCommand::PoisonedData).await;
    }

    /// Reads `length` bytes of device memory at host physical `address`.
    ///
    /// The access is split into one CXL.mem read per 64-byte line, issued
    /// in address order.
    pub async fn mem_read(&self, address: u64, length: usize) -> Result<Vec<u8>, CxlError> {
        let end = span_end(address, length)?;
        let mut out = Vec::with_capacity(length);
        let mut line = line_base(address);
        while line < end {
            let done = self.request(MemPacket::mem_read(line).into()).await?;
            let bytes = match done.data {
                Some(Packet::Mem(MemPacket::S2mDrs(drs))) if drs.poison => {
                    self.note_poisoned().await;
                    return Err(CxlError::Poisoned { address: line });
                }
                Some(Packet::Mem(MemPacket::S2mDrs(drs))) => drs.data,
                _ => {
                    return Err(CxlError::RequestFailed(format!(
                        "read of {line:#x} completed without data"
                    )))
                }
            };
            let from = address.saturating_sub(line) as usize;
            let to = ((end - line) as usize).min(CACHE_LINE_SIZE);
            out.extend_from_slice(&bytes[from..to]);
            line += CACHE_LINE_SIZE as u64;
        }
        Ok(out)
    }

    /// Writes `data` to device memory at host physical `address`.
    ///
    /// Address and length must be multiples of the 64-byte line size.
    pub async fn mem_write(&self, address: u64, data: &[u8]) -> Result<(), CxlError> {
        let line_size = CACHE_LINE_SIZE as u64;
        if address % line_size != 0 || data.len() % CACHE_LINE_SIZE != 0 {
            return Err(CxlError::RequestFailed(format!(
                "write of {} bytes at {address:#x} is not line aligned",
                data.len()
            )));
        }
        span_end(address, data.len())?;
        for (i, chunk) in data.chunks(CACHE_LINE_SIZE).enumerate() {
            let line = address + i as u64 * line_size;
            let done = self
                .request(MemPacket::mem_write(line, chunk.to_vec()).into())
                .await?;
            if let Some(Packet::Mem(MemPacket::S2mNdr(ndr))) = &done.response {
                if ndr.poison {
                    self.note_poisoned().await;
                    return Err(CxlError::Poisoned { address: line });
                }
            }
        }
        Ok(())
    }

    fn io_result(done: CompletedTransaction) -> Result<IoPacket, CxlError> {
        match done.response {
            Some(Packet::Io(cpl)) if cpl.status == CplStatus::Success => Ok(cpl),
            Some(Packet::Io(cpl)) => Err(CxlError::RequestFailed(format!(
                "completion status {:?}",
                cpl.status
            ))),
            _ => Err(CxlError::RequestFailed("missing completion".to_string())),
        }
    }

    /// Reads one configuration dword of device `target`.
    pub async fn cfg_read(&self, target: Bdf, register: u16) -> Result<u32, CxlError> {
        let done = self
            .request(IoPacket::cfg_read(self.bdf, target, register).into())
            .await?;
        let cpl = Self::io_result(done)?;
        match cpl.payload.get(0..4) {
            Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            None => Err(CxlError::RequestFailed("CplD without payload".to_string())),
        }
    }

    /// Writes one configuration dword of device `target`.
    pub async fn cfg_write(&self, target: Bdf, register: u16, value: u32) -> Result<(), CxlError> {
        let done = self
            .request(IoPacket::cfg_write(self.bdf, target, register, value).into())
            .await?;
        Self::io_result(done).map(|_| ())
    }

    /// Reads `length` bytes (whole dwords) from a device MMIO window.
    pub async fn mmio_read(&self, address: u64, length: usize) -> Result<Vec<u8>, CxlError> {
        let length_dw = length.div_ceil(4) as u16;
        let done = self
            .request(IoPacket::mem_read(self.bdf, address, length_dw).into())
            .await?;
        let mut payload = Self::io_result(done)?.payload;
        payload.truncate(length);
        Ok(payload)
    }

    /// Writes whole dwords to a device MMIO window.
    pub async fn mmio_write(&self, address: u64, data: &[u8]) -> Result<(), CxlError> {
        if data.is_empty() || data.len() % 4 != 0 {
            return Err(CxlError::RequestFailed(format!(
                "MMIO write of {} bytes is not whole dwords",
                data.len()
            )));
        }
        let done = self
            .request(IoPacket::mem_write(self.bdf, address, data.to_vec()).into())
            .await?;
        Self::io_result(done).map(|_| ())
    }

    /// Snoops the device owning `cache_id` for the line at `address`.
    ///
    /// # Returns
    ///
    /// The device's response and, for dirty lines, the forwarded data.
    pub async fn snoop(
        &self,
        op: H2dReqOp,
        cache_id: u8,
        address: u64,
    ) -> Result<CompletedTransaction, CxlError> {
        self.request(CachePacket::h2d_snoop(op, cache_id, line_base(address)).into())
            .await
    }

    /// Reads one line of host memory.
    pub async fn host_memory_read(&self, address: u64) -> Result<Vec<u8>, CxlError> {
        self.host_memory(address, None).await
    }

    /// Writes one line of host memory.
    pub async fn host_memory_write(&self, address: u64, data: Vec<u8>) -> Result<(), CxlError> {
        if data.len() != CACHE_LINE_SIZE {
            return Err(DeviceError::Unsupported(format!(
                "host memory writes are whole lines, got {} bytes",
                data.len()
            ))
            .into());
        }
        self.host_memory(address, Some(data)).await.map(|_| ())
    }

    async fn host_memory(&self, address: u64, data: Option<Vec<u8>>) -> Result<Vec<u8>, CxlError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::HostMemory {
                address: line_base(address),
                data,
                reply,
            })
            .await
            .map_err(|_| CxlError::Shutdown)?;
        rx.await.map_err(|_| CxlError::Shutdown)?
    }

    /// Returns a copy of the root port's state.
    pub async fn port_state(&self) -> Result<PortSnapshot, CxlError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::Snapshot(reply))
            .await
            .map_err(|_| CxlError::Shutdown)?;
        rx.await.map_err(|_| CxlError::Shutdown)
    }

    /// Returns a copy of the host counters.
    pub async fn stats(&self) -> Result<NodeStats, CxlError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::Stats(reply))
            .await
            .map_err(|_| CxlError::Shutdown)?;
        rx.await.map_err(|_| CxlError::Shutdown)
    }

    /// Closes the link while the host keeps running. Outstanding work is
    /// aborted.
    pub async fn disconnect(&self) -> Result<(), CxlError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::Disconnect(reply))
            .await
            .map_err(|_| CxlError::Shutdown)?;
        rx.await.map_err(|_| CxlError::Shutdown)
    }

    /// Redials the switch after the link was lost.
    pub async fn reconnect(&self) -> Result<(), CxlError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::Reconnect(reply))
            .await
            .map_err(|_| CxlError::Shutdown)?;
        rx.await.map_err(|_| CxlError::Shutdown)?
    }

    /// Returns `true` once the event loop has ended.
    pub fn is_stopped(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stops the host and closes its link. Outstanding work is aborted.
    ///
    /// # Returns
    ///
    /// The protocol violation that stopped the host on its own, if any.
    pub async fn shutdown(&mut self) -> Option<CxlError> {
        let _ = self.commands.send(HostCommand::Shutdown).await;
        match self.task.take() {
            Some(task) => task.await.ok().flatten(),
            None => None,
        }
    }
}
