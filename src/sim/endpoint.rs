//! Terminal Port Driver.
//!
//! Host and device nodes both own one terminal port wired to one link. This
//! module holds what they share: dialling the switch, decoding arriving
//! flits, parking callers until their transaction resolves, deadline ticks,
//! flushing the outbound queue, link-loss handling and reconnection.
//!
//! A response the port's engines reject (unknown tag, duplicate part,
//! message of the wrong kind) means the two ends disagree about the
//! transactions in flight. Such a violation is fatal to the node: it is
//! returned as `ProtocolViolation` naming the link and packet, and the node
//! stops its event loop.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::codec::{ControlMessage, Flit, FlitBody, Packet};
use crate::common::{CxlError, LinkId, PortId, ProtocolKind, Tag, TransportError};
use crate::port::{Inbound, Port, PortSnapshot};
use crate::stats::NodeStats;
use crate::transport::capture::CaptureSink;
use crate::transport::{self, Link, LinkEvent};
use crate::txn::{CompletedTransaction, TxnFailure, TxnState};

/// Channel a caller waits on for its transaction outcome.
pub type Reply = oneshot::Sender<Result<CompletedTransaction, CxlError>>;

/// Pause between handshake attempts while reconnecting.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(20);

/// A packet that arrived on the port and needs the node's attention.
#[derive(Debug)]
pub enum Arrival {
    Request(Packet),
    Completed(CompletedTransaction),
}

/// Packets decoded from one frame.
#[derive(Debug, Default)]
pub struct Received {
    /// Arrivals in flit order, up to any violation.
    pub arrivals: Vec<Arrival>,
    /// Violation that stopped decoding; the node must stop once the
    /// arrivals before it are handled.
    pub fault: Option<CxlError>,
}

/// Dials the switch and binds `port` with the connect handshake.
///
/// Fails with `ConnectionError` if the switch is unreachable and with
/// `Handshake` if it rejects the port or does not answer within `timeout`.
pub async fn dial_switch(
    addr: &str,
    port: PortId,
    timeout: Duration,
    flit_size: usize,
    capture: Option<Arc<dyn CaptureSink>>,
) -> Result<Link, TransportError> {
    let mut link = transport::connect(addr, timeout, flit_size, capture).await?;
    link.send_flit(&Flit::control(
        flit_size,
        ControlMessage::ConnectRequest { port: port.val() },
    ))?;
    let reply = tokio::time::timeout(timeout, link.recv())
        .await
        .map_err(|_| TransportError::Handshake(format!("no answer for {port} from {addr}")))?;
    let bytes = match reply {
        LinkEvent::Frame(bytes) => bytes,
        LinkEvent::Closed(Some(e)) => return Err(e),
        LinkEvent::Closed(None) => return Err(TransportError::Closed(link.id())),
    };
    match Flit::decode(&bytes)?.control_message() {
        Some(ControlMessage::ConnectAccept) => Ok(link),
        Some(ControlMessage::ConnectReject) => Err(TransportError::Handshake(format!(
            "switch at {addr} rejected {port}"
        ))),
        other => Err(TransportError::Handshake(format!(
            "unexpected handshake reply {other:?}"
        ))),
    }
}

/// Switch address and link parameters a node redials with.
#[derive(Clone)]
pub struct Dialer {
    addr: String,
    timeout: Duration,
    flit_size: usize,
    capture: Option<Arc<dyn CaptureSink>>,
}

impl Dialer {
    pub fn new(
        addr: &str,
        timeout: Duration,
        flit_size: usize,
        capture: Option<Arc<dyn CaptureSink>>,
    ) -> Self {
        Self {
            addr: addr.to_string(),
            timeout,
            flit_size,
            capture,
        }
    }

    /// Dials the switch once and binds `port`.
    pub async fn dial(&self, port: PortId) -> Result<Link, TransportError> {
        dial_switch(
            &self.addr,
            port,
            self.timeout,
            self.flit_size,
            self.capture.clone(),
        )
        .await
    }

    /// Dials until the switch accepts `port` or the connect timeout ends.
    ///
    /// The switch may still hold the previous binding of `port` until it
    /// notices the old link closing, so refusals are retried.
    pub async fn redial(&self, port: PortId) -> Result<Link, TransportError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.dial(port).await {
                Ok(link) => return Ok(link),
                Err(e) if Instant::now() + RECONNECT_BACKOFF < deadline => {
                    log::debug!("[{}] redial failed, retrying: {}", port, e);
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct Endpoint {
    name: String,
    port: Port,
    link: Option<Link>,
    link_id: LinkId,
    dialer: Option<Dialer>,
    flit_size: usize,
    waiters: BTreeMap<(ProtocolKind, Tag), Reply>,
    stats: NodeStats,
}

impl Endpoint {
    /// Wraps a port whose link has completed the handshake.
    pub fn new(name: &str, mut port: Port, link: Link, flit_size: usize) -> Self {
        port.link_training();
        port.link_up();
        Self {
            name: name.to_string(),
            port,
            link_id: link.id(),
            link: Some(link),
            dialer: None,
            flit_size,
            waiters: BTreeMap::new(),
            stats: NodeStats::default(),
        }
    }

    /// Lets the endpoint redial the switch after losing its link.
    pub fn with_dialer(mut self, dialer: Dialer) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &Port {
        &self.port
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut NodeStats {
        &mut self.stats
    }

    pub fn snapshot(&self) -> PortSnapshot {
        self.port.snapshot()
    }

    /// Waits for the next link event; never resolves once the link is gone.
    pub async fn next_event(&mut self) -> LinkEvent {
        match self.link.as_mut() {
            Some(link) => link.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Originates a request; `reply` receives the outcome.
    pub fn submit(&mut self, request: Packet, reply: Reply) {
        let kind = request.kind();
        match self.port.send_request(request, Instant::now()) {
            Ok(tag) => {
                self.stats.requests_sent += 1;
                self.waiters.insert((kind, tag), reply);
            }
            Err(e) => {
                log::debug!("[{}] request rejected: {}", self.name, e);
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    /// Queues responses to a request this node served.
    pub fn respond(&mut self, responses: Vec<Packet>) {
        self.stats.requests_served += 1;
        for r in responses {
            if let Err(e) = self.port.send_response(r) {
                log::warn!("[{}] cannot send response: {}", self.name, e);
            }
        }
    }

    /// Decodes a frame and hands each packet to the port.
    ///
    /// A malformed flit takes the link down and is reported as an error. A
    /// response the engines reject ends decoding with `Received::fault`.
    pub fn on_frame(&mut self, bytes: Bytes) -> Result<Received, CxlError> {
        self.stats.flits_rx += 1;
        let flit = match Flit::decode(&bytes) {
            Ok(flit) => flit,
            Err(e) => {
                log::error!("[{}] malformed flit on {}: {}", self.name, self.port.id(), e);
                self.link_lost(None);
                return Err(e.into());
            }
        };
        let packets = match flit.body() {
            FlitBody::Packets(packets) => packets.clone(),
            FlitBody::Control(ControlMessage::Disconnect) => {
                log::info!("[{}] peer disconnected", self.name);
                self.link_lost(None);
                return Ok(Received::default());
            }
            FlitBody::Control(msg) => {
                log::debug!("[{}] ignoring control flit {:?}", self.name, msg);
                return Ok(Received::default());
            }
        };

        let mut received = Received {
            arrivals: Vec::with_capacity(packets.len()),
            fault: None,
        };
        for packet in packets {
            let what = packet.describe();
            match self.port.on_packet(packet) {
                Ok(Inbound::Request(p)) => received.arrivals.push(Arrival::Request(p)),
                Ok(Inbound::Completed(done)) => received.arrivals.push(Arrival::Completed(done)),
                Ok(Inbound::Partial) => {}
                Err(e) => {
                    log::error!(
                        "[{}] protocol violation on {} ({}) by {}: {}",
                        self.name,
                        self.link_id,
                        self.port.id(),
                        what,
                        e
                    );
                    self.stats.protocol_errors += 1;
                    received.fault = Some(CxlError::ProtocolViolation {
                        link: self.link_id,
                        packet: what,
                        source: e,
                    });
                    break;
                }
            }
        }
        Ok(received)
    }

    /// Delivers a completed transaction to its caller.
    ///
    /// `outcome` carries any error raised while the node applied the
    /// completion; the caller then sees that error instead.
    pub fn complete(&mut self, done: CompletedTransaction, outcome: Result<(), CxlError>) {
        self.stats.completed += 1;
        let key = (done.request.kind(), done.tag);
        if let Some(reply) = self.waiters.remove(&key) {
            let _ = reply.send(outcome.map(|_| done));
        }
    }

    fn fail(&mut self, failures: Vec<TxnFailure>) {
        for f in failures {
            match f.state {
                TxnState::TimedOut => self.stats.timed_out += 1,
                _ => self.stats.aborted += 1,
            }
            if let Some(reply) = self.waiters.remove(&(f.request.kind(), f.tag)) {
                let _ = reply.send(Err(CxlError::TransactionFailed {
                    tag: f.tag,
                    state: f.state,
                }));
            }
        }
    }

    /// Expires overdue transactions.
    pub fn tick(&mut self, now: Instant) {
        let failures = self.port.tick(now);
        self.fail(failures);
    }

    /// Handles loss of the link: the port goes down and every outstanding
    /// transaction is aborted.
    pub fn link_lost(&mut self, reason: Option<TransportError>) {
        match reason {
            Some(e) => log::warn!("[{}] link lost: {}", self.name, e),
            None => log::info!("[{}] link closed", self.name),
        }
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        let failures = self.port.link_down();
        self.fail(failures);
    }

    /// Redials the switch after the link was lost.
    ///
    /// The port trains while the handshake runs and is active once the
    /// switch accepts it; on failure it stays down.
    pub async fn reconnect(&mut self) -> Result<(), CxlError> {
        if self.link.is_some() {
            return Err(CxlError::RequestFailed(format!(
                "{} is still connected on {}",
                self.name, self.link_id
            )));
        }
        let dialer = self.dialer.clone().ok_or_else(|| {
            CxlError::RequestFailed(format!("{} has no switch to redial", self.name))
        })?;
        self.port.link_training();
        match dialer.redial(self.port.id()).await {
            Ok(link) => {
                log::info!("[{}] reconnected on {}", self.name, link.id());
                self.link_id = link.id();
                self.link = Some(link);
                self.port.link_up();
                self.stats.reconnects += 1;
                Ok(())
            }
            Err(e) => {
                log::warn!("[{}] reconnect failed: {}", self.name, e);
                self.port.link_down();
                Err(e.into())
            }
        }
    }

    /// Packs queued packets into flits and sends them.
    pub fn flush(&mut self) {
        if self.port.queued() == 0 {
            return;
        }
        let Some(link) = self.link.as_ref() else {
            return;
        };
        match self.port.take_flits(self.flit_size) {
            Ok(flits) => {
                for flit in &flits {
                    if let Err(e) = link.send_flit(flit) {
                        log::warn!("[{}] send failed: {}", self.name, e);
                        break;
                    }
                    self.stats.flits_tx += 1;
                }
            }
            Err(e) => log::error!("[{}] cannot pack flits: {}", self.name, e),
        }
    }

    /// Announces the disconnect to the switch and closes the link.
    pub fn close(&mut self) {
        if let Some(link) = self.link.as_ref() {
            let _ = link.send_flit(&Flit::control(self.flit_size, ControlMessage::Disconnect));
        }
        self.link_lost(None);
    }
}
