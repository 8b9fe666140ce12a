//! Switch Node.
//!
//! Accepts links, binds each to a switch port through the connect
//! handshake, and forwards data flits with the fabric. Every link gets a
//! reader task that funnels its events into the switch loop, so the fabric
//! itself is only ever touched from one task.
//!
//! A malformed flit or a lost connection closes only the link it came
//! from; traffic between the remaining ports continues.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{ControlMessage, Flit, FlitBody};
use crate::common::{LinkId, PortId, TransportError};
use crate::config::Topology;
use crate::fabric::{Fabric, FabricSnapshot};
use crate::transport::capture::CaptureSink;
use crate::transport::{Link, LinkEvent, LinkListener, LinkSender};

enum SwitchCommand {
    Snapshot(oneshot::Sender<FabricSnapshot>),
    Shutdown,
}

struct Attached {
    sender: LinkSender,
    port: Option<PortId>,
}

/// Switch event loop state.
pub struct SwitchNode {
    fabric: Fabric,
    listener: LinkListener,
    capture: Option<Arc<dyn CaptureSink>>,
    links: BTreeMap<LinkId, Attached>,
    events_tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>,
    events_rx: mpsc::UnboundedReceiver<(LinkId, LinkEvent)>,
    commands: mpsc::Receiver<SwitchCommand>,
}

impl SwitchNode {
    /// Binds the switch listener and starts the event loop.
    pub async fn spawn(
        topology: &Topology,
        capture: Option<Arc<dyn CaptureSink>>,
    ) -> Result<SwitchHandle, TransportError> {
        let listener = LinkListener::bind(&topology.listen).await?;
        let addr = listener.local_addr();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel(16);
        let node = SwitchNode {
            fabric: Fabric::build(topology),
            listener,
            capture,
            links: BTreeMap::new(),
            events_tx,
            events_rx,
            commands: rx,
        };
        let task = tokio::spawn(node.run());
        Ok(SwitchHandle {
            addr,
            commands: tx,
            task: Some(task),
        })
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                accepted = self.listener.accept(self.fabric.flit_size(), self.capture.clone()) => {
                    match accepted {
                        Ok(link) => self.attach(link),
                        Err(e) => log::warn!("[switch] accept failed: {}", e),
                    }
                }
                Some((id, event)) = self.events_rx.recv() => match event {
                    LinkEvent::Frame(bytes) => self.on_frame(id, bytes),
                    LinkEvent::Closed(reason) => self.detach(id, reason),
                },
                cmd = self.commands.recv() => match cmd {
                    Some(SwitchCommand::Snapshot(reply)) => {
                        let _ = reply.send(self.fabric.snapshot());
                    }
                    None | Some(SwitchCommand::Shutdown) => break,
                },
            }
            self.flush();
        }
        self.teardown();
    }

    fn attach(&mut self, mut link: Link) {
        let id = link.id();
        log::debug!("[switch] {} connected from {}", id, link.peer());
        self.links.insert(
            id,
            Attached {
                sender: link.sender(),
                port: None,
            },
        );
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                let event = link.recv().await;
                let closed = matches!(event, LinkEvent::Closed(_));
                if events.send((id, event)).is_err() || closed {
                    break;
                }
            }
        });
    }

    fn detach(&mut self, id: LinkId, reason: Option<TransportError>) {
        let Some(attached) = self.links.remove(&id) else {
            return;
        };
        attached.sender.close();
        if let Some(port) = attached.port {
            match reason {
                Some(e) => log::warn!("[switch] {} on {} lost: {}", port, id, e),
                None => log::info!("[switch] {} on {} closed", port, id),
            }
            let _ = self.fabric.link_down(port);
        }
    }

    fn reply(&self, id: LinkId, msg: ControlMessage) {
        if let Some(attached) = self.links.get(&id) {
            let _ = attached
                .sender
                .send_flit(&Flit::control(self.fabric.flit_size(), msg));
        }
    }

    fn on_frame(&mut self, id: LinkId, bytes: Bytes) {
        let bound = self.links.get(&id).and_then(|a| a.port);
        let flit = match Flit::decode(&bytes) {
            Ok(flit) => flit,
            Err(e) => {
                self.fabric
                    .record_format_error(bound.unwrap_or(PortId(u8::MAX)), &e);
                log::error!("[switch] closing {}: {}", id, e);
                self.detach(id, Some(e.into()));
                return;
            }
        };

        match (flit.body(), bound) {
            (FlitBody::Control(ControlMessage::ConnectRequest { port }), None) => {
                let port = PortId(*port);
                if self.fabric.accept_connection(port) {
                    if let Some(attached) = self.links.get_mut(&id) {
                        attached.port = Some(port);
                    }
                    log::info!("[switch] {} bound to {}", id, port);
                    self.reply(id, ControlMessage::ConnectAccept);
                } else {
                    self.reply(id, ControlMessage::ConnectReject);
                }
            }
            (FlitBody::Control(ControlMessage::Disconnect), _) => self.detach(id, None),
            (FlitBody::Control(msg), _) => {
                log::warn!("[switch] unexpected {:?} on {}", msg, id);
            }
            (FlitBody::Packets(_), Some(port)) => {
                for e in self.fabric.receive_flit(port, &flit) {
                    log::warn!("[switch] {}: {}", port, e);
                }
            }
            (FlitBody::Packets(_), None) => {
                log::warn!("[switch] data flit on unbound {}", id);
            }
        }
    }

    /// Sends everything the fabric has queued, one link at a time.
    fn flush(&mut self) {
        for port in self.fabric.pending_ports() {
            let sender = self
                .links
                .values()
                .find(|a| a.port == Some(port))
                .map(|a| a.sender.clone());
            let flits = match self.fabric.take_flits(port) {
                Ok(flits) => flits,
                Err(e) => {
                    log::error!("[switch] cannot pack flits for {}: {}", port, e);
                    continue;
                }
            };
            let Some(sender) = sender else {
                continue;
            };
            for flit in &flits {
                if let Err(e) = sender.send_flit(flit) {
                    log::warn!("[switch] send on {} failed: {}", port, e);
                    break;
                }
            }
        }
    }

    fn teardown(&mut self) {
        let flit_size = self.fabric.flit_size();
        for attached in self.links.values() {
            let _ = attached
                .sender
                .send_flit(&Flit::control(flit_size, ControlMessage::Disconnect));
            attached.sender.close();
        }
        self.links.clear();
        self.fabric.teardown();
        log::info!("[switch] stopped");
    }
}

/// Caller-side handle to a running switch.
pub struct SwitchHandle {
    addr: SocketAddr,
    commands: mpsc::Sender<SwitchCommand>,
    task: Option<JoinHandle<()>>,
}

impl SwitchHandle {
    /// Returns the address devices and the host dial.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns a copy of the fabric's ports and counters.
    pub async fn snapshot(&self) -> Option<FabricSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(SwitchCommand::Snapshot(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Disconnects every link and stops the switch.
    pub async fn shutdown(&mut self) {
        let _ = self.commands.send(SwitchCommand::Shutdown).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
