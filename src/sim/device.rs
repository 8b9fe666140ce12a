//! Device Node.
//!
//! Runs one device model behind its device port. Requests arriving from the
//! host are served by the model; requests the device originates (bias
//! flips, host line reads, back-invalidate snoops) are injected through the
//! `DeviceHandle` and applied to the model once the host answers.

use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::endpoint::{Arrival, Endpoint, Reply};
use crate::codec::Packet;
use crate::common::{Bias, CxlError, DeviceError};
use crate::device::{serve_request, Accelerator, DeviceModel};
use crate::port::PortSnapshot;
use crate::stats::NodeStats;
use crate::transport::LinkEvent;
use crate::txn::CompletedTransaction;

const COMMAND_QUEUE: usize = 64;

/// A request the device originates toward the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceRequest {
    /// Move the block at this host address into device bias.
    AcquireDeviceBias(u64),
    /// Return the block at this host address to host bias.
    ReleaseDeviceBias(u64),
    /// Cache one host memory line, shared or exclusive.
    ReadHostLine { address: u64, exclusive: bool },
    /// Ask the host to drop its copy of a device memory line.
    BackInvalidate(u64),
}

type Inspect = Box<dyn FnOnce(&mut dyn DeviceModel) + Send>;

enum DeviceCommand {
    Request { request: DeviceRequest, reply: Reply },
    Inspect(Inspect),
    Snapshot(oneshot::Sender<PortSnapshot>),
    Stats(oneshot::Sender<NodeStats>),
    Disconnect(oneshot::Sender<()>),
    Reconnect(oneshot::Sender<Result<(), CxlError>>),
    Shutdown,
}

/// Device event loop state.
pub struct DeviceNode {
    endpoint: Endpoint,
    model: Box<dyn DeviceModel>,
    tick: Duration,
    commands: mpsc::Receiver<DeviceCommand>,
}

impl DeviceNode {
    /// Starts the device event loop.
    pub fn spawn(endpoint: Endpoint, model: Box<dyn DeviceModel>, tick: Duration) -> DeviceHandle {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let name = model.name().to_string();
        let node = DeviceNode {
            endpoint,
            model,
            tick,
            commands: rx,
        };
        let task = tokio::spawn(node.run());
        DeviceHandle {
            name,
            commands: tx,
            task: Some(task),
        }
    }

    async fn run(mut self) -> Option<CxlError> {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("[dev {}] running", self.model.name());

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
                    None | Some(DeviceCommand::Shutdown) => break,
                    Some(DeviceCommand::Reconnect(reply)) => {
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
            Some(e) => log::error!("[dev {}] stopped: {}", self.model.name(), e),
            None => log::info!("[dev {}] stopped", self.model.name()),
        }
        fault
    }

    fn build(&mut self, request: DeviceRequest) -> Result<Packet, DeviceError> {
        let name = self.model.name().to_string();
        let accel: &mut Accelerator = self.model.as_accelerator_mut().ok_or_else(|| {
            DeviceError::Unsupported(format!("{name} does not originate coherence requests"))
        })?;
        match request {
            DeviceRequest::AcquireDeviceBias(hpa) => accel.request_device_bias(hpa),
            DeviceRequest::ReleaseDeviceBias(hpa) => accel.release_device_bias(hpa),
            DeviceRequest::ReadHostLine { address, exclusive } => {
                Ok(accel.read_host_line(address, exclusive))
            }
            DeviceRequest::BackInvalidate(hpa) => accel.back_invalidate(hpa),
        }
    }

    fn on_command(&mut self, cmd: DeviceCommand) {
        match cmd {
            DeviceCommand::Request { request, reply } => match self.build(request) {
                Ok(packet) => self.endpoint.submit(packet, reply),
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                }
            },
            DeviceCommand::Inspect(f) => f(self.model.as_mut()),
            DeviceCommand::Snapshot(reply) => {
                let _ = reply.send(self.endpoint.snapshot());
            }
            DeviceCommand::Stats(reply) => {
                let _ = reply.send(self.endpoint.stats().clone());
            }
            DeviceCommand::Disconnect(reply) => {
                self.endpoint.close();
                let _ = reply.send(());
            }
            DeviceCommand::Reconnect(_) | DeviceCommand::Shutdown => {}
        }
    }

    fn on_arrival(&mut self, arrival: Arrival) {
        match arrival {
            Arrival::Completed(done) => {
                let outcome = self
                    .model
                    .handle_cache_snoop_response(&done)
                    .map_err(CxlError::from);
                self.endpoint.complete(done, outcome);
            }
            Arrival::Request(packet) => {
                let responses = serve_request(self.model.as_mut(), &packet);
                self.endpoint.respond(responses);
            }
        }
    }
}

/// Caller-side handle to a running device.
pub struct DeviceHandle {
    name: String,
    commands: mpsc::Sender<DeviceCommand>,
    task: Option<JoinHandle<Option<CxlError>>>,
}

impl DeviceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Originates a coherence request and waits for the host's answer.
    pub async fn request(&self, request: DeviceRequest) -> Result<CompletedTransaction, CxlError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(DeviceCommand::Request { request, reply })
            .await
            .map_err(|_| CxlError::Shutdown)?;
        rx.await.map_err(|_| CxlError::Shutdown)?
    }

    /// Runs `f` against the device model inside its event loop.
    pub async fn inspect<R, F>(&self, f: F) -> Result<R, CxlError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn DeviceModel) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Inspect = Box::new(move |model| {
            let _ = tx.send(f(model));
        });
        self.commands
            .send(DeviceCommand::Inspect(job))
            .await
            .map_err(|_| CxlError::Shutdown)?;
        rx.await.map_err(|_| CxlError::Shutdown)
    }

    /// Returns the bias of the device memory block at `dpa`.
    pub async fn bias(&self, dpa: u64) -> Result<Bias, CxlError> {
        let name = self.name.clone();
        self.inspect(move |model| {
            model
                .as_accelerator_mut()
                .map(|a| a.bias(dpa))
                .ok_or_else(|| DeviceError::Unsupported(format!("{name} tracks no bias")))
        })
        .await?
        .map_err(CxlError::from)
    }

    /// Reads device memory from the device's own compute engine.
    pub async fn device_read(&self, dpa: u64, length: usize) -> Result<Vec<u8>, CxlError> {
        let name = self.name.clone();
        self.inspect(move |model| match model.as_accelerator_mut() {
            Some(a) => a.device_read(dpa, length),
            None => Err(DeviceError::Unsupported(format!("{name} has no compute engine"))),
        })
        .await?
        .map_err(CxlError::from)
    }

    /// Writes device memory from the device's own compute engine.
    pub async fn device_write(&self, dpa: u64, data: Vec<u8>) -> Result<(), CxlError> {
        let name = self.name.clone();
        self.inspect(move |model| match model.as_accelerator_mut() {
            Some(a) => a.device_write(dpa, &data),
            None => Err(DeviceError::Unsupported(format!("{name} has no compute engine"))),
        })
        .await?
        .map_err(CxlError::from)
    }

    /// Returns a copy of the device port's state.
    pub async fn port_state(&self) -> Result<PortSnapshot, CxlError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(DeviceCommand::Snapshot(reply))
            .await
            .map_err(|_| CxlError::Shutdown)?;
        rx.await.map_err(|_| CxlError::Shutdown)
    }

    /// Returns a copy of the device counters.
    pub async fn stats(&self) -> Result<NodeStats, CxlError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(DeviceCommand::Stats(reply))
            .await
            .map_err(|_| CxlError::Shutdown)?;
        rx.await.map_err(|_| CxlError::Shutdown)
    }

    /// Closes the link while the device keeps running.
    pub async fn disconnect(&self) -> Result<(), CxlError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(DeviceCommand::Disconnect(reply))
            .await
            .map_err(|_| CxlError::Shutdown)?;
        rx.await.map_err(|_| CxlError::Shutdown)
    }

    /// Redials the switch and rebinds the device port after link loss.
    pub async fn reconnect(&self) -> Result<(), CxlError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(DeviceCommand::Reconnect(reply))
            .await
            .map_err(|_| CxlError::Shutdown)?;
        rx.await.map_err(|_| CxlError::Shutdown)?
    }

    /// Returns `true` once the event loop has ended.
    pub fn is_stopped(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stops the device and closes its link.
    ///
    /// # Returns
    ///
    /// The protocol violation that stopped the device on its own, if any.
    pub async fn shutdown(&mut self) -> Option<CxlError> {
        let _ = self.commands.send(DeviceCommand::Shutdown).await;
        match self.task.take() {
            Some(task) => task.await.ok().flatten(),
            None => None,
        }
    }
}
