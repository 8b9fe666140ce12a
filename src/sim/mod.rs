//! Component Event Loops.
//!
//! Each simulated component (the switch, every device, the host) runs its
//! own single-task event loop and talks to the others only through links.
//! No component holds a reference into another; callers interact with a
//! running component through its handle, which exchanges messages with the
//! loop and only ever hands back copies.
//!
//! `Simulation::start` brings a whole topology up in one process over
//! loopback TCP: the switch first, then each device, then the host.

pub mod device;
pub mod endpoint;
pub mod host;
pub mod switch;

use std::sync::Arc;

use crate::common::{CxlError, PortId};
use crate::config::Topology;
use crate::device::build_device;
use crate::fabric::FabricSnapshot;
use crate::port::{Port, PortKind};
use crate::transport::capture::CaptureSink;
use endpoint::{Dialer, Endpoint};

pub use device::{DeviceHandle, DeviceNode, DeviceRequest};
pub use host::{HostHandle, HostNode};
pub use switch::{SwitchHandle, SwitchNode};

/// A running topology.
pub struct Simulation {
    pub switch: SwitchHandle,
    pub host: HostHandle,
    pub devices: Vec<DeviceHandle>,
}

impl Simulation {
    /// Starts the switch, the devices and the host described by `topology`.
    ///
    /// Fails if the switch cannot listen or a component cannot bind its
    /// port; anything already started is shut down first.
    pub async fn start(
        topology: &Topology,
        capture: Option<Arc<dyn CaptureSink>>,
    ) -> Result<Self, CxlError> {
        let mut switch = SwitchNode::spawn(topology, capture.clone()).await?;
        let dialer = Dialer::new(
            &switch.local_addr().to_string(),
            topology.connect_timeout,
            topology.flit_size,
            capture,
        );

        let mut devices: Vec<DeviceHandle> = Vec::with_capacity(topology.devices.len());
        for spec in &topology.devices {
            let port = Port::new(
                spec.port,
                PortKind::DevicePort,
                spec.kind.protocols(),
                &topology.credits,
                topology.timeout,
            );
            let link = match dialer.dial(spec.port).await {
                Ok(link) => link,
                Err(e) => {
                    for d in devices.iter_mut() {
                        d.shutdown().await;
                    }
                    switch.shutdown().await;
                    return Err(e.into());
                }
            };
            let endpoint = Endpoint::new(&spec.name, port, link, topology.flit_size)
                .with_dialer(dialer.clone());
            devices.push(DeviceNode::spawn(endpoint, build_device(spec), topology.tick));
        }

        let host_port: PortId = topology.host.port;
        let protocols = topology
            .ports
            .iter()
            .find(|p| p.id == host_port)
            .map(|p| p.protocols.clone())
            .unwrap_or_default();
        let port = Port::new(
            host_port,
            PortKind::RootPort,
            &protocols,
            &topology.credits,
            topology.timeout,
        );
        let link = match dialer.dial(host_port).await {
            Ok(link) => link,
            Err(e) => {
                for d in devices.iter_mut() {
                    d.shutdown().await;
                }
                switch.shutdown().await;
                return Err(e.into());
            }
        };
        let endpoint =
            Endpoint::new("host", port, link, topology.flit_size).with_dialer(dialer);
        let host = HostNode::spawn(
            endpoint,
            topology.host.bdf,
            topology.host.memory_size,
            topology.tick,
        );

        Ok(Self {
            switch,
            host,
            devices,
        })
    }

    /// Returns the handle of the device called `name`.
    pub fn device(&self, name: &str) -> Option<&DeviceHandle> {
        self.devices.iter().find(|d| d.name() == name)
    }

    /// Returns a copy of the switch state.
    pub async fn snapshot(&self) -> Option<FabricSnapshot> {
        self.switch.snapshot().await
    }

    /// Stops every component: host first, then devices, then the switch.
    pub async fn shutdown(mut self) {
        self.host.shutdown().await;
        for d in self.devices.iter_mut() {
            d.shutdown().await;
        }
        self.switch.shutdown().await;
    }
}
