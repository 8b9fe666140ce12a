//! Topology configuration.
//!
//! The fabric is described by a TOML file deserialised into
//! `TopologyConfig`. Addresses and sizes may be written as integers or as
//! hexadecimal strings (`"0x1000"`, underscores allowed). `validate` turns
//! the raw description into an immutable `Topology`, rejecting anything the
//! fabric could not route unambiguously.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use crate::common::constants::{
    CACHE_LINE_SIZE, MAX_FLIT_SIZE, MAX_MEMORY_SIZE, MIN_FLIT_SIZE, MMIO_WINDOW_SIZE,
};
use crate::common::{Bdf, PortId, ProtocolKind, TopologyError};
use crate::device::DeviceKind;
use crate::fabric::hdm::{AddressRange, DeviceDecoder, HdmDecoder};
use crate::fabric::route::{BusRange, RouteTable};
use crate::port::PortKind;
use crate::txn::{CreditLimits, MessageClass};

const DEFAULT_FLIT_SIZE: usize = crate::common::DEFAULT_FLIT_SIZE;
const DEFAULT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_TICK_MS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
const DEFAULT_HOST_MEMORY: u64 = 0x10_0000;
const DEFAULT_DEVICE_CAPACITY: u64 = 0x10_0000;
const DEFAULT_GRANULARITY: u64 = 256;
const DEFAULT_DEVICE_ID: u16 = 0x0d93;

/// An integer written either as a TOML integer or as a hex string.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum HexValue {
    Int(u64),
    Text(String),
}

impl HexValue {
    /// Resolves the value, naming `field` in the error.
    pub fn resolve(&self, field: &str) -> Result<u64, TopologyError> {
        match self {
            HexValue::Int(v) => Ok(*v),
            HexValue::Text(s) => parse_hex(s).ok_or_else(|| {
                TopologyError::InvalidTopology(format!("{field}: malformed number '{s}'"))
            }),
        }
    }
}

/// Parses `0x`-prefixed hex or plain decimal, ignoring `_` separators.
pub fn parse_hex(s: &str) -> Option<u64> {
    let cleaned: String = s.trim().chars().filter(|&c| c != '_').collect();
    match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => cleaned.parse().ok(),
    }
}

#[derive(Debug, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub fabric: FabricConfig,
    #[serde(default)]
    pub credits: CreditLimits,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default, rename = "port")]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub hdm: Vec<HdmConfig>,
    #[serde(default)]
    pub mmio: Vec<MmioConfig>,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Deserialize)]
pub struct FabricConfig {
    #[serde(default = "default_flit_size")]
    pub flit_size: usize,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            flit_size: default_flit_size(),
            timeout_ms: default_timeout_ms(),
            tick_ms: default_tick_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub port: u8,

    #[serde(default = "default_host_memory")]
    pub memory_size: HexValue,

    #[serde(default)]
    pub bus: u8,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: 0,
            memory_size: default_host_memory(),
            bus: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SwitchPortKind {
    Upstream,
    Downstream,
}

#[derive(Debug, Deserialize)]
pub struct PortConfig {
    pub id: u8,
    pub kind: SwitchPortKind,
    #[serde(default = "default_protocols")]
    pub protocols: Vec<ProtocolKind>,
}

#[derive(Debug, Deserialize)]
pub struct HdmConfig {
    pub base: HexValue,
    pub size: HexValue,
    #[serde(default = "default_granularity")]
    pub granularity: u64,
    pub targets: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct MmioConfig {
    pub base: HexValue,
    #[serde(default = "default_mmio_size")]
    pub size: HexValue,
    pub port: u8,
}

#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub kind: DeviceKind,
    pub port: u8,
    pub bus: u8,

    #[serde(default = "default_device_capacity")]
    pub capacity: HexValue,

    #[serde(default)]
    pub cache_id: Option<u8>,

    #[serde(default)]
    pub fill: u8,

    #[serde(default = "default_device_id")]
    pub device_id: u16,
}

fn default_flit_size() -> usize {
    DEFAULT_FLIT_SIZE
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_listen() -> String {
    "127.0.0.1:0".to_string()
}

fn default_host_memory() -> HexValue {
    HexValue::Int(DEFAULT_HOST_MEMORY)
}

fn default_protocols() -> Vec<ProtocolKind> {
    ProtocolKind::ALL.to_vec()
}

fn default_granularity() -> u64 {
    DEFAULT_GRANULARITY
}

fn default_mmio_size() -> HexValue {
    HexValue::Int(MMIO_WINDOW_SIZE)
}

fn default_device_capacity() -> HexValue {
    HexValue::Int(DEFAULT_DEVICE_CAPACITY)
}

fn default_device_id() -> u16 {
    DEFAULT_DEVICE_ID
}

/// A switch port as built into the fabric.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSpec {
    pub id: PortId,
    pub kind: PortKind,
    pub protocols: Vec<ProtocolKind>,
}

/// A validated device description.
#[derive(Clone, Debug)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: DeviceKind,
    pub port: PortId,
    pub bdf: Bdf,
    pub capacity: u64,
    pub cache_id: Option<u8>,
    pub bi_id: u16,
    pub fill: u8,
    pub device_id: u16,
    pub decoders: Vec<DeviceDecoder>,
    pub mmio: Option<AddressRange>,
}

/// The validated host description.
#[derive(Clone, Debug)]
pub struct HostSpec {
    pub port: PortId,
    pub bdf: Bdf,
    pub memory_size: u64,
}

/// A validated, immutable fabric description.
#[derive(Clone, Debug)]
pub struct Topology {
    pub flit_size: usize,
    pub timeout: Duration,
    pub tick: Duration,
    pub connect_timeout: Duration,
    pub listen: String,
    pub credits: CreditLimits,
    pub ports: Vec<PortSpec>,
    pub routes: RouteTable,
    pub devices: Vec<DeviceSpec>,
    pub host: HostSpec,
}

impl Topology {
    /// Returns the device attached to `port`.
    pub fn device_at(&self, port: PortId) -> Option<&DeviceSpec> {
        self.devices.iter().find(|d| d.port == port)
    }

    /// Returns the device called `name`.
    pub fn device(&self, name: &str) -> Option<&DeviceSpec> {
        self.devices.iter().find(|d| d.name == name)
    }
}

fn invalid(msg: String) -> TopologyError {
    TopologyError::InvalidTopology(msg)
}

impl TopologyConfig {
    /// Reads and parses a TOML topology file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses a TOML topology document.
    pub fn parse(text: &str) -> Result<Self, TopologyError> {
        Ok(toml::from_str(text)?)
    }

    /// Validates the description and builds the immutable topology.
    ///
    /// Fails with `InvalidTopology` on duplicate or undefined ports,
    /// overlapping address or bus ranges, bad interleave parameters, zero
    /// capacities and malformed numbers.
    pub fn validate(&self) -> Result<Topology, TopologyError> {
        let fabric = &self.fabric;
        if !(MIN_FLIT_SIZE..=MAX_FLIT_SIZE).contains(&fabric.flit_size) {
            return Err(invalid(format!(
                "flit_size {} outside [{MIN_FLIT_SIZE}, {MAX_FLIT_SIZE}]",
                fabric.flit_size
            )));
        }
        if fabric.timeout_ms == 0 || fabric.tick_ms == 0 {
            return Err(invalid("timeout_ms and tick_ms must be non-zero".to_string()));
        }
        for class in MessageClass::ALL {
            if self.credits.get(class) == 0 {
                return Err(invalid(format!("credit limit for {class:?} is zero")));
            }
        }

        let ports = self.validate_ports()?;
        let upstream = ports
            .iter()
            .find(|p| p.kind == PortKind::UpstreamSwitchPort)
            .map(|p| p.id)
            .ok_or_else(|| invalid("no upstream port defined".to_string()))?;
        if self.host.port != upstream.val() {
            return Err(invalid(format!(
                "host binds port {} but the upstream port is {}",
                self.host.port, upstream
            )));
        }
        let host_memory = self.host.memory_size.resolve("host.memory_size")?;
        if host_memory == 0 || host_memory % CACHE_LINE_SIZE as u64 != 0 {
            return Err(invalid(format!(
                "host memory size {host_memory:#x} must be a non-zero multiple of {CACHE_LINE_SIZE}"
            )));
        }
        if host_memory > MAX_MEMORY_SIZE {
            return Err(invalid(format!(
                "host memory size {host_memory:#x} exceeds the {MAX_MEMORY_SIZE:#x} byte limit"
            )));
        }
        let port_kinds: BTreeMap<PortId, &PortSpec> = ports.iter().map(|p| (p.id, p)).collect();

        let mut routes = RouteTable::new(upstream);
        let devices = self.validate_devices(&port_kinds, &mut routes)?;
        let mem_ports: BTreeSet<PortId> = devices
            .iter()
            .filter(|d| d.kind.protocols().contains(&ProtocolKind::Mem))
            .map(|d| d.port)
            .collect();

        let mut devices = devices;
        for (i, hdm) in self.hdm.iter().enumerate() {
            let range = AddressRange::new(
                hdm.base.resolve(&format!("hdm[{i}].base"))?,
                hdm.size.resolve(&format!("hdm[{i}].size"))?,
            );
            let mut targets = Vec::with_capacity(hdm.targets.len());
            for &t in &hdm.targets {
                let id = PortId(t);
                if !mem_ports.contains(&id) {
                    return Err(invalid(format!(
                        "hdm[{i}] targets {id}, which has no CXL.mem device"
                    )));
                }
                if targets.contains(&id) {
                    return Err(invalid(format!("hdm[{i}] lists {id} twice")));
                }
                targets.push(id);
            }
            let decoder = HdmDecoder::new(range, hdm.granularity, targets)?;
            for device in devices.iter_mut() {
                if let Some(dd) = decoder.device_decoder(device.port) {
                    device.decoders.push(dd);
                }
            }
            routes.add_hdm(decoder)?;
        }

        for device in &devices {
            let needed: u64 = device.decoders.iter().map(|d| d.device_size()).sum();
            if needed > device.capacity {
                return Err(invalid(format!(
                    "device '{}' decodes {needed:#x} bytes but has capacity {:#x}",
                    device.name, device.capacity
                )));
            }
        }

        for (i, mmio) in self.mmio.iter().enumerate() {
            let range = AddressRange::new(
                mmio.base.resolve(&format!("mmio[{i}].base"))?,
                mmio.size.resolve(&format!("mmio[{i}].size"))?,
            );
            let port = PortId(mmio.port);
            let device = devices
                .iter_mut()
                .find(|d| d.port == port)
                .ok_or_else(|| invalid(format!("mmio[{i}] references {port} with no device")))?;
            if device.mmio.is_some() {
                return Err(invalid(format!("device '{}' has two MMIO windows", device.name)));
            }
            device.mmio = Some(range);
            routes.add_mmio(range, port)?;
        }

        Ok(Topology {
            flit_size: fabric.flit_size,
            timeout: Duration::from_millis(fabric.timeout_ms),
            tick: Duration::from_millis(fabric.tick_ms),
            connect_timeout: Duration::from_millis(fabric.connect_timeout_ms),
            listen: fabric.listen.clone(),
            credits: self.credits.clone(),
            ports,
            routes,
            devices,
            host: HostSpec {
                port: upstream,
                bdf: Bdf::new(self.host.bus, 0, 0),
                memory_size: host_memory,
            },
        })
    }

    fn validate_ports(&self) -> Result<Vec<PortSpec>, TopologyError> {
        let mut seen = BTreeSet::new();
        let mut ports = Vec::with_capacity(self.ports.len());
        let mut upstreams = 0;
        for p in &self.ports {
            if !seen.insert(p.id) {
                return Err(invalid(format!("port {} defined twice", p.id)));
            }
            if p.protocols.is_empty() {
                return Err(invalid(format!("port {} enables no protocols", p.id)));
            }
            let kind = match p.kind {
                SwitchPortKind::Upstream => {
                    upstreams += 1;
                    PortKind::UpstreamSwitchPort
                }
                SwitchPortKind::Downstream => PortKind::DownstreamSwitchPort,
            };
            ports.push(PortSpec {
                id: PortId(p.id),
                kind,
                protocols: p.protocols.clone(),
            });
        }
        if upstreams > 1 {
            return Err(invalid(format!("{upstreams} upstream ports defined, expected one")));
        }
        ports.sort_by_key(|p| p.id);
        Ok(ports)
    }

    fn validate_devices(
        &self,
        ports: &BTreeMap<PortId, &PortSpec>,
        routes: &mut RouteTable,
    ) -> Result<Vec<DeviceSpec>, TopologyError> {
        let mut names = BTreeSet::new();
        let mut bound = BTreeSet::new();
        let mut devices = Vec::with_capacity(self.devices.len());
        for d in &self.devices {
            if !names.insert(d.name.as_str()) {
                return Err(invalid(format!("device name '{}' used twice", d.name)));
            }
            let port = PortId(d.port);
            let spec = ports
                .get(&port)
                .ok_or_else(|| invalid(format!("device '{}' references undefined {port}", d.name)))?;
            if spec.kind != PortKind::DownstreamSwitchPort {
                return Err(invalid(format!(
                    "device '{}' must attach to a downstream port, {port} is upstream",
                    d.name
                )));
            }
            if !bound.insert(port) {
                return Err(invalid(format!("{port} has more than one device")));
            }
            for p in d.kind.protocols() {
                if !spec.protocols.contains(p) {
                    return Err(invalid(format!(
                        "device '{}' needs {p} which {port} does not enable",
                        d.name
                    )));
                }
            }
            if d.bus == self.host.bus {
                return Err(invalid(format!(
                    "device '{}' uses the host bus {}",
                    d.name, d.bus
                )));
            }
            let capacity = d.capacity.resolve(&format!("device '{}' capacity", d.name))?;
            if capacity == 0 || capacity % CACHE_LINE_SIZE as u64 != 0 {
                return Err(invalid(format!(
                    "device '{}' capacity {capacity:#x} must be a non-zero multiple of {CACHE_LINE_SIZE}",
                    d.name
                )));
            }
            if capacity > MAX_MEMORY_SIZE {
                return Err(invalid(format!(
                    "device '{}' capacity {capacity:#x} exceeds the {MAX_MEMORY_SIZE:#x} byte limit",
                    d.name
                )));
            }

            let cache_id = match (d.kind.protocols().contains(&ProtocolKind::Cache), d.cache_id) {
                (true, Some(id)) if id < 16 => {
                    routes.add_cache_id(id, port)?;
                    Some(id)
                }
                (true, Some(id)) => {
                    return Err(invalid(format!(
                        "device '{}' cache id {id} exceeds 4 bits",
                        d.name
                    )))
                }
                (true, None) => {
                    return Err(invalid(format!("device '{}' needs a cache_id", d.name)))
                }
                (false, _) => None,
            };
            let bi_id = port.val() as u16;
            if d.kind.protocols().contains(&ProtocolKind::Mem) {
                routes.add_bi_id(bi_id, port)?;
            }
            routes.add_buses(BusRange { first: d.bus, last: d.bus }, port)?;

            devices.push(DeviceSpec {
                name: d.name.clone(),
                kind: d.kind,
                port,
                bdf: Bdf::new(d.bus, 0, 0),
                capacity,
                cache_id,
                bi_id,
                fill: d.fill,
                device_id: d.device_id,
                decoders: Vec::new(),
                mmio: None,
            });
        }
        Ok(devices)
    }
}
