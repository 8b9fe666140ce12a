//! CXL Fabric Emulator CLI.
//!
//! The control surface of the emulator. It validates topology files and
//! runs a whole fabric in one process, injecting host memory accesses and
//! reporting their outcomes and the fabric counters.
//!
//! # Usage
//!
//! 1. **Validate**: `cxl-fabric validate --config topo.toml` checks a
//!    topology without starting anything.
//! 2. **Run**: `cxl-fabric run --config topo.toml --write 0x1000:0xab:64
//!    --read 0x1000:64` starts the switch, devices and host over loopback
//!    TCP, performs the accesses in order and tears the fabric down.
//!
//! Set `RUST_LOG` (e.g. `RUST_LOG=debug`) to control log verbosity.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::process;
use std::sync::Arc;

use cxl_fabric::common::CxlError;
use cxl_fabric::config::{parse_hex, Topology, TopologyConfig};
use cxl_fabric::fabric::FabricSnapshot;
use cxl_fabric::sim::Simulation;
use cxl_fabric::stats::NodeStats;
use cxl_fabric::transport::capture::{CaptureSink, LogCapture};

/// CXL fabric emulator.
#[derive(Parser, Debug)]
#[command(author, version, about = "CXL Fabric Emulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a topology file and print its summary.
    Validate {
        #[arg(short, long, default_value = "configs/default.toml")]
        config: String,
    },
    /// Start the fabric, inject accesses and print the results.
    Run {
        #[arg(short, long, default_value = "configs/default.toml")]
        config: String,

        /// Host read, as ADDR:LEN (e.g. 0x1000:64).
        #[arg(long)]
        read: Vec<String>,

        /// Host write of a repeated byte, as ADDR:BYTE:LEN (e.g. 0x1000:0xab:64).
        #[arg(long)]
        write: Vec<String>,

        /// Print the report as JSON instead of tables.
        #[arg(long)]
        json: bool,

        /// Log every flit at trace level.
        #[arg(long)]
        capture: bool,
    },
}

#[derive(Debug, Serialize)]
struct AccessResult {
    op: &'static str,
    address: u64,
    length: usize,
    ok: bool,
    data: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct Report {
    accesses: Vec<AccessResult>,
    host: Option<NodeStats>,
    devices: Vec<(String, Option<NodeStats>)>,
    fabric: Option<FabricSnapshot>,
}

enum Access {
    Read { address: u64, length: usize },
    Write { address: u64, value: u8, length: usize },
}

fn parse_num(field: &str, text: &str) -> Result<u64, String> {
    parse_hex(text).ok_or_else(|| format!("bad {field} '{text}'"))
}

fn parse_read(arg: &str) -> Result<Access, String> {
    let (addr, len) = arg
        .split_once(':')
        .ok_or_else(|| format!("--read expects ADDR:LEN, got '{arg}'"))?;
    Ok(Access::Read {
        address: parse_num("address", addr)?,
        length: parse_num("length", len)? as usize,
    })
}

fn parse_write(arg: &str) -> Result<Access, String> {
    let parts: Vec<&str> = arg.split(':').collect();
    let [addr, value, len] = parts.as_slice() else {
        return Err(format!("--write expects ADDR:BYTE:LEN, got '{arg}'"));
    };
    let value = parse_num("byte", value)?;
    if value > 0xff {
        return Err(format!("byte value {value:#x} does not fit in 8 bits"));
    }
    Ok(Access::Write {
        address: parse_num("address", addr)?,
        value: value as u8,
        length: parse_num("length", len)? as usize,
    })
}

fn load(path: &str) -> Topology {
    let config = match TopologyConfig::load(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };
    match config.validate() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    }
}

fn print_topology(topology: &Topology) {
    println!("Topology");
    println!("--------------------");
    println!("Fabric:");
    println!("  Flit Size:          {} bytes", topology.flit_size);
    println!("  Timeout:            {:?}", topology.timeout);
    println!("  Tick:               {:?}", topology.tick);
    println!("Ports:");
    for p in &topology.ports {
        println!("  {:<8} {:?} {:?}", p.id.to_string(), p.kind, p.protocols);
    }
    println!("HDM Decoders:");
    for d in topology.routes.hdm_decoders() {
        println!(
            "  {:#x}..{:#x}  {} ways x {} B -> {:?}",
            d.range().base,
            d.range().end(),
            d.ways(),
            d.granularity(),
            d.targets()
        );
    }
    println!("Devices:");
    for d in &topology.devices {
        println!(
            "  {:<12} {:?} on {} ({}), {} KiB",
            d.name,
            d.kind,
            d.port,
            d.bdf,
            d.capacity / 1024
        );
    }
    println!("--------------------");
}

async fn perform(sim: &Simulation, access: &Access) -> AccessResult {
    match *access {
        Access::Read { address, length } => {
            let result = sim.host.mem_read(address, length).await;
            outcome("read", address, length, result)
        }
        Access::Write {
            address,
            value,
            length,
        } => {
            let result = sim
                .host
                .mem_write(address, &vec![value; length])
                .await
                .map(|_| Vec::new());
            outcome("write", address, length, result)
        }
    }
}

fn outcome(op: &'static str, address: u64, length: usize, result: Result<Vec<u8>, CxlError>) -> AccessResult {
    match result {
        Ok(data) => AccessResult {
            op,
            address,
            length,
            ok: true,
            data: (op == "read").then(|| data.iter().map(|b| format!("{b:02x}")).collect()),
            error: None,
        },
        Err(e) => AccessResult {
            op,
            address,
            length,
            ok: false,
            data: None,
            error: Some(e.to_string()),
        },
    }
}

async fn run(topology: Topology, accesses: Vec<Access>, json: bool, capture: bool) -> i32 {
    let sink: Option<Arc<dyn CaptureSink>> = if capture {
        Some(Arc::new(LogCapture))
    } else {
        None
    };
    let sim = match Simulation::start(&topology, sink).await {
        Ok(sim) => sim,
        Err(e) => {
            eprintln!("Error: cannot start fabric: {}", e);
            return 1;
        }
    };
    log::info!("fabric up on {}", sim.switch.local_addr());

    let mut results = Vec::with_capacity(accesses.len());
    for access in &accesses {
        results.push(perform(&sim, access).await);
    }

    let mut devices = Vec::with_capacity(sim.devices.len());
    for d in &sim.devices {
        devices.push((d.name().to_string(), d.stats().await.ok()));
    }
    let report = Report {
        host: sim.host.stats().await.ok(),
        fabric: sim.snapshot().await,
        devices,
        accesses: results,
    };
    sim.shutdown().await;

    let failed = report.accesses.iter().filter(|a| !a.ok).count();
    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Error: cannot serialise report: {}", e),
        }
    } else {
        for a in &report.accesses {
            match (&a.data, &a.error) {
                (_, Some(e)) => println!("[!] {} {:#x}+{}: {}", a.op, a.address, a.length, e),
                (Some(d), None) => println!("[*] {} {:#x}+{}: {}", a.op, a.address, a.length, d),
                (None, None) => println!("[*] {} {:#x}+{}: ok", a.op, a.address, a.length),
            }
        }
        if let Some(host) = &report.host {
            host.print("host");
        }
        for (name, stats) in &report.devices {
            if let Some(stats) = stats {
                stats.print(name);
            }
        }
        if let Some(fabric) = &report.fabric {
            fabric.stats.print();
        }
    }
    if failed > 0 {
        1
    } else {
        0
    }
}

/// Main entry point for the CXL fabric emulator.
///
/// # Behavior
///
/// 1. **Logging**: Initialises `env_logger` from `RUST_LOG`.
/// 2. **Configuration**: Loads and validates the topology file.
/// 3. **Run**: Starts every component, performs the accesses in order.
/// 4. **Teardown**: Prints results and statistics and exits non-zero if
///    any access failed.
#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Validate { config } => {
            let topology = load(&config);
            print_topology(&topology);
            println!("[*] {} is valid", config);
        }
        Command::Run {
            config,
            read,
            write,
            json,
            capture,
        } => {
            let topology = load(&config);
            let mut accesses = Vec::new();
            for w in &write {
                match parse_write(w) {
                    Ok(a) => accesses.push(a),
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        process::exit(2);
                    }
                }
            }
            for r in &read {
                match parse_read(r) {
                    Ok(a) => accesses.push(a),
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        process::exit(2);
                    }
                }
            }
            if !json {
                print_topology(&topology);
            }
            let code = run(topology, accesses, json, capture).await;
            process::exit(code);
        }
    }
}
