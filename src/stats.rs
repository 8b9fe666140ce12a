//! Fabric statistics collection and reporting.
//!
//! Tracks traffic and transaction outcomes for the switch and for each
//! endpoint node. Counters are plain values: callers read them through
//! copies (`Clone` / `Serialize`), never through live references into a
//! running event loop.

use serde::Serialize;
use std::time::Instant;

use crate::common::ProtocolKind;

/// Switch-level traffic counters.
#[derive(Clone, Debug, Serialize)]
pub struct FabricStats {
    #[serde(skip)]
    start_time: Option<Instant>,
    pub flits_rx: u64,
    pub flits_tx: u64,

    pub packets_forwarded: u64,
    pub forwarded_io: u64,
    pub forwarded_mem: u64,
    pub forwarded_cache: u64,

    pub dropped_unroutable: u64,
    pub dropped_link_down: u64,
    pub dropped_protocol: u64,
    pub error_completions: u64,

    pub format_errors: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
}

impl Default for FabricStats {
    fn default() -> Self {
        Self {
            start_time: Some(Instant::now()),
            flits_rx: 0,
            flits_tx: 0,
            packets_forwarded: 0,
            forwarded_io: 0,
            forwarded_mem: 0,
            forwarded_cache: 0,
            dropped_unroutable: 0,
            dropped_link_down: 0,
            dropped_protocol: 0,
            error_completions: 0,
            format_errors: 0,
            connections_accepted: 0,
            connections_rejected: 0,
        }
    }
}

impl FabricStats {
    /// Counts one forwarded packet of protocol `kind`.
    pub fn record_forward(&mut self, kind: ProtocolKind) {
        self.packets_forwarded += 1;
        match kind {
            ProtocolKind::Io => self.forwarded_io += 1,
            ProtocolKind::Mem => self.forwarded_mem += 1,
            ProtocolKind::Cache => self.forwarded_cache += 1,
        }
    }

    /// Returns the total number of dropped packets.
    pub fn dropped(&self) -> u64 {
        self.dropped_unroutable + self.dropped_link_down + self.dropped_protocol
    }

    /// Prints a formatted summary of switch statistics.
    pub fn print(&self) {
        let seconds = self
            .start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let total = self.packets_forwarded.max(1) as f64;

        println!("\n==========================================================");
        println!("CXL FABRIC STATISTICS");
        println!("==========================================================");
        println!("host_seconds             {:.4} s", seconds);
        println!("flits.rx                 {}", self.flits_rx);
        println!("flits.tx                 {}", self.flits_tx);
        println!("links.accepted           {}", self.connections_accepted);
        println!("links.rejected           {}", self.connections_rejected);
        println!("----------------------------------------------------------");
        println!("FORWARDING");
        println!("  packets                {}", self.packets_forwarded);
        for (name, count) in [
            ("cxl.io", self.forwarded_io),
            ("cxl.mem", self.forwarded_mem),
            ("cxl.cache", self.forwarded_cache),
        ] {
            println!(
                "  {:<22} {} ({:.2}%)",
                name,
                count,
                (count as f64 / total) * 100.0
            );
        }
        println!("----------------------------------------------------------");
        println!("DROPS");
        println!("  drop.unroutable        {}", self.dropped_unroutable);
        println!("  drop.link_down         {}", self.dropped_link_down);
        println!("  drop.protocol          {}", self.dropped_protocol);
        println!("  drop.answered          {}", self.error_completions);
        println!("  format_errors          {}", self.format_errors);
        println!("==========================================================");
    }
}

/// Endpoint (host or device) counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct NodeStats {
    pub flits_rx: u64,
    pub flits_tx: u64,
    pub requests_sent: u64,
    pub requests_served: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub aborted: u64,
    pub poisoned: u64,
    pub protocol_errors: u64,
    pub reconnects: u64,
}

impl NodeStats {
    /// Prints a formatted summary for the node called `name`.
    pub fn print(&self, name: &str) {
        println!("----------------------------------------------------------");
        println!("NODE {}", name);
        println!("  flits.rx               {}", self.flits_rx);
        println!("  flits.tx               {}", self.flits_tx);
        println!("  req.sent               {}", self.requests_sent);
        println!("  req.served             {}", self.requests_served);
        println!("  txn.completed          {}", self.completed);
        println!("  txn.timed_out          {}", self.timed_out);
        println!("  txn.aborted            {}", self.aborted);
        println!("  data.poisoned          {}", self.poisoned);
        println!("  protocol_errors        {}", self.protocol_errors);
        println!("  link.reconnects        {}", self.reconnects);
    }
}
