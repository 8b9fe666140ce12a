//! Flit Capture.
//!
//! Links can hand a copy of every flit they send or receive to a capture
//! sink. Capture is an observer: a sink can never delay, drop or alter the
//! traffic it sees, and a sink whose consumer has gone away is ignored.

use bytes::Bytes;
use std::time::SystemTime;
use tokio::sync::mpsc;

use crate::common::LinkId;

/// Which way a captured flit travelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// One captured flit.
#[derive(Clone, Debug)]
pub struct FlitRecord {
    pub timestamp: SystemTime,
    pub link: LinkId,
    pub direction: Direction,
    /// Encoded flit, without the frame length prefix.
    pub bytes: Bytes,
}

/// Receiver of captured flits.
pub trait CaptureSink: Send + Sync {
    fn record(&self, record: FlitRecord);
}

/// Forwards records over an unbounded channel.
#[derive(Clone, Debug)]
pub struct ChannelCapture {
    tx: mpsc::UnboundedSender<FlitRecord>,
}

impl ChannelCapture {
    /// Creates a sink and the receiver its records arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FlitRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CaptureSink for ChannelCapture {
    fn record(&self, record: FlitRecord) {
        let _ = self.tx.send(record);
    }
}

/// Logs a hex dump of every flit at trace level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogCapture;

impl CaptureSink for LogCapture {
    fn record(&self, record: FlitRecord) {
        if log::log_enabled!(log::Level::Trace) {
            let hex: String = record.bytes.iter().map(|b| format!("{b:02x}")).collect();
            log::trace!("[capture {}] {:?} {}", record.link, record.direction, hex);
        }
    }
}
