//! Device Line Cache.
//!
//! A small MESI cache of host memory lines held by a Type-1/Type-2
//! accelerator. Lines are installed when the host grants them (GO with a
//! cache state plus data) and downgraded when the host snoops them.
//!
//! Snoop handling:
//!
//! | Snoop   | Modified           | Exclusive / Shared | Invalid  |
//! |---------|--------------------|--------------------|----------|
//! | SnpData | RspSFwdM + data, S | RspSHitSE, S       | RspIHitI |
//! | SnpInv  | RspIFwdM + data, I | RspIHitSE, I       | RspIHitI |
//! | SnpCur  | RspVFwdV + data, M | RspVHitV, unchanged| RspIHitI |

use std::collections::BTreeMap;

use crate::codec::cache::{CacheState, D2hRspOp, H2dReqOp};
use crate::common::constants::{CACHE_LINE_SHIFT, CACHE_LINE_SIZE};
use crate::common::DeviceError;

/// MESI line state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineState {
    Modified,
    Exclusive,
    Shared,
    Invalid,
}

impl LineState {
    /// Maps the state granted by a GO response.
    pub fn from_granted(state: CacheState) -> Self {
        match state {
            CacheState::Modified => LineState::Modified,
            CacheState::Exclusive => LineState::Exclusive,
            CacheState::Shared => LineState::Shared,
            CacheState::Invalid | CacheState::Error => LineState::Invalid,
        }
    }

    /// Returns `true` if the device may write the line without asking.
    pub fn is_writable(self) -> bool {
        matches!(self, LineState::Modified | LineState::Exclusive)
    }
}

#[derive(Clone, Debug)]
struct Line {
    state: LineState,
    data: Vec<u8>,
}

/// Outcome of a snoop lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnoopResult {
    pub response: D2hRspOp,
    /// Dirty line to forward to the host, if any.
    pub forward: Option<Vec<u8>>,
}

/// Host memory lines cached by the device, keyed by line address.
#[derive(Clone, Debug)]
pub struct DeviceCache {
    capacity_lines: usize,
    lines: BTreeMap<u64, Line>,
}

impl DeviceCache {
    /// Creates a cache holding at most `capacity_lines` lines.
    pub fn new(capacity_lines: usize) -> Self {
        Self {
            capacity_lines: capacity_lines.max(1),
            lines: BTreeMap::new(),
        }
    }

    fn line_addr(address: u64) -> u64 {
        address >> CACHE_LINE_SHIFT << CACHE_LINE_SHIFT
    }

    /// Returns the state of the line containing `address`.
    pub fn state(&self, address: u64) -> LineState {
        self.lines
            .get(&Self::line_addr(address))
            .map(|l| l.state)
            .unwrap_or(LineState::Invalid)
    }

    /// Returns the cached data of the line containing `address`.
    pub fn data(&self, address: u64) -> Option<&[u8]> {
        self.lines
            .get(&Self::line_addr(address))
            .filter(|l| l.state != LineState::Invalid)
            .map(|l| l.data.as_slice())
    }

    /// Installs a line granted by the host.
    ///
    /// # Returns
    ///
    /// A dirty victim `(address, data)` that must be written back, if
    /// installing the line evicted one.
    pub fn install(&mut self, address: u64, state: LineState, data: Vec<u8>) -> Option<(u64, Vec<u8>)> {
        let addr = Self::line_addr(address);
        if state == LineState::Invalid {
            self.lines.remove(&addr);
            return None;
        }
        let mut victim = None;
        if !self.lines.contains_key(&addr) && self.lines.len() >= self.capacity_lines {
            if let Some((evict_addr, line)) = self.lines.pop_first() {
                if line.state == LineState::Modified {
                    victim = Some((evict_addr, line.data));
                }
            }
        }
        self.lines.insert(addr, Line { state, data });
        victim
    }

    /// Writes into a line the device owns, moving it to Modified.
    pub fn write(&mut self, address: u64, offset: usize, bytes: &[u8]) -> Result<(), DeviceError> {
        let addr = Self::line_addr(address);
        let line = self
            .lines
            .get_mut(&addr)
            .filter(|l| l.state.is_writable())
            .ok_or_else(|| {
                DeviceError::Unsupported(format!("line {addr:#x} is not owned by the device"))
            })?;
        if offset + bytes.len() > CACHE_LINE_SIZE {
            return Err(DeviceError::OutOfRange {
                address: addr + offset as u64,
                length: bytes.len(),
                capacity: CACHE_LINE_SIZE as u64,
            });
        }
        line.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        line.state = LineState::Modified;
        Ok(())
    }

    /// Drops the line containing `address`, returning its data if dirty.
    pub fn evict(&mut self, address: u64) -> Option<Vec<u8>> {
        self.lines
            .remove(&Self::line_addr(address))
            .filter(|l| l.state == LineState::Modified)
            .map(|l| l.data)
    }

    /// Applies a host snoop to the line containing `address`.
    pub fn snoop(&mut self, op: H2dReqOp, address: u64) -> SnoopResult {
        let addr = Self::line_addr(address);
        let state = self.state(addr);
        let miss = SnoopResult {
            response: D2hRspOp::RspIHitI,
            forward: None,
        };
        let Some(line) = self.lines.get_mut(&addr) else {
            return miss;
        };

        match (op, state) {
            (_, LineState::Invalid) => miss,
            (H2dReqOp::SnpData, LineState::Modified) => {
                line.state = LineState::Shared;
                SnoopResult {
                    response: D2hRspOp::RspSFwdM,
                    forward: Some(line.data.clone()),
                }
            }
            (H2dReqOp::SnpData, _) => {
                line.state = LineState::Shared;
                SnoopResult {
                    response: D2hRspOp::RspSHitSE,
                    forward: None,
                }
            }
            (H2dReqOp::SnpInv, LineState::Modified) => {
                let data = self.lines.remove(&addr).map(|l| l.data);
                SnoopResult {
                    response: D2hRspOp::RspIFwdM,
                    forward: data,
                }
            }
            (H2dReqOp::SnpInv, _) => {
                self.lines.remove(&addr);
                SnoopResult {
                    response: D2hRspOp::RspIHitSE,
                    forward: None,
                }
            }
            (H2dReqOp::SnpCur, LineState::Modified) => SnoopResult {
                response: D2hRspOp::RspVFwdV,
                forward: Some(line.data.clone()),
            },
            (H2dReqOp::SnpCur, _) => SnoopResult {
                response: D2hRspOp::RspVHitV,
                forward: None,
            },
        }
    }

    /// Returns the number of valid lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
