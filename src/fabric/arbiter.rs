//! Round-Robin Output Arbitration.
//!
//! An output link may have packets waiting from several source ports. Each
//! source keeps its own FIFO so per-source order is strict, and sources are
//! served in rotating order so one busy link cannot starve the others.

use std::collections::{BTreeMap, VecDeque};

use crate::common::PortId;

/// Per-source FIFOs drained in round-robin order.
#[derive(Clone, Debug)]
pub struct RoundRobinArbiter<T> {
    queues: BTreeMap<PortId, VecDeque<T>>,
    last: Option<PortId>,
    len: usize,
}

impl<T> Default for RoundRobinArbiter<T> {
    fn default() -> Self {
        Self {
            queues: BTreeMap::new(),
            last: None,
            len: 0,
        }
    }
}

impl<T> RoundRobinArbiter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `item` behind earlier items from the same source.
    pub fn push(&mut self, source: PortId, item: T) {
        self.queues.entry(source).or_default().push_back(item);
        self.len += 1;
    }

    /// Takes the next item, moving to the next non-empty source after the
    /// one served last.
    pub fn pop(&mut self) -> Option<(PortId, T)> {
        if self.len == 0 {
            return None;
        }
        let after = self
            .last
            .and_then(|last| {
                self.queues
                    .range(last..)
                    .filter(|&(&id, q)| id != last && !q.is_empty())
                    .map(|(&id, _)| id)
                    .next()
            })
            .or_else(|| {
                self.queues
                    .iter()
                    .find(|(_, q)| !q.is_empty())
                    .map(|(&id, _)| id)
            })?;
        let item = self.queues.get_mut(&after)?.pop_front()?;
        self.len -= 1;
        self.last = Some(after);
        Some((after, item))
    }

    /// Returns the number of queued items across all sources.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drops every queued item.
    pub fn clear(&mut self) -> usize {
        let dropped = self.len;
        self.queues.clear();
        self.len = 0;
        self.last = None;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_alternate_and_keep_order() {
        let mut arb = RoundRobinArbiter::new();
        arb.push(PortId(1), "a1");
        arb.push(PortId(1), "a2");
        arb.push(PortId(1), "a3");
        arb.push(PortId(2), "b1");
        arb.push(PortId(3), "c1");

        let order: Vec<&str> = std::iter::from_fn(|| arb.pop().map(|(_, v)| v)).collect();
        assert_eq!(order, vec!["a1", "b1", "c1", "a2", "a3"]);
        assert!(arb.is_empty());
    }
}
