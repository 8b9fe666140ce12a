//! Transaction Engine.
//!
//! One engine per protocol per port tracks the requests that port has
//! originated. Each transaction moves through
//!
//! ```text
//! Idle -> Sent -> { Completed, TimedOut, Aborted }
//! ```
//!
//! `send` allocates the smallest free tag and debits one credit of the
//! request's class; the matching response (or response and data pair)
//! completes the transaction and returns the credit. Deadlines are checked
//! by `tick`, which reports expired transactions as failures instead of
//! retrying them. Link loss aborts everything outstanding.

pub mod classify;
pub mod credit;
pub mod tags;

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::codec::Packet;
use crate::common::{EngineError, ProtocolKind, Tag};
use classify::{Part, Parts};

pub use credit::{CreditLimits, CreditPool, CreditSet, CreditSnapshot, MessageClass};
pub use tags::TagAllocator;

/// Default transaction deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Which end of the link an engine sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    /// Root port side: originates M2S, CXL.io and H2D requests.
    Host,
    /// Device side: originates D2H requests and back-invalidate snoops.
    Device,
}

/// Lifecycle state of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TxnState {
    Idle,
    Sent,
    Completed,
    TimedOut,
    Aborted,
}

impl TxnState {
    /// Returns `true` for states a transaction never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Completed | TxnState::TimedOut | TxnState::Aborted)
    }
}

/// An outstanding request.
#[derive(Clone, Debug)]
pub struct Transaction {
    pub tag: Tag,
    pub request: Packet,
    pub class: MessageClass,
    pub deadline: Instant,
    pub state: TxnState,
    need: Parts,
    response: Option<Packet>,
    data: Option<Packet>,
}

impl Transaction {
    fn has(&self, part: Part) -> bool {
        match part {
            Part::Rsp => self.response.is_some(),
            Part::Data => self.data.is_some(),
        }
    }

    fn is_satisfied(&self) -> bool {
        (!self.need.rsp || self.response.is_some()) && (!self.need.data || self.data.is_some())
    }
}

/// A matched request and its response parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedTransaction {
    pub tag: Tag,
    pub request: Packet,
    pub response: Option<Packet>,
    pub data: Option<Packet>,
}

/// A transaction that ended without a response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnFailure {
    pub tag: Tag,
    pub request: Packet,
    pub state: TxnState,
}

/// Lifetime counters of one engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    pub sent: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub aborted: u64,
    pub cancelled: u64,
}

/// Copy of an engine's state for reporting.
#[derive(Clone, Debug, Serialize)]
pub struct EngineSnapshot {
    pub protocol: ProtocolKind,
    pub role: Role,
    pub outstanding: Vec<u16>,
    pub credits: Vec<CreditSnapshot>,
    pub counters: EngineCounters,
}

/// Request/response correlation for one protocol on one link.
#[derive(Debug)]
pub struct TransactionEngine {
    kind: ProtocolKind,
    role: Role,
    timeout: Duration,
    tags: TagAllocator,
    credits: CreditSet,
    pending: BTreeMap<Tag, Transaction>,
    resolved: BTreeMap<Tag, TxnState>,
    counters: EngineCounters,
}

impl TransactionEngine {
    /// Creates an engine.
    ///
    /// # Arguments
    ///
    /// * `kind` - Protocol handled by this engine
    /// * `role` - Host or device side of the link
    /// * `limits` - Credit pool sizes per message class
    /// * `timeout` - Deadline applied to every request
    pub fn new(kind: ProtocolKind, role: Role, limits: &CreditLimits, timeout: Duration) -> Self {
        Self {
            kind,
            role,
            timeout,
            tags: TagAllocator::with_bits(classify::tag_bits(kind, role)),
            credits: CreditSet::for_protocol(kind, limits),
            pending: BTreeMap::new(),
            resolved: BTreeMap::new(),
            counters: EngineCounters::default(),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the credit pool for `class`, if this engine owns one.
    pub fn credits(&self, class: MessageClass) -> Option<&CreditPool> {
        self.credits.pool(class)
    }

    /// Returns the number of outstanding transactions.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Returns the outstanding transaction for `tag`.
    pub fn transaction(&self, tag: Tag) -> Option<&Transaction> {
        self.pending.get(&tag)
    }

    /// Returns the state of `tag`: `Sent` while outstanding, the terminal
    /// state once resolved, `Idle` if never used.
    pub fn state(&self, tag: Tag) -> TxnState {
        if let Some(txn) = self.pending.get(&tag) {
            return txn.state;
        }
        self.resolved.get(&tag).copied().unwrap_or(TxnState::Idle)
    }

    /// Sends a request with a deadline measured from now.
    pub fn send(&mut self, request: Packet) -> Result<Tag, EngineError> {
        self.send_at(request, Instant::now()).map(|(tag, _)| tag)
    }

    /// Sends a request at time `now`.
    ///
    /// The engine is unchanged on error: credit, tag space and protocol are
    /// all checked before anything is debited.
    ///
    /// # Returns
    ///
    /// The allocated tag and the request with that tag written into it.
    pub fn send_at(&mut self, mut request: Packet, now: Instant) -> Result<(Tag, Packet), EngineError> {
        if request.kind() != self.kind {
            return Err(EngineError::WrongProtocol {
                expected: self.kind,
                actual: request.kind(),
            });
        }
        let info = classify::classify_request(&request, self.role)?;
        let pool = self
            .credits
            .pool_mut(info.class)
            .ok_or_else(|| EngineError::NotARequest(request.describe()))?;
        pool.check()?;
        if !self.tags.has_free() {
            return Err(EngineError::TagsExhausted {
                limit: 1 << classify::tag_bits(self.kind, self.role),
            });
        }
        pool.try_debit()?;
        let tag = self.tags.allocate()?;
        classify::stamp_tag(&mut request, tag);
        self.resolved.remove(&tag);
        self.pending.insert(
            tag,
            Transaction {
                tag,
                request: request.clone(),
                class: info.class,
                deadline: now + self.timeout,
                state: TxnState::Sent,
                need: info.need,
                response: None,
                data: None,
            },
        );
        self.counters.sent += 1;
        log::debug!(
            "[txn {}] sent tag {} ({:?}, {} outstanding)",
            self.kind,
            tag,
            info.class,
            self.pending.len()
        );
        Ok((tag, request))
    }

    /// Accepts a response or data part.
    ///
    /// # Returns
    ///
    /// `Some` with the matched pair once every required part has arrived,
    /// `None` while a multi-part completion is still partial. Fails with
    /// `UnknownTag` if no transaction with the response's tag is outstanding.
    pub fn on_receive(&mut self, response: Packet) -> Result<Option<CompletedTransaction>, EngineError> {
        if response.kind() != self.kind {
            return Err(EngineError::WrongProtocol {
                expected: self.kind,
                actual: response.kind(),
            });
        }
        let (tag, part) = classify::classify_response(&response, self.role)?;
        let txn = self
            .pending
            .get_mut(&tag)
            .ok_or(EngineError::UnknownTag { tag })?;
        if txn.has(part) {
            return Err(EngineError::DuplicateResponse {
                tag,
                part: part.name(),
            });
        }
        if part == Part::Rsp {
            classify::refine_need(&mut txn.need, &response);
        }
        if !txn.need.requires(part) {
            return Err(EngineError::NotAResponse(format!(
                "{} does not answer tag {}",
                response.describe(),
                tag
            )));
        }
        match part {
            Part::Rsp => txn.response = Some(response),
            Part::Data => txn.data = Some(response),
        }
        if !txn.is_satisfied() {
            return Ok(None);
        }

        let txn = self.finish(tag, TxnState::Completed)?;
        self.counters.completed += 1;
        log::debug!("[txn {}] completed tag {}", self.kind, tag);
        Ok(Some(CompletedTransaction {
            tag,
            request: txn.request,
            response: txn.response,
            data: txn.data,
        }))
    }

    /// Expires transactions whose deadline is at or before `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<TxnFailure> {
        let expired: Vec<Tag> = self
            .pending
            .values()
            .filter(|t| t.deadline <= now)
            .map(|t| t.tag)
            .collect();
        let mut failures = Vec::with_capacity(expired.len());
        for tag in expired {
            if let Ok(txn) = self.finish(tag, TxnState::TimedOut) {
                log::warn!("[txn {}] tag {} timed out", self.kind, tag);
                self.counters.timed_out += 1;
                failures.push(TxnFailure {
                    tag,
                    request: txn.request,
                    state: TxnState::TimedOut,
                });
            }
        }
        failures
    }

    /// Aborts every outstanding transaction, returning their credits.
    pub fn abort_all(&mut self) -> Vec<TxnFailure> {
        let tags: Vec<Tag> = self.pending.keys().copied().collect();
        let mut failures = Vec::with_capacity(tags.len());
        for tag in tags {
            if let Ok(txn) = self.finish(tag, TxnState::Aborted) {
                self.counters.aborted += 1;
                failures.push(TxnFailure {
                    tag,
                    request: txn.request,
                    state: TxnState::Aborted,
                });
            }
        }
        if !failures.is_empty() {
            log::warn!("[txn {}] aborted {} transactions", self.kind, failures.len());
        }
        failures
    }

    /// Cancels an outstanding transaction on behalf of its owner.
    ///
    /// Fails with `AlreadyCompleted` if the transaction has already reached
    /// a terminal state.
    pub fn cancel(&mut self, tag: Tag) -> Result<Packet, EngineError> {
        if !self.pending.contains_key(&tag) {
            return Err(match self.resolved.get(&tag) {
                Some(&state) => EngineError::AlreadyCompleted { tag, state },
                None => EngineError::UnknownTag { tag },
            });
        }
        let txn = self.finish(tag, TxnState::Aborted)?;
        self.counters.cancelled += 1;
        log::debug!("[txn {}] cancelled tag {}", self.kind, tag);
        Ok(txn.request)
    }

    /// Removes a transaction, returns its credit and frees its tag.
    fn finish(&mut self, tag: Tag, state: TxnState) -> Result<Transaction, EngineError> {
        let mut txn = self.pending.remove(&tag).ok_or(EngineError::UnknownTag { tag })?;
        txn.state = state;
        if let Some(pool) = self.credits.pool_mut(txn.class) {
            pool.refund()?;
        }
        self.tags.release(tag);
        self.resolved.insert(tag, state);
        Ok(txn)
    }

    /// Returns a copy of the engine's state.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            protocol: self.kind,
            role: self.role,
            outstanding: self.pending.keys().map(|t| t.val()).collect(),
            credits: self.credits.snapshot(),
            counters: self.counters,
        }
    }
}
