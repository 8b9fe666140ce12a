//! Credit-Based Flow Control.
//!
//! Each request class on a link has a pool of credits bounding how many
//! requests of that class may be outstanding. A send debits one credit and
//! the completion of the same transaction returns it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::common::{EngineError, ProtocolKind};

/// Request classes that consume credits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    /// CXL.io requests (MemRd, MemWr, CfgRd, CfgWr).
    IoReq,
    /// CXL.mem master-to-subordinate requests without data.
    M2sReq,
    /// CXL.mem master-to-subordinate requests with data.
    M2sRwd,
    /// CXL.mem back-invalidate snoops issued by a device.
    S2mBiSnp,
    /// CXL.cache device-to-host requests.
    D2hReq,
    /// CXL.cache host-to-device snoops.
    H2dReq,
}

impl MessageClass {
    /// All classes in declaration order.
    pub const ALL: [MessageClass; 6] = [
        MessageClass::IoReq,
        MessageClass::M2sReq,
        MessageClass::M2sRwd,
        MessageClass::S2mBiSnp,
        MessageClass::D2hReq,
        MessageClass::H2dReq,
    ];

    /// Returns the protocol this class belongs to.
    pub fn protocol(self) -> ProtocolKind {
        match self {
            MessageClass::IoReq => ProtocolKind::Io,
            MessageClass::M2sReq | MessageClass::M2sRwd | MessageClass::S2mBiSnp => {
                ProtocolKind::Mem
            }
            MessageClass::D2hReq | MessageClass::H2dReq => ProtocolKind::Cache,
        }
    }
}

/// Counter of available credits for one message class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreditPool {
    class: MessageClass,
    limit: u32,
    available: u32,
}

impl CreditPool {
    /// Creates a full pool.
    pub fn new(class: MessageClass, limit: u32) -> Self {
        Self {
            class,
            limit,
            available: limit,
        }
    }

    /// Returns the credits currently available.
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Returns the pool size.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Fails with `NoCredit` if a debit would drive the pool negative.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.available == 0 {
            return Err(EngineError::NoCredit { class: self.class });
        }
        Ok(())
    }

    /// Takes one credit.
    pub fn try_debit(&mut self) -> Result<(), EngineError> {
        self.check()?;
        self.available -= 1;
        Ok(())
    }

    /// Returns one credit.
    pub fn refund(&mut self) -> Result<(), EngineError> {
        if self.available == self.limit {
            return Err(EngineError::CreditOverflow {
                class: self.class,
                limit: self.limit,
            });
        }
        self.available += 1;
        Ok(())
    }
}

/// Credit limits per message class, as configured for a link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditLimits {
    #[serde(default = "default_credits")]
    pub io_req: u32,
    #[serde(default = "default_credits")]
    pub m2s_req: u32,
    #[serde(default = "default_credits")]
    pub m2s_rwd: u32,
    #[serde(default = "default_credits")]
    pub s2m_bisnp: u32,
    #[serde(default = "default_credits")]
    pub d2h_req: u32,
    #[serde(default = "default_credits")]
    pub h2d_req: u32,
}

fn default_credits() -> u32 {
    32
}

impl Default for CreditLimits {
    fn default() -> Self {
        Self::uniform(default_credits())
    }
}

impl CreditLimits {
    /// Uses the same limit for every class.
    pub fn uniform(limit: u32) -> Self {
        Self {
            io_req: limit,
            m2s_req: limit,
            m2s_rwd: limit,
            s2m_bisnp: limit,
            d2h_req: limit,
            h2d_req: limit,
        }
    }

    /// Returns the limit for `class`.
    pub fn get(&self, class: MessageClass) -> u32 {
        match class {
            MessageClass::IoReq => self.io_req,
            MessageClass::M2sReq => self.m2s_req,
            MessageClass::M2sRwd => self.m2s_rwd,
            MessageClass::S2mBiSnp => self.s2m_bisnp,
            MessageClass::D2hReq => self.d2h_req,
            MessageClass::H2dReq => self.h2d_req,
        }
    }

    /// Overrides the limit for `class`.
    pub fn set(&mut self, class: MessageClass, limit: u32) {
        match class {
            MessageClass::IoReq => self.io_req = limit,
            MessageClass::M2sReq => self.m2s_req = limit,
            MessageClass::M2sRwd => self.m2s_rwd = limit,
            MessageClass::S2mBiSnp => self.s2m_bisnp = limit,
            MessageClass::D2hReq => self.d2h_req = limit,
            MessageClass::H2dReq => self.h2d_req = limit,
        }
    }
}

/// Copy of one pool's state for reporting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CreditSnapshot {
    pub class: MessageClass,
    pub available: u32,
    pub limit: u32,
}

/// The credit pools owned by one transaction engine.
#[derive(Clone, Debug, Default)]
pub struct CreditSet {
    pools: BTreeMap<MessageClass, CreditPool>,
}

impl CreditSet {
    /// Creates pools for every class of `protocol`.
    pub fn for_protocol(protocol: ProtocolKind, limits: &CreditLimits) -> Self {
        let pools = MessageClass::ALL
            .iter()
            .filter(|c| c.protocol() == protocol)
            .map(|&c| (c, CreditPool::new(c, limits.get(c))))
            .collect();
        Self { pools }
    }

    /// Returns the pool for `class`, if this set has one.
    pub fn pool(&self, class: MessageClass) -> Option<&CreditPool> {
        self.pools.get(&class)
    }

    pub fn pool_mut(&mut self, class: MessageClass) -> Option<&mut CreditPool> {
        self.pools.get_mut(&class)
    }

    /// Returns copies of every pool.
    pub fn snapshot(&self) -> Vec<CreditSnapshot> {
        self.pools
            .values()
            .map(|p| CreditSnapshot {
                class: p.class,
                available: p.available,
                limit: p.limit,
            })
            .collect()
    }
}
