//! Mandatory access control.
//!
//! Subjects and objects carry a [`Sid`], a small integer naming a textual
//! security context (`user:role:type`).  Access decisions consult the
//! [`Avc`], a set of allow rules keyed by `(source, target, class)`.  Anything
//! not granted by an active rule is denied.
//!
//! [`Mac`] bundles the SID table and the AVC behind reader-writer locks:
//! lookups and decisions are shared-read, label allocation and policy loads
//! are kernel-write.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use spin::RwLock;

pub mod avc;
pub mod policy;
pub mod sid;

pub use avc::{Avc, AvcStatsSnapshot};
pub use policy::{AccessVector, Decision, MacRule, ObjectClass};
pub use sid::{SecurityContext, Sid, SidTable, UNLABELED};

// ============================================================================
// LSM Result and Error Types
// ============================================================================

pub type LsmResult<T = ()> = core::result::Result<T, LsmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsmError {
    /// Context string is not `<user>:<role>:<type>`.
    InvalidContext,
    /// SID table capacity exhausted.
    TableFull,
    /// SID has no mapping.
    UnknownSid,
    /// Access denied by policy.
    Denied,
}

impl fmt::Display for LsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LsmError::InvalidContext => write!(f, "lsm: malformed security context"),
            LsmError::TableFull => write!(f, "lsm: SID table full"),
            LsmError::UnknownSid => write!(f, "lsm: unknown SID"),
            LsmError::Denied => write!(f, "lsm: operation denied by policy"),
        }
    }
}

/// Enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MacMode {
    /// Denials are returned to the caller.
    #[default]
    Enforcing,
    /// Denials are logged and counted, then allowed.
    Permissive,
}

// ============================================================================
// Shared MAC state
// ============================================================================

/// SID table plus AVC.
pub struct Mac {
    sids: RwLock<SidTable>,
    avc: RwLock<Avc>,
    mode: RwLock<MacMode>,
}

impl Mac {
    pub fn new(sid_capacity: usize, mode: MacMode) -> Self {
        Mac {
            sids: RwLock::new(SidTable::new(sid_capacity)),
            avc: RwLock::new(Avc::new()),
            mode: RwLock::new(mode),
        }
    }

    pub fn mode(&self) -> MacMode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: MacMode) {
        *self.mode.write() = mode;
    }

    pub fn string_to_sid(&self, context: &str) -> LsmResult<Sid> {
        // Fast path for labels that already exist.
        if let Some(sid) = self.sids.read().lookup(context) {
            return Ok(sid);
        }
        self.sids.write().string_to_sid(context)
    }

    pub fn sid_to_string(&self, sid: Sid) -> LsmResult<String> {
        self.sids
            .read()
            .sid_to_string(sid)
            .map(String::from)
            .ok_or(LsmError::UnknownSid)
    }

    /// Every allocated SID with its context, for invariant checks.
    pub fn sid_entries(&self) -> Vec<(Sid, String)> {
        let sids = self.sids.read();
        sids.sids()
            .filter_map(|sid| sids.sid_to_string(sid).map(|ctx| (sid, String::from(ctx))))
            .collect()
    }

    pub fn sid_count(&self) -> usize {
        self.sids.read().len()
    }

    /// Additive policy load.
    pub fn load_rules(&self, rules: &[MacRule]) -> usize {
        let loaded = self.avc.write().load_rules(rules);
        klog::klog!(Info, "mac: loaded {} rules", loaded);
        loaded
    }

    pub fn revoke(&self, source: Sid, target: Sid, class: ObjectClass) -> usize {
        self.avc.write().revoke(source, target, class)
    }

    /// Raw policy decision, independent of the enforcement mode.
    pub fn compute(&self, source: Sid, target: Sid, class: ObjectClass, requested: AccessVector) -> Decision {
        self.avc.read().compute(source, target, class, requested)
    }

    /// Enforced check: `Err(Denied)` on a deny in enforcing mode.
    pub fn check(&self, source: Sid, target: Sid, class: ObjectClass, requested: AccessVector) -> LsmResult {
        if self.compute(source, target, class, requested).is_allowed() {
            return Ok(());
        }
        klog::klog!(
            Warn,
            "mac: denied {} -> {} {} {:?}",
            source,
            target,
            class,
            requested
        );
        match self.mode() {
            MacMode::Enforcing => Err(LsmError::Denied),
            MacMode::Permissive => Ok(()),
        }
    }

    pub fn stats(&self) -> AvcStatsSnapshot {
        self.avc.read().stats()
    }
}
