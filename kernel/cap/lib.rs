//! Capability sets for execution contexts.
//!
//! Each context carries a [`CapTriple`] of three masks over the
//! [`Capability`] enumeration:
//!
//! - **permitted**: the ceiling of what the context may ever use
//! - **effective**: what privilege checks consult right now
//! - **inheritable**: what may be carried across a privilege transition
//!
//! `effective` and `inheritable` are always subsets of `permitted`; every
//! constructor and mutator here preserves that.  The kernel context holds
//! [`CapTriple::full`].

#![cfg_attr(not(test), no_std)]

use core::fmt;

pub mod types;

pub use types::{CapSet, Capability, CAP_COUNT, CAP_LAST};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    /// `effective` or `inheritable` not within `permitted`.
    NotSubset,
    /// Raise of a capability outside `permitted`.
    NotPermitted(Capability),
    /// An unprivileged update tried to grow `permitted`.
    PermittedGrowth,
    /// ABI mask carried undefined bits.
    UnknownBits,
}

impl fmt::Display for CapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapError::NotSubset => write!(f, "effective/inheritable not within permitted"),
            CapError::NotPermitted(cap) => write!(f, "{} not in permitted set", cap),
            CapError::PermittedGrowth => write!(f, "permitted set may only shrink"),
            CapError::UnknownBits => write!(f, "undefined capability bits"),
        }
    }
}

pub type Result<T> = core::result::Result<T, CapError>;

// ============================================================================
// Capability triple
// ============================================================================

/// The three capability masks of one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapTriple {
    permitted: CapSet,
    effective: CapSet,
    inheritable: CapSet,
}

impl CapTriple {
    /// Validated constructor.
    pub fn new(permitted: CapSet, effective: CapSet, inheritable: CapSet) -> Result<Self> {
        if !permitted.contains(effective) || !permitted.contains(inheritable) {
            return Err(CapError::NotSubset);
        }
        Ok(CapTriple {
            permitted,
            effective,
            inheritable,
        })
    }

    /// Build from raw ABI masks.
    pub fn from_abi(permitted: u64, effective: u64, inheritable: u64) -> Result<Self> {
        let p = CapSet::from_abi(permitted).ok_or(CapError::UnknownBits)?;
        let e = CapSet::from_abi(effective).ok_or(CapError::UnknownBits)?;
        let i = CapSet::from_abi(inheritable).ok_or(CapError::UnknownBits)?;
        Self::new(p, e, i)
    }

    /// No capabilities at all.
    pub const fn empty() -> Self {
        CapTriple {
            permitted: CapSet::empty(),
            effective: CapSet::empty(),
            inheritable: CapSet::empty(),
        }
    }

    /// All-ones masks, held only by the kernel context.
    pub const fn full() -> Self {
        CapTriple {
            permitted: CapSet::all(),
            effective: CapSet::all(),
            inheritable: CapSet::all(),
        }
    }

    pub const fn permitted(&self) -> CapSet {
        self.permitted
    }

    pub const fn effective(&self) -> CapSet {
        self.effective
    }

    pub const fn inheritable(&self) -> CapSet {
        self.inheritable
    }

    /// Privilege check against the effective set.
    pub const fn check(&self, cap: Capability) -> bool {
        self.effective.contains_cap(cap)
    }

    /// Add `cap` to the effective set.  Fails unless `cap` is permitted.
    pub fn raise(&mut self, cap: Capability) -> Result<()> {
        if !self.permitted.contains_cap(cap) {
            return Err(CapError::NotPermitted(cap));
        }
        self.effective = self.effective.with(cap);
        Ok(())
    }

    /// Drop `cap` from the effective set.  Never fails.
    pub fn lower(&mut self, cap: Capability) {
        self.effective = self.effective.without(cap);
    }

    /// Remove `cap` from every mask.
    pub fn drop_permitted(&mut self, cap: Capability) {
        self.permitted = self.permitted.without(cap);
        self.effective = self.effective.without(cap);
        self.inheritable = self.inheritable.without(cap);
    }

    /// Triple for a freshly forked child: permitted and inheritable carry
    /// over, effective starts empty.
    pub const fn for_child(&self) -> CapTriple {
        CapTriple {
            permitted: self.permitted,
            effective: CapSet::empty(),
            inheritable: self.inheritable,
        }
    }

    /// Apply an update requested by the context itself.
    ///
    /// The permitted set may only shrink unless `SETPCAP` is effective.
    pub fn update_from_user(&mut self, requested: CapTriple) -> Result<()> {
        if !self.check(Capability::Setpcap) && !self.permitted.contains(requested.permitted) {
            return Err(CapError::PermittedGrowth);
        }
        *self = requested;
        Ok(())
    }

    /// Invariant check: `effective ⊆ permitted`, `inheritable ⊆ permitted`.
    pub fn is_consistent(&self) -> bool {
        self.permitted.contains(self.effective) && self.permitted.contains(self.inheritable)
    }
}

impl Default for CapTriple {
    fn default() -> Self {
        Self::empty()
    }
}
