//! Security identifiers and the SID table.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use crate::{LsmError, LsmResult};

/// Reserved context string for SID 0.
pub const UNLABELED: &str = "unlabeled";

/// Longest accepted context string.
pub const MAX_CONTEXT_LEN: usize = 63;

/// Small integer naming a security context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Sid(pub u32);

impl Sid {
    /// The reserved "unlabeled" SID, also returned where a raw SID is needed
    /// after an allocation failure.
    pub const UNLABELED: Sid = Sid(0);

    pub const fn is_unlabeled(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sid:{}", self.0)
    }
}

/// Parsed `<user>:<role>:<type>` context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityContext<'a> {
    pub user: &'a str,
    pub role: &'a str,
    pub type_: &'a str,
}

impl<'a> SecurityContext<'a> {
    /// Validate and split a context string.
    pub fn parse(context: &'a str) -> LsmResult<SecurityContext<'a>> {
        if context.is_empty() || context.len() > MAX_CONTEXT_LEN {
            return Err(LsmError::InvalidContext);
        }
        let mut parts = context.split(':');
        let (Some(user), Some(role), Some(type_), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(LsmError::InvalidContext);
        };
        for token in [user, role, type_] {
            if token.is_empty() || !token.bytes().all(is_token_byte) {
                return Err(LsmError::InvalidContext);
            }
        }
        Ok(SecurityContext { user, role, type_ })
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-')
}

/// Insertion-only SID ↔ context table with bounded capacity.
///
/// SID 0 is permanently bound to [`UNLABELED`] and does not count against
/// the capacity.  Allocated SIDs are dense, starting at 1.
pub struct SidTable {
    contexts: Vec<String>,
    by_context: BTreeMap<String, Sid>,
    capacity: usize,
}

impl SidTable {
    /// Table holding up to `capacity` labeled SIDs.
    pub fn new(capacity: usize) -> Self {
        SidTable {
            contexts: Vec::new(),
            by_context: BTreeMap::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of labeled SIDs allocated.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Existing SID for `context`, or a newly allocated one.
    ///
    /// Fails with [`LsmError::InvalidContext`] on malformed input and
    /// [`LsmError::TableFull`] at capacity; existing entries are never
    /// overwritten.
    pub fn string_to_sid(&mut self, context: &str) -> LsmResult<Sid> {
        if context == UNLABELED {
            return Ok(Sid::UNLABELED);
        }
        if let Some(sid) = self.by_context.get(context) {
            return Ok(*sid);
        }
        SecurityContext::parse(context)?;
        if self.contexts.len() >= self.capacity {
            return Err(LsmError::TableFull);
        }
        let sid = Sid(self.contexts.len() as u32 + 1);
        self.contexts.push(context.to_string());
        self.by_context.insert(context.to_string(), sid);
        Ok(sid)
    }

    /// Lookup without allocating.
    pub fn lookup(&self, context: &str) -> Option<Sid> {
        if context == UNLABELED {
            return Some(Sid::UNLABELED);
        }
        self.by_context.get(context).copied()
    }

    pub fn sid_to_string(&self, sid: Sid) -> Option<&str> {
        if sid.is_unlabeled() {
            return Some(UNLABELED);
        }
        self.contexts.get(sid.0 as usize - 1).map(String::as_str)
    }

    /// Every allocated SID, ascending.
    pub fn sids(&self) -> impl Iterator<Item = Sid> + '_ {
        (1..=self.contexts.len() as u32).map(Sid)
    }
}
