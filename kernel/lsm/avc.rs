//! Access-vector cache.
//!
//! Rules are stored once and indexed by `(source, target, class)`.  A
//! decision walks only the rules under its key, which yields exactly the
//! same answer as scanning every rule: a rule with a different key can
//! never grant.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::policy::{AccessVector, Decision, MacRule, ObjectClass};
use crate::sid::Sid;

type RuleKey = (Sid, Sid, ObjectClass);

/// Decision counters.
#[derive(Debug, Default)]
pub struct AvcStats {
    lookups: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AvcStatsSnapshot {
    pub lookups: u64,
    pub allowed: u64,
    pub denied: u64,
}

impl AvcStats {
    pub fn snapshot(&self) -> AvcStatsSnapshot {
        AvcStatsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }
}

/// The rule set and its index.
#[derive(Default)]
pub struct Avc {
    rules: Vec<MacRule>,
    index: BTreeMap<RuleKey, Vec<usize>>,
    stats: AvcStats,
}

impl Avc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[MacRule] {
        &self.rules
    }

    /// Add `rules`; every loaded rule becomes active.  Returns how many
    /// were added.
    pub fn load_rules(&mut self, rules: &[MacRule]) -> usize {
        for rule in rules {
            let slot = self.rules.len();
            self.rules.push(MacRule { active: true, ..*rule });
            self.index
                .entry((rule.source, rule.target, rule.class))
                .or_default()
                .push(slot);
        }
        rules.len()
    }

    /// Deactivate every rule for the triple.  Returns how many changed.
    pub fn revoke(&mut self, source: Sid, target: Sid, class: ObjectClass) -> usize {
        let Some(slots) = self.index.get(&(source, target, class)) else {
            return 0;
        };
        let mut changed = 0;
        for &slot in slots {
            if let Some(rule) = self.rules.get_mut(slot) {
                if rule.active {
                    rule.active = false;
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Allow iff one active rule for the triple grants every requested bit.
    pub fn compute(&self, source: Sid, target: Sid, class: ObjectClass, requested: AccessVector) -> Decision {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        let granted = self.index.get(&(source, target, class)).is_some_and(|slots| {
            slots
                .iter()
                .filter_map(|&slot| self.rules.get(slot))
                .any(|rule| rule.grants(source, target, class, requested))
        });
        if granted {
            self.stats.allowed.fetch_add(1, Ordering::Relaxed);
            Decision::Allow
        } else {
            self.stats.denied.fetch_add(1, Ordering::Relaxed);
            Decision::Deny
        }
    }

    /// Reference decision: scan every rule.
    pub fn compute_linear(&self, source: Sid, target: Sid, class: ObjectClass, requested: AccessVector) -> Decision {
        if self.rules.iter().any(|rule| rule.grants(source, target, class, requested)) {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    pub fn stats(&self) -> AvcStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASSES: [ObjectClass; 3] = [ObjectClass::File, ObjectClass::Process, ObjectClass::BlkFile];

    fn sample() -> Avc {
        let mut avc = Avc::new();
        avc.load_rules(&[
            MacRule::allow(Sid(1), Sid(2), ObjectClass::File, AccessVector::READ | AccessVector::WRITE),
            MacRule::allow(Sid(1), Sid(2), ObjectClass::File, AccessVector::EXEC),
            MacRule::allow(Sid(2), Sid(3), ObjectClass::Process, AccessVector::SIGNAL),
            MacRule { active: false, ..MacRule::allow(Sid(3), Sid(1), ObjectClass::BlkFile, AccessVector::all()) },
        ]);
        avc
    }

    #[test]
    fn test_single_rule_must_cover_request() {
        let avc = sample();
        assert_eq!(avc.compute(Sid(1), Sid(2), ObjectClass::File, AccessVector::READ), Decision::Allow);
        assert_eq!(avc.compute(Sid(1), Sid(2), ObjectClass::File, AccessVector::EXEC), Decision::Allow);
        // READ|EXEC is split across two rules: no single rule grants both.
        assert_eq!(
            avc.compute(Sid(1), Sid(2), ObjectClass::File, AccessVector::READ | AccessVector::EXEC),
            Decision::Deny
        );
        assert_eq!(avc.compute(Sid(2), Sid(1), ObjectClass::File, AccessVector::READ), Decision::Deny);
    }

    #[test]
    fn test_loading_activates_rules() {
        let avc = sample();
        assert!(avc.rules().iter().all(|r| r.active));
        assert_eq!(avc.compute(Sid(3), Sid(1), ObjectClass::BlkFile, AccessVector::READ), Decision::Allow);
    }

    #[test]
    fn test_indexed_matches_linear_scan() {
        let mut avc = sample();
        avc.revoke(Sid(2), Sid(3), ObjectClass::Process);
        for src in 0..4 {
            for tgt in 0..4 {
                for class in CLASSES {
                    for bits in 0..(1u32 << 10) {
                        let req = AccessVector::from_bits_truncate(bits);
                        assert_eq!(
                            avc.compute(Sid(src), Sid(tgt), class, req),
                            avc.compute_linear(Sid(src), Sid(tgt), class, req)
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_default_deny_on_empty_policy() {
        let avc = Avc::new();
        assert_eq!(avc.compute(Sid(0), Sid(0), ObjectClass::File, AccessVector::empty()), Decision::Deny);
        assert_eq!(avc.stats().denied, 1);
    }

    #[test]
    fn test_revoke() {
        let mut avc = sample();
        assert_eq!(avc.revoke(Sid(1), Sid(2), ObjectClass::File), 2);
        assert_eq!(avc.revoke(Sid(1), Sid(2), ObjectClass::File), 0);
        assert_eq!(avc.compute(Sid(1), Sid(2), ObjectClass::File, AccessVector::READ), Decision::Deny);
        // Reloading is additive and reactivates access.
        avc.load_rules(&[MacRule::allow(Sid(1), Sid(2), ObjectClass::File, AccessVector::READ)]);
        assert_eq!(avc.compute(Sid(1), Sid(2), ObjectClass::File, AccessVector::READ), Decision::Allow);
        assert_eq!(avc.len(), 5);
    }
}
