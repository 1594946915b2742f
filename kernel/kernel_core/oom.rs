//! OOM victim selection.
//!
//! When a memory charge can't be satisfied after reclaim, one context in the
//! violating cgroup's subtree is chosen and killed.  The badness score is
//! the context's charged bytes shifted by `oom_score_adj` thousandths of the
//! cgroup limit:
//!
//! ```text
//! badness = usage + adj * limit / 1000
//! ```
//!
//! `adj == -1000` makes a context unkillable.  The kernel context is never
//! chosen.

use crate::process::{ContextId, KERNEL_CONTEXT, OOM_SCORE_ADJ_MIN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OomCandidate {
    pub ctx: ContextId,
    /// Bytes charged to this context.
    pub usage: u64,
    pub oom_score_adj: i16,
    /// Creation order.  Smaller is older.
    pub birth: u64,
}

impl OomCandidate {
    fn badness(&self, limit: u64) -> i128 {
        self.usage as i128 + (self.oom_score_adj as i128 * limit as i128) / 1000
    }

    fn eligible(&self) -> bool {
        self.ctx != KERNEL_CONTEXT && self.oom_score_adj > OOM_SCORE_ADJ_MIN
    }
}

/// Pick the victim with the highest badness.  Ties go to the larger usage,
/// then to the older context.
pub fn select_victim(candidates: &[OomCandidate], limit: u64) -> Option<ContextId> {
    candidates
        .iter()
        .filter(|c| c.eligible())
        .max_by(|a, b| {
            a.badness(limit)
                .cmp(&b.badness(limit))
                .then(a.usage.cmp(&b.usage))
                .then(b.birth.cmp(&a.birth))
        })
        .map(|c| c.ctx)
}
