//! Whole-system consistency checks.
//!
//! [`check_all`] walks every table and reports each broken invariant
//! instead of stopping at the first.  Tests assert the result is empty after
//! every scenario; a debug shell can print it.
//!
//! | Name | Holds when |
//! |------|------------|
//! | `caps` | every live triple has effective, inheritable ⊆ permitted; the kernel's is full |
//! | `sid` | every allocated SID round-trips through its label |
//! | `cgroup-controllers` | a child's controllers ⊆ its parent's |
//! | `cgroup-residual` | a child's hard-limit headroom fits in its parent's |
//! | `cgroup-membership` | each live context is in exactly one cgroup |
//! | `cgroup-usage` | memory and pid usage equal the member totals of the subtree |
//! | `proxy-refcount` | a proxy's count equals the live contexts using it |

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use cap::CapTriple;
use lsm::Sid;

use crate::cgroup::{CgroupId, CgroupTable, Resource};
use crate::namespace::{NamespaceTable, ProxyId};
use crate::process::ContextTable;
use crate::Kernel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub description: String,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.invariant, self.description)
    }
}

fn violation(out: &mut Vec<InvariantViolation>, invariant: &'static str, description: String) {
    klog!(Error, "invariant {} broken: {}", invariant, description);
    out.push(InvariantViolation { invariant, description });
}

/// Check every invariant.  Takes the process, namespace and cgroup locks in
/// order; call with no kernel lock held.
pub fn check_all(kernel: &Kernel) -> Vec<InvariantViolation> {
    let mut out = Vec::new();
    check_sids(kernel, &mut out);

    let procs = kernel.processes.lock();
    let namespaces = kernel.namespaces.lock();
    let cgroups = kernel.cgroups.read();
    check_caps(&procs, &mut out);
    check_cgroup_tree(&cgroups, &mut out);
    check_membership(&procs, &cgroups, &mut out);
    check_proxies(&procs, &namespaces, &mut out);
    out
}

fn check_caps(procs: &ContextTable, out: &mut Vec<InvariantViolation>) {
    for ctx in procs.iter().filter(|c| c.is_running()) {
        if !ctx.caps().is_consistent() {
            violation(out, "caps", format!("context {} has {:?}", ctx.id(), ctx.caps()));
        }
        if ctx.is_kernel() && ctx.caps() != CapTriple::full() {
            violation(out, "caps", format!("kernel context lost capabilities: {:?}", ctx.caps()));
        }
    }
}

fn check_sids(kernel: &Kernel, out: &mut Vec<InvariantViolation>) {
    for (sid, label) in kernel.mac.sid_entries() {
        if sid == Sid::UNLABELED {
            continue;
        }
        match kernel.mac.string_to_sid(&label) {
            Ok(back) if back == sid => {}
            other => violation(out, "sid", format!("{:?} -> {:?} -> {:?}", sid, label, other)),
        }
    }
}

fn check_cgroup_tree(cgroups: &CgroupTable, out: &mut Vec<InvariantViolation>) {
    for node in cgroups.iter() {
        let Some(parent) = node.parent().and_then(|p| cgroups.get(p)) else {
            continue;
        };
        if !parent.controllers().contains(node.controllers()) {
            violation(
                out,
                "cgroup-controllers",
                format!(
                    "cgroup {} enables {:?} but parent {} has {:?}",
                    node.id(),
                    node.controllers(),
                    parent.id(),
                    parent.controllers()
                ),
            );
        }
        for res in [Resource::Memory, Resource::Pids] {
            let (Some(limit), Some(parent_limit)) = (node.limit(res), parent.limit(res)) else {
                continue;
            };
            let own = limit.saturating_sub(node.usage(res));
            let room = parent_limit.saturating_sub(parent.usage(res));
            if own > room {
                violation(
                    out,
                    "cgroup-residual",
                    format!("cgroup {} {:?} headroom {} exceeds parent residual {}", node.id(), res, own, room),
                );
            }
        }
    }
}

fn check_membership(procs: &ContextTable, cgroups: &CgroupTable, out: &mut Vec<InvariantViolation>) {
    for ctx in procs.iter().filter(|c| c.is_running()) {
        match cgroups.membership(ctx.id()) {
            None => violation(out, "cgroup-membership", format!("context {} is in no cgroup", ctx.id())),
            Some(m) => {
                let listed = cgroups.get(m.cgroup).map_or(false, |cg| cg.members().any(|c| c == ctx.id()));
                if !listed {
                    violation(
                        out,
                        "cgroup-membership",
                        format!("context {} missing from cgroup {}", ctx.id(), m.cgroup),
                    );
                }
            }
        }
    }

    // Totals charged directly to each cgroup.
    let mut direct: BTreeMap<CgroupId, (u64, u64)> = BTreeMap::new();
    for (ctx, m) in cgroups.memberships() {
        if !procs.get(ctx).map_or(false, |c| c.is_running()) {
            violation(out, "cgroup-membership", format!("dead context {} still in cgroup {}", ctx, m.cgroup));
        }
        let entry = direct.entry(m.cgroup).or_default();
        entry.0 += m.charged();
        entry.1 += 1;
    }

    for node in cgroups.iter() {
        let (bytes, pids) = cgroups
            .subtree(node.id())
            .iter()
            .filter_map(|id| direct.get(id))
            .fold((0, 0), |(b, p), (db, dp)| (b + db, p + dp));
        if node.usage(Resource::Memory) != bytes {
            violation(
                out,
                "cgroup-usage",
                format!("cgroup {} memory usage {} != member total {}", node.id(), node.usage(Resource::Memory), bytes),
            );
        }
        if node.usage(Resource::Pids) != pids {
            violation(
                out,
                "cgroup-usage",
                format!("cgroup {} pids {} != member count {}", node.id(), node.usage(Resource::Pids), pids),
            );
        }
    }
}

fn check_proxies(procs: &ContextTable, namespaces: &NamespaceTable, out: &mut Vec<InvariantViolation>) {
    let mut users: BTreeMap<ProxyId, u32> = BTreeMap::new();
    for ctx in procs.iter().filter(|c| c.is_running()) {
        if namespaces.proxy(ctx.proxy()).is_none() {
            violation(
                out,
                "proxy-refcount",
                format!("context {} uses freed proxy {:?}", ctx.id(), ctx.proxy()),
            );
        }
        *users.entry(ctx.proxy()).or_default() += 1;
    }
    for (id, proxy) in namespaces.proxies() {
        let expected = users.get(&id).copied().unwrap_or(0);
        if proxy.refcount() != expected {
            violation(
                out,
                "proxy-refcount",
                format!("proxy {:?} count {} but {} live users", id, proxy.refcount(), expected),
            );
        }
    }
}

/// Live contexts the checker saw, for callers that want to log a summary.
pub fn live_count(kernel: &Kernel) -> usize {
    kernel.processes.lock().iter().filter(|c| c.is_running()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{CgroupControllers, CgroupLimits, MemoryKind, ROOT_CGROUP};
    use crate::config::KernelConfig;
    use crate::namespace::CloneFlags;
    use crate::process::KERNEL_CONTEXT;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use hal::SimPlatform;

    fn boot() -> Kernel {
        Kernel::boot(KernelConfig::default(), Box::new(Arc::new(SimPlatform::new()))).expect("boot")
    }

    #[test]
    fn test_fresh_kernel_is_consistent() {
        let k = boot();
        assert_eq!(check_all(&k), []);
        assert_eq!(live_count(&k), 1);
    }

    #[test]
    fn test_consistent_after_activity() {
        let k = boot();
        let g = k
            .create_cgroup(ROOT_CGROUP, "work", CgroupControllers::MEMORY | CgroupControllers::PIDS)
            .expect("create");
        k.set_cgroup_limits(
            g,
            &CgroupLimits {
                memory_max: Some(1 << 20),
                pids_max: Some(4),
                ..CgroupLimits::default()
            },
        )
        .expect("limits");
        let a = k.spawn(KERNEL_CONTEXT).expect("spawn");
        let b = k.spawn(a).expect("spawn");
        k.attach(g, a).expect("attach");
        k.charge_memory(a, 4096, MemoryKind::Anon).expect("charge");
        k.charge_memory(b, 8192, MemoryKind::Cache).expect("charge");
        k.unshare(b, CloneFlags::NEWUTS).expect("unshare");
        assert_eq!(check_all(&k), []);

        k.exit(b, 0).expect("exit");
        assert_eq!(check_all(&k), []);
        k.reap(a, b).expect("reap");
        k.exit(a, 3).expect("exit");
        assert_eq!(check_all(&k), []);
    }

    #[test]
    fn test_outstanding_proxy_handle_is_reported() {
        let k = boot();
        let proxy = k.create_proxy(KERNEL_CONTEXT).expect("proxy");
        let found = check_all(&k);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].invariant, "proxy-refcount");
        k.free_proxy(proxy).expect("free");
        assert_eq!(check_all(&k), []);
    }
}
