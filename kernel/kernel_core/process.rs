//! Execution contexts.
//!
//! The context table is a fixed-capacity array indexed by [`ContextId`].
//! Slot 0 is never used and slot 1 always holds the kernel context.  A
//! context carries everything the syscall dispatcher consults: capability
//! triple, MAC label, seccomp filter and namespace proxy.  Its cgroup
//! membership and memory charge live in the cgroup table.
//!
//! # Lifecycle
//!
//! ```text
//! spawn(parent) --> Running --exit/kill/OOM--> Zombie --reap--> (slot free)
//! ```
//!
//! Exit releases the namespace proxy, the seccomp filter and the cgroup
//! membership immediately.  The slot and its local pids survive until the
//! parent reaps it, so `wait` can still name the child.  Children of an
//! exiting context are handed to the kernel context.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use audit::KernelEvent;
use cap::{CapTriple, Capability};
use lsm::Sid;
use seccomp::FilterRef;

use crate::cgroup::ROOT_CGROUP;
use crate::namespace::ProxyId;
use crate::{Kernel, KernelError};

/// Context identifier.
pub type ContextId = u32;

/// Reserved; never names a context.
pub const INVALID_CONTEXT: ContextId = 0;

/// The kernel's own context.
pub const KERNEL_CONTEXT: ContextId = 1;

/// First id handed to spawned contexts.
pub const FIRST_USER_CONTEXT: ContextId = 2;

pub const SIGKILL: u8 = 9;
pub const SIGSYS: u8 = 31;

/// Largest deliverable signal number.
pub const MAX_SIGNAL: u8 = 64;

/// `oom_score_adj` of a context the OOM killer must never pick.
pub const OOM_SCORE_ADJ_MIN: i16 = -1000;
pub const OOM_SCORE_ADJ_MAX: i16 = 1000;

/// mmap 默认起始地址
pub const MMAP_BASE: u64 = 0x4000_0000;

/// 页大小
pub const PAGE_SIZE: u64 = 0x1000;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    NoSuchContext,
    /// Every slot is occupied.
    TableFull,
    /// The context has already exited.
    NotRunning,
    /// Target is not a child of the caller.
    NotChild,
    /// Reap of a child that hasn't exited.
    StillRunning,
    /// The kernel context can't exit or be relabelled this way.
    KernelContext,
    /// Value out of range.
    InvalidArgument,
    /// The caller was killed while the operation ran.
    Killed,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::NoSuchContext => write!(f, "no such context"),
            ProcessError::TableFull => write!(f, "context table full"),
            ProcessError::NotRunning => write!(f, "context not running"),
            ProcessError::NotChild => write!(f, "not a child of the caller"),
            ProcessError::StillRunning => write!(f, "child still running"),
            ProcessError::KernelContext => write!(f, "not permitted on the kernel context"),
            ProcessError::InvalidArgument => write!(f, "invalid argument"),
            ProcessError::Killed => write!(f, "caller was killed"),
        }
    }
}

pub type Result<T> = core::result::Result<T, ProcessError>;

// ============================================================================
// Context
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Running,
    /// Exited, waiting to be reaped.  `signal` is set when it was killed.
    Zombie { code: i32, signal: Option<u8> },
}

/// One execution context.
#[derive(Debug, Clone)]
pub struct Context {
    id: ContextId,
    parent: ContextId,
    caps: CapTriple,
    sid: Sid,
    /// Meaningless once the context is a zombie.
    proxy: ProxyId,
    filter: Option<FilterRef>,
    state: ContextState,
    oom_score_adj: i16,
    birth: u64,
    cpu_usec: u64,
    pending_signal: Option<u8>,
    mmap_next: u64,
}

impl Context {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn parent(&self) -> ContextId {
        self.parent
    }

    pub fn caps(&self) -> CapTriple {
        self.caps
    }

    pub fn sid(&self) -> Sid {
        self.sid
    }

    pub fn proxy(&self) -> ProxyId {
        self.proxy
    }

    pub fn filter(&self) -> Option<&FilterRef> {
        self.filter.as_ref()
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ContextState::Running
    }

    pub fn is_kernel(&self) -> bool {
        self.id == KERNEL_CONTEXT
    }

    pub fn oom_score_adj(&self) -> i16 {
        self.oom_score_adj
    }

    /// Creation sequence number.  Smaller is older.
    pub fn birth(&self) -> u64 {
        self.birth
    }

    pub fn cpu_usec(&self) -> u64 {
        self.cpu_usec
    }

    pub fn pending_signal(&self) -> Option<u8> {
        self.pending_signal
    }

    /// Wait status in the Linux layout: `code << 8`, or the signal number
    /// for a killed context.
    pub fn wait_status(&self) -> Option<i32> {
        match self.state {
            ContextState::Running => None,
            ContextState::Zombie { signal: Some(sig), .. } => Some(sig as i32),
            ContextState::Zombie { code, signal: None } => Some((code & 0xff) << 8),
        }
    }

    pub(crate) fn add_cpu_time(&mut self, usec: u64) {
        self.cpu_usec = self.cpu_usec.saturating_add(usec);
    }

    pub(crate) fn caps_mut(&mut self) -> &mut CapTriple {
        &mut self.caps
    }

    pub(crate) fn set_proxy(&mut self, proxy: ProxyId) {
        self.proxy = proxy;
    }

    pub(crate) fn set_pending_signal(&mut self, sig: u8) {
        self.pending_signal = Some(sig);
    }

    /// Reserve `len` bytes of address space, returning the base.
    pub(crate) fn bump_mmap(&mut self, len: u64) -> Option<u64> {
        let base = self.mmap_next;
        self.mmap_next = base.checked_add(len)?;
        Some(base)
    }
}

// ============================================================================
// Context table
// ============================================================================

pub struct ContextTable {
    slots: Vec<Option<Context>>,
    next: ContextId,
    births: u64,
}

impl ContextTable {
    /// Empty table with room for `capacity` slots including the reserved
    /// slot 0 and the kernel context.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(capacity.max(FIRST_USER_CONTEXT as usize), || None);
        ContextTable {
            slots,
            next: FIRST_USER_CONTEXT,
            births: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots, zombies included.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: ContextId) -> Option<&Context> {
        self.slots.get(id as usize)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: ContextId) -> Option<&mut Context> {
        self.slots.get_mut(id as usize)?.as_mut()
    }

    /// A running context.
    pub fn live(&self, id: ContextId) -> Result<&Context> {
        let ctx = self.get(id).ok_or(ProcessError::NoSuchContext)?;
        if !ctx.is_running() {
            return Err(ProcessError::NotRunning);
        }
        Ok(ctx)
    }

    pub(crate) fn live_mut(&mut self, id: ContextId) -> Result<&mut Context> {
        let ctx = self.get_mut(id).ok_or(ProcessError::NoSuchContext)?;
        if !ctx.is_running() {
            return Err(ProcessError::NotRunning);
        }
        Ok(ctx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Context> {
        self.slots.iter().flatten()
    }

    pub fn children(&self, parent: ContextId) -> impl Iterator<Item = &Context> {
        self.iter().filter(move |c| c.parent == parent && c.id != parent)
    }

    /// Next free id, scanning cyclically from the last allocation.
    fn allocate_id(&mut self) -> Result<ContextId> {
        let cap = self.slots.len() as ContextId;
        let span = cap.saturating_sub(FIRST_USER_CONTEXT);
        for step in 0..span {
            let id = FIRST_USER_CONTEXT + (self.next - FIRST_USER_CONTEXT + step) % span;
            if self.slots[id as usize].is_none() {
                self.next = if id + 1 >= cap { FIRST_USER_CONTEXT } else { id + 1 };
                return Ok(id);
            }
        }
        Err(ProcessError::TableFull)
    }

    fn next_birth(&mut self) -> u64 {
        self.births += 1;
        self.births
    }

    fn insert(&mut self, ctx: Context) {
        let id = ctx.id as usize;
        if let Some(slot) = self.slots.get_mut(id) {
            *slot = Some(ctx);
        }
    }

    fn remove(&mut self, id: ContextId) -> Option<Context> {
        self.slots.get_mut(id as usize)?.take()
    }

    fn reparent_children(&mut self, from: ContextId, to: ContextId) {
        for ctx in self.slots.iter_mut().flatten() {
            if ctx.parent == from && ctx.id != from {
                ctx.parent = to;
            }
        }
    }

    /// Install the kernel context in slot 1.
    pub(crate) fn install_kernel(&mut self, sid: Sid, proxy: ProxyId) {
        let birth = self.next_birth();
        self.insert(Context {
            id: KERNEL_CONTEXT,
            parent: KERNEL_CONTEXT,
            caps: CapTriple::full(),
            sid,
            proxy,
            filter: None,
            state: ContextState::Running,
            oom_score_adj: OOM_SCORE_ADJ_MIN,
            birth,
            cpu_usec: 0,
            pending_signal: None,
            mmap_next: MMAP_BASE,
        });
    }
}

// ============================================================================
// Kernel operations
// ============================================================================

impl Kernel {
    /// Snapshot of a context, zombies included.
    pub fn context(&self, id: ContextId) -> Option<Context> {
        self.processes.lock().get(id).cloned()
    }

    /// Ids of every running context.
    pub fn live_contexts(&self) -> Vec<ContextId> {
        self.processes
            .lock()
            .iter()
            .filter(|c| c.is_running())
            .map(|c| c.id)
            .collect()
    }

    /// Fork `parent`.
    ///
    /// The child shares the parent's seccomp filter and namespace proxy,
    /// inherits its label and cgroup, and starts with an empty effective
    /// capability set.
    ///
    /// # Errors
    ///
    /// * `Process(TableFull)` - No free slot
    /// * `Cgroup(PidsLimitExceeded)` - A PIDs limit on the parent's cgroup path is reached
    /// * `Namespace(..)` - The parent's proxy is gone
    pub fn spawn(&self, parent: ContextId) -> core::result::Result<ContextId, KernelError> {
        let mut procs = self.processes.lock();
        let p = procs.live(parent)?;
        let (caps, sid, proxy, filter) = (p.caps.for_child(), p.sid, p.proxy, p.filter.clone());
        let id = procs.allocate_id()?;

        {
            let mut ns = self.namespaces.lock();
            ns.get_proxy(proxy)?;
            if let Err(e) = ns.assign_pid_chain(proxy, id) {
                ns.forget_pid(id);
                let _ = ns.free_proxy(proxy);
                return Err(e.into());
            }
            let mut cgroups = self.cgroups.write();
            let cg = cgroups.cgroup_of(parent).unwrap_or(ROOT_CGROUP);
            if let Err(e) = cgroups.attach_new(cg, id) {
                ns.forget_pid(id);
                let _ = ns.free_proxy(proxy);
                return Err(e.into());
            }
        }

        let birth = procs.next_birth();
        procs.insert(Context {
            id,
            parent,
            caps,
            sid,
            proxy,
            filter,
            state: ContextState::Running,
            oom_score_adj: 0,
            birth,
            cpu_usec: 0,
            pending_signal: None,
            mmap_next: MMAP_BASE,
        });
        klog!(Debug, "process: ctx {} forked from {}", id, parent);
        Ok(id)
    }

    /// Voluntary exit with `code`.
    pub fn exit(&self, ctx: ContextId, code: i32) -> core::result::Result<(), KernelError> {
        let mut events = Vec::new();
        let result = {
            let mut procs = self.processes.lock();
            self.exit_locked(&mut procs, ctx, code, None, &mut events)
        };
        self.publish(events);
        result
    }

    /// Terminate `ctx` with `signal`.  The exit code is `128 + signal`.
    pub fn kill_context(&self, ctx: ContextId, signal: u8) -> core::result::Result<(), KernelError> {
        let mut events = Vec::new();
        let result = {
            let mut procs = self.processes.lock();
            self.exit_locked(&mut procs, ctx, 128 + signal as i32, Some(signal), &mut events)
        };
        self.publish(events);
        result
    }

    /// Tear down a running context.  Caller holds the context table.
    pub(crate) fn exit_locked(
        &self,
        procs: &mut ContextTable,
        ctx: ContextId,
        code: i32,
        signal: Option<u8>,
        events: &mut Vec<KernelEvent>,
    ) -> core::result::Result<(), KernelError> {
        if ctx == KERNEL_CONTEXT {
            return Err(ProcessError::KernelContext.into());
        }
        let c = procs.live_mut(ctx)?;
        c.state = ContextState::Zombie { code, signal };
        c.filter = None;
        c.pending_signal = None;
        let proxy = c.proxy;
        procs.reparent_children(ctx, KERNEL_CONTEXT);

        if let Err(e) = self.namespaces.lock().free_proxy(proxy) {
            klog_force!("process: ctx {} exit left {} inconsistent: {}", ctx, proxy, e);
        }
        {
            let mut cgroups = self.cgroups.write();
            if cgroups.detach(ctx).is_err() {
                klog_force!("process: ctx {} exited without a cgroup", ctx);
            }
            events.extend(cgroups.take_events());
        }

        match signal {
            Some(sig) => klog!(Info, "process: ctx {} killed by signal {}", ctx, sig),
            None => klog!(Debug, "process: ctx {} exited with {}", ctx, code),
        }
        events.push(KernelEvent::ContextExit { ctx, code, signal });
        Ok(())
    }

    /// Free the slot of an exited child.  Returns its wait status.
    pub fn reap(&self, parent: ContextId, child: ContextId) -> core::result::Result<i32, KernelError> {
        let mut procs = self.processes.lock();
        let c = procs.get(child).ok_or(ProcessError::NoSuchContext)?;
        if c.parent != parent || child == KERNEL_CONTEXT {
            return Err(ProcessError::NotChild.into());
        }
        let status = c.wait_status().ok_or(ProcessError::StillRunning)?;
        self.namespaces.lock().forget_pid(child);
        procs.remove(child);
        Ok(status)
    }

    pub fn set_oom_score_adj(&self, ctx: ContextId, adj: i16) -> core::result::Result<(), KernelError> {
        if !(OOM_SCORE_ADJ_MIN..=OOM_SCORE_ADJ_MAX).contains(&adj) {
            return Err(ProcessError::InvalidArgument.into());
        }
        self.processes.lock().live_mut(ctx)?.oom_score_adj = adj;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Capabilities
    // ------------------------------------------------------------------------

    pub fn capabilities(&self, ctx: ContextId) -> core::result::Result<CapTriple, KernelError> {
        Ok(self.processes.lock().live(ctx)?.caps)
    }

    /// Replace the whole triple.  Any consistent triple is accepted here;
    /// the capset syscall adds the no-growth rule.
    pub fn set_capabilities(&self, ctx: ContextId, caps: CapTriple) -> core::result::Result<(), KernelError> {
        if ctx == KERNEL_CONTEXT {
            return Err(ProcessError::KernelContext.into());
        }
        self.processes.lock().live_mut(ctx)?.caps = caps;
        Ok(())
    }

    /// Effective-set check.  False for unknown or exited contexts.
    pub fn check_capability(&self, ctx: ContextId, cap: Capability) -> bool {
        self.processes
            .lock()
            .live(ctx)
            .map_or(false, |c| c.caps.check(cap))
    }

    pub fn raise_capability(&self, ctx: ContextId, cap: Capability) -> core::result::Result<(), KernelError> {
        self.processes.lock().live_mut(ctx)?.caps.raise(cap)?;
        Ok(())
    }

    /// No-op on the kernel context, which always keeps its full set.
    pub fn lower_capability(&self, ctx: ContextId, cap: Capability) -> core::result::Result<(), KernelError> {
        let mut procs = self.processes.lock();
        let c = procs.live_mut(ctx)?;
        if !c.is_kernel() {
            c.caps.lower(cap);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Labels and filters
    // ------------------------------------------------------------------------

    /// Relabel `ctx`, interning `label` in the SID table.
    pub fn set_context_label(&self, ctx: ContextId, label: &str) -> core::result::Result<Sid, KernelError> {
        if ctx == KERNEL_CONTEXT {
            return Err(ProcessError::KernelContext.into());
        }
        let sid = self.mac.string_to_sid(label)?;
        self.processes.lock().live_mut(ctx)?.sid = sid;
        Ok(sid)
    }

    pub fn context_label(&self, ctx: ContextId) -> Option<String> {
        let sid = self.processes.lock().get(ctx)?.sid;
        self.mac.sid_to_string(sid).ok()
    }

    /// Replace the seccomp filter of `ctx`.  Children forked afterwards
    /// share the new filter.
    pub fn attach_filter(&self, ctx: ContextId, filter: FilterRef) -> core::result::Result<(), KernelError> {
        if ctx == KERNEL_CONTEXT {
            return Err(seccomp::SeccompError::NotPermitted.into());
        }
        let mut procs = self.processes.lock();
        let c = procs.live_mut(ctx)?;
        klog!(Debug, "process: ctx {} filter {} ({} insns)", ctx, filter.id(), filter.len());
        c.filter = Some(filter);
        Ok(())
    }

    /// Take the recorded, undelivered signal of `ctx`.
    pub fn take_pending_signal(&self, ctx: ContextId) -> Option<u8> {
        self.processes.lock().get_mut(ctx)?.pending_signal.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_kernel(cap: usize) -> ContextTable {
        let mut t = ContextTable::new(cap);
        t.install_kernel(Sid(1), ProxyId(0));
        t
    }

    fn user(t: &mut ContextTable, parent: ContextId) -> ContextId {
        let id = t.allocate_id().unwrap();
        let birth = t.next_birth();
        t.insert(Context {
            id,
            parent,
            caps: CapTriple::empty(),
            sid: Sid(1),
            proxy: ProxyId(0),
            filter: None,
            state: ContextState::Running,
            oom_score_adj: 0,
            birth,
            cpu_usec: 0,
            pending_signal: None,
            mmap_next: MMAP_BASE,
        });
        id
    }

    #[test]
    fn test_kernel_slot() {
        let t = table_with_kernel(8);
        let k = t.live(KERNEL_CONTEXT).unwrap();
        assert!(k.is_kernel());
        assert_eq!(k.caps(), CapTriple::full());
        assert!(t.get(INVALID_CONTEXT).is_none());
    }

    #[test]
    fn test_allocation_wraps_and_fills() {
        let mut t = table_with_kernel(5);
        let a = user(&mut t, KERNEL_CONTEXT);
        let b = user(&mut t, KERNEL_CONTEXT);
        let c = user(&mut t, KERNEL_CONTEXT);
        assert_eq!((a, b, c), (2, 3, 4));
        assert_eq!(t.allocate_id(), Err(ProcessError::TableFull));
        t.remove(b);
        assert_eq!(t.allocate_id(), Ok(3));
    }

    #[test]
    fn test_ids_not_reused_immediately() {
        let mut t = table_with_kernel(8);
        let a = user(&mut t, KERNEL_CONTEXT);
        t.remove(a);
        assert_eq!(user(&mut t, KERNEL_CONTEXT), a + 1);
    }

    #[test]
    fn test_wait_status_layout() {
        let mut t = table_with_kernel(8);
        let a = user(&mut t, KERNEL_CONTEXT);
        assert_eq!(t.get(a).unwrap().wait_status(), None);
        t.get_mut(a).unwrap().state = ContextState::Zombie { code: 3, signal: None };
        assert_eq!(t.get(a).unwrap().wait_status(), Some(3 << 8));
        t.get_mut(a).unwrap().state = ContextState::Zombie { code: 137, signal: Some(SIGKILL) };
        assert_eq!(t.get(a).unwrap().wait_status(), Some(9));
        assert_eq!(t.live(a).err(), Some(ProcessError::NotRunning));
    }

    #[test]
    fn test_reparent_and_children() {
        let mut t = table_with_kernel(8);
        let a = user(&mut t, KERNEL_CONTEXT);
        let b = user(&mut t, a);
        let c = user(&mut t, a);
        assert_eq!(t.children(a).count(), 2);
        t.reparent_children(a, KERNEL_CONTEXT);
        assert_eq!(t.children(a).count(), 0);
        assert_eq!(t.get(b).unwrap().parent(), KERNEL_CONTEXT);
        assert_eq!(t.get(c).unwrap().parent(), KERNEL_CONTEXT);
        // The kernel is its own parent but not its own child.
        assert_eq!(t.children(KERNEL_CONTEXT).count(), 3);
    }

    #[test]
    fn test_mmap_bump() {
        let mut t = table_with_kernel(4);
        let a = user(&mut t, KERNEL_CONTEXT);
        let c = t.get_mut(a).unwrap();
        assert_eq!(c.bump_mmap(PAGE_SIZE), Some(MMAP_BASE));
        assert_eq!(c.bump_mmap(PAGE_SIZE), Some(MMAP_BASE + PAGE_SIZE));
        assert_eq!(c.bump_mmap(u64::MAX), None);
    }
}
