//! Cgroup v2 Resource Controller
//!
//! A single unified hierarchy of control groups.  Every live context is a
//! member of exactly one cgroup; controllers enabled on a cgroup apply
//! their limits to every context in its subtree.
//!
//! - **CPU**: proportional weight and an optional `(quota, period)` hard cap
//! - **Memory**: `min/low/high/max` byte limits, reclaim, OOM, pressure
//! - **I/O**: weight and per-device bandwidth/IOPS caps
//! - **PIDs**: maximum number of member contexts
//! - **Freezer**: stop every contained context at its next dispatch
//! - **Devices**: ordered allow/deny rules over `(type, major, minor)`
//!
//! # Architecture
//!
//! ```text
//! / (id=0, depth=0, all controllers)
//!   ├── system (id=1, depth=1)
//!   │   └── sshd (id=2, depth=2)
//!   └── user (id=3, depth=1)
//! ```
//!
//! Usage counters are hierarchical: charging a context adds to its cgroup
//! and to every ancestor, whether or not the controller is enabled there.
//! Limits only apply where the controller is enabled.
//!
//! # Residual limits
//!
//! A hard limit `L` on child `c` of parent `p` must satisfy
//! `L <= p.L - (p.usage - c.usage)`, equivalently
//! `c.L - c.usage <= p.L - p.usage`.  Charges keep this true by treating the
//! unused part of each limited sibling as reserved: charging through `p`
//! succeeds only while `p.usage + amount` plus the largest sibling headroom
//! fits under `p.L`.  Memory and PIDs limits both follow this rule.
//!
//! # Security Considerations
//!
//! - **Depth Limit**: bounded by the boot configuration so traversals stay
//!   short.
//! - **Count Limit**: bounded by the boot configuration to stop unbounded
//!   creation.
//! - **Controller Inheritance**: a child may only enable controllers its
//!   parent has enabled.
//!
//! # References
//!
//! - Linux cgroup v2 documentation: Documentation/admin-guide/cgroup-v2.rst

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use audit::{KernelEvent, PressureLevel};
use bitflags::bitflags;

use crate::oom::{self, OomCandidate};
use crate::process::{ContextId, ProcessError, SIGKILL};
use crate::{Kernel, KernelError};

// ============================================================================
// Type Definitions
// ============================================================================

/// Unique identifier for a cgroup node.  The root is always 0 and ids are
/// never reused within a boot.
pub type CgroupId = u32;

pub const ROOT_CGROUP: CgroupId = 0;

/// Longest cgroup name, in bytes.
pub const MAX_NAME_LEN: usize = 64;

pub const CPU_WEIGHT_DEFAULT: u32 = 100;
pub const CPU_WEIGHT_MAX: u32 = 10_000;
pub const IO_WEIGHT_DEFAULT: u32 = 100;
pub const IO_WEIGHT_MAX: u32 = 10_000;

/// OOM kills one charge may trigger before giving up.
pub const MAX_OOM_KILLS: usize = 8;

// ============================================================================
// Controller Flags
// ============================================================================

bitflags! {
    /// Bitflags describing enabled controllers on a cgroup node.
    ///
    /// Controllers can only be enabled if the parent cgroup has them enabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CgroupControllers: u32 {
        /// CPU controller: weight-based scheduling and quota limits.
        const CPU     = 0x01;
        /// Memory controller: byte limits, reclaim and OOM.
        const MEMORY  = 0x02;
        /// PIDs controller: maximum number of member contexts.
        const PIDS    = 0x04;
        /// I/O controller: weight and per-device caps.
        const IO      = 0x08;
        const FREEZER = 0x10;
        const DEVICES = 0x20;
    }
}

// ============================================================================
// Resource Limits
// ============================================================================

/// Memory protection and limit thresholds, in bytes.
///
/// `None` for `high`/`max` means unlimited.  Always
/// `min <= low <= high <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryLimits {
    /// Never reclaimed below this.
    pub min: u64,
    /// Reclaim skips the cgroup while usage is at or below this.
    pub low: u64,
    /// Crossing it counts a `high` event.
    pub high: Option<u64>,
    /// Hard limit.  Charges beyond it reclaim, then OOM.
    pub max: Option<u64>,
}

impl MemoryLimits {
    pub fn is_ordered(&self) -> bool {
        let max = self.max.unwrap_or(u64::MAX);
        let high = self.high.unwrap_or(max);
        self.min <= self.low && self.low <= high && high <= max
    }

    fn protection(&self) -> u64 {
        self.min.max(self.low)
    }
}

/// Limit updates.  Only fields that are `Some` are applied.
#[derive(Debug, Clone, Default)]
pub struct CgroupLimits {
    /// CPU weight in the range 1-10000 (default: 100).
    ///
    /// Higher weight means more CPU time relative to siblings.
    pub cpu_weight: Option<u32>,

    /// CPU quota as `(max_microseconds, period_microseconds)`.
    ///
    /// The cgroup can use at most `max` microseconds of CPU time per
    /// `period` microseconds.
    pub cpu_max: Option<(u64, u64)>,

    pub memory_min: Option<u64>,
    pub memory_low: Option<u64>,
    pub memory_high: Option<u64>,
    /// Hard memory limit in bytes.
    pub memory_max: Option<u64>,

    /// Maximum number of member contexts in the subtree.
    ///
    /// fork fails with EAGAIN when the limit is reached.
    pub pids_max: Option<u64>,

    /// I/O weight in the range 1-10000 (default: 100).
    pub io_weight: Option<u32>,
}

/// Per-device I/O caps.  Each is per one-second window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoLimits {
    pub read_bps: Option<u64>,
    pub write_bps: Option<u64>,
    pub read_iops: Option<u64>,
    pub write_iops: Option<u64>,
}

/// Block or character device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceNumber {
    pub major: u32,
    pub minor: u32,
}

impl DeviceNumber {
    pub const fn new(major: u32, minor: u32) -> Self {
        DeviceNumber { major, minor }
    }
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Anonymous memory.  Only freed by uncharge or exit.
    Anon,
    /// Page cache.  Reclaimable.
    Cache,
}

// ============================================================================
// Device Rules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Block,
    Char,
    /// Matches both block and character devices.
    All,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceAccess: u8 {
        const READ  = 0x01;
        const WRITE = 0x02;
        const MKNOD = 0x04;
    }
}

/// One devices-controller rule.  `None` for major or minor is a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRule {
    pub kind: DeviceType,
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub access: DeviceAccess,
    pub allow: bool,
}

impl DeviceRule {
    pub const fn allow(kind: DeviceType, major: Option<u32>, minor: Option<u32>, access: DeviceAccess) -> Self {
        DeviceRule {
            kind,
            major,
            minor,
            access,
            allow: true,
        }
    }

    pub const fn deny(kind: DeviceType, major: Option<u32>, minor: Option<u32>, access: DeviceAccess) -> Self {
        DeviceRule {
            kind,
            major,
            minor,
            access,
            allow: false,
        }
    }

    /// An allow rule must cover every requested bit; a deny rule matches on
    /// any overlap.
    fn matches(&self, kind: DeviceType, dev: DeviceNumber, access: DeviceAccess) -> bool {
        let kind_ok = self.kind == DeviceType::All || self.kind == kind;
        let major_ok = self.major.map_or(true, |m| m == dev.major);
        let minor_ok = self.minor.map_or(true, |m| m == dev.minor);
        let access_ok = if self.allow {
            self.access.contains(access)
        } else {
            self.access.intersects(access)
        };
        kind_ok && major_ok && minor_ok && access_ok
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time view of one cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CgroupStats {
    pub cpu_usage_usec: u64,
    pub cpu_throttled_periods: u64,
    pub cpu_throttled_usec: u64,
    pub memory_current: u64,
    pub memory_peak: u64,
    pub memory_events_high: u64,
    pub memory_events_max: u64,
    pub memory_oom_kill: u64,
    pub pressure: PressureLevel,
    pub pids_current: u64,
    pub pids_events_max: u64,
    pub io_rbytes: u64,
    pub io_wbytes: u64,
    pub io_rios: u64,
    pub io_wios: u64,
    pub io_throttled: u64,
    pub frozen: bool,
    /// Direct members only.
    pub members: usize,
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors returned by cgroup operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupError {
    /// Creating child would exceed the depth limit.
    DepthLimit,
    /// Creating cgroup would exceed the count limit.
    CgroupLimit,
    /// Requested cgroup ID does not exist.
    NotFound,
    /// Empty, too long, or contains `/`.
    InvalidName,
    /// A sibling already has this name.
    NameExists,
    /// Context already has a cgroup.
    AlreadyAttached,
    /// Context is not a member of the expected cgroup.
    NotAttached,
    /// Provided limit value is invalid (e.g., zero period, unordered).
    InvalidLimit,
    /// Limit conflicts with the parent's residual or a child's limit.
    ResidualExceeded,
    /// Requested controller is not enabled on this cgroup or its parent.
    ControllerDisabled,
    /// A child still has the controller enabled.
    ControllerInUse,
    /// PID limit reached in some ancestor.
    PidsLimitExceeded,
    /// Memory limit of `cgroup` cannot hold the charge after reclaim.
    MemoryLimit { cgroup: CgroupId },
    /// New limit is below usage that reclaim cannot free.
    Busy,
    /// I/O cap for the current window reached.
    IoThrottled,
    /// Devices controller rejected the access.
    DeviceDenied,
    /// Cannot delete non-empty cgroup (has children or members).
    NotEmpty,
    /// The root cgroup cannot be deleted or limited.
    RootImmutable,
}

impl fmt::Display for CgroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgroupError::DepthLimit => write!(f, "cgroup depth limit exceeded"),
            CgroupError::CgroupLimit => write!(f, "cgroup count limit exceeded"),
            CgroupError::NotFound => write!(f, "cgroup not found"),
            CgroupError::InvalidName => write!(f, "invalid cgroup name"),
            CgroupError::NameExists => write!(f, "cgroup name already in use"),
            CgroupError::AlreadyAttached => write!(f, "context already attached"),
            CgroupError::NotAttached => write!(f, "context not attached to this cgroup"),
            CgroupError::InvalidLimit => write!(f, "invalid resource limit value"),
            CgroupError::ResidualExceeded => write!(f, "limit exceeds parent residual"),
            CgroupError::ControllerDisabled => write!(f, "controller not enabled"),
            CgroupError::ControllerInUse => write!(f, "controller enabled on a child"),
            CgroupError::PidsLimitExceeded => write!(f, "pids.max limit exceeded"),
            CgroupError::MemoryLimit { cgroup } => write!(f, "memory.max of cgroup {} exceeded", cgroup),
            CgroupError::Busy => write!(f, "usage above requested limit"),
            CgroupError::IoThrottled => write!(f, "io.max limit reached"),
            CgroupError::DeviceDenied => write!(f, "device access denied"),
            CgroupError::NotEmpty => write!(f, "cgroup has children or members"),
            CgroupError::RootImmutable => write!(f, "root cgroup is immutable"),
        }
    }
}

pub type Result<T> = core::result::Result<T, CgroupError>;

// ============================================================================
// Event Sink
// ============================================================================

/// Receiver of cgroup notifications.  Every method defaults to a no-op.
pub trait CgroupEventSink: Send + Sync {
    /// Pressure moved to a higher band.
    fn pressure_changed(&self, _cgroup: CgroupId, _from: PressureLevel, _to: PressureLevel) {}

    fn oom_kill(&self, _cgroup: CgroupId, _victim: ContextId) {}

    /// The cgroup's own freezer flag changed.
    fn freezer_changed(&self, _cgroup: CgroupId, _frozen: bool) {}
}

// ============================================================================
// Cgroup Node
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct CpuState {
    weight: u32,
    max: Option<(u64, u64)>,
    usage_usec: u64,
    throttled_periods: u64,
    throttled_usec: u64,
    period_start: u64,
    period_used: u64,
    throttled_this_period: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct MemoryState {
    limits: MemoryLimits,
    usage: u64,
    peak: u64,
    events_high: u64,
    events_max: u64,
    oom_kills: u64,
    oom_disable: bool,
    pressure: PressureLevel,
}

#[derive(Debug, Clone, Copy, Default)]
struct PidsState {
    max: Option<u64>,
    current: u64,
    events_max: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct IoWindow {
    start: u64,
    rbytes: u64,
    wbytes: u64,
    rios: u64,
    wios: u64,
}

#[derive(Debug, Clone, Default)]
struct IoState {
    weight: u32,
    limits: BTreeMap<DeviceNumber, IoLimits>,
    windows: BTreeMap<DeviceNumber, IoWindow>,
    rbytes: u64,
    wbytes: u64,
    rios: u64,
    wios: u64,
    throttled: u64,
}

/// One node of the hierarchy.
#[derive(Debug, Clone)]
pub struct Cgroup {
    id: CgroupId,
    name: String,
    parent: Option<CgroupId>,
    children: BTreeSet<CgroupId>,
    depth: u32,
    controllers: CgroupControllers,
    members: BTreeSet<ContextId>,
    cpu: CpuState,
    memory: MemoryState,
    pids: PidsState,
    io: IoState,
    self_frozen: bool,
    device_rules: Vec<DeviceRule>,
}

/// Hierarchical resources with hard limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Memory,
    Pids,
}

impl Cgroup {
    fn new(id: CgroupId, name: &str, parent: Option<CgroupId>, depth: u32, controllers: CgroupControllers) -> Self {
        Cgroup {
            id,
            name: String::from(name),
            parent,
            children: BTreeSet::new(),
            depth,
            controllers,
            members: BTreeSet::new(),
            cpu: CpuState {
                weight: CPU_WEIGHT_DEFAULT,
                ..Default::default()
            },
            memory: MemoryState::default(),
            pids: PidsState::default(),
            io: IoState {
                weight: IO_WEIGHT_DEFAULT,
                ..Default::default()
            },
            self_frozen: false,
            device_rules: Vec::new(),
        }
    }

    pub fn id(&self) -> CgroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<CgroupId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = CgroupId> + '_ {
        self.children.iter().copied()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn controllers(&self) -> CgroupControllers {
        self.controllers
    }

    /// Direct members.
    pub fn members(&self) -> impl Iterator<Item = ContextId> + '_ {
        self.members.iter().copied()
    }

    pub fn memory_limits(&self) -> MemoryLimits {
        self.memory.limits
    }

    pub fn memory_usage(&self) -> u64 {
        self.memory.usage
    }

    pub fn cpu_weight(&self) -> u32 {
        self.cpu.weight
    }

    pub fn cpu_max(&self) -> Option<(u64, u64)> {
        self.cpu.max
    }

    pub fn io_weight(&self) -> u32 {
        self.io.weight
    }

    pub fn oom_disabled(&self) -> bool {
        self.memory.oom_disable
    }

    pub fn self_frozen(&self) -> bool {
        self.self_frozen
    }

    pub fn device_rules(&self) -> &[DeviceRule] {
        &self.device_rules
    }

    /// Hard limit of `res`, if the controller is enabled and a limit set.
    pub fn limit(&self, res: Resource) -> Option<u64> {
        match res {
            Resource::Memory if self.controllers.contains(CgroupControllers::MEMORY) => self.memory.limits.max,
            Resource::Pids if self.controllers.contains(CgroupControllers::PIDS) => self.pids.max,
            _ => None,
        }
    }

    /// Hierarchical usage of `res`.
    pub fn usage(&self, res: Resource) -> u64 {
        match res {
            Resource::Memory => self.memory.usage,
            Resource::Pids => self.pids.current,
        }
    }

    /// Unused part of the hard limit, if limited.
    fn headroom(&self, res: Resource) -> Option<u64> {
        self.limit(res).map(|l| l.saturating_sub(self.usage(res)))
    }

    fn add_usage(&mut self, res: Resource, amount: u64) {
        match res {
            Resource::Memory => {
                self.memory.usage = self.memory.usage.saturating_add(amount);
                self.memory.peak = self.memory.peak.max(self.memory.usage);
            }
            Resource::Pids => self.pids.current = self.pids.current.saturating_add(amount),
        }
    }

    fn sub_usage(&mut self, res: Resource, amount: u64) {
        match res {
            Resource::Memory => self.memory.usage = self.memory.usage.saturating_sub(amount),
            Resource::Pids => self.pids.current = self.pids.current.saturating_sub(amount),
        }
    }

    fn stats(&self, frozen: bool) -> CgroupStats {
        CgroupStats {
            cpu_usage_usec: self.cpu.usage_usec,
            cpu_throttled_periods: self.cpu.throttled_periods,
            cpu_throttled_usec: self.cpu.throttled_usec,
            memory_current: self.memory.usage,
            memory_peak: self.memory.peak,
            memory_events_high: self.memory.events_high,
            memory_events_max: self.memory.events_max,
            memory_oom_kill: self.memory.oom_kills,
            pressure: self.memory.pressure,
            pids_current: self.pids.current,
            pids_events_max: self.pids.events_max,
            io_rbytes: self.io.rbytes,
            io_wbytes: self.io.wbytes,
            io_rios: self.io.rios,
            io_wios: self.io.wios,
            io_throttled: self.io.throttled,
            frozen,
            members: self.members.len(),
        }
    }
}

/// A context's membership edge and the memory charged to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub cgroup: CgroupId,
    pub anon: u64,
    pub cache: u64,
}

impl Membership {
    pub fn charged(&self) -> u64 {
        self.anon + self.cache
    }
}

// ============================================================================
// Cgroup Table
// ============================================================================

/// The whole hierarchy plus every membership edge.
///
/// Notifications produced by an operation queue up until the owner drains
/// them with [`CgroupTable::take_events`].
pub struct CgroupTable {
    nodes: BTreeMap<CgroupId, Cgroup>,
    members: BTreeMap<ContextId, Membership>,
    next_id: CgroupId,
    max_cgroups: usize,
    max_depth: u32,
    pending: Vec<KernelEvent>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LEN && !name.contains('/') && name != "." && name != ".."
}

impl CgroupTable {
    /// Root cgroup with every controller enabled.
    pub fn new(max_cgroups: usize, max_depth: u32) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_CGROUP, Cgroup::new(ROOT_CGROUP, "", None, 0, CgroupControllers::all()));
        CgroupTable {
            nodes,
            members: BTreeMap::new(),
            next_id: ROOT_CGROUP + 1,
            max_cgroups: max_cgroups.max(1),
            max_depth,
            pending: Vec::new(),
        }
    }

    pub fn get(&self, id: CgroupId) -> Option<&Cgroup> {
        self.nodes.get(&id)
    }

    fn node(&self, id: CgroupId) -> Result<&Cgroup> {
        self.nodes.get(&id).ok_or(CgroupError::NotFound)
    }

    fn node_mut(&mut self, id: CgroupId) -> Result<&mut Cgroup> {
        self.nodes.get_mut(&id).ok_or(CgroupError::NotFound)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cgroup> {
        self.nodes.values()
    }

    pub fn memberships(&self) -> impl Iterator<Item = (ContextId, &Membership)> {
        self.members.iter().map(|(ctx, m)| (*ctx, m))
    }

    pub fn membership(&self, ctx: ContextId) -> Option<&Membership> {
        self.members.get(&ctx)
    }

    pub fn cgroup_of(&self, ctx: ContextId) -> Option<CgroupId> {
        self.members.get(&ctx).map(|m| m.cgroup)
    }

    /// Drain queued notifications.
    pub fn take_events(&mut self) -> Vec<KernelEvent> {
        core::mem::take(&mut self.pending)
    }

    /// `id` followed by each ancestor up to the root.
    pub fn path_to_root(&self, id: CgroupId) -> Vec<CgroupId> {
        let mut path = Vec::new();
        let mut cur = Some(id);
        while let Some(id) = cur {
            match self.nodes.get(&id) {
                Some(node) => {
                    path.push(id);
                    cur = node.parent;
                }
                None => break,
            }
        }
        path
    }

    /// `id` and every descendant, parents before children.
    pub fn subtree(&self, id: CgroupId) -> Vec<CgroupId> {
        let mut out = Vec::new();
        let mut queue = alloc::collections::VecDeque::new();
        queue.push_back(id);
        while let Some(id) = queue.pop_front() {
            if let Some(node) = self.nodes.get(&id) {
                out.push(id);
                queue.extend(node.children.iter().copied());
            }
        }
        out
    }

    /// `/`-joined path of `id`.
    pub fn path(&self, id: CgroupId) -> Option<String> {
        self.nodes.get(&id)?;
        let mut names: Vec<&str> = self
            .path_to_root(id)
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.parent.is_some())
            .map(|n| n.name.as_str())
            .collect();
        names.reverse();
        let mut path = String::from("/");
        path.push_str(&names.join("/"));
        Some(path)
    }

    pub fn lookup(&self, path: &str) -> Option<CgroupId> {
        let mut cur = ROOT_CGROUP;
        for name in path.split('/').filter(|s| !s.is_empty()) {
            let node = self.nodes.get(&cur)?;
            cur = node
                .children
                .iter()
                .copied()
                .find(|c| self.nodes.get(c).map_or(false, |n| n.name == name))?;
        }
        Some(cur)
    }

    // ------------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------------

    /// Create a child of `parent`.
    ///
    /// # Errors
    ///
    /// * `InvalidName` / `NameExists` - Bad or duplicate sibling name
    /// * `ControllerDisabled` - Requested controllers not enabled on parent
    /// * `DepthLimit` - Would exceed the depth limit
    /// * `CgroupLimit` - Would exceed the count limit
    pub fn create(&mut self, parent: CgroupId, name: &str, controllers: CgroupControllers) -> Result<CgroupId> {
        if !valid_name(name) {
            return Err(CgroupError::InvalidName);
        }
        let p = self.node(parent)?;
        if !p.controllers.contains(controllers) {
            return Err(CgroupError::ControllerDisabled);
        }
        let depth = p.depth.saturating_add(1);
        if depth > self.max_depth {
            return Err(CgroupError::DepthLimit);
        }
        if p.children.iter().any(|c| self.nodes.get(c).map_or(false, |n| n.name == name)) {
            return Err(CgroupError::NameExists);
        }
        if self.nodes.len() >= self.max_cgroups || self.next_id == CgroupId::MAX {
            return Err(CgroupError::CgroupLimit);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(id, Cgroup::new(id, name, Some(parent), depth, controllers));
        self.node_mut(parent)?.children.insert(id);
        klog!(Debug, "cgroup: created {} under {}", id, parent);
        Ok(id)
    }

    /// Remove an empty, childless, non-root cgroup.
    pub fn delete(&mut self, id: CgroupId) -> Result<()> {
        let node = self.node(id)?;
        let parent = node.parent.ok_or(CgroupError::RootImmutable)?;
        if !node.children.is_empty() || !node.members.is_empty() {
            return Err(CgroupError::NotEmpty);
        }
        self.nodes.remove(&id);
        self.node_mut(parent)?.children.remove(&id);
        Ok(())
    }

    /// Enable `controllers` on `id`.  The parent must already have them.
    pub fn enable(&mut self, id: CgroupId, controllers: CgroupControllers) -> Result<()> {
        let node = self.node(id)?;
        if let Some(parent) = node.parent {
            if !self.node(parent)?.controllers.contains(controllers) {
                return Err(CgroupError::ControllerDisabled);
            }
        }
        self.node_mut(id)?.controllers.insert(controllers);
        Ok(())
    }

    /// Disable `controllers` on `id` and reset their settings.  No child may
    /// still have any of them.
    pub fn disable(&mut self, id: CgroupId, controllers: CgroupControllers) -> Result<()> {
        let node = self.node(id)?;
        if node.parent.is_none() {
            return Err(CgroupError::RootImmutable);
        }
        if node
            .children
            .iter()
            .filter_map(|c| self.nodes.get(c))
            .any(|c| c.controllers.intersects(controllers))
        {
            return Err(CgroupError::ControllerInUse);
        }
        let was_frozen = node.self_frozen;
        let node = self.node_mut(id)?;
        node.controllers.remove(controllers);
        if controllers.contains(CgroupControllers::CPU) {
            node.cpu.weight = CPU_WEIGHT_DEFAULT;
            node.cpu.max = None;
        }
        if controllers.contains(CgroupControllers::MEMORY) {
            node.memory.limits = MemoryLimits::default();
            node.memory.oom_disable = false;
            node.memory.pressure = PressureLevel::None;
        }
        if controllers.contains(CgroupControllers::PIDS) {
            node.pids.max = None;
        }
        if controllers.contains(CgroupControllers::IO) {
            node.io.weight = IO_WEIGHT_DEFAULT;
            node.io.limits.clear();
            node.io.windows.clear();
        }
        if controllers.contains(CgroupControllers::DEVICES) {
            node.device_rules.clear();
        }
        if controllers.contains(CgroupControllers::FREEZER) && was_frozen {
            node.self_frozen = false;
            self.pending.push(KernelEvent::Thawed { cgroup: id });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Limits
    // ------------------------------------------------------------------------

    /// Largest headroom among limited children of `id`, other than `skip`.
    fn reserved(&self, id: CgroupId, skip: Option<CgroupId>, res: Resource) -> u64 {
        self.nodes.get(&id).map_or(0, |node| {
            node.children
                .iter()
                .filter(|c| Some(**c) != skip)
                .filter_map(|c| self.nodes.get(c))
                .filter_map(|c| c.headroom(res))
                .max()
                .unwrap_or(0)
        })
    }

    /// First ancestor along `path` that can't take `amount` more of `res`,
    /// with the shortfall.
    fn check_headroom(&self, path: &[CgroupId], res: Resource, amount: u64) -> Option<(CgroupId, u64)> {
        for (i, id) in path.iter().enumerate() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            let Some(limit) = node.limit(res) else {
                continue;
            };
            let skip = if i == 0 { None } else { Some(path[i - 1]) };
            let need = node
                .usage(res)
                .saturating_add(amount)
                .saturating_add(self.reserved(*id, skip, res));
            if need > limit {
                return Some((*id, need - limit));
            }
        }
        None
    }

    /// Validate a new hard limit for `id` against its parent and children.
    ///
    /// `freed` holds the bytes a pending reclaim would take out of each
    /// cgroup's memory usage, subtree included.
    fn check_new_limit(
        &self,
        id: CgroupId,
        res: Resource,
        limit: u64,
        freed: &BTreeMap<CgroupId, u64>,
    ) -> Result<()> {
        let usage_after = |node: &Cgroup| match res {
            Resource::Memory => node
                .usage(res)
                .saturating_sub(freed.get(&node.id).copied().unwrap_or(0)),
            Resource::Pids => node.usage(res),
        };
        let headroom_after = |node: &Cgroup| node.limit(res).map(|l| l.saturating_sub(usage_after(node)));

        let node = self.node(id)?;
        let usage = usage_after(node);
        if limit < usage {
            return Err(CgroupError::Busy);
        }
        let own = limit - usage;
        if let Some(parent) = node.parent.and_then(|p| self.nodes.get(&p)) {
            if let Some(room) = headroom_after(parent) {
                if own > room {
                    return Err(CgroupError::ResidualExceeded);
                }
            }
        }
        let widest_child = node
            .children
            .iter()
            .filter_map(|c| self.nodes.get(c))
            .filter_map(headroom_after)
            .max()
            .unwrap_or(0);
        if widest_child > own {
            return Err(CgroupError::ResidualExceeded);
        }
        Ok(())
    }

    /// Apply the `Some` fields of `updated`.
    ///
    /// Lowering `memory_max` below usage reclaims page cache, but only once
    /// every check has passed.
    ///
    /// # Errors
    ///
    /// * `RootImmutable` - `id` is the root
    /// * `ControllerDisabled` - Limit requires a controller not enabled
    /// * `InvalidLimit` - Out-of-range weight, zero period, unordered memory thresholds
    /// * `ResidualExceeded` - Hard limit doesn't fit the parent's residual or a child's limit
    /// * `Busy` - Usage above the new hard limit
    pub fn set_limits(&mut self, id: CgroupId, updated: &CgroupLimits) -> Result<()> {
        let node = self.node(id)?;
        if node.parent.is_none() {
            return Err(CgroupError::RootImmutable);
        }
        let has = |c: CgroupControllers| node.controllers.contains(c);
        if (updated.cpu_weight.is_some() || updated.cpu_max.is_some()) && !has(CgroupControllers::CPU) {
            return Err(CgroupError::ControllerDisabled);
        }
        let memory_update = updated.memory_min.is_some()
            || updated.memory_low.is_some()
            || updated.memory_high.is_some()
            || updated.memory_max.is_some();
        if memory_update && !has(CgroupControllers::MEMORY) {
            return Err(CgroupError::ControllerDisabled);
        }
        if updated.pids_max.is_some() && !has(CgroupControllers::PIDS) {
            return Err(CgroupError::ControllerDisabled);
        }
        if updated.io_weight.is_some() && !has(CgroupControllers::IO) {
            return Err(CgroupError::ControllerDisabled);
        }

        // Validate CPU weight (1-10000)
        if let Some(weight) = updated.cpu_weight {
            if weight == 0 || weight > CPU_WEIGHT_MAX {
                return Err(CgroupError::InvalidLimit);
            }
        }
        // Validate CPU quota (period > 0, max > 0)
        if let Some((max, period)) = updated.cpu_max {
            if period == 0 || max == 0 {
                return Err(CgroupError::InvalidLimit);
            }
        }
        if let Some(weight) = updated.io_weight {
            if weight == 0 || weight > IO_WEIGHT_MAX {
                return Err(CgroupError::InvalidLimit);
            }
        }

        let mut memory = node.memory.limits;
        if let Some(v) = updated.memory_min {
            memory.min = v;
        }
        if let Some(v) = updated.memory_low {
            memory.low = v;
        }
        if let Some(v) = updated.memory_high {
            memory.high = Some(v);
        }
        if let Some(v) = updated.memory_max {
            memory.max = Some(v);
        }
        if !memory.is_ordered() {
            return Err(CgroupError::InvalidLimit);
        }

        let mut plan = Vec::new();
        let mut freed = BTreeMap::new();
        if let Some(max) = updated.memory_max {
            let usage = node.memory.usage;
            if max < usage {
                plan = self.reclaim_plan(id, usage - max);
                for (ctx, bytes) in &plan {
                    let Some(m) = self.members.get(ctx) else {
                        continue;
                    };
                    for cg in self.path_to_root(m.cgroup) {
                        *freed.entry(cg).or_insert(0) += *bytes;
                    }
                }
            }
            self.check_new_limit(id, Resource::Memory, max, &freed)?;
        }
        if let Some(max) = updated.pids_max {
            self.check_new_limit(id, Resource::Pids, max, &freed)?;
        }

        // Every check passed; only now give up the cache.
        for (ctx, bytes) in plan {
            self.uncharge_memory(ctx, bytes, MemoryKind::Cache);
        }

        let node = self.node_mut(id)?;
        if let Some(v) = updated.cpu_weight {
            node.cpu.weight = v;
        }
        if let Some(v) = updated.cpu_max {
            node.cpu.max = Some(v);
            node.cpu.throttled_this_period = false;
            node.cpu.period_used = 0;
        }
        if let Some(v) = updated.io_weight {
            node.io.weight = v;
        }
        if let Some(v) = updated.pids_max {
            node.pids.max = Some(v);
        }
        node.memory.limits = memory;
        self.refresh_pressure(id);
        Ok(())
    }

    pub fn set_oom_disable(&mut self, id: CgroupId, disable: bool) -> Result<()> {
        let node = self.node_mut(id)?;
        if !node.controllers.contains(CgroupControllers::MEMORY) {
            return Err(CgroupError::ControllerDisabled);
        }
        node.memory.oom_disable = disable;
        Ok(())
    }

    /// Replace the caps for `dev`.  All-`None` limits remove the entry.
    pub fn set_io_limits(&mut self, id: CgroupId, dev: DeviceNumber, limits: IoLimits) -> Result<()> {
        let node = self.node_mut(id)?;
        if !node.controllers.contains(CgroupControllers::IO) {
            return Err(CgroupError::ControllerDisabled);
        }
        if limits == IoLimits::default() {
            node.io.limits.remove(&dev);
            node.io.windows.remove(&dev);
        } else {
            node.io.limits.insert(dev, limits);
        }
        Ok(())
    }

    /// Replace the ordered device rule list.
    pub fn set_device_rules(&mut self, id: CgroupId, rules: Vec<DeviceRule>) -> Result<()> {
        let node = self.node_mut(id)?;
        if !node.controllers.contains(CgroupControllers::DEVICES) {
            return Err(CgroupError::ControllerDisabled);
        }
        node.device_rules = rules;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    /// Add a new context to `id`, counting it against every PIDs limit on
    /// the way to the root.
    pub fn attach_new(&mut self, id: CgroupId, ctx: ContextId) -> Result<()> {
        self.node(id)?;
        if self.members.contains_key(&ctx) {
            return Err(CgroupError::AlreadyAttached);
        }
        let path = self.path_to_root(id);
        if let Some((violator, _)) = self.check_headroom(&path, Resource::Pids, 1) {
            self.node_mut(violator)?.pids.events_max += 1;
            return Err(CgroupError::PidsLimitExceeded);
        }
        for cg in &path {
            self.node_mut(*cg)?.add_usage(Resource::Pids, 1);
        }
        self.node_mut(id)?.members.insert(ctx);
        self.members.insert(
            ctx,
            Membership {
                cgroup: id,
                anon: 0,
                cache: 0,
            },
        );
        Ok(())
    }

    /// Remove `ctx`, releasing its memory charge and PID count.
    pub fn detach(&mut self, ctx: ContextId) -> Result<Membership> {
        let member = self.members.remove(&ctx).ok_or(CgroupError::NotAttached)?;
        self.release(member.cgroup, member.charged(), 1);
        if let Some(node) = self.nodes.get_mut(&member.cgroup) {
            node.members.remove(&ctx);
        }
        Ok(member)
    }

    fn release(&mut self, id: CgroupId, bytes: u64, pids: u64) {
        for cg in self.path_to_root(id) {
            if let Some(node) = self.nodes.get_mut(&cg) {
                node.sub_usage(Resource::Memory, bytes);
                node.sub_usage(Resource::Pids, pids);
                Self::lower_pressure(node);
            }
        }
    }

    fn acquire(&mut self, id: CgroupId, bytes: u64, pids: u64) {
        for cg in self.path_to_root(id) {
            if let Some(node) = self.nodes.get_mut(&cg) {
                node.add_usage(Resource::Memory, bytes);
                node.add_usage(Resource::Pids, pids);
            }
            self.note_high(cg);
            self.refresh_pressure(cg);
        }
    }

    /// Move one member's worth of usage on or off `path`, with no events.
    fn shift_usage(&mut self, path: &[CgroupId], bytes: u64, add: bool) {
        for cg in path {
            if let Some(node) = self.nodes.get_mut(cg) {
                if add {
                    node.add_usage(Resource::Memory, bytes);
                    node.add_usage(Resource::Pids, 1);
                } else {
                    node.sub_usage(Resource::Memory, bytes);
                    node.sub_usage(Resource::Pids, 1);
                }
            }
        }
    }

    /// Move `ctx` from `src` to `dst`, carrying its memory charge.
    ///
    /// Either the whole move happens or nothing changes.
    ///
    /// # Errors
    ///
    /// * `NotAttached` - `ctx` is not in `src`
    /// * `PidsLimitExceeded` - A PIDs limit on the destination path is reached
    /// * `MemoryLimit` - The destination path can't hold the charge
    pub fn migrate(&mut self, src: CgroupId, dst: CgroupId, ctx: ContextId) -> Result<()> {
        self.node(dst)?;
        let member = *self.members.get(&ctx).ok_or(CgroupError::NotAttached)?;
        if member.cgroup != src {
            return Err(CgroupError::NotAttached);
        }
        if src == dst {
            return Ok(());
        }

        let bytes = member.charged();
        let src_path = self.path_to_root(src);
        let dst_path = self.path_to_root(dst);
        // Lift the charge off the source path without touching counters so
        // the destination check sees the shared ancestors as they will be.
        self.shift_usage(&src_path, bytes, false);
        let failure = if let Some((violator, _)) = self.check_headroom(&dst_path, Resource::Pids, 1) {
            self.node_mut(violator)?.pids.events_max += 1;
            Some(CgroupError::PidsLimitExceeded)
        } else {
            self.check_headroom(&dst_path, Resource::Memory, bytes)
                .map(|(cgroup, _)| CgroupError::MemoryLimit { cgroup })
        };
        if let Some(err) = failure {
            self.shift_usage(&src_path, bytes, true);
            return Err(err);
        }
        self.shift_usage(&dst_path, bytes, true);

        // Shared ancestors end where they started.
        for cg in src_path.iter().filter(|cg| !dst_path.contains(cg)) {
            if let Some(node) = self.nodes.get_mut(cg) {
                Self::lower_pressure(node);
            }
        }
        for cg in dst_path.iter().filter(|cg| !src_path.contains(cg)) {
            self.note_high(*cg);
            self.refresh_pressure(*cg);
        }

        self.node_mut(src)?.members.remove(&ctx);
        self.node_mut(dst)?.members.insert(ctx);
        if let Some(m) = self.members.get_mut(&ctx) {
            m.cgroup = dst;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------------

    fn note_high(&mut self, id: CgroupId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if !node.controllers.contains(CgroupControllers::MEMORY) {
                return;
            }
            if let Some(high) = node.memory.limits.high {
                if node.memory.usage > high {
                    node.memory.events_high += 1;
                }
            }
        }
    }

    /// Recompute the pressure band of `id`; upward moves queue an event.
    fn refresh_pressure(&mut self, id: CgroupId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let level = PressureLevel::from_usage(node.memory.usage, node.limit(Resource::Memory));
        let from = node.memory.pressure;
        node.memory.pressure = level;
        if level > from {
            klog!(Info, "cgroup: {} memory pressure {} -> {}", id, from, level);
            self.pending.push(KernelEvent::MemoryPressure { cgroup: id, from, to: level });
        }
    }

    fn lower_pressure(node: &mut Cgroup) {
        let level = PressureLevel::from_usage(node.memory.usage, node.limit(Resource::Memory));
        if level < node.memory.pressure {
            node.memory.pressure = level;
        }
    }

    /// Charge `bytes` to `ctx`: first check every ancestor, then increment
    /// every ancestor.  A violated `max` triggers reclaim in the violating
    /// subtree before the charge is refused.
    ///
    /// # Errors
    ///
    /// * `NotAttached` - `ctx` has no cgroup
    /// * `MemoryLimit` - Reclaim couldn't make room under the named cgroup
    pub fn charge_memory(&mut self, ctx: ContextId, bytes: u64, kind: MemoryKind) -> Result<()> {
        let cg = self.cgroup_of(ctx).ok_or(CgroupError::NotAttached)?;
        if bytes == 0 {
            return Ok(());
        }
        let path = self.path_to_root(cg);
        let mut counted = false;
        // Each pass either frees something or gives up.
        for _ in 0..=path.len() {
            let Some((violator, shortfall)) = self.check_headroom(&path, Resource::Memory, bytes) else {
                self.acquire(cg, bytes, 0);
                if let Some(m) = self.members.get_mut(&ctx) {
                    match kind {
                        MemoryKind::Anon => m.anon += bytes,
                        MemoryKind::Cache => m.cache += bytes,
                    }
                }
                return Ok(());
            };
            if !counted {
                self.node_mut(violator)?.memory.events_max += 1;
                counted = true;
            }
            if self.reclaim(violator, shortfall) == 0 {
                return Err(CgroupError::MemoryLimit { cgroup: violator });
            }
        }
        let (violator, _) = self
            .check_headroom(&path, Resource::Memory, bytes)
            .unwrap_or((cg, 0));
        Err(CgroupError::MemoryLimit { cgroup: violator })
    }

    /// Release up to `bytes` of `ctx`'s charge, cache first.  Never fails;
    /// returns what was actually released.
    pub fn uncharge_memory(&mut self, ctx: ContextId, bytes: u64, kind: MemoryKind) -> u64 {
        let Some(m) = self.members.get_mut(&ctx) else {
            return 0;
        };
        let slot = match kind {
            MemoryKind::Anon => &mut m.anon,
            MemoryKind::Cache => &mut m.cache,
        };
        let released = bytes.min(*slot);
        *slot -= released;
        let cg = m.cgroup;
        self.release(cg, released, 0);
        released
    }

    /// Page cache that a reclaim of `target` bytes under `id` would take,
    /// per context.  Cgroups whose usage is at or below their protection
    /// are skipped along with their subtrees.
    fn reclaim_plan(&self, id: CgroupId, target: u64) -> Vec<(ContextId, u64)> {
        let mut protected: BTreeSet<CgroupId> = BTreeSet::new();
        let mut victims: Vec<ContextId> = Vec::new();
        for cg in self.subtree(id) {
            let Some(node) = self.nodes.get(&cg) else {
                continue;
            };
            let shielded = node.parent.map_or(false, |p| protected.contains(&p))
                || (node.controllers.contains(CgroupControllers::MEMORY)
                    && node.memory.usage <= node.memory.limits.protection());
            if shielded {
                protected.insert(cg);
                continue;
            }
            victims.extend(node.members.iter().copied());
        }

        let mut plan = Vec::new();
        let mut planned = 0;
        for ctx in victims {
            if planned >= target {
                break;
            }
            let cache = self.members.get(&ctx).map_or(0, |m| m.cache);
            let take = cache.min(target - planned);
            if take > 0 {
                plan.push((ctx, take));
                planned += take;
            }
        }
        plan
    }

    /// Free up to `target` bytes of page cache from the subtree of `id`,
    /// skipping cgroups whose usage is at or below their protection.
    pub fn reclaim(&mut self, id: CgroupId, target: u64) -> u64 {
        let mut freed = 0;
        for (ctx, bytes) in self.reclaim_plan(id, target) {
            freed += self.uncharge_memory(ctx, bytes, MemoryKind::Cache);
        }
        if freed > 0 {
            klog!(Debug, "cgroup: reclaimed {} bytes under {}", freed, id);
        }
        freed
    }

    /// Members of the subtree of `id` with their charge.
    pub fn oom_members(&self, id: CgroupId) -> Vec<(ContextId, u64)> {
        self.subtree(id)
            .iter()
            .filter_map(|cg| self.nodes.get(cg))
            .flat_map(|n| n.members.iter().copied())
            .filter_map(|ctx| self.members.get(&ctx).map(|m| (ctx, m.charged())))
            .collect()
    }

    pub fn record_oom_kill(&mut self, id: CgroupId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.memory.oom_kills += 1;
        }
    }

    pub fn pressure(&self, id: CgroupId) -> Option<PressureLevel> {
        self.nodes.get(&id).map(|n| n.memory.pressure)
    }

    // ------------------------------------------------------------------------
    // CPU
    // ------------------------------------------------------------------------

    /// Account `usec` of CPU time to `ctx` at time `now_usec`.  Returns
    /// whether some ancestor is now over its quota for the current period.
    pub fn account_cpu(&mut self, ctx: ContextId, usec: u64, now_usec: u64) -> Result<bool> {
        let cg = self.cgroup_of(ctx).ok_or(CgroupError::NotAttached)?;
        let mut throttled = false;
        for id in self.path_to_root(cg) {
            let node = self.node_mut(id)?;
            node.cpu.usage_usec = node.cpu.usage_usec.saturating_add(usec);
            if !node.controllers.contains(CgroupControllers::CPU) {
                continue;
            }
            let Some((quota, period)) = node.cpu.max else {
                continue;
            };
            let cpu = &mut node.cpu;
            if now_usec >= cpu.period_start.saturating_add(period) {
                cpu.period_start = now_usec - (now_usec - cpu.period_start) % period;
                cpu.period_used = 0;
                cpu.throttled_this_period = false;
            }
            cpu.period_used = cpu.period_used.saturating_add(usec);
            if cpu.period_used > quota {
                cpu.throttled_usec += usec.min(cpu.period_used - quota);
                if !cpu.throttled_this_period {
                    cpu.throttled_periods += 1;
                    cpu.throttled_this_period = true;
                }
                throttled = true;
            }
        }
        Ok(throttled)
    }

    // ------------------------------------------------------------------------
    // I/O
    // ------------------------------------------------------------------------

    /// Count one I/O of `bytes` on `dev` against every cap on the path.
    ///
    /// Windows last `window` ticks.  Nothing is counted when refused.
    pub fn charge_io(
        &mut self,
        ctx: ContextId,
        dev: DeviceNumber,
        dir: IoDirection,
        bytes: u64,
        now: u64,
        window: u64,
    ) -> Result<()> {
        let cg = self.cgroup_of(ctx).ok_or(CgroupError::NotAttached)?;
        let path = self.path_to_root(cg);

        for id in &path {
            let node = self.node_mut(*id)?;
            if !node.controllers.contains(CgroupControllers::IO) {
                continue;
            }
            let Some(limits) = node.io.limits.get(&dev).copied() else {
                continue;
            };
            let w = node.io.windows.entry(dev).or_default();
            if now.saturating_sub(w.start) >= window {
                *w = IoWindow {
                    start: now,
                    ..Default::default()
                };
            }
            let (bps, iops, used_bytes, used_ios) = match dir {
                IoDirection::Read => (limits.read_bps, limits.read_iops, w.rbytes, w.rios),
                IoDirection::Write => (limits.write_bps, limits.write_iops, w.wbytes, w.wios),
            };
            let over_bps = bps.map_or(false, |cap| used_bytes.saturating_add(bytes) > cap);
            let over_iops = iops.map_or(false, |cap| used_ios + 1 > cap);
            if over_bps || over_iops {
                node.io.throttled += 1;
                klog!(Debug, "cgroup: {} throttled on {}", id, dev);
                return Err(CgroupError::IoThrottled);
            }
        }

        for id in &path {
            let node = self.node_mut(*id)?;
            let limited = node.controllers.contains(CgroupControllers::IO) && node.io.limits.contains_key(&dev);
            let io = &mut node.io;
            match dir {
                IoDirection::Read => {
                    io.rbytes += bytes;
                    io.rios += 1;
                }
                IoDirection::Write => {
                    io.wbytes += bytes;
                    io.wios += 1;
                }
            }
            if limited {
                if let Some(w) = io.windows.get_mut(&dev) {
                    match dir {
                        IoDirection::Read => {
                            w.rbytes += bytes;
                            w.rios += 1;
                        }
                        IoDirection::Write => {
                            w.wbytes += bytes;
                            w.wios += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Undo a [`charge_io`](Self::charge_io) whose transfer never happened.
    /// `cg` is the cgroup the charge was made against.
    pub fn refund_io(&mut self, cg: CgroupId, dev: DeviceNumber, dir: IoDirection, bytes: u64) {
        for id in self.path_to_root(cg) {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let io = &mut node.io;
            let window = io.windows.get_mut(&dev);
            match dir {
                IoDirection::Read => {
                    io.rbytes = io.rbytes.saturating_sub(bytes);
                    io.rios = io.rios.saturating_sub(1);
                    if let Some(w) = window {
                        w.rbytes = w.rbytes.saturating_sub(bytes);
                        w.rios = w.rios.saturating_sub(1);
                    }
                }
                IoDirection::Write => {
                    io.wbytes = io.wbytes.saturating_sub(bytes);
                    io.wios = io.wios.saturating_sub(1);
                    if let Some(w) = window {
                        w.wbytes = w.wbytes.saturating_sub(bytes);
                        w.wios = w.wios.saturating_sub(1);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    /// Evaluate the rule list of every ancestor with the devices controller.
    /// A non-empty list with no matching rule denies.
    pub fn check_device(&self, ctx: ContextId, kind: DeviceType, dev: DeviceNumber, access: DeviceAccess) -> Result<()> {
        let cg = self.cgroup_of(ctx).ok_or(CgroupError::NotAttached)?;
        for id in self.path_to_root(cg) {
            let node = self.node(id)?;
            if !node.controllers.contains(CgroupControllers::DEVICES) || node.device_rules.is_empty() {
                continue;
            }
            let allowed = node
                .device_rules
                .iter()
                .find(|r| r.matches(kind, dev, access))
                .map_or(false, |r| r.allow);
            if !allowed {
                return Err(CgroupError::DeviceDenied);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Freezer
    // ------------------------------------------------------------------------

    /// Set the freezer flag of `id`.  Returns whether it changed.
    pub fn freeze(&mut self, id: CgroupId) -> Result<bool> {
        self.set_frozen(id, true)
    }

    /// Clear the freezer flag of `id`.  Returns whether it changed.
    pub fn thaw(&mut self, id: CgroupId) -> Result<bool> {
        self.set_frozen(id, false)
    }

    fn set_frozen(&mut self, id: CgroupId, frozen: bool) -> Result<bool> {
        let node = self.node_mut(id)?;
        if !node.controllers.contains(CgroupControllers::FREEZER) {
            return Err(CgroupError::ControllerDisabled);
        }
        if node.self_frozen == frozen {
            return Ok(false);
        }
        node.self_frozen = frozen;
        if frozen {
            klog!(Info, "cgroup: {} frozen", id);
            self.pending.push(KernelEvent::Frozen { cgroup: id });
        } else {
            klog!(Info, "cgroup: {} thawed", id);
            self.pending.push(KernelEvent::Thawed { cgroup: id });
        }
        Ok(true)
    }

    /// Frozen when `id` or any ancestor is.
    pub fn is_frozen(&self, id: CgroupId) -> bool {
        self.path_to_root(id)
            .iter()
            .filter_map(|cg| self.nodes.get(cg))
            .any(|n| n.self_frozen)
    }

    pub fn stats(&self, id: CgroupId) -> Option<CgroupStats> {
        self.nodes.get(&id).map(|n| n.stats(self.is_frozen(id)))
    }
}

// ============================================================================
// Kernel operations
// ============================================================================

impl Kernel {
    pub fn register_cgroup_sink(&self, sink: Arc<dyn CgroupEventSink>) {
        self.cgroup_sinks.write().push(sink);
    }

    /// Run `f` on the cgroup table and publish whatever it queued.
    fn with_cgroups<R>(&self, f: impl FnOnce(&mut CgroupTable) -> Result<R>) -> core::result::Result<R, KernelError> {
        let (result, events) = {
            let mut cgroups = self.cgroups.write();
            let result = f(&mut cgroups);
            (result, cgroups.take_events())
        };
        self.publish(events);
        result.map_err(KernelError::from)
    }

    pub fn create_cgroup(
        &self,
        parent: CgroupId,
        name: &str,
        controllers: CgroupControllers,
    ) -> core::result::Result<CgroupId, KernelError> {
        self.with_cgroups(|cg| cg.create(parent, name, controllers))
    }

    pub fn delete_cgroup(&self, id: CgroupId) -> core::result::Result<(), KernelError> {
        self.with_cgroups(|cg| cg.delete(id))
    }

    pub fn enable_controllers(&self, id: CgroupId, controllers: CgroupControllers) -> core::result::Result<(), KernelError> {
        self.with_cgroups(|cg| cg.enable(id, controllers))
    }

    pub fn disable_controllers(&self, id: CgroupId, controllers: CgroupControllers) -> core::result::Result<(), KernelError> {
        self.with_cgroups(|cg| cg.disable(id, controllers))
    }

    pub fn set_cgroup_limits(&self, id: CgroupId, limits: &CgroupLimits) -> core::result::Result<(), KernelError> {
        self.with_cgroups(|cg| cg.set_limits(id, limits))
    }

    pub fn set_oom_disable(&self, id: CgroupId, disable: bool) -> core::result::Result<(), KernelError> {
        self.with_cgroups(|cg| cg.set_oom_disable(id, disable))
    }

    pub fn set_io_limits(&self, id: CgroupId, dev: DeviceNumber, limits: IoLimits) -> core::result::Result<(), KernelError> {
        self.with_cgroups(|cg| cg.set_io_limits(id, dev, limits))
    }

    pub fn set_device_rules(&self, id: CgroupId, rules: Vec<DeviceRule>) -> core::result::Result<(), KernelError> {
        self.with_cgroups(|cg| cg.set_device_rules(id, rules))
    }

    /// Move a live context into `dst` from wherever it is now.
    pub fn attach(&self, dst: CgroupId, ctx: ContextId) -> core::result::Result<(), KernelError> {
        self.processes.lock().live(ctx)?;
        self.with_cgroups(|cg| {
            let src = cg.cgroup_of(ctx).ok_or(CgroupError::NotAttached)?;
            cg.migrate(src, dst, ctx)
        })
    }

    pub fn migrate(&self, src: CgroupId, dst: CgroupId, ctx: ContextId) -> core::result::Result<(), KernelError> {
        self.processes.lock().live(ctx)?;
        self.with_cgroups(|cg| cg.migrate(src, dst, ctx))
    }

    /// Freeze `id`.  Contained contexts observe `Stopped` on their next
    /// dispatch.
    pub fn freeze(&self, id: CgroupId) -> core::result::Result<(), KernelError> {
        self.with_cgroups(|cg| cg.freeze(id).map(|_| ()))
    }

    pub fn thaw(&self, id: CgroupId) -> core::result::Result<(), KernelError> {
        self.with_cgroups(|cg| cg.thaw(id).map(|_| ()))
    }

    pub fn cgroup_of(&self, ctx: ContextId) -> Option<CgroupId> {
        self.cgroups.read().cgroup_of(ctx)
    }

    pub fn cgroup_path(&self, id: CgroupId) -> Option<String> {
        self.cgroups.read().path(id)
    }

    pub fn cgroup_lookup(&self, path: &str) -> Option<CgroupId> {
        self.cgroups.read().lookup(path)
    }

    pub fn cgroup_stats(&self, id: CgroupId) -> Option<CgroupStats> {
        self.cgroups.read().stats(id)
    }

    pub fn memory_pressure(&self, id: CgroupId) -> Option<PressureLevel> {
        self.cgroups.read().pressure(id)
    }

    pub fn context_frozen(&self, ctx: ContextId) -> bool {
        let cgroups = self.cgroups.read();
        cgroups.cgroup_of(ctx).map_or(false, |cg| cgroups.is_frozen(cg))
    }

    /// Charge memory to `ctx`, running the OOM killer on the violating
    /// cgroup when reclaim isn't enough.
    ///
    /// # Errors
    ///
    /// * `Cgroup(MemoryLimit)` - No room and OOM disabled, or no eligible victim
    /// * `Process(Killed)` - `ctx` itself was chosen as the victim
    pub fn charge_memory(&self, ctx: ContextId, bytes: u64, kind: MemoryKind) -> core::result::Result<(), KernelError> {
        let mut events = Vec::new();
        let result = {
            let mut procs = self.processes.lock();
            procs.live(ctx)?;
            self.charge_memory_locked(&mut procs, ctx, bytes, kind, &mut events)
        };
        self.publish(events);
        result
    }

    pub(crate) fn charge_memory_locked(
        &self,
        procs: &mut crate::process::ContextTable,
        ctx: ContextId,
        bytes: u64,
        kind: MemoryKind,
        events: &mut Vec<KernelEvent>,
    ) -> core::result::Result<(), KernelError> {
        let mut kills = 0;
        loop {
            let mut cgroups = self.cgroups.write();
            let result = cgroups.charge_memory(ctx, bytes, kind);
            events.extend(cgroups.take_events());
            let violator = match result {
                Ok(()) => return Ok(()),
                Err(CgroupError::MemoryLimit { cgroup }) => cgroup,
                Err(e) => return Err(e.into()),
            };
            let Some(node) = cgroups.get(violator) else {
                return Err(CgroupError::NotFound.into());
            };
            if node.oom_disabled() || kills >= MAX_OOM_KILLS {
                return Err(CgroupError::MemoryLimit { cgroup: violator }.into());
            }
            let limit = node.limit(Resource::Memory).unwrap_or(0);
            let usage = node.memory_usage();
            let candidates: Vec<OomCandidate> = cgroups
                .oom_members(violator)
                .into_iter()
                .filter_map(|(id, charged)| {
                    let c = procs.get(id).filter(|c| c.is_running())?;
                    Some(OomCandidate {
                        ctx: id,
                        usage: charged,
                        oom_score_adj: c.oom_score_adj(),
                        birth: c.birth(),
                    })
                })
                .collect();
            let Some(victim) = oom::select_victim(&candidates, limit) else {
                klog!(Error, "cgroup: {} out of memory with no eligible victim", violator);
                return Err(CgroupError::MemoryLimit { cgroup: violator }.into());
            };

            cgroups.record_oom_kill(violator);
            drop(cgroups);
            klog!(Error, "cgroup: {} out of memory, killing ctx {}", violator, victim);
            events.push(KernelEvent::OomKill {
                cgroup: violator,
                victim,
                usage,
                limit,
            });
            self.exit_locked(procs, victim, 128 + SIGKILL as i32, Some(SIGKILL), events)?;
            kills += 1;
            if victim == ctx {
                return Err(ProcessError::Killed.into());
            }
        }
    }

    /// Release memory charged to `ctx`.  Never fails; returns the amount
    /// actually released.
    pub fn uncharge_memory(&self, ctx: ContextId, bytes: u64, kind: MemoryKind) -> u64 {
        self.cgroups.write().uncharge_memory(ctx, bytes, kind)
    }

    /// Account CPU time to `ctx` at the current HAL time.  Returns whether
    /// the context's cgroup path is over quota.
    pub fn account_cpu(&self, ctx: ContextId, usec: u64) -> core::result::Result<bool, KernelError> {
        let now = self.hal.ticks_to_usec(self.hal.timer_ticks());
        let mut procs = self.processes.lock();
        let context = procs.live_mut(ctx)?;
        context.add_cpu_time(usec);
        let throttled = self.cgroups.write().account_cpu(ctx, usec, now)?;
        Ok(throttled)
    }
}
