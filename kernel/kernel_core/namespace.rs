//! Namespaces and namespace proxies.
//!
//! Six kinds of namespace (PID, mount, network, UTS, IPC, user) live in a
//! bounded arena addressed by [`NamespaceId`].  A context never points at a
//! namespace directly: it holds one reference on a [`Proxy`], and the proxy
//! holds one reference on a namespace of every kind.
//!
//! # Reference counts
//!
//! - A proxy's count is the number of contexts using it, plus any handle a
//!   caller obtained from [`NamespaceTable::create_proxy`] or
//!   [`NamespaceTable::unshare`] and hasn't yet given away.
//! - A namespace's count is the number of proxies naming it, plus one per
//!   child PID or user namespace naming it as parent.
//!
//! Reaching zero frees the slot and releases everything it references.  The
//! root proxy and the six root namespaces are pinned and never freed.
//!
//! # PID namespaces
//!
//! ```text
//! root (level 0)      ctx 7 -> pid 7
//!   └── child (1)     ctx 7 -> pid 1
//!         └── grandchild (2)
//! ```
//!
//! A context has a local pid in its own PID namespace and in every ancestor.
//! In the root namespace the local pid is the context id.  Contexts outside
//! a namespace's subtree have no pid in it and are invisible from it.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::process::ContextId;
use crate::{Kernel, KernelError};

// ============================================================================
// Constants
// ============================================================================

/// Maximum PID and user namespace nesting depth (root is level 0).
pub const MAX_NS_LEVEL: u8 = 32;

/// Longest hostname or domain name, in bytes.
pub const MAX_HOSTNAME_LEN: usize = 64;

/// Number of namespace kinds a proxy bundles.
pub const NS_KINDS: usize = 6;

bitflags! {
    /// `unshare` flags, numbered as on Linux.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloneFlags: u64 {
        const NEWNS   = 0x0002_0000;
        const NEWUTS  = 0x0400_0000;
        const NEWIPC  = 0x0800_0000;
        const NEWUSER = 0x1000_0000;
        const NEWPID  = 0x2000_0000;
        const NEWNET  = 0x4000_0000;
    }
}

// ============================================================================
// Handles
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespaceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProxyId(pub u32);

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NamespaceKind {
    Pid,
    Mount,
    Net,
    Uts,
    Ipc,
    User,
}

impl NamespaceKind {
    pub const ALL: [NamespaceKind; NS_KINDS] = [
        NamespaceKind::Pid,
        NamespaceKind::Mount,
        NamespaceKind::Net,
        NamespaceKind::Uts,
        NamespaceKind::Ipc,
        NamespaceKind::User,
    ];

    /// Slot in a proxy.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceKind::Pid => CloneFlags::NEWPID,
            NamespaceKind::Mount => CloneFlags::NEWNS,
            NamespaceKind::Net => CloneFlags::NEWNET,
            NamespaceKind::Uts => CloneFlags::NEWUTS,
            NamespaceKind::Ipc => CloneFlags::NEWIPC,
            NamespaceKind::User => CloneFlags::NEWUSER,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            NamespaceKind::Pid => "pid",
            NamespaceKind::Mount => "mnt",
            NamespaceKind::Net => "net",
            NamespaceKind::Uts => "uts",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::User => "user",
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceError {
    /// Namespace or proxy pool is full.
    PoolExhausted,
    /// Proxy handle doesn't name a live proxy.
    InvalidProxy,
    /// Namespace handle doesn't name a live namespace of the expected kind.
    InvalidNamespace,
    /// Nesting would exceed [`MAX_NS_LEVEL`].
    TooDeep,
    /// Unknown `unshare` flag bits.
    InvalidFlags,
    /// Hostname too long or not UTF-8.
    InvalidName,
    /// Context has no pid in the namespace.
    NotVisible,
    /// A reference count would go negative.
    RefcountUnderflow,
}

impl fmt::Display for NamespaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceError::PoolExhausted => write!(f, "namespace pool exhausted"),
            NamespaceError::InvalidProxy => write!(f, "invalid namespace proxy"),
            NamespaceError::InvalidNamespace => write!(f, "invalid namespace"),
            NamespaceError::TooDeep => write!(f, "namespace nesting exceeds {}", MAX_NS_LEVEL),
            NamespaceError::InvalidFlags => write!(f, "invalid unshare flags"),
            NamespaceError::InvalidName => write!(f, "invalid host or domain name"),
            NamespaceError::NotVisible => write!(f, "process not visible in namespace"),
            NamespaceError::RefcountUnderflow => write!(f, "namespace refcount underflow"),
        }
    }
}

pub type Result<T> = core::result::Result<T, NamespaceError>;

// ============================================================================
// Namespace Contents
// ============================================================================

/// Isolated pid numbering.
#[derive(Debug, Clone, Default)]
pub struct PidNamespace {
    parent: Option<NamespaceId>,
    level: u8,
    next_pid: u32,
    by_ctx: BTreeMap<ContextId, u32>,
    by_local: BTreeMap<u32, ContextId>,
}

impl PidNamespace {
    fn child_of(parent: NamespaceId, parent_level: u8) -> Self {
        PidNamespace {
            parent: Some(parent),
            level: parent_level + 1,
            next_pid: 1,
            ..Default::default()
        }
    }

    pub fn parent(&self) -> Option<NamespaceId> {
        self.parent
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Local pid of `ctx`, if visible here.
    pub fn pid_of(&self, ctx: ContextId) -> Option<u32> {
        self.by_ctx.get(&ctx).copied()
    }

    /// Context behind local pid `pid`.
    pub fn resolve(&self, pid: u32) -> Option<ContextId> {
        self.by_local.get(&pid).copied()
    }

    pub fn members(&self) -> impl Iterator<Item = ContextId> + '_ {
        self.by_ctx.keys().copied()
    }

    fn alloc_pid(&mut self, ctx: ContextId) -> u32 {
        if let Some(pid) = self.by_ctx.get(&ctx) {
            return *pid;
        }
        let pid = if self.is_root() {
            ctx
        } else {
            // At most one live pid per context, so a free number always
            // turns up within by_local.len() + 1 probes.
            while self.next_pid == 0 || self.by_local.contains_key(&self.next_pid) {
                self.next_pid = self.next_pid.wrapping_add(1);
            }
            let pid = self.next_pid;
            self.next_pid = self.next_pid.wrapping_add(1);
            pid
        };
        self.by_ctx.insert(ctx, pid);
        self.by_local.insert(pid, ctx);
        pid
    }

    fn remove(&mut self, ctx: ContextId) {
        if let Some(pid) = self.by_ctx.remove(&ctx) {
            self.by_local.remove(&pid);
        }
    }
}

/// One mount table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fstype: String,
}

impl MountEntry {
    pub fn new(source: &str, target: &str, fstype: &str) -> Self {
        MountEntry {
            source: String::from(source),
            target: String::from(target),
            fstype: String::from(fstype),
        }
    }
}

/// Private mount table, copied on unshare.
#[derive(Debug, Clone, Default)]
pub struct MountNamespace {
    mounts: Vec<MountEntry>,
}

impl MountNamespace {
    fn initial() -> Self {
        MountNamespace {
            mounts: alloc::vec![
                MountEntry::new("rootfs", "/", "rootfs"),
                MountEntry::new("proc", "/proc", "proc"),
                MountEntry::new("devfs", "/dev", "devfs"),
            ],
        }
    }

    pub fn mounts(&self) -> &[MountEntry] {
        &self.mounts
    }

    /// Add a mount, replacing any existing mount on the same target.
    pub fn mount(&mut self, entry: MountEntry) {
        self.mounts.retain(|m| m.target != entry.target);
        self.mounts.push(entry);
    }

    pub fn unmount(&mut self, target: &str) -> bool {
        let before = self.mounts.len();
        self.mounts.retain(|m| m.target != target);
        self.mounts.len() != before
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub index: u32,
    pub up: bool,
}

/// Network stack view.  Fresh namespaces start with loopback only.
#[derive(Debug, Clone)]
pub struct NetNamespace {
    interfaces: Vec<NetInterface>,
}

impl NetNamespace {
    fn fresh() -> Self {
        NetNamespace {
            interfaces: alloc::vec![NetInterface {
                name: String::from("lo"),
                index: 1,
                up: true,
            }],
        }
    }

    pub fn interfaces(&self) -> &[NetInterface] {
        &self.interfaces
    }

    /// Add an interface, returning its index.
    pub fn add_interface(&mut self, name: &str) -> u32 {
        let index = self.interfaces.iter().map(|i| i.index).max().unwrap_or(0) + 1;
        self.interfaces.push(NetInterface {
            name: String::from(name),
            index,
            up: false,
        });
        index
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtsNamespace {
    hostname: String,
    domainname: String,
}

fn check_name(name: &[u8]) -> Result<String> {
    if name.len() > MAX_HOSTNAME_LEN || name.contains(&0) {
        return Err(NamespaceError::InvalidName);
    }
    core::str::from_utf8(name)
        .map(String::from)
        .map_err(|_| NamespaceError::InvalidName)
}

impl UtsNamespace {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn domainname(&self) -> &str {
        &self.domainname
    }

    pub fn set_hostname(&mut self, name: &[u8]) -> Result<()> {
        self.hostname = check_name(name)?;
        Ok(())
    }

    pub fn set_domainname(&mut self, name: &[u8]) -> Result<()> {
        self.domainname = check_name(name)?;
        Ok(())
    }
}

/// IPC key space.
#[derive(Debug, Clone, Default)]
pub struct IpcNamespace {
    keys: BTreeMap<i32, u32>,
    next_id: u32,
}

impl IpcNamespace {
    /// Identifier for `key`, allocating one when `create` is set.
    pub fn key_get(&mut self, key: i32, create: bool) -> Option<u32> {
        if let Some(id) = self.keys.get(&key) {
            return Some(*id);
        }
        if !create {
            return None;
        }
        self.next_id += 1;
        self.keys.insert(key, self.next_id);
        Some(self.next_id)
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

#[derive(Debug, Clone)]
pub struct UserNamespace {
    parent: Option<NamespaceId>,
    level: u8,
    owner: ContextId,
}

impl UserNamespace {
    pub fn parent(&self) -> Option<NamespaceId> {
        self.parent
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// Context that created the namespace.
    pub fn owner(&self) -> ContextId {
        self.owner
    }
}

#[derive(Debug, Clone)]
pub enum Namespace {
    Pid(PidNamespace),
    Mount(MountNamespace),
    Net(NetNamespace),
    Uts(UtsNamespace),
    Ipc(IpcNamespace),
    User(UserNamespace),
}

impl Namespace {
    pub fn kind(&self) -> NamespaceKind {
        match self {
            Namespace::Pid(_) => NamespaceKind::Pid,
            Namespace::Mount(_) => NamespaceKind::Mount,
            Namespace::Net(_) => NamespaceKind::Net,
            Namespace::Uts(_) => NamespaceKind::Uts,
            Namespace::Ipc(_) => NamespaceKind::Ipc,
            Namespace::User(_) => NamespaceKind::User,
        }
    }

    /// Hierarchical parent, for the kinds that nest.
    fn parent(&self) -> Option<NamespaceId> {
        match self {
            Namespace::Pid(ns) => ns.parent,
            Namespace::User(ns) => ns.parent,
            _ => None,
        }
    }
}

// ============================================================================
// Arena
// ============================================================================

#[derive(Debug)]
struct NamespaceEntry {
    ns: Namespace,
    refcount: u32,
    pinned: bool,
}

/// One namespace of each kind, indexed by [`NamespaceKind::index`].
#[derive(Debug, Clone)]
pub struct Proxy {
    slots: [NamespaceId; NS_KINDS],
    refcount: u32,
    pinned: bool,
}

impl Proxy {
    pub fn namespace(&self, kind: NamespaceKind) -> NamespaceId {
        self.slots[kind.index()]
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }
}

/// Every namespace and proxy in the system.
pub struct NamespaceTable {
    namespaces: Vec<Option<NamespaceEntry>>,
    proxies: Vec<Option<Proxy>>,
    max_namespaces: usize,
    max_proxies: usize,
    root: ProxyId,
}

impl NamespaceTable {
    /// Build the pinned root namespaces and the root proxy.
    pub fn new(max_namespaces: usize, max_proxies: usize, hostname: &str) -> Result<Self> {
        if max_namespaces < NS_KINDS || max_proxies == 0 {
            return Err(NamespaceError::PoolExhausted);
        }
        let uts = UtsNamespace {
            hostname: check_name(hostname.as_bytes())?,
            domainname: String::from("(none)"),
        };
        let roots = [
            Namespace::Pid(PidNamespace::default()),
            Namespace::Mount(MountNamespace::initial()),
            Namespace::Net(NetNamespace::fresh()),
            Namespace::Uts(uts),
            Namespace::Ipc(IpcNamespace::default()),
            Namespace::User(UserNamespace {
                parent: None,
                level: 0,
                owner: crate::process::KERNEL_CONTEXT,
            }),
        ];
        let mut table = NamespaceTable {
            namespaces: Vec::with_capacity(max_namespaces),
            proxies: Vec::with_capacity(max_proxies),
            max_namespaces,
            max_proxies,
            root: ProxyId(0),
        };
        let mut slots = [NamespaceId(0); NS_KINDS];
        for (i, ns) in roots.into_iter().enumerate() {
            slots[i] = NamespaceId(table.namespaces.len() as u32);
            table.namespaces.push(Some(NamespaceEntry {
                ns,
                refcount: 1,
                pinned: true,
            }));
        }
        table.proxies.push(Some(Proxy {
            slots,
            refcount: 0,
            pinned: true,
        }));
        Ok(table)
    }

    pub fn root_proxy(&self) -> ProxyId {
        self.root
    }

    pub fn proxy(&self, id: ProxyId) -> Option<&Proxy> {
        self.proxies.get(id.0 as usize).and_then(|p| p.as_ref())
    }

    pub fn namespace(&self, id: NamespaceId) -> Option<&Namespace> {
        self.namespaces
            .get(id.0 as usize)
            .and_then(|e| e.as_ref())
            .map(|e| &e.ns)
    }

    fn namespace_mut(&mut self, id: NamespaceId) -> Option<&mut Namespace> {
        self.namespaces
            .get_mut(id.0 as usize)
            .and_then(|e| e.as_mut())
            .map(|e| &mut e.ns)
    }

    pub fn proxy_refcount(&self, id: ProxyId) -> Option<u32> {
        self.proxy(id).map(|p| p.refcount)
    }

    pub fn namespace_refcount(&self, id: NamespaceId) -> Option<u32> {
        self.namespaces
            .get(id.0 as usize)
            .and_then(|e| e.as_ref())
            .map(|e| e.refcount)
    }

    /// Live proxies with their ids.
    pub fn proxies(&self) -> impl Iterator<Item = (ProxyId, &Proxy)> {
        self.proxies
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().map(|p| (ProxyId(i as u32), p)))
    }

    pub fn live_namespaces(&self) -> usize {
        self.namespaces.iter().filter(|e| e.is_some()).count()
    }

    pub fn live_proxies(&self) -> usize {
        self.proxies.iter().filter(|p| p.is_some()).count()
    }

    // ------------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------------

    /// Take a reference on `id`, on behalf of a context.
    pub fn get_proxy(&mut self, id: ProxyId) -> Result<()> {
        let proxy = self
            .proxies
            .get_mut(id.0 as usize)
            .and_then(|p| p.as_mut())
            .ok_or(NamespaceError::InvalidProxy)?;
        proxy.refcount += 1;
        Ok(())
    }

    /// Drop one reference on `id`.  At zero the proxy is reclaimed and each
    /// of its namespaces loses a reference.
    pub fn free_proxy(&mut self, id: ProxyId) -> Result<()> {
        let slot = self
            .proxies
            .get_mut(id.0 as usize)
            .ok_or(NamespaceError::InvalidProxy)?;
        let proxy = slot.as_mut().ok_or(NamespaceError::InvalidProxy)?;
        if proxy.refcount == 0 {
            klog_force!("namespace: refcount underflow on {}", id);
            return Err(NamespaceError::RefcountUnderflow);
        }
        proxy.refcount -= 1;
        if proxy.refcount > 0 || proxy.pinned {
            return Ok(());
        }
        let slots = proxy.slots;
        *slot = None;
        klog!(Debug, "namespace: reclaimed {}", id);
        for ns in slots {
            self.put_namespace(ns)?;
        }
        Ok(())
    }

    fn get_namespace(&mut self, id: NamespaceId) -> Result<()> {
        let entry = self
            .namespaces
            .get_mut(id.0 as usize)
            .and_then(|e| e.as_mut())
            .ok_or(NamespaceError::InvalidNamespace)?;
        entry.refcount += 1;
        Ok(())
    }

    fn put_namespace(&mut self, id: NamespaceId) -> Result<()> {
        let mut next = Some(id);
        // Iterative so a deep PID chain can't recurse.
        while let Some(id) = next.take() {
            let slot = self
                .namespaces
                .get_mut(id.0 as usize)
                .ok_or(NamespaceError::InvalidNamespace)?;
            let entry = slot.as_mut().ok_or(NamespaceError::InvalidNamespace)?;
            if entry.refcount == 0 {
                klog_force!("namespace: refcount underflow on ns {}", id.0);
                return Err(NamespaceError::RefcountUnderflow);
            }
            entry.refcount -= 1;
            if entry.refcount == 0 && !entry.pinned {
                next = entry.ns.parent();
                *slot = None;
            }
        }
        Ok(())
    }

    fn free_namespace_slots(&self) -> usize {
        let free = self.namespaces.iter().filter(|e| e.is_none()).count();
        free + (self.max_namespaces - self.namespaces.len())
    }

    fn insert_namespace(&mut self, ns: Namespace) -> NamespaceId {
        let entry = Some(NamespaceEntry {
            ns,
            refcount: 1,
            pinned: false,
        });
        if let Some(i) = self.namespaces.iter().position(|e| e.is_none()) {
            self.namespaces[i] = entry;
            NamespaceId(i as u32)
        } else {
            self.namespaces.push(entry);
            NamespaceId(self.namespaces.len() as u32 - 1)
        }
    }

    fn insert_proxy(&mut self, proxy: Proxy) -> Result<ProxyId> {
        if let Some(i) = self.proxies.iter().position(|p| p.is_none()) {
            self.proxies[i] = Some(proxy);
            Ok(ProxyId(i as u32))
        } else if self.proxies.len() < self.max_proxies {
            self.proxies.push(Some(proxy));
            Ok(ProxyId(self.proxies.len() as u32 - 1))
        } else {
            Err(NamespaceError::PoolExhausted)
        }
    }

    fn has_free_proxy(&self) -> bool {
        self.proxies.len() < self.max_proxies || self.proxies.iter().any(|p| p.is_none())
    }

    // ------------------------------------------------------------------------
    // Proxy operations
    // ------------------------------------------------------------------------

    /// New proxy sharing every namespace of `from`.
    ///
    /// The caller owns the single reference on the result.
    pub fn create_proxy(&mut self, from: ProxyId) -> Result<ProxyId> {
        let slots = self.proxy(from).ok_or(NamespaceError::InvalidProxy)?.slots;
        let id = self.insert_proxy(Proxy {
            slots,
            refcount: 1,
            pinned: false,
        })?;
        for ns in slots {
            self.get_namespace(ns)?;
        }
        Ok(id)
    }

    /// New proxy with a fresh namespace for every kind named in `flags`; the
    /// rest are shared with `from`.  `owner` is recorded on a new user
    /// namespace.
    ///
    /// Either everything is allocated or nothing changes.  The caller owns
    /// the single reference on the result.
    pub fn unshare(&mut self, from: ProxyId, flags: CloneFlags, owner: ContextId) -> Result<ProxyId> {
        let base = self.proxy(from).ok_or(NamespaceError::InvalidProxy)?.slots;
        let kinds: Vec<NamespaceKind> = NamespaceKind::ALL
            .iter()
            .copied()
            .filter(|k| flags.contains(k.clone_flag()))
            .collect();

        // Check every failure condition before touching the arena.
        if !self.has_free_proxy() || self.free_namespace_slots() < kinds.len() {
            return Err(NamespaceError::PoolExhausted);
        }
        let mut fresh = Vec::with_capacity(kinds.len());
        for &kind in &kinds {
            let current = base[kind.index()];
            let ns = match self.namespace(current).ok_or(NamespaceError::InvalidNamespace)? {
                Namespace::Pid(parent) => {
                    if parent.level >= MAX_NS_LEVEL {
                        return Err(NamespaceError::TooDeep);
                    }
                    Namespace::Pid(PidNamespace::child_of(current, parent.level))
                }
                Namespace::User(parent) => {
                    if parent.level >= MAX_NS_LEVEL {
                        return Err(NamespaceError::TooDeep);
                    }
                    Namespace::User(UserNamespace {
                        parent: Some(current),
                        level: parent.level + 1,
                        owner,
                    })
                }
                Namespace::Mount(mnt) => Namespace::Mount(mnt.clone()),
                Namespace::Uts(uts) => Namespace::Uts(uts.clone()),
                Namespace::Net(_) => Namespace::Net(NetNamespace::fresh()),
                Namespace::Ipc(_) => Namespace::Ipc(IpcNamespace::default()),
            };
            fresh.push((kind, ns));
        }

        let mut slots = base;
        for (kind, ns) in fresh {
            if let Some(parent) = ns.parent() {
                self.get_namespace(parent)?;
            }
            slots[kind.index()] = self.insert_namespace(ns);
        }
        for kind in NamespaceKind::ALL {
            if !flags.contains(kind.clone_flag()) {
                self.get_namespace(slots[kind.index()])?;
            }
        }
        let id = self.insert_proxy(Proxy {
            slots,
            refcount: 1,
            pinned: false,
        })?;
        klog!(Debug, "namespace: unshare {:?} -> {}", flags, id);
        Ok(id)
    }

    // ------------------------------------------------------------------------
    // Typed views
    // ------------------------------------------------------------------------

    fn slot(&self, proxy: ProxyId, kind: NamespaceKind) -> Result<NamespaceId> {
        self.proxy(proxy)
            .map(|p| p.namespace(kind))
            .ok_or(NamespaceError::InvalidProxy)
    }

    pub fn uts(&self, proxy: ProxyId) -> Result<&UtsNamespace> {
        match self.namespace(self.slot(proxy, NamespaceKind::Uts)?) {
            Some(Namespace::Uts(uts)) => Ok(uts),
            _ => Err(NamespaceError::InvalidNamespace),
        }
    }

    pub fn uts_mut(&mut self, proxy: ProxyId) -> Result<&mut UtsNamespace> {
        let id = self.slot(proxy, NamespaceKind::Uts)?;
        match self.namespace_mut(id) {
            Some(Namespace::Uts(uts)) => Ok(uts),
            _ => Err(NamespaceError::InvalidNamespace),
        }
    }

    pub fn mount_ns(&self, proxy: ProxyId) -> Result<&MountNamespace> {
        match self.namespace(self.slot(proxy, NamespaceKind::Mount)?) {
            Some(Namespace::Mount(mnt)) => Ok(mnt),
            _ => Err(NamespaceError::InvalidNamespace),
        }
    }

    pub fn mount_ns_mut(&mut self, proxy: ProxyId) -> Result<&mut MountNamespace> {
        let id = self.slot(proxy, NamespaceKind::Mount)?;
        match self.namespace_mut(id) {
            Some(Namespace::Mount(mnt)) => Ok(mnt),
            _ => Err(NamespaceError::InvalidNamespace),
        }
    }

    pub fn net_ns(&self, proxy: ProxyId) -> Result<&NetNamespace> {
        match self.namespace(self.slot(proxy, NamespaceKind::Net)?) {
            Some(Namespace::Net(net)) => Ok(net),
            _ => Err(NamespaceError::InvalidNamespace),
        }
    }

    pub fn ipc_ns_mut(&mut self, proxy: ProxyId) -> Result<&mut IpcNamespace> {
        let id = self.slot(proxy, NamespaceKind::Ipc)?;
        match self.namespace_mut(id) {
            Some(Namespace::Ipc(ipc)) => Ok(ipc),
            _ => Err(NamespaceError::InvalidNamespace),
        }
    }

    pub fn user_ns(&self, proxy: ProxyId) -> Result<&UserNamespace> {
        match self.namespace(self.slot(proxy, NamespaceKind::User)?) {
            Some(Namespace::User(user)) => Ok(user),
            _ => Err(NamespaceError::InvalidNamespace),
        }
    }

    pub fn pid_ns_id(&self, proxy: ProxyId) -> Result<NamespaceId> {
        self.slot(proxy, NamespaceKind::Pid)
    }

    fn pid_ns(&self, id: NamespaceId) -> Result<&PidNamespace> {
        match self.namespace(id) {
            Some(Namespace::Pid(pid)) => Ok(pid),
            _ => Err(NamespaceError::InvalidNamespace),
        }
    }

    fn pid_ns_mut(&mut self, id: NamespaceId) -> Result<&mut PidNamespace> {
        match self.namespace_mut(id) {
            Some(Namespace::Pid(pid)) => Ok(pid),
            _ => Err(NamespaceError::InvalidNamespace),
        }
    }

    // ------------------------------------------------------------------------
    // PID translation
    // ------------------------------------------------------------------------

    /// `ns` followed by each of its ancestors up to the root.
    fn pid_chain(&self, ns: NamespaceId) -> Result<Vec<NamespaceId>> {
        let mut chain = Vec::new();
        let mut cur = Some(ns);
        while let Some(id) = cur {
            chain.push(id);
            cur = self.pid_ns(id)?.parent;
        }
        Ok(chain)
    }

    /// Give `ctx` a pid in the PID namespace of `proxy` and every ancestor,
    /// and drop any pid it holds elsewhere.  Returns the innermost pid.
    pub fn assign_pid_chain(&mut self, proxy: ProxyId, ctx: ContextId) -> Result<u32> {
        let ns = self.pid_ns_id(proxy)?;
        let chain = self.pid_chain(ns)?;
        for entry in self.namespaces.iter_mut().enumerate().filter_map(|(i, e)| {
            e.as_mut()
                .filter(|_| !chain.contains(&NamespaceId(i as u32)))
        }) {
            if let Namespace::Pid(pid_ns) = &mut entry.ns {
                pid_ns.remove(ctx);
            }
        }
        let mut innermost = 0;
        for (depth, id) in chain.iter().enumerate() {
            let pid = self.pid_ns_mut(*id)?.alloc_pid(ctx);
            if depth == 0 {
                innermost = pid;
            }
        }
        Ok(innermost)
    }

    /// Remove `ctx` from every PID namespace.
    pub fn forget_pid(&mut self, ctx: ContextId) {
        for entry in self.namespaces.iter_mut().flatten() {
            if let Namespace::Pid(pid_ns) = &mut entry.ns {
                pid_ns.remove(ctx);
            }
        }
    }

    /// `ctx`'s pid as seen through `viewer`'s PID namespace.
    pub fn pid_in(&self, viewer: ProxyId, ctx: ContextId) -> Result<u32> {
        self.pid_ns(self.pid_ns_id(viewer)?)?
            .pid_of(ctx)
            .ok_or(NamespaceError::NotVisible)
    }

    /// The context behind local pid `pid` in `viewer`'s PID namespace.
    pub fn resolve_pid(&self, viewer: ProxyId, pid: u32) -> Result<ContextId> {
        self.pid_ns(self.pid_ns_id(viewer)?)?
            .resolve(pid)
            .ok_or(NamespaceError::NotVisible)
    }

    pub fn pid_level(&self, proxy: ProxyId) -> Result<u8> {
        Ok(self.pid_ns(self.pid_ns_id(proxy)?)?.level)
    }
}

// ============================================================================
// Kernel operations
// ============================================================================

impl Kernel {
    /// The proxy `ctx` currently uses.
    pub fn proxy_of(&self, ctx: ContextId) -> core::result::Result<ProxyId, KernelError> {
        Ok(self.processes.lock().live(ctx)?.proxy())
    }

    /// A new proxy sharing every namespace with `ctx`'s.  The caller owns
    /// the returned handle and must free it or hand it to [`Kernel::setns`].
    pub fn create_proxy(&self, ctx: ContextId) -> core::result::Result<ProxyId, KernelError> {
        let procs = self.processes.lock();
        let proxy = procs.live(ctx)?.proxy();
        Ok(self.namespaces.lock().create_proxy(proxy)?)
    }

    /// Drop one reference on `proxy`.
    pub fn free_proxy(&self, proxy: ProxyId) -> core::result::Result<(), KernelError> {
        Ok(self.namespaces.lock().free_proxy(proxy)?)
    }

    /// Move `ctx` into fresh namespaces for every kind in `flags`.
    ///
    /// With `NEWPID` the caller becomes pid 1 of the new PID namespace.
    /// On failure nothing changes.
    pub fn unshare(&self, ctx: ContextId, flags: CloneFlags) -> core::result::Result<ProxyId, KernelError> {
        let mut procs = self.processes.lock();
        let old = procs.live(ctx)?.proxy();
        let mut ns = self.namespaces.lock();
        let new = ns.unshare(old, flags, ctx)?;
        if flags.contains(CloneFlags::NEWPID) {
            if let Err(e) = ns.assign_pid_chain(new, ctx) {
                let _ = ns.free_proxy(new);
                let _ = ns.assign_pid_chain(old, ctx);
                return Err(e.into());
            }
        }
        if let Err(e) = ns.free_proxy(old) {
            klog_force!("namespace: ctx {} released {}: {}", ctx, old, e);
        }
        procs.live_mut(ctx)?.set_proxy(new);
        klog!(Debug, "namespace: ctx {} unshared {:?} -> {}", ctx, flags, new);
        Ok(new)
    }

    /// Switch `ctx` to `target`, taking a reference on it and dropping the
    /// one on the old proxy.
    pub fn setns(&self, ctx: ContextId, target: ProxyId) -> core::result::Result<(), KernelError> {
        let mut procs = self.processes.lock();
        let old = procs.live(ctx)?.proxy();
        if old == target {
            return Ok(());
        }
        let mut ns = self.namespaces.lock();
        ns.get_proxy(target)?;
        if let Err(e) = ns.assign_pid_chain(target, ctx) {
            let _ = ns.free_proxy(target);
            return Err(e.into());
        }
        if let Err(e) = ns.free_proxy(old) {
            klog_force!("namespace: ctx {} released {}: {}", ctx, old, e);
        }
        procs.live_mut(ctx)?.set_proxy(target);
        Ok(())
    }

    /// Hostname in `ctx`'s UTS view.
    pub fn hostname(&self, ctx: ContextId) -> core::result::Result<String, KernelError> {
        let proxy = self.proxy_of(ctx)?;
        Ok(String::from(self.namespaces.lock().uts(proxy)?.hostname()))
    }

    pub fn set_hostname(&self, ctx: ContextId, name: &[u8]) -> core::result::Result<(), KernelError> {
        let proxy = self.proxy_of(ctx)?;
        Ok(self.namespaces.lock().uts_mut(proxy)?.set_hostname(name)?)
    }

    pub fn mounts(&self, ctx: ContextId) -> core::result::Result<Vec<MountEntry>, KernelError> {
        let proxy = self.proxy_of(ctx)?;
        Ok(self.namespaces.lock().mount_ns(proxy)?.mounts().to_vec())
    }

    pub fn mount(&self, ctx: ContextId, entry: MountEntry) -> core::result::Result<(), KernelError> {
        let proxy = self.proxy_of(ctx)?;
        self.namespaces.lock().mount_ns_mut(proxy)?.mount(entry);
        Ok(())
    }

    /// `target`'s pid as seen by `viewer`.
    pub fn pid_of(&self, viewer: ContextId, target: ContextId) -> core::result::Result<u32, KernelError> {
        let procs = self.processes.lock();
        let proxy = procs.live(viewer)?.proxy();
        Ok(self.namespaces.lock().pid_in(proxy, target)?)
    }

    /// The context `viewer` calls `pid`.
    pub fn resolve_pid(&self, viewer: ContextId, pid: u32) -> core::result::Result<ContextId, KernelError> {
        let procs = self.processes.lock();
        let proxy = procs.live(viewer)?.proxy();
        Ok(self.namespaces.lock().resolve_pid(proxy, pid)?)
    }

    pub fn proxy_refcount(&self, proxy: ProxyId) -> Option<u32> {
        self.namespaces.lock().proxy_refcount(proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> NamespaceTable {
        NamespaceTable::new(32, 8, "limitless").unwrap()
    }

    fn refcounts(t: &NamespaceTable, p: ProxyId) -> Vec<u32> {
        let proxy = t.proxy(p).unwrap();
        NamespaceKind::ALL
            .iter()
            .map(|k| t.namespace_refcount(proxy.namespace(*k)).unwrap())
            .collect()
    }

    #[test]
    fn test_create_then_free_restores_refcounts() {
        let mut t = table();
        let root = t.root_proxy();
        let before = refcounts(&t, root);
        let p = t.create_proxy(root).unwrap();
        assert_eq!(refcounts(&t, root), before.iter().map(|c| c + 1).collect::<Vec<_>>());
        t.free_proxy(p).unwrap();
        assert_eq!(refcounts(&t, root), before);
        assert!(t.proxy(p).is_none());
        assert_eq!(t.free_proxy(p), Err(NamespaceError::InvalidProxy));
    }

    #[test]
    fn test_unshare_uts_copies_then_diverges() {
        let mut t = table();
        let root = t.root_proxy();
        let p = t.unshare(root, CloneFlags::NEWUTS, 2).unwrap();
        assert_eq!(t.uts(p).unwrap().hostname(), "limitless");
        t.uts_mut(p).unwrap().set_hostname(b"node-a").unwrap();
        assert_eq!(t.uts(p).unwrap().hostname(), "node-a");
        assert_eq!(t.uts(root).unwrap().hostname(), "limitless");

        let uts = t.proxy(p).unwrap().namespace(NamespaceKind::Uts);
        t.free_proxy(p).unwrap();
        assert!(t.namespace(uts).is_none());
        assert_eq!(t.live_namespaces(), NS_KINDS);
    }

    #[test]
    fn test_unshare_fresh_contents() {
        let mut t = table();
        let root = t.root_proxy();
        t.net_ns(root).unwrap();
        t.ipc_ns_mut(root).unwrap().key_get(42, true);
        t.mount_ns_mut(root).unwrap().mount(MountEntry::new("tmpfs", "/tmp", "tmpfs"));

        let all = CloneFlags::all();
        let p = t.unshare(root, all, 5).unwrap();
        assert_eq!(t.net_ns(p).unwrap().interfaces().len(), 1);
        assert_eq!(t.ipc_ns_mut(p).unwrap().key_count(), 0);
        assert_eq!(t.mount_ns(p).unwrap().mounts().len(), 4);
        assert_eq!(t.user_ns(p).unwrap().owner(), 5);
        assert_eq!(t.user_ns(p).unwrap().level(), 1);
        assert_eq!(t.pid_level(p).unwrap(), 1);
    }

    #[test]
    fn test_unshare_exhaustion_rolls_back() {
        let mut t = NamespaceTable::new(NS_KINDS + 1, 8, "h").unwrap();
        let root = t.root_proxy();
        let before = refcounts(&t, root);
        assert_eq!(
            t.unshare(root, CloneFlags::NEWUTS | CloneFlags::NEWNET, 2),
            Err(NamespaceError::PoolExhausted)
        );
        assert_eq!(refcounts(&t, root), before);
        assert_eq!(t.live_namespaces(), NS_KINDS);
        assert_eq!(t.live_proxies(), 1);
    }

    #[test]
    fn test_pid_chain_and_visibility() {
        let mut t = table();
        let root = t.root_proxy();
        assert_eq!(t.assign_pid_chain(root, 7).unwrap(), 7);

        let child = t.unshare(root, CloneFlags::NEWPID, 7).unwrap();
        assert_eq!(t.assign_pid_chain(child, 7).unwrap(), 1);
        assert_eq!(t.assign_pid_chain(child, 9).unwrap(), 2);
        assert_eq!(t.pid_in(root, 9).unwrap(), 9);
        assert_eq!(t.resolve_pid(child, 2).unwrap(), 9);

        // Root-only context is invisible from the child namespace.
        t.assign_pid_chain(root, 4).unwrap();
        assert_eq!(t.pid_in(child, 4), Err(NamespaceError::NotVisible));
        assert_eq!(t.resolve_pid(child, 4), Err(NamespaceError::NotVisible));

        // Moving back to root drops the child-namespace pid.
        t.assign_pid_chain(root, 9).unwrap();
        assert_eq!(t.resolve_pid(child, 2), Err(NamespaceError::NotVisible));

        t.forget_pid(7);
        assert_eq!(t.pid_in(root, 7), Err(NamespaceError::NotVisible));
    }

    #[test]
    fn test_child_pid_namespace_holds_parent() {
        let mut t = table();
        let root = t.root_proxy();
        let a = t.unshare(root, CloneFlags::NEWPID, 2).unwrap();
        let a_ns = t.pid_ns_id(a).unwrap();
        let b = t.unshare(a, CloneFlags::NEWPID, 2).unwrap();
        t.free_proxy(a).unwrap();
        // Still referenced as b's parent.
        assert!(t.namespace(a_ns).is_some());
        t.free_proxy(b).unwrap();
        assert!(t.namespace(a_ns).is_none());
        assert_eq!(t.live_namespaces(), NS_KINDS);
    }

    #[test]
    fn test_nesting_limit() {
        let mut t = NamespaceTable::new(64, 64, "h").unwrap();
        let mut p = t.root_proxy();
        for _ in 0..MAX_NS_LEVEL {
            p = t.unshare(p, CloneFlags::NEWPID, 2).unwrap();
        }
        assert_eq!(t.unshare(p, CloneFlags::NEWPID, 2), Err(NamespaceError::TooDeep));
    }

    #[test]
    fn test_hostname_validation() {
        let mut t = table();
        let root = t.root_proxy();
        let uts = t.uts_mut(root).unwrap();
        assert_eq!(uts.set_hostname(&[b'a'; MAX_HOSTNAME_LEN + 1]), Err(NamespaceError::InvalidName));
        assert_eq!(uts.set_hostname(b"bad\0name"), Err(NamespaceError::InvalidName));
        uts.set_domainname(b"example.org").unwrap();
        assert_eq!(uts.domainname(), "example.org");
        assert_eq!(uts.hostname(), "limitless");
    }

    #[test]
    fn test_root_proxy_is_pinned() {
        let mut t = table();
        let root = t.root_proxy();
        t.get_proxy(root).unwrap();
        t.free_proxy(root).unwrap();
        assert!(t.proxy(root).is_some());
        assert_eq!(t.free_proxy(root), Err(NamespaceError::RefcountUnderflow));
    }
}
