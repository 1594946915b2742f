//! Capability enumeration and bit sets.
//!
//! Numbering follows the Linux capability ABI so masks exchanged through
//! `capget`/`capset` line up bit for bit.

use core::fmt;

use bitflags::bitflags;

// ============================================================================
// Capability enumeration
// ============================================================================

/// A named privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Capability {
    Chown = 0,
    DacOverride = 1,
    DacReadSearch = 2,
    Fowner = 3,
    Fsetid = 4,
    /// Send signals to contexts that are neither self nor a child.
    Kill = 5,
    Setgid = 6,
    Setuid = 7,
    /// Grow the permitted set through `capset`.
    Setpcap = 8,
    LinuxImmutable = 9,
    NetBindService = 10,
    NetBroadcast = 11,
    /// Network administration.
    NetAdmin = 12,
    NetRaw = 13,
    IpcLock = 14,
    IpcOwner = 15,
    SysModule = 16,
    /// Raw device I/O.
    SysRawio = 17,
    SysChroot = 18,
    SysPtrace = 19,
    SysPacct = 20,
    /// Namespace, hostname and general system administration.
    SysAdmin = 21,
    SysBoot = 22,
    SysNice = 23,
    /// Override resource limits.
    SysResource = 24,
    SysTime = 25,
    SysTtyConfig = 26,
    Mknod = 27,
    Lease = 28,
    AuditWrite = 29,
    AuditControl = 30,
    Setfcap = 31,
    /// Bypass MAC decisions.
    MacOverride = 32,
    /// Load and revoke MAC policy.
    MacAdmin = 33,
    Syslog = 34,
    WakeAlarm = 35,
    BlockSuspend = 36,
    AuditRead = 37,
}

/// Number of defined capabilities.
pub const CAP_COUNT: usize = 38;

/// Highest defined capability number.
pub const CAP_LAST: u8 = 37;

impl Capability {
    /// Every capability in numeric order.
    pub const ALL: [Capability; CAP_COUNT] = [
        Capability::Chown,
        Capability::DacOverride,
        Capability::DacReadSearch,
        Capability::Fowner,
        Capability::Fsetid,
        Capability::Kill,
        Capability::Setgid,
        Capability::Setuid,
        Capability::Setpcap,
        Capability::LinuxImmutable,
        Capability::NetBindService,
        Capability::NetBroadcast,
        Capability::NetAdmin,
        Capability::NetRaw,
        Capability::IpcLock,
        Capability::IpcOwner,
        Capability::SysModule,
        Capability::SysRawio,
        Capability::SysChroot,
        Capability::SysPtrace,
        Capability::SysPacct,
        Capability::SysAdmin,
        Capability::SysBoot,
        Capability::SysNice,
        Capability::SysResource,
        Capability::SysTime,
        Capability::SysTtyConfig,
        Capability::Mknod,
        Capability::Lease,
        Capability::AuditWrite,
        Capability::AuditControl,
        Capability::Setfcap,
        Capability::MacOverride,
        Capability::MacAdmin,
        Capability::Syslog,
        Capability::WakeAlarm,
        Capability::BlockSuspend,
        Capability::AuditRead,
    ];

    /// Look up by number.
    pub fn from_index(index: u8) -> Option<Capability> {
        Self::ALL.get(index as usize).copied()
    }

    pub const fn index(self) -> u8 {
        self as u8
    }

    /// Canonical name, e.g. `CAP_NET_ADMIN`.
    pub const fn name(self) -> &'static str {
        match self {
            Capability::Chown => "CAP_CHOWN",
            Capability::DacOverride => "CAP_DAC_OVERRIDE",
            Capability::DacReadSearch => "CAP_DAC_READ_SEARCH",
            Capability::Fowner => "CAP_FOWNER",
            Capability::Fsetid => "CAP_FSETID",
            Capability::Kill => "CAP_KILL",
            Capability::Setgid => "CAP_SETGID",
            Capability::Setuid => "CAP_SETUID",
            Capability::Setpcap => "CAP_SETPCAP",
            Capability::LinuxImmutable => "CAP_LINUX_IMMUTABLE",
            Capability::NetBindService => "CAP_NET_BIND_SERVICE",
            Capability::NetBroadcast => "CAP_NET_BROADCAST",
            Capability::NetAdmin => "CAP_NET_ADMIN",
            Capability::NetRaw => "CAP_NET_RAW",
            Capability::IpcLock => "CAP_IPC_LOCK",
            Capability::IpcOwner => "CAP_IPC_OWNER",
            Capability::SysModule => "CAP_SYS_MODULE",
            Capability::SysRawio => "CAP_SYS_RAWIO",
            Capability::SysChroot => "CAP_SYS_CHROOT",
            Capability::SysPtrace => "CAP_SYS_PTRACE",
            Capability::SysPacct => "CAP_SYS_PACCT",
            Capability::SysAdmin => "CAP_SYS_ADMIN",
            Capability::SysBoot => "CAP_SYS_BOOT",
            Capability::SysNice => "CAP_SYS_NICE",
            Capability::SysResource => "CAP_SYS_RESOURCE",
            Capability::SysTime => "CAP_SYS_TIME",
            Capability::SysTtyConfig => "CAP_SYS_TTY_CONFIG",
            Capability::Mknod => "CAP_MKNOD",
            Capability::Lease => "CAP_LEASE",
            Capability::AuditWrite => "CAP_AUDIT_WRITE",
            Capability::AuditControl => "CAP_AUDIT_CONTROL",
            Capability::Setfcap => "CAP_SETFCAP",
            Capability::MacOverride => "CAP_MAC_OVERRIDE",
            Capability::MacAdmin => "CAP_MAC_ADMIN",
            Capability::Syslog => "CAP_SYSLOG",
            Capability::WakeAlarm => "CAP_WAKE_ALARM",
            Capability::BlockSuspend => "CAP_BLOCK_SUSPEND",
            Capability::AuditRead => "CAP_AUDIT_READ",
        }
    }

    /// Parse `CAP_NET_ADMIN` or `net_admin` (case-insensitive).
    pub fn parse(name: &str) -> Option<Capability> {
        let bare = match name.get(..4) {
            Some(prefix) if prefix.eq_ignore_ascii_case("cap_") => &name[4..],
            _ => name,
        };
        Self::ALL
            .iter()
            .copied()
            .find(|cap| cap.name()[4..].eq_ignore_ascii_case(bare))
    }

    /// Single-bit set for this capability.
    pub const fn bit(self) -> CapSet {
        CapSet::from_bits_retain(1u64 << self as u8)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Capability set
// ============================================================================

bitflags! {
    /// Fixed-width capability mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CapSet: u64 {
        const CHOWN = 1 << 0;
        const DAC_OVERRIDE = 1 << 1;
        const DAC_READ_SEARCH = 1 << 2;
        const FOWNER = 1 << 3;
        const FSETID = 1 << 4;
        const KILL = 1 << 5;
        const SETGID = 1 << 6;
        const SETUID = 1 << 7;
        const SETPCAP = 1 << 8;
        const LINUX_IMMUTABLE = 1 << 9;
        const NET_BIND_SERVICE = 1 << 10;
        const NET_BROADCAST = 1 << 11;
        const NET_ADMIN = 1 << 12;
        const NET_RAW = 1 << 13;
        const IPC_LOCK = 1 << 14;
        const IPC_OWNER = 1 << 15;
        const SYS_MODULE = 1 << 16;
        const SYS_RAWIO = 1 << 17;
        const SYS_CHROOT = 1 << 18;
        const SYS_PTRACE = 1 << 19;
        const SYS_PACCT = 1 << 20;
        const SYS_ADMIN = 1 << 21;
        const SYS_BOOT = 1 << 22;
        const SYS_NICE = 1 << 23;
        const SYS_RESOURCE = 1 << 24;
        const SYS_TIME = 1 << 25;
        const SYS_TTY_CONFIG = 1 << 26;
        const MKNOD = 1 << 27;
        const LEASE = 1 << 28;
        const AUDIT_WRITE = 1 << 29;
        const AUDIT_CONTROL = 1 << 30;
        const SETFCAP = 1 << 31;
        const MAC_OVERRIDE = 1 << 32;
        const MAC_ADMIN = 1 << 33;
        const SYSLOG = 1 << 34;
        const WAKE_ALARM = 1 << 35;
        const BLOCK_SUSPEND = 1 << 36;
        const AUDIT_READ = 1 << 37;
    }
}

impl CapSet {
    pub const fn contains_cap(&self, cap: Capability) -> bool {
        self.bits() & (1u64 << cap as u8) != 0
    }

    pub fn with(self, cap: Capability) -> CapSet {
        self | cap.bit()
    }

    pub fn without(self, cap: Capability) -> CapSet {
        self & !cap.bit()
    }

    /// Capabilities in the set, in numeric order.
    pub fn caps(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |cap| self.contains_cap(*cap))
    }

    /// Build a set from a raw ABI mask, rejecting undefined bits.
    pub fn from_abi(mask: u64) -> Option<CapSet> {
        CapSet::from_bits(mask)
    }
}

impl From<Capability> for CapSet {
    fn from(cap: Capability) -> Self {
        cap.bit()
    }
}

impl FromIterator<Capability> for CapSet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(CapSet::empty(), |set, cap| set.with(cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbering_matches_abi() {
        assert_eq!(Capability::Chown as u8, 0);
        assert_eq!(Capability::Kill as u8, 5);
        assert_eq!(Capability::NetAdmin as u8, 12);
        assert_eq!(Capability::SysAdmin as u8, 21);
        assert_eq!(Capability::AuditRead as u8, CAP_LAST);
        for (i, cap) in Capability::ALL.iter().enumerate() {
            assert_eq!(cap.index() as usize, i);
        }
    }

    #[test]
    fn test_bits_match_flags() {
        assert_eq!(Capability::NetAdmin.bit(), CapSet::NET_ADMIN);
        assert_eq!(CapSet::all().bits().count_ones() as usize, CAP_COUNT);
        assert_eq!(CapSet::all().caps().count(), CAP_COUNT);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(Capability::parse("CAP_NET_ADMIN"), Some(Capability::NetAdmin));
        assert_eq!(Capability::parse("sys_admin"), Some(Capability::SysAdmin));
        assert_eq!(Capability::parse("cap_kill"), Some(Capability::Kill));
        assert_eq!(Capability::parse("CAP_FLY"), None);
        assert_eq!(Capability::parse(""), None);
        assert_eq!(Capability::from_index(CAP_LAST + 1), None);
    }

    #[test]
    fn test_from_abi_rejects_unknown_bits() {
        assert_eq!(CapSet::from_abi(1 << 12), Some(CapSet::NET_ADMIN));
        assert!(CapSet::from_abi(1 << 63).is_none());
    }

    #[test]
    fn test_collect() {
        let set: CapSet = [Capability::Kill, Capability::SysAdmin].into_iter().collect();
        assert!(set.contains_cap(Capability::Kill));
        assert!(set.contains_cap(Capability::SysAdmin));
        assert!(!set.contains_cap(Capability::NetAdmin));
        assert_eq!(set.without(Capability::Kill), CapSet::SYS_ADMIN);
    }
}
