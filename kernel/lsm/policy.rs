//! MAC rule vocabulary: object classes, access vectors, rules.

use core::fmt;

use bitflags::bitflags;

use crate::sid::Sid;

/// Kind of object an access targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectClass {
    Process,
    File,
    Dir,
    BlkFile,
    ChrFile,
    System,
    Namespace,
    Cgroup,
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectClass::Process => "process",
            ObjectClass::File => "file",
            ObjectClass::Dir => "dir",
            ObjectClass::BlkFile => "blk_file",
            ObjectClass::ChrFile => "chr_file",
            ObjectClass::System => "system",
            ObjectClass::Namespace => "namespace",
            ObjectClass::Cgroup => "cgroup",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Permission bits requested of, or granted by, a rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessVector: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const APPEND = 1 << 3;
        const CREATE = 1 << 4;
        const GETATTR = 1 << 5;
        const SETATTR = 1 << 6;
        const SIGNAL = 1 << 7;
        const FORK = 1 << 8;
        const ADMIN = 1 << 9;
    }
}

/// One allow rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacRule {
    pub source: Sid,
    pub target: Sid,
    pub class: ObjectClass,
    pub permissions: AccessVector,
    pub active: bool,
}

impl MacRule {
    /// Active rule granting `permissions`.
    pub const fn allow(source: Sid, target: Sid, class: ObjectClass, permissions: AccessVector) -> Self {
        MacRule {
            source,
            target,
            class,
            permissions,
            active: true,
        }
    }

    /// Whether this rule alone grants `requested` for the given triple.
    pub fn grants(&self, source: Sid, target: Sid, class: ObjectClass, requested: AccessVector) -> bool {
        self.active
            && self.source == source
            && self.target == target
            && self.class == class
            && self.permissions.contains(requested)
    }
}

/// Outcome of an access decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub const fn is_allowed(self) -> bool {
        matches!(self, Decision::Allow)
    }
}
