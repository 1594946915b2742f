//! Kernel core.
//!
//! Owns every table that describes a running system and ties them to the
//! security crates:
//!
//! ```text
//!            ┌──────────────────────── Kernel ────────────────────────┐
//! dispatch → │ caps → MAC → seccomp → namespace → cgroup charge → exec │
//!            └───┬──────────┬─────────────┬──────────────┬────────────┘
//!          ContextTable  NamespaceTable  CgroupTable     Hal
//!                                                        │
//!                          EventBus ── AuditRing ◄── events
//! ```
//!
//! # Lock order
//!
//! `processes` → `namespaces` → `cgroups`.  The MAC tables and the HAL
//! registry take their own locks and never call back into the kernel.
//! Events produced while a lock is held are collected and published after
//! every lock is released.

#![cfg_attr(not(test), no_std)]
extern crate alloc;

#[macro_use]
extern crate klog;

pub mod cgroup;
pub mod config;
pub mod invariants;
pub mod namespace;
pub mod oom;
pub mod process;
pub mod syscall;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::{Mutex, RwLock};

pub use audit::{AuditRing, EventBus, EventSink, KernelEvent, PressureLevel};
pub use cap::{CapError, CapSet, CapTriple, Capability};
pub use hal::{DeviceKind, Hal, HalError, Platform};
pub use lsm::{AccessVector, LsmError, Mac, MacMode, MacRule, ObjectClass, Sid};
pub use seccomp::{SeccompAction, SeccompError, SeccompFilter};

pub use cgroup::{
    CgroupControllers, CgroupError, CgroupEventSink, CgroupId, CgroupLimits, CgroupStats, CgroupTable,
    ROOT_CGROUP,
};
pub use config::{ConfigError, HardeningProfile, KernelConfig};
pub use namespace::{CloneFlags, NamespaceError, NamespaceTable, ProxyId};
pub use process::{Context, ContextId, ContextState, ContextTable, ProcessError, KERNEL_CONTEXT};
pub use syscall::{Disposition, SyscallError, SyscallFrame};

/// Security context of the kernel context and of kernel-owned objects.
pub const KERNEL_LABEL: &str = "system:process:kernel";

// ============================================================================
// Errors
// ============================================================================

/// Any failure a kernel operation can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Process(ProcessError),
    Capability(CapError),
    Mac(LsmError),
    Seccomp(SeccompError),
    Namespace(NamespaceError),
    Cgroup(CgroupError),
    Hal(HalError),
    Config(ConfigError),
    Audit(audit::AuditError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Process(e) => write!(f, "process: {}", e),
            KernelError::Capability(e) => write!(f, "capability: {}", e),
            KernelError::Mac(e) => write!(f, "mac: {}", e),
            KernelError::Seccomp(e) => write!(f, "seccomp: {}", e),
            KernelError::Namespace(e) => write!(f, "namespace: {}", e),
            KernelError::Cgroup(e) => write!(f, "cgroup: {}", e),
            KernelError::Hal(e) => write!(f, "hal: {}", e),
            KernelError::Config(e) => write!(f, "config: {}", e),
            KernelError::Audit(e) => write!(f, "audit: {}", e),
        }
    }
}

macro_rules! kernel_error_from {
    ($($src:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$src> for KernelError {
                fn from(e: $src) -> Self {
                    KernelError::$variant(e)
                }
            }
        )*
    };
}

kernel_error_from! {
    ProcessError => Process,
    CapError => Capability,
    LsmError => Mac,
    SeccompError => Seccomp,
    NamespaceError => Namespace,
    CgroupError => Cgroup,
    HalError => Hal,
    ConfigError => Config,
    audit::AuditError => Audit,
}

// ============================================================================
// Kernel
// ============================================================================

/// One booted system.
pub struct Kernel {
    config: KernelConfig,
    pub(crate) hal: Arc<Hal>,
    pub(crate) mac: Mac,
    pub(crate) processes: Mutex<ContextTable>,
    pub(crate) namespaces: Mutex<NamespaceTable>,
    pub(crate) cgroups: RwLock<CgroupTable>,
    pub(crate) cgroup_sinks: RwLock<Vec<Arc<dyn CgroupEventSink>>>,
    events: EventBus,
    device_sids: BTreeMap<DeviceKind, Sid>,
    pub(crate) kernel_sid: Sid,
}

const LABELED_DEVICES: [DeviceKind; 5] = [
    DeviceKind::Keyboard,
    DeviceKind::Mouse,
    DeviceKind::Storage,
    DeviceKind::Network,
    DeviceKind::Pci,
];

impl Kernel {
    /// Bring the system up on `platform`.
    ///
    /// Enumerates devices, labels the kernel and every device kind, loads
    /// the base MAC policy, builds the root namespaces and root cgroup, and
    /// installs the kernel context in slot 1 of the root of everything.
    pub fn boot(config: KernelConfig, platform: Box<dyn Platform>) -> Result<Kernel, KernelError> {
        config.validate()?;
        klog::set_profile(config.profile.klog_profile());

        let hal = Arc::new(Hal::new(platform, config.timer_hz));
        let devices = hal.enumerate();
        klog!(Info, "boot: {} devices on {}", devices, hal.platform_name());

        let mac = Mac::new(config.max_sids, config.mac_mode);
        let kernel_sid = mac.string_to_sid(KERNEL_LABEL)?;
        let mut device_sids = BTreeMap::new();
        for kind in LABELED_DEVICES {
            device_sids.insert(kind, mac.string_to_sid(kind.label())?);
        }

        // Kernel-labelled contexts may fork, signal each other, administer
        // the system and use every device.  Everything else is denied until
        // policy says otherwise.
        let mut rules = Vec::with_capacity(2 + device_sids.len());
        rules.push(MacRule::allow(
            kernel_sid,
            kernel_sid,
            ObjectClass::Process,
            AccessVector::FORK | AccessVector::SIGNAL,
        ));
        rules.push(MacRule::allow(kernel_sid, kernel_sid, ObjectClass::System, AccessVector::SETATTR));
        for sid in device_sids.values() {
            rules.push(MacRule::allow(
                kernel_sid,
                *sid,
                ObjectClass::BlkFile,
                AccessVector::READ | AccessVector::WRITE,
            ));
        }
        mac.load_rules(&rules);

        let mut namespaces = NamespaceTable::new(config.max_namespaces, config.max_proxies, &config.hostname)?;
        let root_proxy = namespaces.root_proxy();
        namespaces.get_proxy(root_proxy)?;
        namespaces.assign_pid_chain(root_proxy, KERNEL_CONTEXT)?;

        let mut cgroups = CgroupTable::new(config.max_cgroups, config.max_cgroup_depth);
        cgroups.attach_new(ROOT_CGROUP, KERNEL_CONTEXT)?;

        let mut processes = ContextTable::new(config.max_contexts);
        processes.install_kernel(kernel_sid, root_proxy);

        let clock_hal = hal.clone();
        let ring = AuditRing::new(config.audit_capacity)?.with_clock(Arc::new(move || clock_hal.timer_ticks()));

        klog_force!(
            "boot: profile={} mac={:?} contexts={} cgroups={}",
            config.profile.name(),
            config.mac_mode,
            config.max_contexts,
            config.max_cgroups
        );

        Ok(Kernel {
            config,
            hal,
            mac,
            processes: Mutex::new(processes),
            namespaces: Mutex::new(namespaces),
            cgroups: RwLock::new(cgroups),
            cgroup_sinks: RwLock::new(Vec::new()),
            events: EventBus::new(ring),
            device_sids,
            kernel_sid,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn hal(&self) -> &Hal {
        &self.hal
    }

    pub fn mac(&self) -> &Mac {
        &self.mac
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn audit(&self) -> &AuditRing {
        self.events.ring()
    }

    pub fn kernel_sid(&self) -> Sid {
        self.kernel_sid
    }

    /// SID labelling every device of `kind`.
    pub fn device_sid(&self, kind: DeviceKind) -> Option<Sid> {
        self.device_sids.get(&kind).copied()
    }

    /// Forward queued events to the bus and, for cgroup events, to the
    /// registered cgroup sinks.  Must be called with no kernel lock held.
    pub(crate) fn publish(&self, events: Vec<KernelEvent>) {
        if events.is_empty() {
            return;
        }
        let sinks = self.cgroup_sinks.read().clone();
        for event in events {
            for sink in &sinks {
                match event {
                    KernelEvent::MemoryPressure { cgroup, from, to } => sink.pressure_changed(cgroup, from, to),
                    KernelEvent::OomKill { cgroup, victim, .. } => sink.oom_kill(cgroup, victim),
                    KernelEvent::Frozen { cgroup } => sink.freezer_changed(cgroup, true),
                    KernelEvent::Thawed { cgroup } => sink.freezer_changed(cgroup, false),
                    _ => {}
                }
            }
            self.events.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal::SimPlatform;

    fn boot() -> Kernel {
        let sim = Arc::new(SimPlatform::new());
        sim.add_disk(64);
        Kernel::boot(KernelConfig::default(), Box::new(sim)).expect("boot")
    }

    #[test]
    fn test_boot_installs_kernel_context() {
        let k = boot();
        let ctx = k.context(KERNEL_CONTEXT).expect("kernel context");
        assert!(ctx.is_kernel());
        assert_eq!(ctx.caps(), CapTriple::full());
        assert_eq!(ctx.sid(), k.kernel_sid());
        assert_eq!(k.cgroup_of(KERNEL_CONTEXT), Some(ROOT_CGROUP));
        assert_eq!(k.mac.sid_to_string(k.kernel_sid()).as_deref(), Ok(KERNEL_LABEL));
    }

    #[test]
    fn test_boot_labels_devices() {
        let k = boot();
        for kind in LABELED_DEVICES {
            let sid = k.device_sid(kind).expect("device sid");
            assert_eq!(k.mac.sid_to_string(sid).as_deref(), Ok(kind.label()));
        }
        let storage = k.device_sid(DeviceKind::Storage).expect("storage sid");
        assert!(k
            .mac
            .compute(k.kernel_sid(), storage, ObjectClass::BlkFile, AccessVector::READ)
            .is_allowed());
    }

    #[test]
    fn test_boot_rejects_bad_config() {
        let config = KernelConfig {
            max_contexts: 1,
            ..KernelConfig::default()
        };
        let result = Kernel::boot(config, Box::new(SimPlatform::new()));
        assert!(matches!(result, Err(KernelError::Config(_))));
    }

    #[test]
    fn test_error_display() {
        let e = KernelError::from(ProcessError::NoSuchContext);
        assert!(alloc::format!("{}", e).starts_with("process: "));
    }

    struct Counter(Mutex<Vec<(CgroupId, bool)>>);

    impl CgroupEventSink for Counter {
        fn freezer_changed(&self, cgroup: CgroupId, frozen: bool) {
            self.0.lock().push((cgroup, frozen));
        }
    }

    #[test]
    fn test_publish_reaches_cgroup_sinks() {
        let k = boot();
        let sink = Arc::new(Counter(Mutex::new(Vec::new())));
        k.register_cgroup_sink(sink.clone());
        let g = k.create_cgroup(ROOT_CGROUP, "jobs", CgroupControllers::FREEZER).expect("create");
        k.freeze(g).expect("freeze");
        k.thaw(g).expect("thaw");
        assert_eq!(*sink.0.lock(), [(g, true), (g, false)]);
        assert_eq!(k.events().published(), 2);
        assert_eq!(k.audit().len(), 2);
    }
}
