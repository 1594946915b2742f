//! End-to-end scenarios against a booted kernel on the simulated platform.
//!
//! Every test finishes by asserting that the whole-system invariants hold.

use std::sync::Arc;

use cap::{CapSet, CapTriple, Capability};
use hal::{HalError, SimPciFunction, SimPlatform};
use kernel_core::cgroup::{CgroupControllers, CgroupError, CgroupLimits, IoLimits, MemoryKind, ROOT_CGROUP};
use kernel_core::invariants::check_all;
use kernel_core::process::{ContextState, KERNEL_CONTEXT, SIGKILL, SIGSYS};
use kernel_core::syscall::*;
use kernel_core::{CloneFlags, Kernel, KernelConfig, KernelError, KernelEvent, ProcessError};
use lsm::{AccessVector, MacMode, MacRule, ObjectClass};
use seccomp::{
    SeccompAction, SeccompData, SeccompFilter, SockFilter, BPF_ABS, BPF_JEQ, BPF_JMP, BPF_K, BPF_LD, BPF_RET,
    BPF_W, SECCOMP_RET_ALLOW, SECCOMP_RET_KILL,
};

const MIB: u64 = 1 << 20;

fn boot_with(sim: Arc<SimPlatform>) -> Kernel {
    Kernel::boot(KernelConfig::default(), Box::new(sim)).expect("boot")
}

fn boot() -> Kernel {
    let sim = Arc::new(SimPlatform::new());
    sim.add_disk(128);
    boot_with(sim)
}

fn assert_consistent(k: &Kernel) {
    let violations = check_all(k);
    assert!(violations.is_empty(), "{:?}", violations);
}

fn audited(k: &Kernel) -> Vec<KernelEvent> {
    k.audit().snapshot().records.into_iter().map(|r| r.event).collect()
}

fn call(k: &Kernel, ctx: u32, nr: u32, args: [u64; 6]) -> Disposition {
    k.dispatch(ctx, &SyscallFrame::new(nr, args), &mut [])
}

fn deny_kill_program() -> Vec<SockFilter> {
    vec![
        SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, 0),
        SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 62, 1, 0),
        SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
        SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL),
    ]
}

// ============================================================================
// S1-S6
// ============================================================================

#[test]
fn s1_capability_gate() {
    let k = boot();
    let c = k.spawn(KERNEL_CONTEXT).expect("spawn");
    let caps = CapTriple::new(Capability::NetAdmin.into(), CapSet::empty(), CapSet::empty()).expect("triple");
    k.set_capabilities(c, caps).expect("set");

    assert!(!k.check_capability(c, Capability::NetAdmin));
    k.raise_capability(c, Capability::NetAdmin).expect("raise");
    assert!(k.check_capability(c, Capability::NetAdmin));

    assert_eq!(
        k.raise_capability(c, Capability::SysAdmin),
        Err(KernelError::Capability(cap::CapError::NotPermitted(Capability::SysAdmin)))
    );
    assert!(!k.check_capability(c, Capability::SysAdmin));

    k.lower_capability(c, Capability::NetAdmin).expect("lower");
    assert!(!k.check_capability(c, Capability::NetAdmin));
    assert_consistent(&k);
}

#[test]
fn s2_mac_policy() {
    let k = boot();
    let mac = k.mac();
    let s1 = mac.string_to_sid("system:process:init").expect("sid");
    let s2 = mac.string_to_sid("system:file:config").expect("sid");
    assert_ne!(s1, s2);
    assert_eq!(mac.string_to_sid("system:process:init"), Ok(s1));

    mac.load_rules(&[MacRule::allow(s1, s2, ObjectClass::File, AccessVector::READ | AccessVector::WRITE)]);
    assert!(mac.compute(s1, s2, ObjectClass::File, AccessVector::READ).is_allowed());
    assert!(!mac.compute(s1, s2, ObjectClass::File, AccessVector::EXEC).is_allowed());
    assert!(!mac.compute(s2, s1, ObjectClass::File, AccessVector::READ).is_allowed());
    assert_consistent(&k);
}

#[test]
fn s3_seccomp_denies_one_syscall() {
    let filter = SeccompFilter::new(deny_kill_program()).expect("validator accepts");
    assert_eq!(filter.evaluate(&SeccompData::new(62, 0, [0; 6])), SeccompAction::Kill);
    assert_eq!(filter.evaluate(&SeccompData::new(1, 0, [0; 6])), SeccompAction::Allow);
}

#[test]
fn s4_memory_limit_and_oom() {
    let k = boot();
    let g = k.create_cgroup(ROOT_CGROUP, "g", CgroupControllers::MEMORY).expect("create");
    k.set_cgroup_limits(
        g,
        &CgroupLimits {
            memory_max: Some(100 * MIB),
            ..CgroupLimits::default()
        },
    )
    .expect("limit");
    let p = k.spawn(KERNEL_CONTEXT).expect("spawn");
    k.attach(g, p).expect("attach");

    k.charge_memory(p, 90 * MIB, MemoryKind::Anon).expect("charge 90");
    let stats = k.cgroup_stats(g).expect("stats");
    assert_eq!(stats.memory_current, 90 * MIB);
    assert_eq!(k.memory_pressure(g), Some(audit::PressureLevel::High));

    assert_eq!(
        k.charge_memory(p, 15 * MIB, MemoryKind::Anon),
        Err(KernelError::Process(ProcessError::Killed))
    );
    let stats = k.cgroup_stats(g).expect("stats");
    assert_eq!(stats.memory_oom_kill, 1);
    assert_eq!(stats.memory_current, 0);
    assert_eq!(stats.members, 0);
    assert_eq!(
        k.context(p).map(|c| c.state()),
        Some(ContextState::Zombie {
            code: 128 + SIGKILL as i32,
            signal: Some(SIGKILL)
        })
    );

    let events = audited(&k);
    assert!(events.iter().any(|e| matches!(e, KernelEvent::OomKill { cgroup, victim, .. } if *cgroup == g && *victim == p)));
    assert!(events.iter().any(|e| matches!(e, KernelEvent::ContextExit { ctx, signal: Some(SIGKILL), .. } if *ctx == p)));
    assert_consistent(&k);
}

#[test]
fn s5_unshare_and_setns() {
    let k = boot();
    let c = k.spawn(KERNEL_CONTEXT).expect("spawn");
    let root = k.proxy_of(c).expect("proxy");
    assert_eq!(k.hostname(c).expect("hostname"), "limitless");

    let fresh = k.unshare(c, CloneFlags::NEWUTS).expect("unshare");
    assert_ne!(fresh, root);
    assert_eq!(k.hostname(c).expect("hostname"), "limitless");
    k.set_hostname(c, b"node-a").expect("sethostname");
    assert_eq!(k.hostname(c).expect("hostname"), "node-a");
    assert_eq!(k.hostname(KERNEL_CONTEXT).expect("hostname"), "limitless");
    assert_consistent(&k);

    k.setns(c, root).expect("setns");
    assert_eq!(k.hostname(c).expect("hostname"), "limitless");
    assert_eq!(k.proxy_refcount(fresh), None);
    assert_consistent(&k);
}

#[test]
fn s6_pci_scan_round_trip() {
    let sim = Arc::new(SimPlatform::new());
    sim.add_pci_function(0, 0, 0, SimPciFunction::new(0x8086, 0x1237, 0x06, 0x00));
    let k = boot_with(sim);

    let found = k.hal().pci_find(0x8086, 0x1237).expect("host bridge");
    assert_eq!((found.bus, found.dev, found.func), (0, 0, 0));
    assert!(k.hal().pci_find(0x8086, 0x0000).is_none());
    assert_consistent(&k);
}

// ============================================================================
// Dispatch
// ============================================================================

#[test]
fn dispatch_fork_exit_wait() {
    let k = boot();
    let parent = k.spawn(KERNEL_CONTEXT).expect("spawn");

    let child = match call(&k, parent, SYS_FORK, [0; 6]) {
        Disposition::Return(pid) if pid > 0 => k.resolve_pid(parent, pid as u32).expect("resolve"),
        other => panic!("fork: {:?}", other),
    };
    assert_eq!(k.context(child).map(|c| c.parent()), Some(parent));

    // Still running: non-blocking wait reports nothing.
    assert_eq!(call(&k, parent, SYS_WAIT, [u64::MAX, 0, 0, 0, 0, 0]), Disposition::Return(0));

    assert_eq!(call(&k, child, SYS_EXIT, [7, 0, 0, 0, 0, 0]), Disposition::Exited(7));
    assert_eq!(call(&k, child, SYS_GETPID, [0; 6]), Disposition::errno(SyscallError::ESRCH));

    let mut status = [0u8; 4];
    let pid = k.pid_of(parent, child).expect("pid");
    let d = k.dispatch(parent, &SyscallFrame::new(SYS_WAIT, [u64::MAX, 0, 0, 0, 0, 0]), &mut status);
    assert_eq!(d, Disposition::Return(pid as i64));
    assert_eq!(i32::from_le_bytes(status), 7 << 8);
    assert!(k.context(child).is_none());

    assert_eq!(
        call(&k, parent, SYS_WAIT, [u64::MAX, 0, 0, 0, 0, 0]),
        Disposition::errno(SyscallError::ECHILD)
    );
    assert_consistent(&k);
}

#[test]
fn dispatch_capability_stage() {
    let k = boot();
    let c = k.spawn(KERNEL_CONTEXT).expect("spawn");
    let mut name = *b"node-b";

    let frame = SyscallFrame::new(SYS_SETHOSTNAME, [name.len() as u64, 0, 0, 0, 0, 0]);
    assert_eq!(k.dispatch(c, &frame, &mut name), Disposition::errno(SyscallError::EPERM));
    assert!(audited(&k).iter().any(|e| matches!(
        e,
        KernelEvent::CapabilityDenied { cap: Capability::SysAdmin, syscall: SYS_SETHOSTNAME, .. }
    )));

    k.raise_capability(c, Capability::SysAdmin).expect("raise");
    assert_eq!(k.dispatch(c, &frame, &mut name), Disposition::Return(0));
    assert_eq!(k.hostname(KERNEL_CONTEXT).expect("hostname"), "node-b");

    let mut out = [0u8; 16];
    assert_eq!(
        k.dispatch(c, &SyscallFrame::new(SYS_GETHOSTNAME, [0; 6]), &mut out),
        Disposition::Return(0)
    );
    assert_eq!(&out[..7], b"node-b\0");
    assert_consistent(&k);
}

#[test]
fn dispatch_kill_needs_capability_for_strangers() {
    let k = boot();
    let a = k.spawn(KERNEL_CONTEXT).expect("spawn");
    let b = k.spawn(KERNEL_CONTEXT).expect("spawn");
    let pid_b = k.pid_of(a, b).expect("pid") as u64;

    assert_eq!(
        call(&k, a, SYS_KILL, [pid_b, SIGKILL as u64, 0, 0, 0, 0]),
        Disposition::errno(SyscallError::EPERM)
    );
    k.raise_capability(a, Capability::Kill).expect("raise");
    assert_eq!(call(&k, a, SYS_KILL, [pid_b, SIGKILL as u64, 0, 0, 0, 0]), Disposition::Return(0));
    assert_eq!(call(&k, b, SYS_GETPID, [0; 6]), Disposition::Terminated { signal: SIGKILL });
    assert_consistent(&k);
}

#[test]
fn dispatch_mac_stage() {
    let k = boot();
    let c = k.spawn(KERNEL_CONTEXT).expect("spawn");
    let app = k.set_context_label(c, "user:process:app").expect("label");

    assert_eq!(call(&k, c, SYS_FORK, [0; 6]), Disposition::errno(SyscallError::EACCES));
    assert!(audited(&k).iter().any(|e| matches!(
        e,
        KernelEvent::MacDenied { source, class: ObjectClass::Process, enforced: true, .. } if *source == app
    )));

    k.mac().set_mode(MacMode::Permissive);
    assert!(matches!(call(&k, c, SYS_FORK, [0; 6]), Disposition::Return(pid) if pid > 0));
    assert!(audited(&k)
        .iter()
        .any(|e| matches!(e, KernelEvent::MacDenied { enforced: false, .. })));

    k.mac().set_mode(MacMode::Enforcing);
    k.mac()
        .load_rules(&[MacRule::allow(app, app, ObjectClass::Process, AccessVector::FORK)]);
    assert!(matches!(call(&k, c, SYS_FORK, [0; 6]), Disposition::Return(pid) if pid > 0));
    assert_consistent(&k);
}

#[test]
fn dispatch_seccomp_kill() {
    let k = boot();
    let c = k.spawn(KERNEL_CONTEXT).expect("spawn");
    let mut image: Vec<u8> = deny_kill_program().iter().flat_map(|i| i.to_bytes()).collect();
    let frame = SyscallFrame::new(SYS_SECCOMP, [image.len() as u64, 0, 0, 0, 0, 0]);
    assert_eq!(k.dispatch(c, &frame, &mut image), Disposition::Return(0));

    let pid = k.pid_of(c, c).expect("pid") as u64;
    assert_eq!(call(&k, c, SYS_GETPID, [0; 6]), Disposition::Return(pid as i64));
    assert_eq!(
        call(&k, c, SYS_KILL, [pid, 0, 0, 0, 0, 0]),
        Disposition::Terminated { signal: SIGSYS }
    );
    assert_eq!(call(&k, c, SYS_GETPID, [0; 6]), Disposition::Terminated { signal: SIGSYS });

    let events = audited(&k);
    assert!(events.iter().any(|e| matches!(
        e,
        KernelEvent::Seccomp { syscall: 62, action: SeccompAction::Kill, .. }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, KernelEvent::ContextExit { ctx, signal: Some(SIGSYS), .. } if *ctx == c)));
    assert_consistent(&k);
}

#[test]
fn dispatch_seccomp_errno_and_trap() {
    let k = boot();
    let c = k.spawn(KERNEL_CONTEXT).expect("spawn");
    k.attach_filter(c, Arc::new(seccomp::deny_list(&[SYS_GETPID], SeccompAction::Errno(1))))
        .expect("attach");
    assert_eq!(call(&k, c, SYS_GETPID, [0; 6]), Disposition::Return(-1));

    k.attach_filter(c, Arc::new(seccomp::deny_list(&[SYS_GETPID], SeccompAction::Trap(0))))
        .expect("attach");
    assert_eq!(call(&k, c, SYS_GETPID, [0; 6]), Disposition::Signaled { signal: SIGSYS });
    assert_eq!(k.take_pending_signal(c), Some(SIGSYS));

    // The kernel context skips seccomp entirely and can't take a filter.
    assert!(k
        .attach_filter(KERNEL_CONTEXT, Arc::new(seccomp::strict_filter()))
        .is_err());
    assert!(matches!(call(&k, KERNEL_CONTEXT, SYS_GETPID, [0; 6]), Disposition::Return(1)));
    assert_consistent(&k);
}

#[test]
fn dispatch_frozen_context_stops() {
    let k = boot();
    let g = k.create_cgroup(ROOT_CGROUP, "ice", CgroupControllers::FREEZER).expect("create");
    let c = k.spawn(KERNEL_CONTEXT).expect("spawn");
    k.attach(g, c).expect("attach");

    k.freeze(g).expect("freeze");
    assert!(k.context_frozen(c));
    assert_eq!(call(&k, c, SYS_GETPID, [0; 6]), Disposition::Stopped);

    k.thaw(g).expect("thaw");
    assert!(matches!(call(&k, c, SYS_GETPID, [0; 6]), Disposition::Return(_)));
    let events = audited(&k);
    assert!(events.contains(&KernelEvent::Frozen { cgroup: g }));
    assert!(events.contains(&KernelEvent::Thawed { cgroup: g }));
    assert_consistent(&k);
}

#[test]
fn dispatch_storage_round_trip() {
    let k = boot();
    let c = k.spawn(KERNEL_CONTEXT).expect("spawn");

    let mut sector = [0xA5u8; hal::SECTOR_SIZE];
    assert_eq!(
        k.dispatch(c, &SyscallFrame::new(SYS_PWRITE, [0, 3, 1, 0, 0, 0]), &mut sector),
        Disposition::Return(hal::SECTOR_SIZE as i64)
    );
    let mut back = [0u8; hal::SECTOR_SIZE];
    assert_eq!(
        k.dispatch(c, &SyscallFrame::new(SYS_PREAD, [0, 3, 1, 0, 0, 0]), &mut back),
        Disposition::Return(hal::SECTOR_SIZE as i64)
    );
    assert_eq!(back, sector);

    // Reads are charged to the caller as page cache.
    let stats = k.cgroup_stats(ROOT_CGROUP).expect("stats");
    assert_eq!(stats.memory_current, hal::SECTOR_SIZE as u64);
    assert_eq!(stats.io_rbytes, hal::SECTOR_SIZE as u64);
    assert_eq!(stats.io_wbytes, hal::SECTOR_SIZE as u64);

    assert_eq!(
        k.dispatch(c, &SyscallFrame::new(SYS_PREAD, [0, 0, 1, 0, 0, 0]), &mut [0u8; 16]),
        Disposition::errno(SyscallError::EINVAL)
    );
    assert_consistent(&k);
}

#[test]
fn dispatch_unshare_pid_namespace() {
    let k = boot();
    let c = k.spawn(KERNEL_CONTEXT).expect("spawn");
    k.raise_capability(c, Capability::SysAdmin).expect("raise");

    let flags = (CloneFlags::NEWPID | CloneFlags::NEWUTS).bits();
    assert_eq!(call(&k, c, SYS_UNSHARE, [flags, 0, 0, 0, 0, 0]), Disposition::Return(0));
    assert_eq!(call(&k, c, SYS_GETPID, [0; 6]), Disposition::Return(1));
    assert_eq!(k.pid_of(KERNEL_CONTEXT, c).expect("root view"), c);
    assert_consistent(&k);
}

#[test]
fn dispatch_mmap_charges_memory() {
    let k = boot();
    let c = k.spawn(KERNEL_CONTEXT).expect("spawn");
    let g = k.create_cgroup(ROOT_CGROUP, "small", CgroupControllers::MEMORY).expect("create");
    k.set_cgroup_limits(
        g,
        &CgroupLimits {
            memory_max: Some(64 * 1024),
            ..CgroupLimits::default()
        },
    )
    .expect("limit");
    k.attach(g, c).expect("attach");

    let first = call(&k, c, SYS_MMAP, [100, 0, 0, 0, 0, 0]);
    assert!(matches!(first, Disposition::Return(addr) if addr > 0));
    assert_eq!(k.cgroup_stats(g).expect("stats").memory_current, 4096);

    // Larger than the whole limit: the sole member is the OOM victim.
    assert_eq!(
        call(&k, c, SYS_MMAP, [128 * 1024, 0, 0, 0, 0, 0]),
        Disposition::Terminated { signal: SIGKILL }
    );
    assert_eq!(k.cgroup_stats(g).expect("stats").memory_oom_kill, 1);
    assert_consistent(&k);
}

#[test]
fn dispatch_kill_rejects_wide_pid() {
    let k = boot();
    let c = k.spawn(KERNEL_CONTEXT).expect("spawn");
    let wide = (1u64 << 32) | c as u64;
    assert_eq!(
        call(&k, KERNEL_CONTEXT, SYS_KILL, [wide, SIGKILL as u64, 0, 0, 0, 0]),
        Disposition::errno(SyscallError::EINVAL)
    );
    assert_eq!(k.context(c).map(|ctx| ctx.is_running()), Some(true));
    assert_consistent(&k);
}

// ============================================================================
// Failed operations leave no trace
// ============================================================================

#[test]
fn failed_storage_changes_nothing() {
    let sim = Arc::new(SimPlatform::new());
    sim.add_disk(8);
    let k = boot_with(sim.clone());
    let c = k.spawn(KERNEL_CONTEXT).expect("spawn");
    let g = k
        .create_cgroup(ROOT_CGROUP, "io", CgroupControllers::MEMORY | CgroupControllers::IO)
        .expect("create");
    let one_sector = IoLimits {
        read_bps: Some(hal::SECTOR_SIZE as u64),
        ..IoLimits::default()
    };
    k.set_io_limits(g, storage_device_number(0), one_sector).expect("io limits");
    k.attach(g, c).expect("attach");

    let before = k.cgroup_stats(g).expect("stats");
    let logged = k.audit().len();
    let mut sector = [0x5Au8; hal::SECTOR_SIZE];

    // Past the end of the disk.
    assert_eq!(
        k.dispatch(c, &SyscallFrame::new(SYS_PREAD, [0, 1000, 1, 0, 0, 0]), &mut sector),
        Disposition::errno(SyscallError::EINVAL)
    );
    // The device stops answering.
    sim.set_disk_fault(Some(HalError::Timeout));
    assert_eq!(
        k.dispatch(c, &SyscallFrame::new(SYS_PREAD, [0, 2, 1, 0, 0, 0]), &mut sector),
        Disposition::errno(SyscallError::ETIMEDOUT)
    );
    assert_eq!(
        k.dispatch(c, &SyscallFrame::new(SYS_PWRITE, [0, 2, 1, 0, 0, 0]), &mut sector),
        Disposition::errno(SyscallError::ETIMEDOUT)
    );
    assert_eq!(k.cgroup_stats(g).expect("stats"), before);
    assert_eq!(k.cgroup_stats(ROOT_CGROUP).expect("root").io_rbytes, 0);
    assert_eq!(k.audit().len(), logged);

    // The refunded window still has room for one real read.
    sim.set_disk_fault(None);
    assert_eq!(
        k.dispatch(c, &SyscallFrame::new(SYS_PREAD, [0, 2, 1, 0, 0, 0]), &mut sector),
        Disposition::Return(hal::SECTOR_SIZE as i64)
    );
    let after = k.cgroup_stats(g).expect("stats");
    assert_eq!(after.memory_current, hal::SECTOR_SIZE as u64);
    assert_eq!((after.io_rbytes, after.io_rios, after.io_throttled), (hal::SECTOR_SIZE as u64, 1, 0));
    assert_consistent(&k);
}

#[test]
fn refused_migrate_changes_nothing() {
    let k = boot();
    let src = k.create_cgroup(ROOT_CGROUP, "src", CgroupControllers::MEMORY).expect("create");
    k.set_cgroup_limits(
        src,
        &CgroupLimits {
            memory_high: Some(50 * MIB),
            memory_max: Some(100 * MIB),
            ..CgroupLimits::default()
        },
    )
    .expect("limits");
    let full = k.create_cgroup(ROOT_CGROUP, "full", CgroupControllers::PIDS).expect("create");
    k.set_cgroup_limits(
        full,
        &CgroupLimits {
            pids_max: Some(1),
            ..CgroupLimits::default()
        },
    )
    .expect("limits");

    let occupant = k.spawn(KERNEL_CONTEXT).expect("spawn");
    k.attach(full, occupant).expect("attach");
    let mover = k.spawn(KERNEL_CONTEXT).expect("spawn");
    k.attach(src, mover).expect("attach");
    k.charge_memory(mover, 95 * MIB, MemoryKind::Anon).expect("charge");

    let before = (k.cgroup_stats(src).expect("src"), k.cgroup_stats(ROOT_CGROUP).expect("root"));
    let logged = k.audit().len();
    assert_eq!(
        k.migrate(src, full, mover),
        Err(KernelError::Cgroup(CgroupError::PidsLimitExceeded))
    );
    assert_eq!((k.cgroup_stats(src).expect("src"), k.cgroup_stats(ROOT_CGROUP).expect("root")), before);
    assert_eq!(k.audit().len(), logged);
    assert_eq!(k.cgroup_of(mover), Some(src));
    assert_consistent(&k);
}

#[test]
fn rejected_limit_keeps_usage() {
    let k = boot();
    let a = k.create_cgroup(ROOT_CGROUP, "a", CgroupControllers::MEMORY).expect("create");
    k.set_cgroup_limits(
        a,
        &CgroupLimits {
            memory_max: Some(100 * MIB),
            ..CgroupLimits::default()
        },
    )
    .expect("limits");
    let b = k.create_cgroup(a, "b", CgroupControllers::MEMORY).expect("create");
    k.set_cgroup_limits(
        b,
        &CgroupLimits {
            memory_max: Some(50 * MIB),
            ..CgroupLimits::default()
        },
    )
    .expect("limits");
    let c = k.spawn(KERNEL_CONTEXT).expect("spawn");
    k.attach(b, c).expect("attach");
    k.charge_memory(c, 40 * MIB, MemoryKind::Cache).expect("charge");

    let before = (k.cgroup_stats(a).expect("a"), k.cgroup_stats(b).expect("b"));
    let logged = k.audit().len();
    assert_eq!(
        k.set_cgroup_limits(
            a,
            &CgroupLimits {
                memory_max: Some(20 * MIB),
                ..CgroupLimits::default()
            },
        ),
        Err(KernelError::Cgroup(CgroupError::ResidualExceeded))
    );
    assert_eq!((k.cgroup_stats(a).expect("a"), k.cgroup_stats(b).expect("b")), before);
    assert_eq!(k.audit().len(), logged);
    assert_consistent(&k);
}
