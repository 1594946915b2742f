//! Syscall dispatch.
//!
//! Every syscall passes through five stages, in order:
//!
//! 1. capability check for privileged operations
//! 2. MAC decision against the target object's SID
//! 3. seccomp filter
//! 4. namespace translation of identifiers
//! 5. cgroup charge for operations that allocate
//!
//! A stage that denies ends the dispatch; later stages never see the call.
//! The kernel context skips stages 2 and 3 and nothing else.
//!
//! Numbers follow the x86_64 Linux table so stock seccomp filters apply.

use alloc::sync::Arc;
use alloc::vec::Vec;

use audit::KernelEvent;
use cap::{CapError, CapTriple, Capability};
use hal::{DeviceKind, HalError, SECTOR_SIZE};
use lsm::{AccessVector, LsmError, MacMode, ObjectClass, Sid};
use seccomp::{SeccompAction, SeccompData, SeccompError, SeccompFilter};

use crate::cgroup::{CgroupError, DeviceAccess, DeviceNumber, DeviceType, IoDirection, MemoryKind};
use crate::namespace::{CloneFlags, NamespaceError, ProxyId};
use crate::process::{Context, ContextId, ContextState, ProcessError, MAX_SIGNAL, PAGE_SIZE, SIGKILL, SIGSYS};
use crate::{Kernel, KernelError};

// ============================================================================
// Syscall numbers
// ============================================================================

pub const SYS_MMAP: u32 = 9;
pub const SYS_MUNMAP: u32 = 11;
pub const SYS_PREAD: u32 = 17;
pub const SYS_PWRITE: u32 = 18;
pub const SYS_GETPID: u32 = 39;
pub const SYS_FORK: u32 = 57;
pub const SYS_EXIT: u32 = 60;
pub const SYS_WAIT: u32 = 61;
pub const SYS_KILL: u32 = 62;
pub const SYS_GETHOSTNAME: u32 = 63;
pub const SYS_CAPGET: u32 = 125;
pub const SYS_CAPSET: u32 = 126;
pub const SYS_SETHOSTNAME: u32 = 170;
pub const SYS_UNSHARE: u32 = 272;
pub const SYS_SETNS: u32 = 308;
pub const SYS_SECCOMP: u32 = 317;

/// Block major of the storage devices as seen by the devices controller.
pub const STORAGE_MAJOR: u32 = 8;

/// Minors per storage device (`sda` = 8:0, `sdb` = 8:16, ...).
pub const STORAGE_MINORS: u32 = 16;

/// A positive pid that fits in a `pid_t`.  Wider values are not wrapped.
fn signal_pid(raw: u64) -> Option<u32> {
    let pid = i32::try_from(raw as i64).ok()?;
    u32::try_from(pid).ok().filter(|&p| p > 0)
}

/// Device number of storage device `dev`.
pub fn storage_device_number(dev: usize) -> DeviceNumber {
    DeviceNumber::new(STORAGE_MAJOR, dev as u32 * STORAGE_MINORS)
}

// ============================================================================
// ABI types
// ============================================================================

/// Register state of one syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallFrame {
    pub nr: u32,
    pub args: [u64; 6],
    /// Instruction pointer, visible to seccomp filters.
    pub ip: u64,
}

impl SyscallFrame {
    pub const fn new(nr: u32, args: [u64; 6]) -> Self {
        SyscallFrame { nr, args, ip: 0 }
    }

    pub const fn with_ip(mut self, ip: u64) -> Self {
        self.ip = ip;
        self
    }
}

/// How a dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Value for the return register; negative values are errnos.
    Return(i64),
    /// The caller exited voluntarily with this code.
    Exited(i32),
    /// The caller was terminated by `signal` and will never run again.
    Terminated { signal: u8 },
    /// A synchronous signal is pending; the syscall didn't run.
    Signaled { signal: u8 },
    /// The caller's cgroup is frozen; nothing ran.
    Stopped,
}

impl Disposition {
    pub const fn errno(err: SyscallError) -> Self {
        Disposition::Return(err as i64)
    }

    /// The errno carried by a failed `Return`.
    pub fn error(&self) -> Option<SyscallError> {
        match *self {
            Disposition::Return(v) if v < 0 => SyscallError::from_i64(v),
            _ => None,
        }
    }
}

/// 系统调用错误码
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    EPERM = -1,      // 操作不允许
    ENOENT = -2,     // 文件或目录不存在
    ESRCH = -3,      // 进程不存在
    EIO = -5,        // I/O错误
    ECHILD = -10,    // 没有子进程
    EAGAIN = -11,    // 资源暂时不可用
    ENOMEM = -12,    // 内存不足
    EACCES = -13,    // 权限不足
    EFAULT = -14,    // 地址错误
    EBUSY = -16,     // 设备或资源忙
    EEXIST = -17,    // 已存在
    ENODEV = -19,    // 设备不存在
    EINVAL = -22,    // 无效参数
    ENOSPC = -28,    // 空间不足
    ENOSYS = -38,    // 功能未实现
    ETIMEDOUT = -110, // 操作超时
}

impl SyscallError {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        const ALL: [SyscallError; 16] = [
            SyscallError::EPERM,
            SyscallError::ENOENT,
            SyscallError::ESRCH,
            SyscallError::EIO,
            SyscallError::ECHILD,
            SyscallError::EAGAIN,
            SyscallError::ENOMEM,
            SyscallError::EACCES,
            SyscallError::EFAULT,
            SyscallError::EBUSY,
            SyscallError::EEXIST,
            SyscallError::ENODEV,
            SyscallError::EINVAL,
            SyscallError::ENOSPC,
            SyscallError::ENOSYS,
            SyscallError::ETIMEDOUT,
        ];
        ALL.iter().copied().find(|e| e.as_i64() == value)
    }
}

impl From<ProcessError> for SyscallError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::NoSuchContext | ProcessError::NotRunning | ProcessError::Killed => SyscallError::ESRCH,
            ProcessError::TableFull | ProcessError::StillRunning => SyscallError::EAGAIN,
            ProcessError::NotChild => SyscallError::ECHILD,
            ProcessError::KernelContext => SyscallError::EPERM,
            ProcessError::InvalidArgument => SyscallError::EINVAL,
        }
    }
}

impl From<CgroupError> for SyscallError {
    fn from(e: CgroupError) -> Self {
        match e {
            CgroupError::PidsLimitExceeded | CgroupError::IoThrottled => SyscallError::EAGAIN,
            CgroupError::MemoryLimit { .. } => SyscallError::ENOMEM,
            CgroupError::DeviceDenied => SyscallError::EPERM,
            CgroupError::Busy | CgroupError::NotEmpty | CgroupError::ControllerInUse => SyscallError::EBUSY,
            CgroupError::DepthLimit | CgroupError::CgroupLimit => SyscallError::ENOSPC,
            CgroupError::NotFound => SyscallError::ENOENT,
            CgroupError::NameExists => SyscallError::EEXIST,
            CgroupError::RootImmutable => SyscallError::EPERM,
            CgroupError::InvalidName
            | CgroupError::AlreadyAttached
            | CgroupError::NotAttached
            | CgroupError::InvalidLimit
            | CgroupError::ResidualExceeded
            | CgroupError::ControllerDisabled => SyscallError::EINVAL,
        }
    }
}

impl From<NamespaceError> for SyscallError {
    fn from(e: NamespaceError) -> Self {
        match e {
            NamespaceError::PoolExhausted | NamespaceError::TooDeep => SyscallError::ENOSPC,
            NamespaceError::NotVisible => SyscallError::ESRCH,
            NamespaceError::RefcountUnderflow => SyscallError::EIO,
            NamespaceError::InvalidProxy
            | NamespaceError::InvalidNamespace
            | NamespaceError::InvalidFlags
            | NamespaceError::InvalidName => SyscallError::EINVAL,
        }
    }
}

impl From<HalError> for SyscallError {
    fn from(e: HalError) -> Self {
        match e {
            HalError::InvalidArgument => SyscallError::EINVAL,
            HalError::Timeout => SyscallError::ETIMEDOUT,
            HalError::NoDevice => SyscallError::ENODEV,
            HalError::Io => SyscallError::EIO,
            HalError::Unsupported => SyscallError::ENOSYS,
        }
    }
}

impl From<KernelError> for SyscallError {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::Process(e) => e.into(),
            KernelError::Capability(CapError::NotPermitted(_) | CapError::PermittedGrowth) => SyscallError::EPERM,
            KernelError::Capability(_) => SyscallError::EINVAL,
            KernelError::Mac(LsmError::Denied) => SyscallError::EACCES,
            KernelError::Mac(LsmError::TableFull) => SyscallError::ENOMEM,
            KernelError::Mac(_) => SyscallError::EINVAL,
            KernelError::Seccomp(SeccompError::NotPermitted) => SyscallError::EPERM,
            KernelError::Seccomp(_) => SyscallError::EINVAL,
            KernelError::Namespace(e) => e.into(),
            KernelError::Cgroup(e) => e.into(),
            KernelError::Hal(e) => e.into(),
            KernelError::Config(_) | KernelError::Audit(_) => SyscallError::EINVAL,
        }
    }
}

/// Why execution stopped early.
enum Fault {
    Errno(SyscallError),
    /// The caller died while the syscall ran.
    Killed(u8),
}

impl From<SyscallError> for Fault {
    fn from(e: SyscallError) -> Self {
        Fault::Errno(e)
    }
}

impl From<KernelError> for Fault {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::Process(ProcessError::Killed) => Fault::Killed(SIGKILL),
            e => Fault::Errno(e.into()),
        }
    }
}

impl From<ProcessError> for Fault {
    fn from(e: ProcessError) -> Self {
        KernelError::from(e).into()
    }
}

impl From<CgroupError> for Fault {
    fn from(e: CgroupError) -> Self {
        Fault::Errno(e.into())
    }
}

impl From<NamespaceError> for Fault {
    fn from(e: NamespaceError) -> Self {
        Fault::Errno(e.into())
    }
}

impl From<HalError> for Fault {
    fn from(e: HalError) -> Self {
        Fault::Errno(e.into())
    }
}

type ExecResult = core::result::Result<Disposition, Fault>;

fn ok(value: i64) -> ExecResult {
    Ok(Disposition::Return(value))
}

fn page_round(len: u64) -> Option<u64> {
    Some(len.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1))
}

// ============================================================================
// Dispatcher
// ============================================================================

impl Kernel {
    /// Run one syscall on behalf of `caller`.  `buf` stands for the
    /// caller's user buffer.
    pub fn dispatch(&self, caller: ContextId, frame: &SyscallFrame, buf: &mut [u8]) -> Disposition {
        let snapshot = self.processes.lock().get(caller).cloned();
        let ctx = match snapshot {
            Some(ctx) => ctx,
            None => return Disposition::errno(SyscallError::ESRCH),
        };
        if let ContextState::Zombie { signal, .. } = ctx.state() {
            return match signal {
                Some(signal) => Disposition::Terminated { signal },
                None => Disposition::errno(SyscallError::ESRCH),
            };
        }
        if self.context_frozen(caller) {
            return Disposition::Stopped;
        }

        let mut events = Vec::new();
        let disposition = self.dispatch_checked(&ctx, frame, buf, &mut events);
        self.publish(events);
        disposition
    }

    fn dispatch_checked(
        &self,
        ctx: &Context,
        frame: &SyscallFrame,
        buf: &mut [u8],
        events: &mut Vec<KernelEvent>,
    ) -> Disposition {
        let id = ctx.id();

        // (1) capability
        if let Some(cap) = self.required_capability(ctx, frame) {
            if !ctx.caps().check(cap) {
                klog!(Warn, "cap: ctx {} lacks {} for syscall {}", id, cap, frame.nr);
                events.push(KernelEvent::CapabilityDenied {
                    ctx: id,
                    cap,
                    syscall: frame.nr,
                });
                return Disposition::errno(SyscallError::EPERM);
            }
        }

        if !ctx.is_kernel() {
            // (2) MAC
            if let Some((target, class, requested)) = self.mac_request(ctx, frame) {
                if !self.mac.compute(ctx.sid(), target, class, requested).is_allowed() {
                    let enforced = self.mac.mode() == MacMode::Enforcing;
                    klog!(
                        Warn,
                        "mac: ctx {} denied {:?} on {:?} (sid {} -> {}){}",
                        id,
                        requested,
                        class,
                        ctx.sid().0,
                        target.0,
                        if enforced { "" } else { " [permissive]" }
                    );
                    events.push(KernelEvent::MacDenied {
                        ctx: id,
                        source: ctx.sid(),
                        target,
                        class,
                        requested,
                        enforced,
                    });
                    if enforced {
                        return Disposition::errno(SyscallError::EACCES);
                    }
                }
            }

            // (3) seccomp
            if let Some(filter) = ctx.filter() {
                let data = SeccompData::new(frame.nr as i32, frame.ip, frame.args);
                let action = filter.evaluate(&data);
                if action != SeccompAction::Allow {
                    klog!(Warn, "seccomp: ctx {} syscall {} -> {:?}", id, frame.nr, action);
                    events.push(KernelEvent::Seccomp {
                        ctx: id,
                        syscall: frame.nr as i32,
                        action,
                    });
                }
                match action {
                    SeccompAction::Allow | SeccompAction::Log => {}
                    SeccompAction::Errno(e) => return Disposition::Return(-(e as i64)),
                    SeccompAction::Trap(_) => {
                        if let Some(c) = self.processes.lock().get_mut(id) {
                            c.set_pending_signal(SIGSYS);
                        }
                        return Disposition::Signaled { signal: SIGSYS };
                    }
                    SeccompAction::Kill => {
                        let mut procs = self.processes.lock();
                        let _ = self.exit_locked(&mut procs, id, 128 + SIGSYS as i32, Some(SIGSYS), events);
                        return Disposition::Terminated { signal: SIGSYS };
                    }
                }
            }
        }

        // (4) translation and (5) charge happen inside each handler
        match self.execute(ctx, frame, buf, events) {
            Ok(d) => d,
            Err(Fault::Errno(e)) => Disposition::errno(e),
            Err(Fault::Killed(signal)) => Disposition::Terminated { signal },
        }
    }

    /// The context a `kill(pid, ..)` from `ctx` would reach, if any.
    fn kill_target(&self, ctx: &Context, pid: u64) -> Option<ContextId> {
        let pid = signal_pid(pid)?;
        self.namespaces.lock().resolve_pid(ctx.proxy(), pid).ok()
    }

    fn required_capability(&self, ctx: &Context, frame: &SyscallFrame) -> Option<Capability> {
        match frame.nr {
            SYS_SETHOSTNAME | SYS_UNSHARE | SYS_SETNS => Some(Capability::SysAdmin),
            SYS_KILL => {
                let own = self.kill_target(ctx, frame.args[0]).map_or(false, |target| {
                    target == ctx.id()
                        || self
                            .processes
                            .lock()
                            .get(target)
                            .map_or(false, |t| t.parent() == ctx.id())
                });
                if own {
                    None
                } else {
                    Some(Capability::Kill)
                }
            }
            SYS_CAPSET => {
                let requested = CapTriple::from_abi(frame.args[0], frame.args[1], frame.args[2]).ok()?;
                if ctx.caps().permitted().contains(requested.permitted()) {
                    None
                } else {
                    Some(Capability::Setpcap)
                }
            }
            _ => None,
        }
    }

    fn mac_request(&self, ctx: &Context, frame: &SyscallFrame) -> Option<(Sid, ObjectClass, AccessVector)> {
        match frame.nr {
            SYS_PREAD => Some((self.device_sid(DeviceKind::Storage)?, ObjectClass::BlkFile, AccessVector::READ)),
            SYS_PWRITE => Some((self.device_sid(DeviceKind::Storage)?, ObjectClass::BlkFile, AccessVector::WRITE)),
            SYS_FORK => Some((ctx.sid(), ObjectClass::Process, AccessVector::FORK)),
            SYS_KILL => {
                let target = self.kill_target(ctx, frame.args[0])?;
                let sid = self.processes.lock().get(target)?.sid();
                Some((sid, ObjectClass::Process, AccessVector::SIGNAL))
            }
            SYS_SETHOSTNAME => Some((self.kernel_sid, ObjectClass::System, AccessVector::SETATTR)),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    fn execute(&self, ctx: &Context, frame: &SyscallFrame, buf: &mut [u8], events: &mut Vec<KernelEvent>) -> ExecResult {
        let a = frame.args;
        match frame.nr {
            SYS_MMAP => self.sys_mmap(ctx, a[0], events),
            SYS_MUNMAP => self.sys_munmap(ctx, a[0]),
            SYS_PREAD => self.sys_storage(ctx, IoDirection::Read, a, buf, events),
            SYS_PWRITE => self.sys_storage(ctx, IoDirection::Write, a, buf, events),
            SYS_GETPID => ok(self.namespaces.lock().pid_in(ctx.proxy(), ctx.id())? as i64),
            SYS_FORK => self.sys_fork(ctx),
            SYS_EXIT => self.sys_exit(ctx, a[0] as i64 as i32, events),
            SYS_WAIT => self.sys_wait(ctx, a[0] as i64 as i32, buf),
            SYS_KILL => self.sys_kill(ctx, a[0], a[1], events),
            SYS_GETHOSTNAME => self.sys_gethostname(ctx, buf),
            SYS_CAPGET => self.sys_capget(ctx, buf),
            SYS_CAPSET => self.sys_capset(ctx, a),
            SYS_SETHOSTNAME => self.sys_sethostname(ctx, a[0], buf),
            SYS_UNSHARE => self.sys_unshare(ctx, a[0]),
            SYS_SETNS => self.sys_setns(ctx, a[0]),
            SYS_SECCOMP => self.sys_seccomp(ctx, a[0], buf),
            _ => Err(SyscallError::ENOSYS.into()),
        }
    }

    fn sys_mmap(&self, ctx: &Context, len: u64, events: &mut Vec<KernelEvent>) -> ExecResult {
        let len = match page_round(len) {
            Some(0) | None => return Err(SyscallError::EINVAL.into()),
            Some(len) => len,
        };
        let mut procs = self.processes.lock();
        self.charge_memory_locked(&mut procs, ctx.id(), len, MemoryKind::Anon, events)?;
        match procs.live_mut(ctx.id())?.bump_mmap(len) {
            Some(addr) => ok(addr as i64),
            None => {
                self.cgroups.write().uncharge_memory(ctx.id(), len, MemoryKind::Anon);
                Err(SyscallError::ENOMEM.into())
            }
        }
    }

    fn sys_munmap(&self, ctx: &Context, len: u64) -> ExecResult {
        let len = page_round(len).ok_or(SyscallError::EINVAL)?;
        self.cgroups.write().uncharge_memory(ctx.id(), len, MemoryKind::Anon);
        ok(0)
    }

    /// pread/pwrite: devices controller, I/O caps, then the HAL.  A read
    /// that completes is charged to the page cache.
    fn sys_storage(
        &self,
        ctx: &Context,
        dir: IoDirection,
        args: [u64; 6],
        buf: &mut [u8],
        events: &mut Vec<KernelEvent>,
    ) -> ExecResult {
        let dev = args[0] as usize;
        let lba = args[1];
        let count = u32::try_from(args[2]).map_err(|_| SyscallError::EINVAL)?;
        let bytes = (count as usize)
            .checked_mul(SECTOR_SIZE)
            .ok_or(SyscallError::EINVAL)?;
        if count == 0 || buf.len() < bytes {
            return Err(SyscallError::EINVAL.into());
        }
        if dev >= self.hal.count(DeviceKind::Storage) {
            return Err(SyscallError::ENODEV.into());
        }
        let sectors = self.hal.storage_sectors(dev).ok_or(SyscallError::ENODEV)?;
        if lba.checked_add(count as u64).map_or(true, |end| end > sectors) {
            return Err(SyscallError::EINVAL.into());
        }

        let devnum = storage_device_number(dev);
        let access = match dir {
            IoDirection::Read => DeviceAccess::READ,
            IoDirection::Write => DeviceAccess::WRITE,
        };
        let window = self.hal.timer_frequency() as u64;
        let mut procs = self.processes.lock();
        let cg = {
            let mut cgroups = self.cgroups.write();
            cgroups.check_device(ctx.id(), DeviceType::Block, devnum, access)?;
            cgroups.charge_io(ctx.id(), devnum, dir, bytes as u64, self.hal.timer_ticks(), window)?;
            cgroups.cgroup_of(ctx.id()).ok_or(CgroupError::NotAttached)?
        };
        let transfer = match dir {
            IoDirection::Read => self.hal.storage_read(dev, lba, count, &mut buf[..bytes]),
            IoDirection::Write => self.hal.storage_write(dev, lba, count, &buf[..bytes]),
        };
        if let Err(e) = transfer {
            // Nothing moved, so the I/O budget goes back.
            self.cgroups.write().refund_io(cg, devnum, dir, bytes as u64);
            return Err(e.into());
        }
        if dir == IoDirection::Read {
            self.charge_memory_locked(&mut procs, ctx.id(), bytes as u64, MemoryKind::Cache, events)?;
        }
        ok(bytes as i64)
    }

    fn sys_fork(&self, ctx: &Context) -> ExecResult {
        let child = self.spawn(ctx.id())?;
        let pid = self.namespaces.lock().pid_in(ctx.proxy(), child)?;
        ok(pid as i64)
    }

    fn sys_exit(&self, ctx: &Context, code: i32, events: &mut Vec<KernelEvent>) -> ExecResult {
        let mut procs = self.processes.lock();
        self.exit_locked(&mut procs, ctx.id(), code, None, events)?;
        Ok(Disposition::Exited(code))
    }

    /// Non-blocking wait.  `pid` of 0 or -1 means any child.  Returns the
    /// reaped child's pid, or 0 when every matching child still runs.
    fn sys_wait(&self, ctx: &Context, pid: i32, buf: &mut [u8]) -> ExecResult {
        let (child, local) = {
            let procs = self.processes.lock();
            let ns = self.namespaces.lock();
            let wanted = if pid > 0 {
                let target = ns.resolve_pid(ctx.proxy(), pid as u32).map_err(|_| SyscallError::ECHILD)?;
                Some(target)
            } else if pid == 0 || pid == -1 {
                None
            } else {
                return Err(SyscallError::EINVAL.into());
            };
            let mut matching = procs
                .children(ctx.id())
                .filter(|c| wanted.map_or(true, |w| w == c.id()))
                .peekable();
            if matching.peek().is_none() {
                return Err(SyscallError::ECHILD.into());
            }
            match matching.find(|c| !c.is_running()) {
                Some(zombie) => {
                    let local = ns.pid_in(ctx.proxy(), zombie.id()).unwrap_or(zombie.id());
                    (zombie.id(), local)
                }
                None => return ok(0),
            }
        };

        let status = self.reap(ctx.id(), child)?;
        if let Some(out) = buf.get_mut(..4) {
            out.copy_from_slice(&status.to_le_bytes());
        }
        ok(local as i64)
    }

    fn sys_kill(&self, ctx: &Context, pid: u64, sig: u64, events: &mut Vec<KernelEvent>) -> ExecResult {
        if signal_pid(pid).is_none() || sig > MAX_SIGNAL as u64 {
            return Err(SyscallError::EINVAL.into());
        }
        let sig = sig as u8;
        let target = self.kill_target(ctx, pid).ok_or(SyscallError::ESRCH)?;
        if target == crate::process::KERNEL_CONTEXT {
            return Err(SyscallError::EPERM.into());
        }

        let mut procs = self.processes.lock();
        let running = procs.get(target).map_or(false, |t| t.is_running());
        if sig == 0 || !running {
            return ok(0);
        }
        if sig == SIGKILL {
            self.exit_locked(&mut procs, target, 128 + SIGKILL as i32, Some(SIGKILL), events)?;
            if target == ctx.id() {
                return Ok(Disposition::Terminated { signal: SIGKILL });
            }
            return ok(0);
        }
        procs.live_mut(target)?.set_pending_signal(sig);
        ok(0)
    }

    fn sys_gethostname(&self, ctx: &Context, buf: &mut [u8]) -> ExecResult {
        let name = self.hostname(ctx.id())?;
        let bytes = name.as_bytes();
        if buf.len() <= bytes.len() {
            return Err(SyscallError::EINVAL.into());
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        buf[bytes.len()] = 0;
        ok(0)
    }

    /// Writes `permitted`, `effective`, `inheritable` as three LE u64s.
    fn sys_capget(&self, ctx: &Context, buf: &mut [u8]) -> ExecResult {
        if buf.len() < 24 {
            return Err(SyscallError::EFAULT.into());
        }
        let caps = ctx.caps();
        buf[0..8].copy_from_slice(&caps.permitted().bits().to_le_bytes());
        buf[8..16].copy_from_slice(&caps.effective().bits().to_le_bytes());
        buf[16..24].copy_from_slice(&caps.inheritable().bits().to_le_bytes());
        ok(0)
    }

    fn sys_capset(&self, ctx: &Context, args: [u64; 6]) -> ExecResult {
        if ctx.is_kernel() {
            return Err(SyscallError::EPERM.into());
        }
        let requested = CapTriple::from_abi(args[0], args[1], args[2]).map_err(|_| SyscallError::EINVAL)?;
        let mut procs = self.processes.lock();
        procs
            .live_mut(ctx.id())?
            .caps_mut()
            .update_from_user(requested)
            .map_err(|_| SyscallError::EPERM)?;
        ok(0)
    }

    fn sys_sethostname(&self, ctx: &Context, len: u64, buf: &mut [u8]) -> ExecResult {
        let name = buf.get(..len as usize).ok_or(SyscallError::EFAULT)?;
        self.set_hostname(ctx.id(), name)?;
        ok(0)
    }

    fn sys_unshare(&self, ctx: &Context, flags: u64) -> ExecResult {
        let flags = CloneFlags::from_bits(flags).ok_or(SyscallError::EINVAL)?;
        if !flags.is_empty() {
            self.unshare(ctx.id(), flags)?;
        }
        ok(0)
    }

    fn sys_setns(&self, ctx: &Context, proxy: u64) -> ExecResult {
        let proxy = u32::try_from(proxy).map_err(|_| SyscallError::EINVAL)?;
        self.setns(ctx.id(), ProxyId(proxy))?;
        ok(0)
    }

    fn sys_seccomp(&self, ctx: &Context, len: u64, buf: &mut [u8]) -> ExecResult {
        if ctx.is_kernel() {
            return Err(SyscallError::EPERM.into());
        }
        let image = buf.get(..len as usize).ok_or(SyscallError::EFAULT)?;
        let filter = SeccompFilter::from_bytes(image).map_err(|_| SyscallError::EINVAL)?;
        self.attach_filter(ctx.id(), Arc::new(filter))?;
        ok(0)
    }
}
