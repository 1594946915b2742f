//! Kernel event model and audit log.
//!
//! Every subsystem that needs to report something observable (a denial, an
//! OOM kill, a pressure change) builds a [`KernelEvent`] and hands it to the
//! kernel's [`EventBus`].  The bus always records into its [`AuditRing`] and
//! then fans the event out to any subscribed [`EventSink`].
//!
//! # Overflow
//!
//! The ring has a fixed capacity.  When it is full the oldest record is
//! evicted and the `dropped` counter grows; each record carries the number
//! of events lost immediately before it so readers can see the gap.
//!
//! # Locking
//!
//! Ring operations run with interrupts disabled (`hal::without_interrupts`)
//! so an interrupt-context emitter can never deadlock against a reader.
//! Sinks are invoked after the ring lock is released.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use cap::Capability;
use lsm::{AccessVector, ObjectClass, Sid};
use seccomp::SeccompAction;
use spin::{Mutex, RwLock};

// ============================================================================
// Configuration
// ============================================================================

/// Default ring capacity (number of events).
pub const DEFAULT_CAPACITY: usize = 256;

/// Largest accepted ring capacity.
pub const MAX_CAPACITY: usize = 8192;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditError {
    /// Capacity zero or above [`MAX_CAPACITY`].
    InvalidCapacity,
    /// Recording is switched off.
    Disabled,
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditError::InvalidCapacity => write!(f, "audit: invalid ring capacity"),
            AuditError::Disabled => write!(f, "audit: recording disabled"),
        }
    }
}

// ============================================================================
// Event Classification
// ============================================================================

/// High-level category of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AuditKind {
    /// Capability, MAC or seccomp decisions.
    Security = 0,
    /// Memory accounting (OOM, pressure).
    Memory = 1,
    /// Freezer transitions.
    Freezer = 2,
    /// Context lifecycle.
    Process = 3,
}

/// Outcome of the audited operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AuditOutcome {
    /// Operation went ahead.
    Success = 0,
    /// Operation denied by security policy.
    Denied = 1,
    /// Informational.
    Info = 2,
}

/// Derived memory pressure band of a cgroup.
///
/// Ordered so `a > b` means "more pressure".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PressureLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl PressureLevel {
    /// Band for `usage / limit`: `<50%`, `<70%`, `<85%`, `<95%`, `>=95%`.
    ///
    /// An unlimited cgroup has no pressure; a zero limit is critical.
    pub fn from_usage(usage: u64, limit: Option<u64>) -> PressureLevel {
        let limit = match limit {
            None => return PressureLevel::None,
            Some(0) => return PressureLevel::Critical,
            Some(limit) => limit,
        };
        let percent = (usage as u128 * 100) / limit as u128;
        match percent {
            0..=49 => PressureLevel::None,
            50..=69 => PressureLevel::Low,
            70..=84 => PressureLevel::Medium,
            85..=94 => PressureLevel::High,
            _ => PressureLevel::Critical,
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PressureLevel::None => "none",
            PressureLevel::Low => "low",
            PressureLevel::Medium => "medium",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Kernel Events
// ============================================================================

/// Something the kernel wants reported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelEvent {
    /// A privileged operation lacked an effective capability.
    CapabilityDenied { ctx: u32, cap: Capability, syscall: u32 },
    /// MAC policy did not grant the requested access.  `enforced` is false
    /// in permissive mode, where the access went ahead.
    MacDenied {
        ctx: u32,
        source: Sid,
        target: Sid,
        class: ObjectClass,
        requested: AccessVector,
        enforced: bool,
    },
    /// A seccomp filter returned something other than allow.
    Seccomp { ctx: u32, syscall: i32, action: SeccompAction },
    /// A context was killed to satisfy a memory limit.
    OomKill { cgroup: u32, victim: u32, usage: u64, limit: u64 },
    /// A cgroup moved into a higher pressure band.
    MemoryPressure { cgroup: u32, from: PressureLevel, to: PressureLevel },
    /// A cgroup's own freezer flag was set.
    Frozen { cgroup: u32 },
    /// A cgroup's own freezer flag was cleared.
    Thawed { cgroup: u32 },
    /// A context exited.  `signal` is set when it was killed.
    ContextExit { ctx: u32, code: i32, signal: Option<u8> },
}

impl KernelEvent {
    pub fn kind(&self) -> AuditKind {
        match self {
            KernelEvent::CapabilityDenied { .. } | KernelEvent::MacDenied { .. } | KernelEvent::Seccomp { .. } => {
                AuditKind::Security
            }
            KernelEvent::OomKill { .. } | KernelEvent::MemoryPressure { .. } => AuditKind::Memory,
            KernelEvent::Frozen { .. } | KernelEvent::Thawed { .. } => AuditKind::Freezer,
            KernelEvent::ContextExit { .. } => AuditKind::Process,
        }
    }

    pub fn outcome(&self) -> AuditOutcome {
        match self {
            KernelEvent::CapabilityDenied { .. } => AuditOutcome::Denied,
            KernelEvent::MacDenied { enforced, .. } => {
                if *enforced {
                    AuditOutcome::Denied
                } else {
                    AuditOutcome::Success
                }
            }
            KernelEvent::Seccomp { action, .. } => {
                if action.proceeds() {
                    AuditOutcome::Success
                } else {
                    AuditOutcome::Denied
                }
            }
            _ => AuditOutcome::Info,
        }
    }

    /// The context the event is about, if any.
    pub fn subject(&self) -> Option<u32> {
        match self {
            KernelEvent::CapabilityDenied { ctx, .. }
            | KernelEvent::MacDenied { ctx, .. }
            | KernelEvent::Seccomp { ctx, .. }
            | KernelEvent::ContextExit { ctx, .. } => Some(*ctx),
            KernelEvent::OomKill { victim, .. } => Some(*victim),
            _ => None,
        }
    }
}

impl fmt::Display for KernelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelEvent::CapabilityDenied { ctx, cap, syscall } => {
                write!(f, "ctx {} denied {} for syscall {}", ctx, cap.name(), syscall)
            }
            KernelEvent::MacDenied {
                ctx,
                source,
                target,
                class,
                requested,
                enforced,
            } => write!(
                f,
                "ctx {} mac {} {} -> {} {:?}{}",
                ctx,
                class,
                source,
                target,
                requested,
                if *enforced { "" } else { " (permissive)" }
            ),
            KernelEvent::Seccomp { ctx, syscall, action } => {
                write!(f, "ctx {} seccomp {} on syscall {}", ctx, action, syscall)
            }
            KernelEvent::OomKill {
                cgroup,
                victim,
                usage,
                limit,
            } => write!(f, "cgroup {} oom-killed ctx {} ({} of {} bytes)", cgroup, victim, usage, limit),
            KernelEvent::MemoryPressure { cgroup, from, to } => {
                write!(f, "cgroup {} pressure {} -> {}", cgroup, from, to)
            }
            KernelEvent::Frozen { cgroup } => write!(f, "cgroup {} frozen", cgroup),
            KernelEvent::Thawed { cgroup } => write!(f, "cgroup {} thawed", cgroup),
            KernelEvent::ContextExit { ctx, code, signal } => match signal {
                Some(sig) => write!(f, "ctx {} killed by signal {}", ctx, sig),
                None => write!(f, "ctx {} exited with {}", ctx, code),
            },
        }
    }
}

/// Subscriber for kernel events.
///
/// Called synchronously on the emitting path after kernel locks are
/// released; implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &KernelEvent);
}

// ============================================================================
// Audit Ring
// ============================================================================

/// One stored record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditRecord {
    /// Monotonically increasing sequence number, starting at 0.
    pub seq: u64,
    /// Timer ticks since boot.
    pub timestamp: u64,
    /// Events evicted immediately before this one.
    pub dropped: u64,
    pub event: KernelEvent,
}

/// Drained contents of the ring.
#[derive(Debug)]
pub struct AuditSnapshot {
    pub records: Vec<AuditRecord>,
    /// Events dropped since the previous snapshot.
    pub dropped: u64,
}

/// Ring statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuditStats {
    /// Events recorded since boot.
    pub total_events: u64,
    /// Events currently buffered.
    pub buffered_events: u64,
    /// Events evicted since boot.
    pub dropped_events: u64,
    pub capacity: u64,
}

struct RingState {
    buf: VecDeque<AuditRecord>,
    capacity: usize,
    next_seq: u64,
    /// Evictions since the last push.
    pending_dropped: u64,
    /// Evictions since the last snapshot.
    dropped_since_snapshot: u64,
    dropped_total: u64,
}

impl RingState {
    fn push(&mut self, timestamp: u64, event: KernelEvent) -> u64 {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
            self.pending_dropped = self.pending_dropped.saturating_add(1);
            self.dropped_since_snapshot = self.dropped_since_snapshot.saturating_add(1);
            self.dropped_total = self.dropped_total.saturating_add(1);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.buf.push_back(AuditRecord {
            seq,
            timestamp,
            dropped: core::mem::take(&mut self.pending_dropped),
            event,
        });
        seq
    }
}

/// Source of record timestamps.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Bounded audit log that keeps the most recent events.
pub struct AuditRing {
    state: Mutex<RingState>,
    enabled: AtomicBool,
    clock: Option<Clock>,
}

impl AuditRing {
    pub fn new(capacity: usize) -> Result<Self, AuditError> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(AuditError::InvalidCapacity);
        }
        Ok(AuditRing {
            state: Mutex::new(RingState {
                buf: VecDeque::with_capacity(capacity),
                capacity,
                next_seq: 0,
                pending_dropped: 0,
                dropped_since_snapshot: 0,
                dropped_total: 0,
            }),
            enabled: AtomicBool::new(true),
            clock: None,
        })
    }

    /// Stamp records with `clock()` instead of zero.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Store an event, returning its sequence number.
    pub fn record(&self, event: KernelEvent) -> Result<u64, AuditError> {
        if !self.is_enabled() {
            return Err(AuditError::Disabled);
        }
        let timestamp = self.clock.as_ref().map_or(0, |clock| clock());
        Ok(hal::without_interrupts(|| self.state.lock().push(timestamp, event)))
    }

    /// Drain every buffered record.
    pub fn snapshot(&self) -> AuditSnapshot {
        hal::without_interrupts(|| {
            let mut state = self.state.lock();
            let records = state.buf.drain(..).collect();
            AuditSnapshot {
                records,
                dropped: core::mem::take(&mut state.dropped_since_snapshot),
            }
        })
    }

    /// Up to `max` records with `seq >= cursor`, without draining.
    pub fn read_from(&self, cursor: u64, max: usize) -> Vec<AuditRecord> {
        hal::without_interrupts(|| {
            let state = self.state.lock();
            state
                .buf
                .iter()
                .filter(|r| r.seq >= cursor)
                .take(max)
                .cloned()
                .collect()
        })
    }

    pub fn stats(&self) -> AuditStats {
        hal::without_interrupts(|| {
            let state = self.state.lock();
            AuditStats {
                total_events: state.next_seq,
                buffered_events: state.buf.len() as u64,
                dropped_events: state.dropped_total,
                capacity: state.capacity as u64,
            }
        })
    }

    pub fn len(&self) -> usize {
        hal::without_interrupts(|| self.state.lock().buf.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for AuditRing {
    fn emit(&self, event: &KernelEvent) {
        // Disabled rings silently discard.
        let _ = self.record(event.clone());
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// The kernel's single event channel: the audit ring plus subscribers.
pub struct EventBus {
    ring: AuditRing,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(ring: AuditRing) -> Self {
        EventBus {
            ring,
            sinks: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
        }
    }

    pub fn ring(&self) -> &AuditRing {
        &self.ring
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    pub fn subscribers(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn publish(&self, event: KernelEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        // Clone the list so a sink may subscribe another without deadlock.
        let sinks: Vec<Arc<dyn EventSink>> = self.sinks.read().clone();
        for sink in &sinks {
            sink.emit(&event);
        }
        let _ = self.ring.record(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn exit(ctx: u32) -> KernelEvent {
        KernelEvent::ContextExit {
            ctx,
            code: 0,
            signal: None,
        }
    }

    #[test]
    fn test_capacity_validation() {
        assert!(matches!(AuditRing::new(0), Err(AuditError::InvalidCapacity)));
        assert!(matches!(AuditRing::new(MAX_CAPACITY + 1), Err(AuditError::InvalidCapacity)));
        assert!(AuditRing::new(MAX_CAPACITY).is_ok());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let ring = AuditRing::new(3).unwrap();
        for ctx in 0..5 {
            ring.record(exit(ctx)).unwrap();
        }
        let stats = ring.stats();
        assert_eq!(stats.total_events, 5);
        assert_eq!(stats.buffered_events, 3);
        assert_eq!(stats.dropped_events, 2);

        let snap = ring.snapshot();
        let seqs: Vec<u64> = snap.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, [2, 3, 4]);
        assert_eq!(snap.dropped, 2);
        assert_eq!(snap.records[0].event, exit(2));
        // The gap is reported on the record that followed each eviction.
        assert_eq!(snap.records[2].dropped, 1);
        assert!(ring.is_empty());
        assert_eq!(ring.snapshot().dropped, 0);
    }

    #[test]
    fn test_cursor_read_does_not_drain() {
        let ring = AuditRing::new(8).unwrap();
        for ctx in 0..4 {
            ring.record(exit(ctx)).unwrap();
        }
        let batch = ring.read_from(2, 10);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].seq, 2);
        assert_eq!(ring.read_from(0, 1).len(), 1);
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn test_disabled_ring_rejects() {
        let ring = AuditRing::new(2).unwrap();
        ring.disable();
        assert_eq!(ring.record(exit(1)), Err(AuditError::Disabled));
        ring.enable();
        assert_eq!(ring.record(exit(1)), Ok(0));
    }

    #[test]
    fn test_clock_stamps_records() {
        let ticks = Arc::new(AtomicU64::new(41));
        let source = ticks.clone();
        let ring = AuditRing::new(4)
            .unwrap()
            .with_clock(Arc::new(move || source.fetch_add(1, Ordering::SeqCst)));
        ring.record(exit(1)).unwrap();
        ring.record(exit(2)).unwrap();
        let snap = ring.snapshot();
        assert_eq!(snap.records[0].timestamp, 41);
        assert_eq!(snap.records[1].timestamp, 42);
    }

    struct Collect(StdMutex<Vec<KernelEvent>>);

    impl EventSink for Collect {
        fn emit(&self, event: &KernelEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_bus_fans_out() {
        let bus = EventBus::new(AuditRing::new(4).unwrap());
        let sink = Arc::new(Collect(StdMutex::new(Vec::new())));
        bus.subscribe(sink.clone());
        bus.publish(KernelEvent::Frozen { cgroup: 3 });
        assert_eq!(*sink.0.lock().unwrap(), [KernelEvent::Frozen { cgroup: 3 }]);
        assert_eq!(bus.ring().len(), 1);
        assert_eq!(bus.published(), 1);
    }

    #[test]
    fn test_pressure_bands() {
        let mib = 1 << 20;
        assert_eq!(PressureLevel::from_usage(90 * mib, None), PressureLevel::None);
        assert_eq!(PressureLevel::from_usage(49 * mib, Some(100 * mib)), PressureLevel::None);
        assert_eq!(PressureLevel::from_usage(50 * mib, Some(100 * mib)), PressureLevel::Low);
        assert_eq!(PressureLevel::from_usage(70 * mib, Some(100 * mib)), PressureLevel::Medium);
        assert_eq!(PressureLevel::from_usage(90 * mib, Some(100 * mib)), PressureLevel::High);
        assert_eq!(PressureLevel::from_usage(95 * mib, Some(100 * mib)), PressureLevel::Critical);
        assert_eq!(PressureLevel::from_usage(0, Some(0)), PressureLevel::Critical);
        assert!(PressureLevel::High > PressureLevel::Low);
    }

    #[test]
    fn test_event_classification() {
        let denied = KernelEvent::CapabilityDenied {
            ctx: 4,
            cap: Capability::SysAdmin,
            syscall: 170,
        };
        assert_eq!(denied.kind(), AuditKind::Security);
        assert_eq!(denied.outcome(), AuditOutcome::Denied);
        assert_eq!(denied.subject(), Some(4));

        let log = KernelEvent::Seccomp {
            ctx: 4,
            syscall: 39,
            action: SeccompAction::Log,
        };
        assert_eq!(log.outcome(), AuditOutcome::Success);
        assert_eq!(KernelEvent::Thawed { cgroup: 1 }.subject(), None);
    }
}
