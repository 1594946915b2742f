//! Platform seam.
//!
//! Every hardware access the HAL performs goes through [`Platform`].  Port
//! numbers and register layouts stay in the generic code (PCI, PIC, PIT);
//! implementations only move bytes.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::cpu::Cpuid;
use crate::device::DeviceKind;
use crate::{HalError, Result};

/// Primitive hardware operations.
pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    fn inb(&self, port: u16) -> u8;
    fn outb(&self, port: u16, value: u8);
    fn inw(&self, port: u16) -> u16;
    fn outw(&self, port: u16, value: u16);
    fn inl(&self, port: u16) -> u32;
    fn outl(&self, port: u16, value: u32);

    /// Current value of the hardware-driven tick counter.
    fn ticks(&self) -> u64;

    /// Advance the tick counter by one; called from the timer interrupt.
    fn timer_tick(&self);

    /// Spin-loop hint used by busy waits.
    fn cpu_pause(&self) {
        core::hint::spin_loop();
    }

    /// Execute CPUID, if the architecture has it.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Option<Cpuid>;

    /// Whether a fixed legacy device (keyboard, mouse) answers.
    fn probe_legacy(&self, kind: DeviceKind) -> bool;

    /// Number of block devices the platform exposes.
    fn disk_count(&self) -> usize;

    /// Capacity of disk `unit` in sectors.
    fn disk_sectors(&self, unit: usize) -> Option<u64>;

    /// Read `count` sectors.  `buf` is exactly `count * SECTOR_SIZE` bytes.
    fn read_sectors(&self, unit: usize, lba: u64, count: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `count` sectors.  `buf` is exactly `count * SECTOR_SIZE` bytes.
    fn write_sectors(&self, unit: usize, lba: u64, count: u32, buf: &[u8]) -> Result<()>;
}

impl<P: Platform + ?Sized> Platform for Arc<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }
    fn inb(&self, port: u16) -> u8 {
        (**self).inb(port)
    }
    fn outb(&self, port: u16, value: u8) {
        (**self).outb(port, value)
    }
    fn inw(&self, port: u16) -> u16 {
        (**self).inw(port)
    }
    fn outw(&self, port: u16, value: u16) {
        (**self).outw(port, value)
    }
    fn inl(&self, port: u16) -> u32 {
        (**self).inl(port)
    }
    fn outl(&self, port: u16, value: u32) {
        (**self).outl(port, value)
    }
    fn ticks(&self) -> u64 {
        (**self).ticks()
    }
    fn timer_tick(&self) {
        (**self).timer_tick()
    }
    fn cpu_pause(&self) {
        (**self).cpu_pause()
    }
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Option<Cpuid> {
        (**self).cpuid(leaf, subleaf)
    }
    fn probe_legacy(&self, kind: DeviceKind) -> bool {
        (**self).probe_legacy(kind)
    }
    fn disk_count(&self) -> usize {
        (**self).disk_count()
    }
    fn disk_sectors(&self, unit: usize) -> Option<u64> {
        (**self).disk_sectors(unit)
    }
    fn read_sectors(&self, unit: usize, lba: u64, count: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read_sectors(unit, lba, count, buf)
    }
    fn write_sectors(&self, unit: usize, lba: u64, count: u32, buf: &[u8]) -> Result<()> {
        (**self).write_sectors(unit, lba, count, buf)
    }
}

// ============================================================================
// Stub platform
// ============================================================================

/// Platform for targets without x86 port I/O.
///
/// Port reads float high, so PCI enumeration finds nothing and the registry
/// still holds the built-in descriptors (marked absent).  Device operations
/// report [`HalError::NoDevice`].  With no hardware timer, each pause counts
/// as one tick so busy waits still terminate.
pub struct StubPlatform {
    ticks: AtomicU64,
}

impl StubPlatform {
    pub const fn new() -> Self {
        StubPlatform { ticks: AtomicU64::new(0) }
    }
}

impl Default for StubPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for StubPlatform {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn inb(&self, _port: u16) -> u8 {
        0xFF
    }

    fn outb(&self, _port: u16, _value: u8) {}

    fn inw(&self, _port: u16) -> u16 {
        0xFFFF
    }

    fn outw(&self, _port: u16, _value: u16) {}

    fn inl(&self, _port: u16) -> u32 {
        0xFFFF_FFFF
    }

    fn outl(&self, _port: u16, _value: u32) {}

    fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    fn timer_tick(&self) {
        self.ticks.fetch_add(1, Ordering::AcqRel);
    }

    fn cpu_pause(&self) {
        core::hint::spin_loop();
        self.timer_tick();
    }

    fn cpuid(&self, _leaf: u32, _subleaf: u32) -> Option<Cpuid> {
        None
    }

    fn probe_legacy(&self, _kind: DeviceKind) -> bool {
        false
    }

    fn disk_count(&self) -> usize {
        0
    }

    fn disk_sectors(&self, _unit: usize) -> Option<u64> {
        None
    }

    fn read_sectors(&self, _unit: usize, _lba: u64, _count: u32, _buf: &mut [u8]) -> Result<()> {
        Err(HalError::NoDevice)
    }

    fn write_sectors(&self, _unit: usize, _lba: u64, _count: u32, _buf: &[u8]) -> Result<()> {
        Err(HalError::NoDevice)
    }
}

// ============================================================================
// MMIO
// ============================================================================

/// Volatile 32-bit MMIO read.
///
/// # Safety
///
/// `addr` must be a mapped, 4-byte aligned device register.
#[inline]
pub unsafe fn mmio_read32(addr: usize) -> u32 {
    core::ptr::read_volatile(addr as *const u32)
}

/// Volatile 32-bit MMIO write.
///
/// # Safety
///
/// `addr` must be a mapped, 4-byte aligned device register.
#[inline]
pub unsafe fn mmio_write32(addr: usize, value: u32) {
    core::ptr::write_volatile(addr as *mut u32, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_platform_defaults() {
        let stub = StubPlatform::new();
        assert_eq!(stub.inl(0xCFC), 0xFFFF_FFFF);
        assert_eq!(stub.inb(0x60), 0xFF);
        assert!(stub.cpuid(0, 0).is_none());
        assert!(!stub.probe_legacy(DeviceKind::Keyboard));
        let mut buf = [0u8; 512];
        assert_eq!(stub.read_sectors(0, 0, 1, &mut buf), Err(HalError::NoDevice));

        // Pausing stands in for the missing timer.
        let before = stub.ticks();
        stub.cpu_pause();
        assert_eq!(stub.ticks(), before + 1);
    }

    #[test]
    fn test_mmio_volatile_access() {
        let mut register: u32 = 0;
        let addr = &mut register as *mut u32 as usize;
        unsafe {
            mmio_write32(addr, 0xDEAD_BEEF);
            assert_eq!(mmio_read32(addr), 0xDEAD_BEEF);
        }
    }
}
