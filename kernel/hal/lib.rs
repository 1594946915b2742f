//! Hardware abstraction layer.
//!
//! The HAL owns everything that touches hardware on behalf of the kernel:
//!
//! - the device registry (built-in legacy devices plus every PCI function)
//! - PCI configuration space access through the `0xCF8`/`0xCFC` mechanism
//! - block storage I/O for the primary disk(s)
//! - a monotonic, interrupt-driven tick counter and busy-wait delays
//! - CPU topology discovery and interrupt-flag primitives
//! - 8259 PIC remapping
//!
//! All hardware access goes through a [`Platform`] implementation so the same
//! registry and enumeration logic runs on bare metal ([`X86Platform`]), on
//! targets without port I/O ([`StubPlatform`]) and in tests ([`SimPlatform`]).
//!
//! # Error values
//!
//! Every fallible operation returns [`HalError`], whose [`HalError::code`]
//! is one of the signed values in [`status`].  Nothing in this crate panics on
//! caller input.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::{Mutex, RwLock};

pub mod cpu;
pub mod device;
pub mod pci;
pub mod pic;
pub mod platform;
pub mod sim;
pub mod timer;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86;

pub use cpu::{without_interrupts, CpuTopology, Cpuid};
pub use device::{DeviceHandle, DeviceId, DeviceInfo, DeviceKind, DeviceName, DeviceRegistry, Driver};
pub use pci::{pci_address, PciFunction};
pub use pic::{irq_vector, PIC1_OFFSET, PIC2_OFFSET, SYSCALL_VECTOR};
pub use platform::{mmio_read32, mmio_write32, Platform, StubPlatform};
pub use sim::{SimPciFunction, SimPlatform};
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use x86::X86Platform;

/// Bytes per storage sector.
pub const SECTOR_SIZE: usize = 512;

/// Default PIT frequency when the configuration does not override it.
pub const DEFAULT_TIMER_HZ: u32 = 1000;

// ============================================================================
// Error values
// ============================================================================

/// Signed status codes returned across the kernel ABI.
///
/// `OK`, `EINVAL`, `ETIMEDOUT` and `ERROR` form the base set; `ENODEV` and
/// `EIO` are extensions that keep those meanings intact.
pub mod status {
    pub const OK: i32 = 0;
    pub const ERROR: i32 = -1;
    pub const EIO: i32 = -5;
    pub const ENODEV: i32 = -19;
    pub const EINVAL: i32 = -22;
    pub const ETIMEDOUT: i32 = -110;
}

/// HAL error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// Out-of-range index, missing buffer, zero-length transfer.
    InvalidArgument,
    /// Device did not become ready in time.
    Timeout,
    /// The device is absent or the platform has no such hardware.
    NoDevice,
    /// The device reported an error.
    Io,
    /// Operation not available on this platform.
    Unsupported,
}

impl HalError {
    /// Numeric status for the kernel ABI.
    pub const fn code(self) -> i32 {
        match self {
            HalError::InvalidArgument => status::EINVAL,
            HalError::Timeout => status::ETIMEDOUT,
            HalError::NoDevice => status::ENODEV,
            HalError::Io => status::EIO,
            HalError::Unsupported => status::ERROR,
        }
    }
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::InvalidArgument => write!(f, "invalid argument"),
            HalError::Timeout => write!(f, "device timeout"),
            HalError::NoDevice => write!(f, "no such device"),
            HalError::Io => write!(f, "device I/O error"),
            HalError::Unsupported => write!(f, "unsupported on this platform"),
        }
    }
}

pub type Result<T> = core::result::Result<T, HalError>;

// ============================================================================
// HAL instance
// ============================================================================

/// The hardware abstraction layer instance owned by the kernel.
///
/// Shared-read for every other subsystem; only the HAL mutates the registry.
pub struct Hal {
    platform: Box<dyn Platform>,
    registry: RwLock<DeviceRegistry>,
    drivers: Mutex<Vec<Arc<dyn Driver>>>,
    topology: RwLock<Option<CpuTopology>>,
    timer_hz: u32,
}

impl Hal {
    /// Wrap a platform.  Nothing is probed until [`Hal::enumerate`].
    pub fn new(platform: Box<dyn Platform>, timer_hz: u32) -> Self {
        let timer_hz = if timer_hz == 0 { DEFAULT_TIMER_HZ } else { timer_hz };
        Hal {
            platform,
            registry: RwLock::new(DeviceRegistry::new()),
            drivers: Mutex::new(Vec::new()),
            topology: RwLock::new(None),
            timer_hz,
        }
    }

    /// Name of the underlying platform.
    pub fn platform_name(&self) -> &'static str {
        self.platform.name()
    }

    /// Direct access to the platform for port-level work (PIC, PIT).
    pub fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    // ------------------------------------------------------------------------
    // Enumeration and lookup
    // ------------------------------------------------------------------------

    /// Build the device table.  Idempotent: later calls return the count
    /// recorded by the first one without probing again.
    pub fn enumerate(&self) -> usize {
        {
            let registry = self.registry.read();
            if registry.is_enumerated() {
                return registry.len();
            }
        }

        let mut registry = self.registry.write();
        // Lost the race to another enumerator.
        if registry.is_enumerated() {
            return registry.len();
        }

        let functions = pci::scan(&*self.platform);
        registry.populate(&*self.platform, functions);
        klog::klog!(
            Info,
            "hal: {} devices enumerated ({} PCI functions) on {}",
            registry.len(),
            registry.pci_functions().len(),
            self.platform.name()
        );
        registry.len()
    }

    /// Number of registered devices of `kind`.
    pub fn count(&self, kind: DeviceKind) -> usize {
        self.registry.read().count(kind)
    }

    /// The `index`-th device of `kind`, in enumeration order.
    pub fn info(&self, kind: DeviceKind, index: usize) -> Option<DeviceInfo> {
        self.registry.read().info(kind, index).cloned()
    }

    /// Lookup by stable handle.
    pub fn device(&self, handle: DeviceHandle) -> Option<DeviceInfo> {
        self.registry.read().get(handle).cloned()
    }

    /// Every registered descriptor, in insertion order.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.registry.read().iter().cloned().collect()
    }

    /// Exact-match lookup over the scanned PCI table.
    pub fn pci_find(&self, vendor: u16, device: u16) -> Option<PciFunction> {
        self.registry.read().pci_find(vendor, device).copied()
    }

    /// Snapshot of the scanned PCI table.
    pub fn pci_functions(&self) -> Vec<PciFunction> {
        self.registry.read().pci_functions().to_vec()
    }

    pub fn pci_read_config32(&self, bus: u8, dev: u8, func: u8, offset: u8) -> Result<u32> {
        pci::check_bdf(dev, func)?;
        Ok(pci::read_config32(&*self.platform, bus, dev, func, offset))
    }

    pub fn pci_read_config16(&self, bus: u8, dev: u8, func: u8, offset: u8) -> Result<u16> {
        pci::check_bdf(dev, func)?;
        Ok(pci::read_config16(&*self.platform, bus, dev, func, offset))
    }

    pub fn pci_write_config32(&self, bus: u8, dev: u8, func: u8, offset: u8, value: u32) -> Result<()> {
        pci::check_bdf(dev, func)?;
        pci::write_config32(&*self.platform, bus, dev, func, offset, value);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Drivers
    // ------------------------------------------------------------------------

    /// Register a driver and probe it against every matching, present device.
    ///
    /// Returns how many devices the driver bound to.  A failed probe leaves
    /// the device present but uninitialized.
    pub fn register_driver(&self, driver: Arc<dyn Driver>) -> usize {
        let mut bound = 0;
        {
            let mut registry = self.registry.write();
            for info in registry.iter_mut() {
                if !info.present || info.initialized || !driver.matches(info) {
                    continue;
                }
                match driver.probe(info) {
                    Ok(()) => {
                        info.initialized = true;
                        bound += 1;
                    }
                    Err(e) => {
                        klog::klog!(Warn, "hal: {} probe of {} failed: {}", driver.name(), info.name, e);
                    }
                }
            }
        }
        self.drivers.lock().push(driver);
        bound
    }

    /// Unregister a driver by name, calling `remove` on every device it matched.
    pub fn unregister_driver(&self, name: &str) -> bool {
        let driver = {
            let mut drivers = self.drivers.lock();
            match drivers.iter().position(|d| d.name() == name) {
                Some(pos) => drivers.remove(pos),
                None => return false,
            }
        };
        let mut registry = self.registry.write();
        for info in registry.iter_mut() {
            if info.initialized && driver.matches(info) {
                driver.remove(info);
                info.initialized = false;
            }
        }
        true
    }

    /// Suspend every bound device.  Stops at the first failure.
    pub fn suspend_all(&self) -> Result<()> {
        self.for_each_bound(|driver, info| driver.suspend(info))
    }

    /// Resume every bound device.  Stops at the first failure.
    pub fn resume_all(&self) -> Result<()> {
        self.for_each_bound(|driver, info| driver.resume(info))
    }

    fn for_each_bound<F>(&self, mut op: F) -> Result<()>
    where
        F: FnMut(&dyn Driver, &DeviceInfo) -> Result<()>,
    {
        let drivers = self.drivers.lock();
        let registry = self.registry.read();
        for info in registry.iter().filter(|i| i.initialized) {
            if let Some(driver) = drivers.iter().find(|d| d.matches(info)) {
                op(&**driver, info)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------------

    /// Read `count` sectors starting at `lba` from storage device `dev`
    /// into `buf`.  On success exactly `count * SECTOR_SIZE` bytes of `buf`
    /// hold the sector contents.
    pub fn storage_read(&self, dev: usize, lba: u64, count: u32, buf: &mut [u8]) -> Result<()> {
        let unit = self.storage_unit(dev, count, buf.len())?;
        let len = count as usize * SECTOR_SIZE;
        self.platform.read_sectors(unit, lba, count, &mut buf[..len])
    }

    /// Write `count` sectors from `buf` to storage device `dev` at `lba`.
    pub fn storage_write(&self, dev: usize, lba: u64, count: u32, buf: &[u8]) -> Result<()> {
        let unit = self.storage_unit(dev, count, buf.len())?;
        let len = count as usize * SECTOR_SIZE;
        self.platform.write_sectors(unit, lba, count, &buf[..len])
    }

    /// Validate a storage request and resolve the platform disk unit.
    fn storage_unit(&self, dev: usize, count: u32, buf_len: usize) -> Result<usize> {
        if buf_len == 0 || count == 0 {
            return Err(HalError::InvalidArgument);
        }
        let needed = (count as usize)
            .checked_mul(SECTOR_SIZE)
            .ok_or(HalError::InvalidArgument)?;
        if buf_len < needed {
            return Err(HalError::InvalidArgument);
        }
        let registry = self.registry.read();
        let info = registry
            .info(DeviceKind::Storage, dev)
            .ok_or(HalError::InvalidArgument)?;
        if !info.present {
            return Err(HalError::NoDevice);
        }
        match info.device_id {
            DeviceId::Legacy { unit, .. } => Ok(unit as usize),
            _ => Err(HalError::Unsupported),
        }
    }

    /// Total sectors on storage device `dev`, if known.
    pub fn storage_sectors(&self, dev: usize) -> Option<u64> {
        let registry = self.registry.read();
        let info = registry.info(DeviceKind::Storage, dev)?;
        match info.device_id {
            DeviceId::Legacy { unit, .. } if info.present => self.platform.disk_sectors(unit as usize),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------------

    /// Monotonic tick count.  Reading never advances it.
    pub fn timer_ticks(&self) -> u64 {
        self.platform.ticks()
    }

    /// Configured tick frequency in Hz.
    pub fn timer_frequency(&self) -> u32 {
        self.timer_hz
    }

    /// Called from the timer interrupt handler.
    pub fn on_timer_tick(&self) {
        self.platform.timer_tick();
    }

    /// Busy-wait for `ms` milliseconds of timer ticks.
    ///
    /// Requires the tick source to be live; on bare metal that means
    /// interrupts enabled with the PIT programmed.
    pub fn delay_ms(&self, ms: u64) {
        timer::delay_ms(&*self.platform, self.timer_hz, ms);
    }

    /// Program the PIT for the configured frequency.
    pub fn program_timer(&self) {
        timer::program_pit(&*self.platform, self.timer_hz);
    }

    /// Microseconds represented by `ticks` at the configured frequency.
    pub fn ticks_to_usec(&self, ticks: u64) -> u64 {
        timer::ticks_to_usec(ticks, self.timer_hz)
    }

    // ------------------------------------------------------------------------
    // CPU
    // ------------------------------------------------------------------------

    pub fn cpu_enable_interrupts(&self) {
        cpu::enable_interrupts();
    }

    pub fn cpu_disable_interrupts(&self) {
        cpu::disable_interrupts();
    }

    pub fn cpu_interrupts_enabled(&self) -> bool {
        cpu::interrupts_enabled()
    }

    /// CPU topology, detected once and cached.
    pub fn cpu_topology(&self) -> CpuTopology {
        if let Some(topology) = *self.topology.read() {
            return topology;
        }
        let detected = CpuTopology::detect(&*self.platform);
        *self.topology.write() = Some(detected);
        detected
    }

    /// Remap both PICs to vectors 32..47.
    pub fn pic_remap(&self) {
        pic::remap(&*self.platform);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn sim_hal() -> (Arc<SimPlatform>, Hal) {
        let sim = Arc::new(SimPlatform::new());
        sim.add_pci_function(0, 0, 0, SimPciFunction::new(0x8086, 0x1237, 0x06, 0x00));
        sim.add_pci_function(0, 3, 0, SimPciFunction::new(0x8086, 0x100E, 0x02, 0x00).irq(11).bar0(0xFEBC_0000));
        sim.add_disk(16);
        let hal = Hal::new(Box::new(sim.clone()), 1000);
        (sim, hal)
    }

    #[test]
    fn test_enumerate_is_idempotent() {
        let (sim, hal) = sim_hal();
        let first = hal.enumerate();
        assert!(first > 0);
        sim.add_pci_function(0, 7, 0, SimPciFunction::new(0x1234, 0x1111, 0x01, 0x06));
        assert_eq!(hal.enumerate(), first);
        assert!(hal.pci_find(0x1234, 0x1111).is_none());
    }

    #[test]
    fn test_builtin_devices_present() {
        let (_sim, hal) = sim_hal();
        hal.enumerate();
        assert_eq!(hal.count(DeviceKind::Keyboard), 1);
        assert_eq!(hal.count(DeviceKind::Mouse), 1);
        assert_eq!(hal.count(DeviceKind::Storage), 1);
        assert_eq!(hal.count(DeviceKind::Network), 1);

        let nic = hal.info(DeviceKind::Network, 0).unwrap();
        assert!(nic.present);
        assert_eq!(nic.irq, 11);
        assert_eq!(nic.memory_base, 0xFEBC_0000);
        assert!(matches!(nic.device_id, DeviceId::Pci { vendor: 0x8086, device: 0x100E, .. }));
        assert!(hal.info(DeviceKind::Network, 1).is_none());
    }

    #[test]
    fn test_nic_absent_without_pci_network_function() {
        let sim = Arc::new(SimPlatform::new());
        let hal = Hal::new(Box::new(sim), 100);
        hal.enumerate();
        let nic = hal.info(DeviceKind::Network, 0).unwrap();
        assert!(!nic.present);
        assert!(!nic.initialized);
    }

    #[test]
    fn test_pci_find_exact_match() {
        let (_sim, hal) = sim_hal();
        hal.enumerate();
        let host = hal.pci_find(0x8086, 0x1237).unwrap();
        assert_eq!((host.bus, host.dev, host.func), (0, 0, 0));
        assert!(hal.pci_find(0x8086, 0x0000).is_none());
    }

    #[test]
    fn test_pci_config_reads() {
        let (_sim, hal) = sim_hal();
        assert_eq!(hal.pci_read_config32(0, 0, 0, 0).unwrap(), 0x1237_8086);
        assert_eq!(hal.pci_read_config16(0, 0, 0, 0).unwrap(), 0x8086);
        assert_eq!(hal.pci_read_config16(0, 0, 0, 2).unwrap(), 0x1237);
        assert_eq!(hal.pci_read_config32(0, 9, 0, 0).unwrap(), 0xFFFF_FFFF);
        assert_eq!(hal.pci_read_config32(0, 32, 0, 0), Err(HalError::InvalidArgument));
        assert_eq!(hal.pci_read_config32(0, 0, 8, 0), Err(HalError::InvalidArgument));
    }

    #[test]
    fn test_storage_round_trip() {
        let (_sim, hal) = sim_hal();
        hal.enumerate();
        let mut out = [0u8; SECTOR_SIZE * 2];
        for (i, b) in out.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        hal.storage_write(0, 3, 2, &out).unwrap();

        let mut back = [0xAAu8; SECTOR_SIZE * 2];
        hal.storage_read(0, 3, 2, &mut back).unwrap();
        assert_eq!(&back[..], &out[..]);
        assert_eq!(hal.storage_sectors(0), Some(16));
    }

    #[test]
    fn test_storage_fault_leaves_disk_intact() {
        let (sim, hal) = sim_hal();
        hal.enumerate();
        hal.storage_write(0, 1, 1, &[7u8; SECTOR_SIZE]).unwrap();
        sim.set_disk_fault(Some(HalError::Timeout));
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(hal.storage_read(0, 1, 1, &mut buf), Err(HalError::Timeout));
        assert_eq!(hal.storage_write(0, 1, 1, &[9u8; SECTOR_SIZE]), Err(HalError::Timeout));
        sim.set_disk_fault(None);
        hal.storage_read(0, 1, 1, &mut buf).unwrap();
        assert_eq!(buf, [7u8; SECTOR_SIZE]);
    }

    #[test]
    fn test_storage_argument_errors() {
        let (_sim, hal) = sim_hal();
        hal.enumerate();
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(hal.storage_read(1, 0, 1, &mut buf), Err(HalError::InvalidArgument));
        assert_eq!(hal.storage_read(0, 0, 1, &mut []), Err(HalError::InvalidArgument));
        assert_eq!(hal.storage_read(0, 0, 2, &mut buf), Err(HalError::InvalidArgument));
        assert_eq!(hal.storage_read(0, 0, 0, &mut buf), Err(HalError::InvalidArgument));
        assert_eq!(hal.storage_read(0, 16, 1, &mut buf), Err(HalError::InvalidArgument));
        assert_eq!(HalError::InvalidArgument.code(), status::EINVAL);
    }

    #[test]
    fn test_storage_on_stub_platform() {
        let hal = Hal::new(Box::new(StubPlatform::new()), 100);
        hal.enumerate();
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(hal.storage_read(0, 0, 1, &mut buf), Err(HalError::NoDevice));
        assert_eq!(hal.pci_functions().len(), 0);
    }

    #[test]
    fn test_timer_reads_do_not_advance() {
        let (sim, hal) = sim_hal();
        let before = hal.timer_ticks();
        assert_eq!(hal.timer_ticks(), before);
        hal.on_timer_tick();
        hal.on_timer_tick();
        assert_eq!(hal.timer_ticks(), before + 2);
        sim.advance_ticks(10);
        assert_eq!(hal.timer_ticks(), before + 12);
        assert_eq!(hal.timer_frequency(), 1000);
    }

    #[test]
    fn test_delay_ms_waits_for_ticks() {
        let (sim, hal) = sim_hal();
        sim.set_pause_advance(1);
        let start = hal.timer_ticks();
        hal.delay_ms(5);
        assert!(hal.timer_ticks() >= start + 5);
    }

    struct CountingDriver {
        probes: AtomicUsize,
        removes: AtomicUsize,
    }

    impl Driver for CountingDriver {
        fn name(&self) -> &'static str {
            "counting-nic"
        }

        fn matches(&self, info: &DeviceInfo) -> bool {
            info.kind == DeviceKind::Network
        }

        fn probe(&self, _info: &DeviceInfo) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn remove(&self, _info: &DeviceInfo) {
            self.removes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_driver_binding() {
        let (_sim, hal) = sim_hal();
        hal.enumerate();
        let driver = Arc::new(CountingDriver { probes: AtomicUsize::new(0), removes: AtomicUsize::new(0) });
        assert_eq!(hal.register_driver(driver.clone()), 1);
        assert!(hal.info(DeviceKind::Network, 0).unwrap().initialized);
        assert!(hal.suspend_all().is_ok());
        assert!(hal.resume_all().is_ok());

        assert!(hal.unregister_driver("counting-nic"));
        assert!(!hal.unregister_driver("counting-nic"));
        assert_eq!(driver.removes.load(Ordering::SeqCst), 1);
        assert!(!hal.info(DeviceKind::Network, 0).unwrap().initialized);
    }
}
