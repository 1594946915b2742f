//! Programmable platform for tests and hosted builds.
//!
//! Emulates the CF8/CFC configuration mechanism over a table of PCI
//! functions, RAM-backed disks, a manually driven tick counter and canned
//! CPUID results.  Writes to any other port are logged so callers can assert
//! on programming sequences (PIC, PIT).

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::cpu::Cpuid;
use crate::device::DeviceKind;
use crate::pci::{PCI_CONFIG_ADDRESS, PCI_CONFIG_DATA};
use crate::platform::Platform;
use crate::{HalError, Result, SECTOR_SIZE};

const BAR0_REG: usize = 4;

/// Description of a simulated PCI function.
#[derive(Debug, Clone, Copy)]
pub struct SimPciFunction {
    vendor: u16,
    device: u16,
    class: u8,
    subclass: u8,
    prog_if: u8,
    irq: u8,
    bar0: u32,
    bar0_size: u32,
    multifunction: bool,
}

impl SimPciFunction {
    pub const fn new(vendor: u16, device: u16, class: u8, subclass: u8) -> Self {
        SimPciFunction {
            vendor,
            device,
            class,
            subclass,
            prog_if: 0,
            irq: 0,
            bar0: 0,
            bar0_size: 0,
            multifunction: false,
        }
    }

    pub const fn prog_if(mut self, prog_if: u8) -> Self {
        self.prog_if = prog_if;
        self
    }

    pub const fn irq(mut self, irq: u8) -> Self {
        self.irq = irq;
        self
    }

    pub const fn bar0(mut self, bar0: u32) -> Self {
        self.bar0 = bar0;
        self
    }

    /// Decoded BAR size; must be a power of two.
    pub const fn bar0_size(mut self, size: u32) -> Self {
        self.bar0_size = size;
        self
    }

    /// Set the multi-function bit in the header type.
    pub const fn multifunction(mut self) -> Self {
        self.multifunction = true;
        self
    }

    fn config_space(&self) -> SimConfig {
        let mut regs = [0u32; 64];
        regs[0] = ((self.device as u32) << 16) | self.vendor as u32;
        regs[2] = ((self.class as u32) << 24) | ((self.subclass as u32) << 16) | ((self.prog_if as u32) << 8);
        regs[3] = if self.multifunction { 0x80 << 16 } else { 0 };
        regs[BAR0_REG] = self.bar0;
        regs[15] = self.irq as u32 | (1 << 8);
        let bar0_size = match self.bar0_size {
            0 if self.bar0 & 1 != 0 => 0x20,
            0 => 0x1000,
            size => size,
        };
        SimConfig { regs, bar0_size }
    }
}

struct SimConfig {
    regs: [u32; 64],
    bar0_size: u32,
}

struct SimState {
    config_address: u32,
    functions: BTreeMap<(u8, u8, u8), SimConfig>,
    disks: Vec<Vec<u8>>,
    disk_fault: Option<HalError>,
    keyboard: bool,
    mouse: bool,
    cpuid: BTreeMap<(u32, u32), Cpuid>,
    port_writes: Vec<(u16, u32)>,
}

/// Simulated machine.
pub struct SimPlatform {
    state: Mutex<SimState>,
    ticks: AtomicU64,
    pause_advance: AtomicU64,
}

impl SimPlatform {
    /// PS/2 keyboard and mouse present, no PCI functions, no disks.
    pub fn new() -> Self {
        SimPlatform {
            state: Mutex::new(SimState {
                config_address: 0,
                functions: BTreeMap::new(),
                disks: Vec::new(),
                disk_fault: None,
                keyboard: true,
                mouse: true,
                cpuid: BTreeMap::new(),
                port_writes: Vec::new(),
            }),
            ticks: AtomicU64::new(0),
            pause_advance: AtomicU64::new(0),
        }
    }

    pub fn add_pci_function(&self, bus: u8, dev: u8, func: u8, function: SimPciFunction) {
        self.state.lock().functions.insert((bus, dev, func), function.config_space());
    }

    /// Attach a zero-filled disk; returns its unit number.
    pub fn add_disk(&self, sectors: u64) -> usize {
        let mut state = self.state.lock();
        state.disks.push(vec![0u8; sectors as usize * SECTOR_SIZE]);
        state.disks.len() - 1
    }

    /// Make every following sector transfer fail with `error`; `None`
    /// restores normal operation.
    pub fn set_disk_fault(&self, error: Option<HalError>) {
        self.state.lock().disk_fault = error;
    }

    pub fn set_legacy_present(&self, kind: DeviceKind, present: bool) {
        let mut state = self.state.lock();
        match kind {
            DeviceKind::Keyboard => state.keyboard = present,
            DeviceKind::Mouse => state.mouse = present,
            _ => {}
        }
    }

    pub fn set_cpuid(&self, leaf: u32, subleaf: u32, result: Cpuid) {
        self.state.lock().cpuid.insert((leaf, subleaf), result);
    }

    pub fn advance_ticks(&self, n: u64) {
        self.ticks.fetch_add(n, Ordering::AcqRel);
    }

    /// Ticks added by every `cpu_pause`, standing in for a running timer.
    pub fn set_pause_advance(&self, n: u64) {
        self.pause_advance.store(n, Ordering::Release);
    }

    /// Writes to ports other than the PCI configuration pair, in order.
    pub fn port_writes(&self) -> Vec<(u16, u32)> {
        self.state.lock().port_writes.clone()
    }

    fn decode(address: u32) -> Option<((u8, u8, u8), usize)> {
        if address & 0x8000_0000 == 0 {
            return None;
        }
        let bus = (address >> 16) as u8;
        let dev = ((address >> 11) & 0x1F) as u8;
        let func = ((address >> 8) & 0x07) as u8;
        let reg = ((address & 0xFC) >> 2) as usize;
        Some(((bus, dev, func), reg))
    }

    fn disk_range(disk: &[u8], lba: u64, count: u32) -> Result<core::ops::Range<usize>> {
        let start = (lba as usize).checked_mul(SECTOR_SIZE).ok_or(HalError::InvalidArgument)?;
        let end = start + count as usize * SECTOR_SIZE;
        if end > disk.len() {
            return Err(HalError::InvalidArgument);
        }
        Ok(start..end)
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SimPlatform {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn inb(&self, _port: u16) -> u8 {
        0xFF
    }

    fn outb(&self, port: u16, value: u8) {
        self.state.lock().port_writes.push((port, value as u32));
    }

    fn inw(&self, _port: u16) -> u16 {
        0xFFFF
    }

    fn outw(&self, port: u16, value: u16) {
        self.state.lock().port_writes.push((port, value as u32));
    }

    fn inl(&self, port: u16) -> u32 {
        let state = self.state.lock();
        if port != PCI_CONFIG_DATA {
            return 0xFFFF_FFFF;
        }
        Self::decode(state.config_address)
            .and_then(|(bdf, reg)| state.functions.get(&bdf).map(|cfg| cfg.regs[reg]))
            .unwrap_or(0xFFFF_FFFF)
    }

    fn outl(&self, port: u16, value: u32) {
        let mut state = self.state.lock();
        match port {
            PCI_CONFIG_ADDRESS => state.config_address = value,
            PCI_CONFIG_DATA => {
                let Some((bdf, reg)) = Self::decode(state.config_address) else {
                    return;
                };
                if let Some(cfg) = state.functions.get_mut(&bdf) {
                    if reg == BAR0_REG {
                        // Hardwired type bits and size-aligned address bits.
                        let type_bits = if cfg.regs[BAR0_REG] & 1 != 0 { 0x3 } else { 0xF };
                        let address_mask = !(cfg.bar0_size - 1) & !type_bits;
                        cfg.regs[BAR0_REG] = (value & address_mask) | (cfg.regs[BAR0_REG] & type_bits);
                    } else if reg != 0 && reg != 2 {
                        cfg.regs[reg] = value;
                    }
                }
            }
            _ => state.port_writes.push((port, value)),
        }
    }

    fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    fn timer_tick(&self) {
        self.ticks.fetch_add(1, Ordering::AcqRel);
    }

    fn cpu_pause(&self) {
        core::hint::spin_loop();
        let step = self.pause_advance.load(Ordering::Acquire);
        if step != 0 {
            self.ticks.fetch_add(step, Ordering::AcqRel);
        }
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> Option<Cpuid> {
        self.state.lock().cpuid.get(&(leaf, subleaf)).copied()
    }

    fn probe_legacy(&self, kind: DeviceKind) -> bool {
        let state = self.state.lock();
        match kind {
            DeviceKind::Keyboard => state.keyboard,
            DeviceKind::Mouse => state.mouse,
            _ => false,
        }
    }

    fn disk_count(&self) -> usize {
        self.state.lock().disks.len()
    }

    fn disk_sectors(&self, unit: usize) -> Option<u64> {
        self.state.lock().disks.get(unit).map(|d| (d.len() / SECTOR_SIZE) as u64)
    }

    fn read_sectors(&self, unit: usize, lba: u64, count: u32, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        if let Some(error) = state.disk_fault {
            return Err(error);
        }
        let disk = state.disks.get(unit).ok_or(HalError::NoDevice)?;
        let range = Self::disk_range(disk, lba, count)?;
        buf.copy_from_slice(&disk[range]);
        Ok(())
    }

    fn write_sectors(&self, unit: usize, lba: u64, count: u32, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(error) = state.disk_fault {
            return Err(error);
        }
        let disk = state.disks.get_mut(unit).ok_or(HalError::NoDevice)?;
        let range = Self::disk_range(disk, lba, count)?;
        disk[range].copy_from_slice(buf);
        Ok(())
    }
}
