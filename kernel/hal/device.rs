//! Device registry and driver interface.

use alloc::vec::Vec;
use core::fmt;

use crate::pci::{self, PciFunction};
use crate::platform::Platform;
use crate::Result;

/// Maximum name length including the terminating NUL.
pub const DEVICE_NAME_LEN: usize = 64;

const PS2_DATA_PORT: u16 = 0x60;
const ATA_PRIMARY_IO: u16 = 0x1F0;
const ATA_SECONDARY_IO: u16 = 0x170;

const IRQ_KEYBOARD: u8 = 1;
const IRQ_MOUSE: u8 = 12;
const IRQ_ATA_PRIMARY: u8 = 14;
const IRQ_ATA_SECONDARY: u8 = 15;

const PCI_CLASS_NETWORK: u8 = 0x02;

/// Device categories.  Also the discriminant of [`DeviceId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceKind {
    Keyboard,
    Mouse,
    Storage,
    Network,
    /// Any PCI function found by the bus scan.
    Pci,
}

impl DeviceKind {
    /// MAC security context used to label devices of this kind.
    pub const fn label(self) -> &'static str {
        match self {
            DeviceKind::Keyboard => "system:device:keyboard",
            DeviceKind::Mouse => "system:device:mouse",
            DeviceKind::Storage => "system:device:storage",
            DeviceKind::Network => "system:device:network",
            DeviceKind::Pci => "system:device:pci",
        }
    }
}

/// Stable per-boot device handle.  Handles start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceHandle(pub u32);

/// Bus-specific identity of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceId {
    Pci { vendor: u16, device: u16, bus: u8, dev: u8, func: u8 },
    Usb { vendor: u16, product: u16 },
    /// Fixed ISA-era device; `unit` selects the disk for storage devices.
    Legacy { port: u16, unit: u8 },
}

/// NUL-terminated ASCII device name.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeviceName([u8; DEVICE_NAME_LEN]);

impl DeviceName {
    /// Build a name, truncating to 63 bytes and replacing non-ASCII bytes.
    pub fn new(name: &str) -> Self {
        let mut buf = [0u8; DEVICE_NAME_LEN];
        for (slot, byte) in buf.iter_mut().zip(name.bytes().take(DEVICE_NAME_LEN - 1)) {
            *slot = if byte.is_ascii() && byte != 0 { byte } else { b'?' };
        }
        DeviceName(buf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(DEVICE_NAME_LEN);
        &self.0[..len]
    }

    pub fn as_str(&self) -> &str {
        // Constructor only stores ASCII.
        core::str::from_utf8(self.as_bytes()).unwrap_or("")
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// One device descriptor.  `present` and `initialized` are independent: a
/// present device stays uninitialized until a driver probes it.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub handle: DeviceHandle,
    pub kind: DeviceKind,
    pub device_id: DeviceId,
    pub present: bool,
    pub initialized: bool,
    pub io_base: u16,
    pub irq: u8,
    pub memory_base: u64,
    pub memory_size: u64,
    pub name: DeviceName,
}

/// Driver callbacks.
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this driver handles `info`.
    fn matches(&self, info: &DeviceInfo) -> bool;

    fn probe(&self, info: &DeviceInfo) -> Result<()>;

    fn remove(&self, _info: &DeviceInfo) {}

    fn suspend(&self, _info: &DeviceInfo) -> Result<()> {
        Ok(())
    }

    fn resume(&self, _info: &DeviceInfo) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Insertion-ordered device table plus the scanned PCI subtable.
pub struct DeviceRegistry {
    devices: Vec<DeviceInfo>,
    pci: Vec<PciFunction>,
    enumerated: bool,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        DeviceRegistry {
            devices: Vec::new(),
            pci: Vec::new(),
            enumerated: false,
        }
    }

    pub fn is_enumerated(&self) -> bool {
        self.enumerated
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceInfo> {
        self.devices.iter_mut()
    }

    pub fn count(&self, kind: DeviceKind) -> usize {
        self.devices.iter().filter(|d| d.kind == kind).count()
    }

    pub fn info(&self, kind: DeviceKind, index: usize) -> Option<&DeviceInfo> {
        self.devices.iter().filter(|d| d.kind == kind).nth(index)
    }

    pub fn get(&self, handle: DeviceHandle) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.handle == handle)
    }

    pub fn pci_functions(&self) -> &[PciFunction] {
        &self.pci
    }

    pub fn pci_find(&self, vendor: u16, device: u16) -> Option<&PciFunction> {
        self.pci.iter().find(|f| f.vendor == vendor && f.device == device)
    }

    fn push(&mut self, mut info: DeviceInfo) {
        info.handle = DeviceHandle(self.devices.len() as u32 + 1);
        self.devices.push(info);
    }

    /// Fill the table: built-in devices first, then one entry per PCI function.
    pub(crate) fn populate(&mut self, platform: &dyn Platform, functions: Vec<PciFunction>) {
        self.push(legacy(
            DeviceKind::Keyboard,
            platform.probe_legacy(DeviceKind::Keyboard),
            PS2_DATA_PORT,
            0,
            IRQ_KEYBOARD,
            "ps2-keyboard",
        ));
        self.push(legacy(
            DeviceKind::Mouse,
            platform.probe_legacy(DeviceKind::Mouse),
            PS2_DATA_PORT,
            0,
            IRQ_MOUSE,
            "ps2-mouse",
        ));

        // Primary storage always has a descriptor; extra disks get their own.
        let disks = platform.disk_count();
        for unit in 0..disks.max(1) {
            let (io, irq, name) = match unit {
                0 => (ATA_PRIMARY_IO, IRQ_ATA_PRIMARY, "ata-primary"),
                1 => (ATA_SECONDARY_IO, IRQ_ATA_SECONDARY, "ata-secondary"),
                _ => (0, 0, "disk"),
            };
            self.push(legacy(DeviceKind::Storage, unit < disks, io, unit as u8, irq, name));
        }

        let nic = functions.iter().find(|f| f.class == PCI_CLASS_NETWORK);
        match nic {
            Some(function) => {
                let mut info = from_pci(function, DeviceKind::Network);
                info.name = DeviceName::new("primary-nic");
                self.push(info);
            }
            None => self.push(DeviceInfo {
                handle: DeviceHandle(0),
                kind: DeviceKind::Network,
                device_id: DeviceId::Pci { vendor: pci::VENDOR_NONE, device: 0, bus: 0, dev: 0, func: 0 },
                present: false,
                initialized: false,
                io_base: 0,
                irq: 0,
                memory_base: 0,
                memory_size: 0,
                name: DeviceName::new("primary-nic"),
            }),
        }

        for function in &functions {
            self.push(from_pci(function, DeviceKind::Pci));
        }

        self.pci = functions;
        self.enumerated = true;
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn legacy(kind: DeviceKind, present: bool, port: u16, unit: u8, irq: u8, name: &str) -> DeviceInfo {
    DeviceInfo {
        handle: DeviceHandle(0),
        kind,
        device_id: DeviceId::Legacy { port, unit },
        present,
        initialized: false,
        io_base: port,
        irq,
        memory_base: 0,
        memory_size: 0,
        name: DeviceName::new(name),
    }
}

fn from_pci(function: &PciFunction, kind: DeviceKind) -> DeviceInfo {
    let (io_base, memory_base) = if function.bar0_is_io() {
        ((function.bar0 & !0x3) as u16, 0)
    } else {
        (0, (function.bar0 & !0xF) as u64)
    };
    let mut name = [0u8; 16];
    let name = function.format_name(&mut name);
    DeviceInfo {
        handle: DeviceHandle(0),
        kind,
        device_id: DeviceId::Pci {
            vendor: function.vendor,
            device: function.device,
            bus: function.bus,
            dev: function.dev,
            func: function.func,
        },
        present: true,
        initialized: false,
        io_base,
        irq: function.irq,
        memory_base,
        memory_size: function.bar0_size,
        name: DeviceName::new(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name_truncates() {
        let long = "x".repeat(100);
        let name = DeviceName::new(&long);
        assert_eq!(name.as_bytes().len(), DEVICE_NAME_LEN - 1);
        assert_eq!(DeviceName::new("nic\u{e9}").as_str(), "nic??");
    }

    #[test]
    fn test_handles_follow_insertion_order() {
        let sim = crate::SimPlatform::new();
        sim.add_pci_function(0, 1, 0, crate::SimPciFunction::new(0x10EC, 0x8139, 0x02, 0x00).bar0(0xC001));
        let functions = crate::pci::scan(&sim);
        let mut registry = DeviceRegistry::new();
        registry.populate(&sim, functions);

        let handles: Vec<u32> = registry.iter().map(|d| d.handle.0).collect();
        let expected: Vec<u32> = (1..=registry.len() as u32).collect();
        assert_eq!(handles, expected);

        let nic = registry.info(DeviceKind::Network, 0).unwrap();
        assert_eq!(nic.io_base, 0xC000);
        assert_eq!(nic.memory_base, 0);
        assert_eq!(registry.count(DeviceKind::Pci), 1);
        assert_eq!(registry.get(nic.handle).unwrap().kind, DeviceKind::Network);
    }
}
