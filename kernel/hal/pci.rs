//! PCI configuration space (CF8/CFC) and bus scan.

use alloc::vec::Vec;

use crate::platform::Platform;
use crate::{HalError, Result};

pub const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
pub const PCI_CONFIG_DATA: u16 = 0xCFC;

/// Vendor id read back from an empty slot.
pub const VENDOR_NONE: u16 = 0xFFFF;

const PCI_VENDOR_OFFSET: u8 = 0x00;
const PCI_CLASS_OFFSET: u8 = 0x08;
const PCI_HEADER_OFFSET: u8 = 0x0C;
const PCI_BAR0_OFFSET: u8 = 0x10;
const PCI_INTERRUPT_OFFSET: u8 = 0x3C;

const HEADER_MULTIFUNCTION: u8 = 0x80;

pub const MAX_DEVICES: u8 = 32;
pub const MAX_FUNCTIONS: u8 = 8;

/// Encode a configuration address for port `0xCF8`.
///
/// Bit 31 enables the access; bus, device and function occupy bits 23..8
/// and the dword-aligned register offset bits 7..2.
#[inline]
pub const fn pci_address(bus: u8, dev: u8, func: u8, offset: u8) -> u32 {
    0x8000_0000u32
        | ((bus as u32) << 16)
        | (((dev & 0x1F) as u32) << 11)
        | (((func & 0x07) as u32) << 8)
        | ((offset & 0xFC) as u32)
}

pub(crate) fn check_bdf(dev: u8, func: u8) -> Result<()> {
    if dev >= MAX_DEVICES || func >= MAX_FUNCTIONS {
        return Err(HalError::InvalidArgument);
    }
    Ok(())
}

/// Read 32 bits from configuration space.  `offset` is rounded down to a dword.
pub fn read_config32(platform: &dyn Platform, bus: u8, dev: u8, func: u8, offset: u8) -> u32 {
    platform.outl(PCI_CONFIG_ADDRESS, pci_address(bus, dev, func, offset));
    platform.inl(PCI_CONFIG_DATA)
}

/// Read 16 bits: bits `[(o & 2) * 8 + 15 : (o & 2) * 8]` of the dword.
pub fn read_config16(platform: &dyn Platform, bus: u8, dev: u8, func: u8, offset: u8) -> u16 {
    let shift = ((offset & 2) * 8) as u32;
    (read_config32(platform, bus, dev, func, offset) >> shift) as u16
}

pub fn read_config8(platform: &dyn Platform, bus: u8, dev: u8, func: u8, offset: u8) -> u8 {
    let shift = ((offset & 3) * 8) as u32;
    (read_config32(platform, bus, dev, func, offset) >> shift) as u8
}

pub fn write_config32(platform: &dyn Platform, bus: u8, dev: u8, func: u8, offset: u8, value: u32) {
    platform.outl(PCI_CONFIG_ADDRESS, pci_address(bus, dev, func, offset));
    platform.outl(PCI_CONFIG_DATA, value);
}

/// One present PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciFunction {
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
    pub vendor: u16,
    pub device: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
    pub header_type: u8,
    pub irq: u8,
    pub bar0: u32,
    pub bar0_size: u64,
}

impl PciFunction {
    pub fn bar0_is_io(&self) -> bool {
        self.bar0 & 1 != 0
    }

    /// `pci-vvvv:dddd` into `buf`.
    pub(crate) fn format_name<'a>(&self, buf: &'a mut [u8; 16]) -> &'a str {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        buf[..4].copy_from_slice(b"pci-");
        for i in 0..4 {
            buf[4 + i] = HEX[((self.vendor >> (12 - 4 * i)) & 0xF) as usize];
            buf[9 + i] = HEX[((self.device >> (12 - 4 * i)) & 0xF) as usize];
        }
        buf[8] = b':';
        core::str::from_utf8(&buf[..13]).unwrap_or("pci")
    }
}

/// Probe one function; `None` when the vendor id reads back as `0xFFFF`.
fn probe_function(platform: &dyn Platform, bus: u8, dev: u8, func: u8) -> Option<PciFunction> {
    let id = read_config32(platform, bus, dev, func, PCI_VENDOR_OFFSET);
    let vendor = id as u16;
    if vendor == VENDOR_NONE {
        return None;
    }
    let class_reg = read_config32(platform, bus, dev, func, PCI_CLASS_OFFSET);
    let header_type = read_config8(platform, bus, dev, func, PCI_HEADER_OFFSET + 2);
    let irq = read_config8(platform, bus, dev, func, PCI_INTERRUPT_OFFSET);

    // Only type 0 headers have six BARs at 0x10.
    let (bar0, bar0_size) = if header_type & 0x7F == 0 {
        size_bar0(platform, bus, dev, func)
    } else {
        (0, 0)
    };

    Some(PciFunction {
        bus,
        dev,
        func,
        vendor,
        device: (id >> 16) as u16,
        class: (class_reg >> 24) as u8,
        subclass: (class_reg >> 16) as u8,
        prog_if: (class_reg >> 8) as u8,
        revision: class_reg as u8,
        header_type,
        irq,
        bar0,
        bar0_size,
    })
}

/// Read BAR0 and size it with the all-ones probe, restoring the original.
fn size_bar0(platform: &dyn Platform, bus: u8, dev: u8, func: u8) -> (u32, u64) {
    let original = read_config32(platform, bus, dev, func, PCI_BAR0_OFFSET);
    if original == 0 {
        return (0, 0);
    }
    write_config32(platform, bus, dev, func, PCI_BAR0_OFFSET, 0xFFFF_FFFF);
    let mask = read_config32(platform, bus, dev, func, PCI_BAR0_OFFSET);
    write_config32(platform, bus, dev, func, PCI_BAR0_OFFSET, original);

    let type_bits = if original & 1 != 0 { 0x3 } else { 0xF };
    let size_mask = mask & !type_bits;
    if size_mask == 0 {
        return (original, 0);
    }
    (original, (!size_mask).wrapping_add(1) as u64)
}

/// Scan every bus, device and function.
///
/// Function 0 decides the slot: an absent function 0 skips the slot, and
/// functions 1..7 are probed only when its header type has the
/// multi-function bit set.
pub fn scan(platform: &dyn Platform) -> Vec<PciFunction> {
    let mut found = Vec::new();
    for bus in 0..=255u8 {
        for dev in 0..MAX_DEVICES {
            let Some(first) = probe_function(platform, bus, dev, 0) else {
                continue;
            };
            let multifunction = first.header_type & HEADER_MULTIFUNCTION != 0;
            klog::klog!(
                Debug,
                "pci: {:02x}:{:02x}.0 {:04x}:{:04x} class {:02x}{:02x}",
                bus,
                dev,
                first.vendor,
                first.device,
                first.class,
                first.subclass
            );
            found.push(first);

            if !multifunction {
                continue;
            }
            for func in 1..MAX_FUNCTIONS {
                if let Some(function) = probe_function(platform, bus, dev, func) {
                    found.push(function);
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimPciFunction, SimPlatform};

    #[test]
    fn test_address_encoding() {
        assert_eq!(pci_address(0, 0, 0, 0), 0x8000_0000);
        assert_eq!(pci_address(1, 2, 3, 0x10), 0x8001_1310);
        assert_eq!(pci_address(0xFF, 31, 7, 0xFF), 0x80FF_FFFC);
        // Offset bits 1..0 are always clear.
        assert_eq!(pci_address(0, 0, 0, 0x3E) & 0x3, 0);
    }

    #[test]
    fn test_scan_skips_non_multifunction_slots() {
        let sim = SimPlatform::new();
        sim.add_pci_function(0, 0, 0, SimPciFunction::new(0x8086, 0x1237, 0x06, 0x00));
        // Function 2 without the multi-function bit on function 0 is never seen.
        sim.add_pci_function(0, 0, 2, SimPciFunction::new(0x8086, 0x7010, 0x01, 0x01));
        let found = scan(&sim);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].device, 0x1237);
    }

    #[test]
    fn test_scan_probes_all_functions_of_multifunction_device() {
        let sim = SimPlatform::new();
        sim.add_pci_function(0, 1, 0, SimPciFunction::new(0x8086, 0x7000, 0x06, 0x01).multifunction());
        sim.add_pci_function(0, 1, 1, SimPciFunction::new(0x8086, 0x7010, 0x01, 0x01));
        sim.add_pci_function(0, 1, 3, SimPciFunction::new(0x8086, 0x7113, 0x06, 0x80));
        let found = scan(&sim);
        let funcs: Vec<u8> = found.iter().map(|f| f.func).collect();
        assert_eq!(funcs, [0, 1, 3]);
        assert_eq!(found[1].class, 0x01);
        assert_eq!(found[1].subclass, 0x01);
    }

    #[test]
    fn test_scan_skips_slot_with_absent_function_zero() {
        let sim = SimPlatform::new();
        sim.add_pci_function(2, 4, 1, SimPciFunction::new(0x1AF4, 0x1001, 0x01, 0x00));
        assert!(scan(&sim).is_empty());
    }

    #[test]
    fn test_bar_sizing_restores_bar() {
        let sim = SimPlatform::new();
        sim.add_pci_function(
            0,
            3,
            0,
            SimPciFunction::new(0x8086, 0x100E, 0x02, 0x00).bar0(0xFEBC_0000).bar0_size(0x2_0000),
        );
        let found = scan(&sim);
        assert_eq!(found[0].bar0, 0xFEBC_0000);
        assert_eq!(found[0].bar0_size, 0x2_0000);
        assert_eq!(read_config32(&sim, 0, 3, 0, PCI_BAR0_OFFSET), 0xFEBC_0000);
    }

    #[test]
    fn test_format_name() {
        let sim = SimPlatform::new();
        sim.add_pci_function(0, 0, 0, SimPciFunction::new(0x8086, 0x1237, 0x06, 0x00));
        let f = scan(&sim)[0];
        let mut buf = [0u8; 16];
        assert_eq!(f.format_name(&mut buf), "pci-8086:1237");
    }
}
