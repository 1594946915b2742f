//! Bare-metal x86_64 platform.
//!
//! Port I/O uses `x86_64::instructions::port`, the tick counter is fed by the
//! PIT interrupt through [`Platform::timer_tick`], and storage is ATA PIO
//! (LBA28) on the primary channel.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;

use crate::cpu::Cpuid;
use crate::device::DeviceKind;
use crate::platform::Platform;
use crate::{HalError, Result, SECTOR_SIZE};

static TICKS: AtomicU64 = AtomicU64::new(0);

const PS2_STATUS: u16 = 0x64;

const ATA_DATA: u16 = 0x1F0;
const ATA_SECTOR_COUNT: u16 = 0x1F2;
const ATA_LBA_LOW: u16 = 0x1F3;
const ATA_LBA_MID: u16 = 0x1F4;
const ATA_LBA_HIGH: u16 = 0x1F5;
const ATA_DRIVE: u16 = 0x1F6;
const ATA_STATUS_CMD: u16 = 0x1F7;

const ATA_CMD_READ: u8 = 0x20;
const ATA_CMD_WRITE: u8 = 0x30;
const ATA_CMD_FLUSH: u8 = 0xE7;
const ATA_CMD_IDENTIFY: u8 = 0xEC;

const ATA_SR_ERR: u8 = 0x01;
const ATA_SR_DRQ: u8 = 0x08;
const ATA_SR_BSY: u8 = 0x80;

/// Status polls before a command is declared timed out.
const ATA_POLL_LIMIT: u32 = 1_000_000;
/// LBA28 addressing limit.
const ATA_MAX_LBA: u64 = 1 << 28;

pub struct X86Platform {
    disk_sectors: AtomicU64,
}

impl X86Platform {
    /// # Safety
    ///
    /// Caller must run at CPL 0 with exclusive ownership of the legacy
    /// ports (PCI CF8/CFC, PIC, PIT, PS/2, primary ATA).
    pub unsafe fn new() -> Self {
        let platform = X86Platform {
            disk_sectors: AtomicU64::new(0),
        };
        let sectors = platform.ata_identify().unwrap_or(0);
        platform.disk_sectors.store(sectors, Ordering::Release);
        platform
    }

    fn ata_wait(&self, want_drq: bool) -> Result<()> {
        for _ in 0..ATA_POLL_LIMIT {
            let status = self.inb(ATA_STATUS_CMD);
            if status == 0xFF {
                return Err(HalError::NoDevice);
            }
            if status & ATA_SR_BSY != 0 {
                core::hint::spin_loop();
                continue;
            }
            if status & ATA_SR_ERR != 0 {
                return Err(HalError::Io);
            }
            if !want_drq || status & ATA_SR_DRQ != 0 {
                return Ok(());
            }
        }
        Err(HalError::Timeout)
    }

    fn ata_select(&self, lba: u64, count: u8) {
        self.outb(ATA_DRIVE, 0xE0 | ((lba >> 24) as u8 & 0x0F));
        self.outb(ATA_SECTOR_COUNT, count);
        self.outb(ATA_LBA_LOW, lba as u8);
        self.outb(ATA_LBA_MID, (lba >> 8) as u8);
        self.outb(ATA_LBA_HIGH, (lba >> 16) as u8);
    }

    /// IDENTIFY the master drive; returns its LBA28 sector count.
    fn ata_identify(&self) -> Result<u64> {
        self.outb(ATA_DRIVE, 0xA0);
        self.outb(ATA_SECTOR_COUNT, 0);
        self.outb(ATA_LBA_LOW, 0);
        self.outb(ATA_LBA_MID, 0);
        self.outb(ATA_LBA_HIGH, 0);
        self.outb(ATA_STATUS_CMD, ATA_CMD_IDENTIFY);
        if self.inb(ATA_STATUS_CMD) == 0 {
            return Err(HalError::NoDevice);
        }
        self.ata_wait(true)?;
        let mut words = [0u16; 256];
        for word in words.iter_mut() {
            *word = self.inw(ATA_DATA);
        }
        Ok(((words[61] as u64) << 16) | words[60] as u64)
    }

    fn check_range(&self, lba: u64, count: u32) -> Result<()> {
        let end = lba.checked_add(count as u64).ok_or(HalError::InvalidArgument)?;
        if end > self.disk_sectors.load(Ordering::Acquire) || end > ATA_MAX_LBA {
            return Err(HalError::InvalidArgument);
        }
        Ok(())
    }
}

impl Platform for X86Platform {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn inb(&self, port: u16) -> u8 {
        unsafe { Port::<u8>::new(port).read() }
    }

    fn outb(&self, port: u16, value: u8) {
        unsafe { Port::<u8>::new(port).write(value) }
    }

    fn inw(&self, port: u16) -> u16 {
        unsafe { Port::<u16>::new(port).read() }
    }

    fn outw(&self, port: u16, value: u16) {
        unsafe { Port::<u16>::new(port).write(value) }
    }

    fn inl(&self, port: u16) -> u32 {
        unsafe { Port::<u32>::new(port).read() }
    }

    fn outl(&self, port: u16, value: u32) {
        unsafe { Port::<u32>::new(port).write(value) }
    }

    fn ticks(&self) -> u64 {
        TICKS.load(Ordering::Acquire)
    }

    fn timer_tick(&self) {
        TICKS.fetch_add(1, Ordering::AcqRel);
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> Option<Cpuid> {
        let (eax, ebx, ecx, edx): (u32, u32, u32, u32);
        unsafe {
            // rbx is reserved by LLVM; save it around cpuid.
            core::arch::asm!(
                "push rbx",
                "cpuid",
                "mov {ebx_out:e}, ebx",
                "pop rbx",
                ebx_out = out(reg) ebx,
                inout("eax") leaf => eax,
                inout("ecx") subleaf => ecx,
                out("edx") edx,
            );
        }
        Some(Cpuid { eax, ebx, ecx, edx })
    }

    fn probe_legacy(&self, kind: DeviceKind) -> bool {
        match kind {
            // A missing 8042 floats the status port high.
            DeviceKind::Keyboard | DeviceKind::Mouse => self.inb(PS2_STATUS) != 0xFF,
            _ => false,
        }
    }

    fn disk_count(&self) -> usize {
        (self.disk_sectors.load(Ordering::Acquire) != 0) as usize
    }

    fn disk_sectors(&self, unit: usize) -> Option<u64> {
        match self.disk_sectors.load(Ordering::Acquire) {
            0 => None,
            n if unit == 0 => Some(n),
            _ => None,
        }
    }

    fn read_sectors(&self, unit: usize, lba: u64, count: u32, buf: &mut [u8]) -> Result<()> {
        if unit != 0 {
            return Err(HalError::NoDevice);
        }
        self.check_range(lba, count)?;
        for (i, sector) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.ata_wait(false)?;
            self.ata_select(lba + i as u64, 1);
            self.outb(ATA_STATUS_CMD, ATA_CMD_READ);
            self.ata_wait(true)?;
            for pair in sector.chunks_exact_mut(2) {
                let word = self.inw(ATA_DATA);
                pair.copy_from_slice(&word.to_le_bytes());
            }
        }
        Ok(())
    }

    fn write_sectors(&self, unit: usize, lba: u64, count: u32, buf: &[u8]) -> Result<()> {
        if unit != 0 {
            return Err(HalError::NoDevice);
        }
        self.check_range(lba, count)?;
        for (i, sector) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            self.ata_wait(false)?;
            self.ata_select(lba + i as u64, 1);
            self.outb(ATA_STATUS_CMD, ATA_CMD_WRITE);
            self.ata_wait(true)?;
            for pair in sector.chunks_exact(2) {
                self.outw(ATA_DATA, u16::from_le_bytes([pair[0], pair[1]]));
            }
        }
        self.outb(ATA_STATUS_CMD, ATA_CMD_FLUSH);
        self.ata_wait(false)
    }
}
