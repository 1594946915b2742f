//! 8259 PIC remapping and interrupt vector layout.
//!
//! Vectors 0..31 are CPU exceptions, IRQ 0..7 land on 32..39, IRQ 8..15 on
//! 40..47, and the syscall gate sits at 128.

use crate::platform::Platform;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

/// Unused port; a write gives the PIC time to settle.
const IO_WAIT_PORT: u16 = 0x80;

const ICW1_INIT_ICW4: u8 = 0x11;
const ICW3_MASTER_CASCADE: u8 = 0x04;
const ICW3_SLAVE_ID: u8 = 0x02;
const ICW4_8086: u8 = 0x01;

/// Master PIC base vector: IRQ 0-7 -> 32-39.
pub const PIC1_OFFSET: u8 = 0x20;
/// Slave PIC base vector: IRQ 8-15 -> 40-47.
pub const PIC2_OFFSET: u8 = 0x28;
/// Software interrupt used for system calls (DPL 3).
pub const SYSCALL_VECTOR: u8 = 0x80;

/// End-of-interrupt command.
pub const PIC_EOI: u8 = 0x20;

/// IRQ 0 (timer), 1 (keyboard), 2 (cascade) unmasked on the master.
const MASTER_MASK: u8 = 0xF8;
/// IRQ 12 (mouse), 14 and 15 (ATA) unmasked on the slave.
const SLAVE_MASK: u8 = 0x2F;

/// Vector for legacy `irq`, or `None` past IRQ 15.
pub const fn irq_vector(irq: u8) -> Option<u8> {
    match irq {
        0..=7 => Some(PIC1_OFFSET + irq),
        8..=15 => Some(PIC2_OFFSET + irq - 8),
        _ => None,
    }
}

fn io_wait(platform: &dyn Platform) {
    platform.outb(IO_WAIT_PORT, 0);
}

/// Run the ICW1..ICW4 sequence on both controllers and install the masks.
///
/// Must run before interrupts are enabled.
pub fn remap(platform: &dyn Platform) {
    platform.outb(PIC1_CMD, ICW1_INIT_ICW4);
    io_wait(platform);
    platform.outb(PIC2_CMD, ICW1_INIT_ICW4);
    io_wait(platform);

    platform.outb(PIC1_DATA, PIC1_OFFSET);
    io_wait(platform);
    platform.outb(PIC2_DATA, PIC2_OFFSET);
    io_wait(platform);

    platform.outb(PIC1_DATA, ICW3_MASTER_CASCADE);
    io_wait(platform);
    platform.outb(PIC2_DATA, ICW3_SLAVE_ID);
    io_wait(platform);

    platform.outb(PIC1_DATA, ICW4_8086);
    io_wait(platform);
    platform.outb(PIC2_DATA, ICW4_8086);
    io_wait(platform);

    platform.outb(PIC1_DATA, MASTER_MASK);
    platform.outb(PIC2_DATA, SLAVE_MASK);

    klog::klog!(
        Info,
        "pic: IRQ0-7 -> vectors {}-{}, IRQ8-15 -> vectors {}-{}",
        PIC1_OFFSET,
        PIC1_OFFSET + 7,
        PIC2_OFFSET,
        PIC2_OFFSET + 7
    );
}

/// Acknowledge `irq`; slave IRQs need an EOI on both controllers.
pub fn end_of_interrupt(platform: &dyn Platform, irq: u8) {
    if irq >= 8 {
        platform.outb(PIC2_CMD, PIC_EOI);
    }
    platform.outb(PIC1_CMD, PIC_EOI);
}
