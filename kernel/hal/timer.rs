//! PIT programming and tick arithmetic.

use crate::platform::Platform;

/// PIT input clock in Hz.
pub const PIT_BASE_HZ: u32 = 1_193_182;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte, mode 3 (square wave), binary.
const PIT_MODE_SQUARE: u8 = 0x36;

/// Divisor for `hz`, clamped to the 16-bit counter range.
pub fn pit_divisor(hz: u32) -> u16 {
    let hz = hz.max(1);
    (PIT_BASE_HZ / hz).clamp(1, u16::MAX as u32) as u16
}

/// Program PIT channel 0 to fire at `hz`.
pub fn program_pit(platform: &dyn Platform, hz: u32) {
    let divisor = pit_divisor(hz);
    platform.outb(PIT_COMMAND, PIT_MODE_SQUARE);
    platform.outb(PIT_CHANNEL0, divisor as u8);
    platform.outb(PIT_CHANNEL0, (divisor >> 8) as u8);
}

/// Ticks needed to cover `ms` milliseconds, rounded up.
pub fn ms_to_ticks(ms: u64, hz: u32) -> u64 {
    (ms.saturating_mul(hz as u64) + 999) / 1000
}

pub fn ticks_to_usec(ticks: u64, hz: u32) -> u64 {
    if hz == 0 {
        return 0;
    }
    ticks.saturating_mul(1_000_000) / hz as u64
}

/// Spin with `cpu_pause` until `ms` worth of ticks have elapsed.
pub fn delay_ms(platform: &dyn Platform, hz: u32, ms: u64) {
    let wait = ms_to_ticks(ms, hz);
    let start = platform.ticks();
    while platform.ticks().wrapping_sub(start) < wait {
        platform.cpu_pause();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimPlatform;

    #[test]
    fn test_pit_programming_sequence() {
        let sim = SimPlatform::new();
        program_pit(&sim, 1000);
        let divisor = pit_divisor(1000);
        assert_eq!(divisor, 1193);
        assert_eq!(
            sim.port_writes(),
            [
                (PIT_COMMAND, PIT_MODE_SQUARE as u32),
                (PIT_CHANNEL0, (divisor & 0xFF) as u32),
                (PIT_CHANNEL0, (divisor >> 8) as u32),
            ]
        );
    }

    #[test]
    fn test_divisor_clamps() {
        assert_eq!(pit_divisor(1), u16::MAX);
        assert_eq!(pit_divisor(0), u16::MAX);
        assert_eq!(pit_divisor(10_000_000), 1);
    }

    #[test]
    fn test_tick_conversions() {
        assert_eq!(ms_to_ticks(5, 1000), 5);
        assert_eq!(ms_to_ticks(1, 100), 1);
        assert_eq!(ms_to_ticks(0, 100), 0);
        assert_eq!(ticks_to_usec(3, 1000), 3000);
        assert_eq!(ticks_to_usec(3, 0), 0);
    }

    #[test]
    fn test_zero_delay_returns_immediately() {
        let sim = SimPlatform::new();
        delay_ms(&sim, 1000, 0);
        assert_eq!(sim.ticks(), 0);
    }
}
