//! Programmable interval timer: the scheduler's heartbeat.
//!
//! Channel 0 runs in mode 3 (square wave) at [`TIME_SLICE_HZ`]. The
//! handler body lives in the scheduler; this module only programs the
//! divisor and opens the IRQ line.

#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::drivers::pic;

#[cfg(all(target_arch = "x86", target_os = "none"))]
const CHANNEL0_PORT: u16 = 0x40;
#[cfg(all(target_arch = "x86", target_os = "none"))]
const MODE_PORT: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, mode 3.
#[cfg(all(target_arch = "x86", target_os = "none"))]
const MODE3_SQUARE_WAVE: u8 = 0x36;
/// Input clock of the 8254, in Hz.
pub const PIT_BASE_HZ: u32 = 1_193_182;

/// Scheduling quantum frequency.
pub const TIME_SLICE_HZ: u32 = 20;

/// Divisor that approximates `hz` from the base clock.
pub fn divisor_for(hz: u32) -> u16 {
    (PIT_BASE_HZ / hz) as u16
}

/// Program channel 0 for `hz` square-wave ticks.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn set_frequency(hz: u32) {
    let divisor = divisor_for(hz);
    // SAFETY: Mode/divisor programming on the documented 8254 ports.
    unsafe {
        crate::arch::x86::outb(MODE_PORT, MODE3_SQUARE_WAVE);
        crate::arch::x86::outb(CHANNEL0_PORT, divisor as u8);
        crate::arch::x86::outb(CHANNEL0_PORT, (divisor >> 8) as u8);
    }
}

/// Start the time slicer and unmask its line. Ticks begin delivering
/// once interrupts are globally enabled.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    crate::arch::interrupts::without_interrupts(|| {
        set_frequency(TIME_SLICE_HZ);
        pic::enable_irq(pic::IRQ_PIT);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twenty_hertz_divisor_fits_the_counter() {
        let d = divisor_for(TIME_SLICE_HZ);
        assert_eq!(d, 59659);
        // The achieved rate is within a percent of the target.
        let achieved = PIT_BASE_HZ / d as u32;
        assert!((19..=21).contains(&achieved));
    }
}
