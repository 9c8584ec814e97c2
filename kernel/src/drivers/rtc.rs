//! Real-time clock with per-stream virtualization.
//!
//! The physical MC146818 is programmed once, at its highest supported
//! periodic rate, and never reprogrammed. Each of the three root task
//! streams carries its own *virtual* frequency: the physical handler
//! strides a shared tick counter and raises a stream's strike flag
//! whenever the counter lands on that stream's period. `read` blocks on
//! the flag; `write` only changes the virtual frequency.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::arch::interrupts::without_interrupts;
use crate::error::{KernelError, KernelResult};
use crate::process::fd::{FileContext, FileOps};

// Port protocol constants only touched by the bare-metal paths.
#[allow(dead_code)]
const INDEX_PORT: u16 = 0x70;
#[allow(dead_code)]
const DATA_PORT: u16 = 0x71;
/// Register selectors with NMI disabled (bit 7).
#[allow(dead_code)]
const REG_A: u8 = 0x8A;
#[allow(dead_code)]
const REG_B: u8 = 0x8B;
#[allow(dead_code)]
const REG_C: u8 = 0x0C;

/// Rate divisor 3: 8192 Hz periodic interrupts.
#[allow(dead_code)]
const RATE_8192HZ: u8 = 0x03;

/// Physical interrupt rate the hardware is left running at.
pub const MAX_PHYSICAL_HZ: u32 = 8192;

/// Virtual frequency bounds for `write`.
pub const MIN_VIRTUAL_HZ: u32 = 2;
pub const MAX_VIRTUAL_HZ: u32 = 1024;

/// Frequency every stream starts at, and `open` resets to.
pub const OPEN_HZ: u32 = 2;

/// Physical-tick stride divisor; tuned so a virtual frequency of f
/// strikes roughly f times per second of physical ticks.
const CLOCK_MULTIPLIER: u32 = 16;

const STREAMS: usize = crate::sched::NUM_STREAMS;

/// Per-stream virtual frequency.
static FREQS: Mutex<[u32; STREAMS]> = Mutex::new([OPEN_HZ; STREAMS]);
/// Strike flags, polled lock-free by blocked readers.
static STRIKES: [AtomicBool; STREAMS] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];
/// The shared physical tick counter.
static TICKS: AtomicU32 = AtomicU32::new(0);

pub static RTC_OPS: FileOps = FileOps {
    open: rtc_open,
    close: rtc_close,
    read: rtc_read,
    write: rtc_write,
};

/// Physical ticks between strikes for a stream running at `freq`.
pub fn strike_period(freq: u32) -> u32 {
    (MAX_PHYSICAL_HZ / freq / CLOCK_MULTIPLIER).max(1)
}

/// Is `freq` a legal virtual frequency (power of two in range)?
pub fn is_valid_frequency(freq: i32) -> bool {
    let Ok(f) = u32::try_from(freq) else {
        return false;
    };
    (MIN_VIRTUAL_HZ..=MAX_VIRTUAL_HZ).contains(&f) && f.is_power_of_two()
}

/// Virtual RTC stream of the currently running task: its owning root's
/// terminal index.
fn current_stream() -> usize {
    let root = crate::process::canonical_pid(crate::process::current_pid());
    (root.saturating_sub(1) as usize).min(STREAMS - 1)
}

/// Program the periodic interrupt and unmask the line.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    use crate::arch::x86::{inb, outb};

    without_interrupts(|| {
        // SAFETY: Standard CMOS index/data protocol: enable periodic
        // interrupts (register B bit 6) and select the 8192 Hz rate in
        // register A's low nibble.
        unsafe {
            outb(INDEX_PORT, REG_B);
            let prev_b = inb(DATA_PORT);
            outb(INDEX_PORT, REG_B);
            outb(DATA_PORT, prev_b | 0x40);

            outb(INDEX_PORT, REG_A);
            let prev_a = inb(DATA_PORT);
            outb(INDEX_PORT, REG_A);
            outb(DATA_PORT, (prev_a & 0xF0) | RATE_8192HZ);
        }
    });

    *FREQS.lock() = [OPEN_HZ; STREAMS];
    for strike in STRIKES.iter() {
        strike.store(false, Ordering::Relaxed);
    }

    crate::drivers::pic::enable_irq(crate::drivers::pic::IRQ_RTC);
}

/// Physical interrupt body: advance the tick counter, strike every
/// stream whose period divides it, and re-arm the device by draining
/// register C.
pub fn interrupt_handler() {
    let tick = TICKS.load(Ordering::Relaxed);
    {
        let freqs = FREQS.lock();
        for (stream, &freq) in freqs.iter().enumerate() {
            if tick % strike_period(freq) == 0 {
                STRIKES[stream].store(true, Ordering::Release);
            }
        }
    }

    without_interrupts(|| {
        TICKS.fetch_add(1, Ordering::Relaxed);
        // The device will not raise another interrupt until register C
        // has been read.
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        // SAFETY: Select register C, then a throwaway data read.
        unsafe {
            crate::arch::x86::outb(INDEX_PORT, REG_C);
            let _ = crate::arch::x86::inb(DATA_PORT);
        }
    });
}

fn rtc_open() -> KernelResult<()> {
    set_frequency(OPEN_HZ);
    Ok(())
}

fn rtc_close() -> KernelResult<()> {
    Ok(())
}

/// Block until the stream's next virtual tick. Returns 0 bytes: the
/// tick itself is the payload.
fn rtc_read(_ctx: &mut FileContext, _buf: &mut [u8]) -> KernelResult<usize> {
    let stream = current_stream();
    STRIKES[stream].store(false, Ordering::Release);
    while !STRIKES[stream].load(Ordering::Acquire) {
        core::hint::spin_loop();
    }
    Ok(0)
}

/// Set the stream's virtual frequency from a 4-byte little-endian value.
fn rtc_write(_ctx: &mut FileContext, buf: &[u8]) -> KernelResult<usize> {
    let bytes: [u8; 4] = buf.try_into().map_err(|_| KernelError::InvalidArgument)?;
    let freq = i32::from_le_bytes(bytes);
    if !is_valid_frequency(freq) {
        return Err(KernelError::InvalidArgument);
    }
    set_frequency(freq as u32);
    Ok(0)
}

fn set_frequency(freq: u32) {
    without_interrupts(|| {
        let stream = current_stream();
        FREQS.lock()[stream] = freq;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strike_periods_scale_inversely_with_frequency() {
        assert_eq!(strike_period(2), 256);
        assert_eq!(strike_period(4), 128);
        assert_eq!(strike_period(1024), 1);
        // The clamp keeps pathological values striking every tick
        // instead of never.
        assert_eq!(strike_period(MAX_PHYSICAL_HZ), 1);
    }

    #[test]
    fn frequency_validation_requires_power_of_two_in_range() {
        for ok in [2, 4, 8, 16, 256, 1024] {
            assert!(is_valid_frequency(ok), "{ok} should be accepted");
        }
        for bad in [0, 1, 3, 6, 1000, 2048, -2] {
            assert!(!is_valid_frequency(bad), "{bad} should be rejected");
        }
    }

    #[test]
    fn write_parses_little_endian_and_rejects_short_buffers() {
        let mut ctx = FileContext {
            filetype: crate::process::fd::FileType::Device,
            inode: 0,
            offset: 0,
        };
        assert!(rtc_write(&mut ctx, &8i32.to_le_bytes()).is_ok());
        assert!(rtc_write(&mut ctx, &3i32.to_le_bytes()).is_err());
        assert!(rtc_write(&mut ctx, &[8, 0]).is_err());
        assert!(rtc_write(&mut ctx, &[]).is_err());
    }

    #[test]
    fn handler_strikes_matching_streams() {
        // Stream 0 at the minimum rate: period 256. Force the counter to
        // a known multiple and confirm the strike lands.
        *FREQS.lock() = [MIN_VIRTUAL_HZ; STREAMS];
        TICKS.store(512, Ordering::Relaxed);
        for s in STRIKES.iter() {
            s.store(false, Ordering::Relaxed);
        }
        interrupt_handler();
        assert!(STRIKES[0].load(Ordering::Relaxed));

        // One past the multiple: no strike.
        for s in STRIKES.iter() {
            s.store(false, Ordering::Relaxed);
        }
        interrupt_handler();
        assert!(!STRIKES[0].load(Ordering::Relaxed));
    }
}
