//! COM1 16550 serial driver.
//!
//! The serial line is the kernel's logging channel: the `log` facade in
//! `klog` writes here, and the panic handler mirrors its message here so
//! diagnostics survive even when video memory is in a bad state.

use core::fmt;

use spin::Mutex;

use crate::arch::x86;

const COM1_BASE: u16 = 0x3F8;

const REG_DATA: u16 = 0;
const REG_INT_ENABLE: u16 = 1;
const REG_FIFO_CTRL: u16 = 2;
const REG_LINE_CTRL: u16 = 3;
const REG_MODEM_CTRL: u16 = 4;
const REG_LINE_STATUS: u16 = 5;

const LSR_THR_EMPTY: u8 = 0x20;

/// A port-mapped 16550-compatible UART.
pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    pub const fn new(base: u16) -> Self {
        SerialPort { base }
    }

    /// Program 38400 baud, 8N1, FIFOs on, interrupts off.
    pub fn init(&mut self) {
        // SAFETY: Standard 16550 programming sequence on the caller's
        // port base; each write targets a documented UART register.
        unsafe {
            x86::outb(self.base + REG_INT_ENABLE, 0x00);
            x86::outb(self.base + REG_LINE_CTRL, 0x80); // DLAB on
            x86::outb(self.base + REG_DATA, 0x03); // divisor low: 38400 baud
            x86::outb(self.base + REG_INT_ENABLE, 0x00); // divisor high
            x86::outb(self.base + REG_LINE_CTRL, 0x03); // 8N1, DLAB off
            x86::outb(self.base + REG_FIFO_CTRL, 0xC7);
            x86::outb(self.base + REG_MODEM_CTRL, 0x0B);
        }
    }

    fn write_byte(&mut self, byte: u8) {
        // SAFETY: Polls line status then writes the transmit holding
        // register; both are defined 16550 accesses.
        unsafe {
            while x86::inb(self.base + REG_LINE_STATUS) & LSR_THR_EMPTY == 0 {
                core::hint::spin_loop();
            }
            x86::outb(self.base + REG_DATA, byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

#[cfg_attr(not(all(target_arch = "x86", target_os = "none")), allow(dead_code))]
static COM1: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1_BASE));

/// Initialize COM1. Called once, early in boot.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    COM1.lock().init();
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn init() {}

#[doc(hidden)]
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    crate::arch::interrupts::without_interrupts(|| {
        let _ = COM1.lock().write_fmt(args);
    });
}

#[doc(hidden)]
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn _print(_args: fmt::Arguments) {}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
