//! Three multiplexed terminals.
//!
//! Two independent indices govern the multiplexing:
//!
//! - **displayed**: which terminal's pixels the VGA hardware shows.
//!   Changed only by the keyboard hotkeys; switching copies the live
//!   page out to the outgoing terminal's backing page and the incoming
//!   terminal's backing in.
//! - **active**: the terminal owned by the currently scheduled task.
//!   All kernel-side printing and keyboard reads route here. The
//!   scheduler retargets it on every tick; the keyboard handler pins it
//!   to the displayed terminal for the duration of its body so echo is
//!   always visible.
//!
//! When a terminal is both active and displayed, the active print
//! destination is the live page itself; otherwise it is that terminal's
//! backing page.

pub mod console;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::arch::interrupts::without_interrupts;
use crate::drivers::keyboard::{LineBuffer, PROMPT};
use crate::error::{KernelError, KernelResult};
use crate::mm::{terminal_backing_addr, VIDEO_MEM_LIVE};
use crate::process::fd::{
    open_noop, read_noop, write_noop, FileContext, FileOps,
};

pub const NUM_TERMINALS: usize = 3;

/// One terminal: its keyboard line, saved cursor, and current print page.
struct Terminal {
    line: LineBuffer,
    cursor_x: usize,
    cursor_y: usize,
    /// Physical page this terminal's output lands on right now: the live
    /// page while displayed, its backing page otherwise.
    vmem_base: u32,
}

impl Terminal {
    const fn new(vmem_base: u32) -> Self {
        Terminal {
            line: LineBuffer::new(),
            cursor_x: 0,
            cursor_y: 0,
            vmem_base,
        }
    }
}

static TERMINALS: Mutex<[Terminal; NUM_TERMINALS]> = Mutex::new([
    // Terminal 0 starts displayed, so it owns the live page.
    Terminal::new(0x000B_8000),
    Terminal::new(0x000B_A000),
    Terminal::new(0x000B_B000),
]);

/// Read in progress, one flag per terminal; polled lock-free by the
/// blocked reader and cleared by the keyboard handler's Enter.
static READING: [AtomicBool; NUM_TERMINALS] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];

static DISPLAYED: AtomicUsize = AtomicUsize::new(0);
static ACTIVE: AtomicUsize = AtomicUsize::new(0);

pub static STDIN_OPS: FileOps = FileOps {
    open: open_noop,
    close: close_refused,
    read: terminal_read,
    write: write_noop,
};

pub static STDOUT_OPS: FileOps = FileOps {
    open: open_noop,
    close: close_refused,
    read: read_noop,
    write: terminal_write,
};

fn close_refused() -> KernelResult<()> {
    Err(KernelError::Unsupported)
}

pub fn displayed_tid() -> usize {
    DISPLAYED.load(Ordering::Relaxed)
}

pub fn active_tid() -> usize {
    ACTIVE.load(Ordering::Relaxed)
}

pub fn is_valid_tid(tid: usize) -> bool {
    tid < NUM_TERMINALS
}

/// Reset all three terminals; terminal 0 becomes displayed and active.
pub fn init() {
    without_interrupts(|| {
        let mut terms = TERMINALS.lock();
        for (tid, term) in terms.iter_mut().enumerate() {
            term.line.clear();
            term.cursor_x = 0;
            term.cursor_y = 0;
            term.vmem_base = if tid == 0 {
                VIDEO_MEM_LIVE
            } else {
                terminal_backing_addr(tid).unwrap_or(VIDEO_MEM_LIVE)
            };
            READING[tid].store(false, Ordering::Relaxed);
        }
        DISPLAYED.store(0, Ordering::Relaxed);
        ACTIVE.store(0, Ordering::Relaxed);
        console::with(|c| {
            c.set_base(VIDEO_MEM_LIVE as usize as *mut u8);
            c.clear_and_home();
        });
    });
}

/// Copy one rendered screen between video pages.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn copy_vmem(dst: u32, src: u32) {
    // SAFETY: Both addresses are video pages mapped by the kernel
    // directory; the regions are distinct pages, so they cannot overlap.
    unsafe {
        core::ptr::copy_nonoverlapping(
            src as usize as *const u8,
            dst as usize as *mut u8,
            console::PAGE_BYTES,
        );
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn copy_vmem(_dst: u32, _src: u32) {}

/// Hotkey path: route the VGA output to `tid`.
///
/// Saves the live page into the outgoing terminal's backing, loads the
/// incoming terminal's backing onto the live page, moves the hardware
/// cursor, and repoints the *active* terminal's print destination at
/// whichever page now corresponds to what its task should see.
pub fn set_displayed_terminal(tid: usize) {
    if !is_valid_tid(tid) {
        return;
    }
    without_interrupts(|| {
        let outgoing = displayed_tid();
        if outgoing == tid {
            return;
        }
        let mut terms = TERMINALS.lock();

        let outgoing_backing = terminal_backing_addr(outgoing).unwrap_or(VIDEO_MEM_LIVE);
        terms[outgoing].vmem_base = outgoing_backing;
        terms[tid].vmem_base = VIDEO_MEM_LIVE;

        copy_vmem(outgoing_backing, VIDEO_MEM_LIVE);
        copy_vmem(VIDEO_MEM_LIVE, terminal_backing_addr(tid).unwrap_or(VIDEO_MEM_LIVE));

        crate::drivers::vga::set_cursor(terms[tid].cursor_x, terms[tid].cursor_y);
        DISPLAYED.store(tid, Ordering::Relaxed);

        let active = active_tid();
        let active_base = terms[active].vmem_base;
        console::with(|c| c.set_base(active_base as usize as *mut u8));
    });
}

/// Scheduler path: make `tid` the terminal the running task prints to
/// and reads from. Also retargets the user vidmap window.
pub fn set_active_terminal(tid: usize) -> KernelResult<()> {
    if !is_valid_tid(tid) {
        return Err(KernelError::InvalidArgument);
    }
    without_interrupts(|| {
        let outgoing = active_tid();
        if outgoing == tid {
            return Ok(());
        }
        let mut terms = TERMINALS.lock();

        let (x, y) = console::with(|c| c.cursor());
        terms[outgoing].cursor_x = x;
        terms[outgoing].cursor_y = y;

        let (nx, ny, base) = (terms[tid].cursor_x, terms[tid].cursor_y, terms[tid].vmem_base);
        console::with(|c| {
            c.set_base(base as usize as *mut u8);
            c.set_cursor_pos(nx, ny);
        });

        crate::mm::paging::set_user_vmem_base_addr(base)?;
        ACTIVE.store(tid, Ordering::Relaxed);
        Ok(())
    })
}

/// `read` on stdin: wait for a full line on the active terminal.
///
/// Clears the line buffer, raises the reading flag, and spins until the
/// keyboard handler's Enter drops it, then drains the line.
pub fn terminal_read(_ctx: &mut FileContext, buf: &mut [u8]) -> KernelResult<usize> {
    let tid = active_tid();
    without_interrupts(|| {
        TERMINALS.lock()[tid].line.clear();
        READING[tid].store(true, Ordering::Release);
    });
    while READING[tid].load(Ordering::Acquire) {
        core::hint::spin_loop();
    }
    Ok(without_interrupts(|| {
        TERMINALS.lock()[tid].line.read_into(buf)
    }))
}

/// `write` on stdout: render to the active terminal's page.
pub fn terminal_write(_ctx: &mut FileContext, buf: &[u8]) -> KernelResult<usize> {
    console::with(|c| c.write_bytes(buf));
    Ok(buf.len())
}

/// Keyboard handler body for printable/editing keys, applied to the
/// displayed terminal (the handler has pinned active == displayed).
pub fn feed_displayed_terminal(is_enter: bool, is_backspace: bool, keycode: u8) {
    without_interrupts(|| {
        let tid = displayed_tid();
        let mut terms = TERMINALS.lock();

        if !READING[tid].load(Ordering::Acquire) {
            return;
        }

        if is_backspace {
            match terms[tid].line.pop() {
                Some(b'\t') => console::with(|c| {
                    for _ in 0..console::TAB_WIDTH {
                        c.backspace();
                    }
                }),
                Some(_) => console::with(|c| c.backspace()),
                None => {}
            }
            return;
        }

        if is_enter {
            READING[tid].store(false, Ordering::Release);
        }
        if keycode == 0 {
            return;
        }
        if terms[tid].line.push(keycode).is_ok() {
            console::with(|c| c.put_byte(keycode));
        }
    });
}

/// Ctrl+L: wipe the displayed screen; when a read is pending, re-echo
/// the prompt and the partially typed line.
pub fn clear_displayed_and_reprint() {
    without_interrupts(|| {
        let tid = displayed_tid();
        let terms = TERMINALS.lock();
        console::with(|c| c.clear_and_home());
        if READING[tid].load(Ordering::Acquire) {
            console::with(|c| {
                c.write_bytes(PROMPT);
                c.write_bytes(terms[tid].line.contents());
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests drive the shared terminal globals; serialize them.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn reset() {
        init();
    }

    #[test]
    fn typed_keys_buffer_only_while_reading() {
        let _serial = TEST_LOCK.lock();
        reset();
        feed_displayed_terminal(false, false, b'x');
        assert_eq!(TERMINALS.lock()[0].line.contents(), b"");

        READING[0].store(true, Ordering::Release);
        feed_displayed_terminal(false, false, b'c');
        feed_displayed_terminal(false, false, b'a');
        feed_displayed_terminal(false, false, b't');
        assert_eq!(TERMINALS.lock()[0].line.contents(), b"cat");

        // Backspace retracts; Enter terminates the read and lands the
        // newline in the buffer.
        feed_displayed_terminal(false, true, 0);
        assert_eq!(TERMINALS.lock()[0].line.contents(), b"ca");
        feed_displayed_terminal(true, false, b'\n');
        assert!(!READING[0].load(Ordering::Acquire));
        assert_eq!(TERMINALS.lock()[0].line.contents(), b"ca\n");
        reset();
    }

    #[test]
    fn displayed_switch_moves_page_ownership() {
        let _serial = TEST_LOCK.lock();
        reset();
        set_displayed_terminal(1);
        assert_eq!(displayed_tid(), 1);
        {
            let terms = TERMINALS.lock();
            assert_eq!(terms[0].vmem_base, 0xB9000);
            assert_eq!(terms[1].vmem_base, VIDEO_MEM_LIVE);
        }
        // Out-of-range requests are ignored.
        set_displayed_terminal(7);
        assert_eq!(displayed_tid(), 1);
        reset();
    }

    #[test]
    fn active_switch_saves_and_targets_backing_pages() {
        let _serial = TEST_LOCK.lock();
        reset();
        assert!(set_active_terminal(2).is_ok());
        assert_eq!(active_tid(), 2);
        assert!(set_active_terminal(9).is_err());
        assert_eq!(active_tid(), 2);
        reset();
    }
}
