//! PS/2 keyboard: scancode set 1 state machine, line buffering, and the
//! terminal hotkeys.
//!
//! The handler always acts on the *displayed* terminal: its body runs
//! with the active terminal temporarily switched to the displayed one,
//! so echo lands on the screen the user is looking at no matter which
//! task is scheduled. Alt+F1/F2/F3 switch the displayed terminal;
//! Ctrl+L clears it (re-echoing the prompt and any half-typed line when
//! a read is in progress). Enter completes an in-progress
//! `terminal_read`; Backspace retracts from the line buffer, retracting
//! four columns for a tab.

use spin::Mutex;

use crate::terminal;

pub const DATA_PORT: u16 = 0x60;

/// Scancodes below this translate through the keymaps; everything at or
/// above is a release code or an extended key this kernel ignores.
pub const NUM_KEYS: usize = 62;
pub const NUM_MODES: usize = 4;

/// Line buffer capacity; the last slot is reserved for the newline.
pub const LINE_BUF_SIZE: usize = 128;

/// Prompt re-echoed by Ctrl+L while a line read is in progress.
pub const PROMPT: &[u8] = b"391OS> ";

// Scancode set 1, press (make) codes.
const SC_LSHIFT: u8 = 0x2A;
const SC_RSHIFT: u8 = 0x36;
const SC_CTRL: u8 = 0x1D;
const SC_ALT: u8 = 0x38;
const SC_CAPSLOCK: u8 = 0x3A;
const SC_ENTER: u8 = 0x1C;
const SC_BACKSPACE: u8 = 0x0E;
const SC_F1: u8 = 0x3B;
const SC_F2: u8 = 0x3C;
const SC_F3: u8 = 0x3D;
const SC_L: u8 = 0x26;

// Release (break) codes: make | 0x80.
const SC_LSHIFT_UP: u8 = 0xAA;
const SC_RSHIFT_UP: u8 = 0xB6;
const SC_CTRL_UP: u8 = 0x9D;
const SC_ALT_UP: u8 = 0xB8;
const SC_L_UP: u8 = 0xA6;

const PLAIN: [u8; NUM_KEYS] =
    *b"\0\01234567890-=\0\tqwertyuiop[]\n\0asdfghjkl;'`\0\\zxcvbnm,./\0*\0 \0\0\0\0";
const SHIFTED: [u8; NUM_KEYS] =
    *b"\0\0!@#$%^&*()_+\0\tQWERTYUIOP{}\n\0ASDFGHJKL:\"~\0|ZXCVBNM<>?\0*\0 \0\0\0\0";
const CAPS: [u8; NUM_KEYS] =
    *b"\0\01234567890-=\0\tQWERTYUIOP[]\n\0ASDFGHJKL;'`\0\\ZXCVBNM,./\0*\0 \0\0\0\0";
const CAPS_SHIFTED: [u8; NUM_KEYS] =
    *b"\0\0!@#$%^&*()_+\0\tqwertyuiop{}\n\0asdfghjkl:\"~\0\\zxcvbnm<>?\0*\0 \0\0\0\0";

/// The four translation tables, indexed by [`mode_index`].
pub static KEYMAPS: [[u8; NUM_KEYS]; NUM_MODES] = [PLAIN, SHIFTED, CAPS, CAPS_SHIFTED];

/// Keymap selection from the sticky modifier pair.
pub fn mode_index(shift: bool, caps: bool) -> usize {
    shift as usize | (caps as usize) << 1
}

/// Modifier and edge state tracked across interrupts.
#[derive(Debug, Clone, Copy)]
pub struct ModifierState {
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
    pub caps: bool,
    /// Rising-edge gate for Ctrl+L so holding the key clears once.
    clear_armed: bool,
}

impl ModifierState {
    pub const fn new() -> Self {
        ModifierState {
            shift: false,
            ctrl: false,
            alt: false,
            caps: false,
            clear_armed: true,
        }
    }

    pub fn keymap(&self) -> &'static [u8; NUM_KEYS] {
        &KEYMAPS[mode_index(self.shift, self.caps)]
    }

    /// Track a modifier or hotkey scancode. Returns true when the code
    /// was consumed here (it is not a printable key).
    pub fn consume(&mut self, scancode: u8) -> bool {
        match scancode {
            SC_LSHIFT | SC_RSHIFT => self.shift = true,
            SC_LSHIFT_UP | SC_RSHIFT_UP => self.shift = false,
            SC_CTRL => self.ctrl = true,
            SC_CTRL_UP => self.ctrl = false,
            SC_ALT => self.alt = true,
            SC_ALT_UP => self.alt = false,
            SC_CAPSLOCK => self.caps = !self.caps,
            SC_F1 => {
                if self.alt {
                    terminal::set_displayed_terminal(0);
                }
            }
            SC_F2 => {
                if self.alt {
                    terminal::set_displayed_terminal(1);
                }
            }
            SC_F3 => {
                if self.alt {
                    terminal::set_displayed_terminal(2);
                }
            }
            SC_L_UP => self.clear_armed = true,
            _ => return false,
        }
        true
    }
}

static MODIFIERS: Mutex<ModifierState> = Mutex::new(ModifierState::new());

/// A terminal's keyboard line buffer.
pub struct LineBuffer {
    buf: [u8; LINE_BUF_SIZE],
    len: usize,
}

impl LineBuffer {
    pub const fn new() -> Self {
        LineBuffer {
            buf: [0; LINE_BUF_SIZE],
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append a byte. The final slot only ever takes the newline, so a
    /// full line can always be terminated.
    pub fn push(&mut self, byte: u8) -> Result<(), ()> {
        if self.len >= LINE_BUF_SIZE {
            return Err(());
        }
        if self.len == LINE_BUF_SIZE - 1 && byte != b'\n' {
            return Err(());
        }
        self.buf[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Retract the most recent byte, returning it.
    pub fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.buf[self.len])
    }

    /// Drain the line into `out`. When `out` is smaller than the line,
    /// the delivered portion is forcibly newline-terminated.
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        if out.len() >= self.len {
            out[..self.len].copy_from_slice(&self.buf[..self.len]);
            self.len
        } else {
            self.buf[out.len() - 1] = b'\n';
            out.copy_from_slice(&self.buf[..out.len()]);
            out.len()
        }
    }

    /// The buffered bytes (for re-echo after a screen clear).
    pub fn contents(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        LineBuffer::new()
    }
}

/// Enable the keyboard line. The PS/2 controller needs no further setup
/// for scancode set 1.
pub fn init() {
    *MODIFIERS.lock() = ModifierState::new();
    crate::drivers::pic::enable_irq(crate::drivers::pic::IRQ_KEYBOARD);
}

/// Interrupt body. Echo must reach the screen the user is watching, so
/// the active terminal is pinned to the displayed one for the duration.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn interrupt_handler() {
    let previous_active = terminal::active_tid();
    let _ = terminal::set_active_terminal(terminal::displayed_tid());
    // SAFETY: Reading the PS/2 data port pops the scancode that raised
    // this interrupt.
    let scancode = unsafe { crate::arch::x86::inb(DATA_PORT) };
    handle_scancode(scancode);
    let _ = terminal::set_active_terminal(previous_active);
}

/// Translate and apply one scancode against the displayed terminal.
pub fn handle_scancode(scancode: u8) {
    let mut mods = MODIFIERS.lock();

    if mods.consume(scancode) {
        return;
    }

    // Ctrl+L: wipe the displayed screen; if a read is pending, re-echo
    // the prompt and the half-typed line.
    if scancode == SC_L && mods.ctrl && mods.clear_armed {
        mods.clear_armed = false;
        terminal::clear_displayed_and_reprint();
        return;
    }

    if scancode as usize >= NUM_KEYS {
        return;
    }
    let keycode = mods.keymap()[scancode as usize];
    drop(mods);

    terminal::feed_displayed_terminal(scancode == SC_ENTER, scancode == SC_BACKSPACE, keycode);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keymaps_are_selected_by_shift_and_caps() {
        assert_eq!(mode_index(false, false), 0);
        assert_eq!(mode_index(true, false), 1);
        assert_eq!(mode_index(false, true), 2);
        assert_eq!(mode_index(true, true), 3);

        let q = 16usize; // scancode 0x10
        assert_eq!(KEYMAPS[0][q], b'q');
        assert_eq!(KEYMAPS[1][q], b'Q');
        assert_eq!(KEYMAPS[2][q], b'Q');
        assert_eq!(KEYMAPS[3][q], b'q');

        let one = 2usize;
        assert_eq!(KEYMAPS[0][one], b'1');
        assert_eq!(KEYMAPS[1][one], b'!');
        assert_eq!(KEYMAPS[2][one], b'1');
        assert_eq!(KEYMAPS[3][one], b'!');
    }

    #[test]
    fn modifier_edges_track_press_and_release() {
        let mut m = ModifierState::new();
        assert!(m.consume(SC_LSHIFT));
        assert!(m.shift);
        assert!(m.consume(SC_CAPSLOCK));
        assert!(m.caps);
        assert_eq!(mode_index(m.shift, m.caps), 3);
        assert!(m.consume(SC_RSHIFT_UP));
        assert!(!m.shift);
        assert!(m.consume(SC_CAPSLOCK));
        assert!(!m.caps);
        assert!(!m.consume(0x10)); // 'q' is not a modifier
    }

    #[test]
    fn line_buffer_reserves_the_last_slot_for_newline() {
        let mut b = LineBuffer::new();
        for _ in 0..LINE_BUF_SIZE - 1 {
            b.push(b'a').unwrap();
        }
        assert!(b.push(b'b').is_err());
        b.push(b'\n').unwrap();
        assert!(b.push(b'\n').is_err());
    }

    #[test]
    fn pop_returns_the_retracted_byte() {
        let mut b = LineBuffer::new();
        assert_eq!(b.pop(), None);
        b.push(b'\t').unwrap();
        b.push(b'x').unwrap();
        assert_eq!(b.pop(), Some(b'x'));
        assert_eq!(b.pop(), Some(b'\t'));
        assert_eq!(b.pop(), None);
    }

    #[test]
    fn short_reads_are_newline_terminated() {
        let mut b = LineBuffer::new();
        for &c in b"hello world\n" {
            b.push(c).unwrap();
        }
        let mut big = [0u8; 32];
        let mut b2 = LineBuffer::new();
        for &c in b"hello world\n" {
            b2.push(c).unwrap();
        }
        assert_eq!(b2.read_into(&mut big), 12);
        assert_eq!(&big[..12], b"hello world\n");

        let mut small = [0u8; 5];
        assert_eq!(b.read_into(&mut small), 5);
        assert_eq!(&small, b"hell\n");

        let mut empty = [0u8; 0];
        assert_eq!(b.read_into(&mut empty), 0);
    }
}
