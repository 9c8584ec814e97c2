//! Architecture support.
//!
//! Everything below `arch::` that touches hardware is specific to 32-bit
//! x86 protected mode and only compiles for the bare-metal target. The
//! handful of pure helpers (descriptor layout math, flag types) build
//! everywhere so the host test harness can reach them.

pub mod x86;

pub use x86::interrupts;
