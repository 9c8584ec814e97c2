//! TridentOS kernel library.
//!
//! A small preemptively multitasking kernel for 32-bit x86 protected
//! mode: Multiboot boot, paged virtual memory with per-process 4 MiB
//! program pages, up to six processes over three round-robin scheduled
//! task streams, three multiplexed terminals, a read-only in-memory
//! filesystem, and a ten-call POSIX-flavored syscall interface.
//!
//! Hardware-touching code only builds for the bare-metal x86 target;
//! the parsing, bookkeeping, and address-arithmetic layers build
//! everywhere, which is how the host test harness exercises them.

#![no_std]

// Host target: link std so the standard #[test] harness and its
// allocations work.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;
#[macro_use]
pub mod serial;

pub mod arch;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod interrupt;
pub mod klog;
pub mod mm;
pub mod multiboot;
pub mod process;
pub mod sched;
pub mod syscall;
pub mod terminal;

// Re-exports for the boot binary.
pub use error::{KernelError, KernelResult};
