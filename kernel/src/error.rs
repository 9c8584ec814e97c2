//! Kernel error types.
//!
//! Internal helpers propagate these with `?`; the system-call boundary
//! folds every variant into the single numeric `-1` the user ABI promises.

use core::fmt;

/// Result alias used by internal kernel APIs.
pub type KernelResult<T> = Result<T, KernelError>;

/// Error type shared by all kernel subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// A user-supplied pointer fell outside the caller's program page.
    BadUserPointer { addr: u32 },
    /// A user-supplied argument failed validation.
    InvalidArgument,
    /// A file descriptor index was out of range, closed, or reserved.
    BadFileDescriptor { fd: i32 },
    /// The named file does not exist in the filesystem image.
    NotFound,
    /// The file exists but is not a loadable program image.
    NotExecutable,
    /// A fixed-size table (PCBs, FDs) has no free slot.
    ResourceExhausted { resource: &'static str },
    /// The operation is not supported by this descriptor's vtable.
    Unsupported,
    /// A filesystem block reference or inode index was out of range.
    FsBounds,
    /// A subsystem was asked to act on state it does not hold.
    InvalidState { what: &'static str },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::BadUserPointer { addr } => {
                write!(f, "bad user pointer {addr:#010x}")
            }
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::BadFileDescriptor { fd } => write!(f, "bad file descriptor {fd}"),
            KernelError::NotFound => write!(f, "no such file"),
            KernelError::NotExecutable => write!(f, "not an executable"),
            KernelError::ResourceExhausted { resource } => {
                write!(f, "out of {resource}")
            }
            KernelError::Unsupported => write!(f, "operation not supported"),
            KernelError::FsBounds => write!(f, "filesystem reference out of range"),
            KernelError::InvalidState { what } => write!(f, "invalid state: {what}"),
        }
    }
}
