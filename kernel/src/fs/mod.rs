//! The read-only in-memory filesystem.
//!
//! The boot loader hands the kernel one module: a flat filesystem image
//! of 4 KiB blocks (boot block, inodes, data). [`image::FsImage`] does
//! all parsing against that byte range; this module owns the global
//! handle installed at boot.

pub mod image;
pub mod ops;

use spin::Once;

use crate::error::{KernelError, KernelResult};
use image::{Dentry, FsImage};

static IMAGE: Once<FsImage> = Once::new();

/// Adopt the loader-provided module as the filesystem.
///
/// # Safety
///
/// `start..end` must be the module's physical extent, mapped and
/// untouched for the life of the kernel.
pub unsafe fn init(start: u32, end: u32) -> KernelResult<()> {
    // SAFETY: Forwarded directly from the caller's contract.
    let img = unsafe { FsImage::from_raw(start, end)? };
    IMAGE.call_once(|| img);
    Ok(())
}

/// The mounted image, or an error before `init` ran.
pub fn image() -> KernelResult<&'static FsImage> {
    IMAGE.get().ok_or(KernelError::InvalidState {
        what: "filesystem not mounted",
    })
}

/// Name lookup in the boot block.
pub fn lookup(name: &[u8]) -> KernelResult<Dentry> {
    image()?.read_dentry_by_name(name)
}
