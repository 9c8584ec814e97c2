//! Program-image loading.
//!
//! The whole file is copied verbatim to the fixed load address inside
//! the target PID's program page; afterwards the entry EIP extracted
//! from the header must match the word actually sitting in the loaded
//! image, or the copy is declared corrupt.

use crate::error::{KernelError, KernelResult};
use crate::fs;
use crate::mm::{PROGRAM_LOAD_VIRT, PROGRAM_PAGE_SIZE, USER_PAGE_VIRT_BASE};
use crate::process::parser::ENTRY_EIP_OFFSET;
use crate::process::{translate_user_to_kernel, ExecInfo};

/// Largest image that fits between the load address and the end of the
/// program page.
pub const MAX_IMAGE_LEN: u32 = PROGRAM_PAGE_SIZE - (PROGRAM_LOAD_VIRT - USER_PAGE_VIRT_BASE);

/// Copy `info`'s file into `pid`'s program page and cross-check the
/// entry point. The page must already be created and kernel-mapped.
pub fn load_executable_into_memory(info: &ExecInfo, pid: u32) -> KernelResult<()> {
    if info.file_len == 0 || info.file_len > MAX_IMAGE_LEN {
        return Err(KernelError::NotExecutable);
    }

    let dest_phys = translate_user_to_kernel(PROGRAM_LOAD_VIRT, pid)?;
    // SAFETY: The destination range was just bounds-checked against the
    // program page, which the caller created and mapped for the kernel.
    let dest = unsafe {
        core::slice::from_raw_parts_mut(dest_phys as usize as *mut u8, info.file_len as usize)
    };

    let copied = fs::image()?.read_data(info.inode, 0, dest)?;
    if copied != info.file_len as usize {
        log::warn!("short program image copy: {copied} of {} bytes", info.file_len);
        return Err(KernelError::NotExecutable);
    }

    let off = ENTRY_EIP_OFFSET as usize;
    let loaded_eip = u32::from_le_bytes([dest[off], dest[off + 1], dest[off + 2], dest[off + 3]]);
    if loaded_eip != info.entry_eip {
        log::warn!(
            "loaded image entry {loaded_eip:#010x} disagrees with header {:#010x}",
            info.entry_eip
        );
        return Err(KernelError::NotExecutable);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_size_cap_leaves_room_for_the_load_offset() {
        assert_eq!(MAX_IMAGE_LEN, 0x0040_0000 - 0x0004_8000);
    }

    #[test]
    fn zero_length_images_are_rejected_before_any_copy() {
        let info = ExecInfo {
            inode: 0,
            file_len: 0,
            entry_eip: 0,
        };
        assert!(load_executable_into_memory(&info, 1).is_err());
        let info = ExecInfo {
            inode: 0,
            file_len: MAX_IMAGE_LEN + 1,
            entry_eip: 0,
        };
        assert!(load_executable_into_memory(&info, 1).is_err());
    }
}
