//! Descriptor operation tables for files and directories.
//!
//! `open`/`close` are stateless successes (the generic open/close fronts
//! do the real slot work); `write` always fails on a read-only
//! filesystem. A directory read returns one stored filename per call,
//! using the descriptor's offset as the dentry cursor.

use crate::error::{KernelError, KernelResult};
use crate::fs;
use crate::process::fd::{FileContext, FileOps, FileType};

pub static FS_FILE_OPS: FileOps = FileOps {
    open: fs_open,
    close: fs_close,
    read: file_read,
    write: fs_write,
};

pub static FS_DIR_OPS: FileOps = FileOps {
    open: fs_open,
    close: fs_close,
    read: dir_read,
    write: fs_write,
};

fn fs_open() -> KernelResult<()> {
    Ok(())
}

fn fs_close() -> KernelResult<()> {
    Ok(())
}

fn fs_write(_ctx: &mut FileContext, _buf: &[u8]) -> KernelResult<usize> {
    Err(KernelError::Unsupported)
}

/// Sequential file read: copy from the current offset, advance it by the
/// bytes delivered.
fn file_read(ctx: &mut FileContext, buf: &mut [u8]) -> KernelResult<usize> {
    if ctx.filetype != FileType::Regular {
        return Err(KernelError::InvalidArgument);
    }
    if buf.is_empty() {
        return Ok(0);
    }
    let n = fs::image()?.read_data(ctx.inode, ctx.offset, buf)?;
    ctx.offset += n as u32;
    Ok(n)
}

/// Directory read: one filename per call, clipped to the caller's
/// buffer, empty once the listing is exhausted.
fn dir_read(ctx: &mut FileContext, buf: &mut [u8]) -> KernelResult<usize> {
    if ctx.filetype != FileType::Directory {
        return Err(KernelError::InvalidArgument);
    }
    if buf.is_empty() {
        return Ok(0);
    }
    let n = fs::image()?.read_dentry_name_into(ctx.offset, buf)?;
    if n > 0 {
        ctx.offset += 1;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_descriptor_type_is_rejected() {
        let mut ctx = FileContext {
            filetype: FileType::Directory,
            inode: 0,
            offset: 0,
        };
        let mut buf = [0u8; 8];
        assert!(file_read(&mut ctx, &mut buf).is_err());
        ctx.filetype = FileType::Regular;
        assert!(dir_read(&mut ctx, &mut buf).is_err());
    }

    #[test]
    fn writes_never_succeed() {
        let mut ctx = FileContext {
            filetype: FileType::Regular,
            inode: 0,
            offset: 0,
        };
        assert!(fs_write(&mut ctx, b"data").is_err());
    }
}
