//! File descriptors and the per-process descriptor table.
//!
//! A descriptor pairs an operations vtable with a small file context
//! (type, inode, byte offset). Slots 0 and 1 are stdin and stdout,
//! populated at table creation and never closable; dynamic descriptors
//! occupy 2..8 and are handed out lowest-free-first.

use crate::error::{KernelError, KernelResult};

pub const MAX_FDS: usize = 8;
pub const STDIN_FD: i32 = 0;
pub const STDOUT_FD: i32 = 1;
/// First slot `open` may hand out.
pub const FIRST_DYNAMIC_FD: i32 = 2;

/// On-disk file types, plus the unset marker for empty slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileType {
    Device = 0,
    Directory = 1,
    Regular = 2,
    Unset = 3,
}

impl FileType {
    pub fn from_raw(raw: u32) -> Option<FileType> {
        match raw {
            0 => Some(FileType::Device),
            1 => Some(FileType::Directory),
            2 => Some(FileType::Regular),
            _ => None,
        }
    }
}

/// Mutable per-descriptor state handed to the operations.
#[derive(Debug, Clone, Copy)]
pub struct FileContext {
    pub filetype: FileType,
    pub inode: u32,
    pub offset: u32,
}

impl FileContext {
    pub const fn unset() -> Self {
        FileContext {
            filetype: FileType::Unset,
            inode: 0,
            offset: 0,
        }
    }
}

/// Operations vtable. Descriptors for terminals, the RTC, files, and
/// directories each point at their own static instance; unsupported
/// operations are the `*_noop` entries below.
pub struct FileOps {
    pub open: fn() -> KernelResult<()>,
    pub close: fn() -> KernelResult<()>,
    pub read: fn(&mut FileContext, &mut [u8]) -> KernelResult<usize>,
    pub write: fn(&mut FileContext, &[u8]) -> KernelResult<usize>,
}

pub fn open_noop() -> KernelResult<()> {
    Err(KernelError::Unsupported)
}

pub fn close_noop() -> KernelResult<()> {
    Err(KernelError::Unsupported)
}

pub fn read_noop(_ctx: &mut FileContext, _buf: &mut [u8]) -> KernelResult<usize> {
    Err(KernelError::Unsupported)
}

pub fn write_noop(_ctx: &mut FileContext, _buf: &[u8]) -> KernelResult<usize> {
    Err(KernelError::Unsupported)
}

/// One descriptor slot.
pub struct FileDescriptor {
    pub ops: Option<&'static FileOps>,
    pub context: FileContext,
    pub present: bool,
}

impl FileDescriptor {
    pub const fn empty() -> Self {
        FileDescriptor {
            ops: None,
            context: FileContext::unset(),
            present: false,
        }
    }
}

/// Fixed-size descriptor table embedded in each PCB.
pub struct FdTable {
    slots: [FileDescriptor; MAX_FDS],
}

impl FdTable {
    /// All slots empty; used for PCB storage before a process lives there.
    pub const fn empty() -> Self {
        FdTable {
            slots: [
                FileDescriptor::empty(),
                FileDescriptor::empty(),
                FileDescriptor::empty(),
                FileDescriptor::empty(),
                FileDescriptor::empty(),
                FileDescriptor::empty(),
                FileDescriptor::empty(),
                FileDescriptor::empty(),
            ],
        }
    }

    /// Fresh table with stdin and stdout wired to the terminal.
    pub fn with_std_streams() -> Self {
        let mut table = FdTable::empty();
        table.slots[STDIN_FD as usize] = FileDescriptor {
            ops: Some(&crate::terminal::STDIN_OPS),
            context: FileContext {
                filetype: FileType::Device,
                inode: 0,
                offset: 0,
            },
            present: true,
        };
        table.slots[STDOUT_FD as usize] = FileDescriptor {
            ops: Some(&crate::terminal::STDOUT_OPS),
            context: FileContext {
                filetype: FileType::Device,
                inode: 0,
                offset: 0,
            },
            present: true,
        };
        table
    }

    /// Lowest free dynamic slot, if any.
    pub fn allocate(&mut self) -> KernelResult<i32> {
        for fd in FIRST_DYNAMIC_FD..MAX_FDS as i32 {
            if !self.slots[fd as usize].present {
                return Ok(fd);
            }
        }
        Err(KernelError::ResourceExhausted {
            resource: "file descriptors",
        })
    }

    pub fn get_mut(&mut self, fd: i32) -> KernelResult<&mut FileDescriptor> {
        if !(0..MAX_FDS as i32).contains(&fd) {
            return Err(KernelError::BadFileDescriptor { fd });
        }
        Ok(&mut self.slots[fd as usize])
    }

    /// Close a dynamic descriptor. Stdin and stdout refuse.
    pub fn close(&mut self, fd: i32) -> KernelResult<()> {
        if !(FIRST_DYNAMIC_FD..MAX_FDS as i32).contains(&fd) {
            return Err(KernelError::BadFileDescriptor { fd });
        }
        let slot = &mut self.slots[fd as usize];
        if !slot.present {
            return Err(KernelError::BadFileDescriptor { fd });
        }
        let ops = slot.ops.ok_or(KernelError::BadFileDescriptor { fd })?;
        (ops.close)()?;
        *slot = FileDescriptor::empty();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Generic descriptor-table fronts for the read/write/open/close syscalls
// ---------------------------------------------------------------------------

/// Dereference the current PCB or fail the syscall.
fn current_pcb_ptr() -> KernelResult<core::ptr::NonNull<super::Pcb>> {
    super::current_pcb().ok_or(KernelError::InvalidState {
        what: "syscall with no current process",
    })
}

/// `open(filename)`: resolve the name, claim the next free descriptor,
/// and wire the vtable matching the file's type.
pub fn generic_open(filename_user: u32) -> KernelResult<i32> {
    let pcb = current_pcb_ptr()?;
    // SAFETY: The PCB pointer targets the caller's arena; syscalls run on
    // the caller's kernel stack with exclusive access to it.
    unsafe {
        let p = pcb.as_ptr();
        let kern = super::translate_user_to_kernel(filename_user, (*p).pid)?;
        let name = super::parser::c_str_bytes(kern as usize as *const u8, crate::fs::image::NAME_LEN + 1);
        if name.is_empty() {
            return Err(KernelError::InvalidArgument);
        }

        let dentry = crate::fs::lookup(name)?;
        let filetype =
            FileType::from_raw(dentry.filetype).ok_or(KernelError::InvalidArgument)?;
        let ops: &'static FileOps = match filetype {
            FileType::Directory => &crate::fs::ops::FS_DIR_OPS,
            FileType::Regular => &crate::fs::ops::FS_FILE_OPS,
            FileType::Device => &crate::drivers::rtc::RTC_OPS,
            FileType::Unset => return Err(KernelError::InvalidArgument),
        };

        let fd = (*p).fds.allocate()?;
        let slot = (*p).fds.get_mut(fd)?;
        slot.ops = Some(ops);
        slot.context = FileContext {
            filetype,
            inode: dentry.inode,
            offset: 0,
        };
        slot.present = true;
        if let Err(e) = (ops.open)() {
            *slot = FileDescriptor::empty();
            return Err(e);
        }
        Ok(fd)
    }
}

/// `close(fd)`.
pub fn generic_close(fd: i32) -> KernelResult<()> {
    let pcb = current_pcb_ptr()?;
    // SAFETY: As in generic_open: the caller's arena, caller's stack.
    unsafe { (*pcb.as_ptr()).fds.close(fd) }
}

/// `read(fd, buf, nbytes)`: translate the buffer and defer to the vtable.
pub fn generic_read(fd: i32, buf_user: u32, nbytes: i32) -> KernelResult<usize> {
    if nbytes < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let pcb = current_pcb_ptr()?;
    // SAFETY: PCB access as above; the buffer slice covers exactly the
    // range the translation validated inside the caller's program page.
    unsafe {
        let p = pcb.as_ptr();
        let kern = super::translate_user_range(buf_user, nbytes as u32, (*p).pid)?;
        let buf = core::slice::from_raw_parts_mut(kern as usize as *mut u8, nbytes as usize);
        let slot = (*p).fds.get_mut(fd)?;
        if !slot.present {
            return Err(KernelError::BadFileDescriptor { fd });
        }
        let ops = slot.ops.ok_or(KernelError::BadFileDescriptor { fd })?;
        (ops.read)(&mut slot.context, buf)
    }
}

/// `write(fd, buf, nbytes)`: translate the buffer and defer to the vtable.
pub fn generic_write(fd: i32, buf_user: u32, nbytes: i32) -> KernelResult<usize> {
    if nbytes < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let pcb = current_pcb_ptr()?;
    // SAFETY: As in generic_read, with a shared slice.
    unsafe {
        let p = pcb.as_ptr();
        let kern = super::translate_user_range(buf_user, nbytes as u32, (*p).pid)?;
        let buf = core::slice::from_raw_parts(kern as usize as *const u8, nbytes as usize);
        let slot = (*p).fds.get_mut(fd)?;
        if !slot.present {
            return Err(KernelError::BadFileDescriptor { fd });
        }
        let ops = slot.ops.ok_or(KernelError::BadFileDescriptor { fd })?;
        (ops.write)(&mut slot.context, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_OPS: FileOps = FileOps {
        open: || Ok(()),
        close: || Ok(()),
        read: read_noop,
        write: write_noop,
    };

    fn occupy(table: &mut FdTable, fd: i32) {
        *table.get_mut(fd).unwrap() = FileDescriptor {
            ops: Some(&TEST_OPS),
            context: FileContext {
                filetype: FileType::Regular,
                inode: 1,
                offset: 0,
            },
            present: true,
        };
    }

    #[test]
    fn std_streams_are_reserved_and_present() {
        let table = FdTable::with_std_streams();
        assert!(table.slots[0].present);
        assert!(table.slots[1].present);
        for fd in FIRST_DYNAMIC_FD..MAX_FDS as i32 {
            assert!(!table.slots[fd as usize].present);
        }
    }

    #[test]
    fn allocation_is_lowest_free_first_and_exhausts() {
        let mut table = FdTable::with_std_streams();
        for expect in 2..8 {
            let fd = table.allocate().unwrap();
            assert_eq!(fd, expect);
            occupy(&mut table, fd);
        }
        assert!(table.allocate().is_err());
        table.close(4).unwrap();
        assert_eq!(table.allocate().unwrap(), 4);
    }

    #[test]
    fn closing_reserved_or_empty_slots_fails() {
        let mut table = FdTable::with_std_streams();
        assert!(table.close(STDIN_FD).is_err());
        assert!(table.close(STDOUT_FD).is_err());
        assert!(table.close(5).is_err());
        assert!(table.close(-1).is_err());
        assert!(table.close(MAX_FDS as i32).is_err());
        // The reserved streams survive the failed closes.
        assert!(table.slots[0].present);
        assert!(table.slots[1].present);
    }
}
