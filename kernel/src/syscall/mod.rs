//! System-call dispatch (software interrupt 0x80).
//!
//! Call number in EAX, up to three arguments in EBX/ECX/EDX, result in
//! EAX. The prologue installs kernel paging; the epilogue restores user
//! paging; every failure folds to −1 at this boundary.
//!
//! `execute` and `halt` are the two calls that rewrite the outgoing
//! frame instead of returning a value through it: a successful `execute`
//! leaves the frame describing the child's first user instruction, and a
//! successful `halt` leaves it describing the parent resuming with the
//! child's status already in EAX. The dispatcher therefore only writes
//! EAX for them on failure.

pub mod execute;
pub mod halt;

use crate::arch::x86::context::HwContext;
use crate::error::{KernelError, KernelResult};
use crate::mm::paging::{self, ActiveDir};
use crate::mm::USER_VIDMAP_VIRT;
use crate::process::{self, fd};

pub const SYS_HALT: u32 = 1;
pub const SYS_EXECUTE: u32 = 2;
pub const SYS_READ: u32 = 3;
pub const SYS_WRITE: u32 = 4;
pub const SYS_OPEN: u32 = 5;
pub const SYS_CLOSE: u32 = 6;
pub const SYS_GETARGS: u32 = 7;
pub const SYS_VIDMAP: u32 = 8;
pub const SYS_SET_HANDLER: u32 = 9;
pub const SYS_SIGRETURN: u32 = 10;

fn fold<T: TryInto<i32>>(r: KernelResult<T>) -> i32 {
    match r {
        Ok(v) => v.try_into().unwrap_or(-1),
        Err(_) => -1,
    }
}

/// Dispatch one system call against the caller's frame.
pub fn dispatch(ctx: &mut HwContext) {
    paging::set_active_directory(ActiveDir::Kernel);

    let number = ctx.regs.eax;
    let (arg1, arg2, arg3) = (ctx.regs.ebx, ctx.regs.ecx, ctx.regs.edx);

    match number {
        SYS_HALT => {
            let status = arg1 & 0xFF;
            if halt::halt_current(ctx, status).is_err() {
                ctx.regs.eax = -1i32 as u32;
            }
        }
        SYS_EXECUTE => {
            if execute::execute_command(ctx).is_err() {
                ctx.regs.eax = -1i32 as u32;
            }
        }
        SYS_READ => ctx.regs.eax = fold(fd::generic_read(arg1 as i32, arg2, arg3 as i32)) as u32,
        SYS_WRITE => ctx.regs.eax = fold(fd::generic_write(arg1 as i32, arg2, arg3 as i32)) as u32,
        SYS_OPEN => ctx.regs.eax = fold(fd::generic_open(arg1)) as u32,
        SYS_CLOSE => ctx.regs.eax = fold(fd::generic_close(arg1 as i32).map(|()| 0)) as u32,
        SYS_GETARGS => ctx.regs.eax = fold(sys_getargs(arg1, arg2 as i32).map(|()| 0)) as u32,
        SYS_VIDMAP => ctx.regs.eax = fold(sys_vidmap(arg1).map(|()| 0)) as u32,
        // Signal support is intentionally absent.
        SYS_SET_HANDLER | SYS_SIGRETURN => ctx.regs.eax = -1i32 as u32,
        _ => ctx.regs.eax = -1i32 as u32,
    }

    paging::set_active_directory(ActiveDir::User);
}

/// `getargs(buf, nbytes)`: copy the stored argument string, NUL padded.
/// Fails when no argument was given or the buffer cannot hold it.
fn sys_getargs(buf_user: u32, nbytes: i32) -> KernelResult<()> {
    if nbytes < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let pcb = process::current_pcb().ok_or(KernelError::InvalidState {
        what: "getargs with no current process",
    })?;
    // SAFETY: The PCB pointer targets the caller's arena; the output
    // slice covers exactly the translated, length-checked user range.
    unsafe {
        let p = pcb.as_ptr();
        let kern = process::translate_user_range(buf_user, nbytes as u32, (*p).pid)?;
        let arg = (*p).argument();
        if arg.is_empty() || arg.len() > nbytes as usize {
            return Err(KernelError::InvalidArgument);
        }
        let out = core::slice::from_raw_parts_mut(kern as usize as *mut u8, nbytes as usize);
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = arg.get(i).copied().unwrap_or(0);
        }
    }
    Ok(())
}

/// `vidmap(screen_start)`: hand the caller the fixed user virtual
/// address of the video window and make the window present.
fn sys_vidmap(target_user: u32) -> KernelResult<()> {
    let pcb = process::current_pcb().ok_or(KernelError::InvalidState {
        what: "vidmap with no current process",
    })?;
    // SAFETY: PCB access as above; the write lands on the 4-byte user
    // slot the translation validated.
    unsafe {
        let p = pcb.as_ptr();
        let kern = process::translate_user_range(target_user, 4, (*p).pid)?;
        (*p).vidmap_active = true;
        (kern as usize as *mut u32).write(USER_VIDMAP_VIRT);
    }
    paging::activate_user_vidmem();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folding_maps_errors_to_minus_one() {
        assert_eq!(fold::<i32>(Ok(5)), 5);
        assert_eq!(fold::<i32>(Err(KernelError::InvalidArgument)), -1);
        assert_eq!(fold::<usize>(Ok(123usize)), 123);
    }
}
