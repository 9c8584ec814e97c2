//! The `halt` system call and process teardown.
//!
//! A dying process never returns to its caller; the outgoing frame is
//! rewritten to resume its *parent* exactly where that parent's
//! `execute` trapped in, with the child's status in EAX. Root tasks
//! (children of PID 0) are never torn down: their program page stays,
//! and the task is reset in place to its cached entry point, so every
//! terminal always has a shell.

use crate::arch::interrupts;
use crate::arch::x86::context::HwContext;
use crate::arch::x86::gdt::{self, USER_CS, USER_DS};
use crate::error::{KernelError, KernelResult};
use crate::mm::paging::{self, ActiveDir};
use crate::process::{self, initial_esp0};

/// Status a parent's `execute` reports when its child died from an
/// exception rather than by calling `halt`. Deliberately one past the
/// 8-bit range ordinary statuses are truncated to.
pub const DEATH_BY_EXCEPTION: u32 = 256;

/// End the current process with `status`, resuming its parent (or
/// respawning in place when the parent is the kernel).
pub fn halt_current(ctx: &mut HwContext, status: u32) -> KernelResult<()> {
    let this_pid = process::current_pid();
    let this_pcb = process::get_pcb(this_pid).ok_or(KernelError::InvalidState {
        what: "halt with no current process",
    })?;
    // SAFETY: The dying process's own arena, on its own kernel stack.
    let parent_pid = unsafe { (*this_pcb.as_ptr()).parent_pid };

    if parent_pid == 0 {
        return respawn_root(ctx, this_pid);
    }

    let parent_pcb = process::get_pcb(parent_pid).ok_or(KernelError::InvalidState {
        what: "halt with no parent to resume",
    })?;

    // Resume the parent where execute left it, status in hand.
    // SAFETY: The parent is parked (it cannot run while its child owns
    // the schedule slot), so its saved context is stable.
    let (parent_context, parent_vidmap) = unsafe {
        let p = parent_pcb.as_ptr();
        ((*p).pre_exec_context, (*p).vidmap_active)
    };
    *ctx = parent_context;
    ctx.regs.eax = status;

    // Every transition from a process to its own kernel stack starts
    // from an empty stack, so the parent's stack top is its initial one.
    gdt::set_kernel_stack(initial_esp0(parent_pid));

    if parent_vidmap {
        paging::activate_user_vidmem();
    } else {
        paging::deactivate_user_vidmem();
    }

    process::free(this_pid)?;
    paging::destroy_user_programpage(this_pid)?;
    paging::activate_existing_user_programpage(parent_pid)?;
    paging::set_active_directory(ActiveDir::User);

    Ok(())
}

/// Reset a root task in place: same PID, same program page, fresh
/// registers and stacks, entry point from the cached image info.
pub fn respawn_root(ctx: &mut HwContext, pid: u32) -> KernelResult<()> {
    interrupts::without_interrupts(|| {
        crate::println!("Pid {} terminated.", pid);
        process::close_pid_fds(pid);
    });

    let pcb = process::get_pcb(pid).ok_or(KernelError::InvalidArgument)?;
    // SAFETY: The respawning process's own arena.
    let exec_info = unsafe { (*pcb.as_ptr()).exec_info }.ok_or(KernelError::InvalidState {
        what: "respawning a root with no cached image info",
    })?;

    ctx.regs.clear_gp();
    ctx.regs.ds = USER_DS as u32;
    ctx.regs.es = USER_DS as u32;
    ctx.iret.eip = exec_info.entry_eip;
    ctx.iret.cs = USER_CS as u32;
    // EFLAGS inherited unmodified: IF comes back with the IRET.
    ctx.iret.esp = crate::mm::initial_user_esp();
    ctx.iret.ss = USER_DS as u32;

    paging::set_active_directory(ActiveDir::User);

    // Hold interrupts off for the remaining ride to IRET so the
    // scheduler cannot observe the half-reset frame.
    interrupts::disable();
    Ok(())
}
