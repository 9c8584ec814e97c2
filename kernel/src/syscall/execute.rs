//! The `execute` system call.
//!
//! Spawning a child walks a fixed ladder: parse, vet, allocate a PCB,
//! build and activate paging, load the image, capture the caller's
//! context, synthesize the child's first user frame, move TSS.esp0. Any
//! failed rung unwinds exactly the rungs already climbed, in reverse, so
//! a failed `execute` leaves the machine bit-identical to before the
//! call. [`Rollback`] is that ladder's record.

use crate::arch::x86::context::{EFlags, HwContext};
use crate::arch::x86::gdt::{self, USER_CS, USER_DS};
use crate::error::{KernelError, KernelResult};
use crate::mm::paging;
use crate::process::{self, initial_esp0, loader, parser, translate_user_to_kernel, ARG_MAX};

/// Which rungs of the ladder have been climbed, for reverse unwinding.
#[derive(Default)]
struct Rollback {
    caller_pid: u32,
    allocated_pid: Option<u32>,
    configured_paging: bool,
    updated_esp0: bool,
}

/// `execute(command)`: run a new program as a child of the caller.
/// On success the outgoing frame enters the child; the caller's saved
/// context is resumed later by the child's `halt`.
pub fn execute_command(ctx: &mut HwContext) -> KernelResult<()> {
    let mut rollback = Rollback::default();
    match execute_inner(ctx, &mut rollback) {
        Ok(()) => Ok(()),
        Err(e) => {
            log::warn!("execute failed: {e}");
            unwind(&rollback);
            Err(e)
        }
    }
}

fn execute_inner(ctx: &mut HwContext, rollback: &mut Rollback) -> KernelResult<()> {
    let caller_pid = process::current_pid();
    rollback.caller_pid = caller_pid;
    let caller_pcb = process::get_pcb(caller_pid).ok_or(KernelError::InvalidState {
        what: "execute with no current process",
    })?;

    // Parse the command string out of the caller's program page.
    let cmd_kern = translate_user_to_kernel(ctx.regs.ebx, caller_pid)?;
    // SAFETY: The start address was translated; the scan is bounded by
    // the keyboard line length, which stays inside the 4 MiB window.
    let input =
        unsafe { parser::c_str_bytes(cmd_kern as usize as *const u8, ARG_MAX) };
    let parsed = parser::parse_command(input);
    if parsed.is_empty() {
        return Err(KernelError::InvalidArgument);
    }

    let mut name_buf = [0u8; ARG_MAX + 1];
    if parser::extract_command(input, parsed, &mut name_buf) != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let name_len = parsed.cmd_end - parsed.cmd_start;
    let exec_info = parser::determine_executability(&name_buf[..name_len])?;

    // Claim the child PCB and stash its argument string.
    let child = process::allocate(caller_pid)?;
    // SAFETY: A freshly allocated PCB is exclusively ours until the
    // child first runs, which cannot happen before this call returns.
    let child_pid = unsafe {
        let c = child.as_ptr();
        let mut arg_buf = [0u8; ARG_MAX + 1];
        if parser::extract_args(input, parsed, &mut arg_buf) != 0 {
            // Undone by the caller via the rollback record.
            rollback.allocated_pid = Some((*c).pid);
            return Err(KernelError::InvalidArgument);
        }
        (*c).set_argument(&arg_buf[..parsed.args_end - parsed.args_start]);
        (*c).exec_info = Some(exec_info);
        rollback.allocated_pid = Some((*c).pid);
        (*c).pid
    };

    // Map and fill the program page.
    paging::create_new_user_programpage(child_pid)?;
    rollback.configured_paging = true;
    paging::activate_existing_user_programpage(child_pid)?;
    loader::load_executable_into_memory(&exec_info, child_pid)?;

    // Capture the caller for halt/exception unwinding, then turn the
    // outgoing frame into the child's first user-mode instant. Nothing
    // fallible may follow the frame rewrite.
    // SAFETY: The caller PCB is the running process's own arena.
    unsafe {
        (*caller_pcb.as_ptr()).pre_exec_context = *ctx;
    }

    ctx.regs.clear_gp();
    ctx.regs.ds = USER_DS as u32;
    ctx.regs.es = USER_DS as u32;
    ctx.iret.eip = exec_info.entry_eip;
    ctx.iret.cs = USER_CS as u32;
    ctx.iret.eflags |= EFlags::INTERRUPT.bits();
    ctx.iret.esp = crate::mm::initial_user_esp();
    ctx.iret.ss = USER_DS as u32;

    gdt::set_kernel_stack(initial_esp0(child_pid));
    rollback.updated_esp0 = true;

    Ok(())
}

/// Undo climbed rungs in reverse order.
fn unwind(rollback: &Rollback) {
    if rollback.updated_esp0 {
        gdt::set_kernel_stack(initial_esp0(rollback.caller_pid));
    }
    if rollback.configured_paging {
        if let Some(pid) = rollback.allocated_pid {
            let _ = paging::destroy_user_programpage(pid);
        }
        // The user directory may have been repointed at the dead child's
        // window; aim it back at the caller's page.
        let _ = paging::activate_existing_user_programpage(rollback.caller_pid);
    }
    if let Some(pid) = rollback.allocated_pid {
        let _ = process::free(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwinding_an_empty_record_is_a_no_op() {
        let r = Rollback::default();
        assert!(r.allocated_pid.is_none());
        assert!(!r.configured_paging);
        assert!(!r.updated_esp0);
        unwind(&r);
    }
}
