//! Common dispatch for every installed vector.
//!
//! The trampolines funnel all traffic here with a uniform frame. Policy
//! per class:
//!
//! - **Exceptions** from user mode tear the faulting process down and
//!   resume its parent with the death-by-exception status (root tasks
//!   respawn instead). Exceptions from kernel mode are invariant
//!   violations: dump and stop.
//! - **Hardware interrupts** run their driver body under the kernel
//!   directory, acknowledge their line, and restore the interrupted
//!   directory. The timer never returns here: it diverges into the
//!   scheduler.
//! - **The syscall gate** hands the frame to the syscall dispatcher.

#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::arch::x86::context::HwContext;
#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::arch::x86::idt;
#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::mm::paging::{self, ActiveDir};
#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::syscall::halt::DEATH_BY_EXCEPTION;

/// Intel mnemonics for the exception vectors this kernel installs.
pub fn exception_name(vector: u8) -> &'static str {
    match vector {
        0 => "Division Error",
        1 => "Reserved (1)",
        2 => "NMI Interrupt",
        3 => "Breakpoint",
        4 => "Overflow",
        5 => "BOUND Range Exceeded",
        6 => "Invalid Opcode",
        7 => "Device Not Available",
        8 => "Double Fault",
        9 => "Coprocessor Segment Overrun",
        10 => "Invalid TSS",
        11 => "Segment Not Present",
        12 => "Stack-Segment Fault",
        13 => "General Protection",
        14 => "Page Fault",
        15 => "Reserved (15)",
        16 => "x87 Floating-Point Error",
        17 => "Alignment Check",
        18 => "Machine Check",
        19 => "SIMD Floating-Point Exception",
        _ => "Unknown Vector",
    }
}

/// Dump a frame to the display and the serial log.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn dump_context(ctx: &HwContext) {
    crate::println!("eax      = {:#010x}", ctx.regs.eax);
    crate::println!("ebx      = {:#010x}", ctx.regs.ebx);
    crate::println!("ecx      = {:#010x}", ctx.regs.ecx);
    crate::println!("edx      = {:#010x}", ctx.regs.edx);
    crate::println!("esi      = {:#010x}", ctx.regs.esi);
    crate::println!("edi      = {:#010x}", ctx.regs.edi);
    crate::println!("ebp      = {:#010x}", ctx.regs.ebp);
    crate::println!("ds       = {:#06x}", ctx.regs.ds as u16);
    crate::println!("es       = {:#06x}", ctx.regs.es as u16);
    crate::println!("vector   = {:#04x}", ctx.vector);
    crate::println!("errcode  = {:#010x}", ctx.error_code);
    crate::println!("iret-eip = {:#010x}", ctx.iret.eip);
    crate::println!("iret-cs  = {:#06x}", ctx.cs_selector());
    crate::println!("iret-efl = {:#010x}", ctx.iret.eflags);
    crate::println!("iret-esp = {:#010x}", ctx.iret.esp);
    crate::println!("iret-ss  = {:#06x}", ctx.iret.ss as u16);
    log::error!(
        "fatal frame: vector {:#04x} err {:#010x} eip {:#010x} cs {:#06x}",
        ctx.vector,
        ctx.error_code,
        ctx.iret.eip,
        ctx.cs_selector()
    );
}

/// Unrecoverable: report everything we know and park the machine.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn fatal(message: &str, ctx: &HwContext) -> ! {
    crate::println!("{message}");
    dump_context(ctx);
    crate::println!("{}!", exception_name(ctx.vector as u8));

    if ctx.vector as u8 == idt::VEC_PAGE_FAULT {
        let fault_addr = crate::arch::x86::read_cr2();
        crate::println!("violating address: {fault_addr:#010x}");
        let cr3 = crate::arch::x86::read_cr3() & 0xFFFF_F000;
        if cr3 == paging::user_dir_phys() {
            crate::println!("active directory: user");
        } else if cr3 == paging::kernel_dir_phys() {
            crate::println!("active directory: kernel");
        }
        crate::println!(
            "software walk says the address is {}",
            if paging::is_unsafe_page_walk(fault_addr) {
                "unmapped"
            } else {
                "mapped"
            }
        );
    }

    crate::arch::x86::halt_forever();
}

/// Exception policy, as described in the module header.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn handle_exception(ctx: &mut HwContext) {
    paging::set_active_directory(ActiveDir::Kernel);

    if ctx.from_kernel() {
        fatal("exception raised from kernel mode", ctx);
    }

    let pid = crate::process::current_pid();
    if pid == 0 {
        fatal("exception attributed to the kernel task", ctx);
    }

    log::warn!(
        "pid {pid} killed by {} at eip {:#010x}",
        exception_name(ctx.vector as u8),
        ctx.iret.eip
    );

    let Some(pcb) = crate::process::get_pcb(pid) else {
        fatal("faulting process has no PCB", ctx);
    };
    // SAFETY: The faulting process's own arena, on its own kernel stack.
    let parent = unsafe { (*pcb.as_ptr()).parent_pid };

    if parent == 0 {
        // A root shell died: reset it in place.
        if crate::syscall::halt::respawn_root(ctx, pid).is_err() {
            fatal("root task cannot be respawned", ctx);
        }
        return;
    }

    // Tear down and surface the sentinel through the parent's execute.
    if crate::syscall::halt::halt_current(ctx, DEATH_BY_EXCEPTION).is_err() {
        fatal("teardown of faulting process failed", ctx);
    }
}

/// IRQ bodies run under the kernel directory; whatever directory the
/// interrupted context was using is restored before IRET.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn handle_irq(vector: u8) {
    let interrupted_dir = paging::active_directory();
    paging::set_active_directory(ActiveDir::Kernel);
    match vector {
        idt::VEC_KEYBOARD => {
            crate::arch::interrupts::without_interrupts(|| {
                crate::drivers::keyboard::interrupt_handler();
            });
            crate::drivers::pic::send_eoi(crate::drivers::pic::IRQ_KEYBOARD);
        }
        idt::VEC_RTC => {
            crate::drivers::rtc::interrupt_handler();
            crate::drivers::pic::send_eoi(crate::drivers::pic::IRQ_RTC);
        }
        _ => {}
    }
    paging::set_active_directory(interrupted_dir);
}

/// The single entry point the trampolines call.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[no_mangle]
pub extern "C" fn dispatch_vector(ctx: *mut HwContext) {
    // SAFETY: The trampoline passes the address of the frame it just
    // pushed on this very stack; it lives until the matching pop path.
    let ctx = unsafe { &mut *ctx };

    let vector = ctx.vector as u8;
    match vector {
        0..=idt::VEC_EXCEPTION_END => handle_exception(ctx),
        idt::VEC_PIT => crate::sched::preempt(ctx),
        idt::VEC_KEYBOARD | idt::VEC_RTC => handle_irq(vector),
        idt::VEC_SYSCALL => crate::syscall::dispatch(ctx),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_names_cover_the_installed_vectors() {
        assert_eq!(exception_name(0), "Division Error");
        assert_eq!(exception_name(14), "Page Fault");
        assert_eq!(exception_name(19), "SIMD Floating-Point Exception");
        assert_eq!(exception_name(42), "Unknown Vector");
    }
}
