//! Round-robin scheduler over three task streams.
//!
//! Each stream starts as a freshly primed shell on its own terminal; a
//! stream's slot thereafter holds whichever PID currently runs in it (a
//! shell's descendants replace it in the slot while they live). Every
//! timer tick parks the interrupted PID's complete universal state in
//! its PCB, rotates the ring, and resumes the next slot.
//!
//! Resumption has two shapes, chosen by the parked frame's code
//! segment: a user-mode victim is rebuilt as a fresh privilege-dropping
//! IRET, while a kernel-mode victim was left a synthetic three-word
//! IRET image on its own kernel stack, so resuming it is a stack switch
//! plus register load. The save path records which shape applies; a
//! frame that is neither is a fatal invariant violation.

#[cfg(all(target_arch = "x86", target_os = "none"))]
use spin::Mutex;

#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::error::{KernelError, KernelResult};
#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::process::{ResumeMode, UniversalState};

/// Number of concurrently scheduled task streams (one per terminal).
pub const NUM_STREAMS: usize = 3;

/// The rotation ring: one slot per stream plus the cursor of the slot
/// whose task currently owns the CPU.
pub struct ScheduleRing {
    slots: [u32; NUM_STREAMS],
    cursor: usize,
    /// No state has been saved yet; the first tick discards the boot
    /// context instead of parking it.
    first_tick: bool,
}

impl ScheduleRing {
    pub const fn new() -> Self {
        ScheduleRing {
            // Seeded by init; the cursor starts on the last slot so the
            // first rotation lands on slot 0.
            slots: [0; NUM_STREAMS],
            cursor: NUM_STREAMS - 1,
            first_tick: true,
        }
    }

    pub fn seed(&mut self, pids: [u32; NUM_STREAMS]) {
        self.slots = pids;
        self.cursor = NUM_STREAMS - 1;
        self.first_tick = true;
    }

    /// Park `preempted` in the current slot and advance to the next.
    /// The first rotation parks nothing.
    pub fn rotate(&mut self, preempted: u32) -> u32 {
        if !self.first_tick {
            self.slots[self.cursor] = preempted;
        }
        self.first_tick = false;
        self.cursor = (self.cursor + 1) % NUM_STREAMS;
        self.slots[self.cursor]
    }

    /// The PID the next rotation will resume.
    pub fn peek_next(&self) -> u32 {
        self.slots[(self.cursor + 1) % NUM_STREAMS]
    }

    pub fn is_first_tick(&self) -> bool {
        self.first_tick
    }

    pub fn slots(&self) -> [u32; NUM_STREAMS] {
        self.slots
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
static RING: Mutex<ScheduleRing> = Mutex::new(ScheduleRing::new());

/// Build one root task: PCB, argument, program page, image, and a
/// universal state describing its first user-mode instant.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn prep_shell_task(pid: u32) -> KernelResult<()> {
    use crate::arch::x86::context::EFlags;
    use crate::arch::x86::gdt::{USER_CS, USER_DS};
    use crate::process::parser;

    const INIT_PROGRAM: &[u8] = b"shell";

    let pcb = crate::process::get_pcb(pid).ok_or(KernelError::InvalidArgument)?;

    let parsed = parser::parse_command(INIT_PROGRAM);
    let name_len = parsed.cmd_end - parsed.cmd_start;
    let exec_info = parser::determine_executability(&INIT_PROGRAM[parsed.cmd_start..][..name_len])?;

    crate::mm::paging::create_new_user_programpage(pid)?;
    crate::mm::paging::activate_existing_user_programpage(pid)?;
    crate::process::loader::load_executable_into_memory(&exec_info, pid)?;

    // SAFETY: Boot path; the PCB was just allocated and nothing runs yet.
    unsafe {
        let p = pcb.as_ptr();
        (*p).set_argument(&INIT_PROGRAM[parsed.args_start..parsed.args_end]);
        (*p).exec_info = Some(exec_info);

        let us = &mut (*p).universal_state;
        us.regs.clear_gp();
        us.regs.ds = USER_DS as u32;
        us.regs.es = USER_DS as u32;
        us.iret.eip = exec_info.entry_eip;
        us.iret.cs = USER_CS as u32;
        us.iret.eflags = (EFlags::INTERRUPT | EFlags::RESERVED_ONE).bits();
        us.iret.esp = crate::mm::initial_user_esp();
        us.iret.ss = USER_DS as u32;
        us.mode = ResumeMode::User;
        us.esp0 = crate::process::initial_esp0(pid);
        us.paging = crate::mm::paging::init_root_paging_state(pid);
    }
    Ok(())
}

/// Allocate and prime the root shells, one per stream/terminal.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() -> KernelResult<()> {
    let mut pids = [0u32; NUM_STREAMS];
    for slot in pids.iter_mut() {
        let pcb = crate::process::allocate(0)?;
        // SAFETY: Fresh PCB on the boot path.
        let pid = unsafe { (*pcb.as_ptr()).pid };
        prep_shell_task(pid)?;
        *slot = pid;
    }
    RING.lock().seed(pids);
    log::info!("scheduler seeded with root pids {pids:?}");
    Ok(())
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod switching {
    use super::*;
    use crate::arch::x86::context::{GpRegs, HwContext, IretFrame, KERNEL_IRET_BYTES};
    use crate::arch::x86::gdt::{self, KERNEL_CS, KERNEL_DS, USER_CS, USER_DS};

    /// Register file plus full privilege-dropping IRET image, consumed
    /// by `sched_exit_to_user`. Layout is ABI with the assembly below.
    #[repr(C)]
    struct UserResume {
        regs: GpRegs,
        iret: IretFrame,
    }

    /// Register file plus the stack pointer of an injected three-word
    /// IRET image, consumed by `sched_exit_to_kernel`.
    #[repr(C)]
    struct KernelResume {
        regs: GpRegs,
        esp: u32,
    }

    core::arch::global_asm!(
        r#"
// Resume a parked user-mode task: build its privilege-dropping IRET
// image on the current stack, load segments and registers from the
// UserResume at [esp + 4], and drop to ring 3.
.globl sched_exit_to_user
sched_exit_to_user:
    mov eax, [esp + 4]
    push dword ptr [eax + 52]      // ss
    push dword ptr [eax + 48]      // esp
    push dword ptr [eax + 44]      // eflags
    push dword ptr [eax + 40]      // cs
    push dword ptr [eax + 36]      // eip
    mov ds, word ptr [eax + 28]
    mov es, word ptr [eax + 32]
    mov ebx, [eax + 0]
    mov ecx, [eax + 4]
    mov edx, [eax + 8]
    mov esi, [eax + 12]
    mov edi, [eax + 16]
    mov ebp, [eax + 20]
    mov eax, [eax + 24]
    iretd

// Resume a parked kernel-mode task: switch to its kernel stack, where
// the save path injected eip/cs/eflags, load registers from the
// KernelResume at [esp + 4], and iret within ring 0.
.globl sched_exit_to_kernel
sched_exit_to_kernel:
    mov eax, [esp + 4]
    mov ds, word ptr [eax + 28]
    mov es, word ptr [eax + 32]
    mov ebx, [eax + 0]
    mov ecx, [eax + 4]
    mov edx, [eax + 8]
    mov esi, [eax + 12]
    mov edi, [eax + 16]
    mov ebp, [eax + 20]
    mov esp, [eax + 36]
    mov eax, [eax + 24]
    iretd
"#
    );

    extern "C" {
        fn sched_exit_to_user(resume: *const UserResume) -> !;
        fn sched_exit_to_kernel(resume: *const KernelResume) -> !;
    }

    /// Park the interrupted context's universal state in its PCB.
    fn save_universal_state(ctx: &HwContext) {
        let pid = crate::process::current_pid();
        let Some(pcb) = crate::process::get_pcb(pid) else {
            panic!("preempted stack belongs to no process (pid {pid})");
        };

        // SAFETY: The PCB belongs to the interrupted PID, whose kernel
        // stack we are standing on; nothing else touches it now.
        let us = unsafe { &mut (*pcb.as_ptr()).universal_state };

        us.regs = ctx.regs;
        us.esp0 = gdt::kernel_stack();
        us.paging = crate::mm::paging::current_universe_paging_state();
        us.iret.eip = ctx.iret.eip;
        us.iret.eflags = ctx.iret.eflags;

        match ctx.cs_selector() {
            USER_CS => {
                us.mode = ResumeMode::User;
                us.iret.cs = USER_CS as u32;
                us.iret.ss = USER_DS as u32;
                us.iret.esp = ctx.iret.esp;
            }
            KERNEL_CS => {
                us.mode = ResumeMode::Kernel;
                us.iret.cs = KERNEL_CS as u32;
                us.iret.ss = KERNEL_DS as u32;
                us.iret.esp = ctx.interrupted_esp();
                inject_kernel_iret(us);
            }
            other => panic!("malformed code segment {other:#06x} in scheduler save"),
        }
    }

    /// Write a three-word IRET image onto a parked kernel-mode task's
    /// own stack and point its saved ESP at it. ESP and EIP cannot be
    /// changed in one instruction; staging the image on the victim's
    /// stack lets the resume path do a pure stack switch + iret.
    fn inject_kernel_iret(us: &mut UniversalState) {
        let new_esp = us.iret.esp - KERNEL_IRET_BYTES;
        // SAFETY: new_esp lies on the victim's own kernel stack, just
        // below its live data; the victim stays parked until these
        // words are consumed by its resume.
        unsafe {
            let slot = new_esp as usize as *mut u32;
            slot.write(us.iret.eip);
            slot.add(1).write(us.iret.cs);
            slot.add(2).write(us.iret.eflags);
        }
        us.iret.esp = new_esp;
    }

    /// Resume `pid` according to its parked mode. Never returns.
    fn resume(pid: u32) -> ! {
        let Some(pcb) = crate::process::get_pcb(pid) else {
            panic!("scheduled pid {pid} has no PCB");
        };
        // SAFETY: The parked task cannot run until we jump into it; its
        // universal state is stable for the copy below.
        let us = unsafe { (*pcb.as_ptr()).universal_state };

        gdt::set_kernel_stack(us.esp0);
        crate::mm::paging::load_paging_state_to_universe(us.paging);

        match us.mode {
            ResumeMode::User => {
                let resume = UserResume {
                    regs: us.regs,
                    iret: us.iret,
                };
                // SAFETY: The resume block lives on this (abandoned)
                // stack until the final iretd; the assembly only reads it.
                unsafe { sched_exit_to_user(&resume) }
            }
            ResumeMode::Kernel => {
                let resume = KernelResume {
                    regs: us.regs,
                    esp: us.iret.esp,
                };
                // SAFETY: As above; the target stack holds the injected
                // IRET image written at save time.
                unsafe { sched_exit_to_kernel(&resume) }
            }
        }
    }

    /// Timer-tick entry: park the interrupted task, rotate, resume the
    /// next. Runs with interrupts masked (interrupt gate); the resumed
    /// task's EFLAGS image re-enables them.
    pub fn preempt(ctx: &mut HwContext) -> ! {
        let (next, first) = {
            let mut ring = RING.lock();
            let first = ring.is_first_tick();
            if !first {
                save_universal_state(ctx);
            }
            let preempted = if first { 0 } else { crate::process::current_pid() };
            (ring.rotate(preempted), first)
        };

        crate::drivers::pic::send_eoi(crate::drivers::pic::IRQ_PIT);

        // Follow the task to its terminal: stream slots are owned by
        // root PIDs 1..=3, mapping onto terminals 0..=2.
        let root = crate::process::canonical_pid(next);
        let _ = crate::terminal::set_active_terminal(root.saturating_sub(1) as usize);

        if first {
            log::info!("first tick: entering pid {next}");
        }
        resume(next)
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use switching::preempt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_rotation_parks_nothing_and_starts_at_slot_zero() {
        let mut ring = ScheduleRing::new();
        ring.seed([1, 2, 3]);
        assert!(ring.is_first_tick());
        assert_eq!(ring.peek_next(), 1);
        assert_eq!(ring.rotate(99), 1);
        // The garbage "preempted" PID of the first tick must not have
        // landed anywhere.
        assert_eq!(ring.slots(), [1, 2, 3]);
    }

    #[test]
    fn rotation_cycles_all_streams_fairly() {
        let mut ring = ScheduleRing::new();
        ring.seed([1, 2, 3]);
        let mut order = [0u32; 7];
        let mut current = ring.rotate(0);
        order[0] = current;
        for slot in order.iter_mut().skip(1) {
            current = ring.rotate(current);
            *slot = current;
        }
        assert_eq!(order, [1, 2, 3, 1, 2, 3, 1]);
        assert_eq!(ring.slots(), [1, 2, 3]);
    }

    #[test]
    fn a_slot_follows_the_task_running_in_it() {
        let mut ring = ScheduleRing::new();
        ring.seed([1, 2, 3]);
        assert_eq!(ring.rotate(0), 1);
        // PID 1 execs a child (PID 4); at the next tick the child is
        // what gets parked in slot 0.
        assert_eq!(ring.rotate(4), 2);
        assert_eq!(ring.slots(), [4, 2, 3]);
        // Full cycle returns to the child, not the shell.
        assert_eq!(ring.rotate(2), 3);
        assert_eq!(ring.rotate(3), 4);
        // The set of scheduled PIDs is conserved across the cycle.
        let mut slots = ring.slots();
        slots.sort_unstable();
        assert_eq!(slots, [2, 3, 4]);
    }
}
