//! Process table, PCBs, and kernel-stack arenas.
//!
//! Every process owns an 8 KiB arena carved downward from the 8 MiB
//! boundary: the PCB sits at the arena's base and the kernel stack grows
//! down into the rest. Nothing is allocated; the arena address is pure
//! arithmetic on the PID, and the owning PID of any kernel stack falls
//! out of masking ESP. That derivation is the one true "who am I"
//! answer; it deliberately depends on no mutable global.
//!
//! PID 0 is the kernel itself. Its PCB (the root PCB) is a static, it is
//! always present, and it has no parent.

pub mod fd;
pub mod loader;
pub mod parser;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::arch::interrupts::without_interrupts;
use crate::arch::x86::context::{GpRegs, HwContext, IretFrame};
use crate::error::{KernelError, KernelResult};
use crate::mm::paging::{ActiveDir, PagingState};
use crate::mm::{PROGRAM_PAGE_SIZE, USER_PAGE_PHYS_BASE, USER_PAGE_VIRT_BASE};

use fd::FdTable;

/// Number of user PCB slots. PID 0 (the kernel) is extra.
pub const MAX_PROCESSES: usize = 6;

/// Size of one kernel-stack arena.
pub const KERNEL_STACK_ARENA: u32 = 8 * 1024;

/// Longest command-line argument string a PCB stores, excluding the NUL.
pub const ARG_MAX: usize = 128;

/// Whether a parked task will resume into ring 3 or ring 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    User,
    Kernel,
}

/// The complete machine view a scheduled task perceives: registers, the
/// IRET image, the paging view, and its kernel stack top. Restoring this
/// is all it takes to resume the task.
#[derive(Debug, Clone, Copy)]
pub struct UniversalState {
    pub regs: GpRegs,
    pub iret: IretFrame,
    pub mode: ResumeMode,
    pub paging: PagingState,
    pub esp0: u32,
}

impl UniversalState {
    pub const fn blank() -> Self {
        UniversalState {
            regs: GpRegs {
                ebx: 0,
                ecx: 0,
                edx: 0,
                esi: 0,
                edi: 0,
                ebp: 0,
                eax: 0,
                ds: 0,
                es: 0,
            },
            iret: IretFrame {
                eip: 0,
                cs: 0,
                eflags: 0,
                esp: 0,
                ss: 0,
            },
            mode: ResumeMode::User,
            paging: PagingState {
                user_vidmem_active: false,
                current_mapped_pid: 0,
                active_dir: ActiveDir::Kernel,
            },
            esp0: 0,
        }
    }
}

/// What the loader learned about a program image; cached in the PCB so a
/// root task can be respawned without re-walking the filesystem.
#[derive(Debug, Clone, Copy)]
pub struct ExecInfo {
    pub inode: u32,
    pub file_len: u32,
    pub entry_eip: u32,
}

/// Process control block.
#[repr(C)]
pub struct Pcb {
    pub pid: u32,
    pub parent_pid: u32,
    pub present: bool,
    pub fds: FdTable,
    pub arg: [u8; ARG_MAX + 1],
    pub arg_len: usize,
    /// The caller's full hardware context captured at the top of
    /// `execute`; `halt` and the exception teardown restore it to unwind
    /// the child back into this (parent) context.
    pub pre_exec_context: HwContext,
    pub universal_state: UniversalState,
    pub vidmap_active: bool,
    pub exec_info: Option<ExecInfo>,
}

impl Pcb {
    pub const fn unused(pid: u32) -> Self {
        Pcb {
            pid,
            parent_pid: 0,
            present: false,
            fds: FdTable::empty(),
            arg: [0; ARG_MAX + 1],
            arg_len: 0,
            pre_exec_context: HwContext {
                regs: GpRegs {
                    ebx: 0,
                    ecx: 0,
                    edx: 0,
                    esi: 0,
                    edi: 0,
                    ebp: 0,
                    eax: 0,
                    ds: 0,
                    es: 0,
                },
                vector: 0,
                error_code: 0,
                iret: IretFrame {
                    eip: 0,
                    cs: 0,
                    eflags: 0,
                    esp: 0,
                    ss: 0,
                },
            },
            universal_state: UniversalState::blank(),
            vidmap_active: false,
            exec_info: None,
        }
    }

    /// Record the parsed argument string.
    pub fn set_argument(&mut self, args: &[u8]) {
        let n = args.len().min(ARG_MAX);
        self.arg[..n].copy_from_slice(&args[..n]);
        self.arg[n] = 0;
        self.arg_len = n;
    }

    pub fn argument(&self) -> &[u8] {
        &self.arg[..self.arg_len]
    }
}

// The kernel's own PCB. User PCBs live at computed arena addresses; the
// root one is ordinary static storage.
static mut ROOT_PCB: Pcb = Pcb::unused(0);

static PROCESS_COUNT: AtomicI32 = AtomicI32::new(0);

/// Base address of `pid`'s arena (where its PCB lives).
pub fn pcb_address(pid: u32) -> u32 {
    USER_PAGE_PHYS_BASE - (pid + 1) * KERNEL_STACK_ARENA
}

/// First kernel stack slot of `pid`: the highest dword of its arena.
pub fn initial_esp0(pid: u32) -> u32 {
    USER_PAGE_PHYS_BASE - pid * KERNEL_STACK_ARENA - 4
}

/// Derive the PID owning the kernel stack that contains `esp_like`.
pub fn pid_from_stack_address(esp_like: u32) -> u32 {
    const ARENA_SHIFT: u32 = 13; // 8 KiB
    let top = (crate::mm::KERNEL_BASE + PROGRAM_PAGE_SIZE - 1) >> ARENA_SHIFT;
    top - (esp_like >> ARENA_SHIFT)
}

/// The PID whose kernel stack execution currently sits on.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn current_pid() -> u32 {
    pid_from_stack_address(crate::arch::x86::read_esp())
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn current_pid() -> u32 {
    0
}

/// Map a user virtual address into `pid`'s physical window. Anything
/// outside the program page is invalid by definition.
pub fn translate_user_to_kernel(user_addr: u32, pid: u32) -> KernelResult<u32> {
    if (USER_PAGE_VIRT_BASE..USER_PAGE_VIRT_BASE + PROGRAM_PAGE_SIZE).contains(&user_addr) {
        Ok(user_addr - USER_PAGE_VIRT_BASE + crate::mm::program_page_phys_base(pid))
    } else {
        Err(KernelError::BadUserPointer { addr: user_addr })
    }
}

/// Map a physical address inside `pid`'s window back to user virtual.
pub fn translate_kernel_to_user(kern_addr: u32, pid: u32) -> KernelResult<u32> {
    let base = crate::mm::program_page_phys_base(pid);
    if (base..base + PROGRAM_PAGE_SIZE).contains(&kern_addr) {
        Ok(kern_addr - base + USER_PAGE_VIRT_BASE)
    } else {
        Err(KernelError::BadUserPointer { addr: kern_addr })
    }
}

/// Translate a user buffer, requiring the whole `len` bytes to fit
/// inside the program page.
pub fn translate_user_range(user_addr: u32, len: u32, pid: u32) -> KernelResult<u32> {
    let start = translate_user_to_kernel(user_addr, pid)?;
    if len > 0 {
        // The last byte must land in the same window.
        let end = user_addr
            .checked_add(len - 1)
            .ok_or(KernelError::BadUserPointer { addr: user_addr })?;
        translate_user_to_kernel(end, pid)?;
    }
    Ok(start)
}

/// Pointer to `pid`'s PCB: the static root PCB for PID 0, the arena base
/// otherwise.
pub fn get_pcb(pid: u32) -> Option<NonNull<Pcb>> {
    if pid == 0 {
        NonNull::new(&raw mut ROOT_PCB)
    } else if pid as usize <= MAX_PROCESSES {
        NonNull::new(pcb_address(pid) as usize as *mut Pcb)
    } else {
        None
    }
}

/// PCB of the currently running process.
pub fn current_pcb() -> Option<NonNull<Pcb>> {
    get_pcb(current_pid())
}

/// Initialize the table: every user PCB marked absent, the root PCB
/// present with no parent.
pub fn init() {
    PROCESS_COUNT.store(0, Ordering::Relaxed);
    for pid in 1..=MAX_PROCESSES as u32 {
        let pcb = get_pcb(pid).expect("arena PID in range");
        // SAFETY: The arena memory is covered by the kernel 4 MiB page
        // and dedicated to this PCB; boot path, nothing concurrent.
        unsafe { pcb.as_ptr().write(Pcb::unused(pid)) };
    }
    let root = get_pcb(0).expect("root PCB is static");
    // SAFETY: Writing the static root PCB on the single-threaded boot path.
    unsafe {
        let root = root.as_ptr();
        (*root).pid = 0;
        (*root).parent_pid = 0;
        (*root).present = true;
    }
}

/// Claim the lowest free PCB slot for a child of `parent`.
pub fn allocate(parent: u32) -> KernelResult<NonNull<Pcb>> {
    without_interrupts(|| {
        for pid in 1..=MAX_PROCESSES as u32 {
            let pcb = get_pcb(pid).expect("arena PID in range");
            // SAFETY: Interrupts are masked, so no other context can race
            // this presence check on a single CPU.
            unsafe {
                let p = pcb.as_ptr();
                if (*p).present {
                    continue;
                }
                (*p).pid = pid;
                (*p).parent_pid = parent;
                (*p).present = true;
                (*p).vidmap_active = false;
                (*p).arg_len = 0;
                (*p).fds = FdTable::with_std_streams();
                PROCESS_COUNT.fetch_add(1, Ordering::Relaxed);
                return Ok(pcb);
            }
        }
        Err(KernelError::ResourceExhausted {
            resource: "process slots",
        })
    })
}

/// Release `pid`, closing its descriptors. Returns the parent PID.
/// PID 0 is never freed.
pub fn free(pid: u32) -> KernelResult<u32> {
    if pid == 0 || pid as usize > MAX_PROCESSES {
        return Err(KernelError::InvalidArgument);
    }
    let pcb = get_pcb(pid).ok_or(KernelError::InvalidArgument)?;
    without_interrupts(|| {
        // SAFETY: Interrupts masked; single CPU; the pointer targets this
        // PID's dedicated arena.
        unsafe {
            let p = pcb.as_ptr();
            if !(*p).present {
                return Err(KernelError::InvalidState {
                    what: "freeing an absent process",
                });
            }
            let parent = (*p).parent_pid;
            close_pid_fds(pid);
            (*p).present = false;
            (*p).vidmap_active = false;
            PROCESS_COUNT.fetch_sub(1, Ordering::Relaxed);
            Ok(parent)
        }
    })
}

/// Number of live user processes.
pub fn live_count() -> i32 {
    PROCESS_COUNT.load(Ordering::Relaxed)
}

/// Walk parent links to the owning root: the ancestor whose parent is
/// PID 0. Root PIDs map 1:1 onto terminals and virtual RTC streams.
pub fn canonical_pid(pid: u32) -> u32 {
    let mut current = pid;
    loop {
        let Some(pcb) = get_pcb(current) else {
            return current;
        };
        // SAFETY: Read of the parent link in this PID's arena; parent
        // links are only rewritten under masked interrupts.
        let parent = unsafe { (*pcb.as_ptr()).parent_pid };
        if parent == 0 {
            return current;
        }
        current = parent;
    }
}

/// Close every non-reserved descriptor of `pid` (FDs 2 and up).
pub fn close_pid_fds(pid: u32) {
    let Some(pcb) = get_pcb(pid) else { return };
    // SAFETY: The FD table lives in this PID's arena; callers hold a
    // critical section or own the PID exclusively.
    unsafe {
        let fds = &mut (*pcb.as_ptr()).fds;
        for fd in fd::FIRST_DYNAMIC_FD..fd::MAX_FDS as i32 {
            let _ = fds.close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arenas_tile_down_from_eight_megabytes() {
        assert_eq!(pcb_address(0), 0x0080_0000 - 0x2000);
        assert_eq!(pcb_address(1), 0x0080_0000 - 2 * 0x2000);
        assert_eq!(initial_esp0(1), 0x0080_0000 - 0x2000 - 4);
        assert_eq!(initial_esp0(2), 0x0080_0000 - 2 * 0x2000 - 4);
    }

    #[test]
    fn stack_addresses_resolve_to_their_owner() {
        for pid in 0..=MAX_PROCESSES as u32 {
            let top = initial_esp0(pid);
            let bottom = pcb_address(pid);
            assert_eq!(pid_from_stack_address(top), pid, "top of pid {pid}");
            assert_eq!(pid_from_stack_address(bottom), pid, "bottom of pid {pid}");
            assert_eq!(
                pid_from_stack_address(bottom + KERNEL_STACK_ARENA / 2),
                pid,
                "middle of pid {pid}"
            );
        }
    }

    #[test]
    fn user_translation_round_trips_inside_the_window() {
        let pid = 3;
        for user in [
            USER_PAGE_VIRT_BASE,
            crate::mm::PROGRAM_LOAD_VIRT,
            USER_PAGE_VIRT_BASE + PROGRAM_PAGE_SIZE - 1,
        ] {
            let kern = translate_user_to_kernel(user, pid).unwrap();
            assert_eq!(translate_kernel_to_user(kern, pid).unwrap(), user);
        }
    }

    #[test]
    fn translation_rejects_foreign_addresses() {
        assert!(translate_user_to_kernel(0, 1).is_err());
        assert!(translate_user_to_kernel(USER_PAGE_VIRT_BASE - 1, 1).is_err());
        assert!(translate_user_to_kernel(USER_PAGE_VIRT_BASE + PROGRAM_PAGE_SIZE, 1).is_err());
        // Kernel-side: an address in PID 2's window is not in PID 1's.
        let in_pid2 = crate::mm::program_page_phys_base(2) + 16;
        assert!(translate_kernel_to_user(in_pid2, 1).is_err());
        assert!(translate_kernel_to_user(in_pid2, 2).is_ok());
    }

    #[test]
    fn range_translation_checks_the_far_end() {
        let near_end = USER_PAGE_VIRT_BASE + PROGRAM_PAGE_SIZE - 8;
        assert!(translate_user_range(near_end, 8, 1).is_ok());
        assert!(translate_user_range(near_end, 9, 1).is_err());
        assert!(translate_user_range(near_end, 0, 1).is_ok());
        assert!(translate_user_range(u32::MAX - 2, 8, 1).is_err());
    }

    #[test]
    fn argument_storage_clamps_and_terminates() {
        let mut pcb = Pcb::unused(1);
        pcb.set_argument(b"-f -g -q");
        assert_eq!(pcb.argument(), b"-f -g -q");
        assert_eq!(pcb.arg[8], 0);

        let long = [b'x'; ARG_MAX + 40];
        pcb.set_argument(&long);
        assert_eq!(pcb.arg_len, ARG_MAX);
        assert_eq!(pcb.arg[ARG_MAX], 0);
    }
}
