//! Global descriptor table, LDT, and the task state segment.
//!
//! The selector layout is fixed and relied upon by the trampolines, the
//! syscall gate, and the scheduler:
//!
//! - 0x10: kernel code (ring 0)
//! - 0x18: kernel data (ring 0)
//! - 0x23: user code (ring 3, RPL 3)
//! - 0x2B: user data (ring 3, RPL 3)
//! - 0x30: TSS
//! - 0x38: LDT (installed empty; nothing is ever placed in it)
//!
//! There is exactly one TSS. Its `ss0`/`esp0` pair names the kernel stack
//! of whichever PID is running and is rewritten on every privileged
//! context switch.

pub const KERNEL_CS: u16 = 0x10;
pub const KERNEL_DS: u16 = 0x18;
pub const USER_CS: u16 = 0x23;
pub const USER_DS: u16 = 0x2B;
pub const TSS_SELECTOR: u16 = 0x30;
pub const LDT_SELECTOR: u16 = 0x38;

/// 32-bit TSS, hardware layout.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct TaskStateSegment {
    pub prev_task_link: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub fs: u32,
    pub gs: u32,
    pub ldt_segment_selector: u32,
    pub debug_trap: u16,
    pub io_base_addr: u16,
}

impl TaskStateSegment {
    pub const fn zeroed() -> Self {
        TaskStateSegment {
            prev_task_link: 0,
            esp0: 0,
            ss0: 0,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldt_segment_selector: 0,
            debug_trap: 0,
            io_base_addr: 0,
        }
    }
}

/// Size of the hardware TSS in bytes; the descriptor limit is this - 1.
pub const TSS_SIZE: u32 = core::mem::size_of::<TaskStateSegment>() as u32;

/// Build a flat 4 GiB segment descriptor.
///
/// `access` is the standard access byte (P/DPL/S/type); `flags` the upper
/// nibble (G/D). Pure bit assembly, shared with the unit tests.
pub const fn flat_descriptor(access: u8, flags: u8) -> u64 {
    // limit 0xFFFFF with 4 KiB granularity, base 0
    0x0000_FFFF | ((0xF_u64 | ((flags as u64) << 4)) << 48) | ((access as u64) << 40)
}

/// Build a system descriptor (TSS or LDT) for `base`/`limit`.
pub const fn system_descriptor(base: u32, limit: u32, access: u8) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xFFFF)
        | ((base & 0xFF_FFFF) << 16)
        | ((access as u64) << 40)
        | (((limit >> 16) & 0xF) << 48)
        | (((base >> 24) & 0xFF) << 56)
}

const ACCESS_KERNEL_CODE: u8 = 0x9A;
const ACCESS_KERNEL_DATA: u8 = 0x92;
const ACCESS_USER_CODE: u8 = 0xFA;
const ACCESS_USER_DATA: u8 = 0xF2;
const ACCESS_TSS: u8 = 0x89;
const ACCESS_LDT: u8 = 0x82;
const FLAGS_CODE_DATA: u8 = 0xC; // 4 KiB granularity, 32-bit

/// Pseudo-descriptor consumed by lgdt/lidt.
#[repr(C, packed)]
pub struct DescriptorPointer {
    pub limit: u16,
    pub base: u32,
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod boot {
    use super::*;

    static mut TSS: TaskStateSegment = TaskStateSegment::zeroed();

    // Slots 0 and 1 are intentionally null so the kernel code selector
    // lands at 0x10.
    static mut GDT: [u64; 8] = [0; 8];

    // An empty LDT; present so the LDT selector in the TSS names a real
    // table.
    static mut LDT: [u64; 2] = [0; 2];

    /// Build and load the GDT, install the LDT and TSS, reload every
    /// segment register.
    ///
    /// # Safety
    ///
    /// Boot-time only, single-threaded, interrupts masked.
    pub unsafe fn init(initial_esp0: u32) {
        // SAFETY: Single-threaded boot path; nothing else references these
        // statics until the tables are live.
        unsafe {
            let ldt_base = &raw const LDT as u32;
            GDT[2] = flat_descriptor(ACCESS_KERNEL_CODE, FLAGS_CODE_DATA);
            GDT[3] = flat_descriptor(ACCESS_KERNEL_DATA, FLAGS_CODE_DATA);
            GDT[4] = flat_descriptor(ACCESS_USER_CODE, FLAGS_CODE_DATA);
            GDT[5] = flat_descriptor(ACCESS_USER_DATA, FLAGS_CODE_DATA);
            GDT[6] = system_descriptor(&raw const TSS as u32, TSS_SIZE - 1, ACCESS_TSS);
            GDT[7] = system_descriptor(
                ldt_base,
                (core::mem::size_of::<[u64; 2]>() - 1) as u32,
                ACCESS_LDT,
            );

            TSS.ldt_segment_selector = LDT_SELECTOR as u32;
            TSS.ss0 = KERNEL_DS as u32;
            TSS.esp0 = initial_esp0;
            // No I/O permission bitmap: point past the segment limit.
            TSS.io_base_addr = TSS_SIZE as u16;

            let gdtr = DescriptorPointer {
                limit: (core::mem::size_of::<[u64; 8]>() - 1) as u16,
                base: &raw const GDT as u32,
            };

            // SAFETY (asm): loads the freshly built tables. The far jump
            // reloads CS with the new kernel code selector; the data
            // segment reloads follow, then ltr/lldt cache the task and
            // local descriptor registers.
            core::arch::asm!(
                "lgdt ({gdtr})",
                "movw $0x18, %ax",
                "movw %ax, %ds",
                "movw %ax, %es",
                "movw %ax, %fs",
                "movw %ax, %gs",
                "movw %ax, %ss",
                "ljmpl $0x10, $2f",
                "2:",
                "movw $0x38, %ax",
                "lldt %ax",
                "movw $0x30, %ax",
                "ltr %ax",
                gdtr = in(reg) &gdtr as *const DescriptorPointer,
                out("eax") _,
                options(att_syntax, nostack),
            );
        }
    }

    /// Point the TSS at the kernel stack of the PID about to run.
    /// Must be called with interrupts masked.
    pub fn set_kernel_stack(esp0: u32) {
        // SAFETY: Word-sized store, interrupts masked per the contract, no
        // concurrent readers on this single-CPU machine (the CPU itself
        // only consults esp0 on a ring transition).
        unsafe {
            let tss = &raw mut TSS;
            (*tss).ss0 = KERNEL_DS as u32;
            (*tss).esp0 = esp0;
        }
    }

    /// Current TSS.esp0, i.e. the running PID's kernel stack top.
    pub fn kernel_stack() -> u32 {
        // SAFETY: Word-sized read of a boot-initialized static.
        unsafe { (*(&raw const TSS)).esp0 }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use boot::{init, kernel_stack, set_kernel_stack};

// Host builds model the esp0 slot with a plain atomic so scheduler and
// process logic that records/restores it can be exercised in tests.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod hosted {
    use core::sync::atomic::{AtomicU32, Ordering};

    static ESP0: AtomicU32 = AtomicU32::new(0);

    pub fn set_kernel_stack(esp0: u32) {
        ESP0.store(esp0, Ordering::Relaxed);
    }

    pub fn kernel_stack() -> u32 {
        ESP0.load(Ordering::Relaxed)
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub use hosted::{kernel_stack, set_kernel_stack};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_descriptors_match_reference_encoding() {
        // Known-good encodings for flat 32-bit segments.
        assert_eq!(flat_descriptor(0x9A, 0xC), 0x00CF_9A00_0000_FFFF);
        assert_eq!(flat_descriptor(0x92, 0xC), 0x00CF_9200_0000_FFFF);
        assert_eq!(flat_descriptor(0xFA, 0xC), 0x00CF_FA00_0000_FFFF);
        assert_eq!(flat_descriptor(0xF2, 0xC), 0x00CF_F200_0000_FFFF);
    }

    #[test]
    fn system_descriptor_splits_base_and_limit() {
        let d = system_descriptor(0x0012_3456, 0x67, 0x89);
        assert_eq!(d & 0xFFFF, 0x67); // limit 15:0
        assert_eq!((d >> 16) & 0xFF_FFFF, 0x0012_3456); // base 23:0
        assert_eq!((d >> 40) & 0xFF, 0x89); // access
        assert_eq!((d >> 56) & 0xFF, 0x00); // base 31:24
    }

    #[test]
    fn tss_is_hardware_sized() {
        assert_eq!(TSS_SIZE, 104);
    }
}
