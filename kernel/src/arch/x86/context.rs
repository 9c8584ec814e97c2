//! Saved-context layouts shared by the trampolines, the scheduler, and
//! the process machinery.
//!
//! [`HwContext`] mirrors, field for field, the frame the per-vector entry
//! stubs push: general-purpose registers, data segments, vector number,
//! error code, then the IRET image the CPU supplied. The layout is ABI:
//! the assembly in `trampolines.rs` and `sched` addresses these fields by
//! byte offset, so every struct here is `#[repr(C)]` and offset changes
//! must be mirrored there.

use bitflags::bitflags;

bitflags! {
    /// EFLAGS register bits the kernel actually inspects or edits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EFlags: u32 {
        const CARRY     = 1 << 0;
        const PARITY    = 1 << 2;
        const ADJUST    = 1 << 4;
        const ZERO      = 1 << 6;
        const SIGN      = 1 << 7;
        const TRAP      = 1 << 8;
        const INTERRUPT = 1 << 9;
        const DIRECTION = 1 << 10;
        const OVERFLOW  = 1 << 11;
        /// Bit 1 reads as 1 on every x86.
        const RESERVED_ONE = 1 << 1;
    }
}

/// General-purpose registers plus data segments, in trampoline push order
/// (lowest address first). Segment values occupy a full 32-bit slot; only
/// the low 16 bits are architecturally meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GpRegs {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub ds: u32,
    pub es: u32,
}

impl GpRegs {
    /// Zero every general-purpose register, keeping the segment slots.
    pub fn clear_gp(&mut self) {
        self.ebx = 0;
        self.ecx = 0;
        self.edx = 0;
        self.esi = 0;
        self.edi = 0;
        self.ebp = 0;
        self.eax = 0;
    }
}

/// The IRET image: what the CPU pushed on entry and will pop on exit.
///
/// `esp`/`ss` are only present on a privilege-level change. For
/// same-privilege (kernel) interrupts those two slots alias whatever sat
/// on the interrupted stack and must not be popped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct IretFrame {
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// Number of bytes the CPU pushes for a same-privilege interrupt
/// (EIP, CS, EFLAGS).
pub const KERNEL_IRET_BYTES: u32 = 12;

/// The uniform frame every vector's trampoline synthesizes.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct HwContext {
    pub regs: GpRegs,
    pub vector: u32,
    pub error_code: u32,
    pub iret: IretFrame,
}

/// Sentinel stored in `error_code` for vectors the CPU does not supply
/// one for.
pub const NO_ERROR_CODE: u32 = -2i32 as u32;

impl HwContext {
    /// Code-segment selector as the CPU pushed it (upper half dropped).
    pub fn cs_selector(&self) -> u16 {
        self.iret.cs as u16
    }

    /// Was this frame captured in kernel mode?
    pub fn from_kernel(&self) -> bool {
        self.cs_selector() == super::gdt::KERNEL_CS
    }

    /// The stack pointer the interrupted context was using. For user
    /// frames the CPU recorded it; for kernel frames it is the address
    /// just past the three-word IRET image.
    pub fn interrupted_esp(&self) -> u32 {
        if self.from_kernel() {
            core::ptr::addr_of!(self.iret) as usize as u32 + KERNEL_IRET_BYTES
        } else {
            self.iret.esp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    // The assembly stubs rely on these exact offsets.
    #[test]
    fn frame_layout_matches_trampoline_pushes() {
        assert_eq!(offset_of!(HwContext, regs), 0);
        assert_eq!(offset_of!(GpRegs, ebx), 0);
        assert_eq!(offset_of!(GpRegs, eax), 24);
        assert_eq!(offset_of!(GpRegs, ds), 28);
        assert_eq!(offset_of!(GpRegs, es), 32);
        assert_eq!(offset_of!(HwContext, vector), 36);
        assert_eq!(offset_of!(HwContext, error_code), 40);
        assert_eq!(offset_of!(HwContext, iret), 44);
        assert_eq!(offset_of!(IretFrame, eflags), 8);
        assert_eq!(size_of::<HwContext>(), 64);
        // The sentinel the stubs push for error-code-less vectors.
        assert_eq!(NO_ERROR_CODE, 0xFFFF_FFFE);
    }

    #[test]
    fn clear_gp_spares_segments() {
        let mut regs = GpRegs {
            eax: 5,
            ebx: 6,
            ds: 0x2B,
            es: 0x2B,
            ..GpRegs::default()
        };
        regs.clear_gp();
        assert_eq!(regs.eax, 0);
        assert_eq!(regs.ebx, 0);
        assert_eq!(regs.ds, 0x2B);
        assert_eq!(regs.es, 0x2B);
    }
}
