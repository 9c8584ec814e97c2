//! Per-vector entry stubs.
//!
//! Every installed vector gets a tiny assembly stub that normalizes the
//! stack into the uniform [`HwContext`] layout: vectors whose exceptions
//! do not push an error code first push the sentinel, then every stub
//! pushes its vector number and falls through to the shared tail, which
//! saves segments and general-purpose registers, loads the kernel data
//! segments, and hands a frame pointer to `dispatch_vector`.
//!
//! The stubs are generated by assembler macros from the single table at
//! the bottom of this file; the matching Rust-side table is generated by
//! [`vector_table!`] from the same list, so a vector cannot be wired into
//! the IDT without a stub existing.
//!
//! [`HwContext`]: super::context::HwContext

/// One installable vector: its number and the stub's address.
#[derive(Debug, Clone, Copy)]
pub struct VectorEntry {
    pub vector: u8,
    pub handler: u32,
}

/// Exception vectors for which the CPU pushes a hardware error code.
/// Everything else gets the sentinel pushed by its stub.
pub const ERROR_CODE_VECTORS: &[u8] = &[8, 10, 11, 12, 13, 14, 17];

/// Does `vector` supply a hardware error code?
pub fn pushes_error_code(vector: u8) -> bool {
    ERROR_CODE_VECTORS.contains(&vector)
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
core::arch::global_asm!(
    r#"
.macro ISR_NOERR vec
    .globl isr_stub_\vec
isr_stub_\vec:
    push -2
    push \vec
    jmp isr_common
.endm

.macro ISR_ERR vec
    .globl isr_stub_\vec
isr_stub_\vec:
    push \vec
    jmp isr_common
.endm

// Exceptions 0..=19. The error-code set matches ERROR_CODE_VECTORS.
ISR_NOERR 0
ISR_NOERR 1
ISR_NOERR 2
ISR_NOERR 3
ISR_NOERR 4
ISR_NOERR 5
ISR_NOERR 6
ISR_NOERR 7
ISR_ERR   8
ISR_NOERR 9
ISR_ERR   10
ISR_ERR   11
ISR_ERR   12
ISR_ERR   13
ISR_ERR   14
ISR_NOERR 15
ISR_NOERR 16
ISR_ERR   17
ISR_NOERR 18
ISR_NOERR 19

// Hardware interrupts: PIT, keyboard, RTC.
ISR_NOERR 32
ISR_NOERR 33
ISR_NOERR 40

// The system-call gate.
ISR_NOERR 128

// Shared tail: finish building the HwContext frame (error code and
// vector are already on the stack, the IRET image above them), switch to
// kernel data segments, and call the dispatcher with a pointer to the
// frame. The pop sequence is the exact mirror; handlers that change the
// outgoing context edit the frame in place before we get back here.
isr_common:
    push es
    push ds
    push eax
    push ebp
    push edi
    push esi
    push edx
    push ecx
    push ebx
    mov ax, 0x18
    mov ds, ax
    mov es, ax
    push esp
    call dispatch_vector
    add esp, 4
    pop ebx
    pop ecx
    pop edx
    pop esi
    pop edi
    pop ebp
    pop eax
    pop ds
    pop es
    add esp, 8
    iretd
"#
);

/// Generate the extern declarations and the vector table from one list.
macro_rules! vector_table {
    ($(($vec:expr, $sym:ident)),+ $(,)?) => {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        extern "C" {
            $(fn $sym();)+
        }

        /// Every vector this kernel installs, with its stub address.
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        pub fn vector_entries() -> [VectorEntry; [$($vec),+].len()] {
            [$(VectorEntry { vector: $vec, handler: $sym as usize as u32 }),+]
        }

        /// The vectors alone, visible to the host harness for table checks.
        pub const INSTALLED_VECTORS: &[u8] = &[$($vec),+];
    };
}

vector_table! {
    (0, isr_stub_0),
    (1, isr_stub_1),
    (2, isr_stub_2),
    (3, isr_stub_3),
    (4, isr_stub_4),
    (5, isr_stub_5),
    (6, isr_stub_6),
    (7, isr_stub_7),
    (8, isr_stub_8),
    (9, isr_stub_9),
    (10, isr_stub_10),
    (11, isr_stub_11),
    (12, isr_stub_12),
    (13, isr_stub_13),
    (14, isr_stub_14),
    (15, isr_stub_15),
    (16, isr_stub_16),
    (17, isr_stub_17),
    (18, isr_stub_18),
    (19, isr_stub_19),
    (32, isr_stub_32),
    (33, isr_stub_33),
    (40, isr_stub_40),
    (128, isr_stub_128),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::idt;

    #[test]
    fn installed_vectors_cover_the_machine() {
        // All twenty exception vectors, the three IRQs, and the gate.
        for v in 0..=idt::VEC_EXCEPTION_END {
            assert!(INSTALLED_VECTORS.contains(&v), "missing exception {v}");
        }
        assert!(INSTALLED_VECTORS.contains(&idt::VEC_PIT));
        assert!(INSTALLED_VECTORS.contains(&idt::VEC_KEYBOARD));
        assert!(INSTALLED_VECTORS.contains(&idt::VEC_RTC));
        assert!(INSTALLED_VECTORS.contains(&idt::VEC_SYSCALL));
        assert_eq!(INSTALLED_VECTORS.len(), 24);
    }

    #[test]
    fn error_code_set_matches_the_architecture() {
        for v in [8u8, 10, 11, 12, 13, 14, 17] {
            assert!(pushes_error_code(v));
        }
        for v in [0u8, 6, 9, 15, 16, 32, 33, 40, 128] {
            assert!(!pushes_error_code(v));
        }
    }
}
