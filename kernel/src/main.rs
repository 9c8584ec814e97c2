//! Boot binary: Multiboot entry, device bring-up, and the handoff to
//! the scheduler.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod boot {
    use core::panic::PanicInfo;

    use trident_kernel::multiboot::{
        MultibootInfo, BOOTLOADER_MAGIC, INFO_BOOT_DEVICE, INFO_CMDLINE, INFO_MEMORY,
    };
    use trident_kernel::{arch, drivers, fs, klog, mm, process, sched, serial, terminal};
    use trident_kernel::{println, serial_println};

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        serial_println!("[KERNEL PANIC] {}", info);
        println!("[KERNEL PANIC] {}", info);
        arch::x86::halt_forever();
    }

    /// Entry from the Multiboot stub: EAX magic and the physical
    /// address of the info structure, both pushed by `_start`.
    #[no_mangle]
    pub extern "C" fn kernel_entry(magic: u32, info_addr: u32) -> ! {
        serial::init();
        klog::init();

        if magic != BOOTLOADER_MAGIC {
            panic!("not booted by a Multiboot loader: magic {magic:#010x}");
        }

        // SAFETY: A conforming loader leaves a valid info structure at
        // the address it handed us, identity-mapped.
        let info = unsafe { &*(info_addr as usize as *const MultibootInfo) };
        log::info!("multiboot flags {:#010x}", info.flags);
        if info.flags & INFO_MEMORY != 0 {
            log::info!(
                "mem_lower = {} KiB, mem_upper = {} KiB",
                info.mem_lower,
                info.mem_upper
            );
        }
        if info.flags & INFO_BOOT_DEVICE != 0 {
            log::info!("boot_device = {:#010x}", info.boot_device);
        }
        if info.flags & INFO_CMDLINE != 0 {
            log::info!("cmdline at {:#010x}", info.cmdline);
        }

        // The one module a conforming loader passes is the filesystem.
        // SAFETY: Module records come from the loader per the contract
        // above.
        let fs_module = unsafe { info.modules() }.first().copied();
        let Some(fs_module) = fs_module else {
            panic!("no filesystem module supplied by the loader");
        };
        log::info!(
            "filesystem module at {:#010x}..{:#010x}",
            fs_module.mod_start,
            fs_module.mod_end
        );

        // Descriptor tables first: nothing may trap before the IDT is
        // real. The initial esp0 covers the boot (PID 0) stack arena.
        // SAFETY: Single-threaded boot path with interrupts masked (the
        // boot stub ran cli).
        unsafe {
            arch::x86::gdt::init(process::initial_esp0(0));
            arch::x86::idt::init();
        }
        println!("descriptor tables loaded");

        mm::paging::init();
        println!("paging enabled");

        drivers::pic::init();
        drivers::pit::init();
        drivers::keyboard::init();
        terminal::init();
        drivers::rtc::init();
        process::init();

        // SAFETY: The module range is loader-provided memory that
        // nothing in the fixed physical layout overlaps.
        if let Err(e) = unsafe { fs::init(fs_module.mod_start, fs_module.mod_end) } {
            panic!("cannot mount the filesystem module: {e}");
        }

        if let Err(e) = sched::init() {
            panic!("cannot seed the scheduler: {e}");
        }
        println!("devices initialized");

        println!("Beginning OS...");
        // SAFETY: IDT, PIC, and the scheduler ring are live; the next
        // timer tick takes the machine.
        unsafe { arch::interrupts::enable() };

        loop {
            arch::x86::idle();
        }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn main() {
    eprintln!("trident-kernel only runs on the bare-metal 32-bit x86 target");
}
