//! Page-directory and page-table management.
//!
//! Two directories exist for the life of the machine:
//!
//! - the **kernel directory**: identity maps for the kernel 4 MiB page,
//!   the four video pages, and one supervisor-only 4 MiB window per live
//!   program page (so the kernel can reach any process image);
//! - the **user directory**: the kernel 4 MiB page, exactly one program
//!   page mapped at the fixed user virtual base, and the 4 KiB vidmap
//!   window.
//!
//! Kernel entry paths install the kernel directory; the exit path
//! restores whatever the interrupted context was using. The scheduler
//! snapshots and reinstalls the whole paging view as part of a task's
//! universal state.

use bitflags::bitflags;
use spin::Mutex;

use crate::arch::interrupts::without_interrupts;
use crate::error::{KernelError, KernelResult};
use crate::mm::{
    pd_index, pt_index, program_page_phys_base, KERNEL_BASE, USER_PAGE_VIRT_BASE,
    USER_VIDMAP_VIRT, VIDEO_MEM_LIVE, VIDEO_PAGE_ADDRS,
};
use crate::process::MAX_PROCESSES;

bitflags! {
    /// Bits shared by directory and table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// In a directory entry: this entry maps a 4 MiB page.
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
    }
}

/// A page-directory entry: either a pointer to a 4 KiB page table or,
/// with [`PageFlags::HUGE`], a 4 MiB page mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PdEntry(u32);

impl PdEntry {
    pub const fn empty() -> Self {
        PdEntry(0)
    }

    /// Entry pointing at a 4 KiB page table.
    pub fn table(table_phys: u32, flags: PageFlags) -> Self {
        PdEntry((table_phys & 0xFFFF_F000) | flags.bits())
    }

    /// Entry mapping a 4 MiB page at `page_phys`.
    pub fn huge(page_phys: u32, flags: PageFlags) -> Self {
        PdEntry((page_phys & 0xFFC0_0000) | (flags | PageFlags::HUGE).bits())
    }

    pub fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub fn is_huge(self) -> bool {
        self.0 & PageFlags::HUGE.bits() != 0
    }

    pub fn table_addr(self) -> u32 {
        self.0 & 0xFFFF_F000
    }

    pub fn huge_addr(self) -> u32 {
        self.0 & 0xFFC0_0000
    }

    pub fn set_present(&mut self, present: bool) {
        if present {
            self.0 |= PageFlags::PRESENT.bits();
        } else {
            self.0 &= !PageFlags::PRESENT.bits();
        }
    }

    /// Repoint a 4 MiB entry, keeping its flags.
    pub fn set_huge_base(&mut self, page_phys: u32) {
        self.0 = (self.0 & 0x003F_FFFF) | (page_phys & 0xFFC0_0000);
    }
}

/// A page-table entry mapping one 4 KiB page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PtEntry(u32);

impl PtEntry {
    pub const fn empty() -> Self {
        PtEntry(0)
    }

    pub fn page(page_phys: u32, flags: PageFlags) -> Self {
        PtEntry((page_phys & 0xFFFF_F000) | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub fn page_addr(self) -> u32 {
        self.0 & 0xFFFF_F000
    }

    pub fn set_present(&mut self, present: bool) {
        if present {
            self.0 |= PageFlags::PRESENT.bits();
        } else {
            self.0 &= !PageFlags::PRESENT.bits();
        }
    }

    pub fn set_page_base(&mut self, page_phys: u32) {
        self.0 = (self.0 & 0x0000_0FFF) | (page_phys & 0xFFFF_F000);
    }
}

pub const ENTRIES: usize = 1024;

#[repr(C, align(4096))]
pub struct PageDirectory {
    pub entries: [PdEntry; ENTRIES],
}

#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PtEntry; ENTRIES],
}

impl PageDirectory {
    pub const fn zeroed() -> Self {
        PageDirectory {
            entries: [PdEntry::empty(); ENTRIES],
        }
    }
}

impl PageTable {
    pub const fn zeroed() -> Self {
        PageTable {
            entries: [PtEntry::empty(); ENTRIES],
        }
    }
}

/// Which of the two directories CR3 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveDir {
    Kernel,
    User,
}

/// The paging view a scheduled task perceives; saved and restored as part
/// of its universal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingState {
    pub user_vidmem_active: bool,
    /// PID whose program page the user directory maps; 0 for none.
    pub current_mapped_pid: u32,
    pub active_dir: ActiveDir,
}

struct Tables {
    kernel_dir: PageDirectory,
    user_dir: PageDirectory,
    kernel_vmem: PageTable,
    user_vmem: PageTable,
    state: PagingState,
}

static TABLES: Mutex<Tables> = Mutex::new(Tables {
    kernel_dir: PageDirectory::zeroed(),
    user_dir: PageDirectory::zeroed(),
    kernel_vmem: PageTable::zeroed(),
    user_vmem: PageTable::zeroed(),
    state: PagingState {
        user_vidmem_active: false,
        current_mapped_pid: 0,
        active_dir: ActiveDir::Kernel,
    },
});

fn kernel_code_entry() -> PdEntry {
    PdEntry::huge(
        KERNEL_BASE,
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_CACHE | PageFlags::GLOBAL,
    )
}

/// Populate both directories and their tables. Split from [`init`] so the
/// construction logic is exercised off-target.
fn build_tables(t: &mut Tables) {
    for entry in t.kernel_dir.entries.iter_mut() {
        *entry = PdEntry::empty();
    }
    for entry in t.user_dir.entries.iter_mut() {
        *entry = PdEntry::empty();
    }
    for entry in t.kernel_vmem.entries.iter_mut() {
        *entry = PtEntry::empty();
    }
    for entry in t.user_vmem.entries.iter_mut() {
        *entry = PtEntry::empty();
    }

    // Kernel directory: low 4 MiB through the video page table, kernel
    // image as one global 4 MiB page.
    let kernel_vmem_phys = &raw const t.kernel_vmem as usize as u32;
    t.kernel_dir.entries[0] =
        PdEntry::table(kernel_vmem_phys, PageFlags::PRESENT | PageFlags::WRITABLE);
    t.kernel_dir.entries[pd_index(KERNEL_BASE)] = kernel_code_entry();

    // The four video pages, identity mapped, supervisor only.
    for &page in VIDEO_PAGE_ADDRS.iter() {
        t.kernel_vmem.entries[pt_index(page)] =
            PtEntry::page(page, PageFlags::PRESENT | PageFlags::WRITABLE);
    }

    // User directory: kernel image plus the vidmap table. The window
    // entry starts not-present, aimed at the live video page.
    t.user_dir.entries[pd_index(KERNEL_BASE)] = kernel_code_entry();
    let user_vmem_phys = &raw const t.user_vmem as usize as u32;
    t.user_dir.entries[pd_index(USER_VIDMAP_VIRT)] = PdEntry::table(
        user_vmem_phys,
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
    );
    t.user_vmem.entries[pt_index(USER_VIDMAP_VIRT)] = PtEntry::page(
        VIDEO_MEM_LIVE,
        PageFlags::WRITABLE | PageFlags::USER,
    );
}

/// Build the directories and switch the CPU onto the kernel directory
/// with paging enabled. Boot path, interrupts masked.
pub fn init() {
    let mut t = TABLES.lock();
    build_tables(&mut t);
    t.state = PagingState {
        user_vidmem_active: false,
        current_mapped_pid: 0,
        active_dir: ActiveDir::Kernel,
    };
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let kernel_dir_phys = &raw const t.kernel_dir as usize as u32;
        // SAFETY: The directory identity-maps the running kernel; this is
        // the one-time boot enable.
        unsafe { crate::arch::x86::enable_paging(kernel_dir_phys) };
    }
}

fn flush_tlb() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::arch::x86::flush_tlb();
}

fn load_cr3(_dir_phys: u32) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: Both directories always map the kernel image, so switching
    // between them never unmaps the executing code.
    unsafe {
        crate::arch::x86::write_cr3(_dir_phys);
    }
}

fn dir_phys(t: &Tables, which: ActiveDir) -> u32 {
    match which {
        ActiveDir::Kernel => &raw const t.kernel_dir as usize as u32,
        ActiveDir::User => &raw const t.user_dir as usize as u32,
    }
}

/// Physical address of the kernel directory (for fault diagnostics).
pub fn kernel_dir_phys() -> u32 {
    let t = TABLES.lock();
    dir_phys(&t, ActiveDir::Kernel)
}

/// Physical address of the user directory (for fault diagnostics).
pub fn user_dir_phys() -> u32 {
    let t = TABLES.lock();
    dir_phys(&t, ActiveDir::User)
}

/// Install one of the two directories and record it as active.
pub fn set_active_directory(which: ActiveDir) {
    without_interrupts(|| {
        let mut t = TABLES.lock();
        let phys = dir_phys(&t, which);
        load_cr3(phys);
        t.state.active_dir = which;
    });
}

/// The directory the current context believes is active.
pub fn active_directory() -> ActiveDir {
    TABLES.lock().state.active_dir
}

/// Map `pid`'s physical 4 MiB window into the kernel directory
/// (supervisor-only) so the kernel can populate the image.
///
/// Panics if the slot is already present: that means process bookkeeping
/// lost track of a live page, and continuing would corrupt another task.
pub fn create_new_user_programpage(pid: u32) -> KernelResult<()> {
    if pid == 0 || pid > MAX_PROCESSES as u32 {
        return Err(KernelError::InvalidArgument);
    }
    let phys = program_page_phys_base(pid);
    without_interrupts(|| {
        let mut t = TABLES.lock();
        let slot = pd_index(phys);
        if t.kernel_dir.entries[slot].is_present() {
            panic!("creating already present program page for pid {pid}");
        }
        t.kernel_dir.entries[slot] = PdEntry::huge(
            phys,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_CACHE,
        );
        flush_tlb();
    });
    Ok(())
}

/// Point the user directory's program-page slot at `pid`'s physical
/// window and mark it present. A PID of 0 is the kernel: nothing to map.
pub fn activate_existing_user_programpage(pid: u32) -> KernelResult<()> {
    if pid == 0 {
        return Ok(());
    }
    if pid > MAX_PROCESSES as u32 {
        return Err(KernelError::InvalidArgument);
    }
    let phys = program_page_phys_base(pid);
    without_interrupts(|| {
        let mut t = TABLES.lock();
        // A page the kernel cannot see does not exist for anyone.
        if !t.kernel_dir.entries[pd_index(phys)].is_present() {
            return Err(KernelError::InvalidState {
                what: "activating a program page that was never created",
            });
        }
        let slot = pd_index(USER_PAGE_VIRT_BASE);
        t.user_dir.entries[slot] = PdEntry::huge(
            phys,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER | PageFlags::NO_CACHE,
        );
        t.state.current_mapped_pid = pid;
        flush_tlb();
        Ok(())
    })
}

/// Unmap `pid`'s window from the kernel directory.
///
/// Panics if the window was not present: a double destroy means the
/// create/destroy pairing is broken.
pub fn destroy_user_programpage(pid: u32) -> KernelResult<()> {
    if pid == 0 || pid > MAX_PROCESSES as u32 {
        return Err(KernelError::InvalidArgument);
    }
    let phys = program_page_phys_base(pid);
    without_interrupts(|| {
        let mut t = TABLES.lock();
        let slot = pd_index(phys);
        if !t.kernel_dir.entries[slot].is_present() {
            panic!("destroying absent program page for pid {pid}");
        }
        t.kernel_dir.entries[slot].set_present(false);
        flush_tlb();
    });
    Ok(())
}

/// Make the user vidmap window present.
pub fn activate_user_vidmem() {
    without_interrupts(|| {
        let mut t = TABLES.lock();
        let idx = pt_index(USER_VIDMAP_VIRT);
        t.user_vmem.entries[idx].set_present(true);
        t.state.user_vidmem_active = true;
        flush_tlb();
    });
}

/// Hide the user vidmap window.
pub fn deactivate_user_vidmem() {
    without_interrupts(|| {
        let mut t = TABLES.lock();
        let idx = pt_index(USER_VIDMAP_VIRT);
        t.user_vmem.entries[idx].set_present(false);
        t.state.user_vidmem_active = false;
        flush_tlb();
    });
}

/// Aim the vidmap window at one of the four video pages. Any other
/// address is rejected.
pub fn set_user_vmem_base_addr(page_phys: u32) -> KernelResult<()> {
    if !VIDEO_PAGE_ADDRS.contains(&page_phys) {
        return Err(KernelError::InvalidArgument);
    }
    without_interrupts(|| {
        let mut t = TABLES.lock();
        let idx = pt_index(USER_VIDMAP_VIRT);
        t.user_vmem.entries[idx].set_page_base(page_phys);
        flush_tlb();
    });
    Ok(())
}

/// What a software walk of a directory finds for a linear address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkOutcome {
    NotPresent,
    Mapped4Mb,
    /// Present table entry: the table's physical address and the index
    /// the address selects in it.
    ViaTable { table_phys: u32, index: usize },
}

fn walk_directory(dir: &PageDirectory, addr: u32) -> WalkOutcome {
    let pde = dir.entries[pd_index(addr)];
    if !pde.is_present() {
        return WalkOutcome::NotPresent;
    }
    if pde.is_huge() {
        return WalkOutcome::Mapped4Mb;
    }
    WalkOutcome::ViaTable {
        table_phys: pde.table_addr(),
        index: pt_index(addr),
    }
}

/// Would dereferencing `addr` under the currently installed directory
/// fault? A software page walk of CR3, used to vet addresses before the
/// hardware gets a chance to object.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn is_unsafe_page_walk(addr: u32) -> bool {
    let dir_phys = crate::arch::x86::read_cr3() & 0xFFFF_F000;
    // SAFETY: CR3 always names one of the two statically allocated
    // directories, which live in identity-mapped kernel memory.
    let dir = unsafe { &*(dir_phys as *const PageDirectory) };
    match walk_directory(dir, addr) {
        WalkOutcome::NotPresent => true,
        WalkOutcome::Mapped4Mb => false,
        WalkOutcome::ViaTable { table_phys, index } => {
            // SAFETY: Present table entries in either directory point at
            // the statically allocated, identity-mapped page tables.
            let table = unsafe { &*(table_phys as *const PageTable) };
            !table.entries[index].is_present()
        }
    }
}

/// Atomically install a task's complete paging view: vidmap presence,
/// program-page mapping, and CR3.
pub fn load_paging_state_to_universe(state: PagingState) {
    without_interrupts(|| {
        {
            let mut t = TABLES.lock();
            let idx = pt_index(USER_VIDMAP_VIRT);
            t.user_vmem.entries[idx].set_present(state.user_vidmem_active);
            t.state.user_vidmem_active = state.user_vidmem_active;
        }
        if state.current_mapped_pid != 0 {
            // The page must still exist: presence is owned by the PCB
            // lifecycle, which outlives any parked schedule entry.
            let _ = activate_existing_user_programpage(state.current_mapped_pid);
        }
        set_active_directory(state.active_dir);
        let mut t = TABLES.lock();
        t.state = state;
    });
}

/// Snapshot the paging view the current context is running under.
pub fn current_universe_paging_state() -> PagingState {
    TABLES.lock().state
}

/// The paging view a freshly seeded root task starts with: its own page
/// mapped, no vidmap, user directory active.
pub fn init_root_paging_state(pid: u32) -> PagingState {
    PagingState {
        user_vidmem_active: false,
        current_mapped_pid: pid,
        active_dir: ActiveDir::User,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_encoding_round_trips() {
        let e = PdEntry::huge(0x0080_0000, PageFlags::PRESENT | PageFlags::WRITABLE);
        assert!(e.is_present());
        assert!(e.is_huge());
        assert_eq!(e.huge_addr(), 0x0080_0000);

        let mut e = PtEntry::page(0xB8000, PageFlags::WRITABLE | PageFlags::USER);
        assert!(!e.is_present());
        e.set_present(true);
        assert!(e.is_present());
        assert_eq!(e.page_addr(), 0xB8000);
        e.set_page_base(0xBA000);
        assert_eq!(e.page_addr(), 0xBA000);
        assert!(e.is_present());
    }

    fn fresh_tables() -> Tables {
        Tables {
            kernel_dir: PageDirectory::zeroed(),
            user_dir: PageDirectory::zeroed(),
            kernel_vmem: PageTable::zeroed(),
            user_vmem: PageTable::zeroed(),
            state: PagingState {
                user_vidmem_active: false,
                current_mapped_pid: 0,
                active_dir: ActiveDir::Kernel,
            },
        }
    }

    #[test]
    fn built_tables_map_the_fixed_layout() {
        let mut t = fresh_tables();
        build_tables(&mut t);
        assert!(t.kernel_dir.entries[0].is_present());
        assert!(!t.kernel_dir.entries[0].is_huge());
        assert!(t.kernel_dir.entries[1].is_present());
        assert!(t.kernel_dir.entries[1].is_huge());
        assert_eq!(t.kernel_dir.entries[1].huge_addr(), KERNEL_BASE);
        for &page in VIDEO_PAGE_ADDRS.iter() {
            assert!(t.kernel_vmem.entries[pt_index(page)].is_present());
            assert_eq!(t.kernel_vmem.entries[pt_index(page)].page_addr(), page);
        }
        // Vidmap window present only after activation, aimed at the live
        // page by default.
        let w = t.user_vmem.entries[pt_index(USER_VIDMAP_VIRT)];
        assert!(!w.is_present());
        assert_eq!(w.page_addr(), VIDEO_MEM_LIVE);
    }

    #[test]
    fn walk_reports_absent_and_huge_mappings() {
        let mut dir = PageDirectory::zeroed();
        assert_eq!(walk_directory(&dir, 0x1234_5678), WalkOutcome::NotPresent);
        dir.entries[pd_index(KERNEL_BASE)] = kernel_code_entry();
        assert_eq!(walk_directory(&dir, KERNEL_BASE + 0x1000), WalkOutcome::Mapped4Mb);
        dir.entries[0] = PdEntry::table(0x0000_3000, PageFlags::PRESENT | PageFlags::WRITABLE);
        assert_eq!(
            walk_directory(&dir, 0xB8123),
            WalkOutcome::ViaTable {
                table_phys: 0x3000,
                index: 0xB8
            }
        );
    }

    #[test]
    fn vidmap_base_rejects_arbitrary_pages() {
        assert!(set_user_vmem_base_addr(0xB800).is_err());
        assert!(set_user_vmem_base_addr(0x0040_0000).is_err());
        assert!(set_user_vmem_base_addr(0xBA000).is_ok());
    }

    #[test]
    fn program_page_lifecycle_creates_activates_destroys() {
        // Uses PID 5 so it cannot collide with the other tests that
        // touch the shared tables.
        assert!(create_new_user_programpage(5).is_ok());
        assert!(activate_existing_user_programpage(5).is_ok());
        {
            let t = TABLES.lock();
            let slot = pd_index(program_page_phys_base(5));
            assert!(t.kernel_dir.entries[slot].is_present());
            let user_slot = pd_index(USER_PAGE_VIRT_BASE);
            assert!(t.user_dir.entries[user_slot].is_present());
            assert_eq!(
                t.user_dir.entries[user_slot].huge_addr(),
                program_page_phys_base(5)
            );
            assert_eq!(t.state.current_mapped_pid, 5);
        }
        assert!(destroy_user_programpage(5).is_ok());
        let t = TABLES.lock();
        assert!(!t.kernel_dir.entries[pd_index(program_page_phys_base(5))].is_present());
    }

    #[test]
    fn activating_a_never_created_page_fails() {
        assert!(activate_existing_user_programpage(6).is_err());
        // PID 0 is the kernel: nothing to map, trivially fine.
        assert!(activate_existing_user_programpage(0).is_ok());
    }

    #[test]
    #[should_panic(expected = "already present program page")]
    fn double_create_is_a_bookkeeping_failure() {
        let _ = create_new_user_programpage(4);
        let _ = create_new_user_programpage(4);
    }

    #[test]
    fn root_state_maps_own_page_without_vidmap() {
        let s = init_root_paging_state(2);
        assert_eq!(s.current_mapped_pid, 2);
        assert!(!s.user_vidmem_active);
        assert_eq!(s.active_dir, ActiveDir::User);
    }
}
