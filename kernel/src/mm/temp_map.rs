//! Temporary physical-memory windows.
//!
//! Page-table manipulation needs to read and write frames that are not
//! (yet) mapped anywhere. Two mechanisms provide that, mirroring the two
//! phases of boot:
//!
//! - the *early window*: one 2 MiB boot-stub page-directory entry rewritten
//!   per call, usable only while the boot paging structures are loaded;
//! - the *kernel window*: a dedicated leaf page table whose 512 entries
//!   back a 2 MiB stretch of kernel virtual memory, indexed by slot.
//!
//! Slots are pure scratch: a caller owns its slot only for the duration of
//! one borrow and must not assume stability across other kernel calls.
//! Conventional slot use: 0..=3 for page-table walks (one per level), 5 and
//! 6 for the frame allocator's stack walk, 7 for one-off byte access.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::mm::{PhysAddr, VirtAddr, PAGE_SIZE};

const ENTRIES: usize = 512;

/// A raw, page-aligned table of 512 entries, shared with the boot stub.
#[repr(C, align(4096))]
pub struct RawPageTable(pub [u64; ENTRIES]);

// Boot paging structures. The boot stub builds its provisional long-mode
// mapping in these tables (identity plus the kernel half) before `kmain`
// runs. Entry 511 of `BOOT_PD` is repurposed as the early window and
// rewritten per call.
#[no_mangle]
pub static mut BOOT_PML4: RawPageTable = RawPageTable([0; ENTRIES]);
#[no_mangle]
pub static mut BOOT_PDPT: RawPageTable = RawPageTable([0; ENTRIES]);
#[no_mangle]
pub static mut BOOT_PD: RawPageTable = RawPageTable([0; ENTRIES]);

/// Where the early window appears: the last 2 MiB page below 1 GiB in the
/// boot stub's provisional identity mapping.
const EARLY_WINDOW_VIRT: u64 = 1022 * 1024 * 1024;

const TWO_MIB: u64 = 2 * 1024 * 1024;

/// Present | writable | huge, for the early window's 2 MiB entry.
const EARLY_WINDOW_FLAGS: u64 = 0x83;

/// Present | writable, for kernel window leaf entries.
const WINDOW_ENTRY_FLAGS: u64 = 0x3;

/// Base virtual address of the kernel window (0 until installed).
static WINDOW_BASE: AtomicU64 = AtomicU64::new(0);

/// Virtual address of the leaf table backing the kernel window.
static WINDOW_TABLE: AtomicU64 = AtomicU64::new(0);

#[cfg(target_arch = "x86_64")]
fn flush_page(virt: u64) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
}

/// Map a physical address through the early window and return a pointer to
/// it. Only one mapping exists at a time; usable only before the kernel
/// address space is loaded.
pub fn early_map(phys: PhysAddr) -> *mut u8 {
    let page_start = phys.as_u64() & !(TWO_MIB - 1);
    let offset = phys.as_u64() - page_start;
    let entry = page_start | EARLY_WINDOW_FLAGS;

    // SAFETY: single-flow boot path; the boot stub's PD is live and entry
    // 511 is reserved for this window.
    unsafe {
        let pd = core::ptr::addr_of_mut!(BOOT_PD);
        if (*pd).0[ENTRIES - 1] != entry {
            (*pd).0[ENTRIES - 1] = entry;
            flush_page(EARLY_WINDOW_VIRT);
        }
    }

    (EARLY_WINDOW_VIRT + offset) as *mut u8
}

/// Record the kernel window installed by kernel-address-space init.
pub(super) fn install_window(base: VirtAddr, table_virt: VirtAddr) {
    WINDOW_TABLE.store(table_virt.as_u64(), Ordering::Release);
    WINDOW_BASE.store(base.as_u64(), Ordering::Release);
}

/// Whether the kernel window is usable yet.
pub fn window_installed() -> bool {
    WINDOW_BASE.load(Ordering::Acquire) != 0
}

/// Map a page-aligned physical address at `slot` (0..512) of the kernel
/// window and return a pointer to it. Mapping a different address to the
/// same slot unmaps the previous one.
pub fn map(phys: PhysAddr, slot: usize) -> *mut u8 {
    debug_assert!(slot < ENTRIES);
    let entry = phys.as_u64() | WINDOW_ENTRY_FLAGS;
    let base = WINDOW_BASE.load(Ordering::Acquire);
    let table = WINDOW_TABLE.load(Ordering::Acquire) as *mut u64;
    let virt = base + (slot * PAGE_SIZE) as u64;

    // SAFETY: the window table was installed by kernel init and the slot
    // entry is only ever rewritten through this function; the kernel is a
    // single flow, so no concurrent writer exists.
    unsafe {
        if core::ptr::read_volatile(table.add(slot)) != entry {
            core::ptr::write_volatile(table.add(slot), entry);
            flush_page(virt);
        }
    }

    virt as *mut u8
}

/// Map a frame holding a page table at `slot` and view it as entries.
pub fn map_table(phys: PhysAddr, slot: usize) -> *mut u64 {
    map(phys, slot) as *mut u64
}
