//! Per-process virtual address spaces.
//!
//! Standard 4-level x86-64 page tables with one kernel-defined twist: bit 9
//! of a leaf entry marks the backing frame as *owned* by the address space,
//! meaning unmap must return it to the frame allocator. Pages merely
//! projected into a space (MMIO, shared-memory windows) stay unowned.
//!
//! The top PML4 slot is shared between the kernel space and every user
//! space, so a trap taken in user mode finds the kernel mapped without a
//! root-table change.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    mm::{
        self, frame_allocator, free_ranges::FreeRangeIndex, temp_map, PhysAddr, PAGE_SIZE,
    },
};

const PAGE_TABLE_ENTRIES: usize = 512;

/// Number of page-table levels; level 0 is the PML4, level 3 holds leaves.
const NUM_LEVELS: usize = 4;
const DEEPEST_LEVEL: usize = NUM_LEVELS - 1;

/// Physical-address bits of a table entry (bits 12..52). Masking with
/// `!(PAGE_SIZE - 1)` would leak the NX bit into the address.
const PHYS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Bits of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        /// Software bit: the frame is owned by this address space and must
        /// be freed on unmap.
        const OWNED = 1 << 9;
        const NO_EXECUTE = 1 << 63;
    }
}

/// A leaf entry that reserves the page but faults on every access: all bits
/// set except present and owned. Used for lazily allocated shared-memory
/// slots, where the fault is the allocation trigger.
pub const DUD_PAGE_ENTRY: u64 = !(PteFlags::PRESENT.bits() | PteFlags::OWNED.bits());

bitflags! {
    /// Rights for [`AddressSpace::set_access_rights`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryRights: u64 {
        const WRITE = 1 << 0;
        const EXECUTE = 1 << 1;
    }
}

/// Index of the entry covering `virtualaddr` in the table at `level`.
fn table_index(level: usize, virtualaddr: u64) -> usize {
    ((virtualaddr >> (39 - 9 * level)) & 0x1FF) as usize
}

fn make_entry(phys: PhysAddr, writable: bool, user: bool, owned: bool) -> u64 {
    let mut entry = phys.as_u64() | PteFlags::PRESENT.bits();
    if writable {
        entry |= PteFlags::WRITABLE.bits();
    }
    if user {
        entry |= PteFlags::USER.bits();
    }
    if owned {
        entry |= PteFlags::OWNED.bits();
    }
    entry
}

/// Which temporary-mapping path a table walk uses: the boot 2 MiB window
/// before the kernel space is loaded, the per-level slots of the kernel
/// window afterwards.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mapper {
    Boot,
    Window,
}

impl Mapper {
    /// Map a page table and return a pointer to its entries. Pointers from
    /// earlier calls on the same `Mapper` may be invalidated, so callers
    /// re-fetch before every access.
    fn map_table(self, phys: u64, level: usize) -> *mut u64 {
        match self {
            Mapper::Boot => temp_map::early_map(PhysAddr::new(phys)) as *mut u64,
            Mapper::Window => temp_map::map_table(PhysAddr::new(phys), level),
        }
    }

    fn allocate_frame(self) -> Option<PhysAddr> {
        match self {
            Mapper::Boot => frame_allocator::allocate_pre_virtual(),
            Mapper::Window => frame_allocator::allocate(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    User,
}

/// A virtual address space: root table, free-region index, usage counter.
pub struct AddressSpace {
    kind: SpaceKind,
    /// Physical address of the PML4, 0 until initialized.
    pml4: u64,
    free_ranges: FreeRangeIndex,
    /// Owned pages currently mapped.
    allocated_pages: usize,
}

/// PML4 of the currently loaded address space.
static CURRENT_PML4: AtomicU64 = AtomicU64::new(0);

/// PML4 of the kernel space, readable without taking the kernel-space lock
/// (user-space construction copies the shared top slot from it).
static KERNEL_PML4: AtomicU64 = AtomicU64::new(0);

/// The kernel's address space, created once at boot and never torn down.
static KERNEL_SPACE: Mutex<AddressSpace> = Mutex::new(AddressSpace::empty_kernel());

/// Run `f` with the kernel address space locked.
pub fn with_kernel_space<R>(f: impl FnOnce(&mut AddressSpace) -> R) -> R {
    f(&mut KERNEL_SPACE.lock())
}

pub fn kernel_pml4() -> u64 {
    KERNEL_PML4.load(Ordering::Acquire)
}

/// Load the kernel address space, e.g. when entering the idle state.
pub fn switch_to_kernel_space() {
    KERNEL_SPACE.lock().switch_to();
}

/// Layout decided during kernel-space initialization.
pub struct BootLayout {
    /// Base of the 2 MiB temporary-mapping window.
    pub temp_window_base: u64,
    /// First virtual page of the kernel heap (right after the window).
    pub heap_start: u64,
    /// Alignment gap between the image mappings and the window, donated to
    /// the free index once it exists.
    pub gap_start: u64,
    pub gap_pages: u64,
}

impl AddressSpace {
    pub const fn empty_kernel() -> Self {
        Self {
            kind: SpaceKind::Kernel,
            pml4: 0,
            free_ranges: FreeRangeIndex::new(),
            allocated_pages: 0,
        }
    }

    /// Build a fresh user address space: new zeroed PML4 with the kernel's
    /// top slot copied in, and the two canonical user halves free.
    pub fn new_user() -> KernelResult<Self> {
        let pml4 = frame_allocator::allocate().ok_or(KernelError::OutOfMemory)?;

        // SAFETY: the new PML4 frame is exclusively ours (and zeroed by the
        // allocator); the kernel PML4 is only read.
        unsafe {
            let kernel_table = temp_map::map_table(PhysAddr::new(kernel_pml4()), 1);
            let top_slot = kernel_table.add(PAGE_TABLE_ENTRIES - 1).read_volatile();
            let table = temp_map::map_table(pml4, 0);
            table
                .add(PAGE_TABLE_ENTRIES - 1)
                .write_volatile(top_slot);
        }

        let mut free_ranges = FreeRangeIndex::new();
        free_ranges.mark_free(0, mm::MAX_LOWER_HALF_USER_ADDRESS / PAGE_SIZE as u64);
        free_ranges.mark_free(
            mm::MIN_HIGHER_HALF_USER_ADDRESS,
            (mm::VIRTUAL_MEMORY_OFFSET - mm::MIN_HIGHER_HALF_USER_ADDRESS) / PAGE_SIZE as u64,
        );

        Ok(Self {
            kind: SpaceKind::User,
            pml4: pml4.as_u64(),
            free_ranges,
            allocated_pages: 0,
        })
    }

    pub fn is_kernel_space(&self) -> bool {
        self.kind == SpaceKind::Kernel
    }

    pub fn allocated_pages(&self) -> usize {
        self.allocated_pages
    }

    pub fn free_ranges(&self) -> &FreeRangeIndex {
        &self.free_ranges
    }

    fn is_current(&self) -> bool {
        CURRENT_PML4.load(Ordering::Acquire) == self.pml4
    }

    /// Addresses in the kernel half belong to the kernel space, everything
    /// else to user spaces.
    fn is_address_in_this_space(&self, virtualaddr: u64) -> bool {
        mm::is_kernel_address(virtualaddr) == self.is_kernel_space()
    }

    fn flush_if_visible(&self, virtualaddr: u64) {
        // A leaf change invalidates the TLB entry on the loaded space only;
        // kernel addresses are visible from every space.
        if self.is_current() || mm::is_kernel_address(virtualaddr) {
            #[cfg(target_arch = "x86_64")]
            x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virtualaddr));
        }
    }

    // -- free-region index ------------------------------------------------

    /// Best-fit reserve of `pages` contiguous free pages; returns the start
    /// address.
    pub fn reserve_range(&mut self, pages: u64) -> Option<u64> {
        self.free_ranges.reserve_range(pages)
    }

    /// Reserve `[address, address + pages)`, failing if any page is not
    /// free.
    pub fn reserve_at(&mut self, address: u64, pages: u64) -> bool {
        self.free_ranges.reserve_at(address, pages)
    }

    /// Return a reserved-but-unmapped range to the free index.
    pub fn mark_free(&mut self, address: u64, pages: u64) {
        self.free_ranges.mark_free(address, pages);
    }

    pub fn log_free_ranges(&self) {
        self.free_ranges.log_ranges();
    }

    // -- page mapping -----------------------------------------------------

    /// Map one physical page at a virtual page whose range has already been
    /// reserved. `no_access` installs the dud entry instead of a real
    /// mapping.
    pub fn map_page_at(
        &mut self,
        virtualaddr: u64,
        physicaladdr: PhysAddr,
        own: bool,
        can_write: bool,
        no_access: bool,
    ) -> KernelResult<()> {
        self.map_impl(
            virtualaddr,
            physicaladdr,
            Mapper::Window,
            own,
            can_write,
            no_access,
            false,
        )
    }

    fn map_impl(
        &mut self,
        virtualaddr: u64,
        physicaladdr: PhysAddr,
        mapper: Mapper,
        own: bool,
        can_write: bool,
        no_access: bool,
        assign_page_table: bool,
    ) -> KernelResult<()> {
        if !self.is_address_in_this_space(virtualaddr) {
            return Err(KernelError::InvalidMemoryRange { addr: virtualaddr });
        }
        let is_kernel_addr = mm::is_kernel_address(virtualaddr);

        // Physical address of the table at each level, and whether it was
        // allocated during this call (for rollback).
        let mut table_addr = [0u64; NUM_LEVELS];
        let mut allocated = [false; NUM_LEVELS];
        table_addr[0] = self.pml4;

        for level in 0..DEEPEST_LEVEL {
            let index = table_index(level, virtualaddr);

            if assign_page_table && level == NUM_LEVELS - 2 {
                // Installing a whole leaf table (the temp window's) at the
                // second-to-deepest level instead of walking further.
                // SAFETY: the table mapping is fetched fresh; single flow.
                unsafe {
                    let table = mapper.map_table(table_addr[level], level);
                    if table.add(index).read_volatile() != 0 {
                        return Err(KernelError::RangeOccupied { addr: virtualaddr });
                    }
                    table.add(index).write_volatile(make_entry(
                        physicaladdr,
                        true,
                        !is_kernel_addr,
                        false,
                    ));
                }
                return Ok(());
            }

            // SAFETY: table mappings are fetched fresh before each access
            // because mapping a deeper table may invalidate earlier
            // pointers (the boot window is a single 2 MiB page).
            let entry = unsafe {
                let table = mapper.map_table(table_addr[level], level);
                table.add(index).read_volatile()
            };

            if entry == 0 {
                // Blank entry: allocate the next-level table.
                let new_table = match mapper.allocate_frame() {
                    Some(frame) => frame,
                    None => {
                        self.unwind_new_tables(mapper, virtualaddr, &table_addr, &allocated, level);
                        return Err(KernelError::OutOfMemory);
                    }
                };
                // SAFETY: fresh mappings; the new table frame is exclusive.
                unsafe {
                    let table = mapper.map_table(table_addr[level], level);
                    table.add(index).write_volatile(make_entry(
                        new_table,
                        true,
                        !is_kernel_addr,
                        false,
                    ));
                    let child = mapper.map_table(new_table.as_u64(), level + 1);
                    core::ptr::write_bytes(child, 0, PAGE_TABLE_ENTRIES);
                }
                table_addr[level + 1] = new_table.as_u64();
                allocated[level + 1] = true;
            } else {
                table_addr[level + 1] = entry & PHYS_MASK;
                allocated[level + 1] = false;
            }
        }

        let index = table_index(DEEPEST_LEVEL, virtualaddr);
        // SAFETY: leaf table mapped fresh; single kernel flow.
        unsafe {
            let leaf = mapper.map_table(table_addr[DEEPEST_LEVEL], DEEPEST_LEVEL);
            let existing = leaf.add(index).read_volatile();
            if existing != 0 && existing != DUD_PAGE_ENTRY {
                log::warn!(
                    "mapping page at {:#x} but something is already there",
                    virtualaddr
                );
                return Err(KernelError::RangeOccupied { addr: virtualaddr });
            }
            let entry = if no_access {
                DUD_PAGE_ENTRY
            } else {
                make_entry(physicaladdr, can_write, !is_kernel_addr, own)
            };
            leaf.add(index).write_volatile(entry);
        }

        if own && !no_access {
            self.allocated_pages += 1;
        }
        self.flush_if_visible(virtualaddr);
        Ok(())
    }

    /// Free the tables allocated by a failed `map_impl` call and clear
    /// their parent entries, deepest first.
    fn unwind_new_tables(
        &self,
        mapper: Mapper,
        virtualaddr: u64,
        table_addr: &[u64; NUM_LEVELS],
        allocated: &[bool; NUM_LEVELS],
        reached_level: usize,
    ) {
        for level in (1..=reached_level).rev() {
            if !allocated[level] {
                continue;
            }
            frame_allocator::free(PhysAddr::new(table_addr[level]));
            // SAFETY: parent table mapped fresh; entry was written by us.
            unsafe {
                let parent = mapper.map_table(table_addr[level - 1], level - 1);
                parent
                    .add(table_index(level - 1, virtualaddr))
                    .write_volatile(0);
            }
        }
    }

    /// Clear the leaf entry for a page. If the mapping was owned and `free`
    /// is set, the frame goes back to the allocator. The page returns to
    /// the free index and any intermediate table that became empty is
    /// reclaimed (the PML4 never is). No-op on absent mappings.
    pub fn unmap_page(&mut self, virtualaddr: u64, free: bool) {
        if !self.is_address_in_this_space(virtualaddr) {
            return;
        }
        let virtualaddr = if mm::is_page_aligned(virtualaddr) {
            virtualaddr
        } else {
            log::warn!("unmap_page called with unaligned address {:#x}", virtualaddr);
            mm::round_down_to_page(virtualaddr)
        };

        let mut table_addr = [0u64; NUM_LEVELS];
        table_addr[0] = self.pml4;
        for level in 0..DEEPEST_LEVEL {
            // SAFETY: fresh mapping per access, single flow.
            let entry = unsafe {
                let table = Mapper::Window.map_table(table_addr[level], level);
                table.add(table_index(level, virtualaddr)).read_volatile()
            };
            if entry == 0 {
                return;
            }
            table_addr[level + 1] = entry & PHYS_MASK;
        }

        let index = table_index(DEEPEST_LEVEL, virtualaddr);
        // SAFETY: leaf mapped fresh; single flow.
        let entry = unsafe {
            let leaf = Mapper::Window.map_table(table_addr[DEEPEST_LEVEL], DEEPEST_LEVEL);
            leaf.add(index).read_volatile()
        };
        if entry == 0 {
            return;
        }

        let is_real_mapping = entry != DUD_PAGE_ENTRY;
        if is_real_mapping && entry & PteFlags::OWNED.bits() != 0 {
            if free {
                frame_allocator::free(PhysAddr::new(entry & PHYS_MASK));
            }
            self.allocated_pages = self.allocated_pages.saturating_sub(1);
        }

        // SAFETY: same leaf table as above.
        unsafe {
            let leaf = Mapper::Window.map_table(table_addr[DEEPEST_LEVEL], DEEPEST_LEVEL);
            leaf.add(index).write_volatile(0);
        }
        self.free_ranges.mark_free(virtualaddr, 1);
        self.flush_if_visible(virtualaddr);

        // Reclaim now-empty tables from the leaves up, never the PML4.
        for level in (1..=DEEPEST_LEVEL).rev() {
            // SAFETY: fresh mapping; tables below were just possibly freed
            // but this level's table is still live.
            let empty = unsafe {
                let table = Mapper::Window.map_table(table_addr[level], level);
                (0..PAGE_TABLE_ENTRIES).all(|i| table.add(i).read_volatile() == 0)
            };
            if !empty {
                return;
            }
            frame_allocator::free(PhysAddr::new(table_addr[level]));
            // SAFETY: parent mapped fresh.
            unsafe {
                let parent = Mapper::Window.map_table(table_addr[level - 1], level - 1);
                parent
                    .add(table_index(level - 1, virtualaddr))
                    .write_volatile(0);
            }
        }
    }

    /// Walk the tables and return the physical address mapped at
    /// `virtualaddr`. With `require_owned`, unowned mappings read as
    /// absent.
    pub fn translate(&self, virtualaddr: u64, require_owned: bool) -> Option<PhysAddr> {
        let mut entry = self.pml4;
        for level in 0..NUM_LEVELS {
            // SAFETY: fresh mapping per level; read-only walk.
            entry = unsafe {
                let table = Mapper::Window.map_table(entry & PHYS_MASK, level);
                table.add(table_index(level, virtualaddr)).read_volatile()
            };
            if entry & PteFlags::PRESENT.bits() == 0 {
                return None;
            }
        }
        if require_owned && entry & PteFlags::OWNED.bits() == 0 {
            return None;
        }
        Some(PhysAddr::new(entry & PHYS_MASK))
    }

    /// Translate, or allocate-reserve-map a fresh owned page at
    /// `virtualaddr`. Any step failing rolls the others back.
    pub fn get_or_create_page(&mut self, virtualaddr: u64) -> KernelResult<PhysAddr> {
        if let Some(phys) = self.translate(virtualaddr, false) {
            return Ok(phys);
        }

        let frame = frame_allocator::allocate().ok_or(KernelError::OutOfMemory)?;
        if !self.free_ranges.mark_used(mm::round_down_to_page(virtualaddr)) {
            frame_allocator::free(frame);
            return Err(KernelError::OutOfMemory);
        }
        match self.map_page_at(mm::round_down_to_page(virtualaddr), frame, true, true, false) {
            Ok(()) => Ok(frame),
            Err(e) => {
                self.free_ranges
                    .mark_free(mm::round_down_to_page(virtualaddr), 1);
                frame_allocator::free(frame);
                Err(e)
            }
        }
    }

    /// Rewrite the write/execute bits of an owned page and flush its TLB
    /// entry. No-op on absent or unowned mappings.
    pub fn set_access_rights(&mut self, virtualaddr: u64, rights: MemoryRights) {
        if !self.is_address_in_this_space(virtualaddr) {
            return;
        }

        let mut table_addr = [0u64; NUM_LEVELS];
        table_addr[0] = self.pml4;
        let mut entry = 0u64;
        for level in 0..NUM_LEVELS {
            // SAFETY: fresh mapping per level.
            entry = unsafe {
                let table = Mapper::Window.map_table(table_addr[level], level);
                table.add(table_index(level, virtualaddr)).read_volatile()
            };
            if entry & PteFlags::PRESENT.bits() == 0 {
                return;
            }
            if level < DEEPEST_LEVEL {
                table_addr[level + 1] = entry & PHYS_MASK;
            }
        }

        if entry & PteFlags::OWNED.bits() == 0 {
            return;
        }

        entry &= !(PteFlags::NO_EXECUTE.bits() | PteFlags::WRITABLE.bits());
        if rights.contains(MemoryRights::WRITE) {
            entry |= PteFlags::WRITABLE.bits();
        }
        if !rights.contains(MemoryRights::EXECUTE) {
            entry |= PteFlags::NO_EXECUTE.bits();
        }

        // SAFETY: leaf mapped fresh; rewriting the entry we just read.
        unsafe {
            let leaf = Mapper::Window.map_table(table_addr[DEEPEST_LEVEL], DEEPEST_LEVEL);
            leaf.add(table_index(DEEPEST_LEVEL, virtualaddr))
                .write_volatile(entry);
        }
        self.flush_if_visible(virtualaddr);
    }

    // -- composite operations --------------------------------------------

    /// Reserve a free range and back every page with a fresh owned frame.
    /// Returns the start address, or `None` (with everything rolled back)
    /// on exhaustion.
    pub fn allocate_pages(&mut self, pages: u64) -> Option<u64> {
        self.allocate_pages_below(pages, u64::MAX)
    }

    /// Like [`Self::allocate_pages`] but every backing frame has a physical
    /// address at or below `max_base_address` (DMA-addressable memory).
    pub fn allocate_pages_below(&mut self, pages: u64, max_base_address: u64) -> Option<u64> {
        let start = self.free_ranges.reserve_range(pages)?;

        for i in 0..pages {
            let virtualaddr = start + i * PAGE_SIZE as u64;
            let mapped = frame_allocator::allocate_at_or_below(max_base_address)
                .ok_or(KernelError::OutOfMemory)
                .and_then(|frame| {
                    self.map_page_at(virtualaddr, frame, true, true, false)
                        .inspect_err(|_| frame_allocator::free(frame))
                });
            if mapped.is_err() {
                log::warn!("allocate_pages: out of memory after {} of {} pages", i, pages);
                // Mapped prefix is unmapped and freed; the reserved but
                // never-mapped tail goes straight back to the free index.
                for j in 0..i {
                    self.unmap_page(start + j * PAGE_SIZE as u64, true);
                }
                self.free_ranges
                    .mark_free(virtualaddr, pages - i);
                return None;
            }
        }
        Some(start)
    }

    /// Unmap `pages` pages without freeing the backing frames (shared
    /// memory windows, MMIO).
    pub fn release_pages(&mut self, address: u64, pages: u64) {
        if !mm::is_page_aligned(address) {
            log::warn!("release_pages called with unaligned address {:#x}", address);
            return;
        }
        for i in 0..pages {
            self.unmap_page(address + i * PAGE_SIZE as u64, false);
        }
    }

    /// Unmap `pages` pages, freeing owned frames.
    pub fn free_pages(&mut self, address: u64, pages: u64) {
        if !mm::is_page_aligned(address) {
            log::warn!("free_pages called with unaligned address {:#x}", address);
            return;
        }
        for i in 0..pages {
            self.unmap_page(address + i * PAGE_SIZE as u64, true);
        }
    }

    /// Project physical memory into this space without taking ownership
    /// (driver MMIO). Returns the mapped virtual address.
    pub fn map_physical(&mut self, physicaladdr: PhysAddr, pages: u64) -> Option<u64> {
        let start = self.free_ranges.reserve_range(pages)?;
        for i in 0..pages {
            let virtualaddr = start + i * PAGE_SIZE as u64;
            let phys = physicaladdr.offset(i * PAGE_SIZE as u64);
            if self.map_page_at(virtualaddr, phys, false, true, false).is_err() {
                for j in 0..i {
                    self.unmap_page(start + j * PAGE_SIZE as u64, false);
                }
                self.free_ranges.mark_free(virtualaddr, pages - i);
                return None;
            }
        }
        Some(start)
    }

    // -- lifetime ---------------------------------------------------------

    /// Load this space's root table, unless it is already current.
    pub fn switch_to(&self) {
        if self.is_current() {
            return;
        }
        CURRENT_PML4.store(self.pml4, Ordering::Release);
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: pml4 points at a valid root table whose kernel half
        // mirrors the current one, so kernel execution continues unmapped.
        unsafe {
            use x86_64::registers::control::{Cr3, Cr3Flags};
            use x86_64::structures::paging::PhysFrame;
            Cr3::write(
                PhysFrame::containing_address(x86_64::PhysAddr::new(self.pml4)),
                Cr3Flags::empty(),
            );
        }
    }

    /// Free every owned frame and every table of a user space. Called on
    /// process destruction; the shared kernel slot is skipped so the
    /// kernel's tables are never freed through a user space.
    pub(crate) fn release_all(&mut self) {
        if self.pml4 == 0 || self.is_kernel_space() {
            return;
        }
        // Never tear down the loaded space.
        if self.is_current() {
            switch_to_kernel_space();
        }
        Self::scan_and_free_level(self.pml4, 0);
        frame_allocator::free(PhysAddr::new(self.pml4));
        self.pml4 = 0;
        self.allocated_pages = 0;
    }

    /// Depth-first walk freeing owned leaf frames and the tables
    /// themselves. The top-level call skips the last PML4 slot: it is the
    /// kernel mapping shared by every address space.
    fn scan_and_free_level(table_phys: u64, level: usize) {
        let max_entry = if level == 0 {
            PAGE_TABLE_ENTRIES - 1
        } else {
            PAGE_TABLE_ENTRIES
        };

        for i in 0..max_entry {
            // Re-map on every iteration: recursion below reuses the slots.
            // SAFETY: single-flow teardown; the table is still live.
            let entry = unsafe {
                let table = temp_map::map_table(PhysAddr::new(table_phys), level);
                table.add(i).read_volatile()
            };

            if level == DEEPEST_LEVEL {
                // Leaf: free owned frames only. Dud entries have neither
                // bit set and are skipped.
                if entry & PteFlags::PRESENT.bits() != 0 && entry & PteFlags::OWNED.bits() != 0 {
                    frame_allocator::free(PhysAddr::new(entry & PHYS_MASK));
                }
            } else if entry != 0 {
                let child = entry & PHYS_MASK;
                Self::scan_and_free_level(child, level + 1);
                frame_allocator::free(PhysAddr::new(child));
            }
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Initialize the kernel address space: fresh PML4, the image and boot
/// payload mapped into the kernel half, and the temporary-mapping window
/// installed. Runs through the early window; the caller loads CR3 with
/// [`switch_to_kernel_space`] afterwards.
pub fn init_kernel_space(start_of_free: u64) -> BootLayout {
    const TWO_MIB: u64 = 2 * 1024 * 1024;

    let mut kernel_space = KERNEL_SPACE.lock();

    let pml4 = frame_allocator::allocate_pre_virtual()
        .expect("out of physical memory during kernel initialization");
    // SAFETY: fresh frame, exclusive during boot.
    unsafe {
        core::ptr::write_bytes(temp_map::early_map(pml4), 0, PAGE_SIZE);
    }
    kernel_space.pml4 = pml4.as_u64();
    KERNEL_PML4.store(pml4.as_u64(), Ordering::Release);

    // Map the loaded image plus the multiboot payload into the kernel half.
    let mut phys = 0u64;
    while phys < start_of_free {
        kernel_space
            .map_impl(
                phys + mm::VIRTUAL_MEMORY_OFFSET,
                PhysAddr::new(phys),
                Mapper::Boot,
                true,
                true,
                false,
                false,
            )
            .expect("out of memory mapping the kernel image");
        phys += PAGE_SIZE as u64;
    }
    let mut virt = start_of_free + mm::VIRTUAL_MEMORY_OFFSET;

    // One page for the window's leaf table, mapped so its entries can be
    // rewritten through a plain pointer.
    let window_table = frame_allocator::allocate_pre_virtual()
        .expect("out of physical memory during kernel initialization");
    // SAFETY: fresh frame, exclusive during boot.
    unsafe {
        core::ptr::write_bytes(temp_map::early_map(window_table), 0, PAGE_SIZE);
    }
    let window_table_virt = virt;
    kernel_space
        .map_impl(
            window_table_virt,
            window_table,
            Mapper::Boot,
            true,
            true,
            false,
            false,
        )
        .expect("out of memory mapping the temp window table");
    virt += PAGE_SIZE as u64;

    // The next naturally aligned 2 MiB stretch becomes the window; the
    // leaf table is installed whole at the level above the leaves.
    let window_base = (virt + TWO_MIB) & !(TWO_MIB - 1);
    let gap_start = virt;
    let gap_pages = (window_base - virt) / PAGE_SIZE as u64;

    kernel_space
        .map_impl(
            window_base,
            window_table,
            Mapper::Boot,
            false,
            true,
            false,
            true,
        )
        .expect("installing the temp window table failed");

    temp_map::install_window(
        mm::VirtAddr::new(window_base),
        mm::VirtAddr::new(window_table_virt),
    );

    BootLayout {
        temp_window_base: window_base,
        heap_start: window_base + TWO_MIB,
        gap_start,
        gap_pages,
    }
}

/// Give the kernel space its free-region index once the heap can back the
/// tree nodes: everything above the heap, plus the alignment gap below the
/// window.
pub fn finish_kernel_space_init(layout: &BootLayout, heap_pages: u64) {
    let mut kernel_space = KERNEL_SPACE.lock();
    let free_start = layout.heap_start + heap_pages * PAGE_SIZE as u64;
    // The kernel half runs to the top of the address space; 0 wraps.
    let pages_to_top = 0u64.wrapping_sub(free_start) / PAGE_SIZE as u64;
    kernel_space.free_ranges.mark_free(free_start, pages_to_top);
    if layout.gap_pages > 0 {
        kernel_space
            .free_ranges
            .mark_free(layout.gap_start, layout.gap_pages);
    }
}
