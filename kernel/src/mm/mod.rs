//! Memory management.
//!
//! Initialization order matters and mirrors the boot flow: the physical
//! frame allocator first (it only needs the multiboot memory map and the
//! early 2 MiB window), then the kernel address space with its temporary
//! mapping window, then the kernel heap, and only then the kernel space's
//! free-region index (which needs the heap for its tree nodes).

pub mod address_space;
pub mod frame_allocator;
pub mod free_ranges;
pub mod heap;
pub mod temp_map;

use core::sync::atomic::{AtomicU64, Ordering};

pub use address_space::{AddressSpace, MemoryRights};
pub use frame_allocator::FRAME_SIZE;

/// Size of a page in bytes. Changing this would break the address-space
/// layout, the temp window, and the frame stack all at once.
pub const PAGE_SIZE: usize = 4096;

/// Where the kernel half starts: the top 2 GiB of the canonical address
/// space. Physical address `p` of the loaded image is visible at
/// `p + VIRTUAL_MEMORY_OFFSET`.
pub const VIRTUAL_MEMORY_OFFSET: u64 = 0xFFFF_FFFF_8000_0000;

/// The highest user-space address in the lower canonical half.
pub const MAX_LOWER_HALF_USER_ADDRESS: u64 = 0x0000_7FFF_FFFF_FFFF;

/// The lowest user-space address in the higher canonical half.
pub const MIN_HIGHER_HALF_USER_ADDRESS: u64 = 0xFFFF_8000_0000_0000;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn offset(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn offset(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// Whether an address is the start of a memory page.
pub fn is_page_aligned(address: u64) -> bool {
    address % PAGE_SIZE as u64 == 0
}

/// Round an address down to the start of the page it is in.
pub fn round_down_to_page(address: u64) -> u64 {
    address & !(PAGE_SIZE as u64 - 1)
}

/// Round an address up to the next page boundary.
pub fn round_up_to_page(address: u64) -> u64 {
    (address + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// The number of whole pages needed to contain `bytes`.
pub fn pages_that_contain_bytes(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Whether an address lives in the kernel half.
pub fn is_kernel_address(address: u64) -> bool {
    address >= VIRTUAL_MEMORY_OFFSET
}

/// View of boot-time low physical memory through the kernel half mapping.
/// Valid for addresses below `start_of_free_memory_at_boot` once the kernel
/// address space is loaded (the whole loaded image plus the multiboot
/// payload is mapped there), and below 1 GiB before that (boot stub
/// contract).
pub fn phys_to_boot_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + VIRTUAL_MEMORY_OFFSET)
}

/// First byte of free physical memory past the kernel image and the
/// multiboot payload, page aligned. Set once during boot.
static START_OF_FREE_MEMORY_AT_BOOT: AtomicU64 = AtomicU64::new(0);

pub fn start_of_free_memory_at_boot() -> u64 {
    START_OF_FREE_MEMORY_AT_BOOT.load(Ordering::Acquire)
}

pub(crate) fn set_start_of_free_memory_at_boot(addr: u64) {
    START_OF_FREE_MEMORY_AT_BOOT.store(addr, Ordering::Release);
}
