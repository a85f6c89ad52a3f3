//! Physical frame allocator.
//!
//! Physical memory is divided into 4 KiB frames kept on a linked LIFO
//! stack: the first word of every free frame holds the address of the next
//! free frame. Popping and pushing therefore needs no metadata beyond one
//! head pointer, at the cost of touching each frame through a temporary
//! mapping.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::mm::{self, temp_map, PhysAddr, PAGE_SIZE};

/// Size of a physical frame (4 KiB).
pub const FRAME_SIZE: usize = PAGE_SIZE;

/// Stack terminator. 1 is never a valid frame address (frames are page
/// aligned), so it doubles as the "no more pages" marker inside the stack
/// links.
const STACK_END: u64 = 1;

/// Temp-window slots used while walking the stack (see [`temp_map`]).
const SLOT_STACK_TOP: usize = 5;
const SLOT_STACK_WALK: usize = 6;

/// The free-frame stack.
struct FrameStack {
    /// Physical address of the top free frame, or [`STACK_END`].
    next_free: u64,
    /// Number of frames on the stack. Kept in lockstep with the links.
    free_pages: usize,
}

static FRAME_STACK: Mutex<FrameStack> = Mutex::new(FrameStack {
    next_free: STACK_END,
    free_pages: 0,
});

/// Total bytes of RAM reported by the firmware memory map.
static TOTAL_SYSTEM_MEMORY: AtomicU64 = AtomicU64::new(0);

/// Callback run once when the stack is found empty, before the allocation
/// is retried. Gives caches of kernel objects a chance to return frames.
static TRIM_HOOK: Mutex<Option<fn()>> = Mutex::new(None);

/// Register the pool-trim callback.
pub fn set_trim_hook(hook: fn()) {
    *TRIM_HOOK.lock() = Some(hook);
}

/// Total bytes of system memory.
pub fn total_system_memory() -> u64 {
    TOTAL_SYSTEM_MEMORY.load(Ordering::Relaxed)
}

/// The number of frames currently on the free stack.
pub fn free_page_count() -> usize {
    FRAME_STACK.lock().free_pages
}

/// Build the stack from the firmware memory map. `available` yields
/// `(start, length)` byte ranges of usable RAM; ranges are clipped to start
/// past the loaded kernel image and multiboot payload and rounded to page
/// boundaries. Runs before the kernel address space exists, so every frame
/// is touched through the early window.
pub fn init<I>(available: I, total_memory: u64)
where
    I: Iterator<Item = (u64, u64)>,
{
    TOTAL_SYSTEM_MEMORY.store(total_memory, Ordering::Relaxed);
    let start_of_free = mm::start_of_free_memory_at_boot();

    let mut stack = FRAME_STACK.lock();
    for (area_start, len) in available {
        let end = mm::round_down_to_page(area_start + len);
        let mut start = area_start.max(start_of_free);
        start = mm::round_up_to_page(start);

        let mut page = start;
        while page < end {
            // SAFETY: `page` is a free RAM frame not yet handed to anyone;
            // writing the link word through the early window is exclusive
            // during single-flow boot.
            unsafe {
                let link = temp_map::early_map(PhysAddr::new(page)) as *mut u64;
                link.write_volatile(stack.next_free);
            }
            stack.next_free = page;
            stack.free_pages += 1;
            page += FRAME_SIZE as u64;
        }
    }

    log::info!(
        "frame allocator: {} free pages ({} MiB), {} MiB total RAM",
        stack.free_pages,
        stack.free_pages * FRAME_SIZE / (1024 * 1024),
        total_memory / (1024 * 1024)
    );
}

/// Pop a frame during boot, before the kernel address space and its temp
/// window exist. The frame is not zeroed.
pub fn allocate_pre_virtual() -> Option<PhysAddr> {
    let mut stack = FRAME_STACK.lock();
    if stack.next_free == STACK_END {
        return None;
    }
    let addr = stack.next_free;
    // SAFETY: `addr` is the top free frame; its first word is the link.
    unsafe {
        let link = temp_map::early_map(PhysAddr::new(addr)) as *const u64;
        stack.next_free = link.read_volatile();
    }
    stack.free_pages -= 1;
    Some(PhysAddr::new(addr))
}

/// Pop the next free frame, zeroed. Returns `None` when physical memory is
/// exhausted even after the trim hook ran.
pub fn allocate() -> Option<PhysAddr> {
    allocate_at_or_below(u64::MAX)
}

/// Pop the first frame on the stack whose address is `<= max_base_address`.
/// Drivers use this for DMA-addressable memory.
pub fn allocate_at_or_below(max_base_address: u64) -> Option<PhysAddr> {
    if FRAME_STACK.lock().next_free == STACK_END {
        // Out of memory: let object caches release what they can, once,
        // then retry below.
        let hook = *TRIM_HOOK.lock();
        if let Some(hook) = hook {
            hook();
        }
    }

    let mut stack = FRAME_STACK.lock();
    if stack.next_free == STACK_END {
        return None;
    }

    let mut addr = stack.next_free;
    let page_ptr;
    if addr <= max_base_address {
        // Top of stack is fine. This is the common case for everything but
        // DMA allocations.
        // SAFETY: `addr` is a free frame exclusively owned by the stack.
        unsafe {
            page_ptr = temp_map::map(PhysAddr::new(addr), SLOT_STACK_TOP);
            stack.next_free = (page_ptr as *const u64).read_volatile();
        }
    } else {
        // Walk the links until a frame at or below the bound shows up,
        // then unlink it by pointing its predecessor past it. One window
        // slot tracks the predecessor, the other the candidate.
        // SAFETY: every link on the stack points at a free frame owned by
        // the stack; remapping a slot only invalidates pointers into that
        // slot, and `prev_ptr` is refreshed on every step.
        unsafe {
            let mut prev_ptr = temp_map::map(PhysAddr::new(addr), SLOT_STACK_TOP) as *mut u64;
            addr = prev_ptr.read_volatile();
            loop {
                if addr == STACK_END {
                    return None;
                }
                if addr <= max_base_address {
                    break;
                }
                prev_ptr = temp_map::map(PhysAddr::new(addr), SLOT_STACK_TOP) as *mut u64;
                addr = prev_ptr.read_volatile();
            }
            page_ptr = temp_map::map(PhysAddr::new(addr), SLOT_STACK_WALK);
            prev_ptr.write_volatile((page_ptr as *const u64).read_volatile());
        }
    }

    // Clear the frame so nothing leaks between processes.
    // SAFETY: the frame was just unlinked and belongs to the caller now.
    unsafe {
        core::ptr::write_bytes(page_ptr, 0, FRAME_SIZE);
    }

    stack.free_pages -= 1;
    Some(PhysAddr::new(addr))
}

/// Push a frame back onto the stack.
pub fn free(frame: PhysAddr) {
    let mut stack = FRAME_STACK.lock();
    // SAFETY: the caller relinquishes the frame; writing its link word
    // through the window is exclusive in the single kernel flow.
    unsafe {
        let link = temp_map::map(frame, SLOT_STACK_TOP) as *mut u64;
        link.write_volatile(stack.next_free);
    }
    stack.next_free = frame.as_u64();
    stack.free_pages += 1;
}

/// Release the kernel virtual mappings of the bootloader's scratch region
/// (multiboot info and modules) once the last module has been consumed.
/// The backing frames go back on the stack.
pub fn done_with_boot_memory(kernel_image_end: u64) {
    let start = mm::round_up_to_page(kernel_image_end);
    let end = mm::start_of_free_memory_at_boot();
    if !mm::is_page_aligned(start) || !mm::is_page_aligned(end) {
        log::warn!(
            "done_with_boot_memory range not page aligned: {:#x} -> {:#x}",
            start,
            end
        );
    }

    super::address_space::with_kernel_space(|kernel_space| {
        let mut page = start;
        while page < end {
            kernel_space.unmap_page(page + mm::VIRTUAL_MEMORY_OFFSET, true);
            page += PAGE_SIZE as u64;
        }
    });
    log::info!(
        "released boot scratch memory {:#x} -> {:#x}",
        start,
        end
    );
}
