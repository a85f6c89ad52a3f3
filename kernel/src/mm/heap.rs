//! Kernel heap bring-up.
//!
//! The heap lives in kernel virtual memory right after the temporary
//! mapping window and is backed by owned frames mapped one by one. It must
//! exist before any BTreeMap/Vec-backed kernel structure is touched,
//! including the kernel space's own free-region index.

use crate::{
    error::{KernelError, KernelResult},
    mm::{self, frame_allocator, PAGE_SIZE},
};

/// 4 MiB of kernel heap.
pub const KERNEL_HEAP_PAGES: u64 = 1024;

/// Map and install the kernel heap at `heap_start` (from the boot layout).
pub fn init(heap_start: u64) -> KernelResult<()> {
    mm::address_space::with_kernel_space(|kernel_space| {
        for i in 0..KERNEL_HEAP_PAGES {
            let frame = frame_allocator::allocate().ok_or(KernelError::OutOfMemory)?;
            kernel_space.map_page_at(
                heap_start + i * PAGE_SIZE as u64,
                frame,
                true,
                true,
                false,
            )?;
        }
        Ok::<(), KernelError>(())
    })?;

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: the range was just mapped with owned frames and is used for
    // nothing else.
    unsafe {
        crate::get_allocator()
            .lock()
            .init(heap_start as *mut u8, (KERNEL_HEAP_PAGES as usize) * PAGE_SIZE);
    }

    log::info!(
        "kernel heap: {} KiB at {:#x}",
        KERNEL_HEAP_PAGES as usize * PAGE_SIZE / 1024,
        heap_start
    );
    Ok(())
}
