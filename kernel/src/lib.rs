//! Lumen kernel library
//!
//! A message-passing microkernel for uniprocessor x86-64. The library target
//! exists so the pure data-structure kernels of each subsystem (free-region
//! index, run queue, message queues, service directory, timer queue) can be
//! unit tested on the host; the `lumen-kernel` binary is the bare-metal
//! image.

#![no_std]

extern crate alloc;

// On bare metal the kernel heap is a linked-list allocator over kernel
// virtual pages (see mm::heap). On the host (x86_64-unknown-linux-gnu for
// `cargo test`) delegate to the system allocator so test code can use
// Vec/BTreeMap/Box normally.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the global allocator.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod error;
pub mod interrupts;
pub mod ipc;
pub mod klog;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod syscall;
pub mod timer;

// Re-exports used across the kernel and by tests
pub use error::{KernelError, KernelResult};
pub use mm::{PhysAddr, VirtAddr, PAGE_SIZE};
