//! Bare-metal kernel entry.
//!
//! The multiboot2 boot stub drops the CPU here in long mode with the
//! provisional boot page tables loaded and the two hand-off statics in
//! `boot` filled in. `kmain` brings the subsystems up leaves-first and
//! then idles; from that point on the kernel only runs inside traps.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use core::panic::PanicInfo;

#[cfg(target_os = "none")]
use lumen_kernel::{arch, boot, klog, mm, println, sched, timer};

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    arch::disable_interrupts();
    arch::halt_loop();
}

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn kmain() -> ! {
    klog::init();
    println!("Lumen microkernel v{}", env!("CARGO_PKG_VERSION"));

    // The trap exit path needs a register snapshot to exist before the
    // first trap can possibly fire.
    sched::init();

    // Segments, IDT, PIC remap, SSE, SYSCALL MSRs. Interrupts stay off.
    arch::init();

    // Physical memory, the kernel address space with its temp window, the
    // heap, and finally the free-region index that needs the heap.
    boot::init_physical_memory();
    let layout =
        mm::address_space::init_kernel_space(mm::start_of_free_memory_at_boot());
    mm::address_space::switch_to_kernel_space();
    if let Err(e) = mm::heap::init(layout.heap_start) {
        panic!("kernel heap setup failed: {}", e);
    }
    mm::address_space::finish_kernel_space_init(&layout, mm::heap::KERNEL_HEAP_PAGES);

    timer::init();
    boot::log_modules();
    boot::release_boot_memory_if_no_modules();

    log::info!("kernel initialized; waiting for threads");
    arch::enable_interrupts();

    // The idle flow. The scheduler returns here whenever no thread is
    // awake; interrupts wake us and may switch into a thread on exit.
    arch::halt_loop();
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel only does something when booted; `cargo run` on the host
    // is not that. Tests live in the library crate.
}
