//! x86-64 CPU bring-up and glue.

pub mod context;
pub mod gdt;
pub mod pic;
pub mod port;
pub mod trap;

/// Set up the CPU for kernel operation: segments, traps, the legacy PIC
/// remap, SSE state saving, and the SYSCALL MSRs. Interrupts stay disabled;
/// `kmain` enables them once every subsystem is ready.
pub fn init() {
    gdt::init();
    trap::init_idt();
    pic::init();
    enable_sse();
    init_syscall_msrs();
}

/// Enable SSE so user code (and `fxsave`/`fxrstor`) work: clear CR0.EM,
/// set CR0.MP, and turn on CR4.OSFXSR / CR4.OSXMMEXCPT.
fn enable_sse() {
    #[cfg(target_os = "none")]
    // SAFETY: standard SSE enable sequence during single-flow boot.
    unsafe {
        use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};
        let mut cr0 = Cr0::read();
        cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
        cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
        Cr0::write(cr0);
        let mut cr4 = Cr4::read();
        cr4.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
        Cr4::write(cr4);
    }
}

/// Program the SYSCALL entry: STAR selectors, LSTAR entry point, and an
/// FMASK that clears IF so system calls run with interrupts disabled.
fn init_syscall_msrs() {
    #[cfg(target_os = "none")]
    // SAFETY: selectors match the GDT layout; the entry stub expects the
    // register state SYSCALL provides.
    unsafe {
        use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
        use x86_64::registers::rflags::RFlags;
        use x86_64::VirtAddr;

        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
        Star::write(
            gdt::user_code_selector(),
            gdt::user_data_selector(),
            gdt::kernel_code_selector(),
            gdt::kernel_data_selector(),
        )
        .expect("GDT layout incompatible with SYSCALL");
        LStar::write(VirtAddr::new(trap::syscall_entry as usize as u64));
        SFMask::write(RFlags::INTERRUPT_FLAG);
    }
}

/// Enable interrupts and halt until the next one; the idle loop of kmain.
pub fn halt_loop() -> ! {
    loop {
        #[cfg(target_os = "none")]
        x86_64::instructions::hlt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

/// Enable hardware interrupts.
pub fn enable_interrupts() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
}

/// Disable hardware interrupts.
pub fn disable_interrupts() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();
}
