//! Thread CPU context: the register snapshot traded between traps, the
//! FXSAVE area, and the small pieces of state the scheduler swaps on a
//! context switch.

use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// A thread's registers. The trap and syscall stubs in `trap.rs` read and
/// write this layout by offset; keep it binary-compatible with them.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Storage for the FPU/SSE registers. FXSAVE demands 16-byte alignment.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FpuState(pub [u8; 512]);

impl Default for FpuState {
    fn default() -> Self {
        Self([0; 512])
    }
}

/// Pointer to the register snapshot the trap stubs save into and restore
/// from. The scheduler retargets it on every context switch; while the
/// system idles it points at the idle snapshot.
pub static CURRENT_REGISTERS: AtomicPtr<Registers> = AtomicPtr::new(core::ptr::null_mut());

/// Top of the kernel stack the SYSCALL entry stub switches to.
pub static SYSCALL_STACK_TOP: AtomicU64 = AtomicU64::new(0);

/// One-word scratch for the user RSP during SYSCALL entry. A single cell
/// suffices: system calls cannot nest (interrupts are masked by FMASK).
pub static SYSCALL_USER_RSP: AtomicU64 = AtomicU64::new(0);

pub fn set_current_registers(regs: *mut Registers) {
    CURRENT_REGISTERS.store(regs, Ordering::Release);
}

pub fn current_registers() -> *mut Registers {
    CURRENT_REGISTERS.load(Ordering::Acquire)
}

/// Save the FPU/SSE state of the outgoing thread.
pub fn fxsave(state: &mut FpuState) {
    #[cfg(target_os = "none")]
    // SAFETY: the area is 512 bytes and 16-byte aligned by construction.
    unsafe {
        core::arch::asm!("fxsave64 [{}]", in(reg) state.0.as_mut_ptr(), options(nostack));
    }
    #[cfg(not(target_os = "none"))]
    let _ = state;
}

/// Restore the FPU/SSE state of the incoming thread.
pub fn fxrstor(state: &FpuState) {
    #[cfg(target_os = "none")]
    // SAFETY: the area was filled by fxsave64 (or zeroed at thread
    // creation, which is a valid image).
    unsafe {
        core::arch::asm!("fxrstor64 [{}]", in(reg) state.0.as_ptr(), options(nostack));
    }
    #[cfg(not(target_os = "none"))]
    let _ = state;
}

/// Load a thread's FS segment base (thread-local storage).
pub fn write_fs_base(address: u64) {
    #[cfg(target_os = "none")]
    x86_64::registers::model_specific::FsBase::write(x86_64::VirtAddr::new(address));
    #[cfg(not(target_os = "none"))]
    let _ = address;
}

/// Cycle counter, used by the profiler.
pub fn read_cycle_counter() -> u64 {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: rdtsc has no side effects.
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    0
}

/// Install the static stack the SYSCALL stub switches to.
pub(super) fn init_syscall_stack() {
    const SYSCALL_STACK_SIZE: usize = 32 * 1024;

    #[repr(C, align(16))]
    struct SyscallStack([u8; SYSCALL_STACK_SIZE]);

    static mut SYSCALL_STACK: SyscallStack = SyscallStack([0; SYSCALL_STACK_SIZE]);

    // SAFETY: address-of only; the stack is exclusively the stub's.
    let top = unsafe { core::ptr::addr_of!(SYSCALL_STACK) as u64 } + SYSCALL_STACK_SIZE as u64;
    SYSCALL_STACK_TOP.store(top, Ordering::Release);
}
