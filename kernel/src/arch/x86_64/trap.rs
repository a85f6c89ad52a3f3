//! Trap entry and exit.
//!
//! Every kernel entry (CPU exception, hardware IRQ, SYSCALL) funnels
//! through stubs that save the full register file into the snapshot
//! `CURRENT_REGISTERS` points at, run the Rust handler, and then restore
//! whichever snapshot `CURRENT_REGISTERS` points at afterwards -- the
//! handler may have retargeted it at a different thread, which is how
//! context switches happen.

use core::mem::offset_of;

use lazy_static::lazy_static;
use x86_64::structures::idt::InterruptDescriptorTable;

use super::context::{self, Registers};

// Offsets the assembly uses into `Registers`. `offset_of` keeps them in
// lockstep with the struct definition.
const R_R15: usize = offset_of!(Registers, r15);
const R_R14: usize = offset_of!(Registers, r14);
const R_R13: usize = offset_of!(Registers, r13);
const R_R12: usize = offset_of!(Registers, r12);
const R_R11: usize = offset_of!(Registers, r11);
const R_R10: usize = offset_of!(Registers, r10);
const R_R9: usize = offset_of!(Registers, r9);
const R_R8: usize = offset_of!(Registers, r8);
const R_RSI: usize = offset_of!(Registers, rsi);
const R_RDX: usize = offset_of!(Registers, rdx);
const R_RCX: usize = offset_of!(Registers, rcx);
const R_RBX: usize = offset_of!(Registers, rbx);
const R_RAX: usize = offset_of!(Registers, rax);
const R_RDI: usize = offset_of!(Registers, rdi);
const R_RBP: usize = offset_of!(Registers, rbp);
const R_RIP: usize = offset_of!(Registers, rip);
const R_CS: usize = offset_of!(Registers, cs);
const R_RFLAGS: usize = offset_of!(Registers, rflags);
const R_RSP: usize = offset_of!(Registers, rsp);
const R_SS: usize = offset_of!(Registers, ss);

/// User-mode selectors as SYSCALL/IRET see them (RPL 3).
const USER_CS: u64 = 0x20 | 3;
const USER_SS: u64 = 0x18 | 3;

extern "C" fn trap_rust_handler(vector: u64, error_code: u64, cr2: u64) {
    crate::interrupts::handle_trap(vector, error_code, cr2);
}

extern "C" fn syscall_rust_handler(opcode: u64) {
    crate::syscall::handle(opcode);
}

/// Restore the snapshot `CURRENT_REGISTERS` points at and return to it
/// with `iretq`. Entered by falling out of a trap handler; the snapshot
/// pointer may have been retargeted while the handler ran.
#[unsafe(naked)]
pub extern "C" fn restore_user_context() -> ! {
    core::arch::naked_asm!(
        "mov rbx, qword ptr [rip + {cur}]",
        // Interrupt return frame, from the snapshot.
        "push qword ptr [rbx + {r_ss}]",
        "push qword ptr [rbx + {r_rsp}]",
        "push qword ptr [rbx + {r_rflags}]",
        "push qword ptr [rbx + {r_cs}]",
        "push qword ptr [rbx + {r_rip}]",
        "mov rax, qword ptr [rbx + {r_rax}]",
        "mov rcx, qword ptr [rbx + {r_rcx}]",
        "mov rdx, qword ptr [rbx + {r_rdx}]",
        "mov rsi, qword ptr [rbx + {r_rsi}]",
        "mov rdi, qword ptr [rbx + {r_rdi}]",
        "mov rbp, qword ptr [rbx + {r_rbp}]",
        "mov r8, qword ptr [rbx + {r_r8}]",
        "mov r9, qword ptr [rbx + {r_r9}]",
        "mov r10, qword ptr [rbx + {r_r10}]",
        "mov r11, qword ptr [rbx + {r_r11}]",
        "mov r12, qword ptr [rbx + {r_r12}]",
        "mov r13, qword ptr [rbx + {r_r13}]",
        "mov r14, qword ptr [rbx + {r_r14}]",
        "mov r15, qword ptr [rbx + {r_r15}]",
        "mov rbx, qword ptr [rbx + {r_rbx}]",
        "iretq",
        cur = sym context::CURRENT_REGISTERS,
        r_ss = const R_SS,
        r_rsp = const R_RSP,
        r_rflags = const R_RFLAGS,
        r_cs = const R_CS,
        r_rip = const R_RIP,
        r_rax = const R_RAX,
        r_rcx = const R_RCX,
        r_rdx = const R_RDX,
        r_rsi = const R_RSI,
        r_rdi = const R_RDI,
        r_rbp = const R_RBP,
        r_r8 = const R_R8,
        r_r9 = const R_R9,
        r_r10 = const R_R10,
        r_r11 = const R_R11,
        r_r12 = const R_R12,
        r_r13 = const R_R13,
        r_r14 = const R_R14,
        r_r15 = const R_R15,
        r_rbx = const R_RBX,
    )
}

/// Common trap body. On entry the stack holds, top first: vector, error
/// code (pushed by the CPU or a stub-provided zero), then the interrupt
/// frame. Saves the interrupted state into the current snapshot and calls
/// the Rust handler with `(vector, error_code, cr2)`.
#[unsafe(naked)]
extern "C" fn trap_common() {
    core::arch::naked_asm!(
        "push rbx",
        "mov rbx, qword ptr [rip + {cur}]",
        "mov qword ptr [rbx + {r_rax}], rax",
        "mov qword ptr [rbx + {r_rcx}], rcx",
        "mov qword ptr [rbx + {r_rdx}], rdx",
        "mov qword ptr [rbx + {r_rsi}], rsi",
        "mov qword ptr [rbx + {r_rdi}], rdi",
        "mov qword ptr [rbx + {r_rbp}], rbp",
        "mov qword ptr [rbx + {r_r8}], r8",
        "mov qword ptr [rbx + {r_r9}], r9",
        "mov qword ptr [rbx + {r_r10}], r10",
        "mov qword ptr [rbx + {r_r11}], r11",
        "mov qword ptr [rbx + {r_r12}], r12",
        "mov qword ptr [rbx + {r_r13}], r13",
        "mov qword ptr [rbx + {r_r14}], r14",
        "mov qword ptr [rbx + {r_r15}], r15",
        "pop rax", // interrupted rbx
        "mov qword ptr [rbx + {r_rbx}], rax",
        "pop rsi", // vector
        "pop rdx", // error code
        // Interrupt frame is now on top.
        "mov rax, qword ptr [rsp + 0]",
        "mov qword ptr [rbx + {r_rip}], rax",
        "mov rax, qword ptr [rsp + 8]",
        "mov qword ptr [rbx + {r_cs}], rax",
        "mov rax, qword ptr [rsp + 16]",
        "mov qword ptr [rbx + {r_rflags}], rax",
        "mov rax, qword ptr [rsp + 24]",
        "mov qword ptr [rbx + {r_rsp}], rax",
        "mov rax, qword ptr [rsp + 32]",
        "mov qword ptr [rbx + {r_ss}], rax",
        "mov rdi, rsi",
        "mov rsi, rdx",
        "mov rdx, cr2",
        "cld",
        "sub rsp, 8",
        "call {handler}",
        "jmp {restore}",
        cur = sym context::CURRENT_REGISTERS,
        handler = sym trap_rust_handler,
        restore = sym restore_user_context,
        r_rax = const R_RAX,
        r_rcx = const R_RCX,
        r_rdx = const R_RDX,
        r_rsi = const R_RSI,
        r_rdi = const R_RDI,
        r_rbp = const R_RBP,
        r_r8 = const R_R8,
        r_r9 = const R_R9,
        r_r10 = const R_R10,
        r_r11 = const R_R11,
        r_r12 = const R_R12,
        r_r13 = const R_R13,
        r_r14 = const R_R14,
        r_r15 = const R_R15,
        r_rbx = const R_RBX,
        r_rip = const R_RIP,
        r_cs = const R_CS,
        r_rflags = const R_RFLAGS,
        r_rsp = const R_RSP,
        r_ss = const R_SS,
    )
}

/// SYSCALL entry. The CPU left the return RIP in RCX and RFLAGS in R11;
/// interrupts are masked by FMASK. Switches to the kernel syscall stack,
/// saves the caller into the current snapshot, and dispatches on the
/// opcode in RDI.
#[unsafe(naked)]
pub extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "mov qword ptr [rip + {user_rsp}], rsp",
        "mov rsp, qword ptr [rip + {stack_top}]",
        "push rbx",
        "mov rbx, qword ptr [rip + {cur}]",
        "mov qword ptr [rbx + {r_rax}], rax",
        "mov qword ptr [rbx + {r_rdx}], rdx",
        "mov qword ptr [rbx + {r_rsi}], rsi",
        "mov qword ptr [rbx + {r_rdi}], rdi",
        "mov qword ptr [rbx + {r_rbp}], rbp",
        "mov qword ptr [rbx + {r_r8}], r8",
        "mov qword ptr [rbx + {r_r9}], r9",
        "mov qword ptr [rbx + {r_r10}], r10",
        "mov qword ptr [rbx + {r_r12}], r12",
        "mov qword ptr [rbx + {r_r13}], r13",
        "mov qword ptr [rbx + {r_r14}], r14",
        "mov qword ptr [rbx + {r_r15}], r15",
        // SYSCALL clobbered rcx/r11 with the return state; keep that state
        // in the snapshot so iretq reproduces it exactly.
        "mov qword ptr [rbx + {r_rip}], rcx",
        "mov qword ptr [rbx + {r_rflags}], r11",
        "pop rax", // caller's rbx
        "mov qword ptr [rbx + {r_rbx}], rax",
        "mov rax, qword ptr [rip + {user_rsp}]",
        "mov qword ptr [rbx + {r_rsp}], rax",
        "mov qword ptr [rbx + {r_cs}], {user_cs}",
        "mov qword ptr [rbx + {r_ss}], {user_ss}",
        // Opcode is already in rdi, the first argument register.
        "cld",
        "call {handler}",
        "jmp {restore}",
        user_rsp = sym context::SYSCALL_USER_RSP,
        stack_top = sym context::SYSCALL_STACK_TOP,
        cur = sym context::CURRENT_REGISTERS,
        handler = sym syscall_rust_handler,
        restore = sym restore_user_context,
        user_cs = const USER_CS,
        user_ss = const USER_SS,
        r_rax = const R_RAX,
        r_rdx = const R_RDX,
        r_rsi = const R_RSI,
        r_rdi = const R_RDI,
        r_rbp = const R_RBP,
        r_r8 = const R_R8,
        r_r9 = const R_R9,
        r_r10 = const R_R10,
        r_r12 = const R_R12,
        r_r13 = const R_R13,
        r_r14 = const R_R14,
        r_r15 = const R_R15,
        r_rip = const R_RIP,
        r_rflags = const R_RFLAGS,
        r_rbx = const R_RBX,
        r_rsp = const R_RSP,
        r_cs = const R_CS,
        r_ss = const R_SS,
    )
}

// CPU exception vectors that push an error code; every other stub pushes a
// zero so the common body sees a uniform stack.
macro_rules! trap_stub_no_error {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym trap_common,
            )
        }
    };
}

macro_rules! trap_stub_with_error {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            core::arch::naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym trap_common,
            )
        }
    };
}

trap_stub_no_error!(exc0, 0);
trap_stub_no_error!(exc1, 1);
trap_stub_no_error!(exc2, 2);
trap_stub_no_error!(exc3, 3);
trap_stub_no_error!(exc4, 4);
trap_stub_no_error!(exc5, 5);
trap_stub_no_error!(exc6, 6);
trap_stub_no_error!(exc7, 7);
trap_stub_with_error!(exc8, 8);
trap_stub_no_error!(exc9, 9);
trap_stub_with_error!(exc10, 10);
trap_stub_with_error!(exc11, 11);
trap_stub_with_error!(exc12, 12);
trap_stub_with_error!(exc13, 13);
trap_stub_with_error!(exc14, 14);
trap_stub_no_error!(exc15, 15);
trap_stub_no_error!(exc16, 16);
trap_stub_with_error!(exc17, 17);
trap_stub_no_error!(exc18, 18);
trap_stub_no_error!(exc19, 19);
trap_stub_no_error!(exc20, 20);
trap_stub_with_error!(exc21, 21);
trap_stub_no_error!(irq0, 32);
trap_stub_no_error!(irq1, 33);
trap_stub_no_error!(irq2, 34);
trap_stub_no_error!(irq3, 35);
trap_stub_no_error!(irq4, 36);
trap_stub_no_error!(irq5, 37);
trap_stub_no_error!(irq6, 38);
trap_stub_no_error!(irq7, 39);
trap_stub_no_error!(irq8, 40);
trap_stub_no_error!(irq9, 41);
trap_stub_no_error!(irq10, 42);
trap_stub_no_error!(irq11, 43);
trap_stub_no_error!(irq12, 44);
trap_stub_no_error!(irq13, 45);
trap_stub_no_error!(irq14, 46);
trap_stub_no_error!(irq15, 47);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        use x86_64::VirtAddr;

        let mut idt = InterruptDescriptorTable::new();
        // SAFETY: every stub saves and restores full state and returns via
        // iretq, which is the contract set_handler_addr requires.
        unsafe {
            idt.divide_error.set_handler_addr(VirtAddr::new(exc0 as usize as u64));
            idt.debug.set_handler_addr(VirtAddr::new(exc1 as usize as u64));
            idt.non_maskable_interrupt
                .set_handler_addr(VirtAddr::new(exc2 as usize as u64));
            idt.breakpoint.set_handler_addr(VirtAddr::new(exc3 as usize as u64));
            idt.overflow.set_handler_addr(VirtAddr::new(exc4 as usize as u64));
            idt.bound_range_exceeded
                .set_handler_addr(VirtAddr::new(exc5 as usize as u64));
            idt.invalid_opcode.set_handler_addr(VirtAddr::new(exc6 as usize as u64));
            idt.device_not_available
                .set_handler_addr(VirtAddr::new(exc7 as usize as u64));
            idt.double_fault.set_handler_addr(VirtAddr::new(exc8 as usize as u64));
            idt[9].set_handler_addr(VirtAddr::new(exc9 as usize as u64));
            idt.invalid_tss.set_handler_addr(VirtAddr::new(exc10 as usize as u64));
            idt.segment_not_present
                .set_handler_addr(VirtAddr::new(exc11 as usize as u64));
            idt.stack_segment_fault
                .set_handler_addr(VirtAddr::new(exc12 as usize as u64));
            idt.general_protection_fault
                .set_handler_addr(VirtAddr::new(exc13 as usize as u64));
            idt.page_fault.set_handler_addr(VirtAddr::new(exc14 as usize as u64));
            idt.x87_floating_point
                .set_handler_addr(VirtAddr::new(exc16 as usize as u64));
            idt.alignment_check.set_handler_addr(VirtAddr::new(exc17 as usize as u64));
            idt.machine_check.set_handler_addr(VirtAddr::new(exc18 as usize as u64));
            idt.simd_floating_point
                .set_handler_addr(VirtAddr::new(exc19 as usize as u64));
            idt.virtualization.set_handler_addr(VirtAddr::new(exc20 as usize as u64));
            idt.cp_protection_exception
                .set_handler_addr(VirtAddr::new(exc21 as usize as u64));
            // Vector 15 is reserved; its stub exists only so the table of
            // stubs stays dense.
            let _ = exc15;

            let irq_stubs: [extern "C" fn(); 16] = [
                irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11,
                irq12, irq13, irq14, irq15,
            ];
            for (i, stub) in irq_stubs.iter().enumerate() {
                idt[32 + i as u8].set_handler_addr(VirtAddr::new(*stub as usize as u64));
            }
        }
        idt
    };
}

/// Install the IDT and the syscall kernel stack.
pub fn init_idt() {
    context::init_syscall_stack();
    #[cfg(target_os = "none")]
    IDT.load();
    #[cfg(not(target_os = "none"))]
    let _ = &*IDT;
}
