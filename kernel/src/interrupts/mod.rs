//! Trap policy: CPU exceptions and hardware IRQ dispatch.
//!
//! Exceptions either resolve as lazy shared-memory faults, kill the
//! faulting process, or (in the kernel) stop the machine with a dump.
//! Hardware IRQs turn into messages for the driver processes that bound
//! them; IRQ 0 is the scheduler heartbeat.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;

use spin::Mutex;

use crate::{
    arch::{self, context},
    ipc, mm,
    process::{self, Process},
    sched, timer,
};

const IRQ_LINES: usize = 16;
const PAGE_FAULT_VECTOR: u64 = 14;

/// How a bound IRQ is reported to its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMethod {
    /// One empty message per interrupt.
    Notify,
    /// Drain a status/data port pair: while `status_port & mask == mask`,
    /// read a data byte; pack the (status, data) byte pairs into 5-word
    /// messages, one per 40 bytes captured.
    DrainPort {
        status_port: u16,
        read_port: u16,
        status_mask: u8,
    },
}

/// A driver-registered message to fire on an IRQ.
#[derive(Debug, Clone, Copy)]
pub struct InterruptBinding {
    pub pid: u64,
    pub message_id: u64,
    pub method: BindingMethod,
}

static BINDINGS: Mutex<[Vec<InterruptBinding>; IRQ_LINES]> =
    Mutex::new([const { Vec::new() }; IRQ_LINES]);

/// Bind `message_id` of `process` to an IRQ line. `method` selects plain
/// notify (0) or the port-drain pattern (1), whose ports and mask are
/// packed into `param`: bits 0..16 status port, 16..32 read port, 32..40
/// mask.
pub fn register_message_on_interrupt(
    interrupt: u64,
    process: &Arc<Process>,
    message_id: u64,
    method: u64,
    param: u64,
) {
    if !process.is_driver {
        return;
    }
    let irq = (interrupt & 0xF) as usize;

    let method = match method {
        0 => BindingMethod::Notify,
        1 => {
            let status_mask = ((param >> 32) & 0xFF) as u8;
            if status_mask == 0 {
                // A zero mask would match forever.
                return;
            }
            BindingMethod::DrainPort {
                status_port: (param & 0xFFFF) as u16,
                read_port: ((param >> 16) & 0xFFFF) as u16,
                status_mask,
            }
        }
        _ => return,
    };

    BINDINGS.lock()[irq].push(InterruptBinding {
        pid: process.pid.0,
        message_id,
        method,
    });
    process
        .interrupt_bindings
        .lock()
        .push((irq as u8, message_id));
}

/// Remove every binding of `(process, message_id)` on an IRQ line.
pub fn unregister_message_on_interrupt(interrupt: u64, process: &Arc<Process>, message_id: u64) {
    if !process.is_driver {
        return;
    }
    let irq = (interrupt & 0xF) as usize;
    BINDINGS.lock()[irq]
        .retain(|binding| !(binding.pid == process.pid.0 && binding.message_id == message_id));
    process
        .interrupt_bindings
        .lock()
        .retain(|&(i, mid)| !(i == irq as u8 && mid == message_id));
}

/// Remove every binding of a dying process.
pub fn unregister_all_for_process(process: &Arc<Process>) {
    let owned = core::mem::take(&mut *process.interrupt_bindings.lock());
    if owned.is_empty() {
        return;
    }
    let mut bindings = BINDINGS.lock();
    for line in bindings.iter_mut() {
        line.retain(|binding| binding.pid != process.pid.0);
    }
}

/// Fire one binding.
fn handle_binding(binding: &InterruptBinding) {
    let receiver = match process::process_from_pid(process::ProcessId(binding.pid)) {
        Some(receiver) => receiver,
        None => return,
    };

    match binding.method {
        BindingMethod::Notify => {
            ipc::send_kernel_message_to_process(&receiver, binding.message_id, 0, 0, 0, 0, 0);
        }
        BindingMethod::DrainPort {
            status_port,
            read_port,
            status_mask,
        } => {
            // Drain (status, data) byte pairs into the five payload words,
            // flushing one message per full buffer and one for the tail.
            let mut buffer = [0u8; 40];
            let mut bytes_read = 0usize;

            loop {
                let status = arch::x86_64::port::read_io_byte(status_port);
                if status & status_mask != status_mask {
                    break;
                }
                buffer[bytes_read] = status;
                buffer[bytes_read + 1] = arch::x86_64::port::read_io_byte(read_port);
                bytes_read += 2;

                if bytes_read == buffer.len() {
                    send_drained_bytes(&receiver, binding.message_id, &buffer);
                    buffer = [0u8; 40];
                    bytes_read = 0;
                }
            }

            if bytes_read > 0 {
                send_drained_bytes(&receiver, binding.message_id, &buffer);
            }
        }
    }
}

fn send_drained_bytes(receiver: &Arc<Process>, message_id: u64, buffer: &[u8; 40]) {
    let mut words = [0u64; 5];
    for (i, word) in words.iter_mut().enumerate() {
        let mut chunk = [0u8; 8];
        chunk.copy_from_slice(&buffer[i * 8..i * 8 + 8]);
        *word = u64::from_le_bytes(chunk);
    }
    ipc::send_kernel_message_to_process(
        receiver, message_id, words[0], words[1], words[2], words[3], words[4],
    );
}

/// Entry from the trap stubs: exceptions below 32, IRQs at 32..48.
pub fn handle_trap(vector: u64, error_code: u64, cr2: u64) {
    if vector < 32 {
        handle_exception(vector, error_code, cr2);
    } else {
        handle_irq((vector - 32) as u8);
    }
}

fn handle_irq(irq: u8) {
    if irq == 0 {
        // The heartbeat: clock, due timer events, then rotate.
        timer::handle_tick();
        sched::schedule_next_thread();
    } else {
        let bindings = BINDINGS.lock()[irq as usize].clone();
        for binding in &bindings {
            handle_binding(binding);
        }
    }

    arch::x86_64::pic::end_of_interrupt(irq);

    // The interrupt may have woken a thread while the CPU idled; if so,
    // return into it instead of the HLT loop.
    sched::schedule_thread_if_idle();
}

fn exception_name(vector: u64) -> &'static str {
    match vector {
        0 => "Division By Zero",
        1 => "Debug",
        2 => "Non Maskable Interrupt",
        3 => "Breakpoint",
        4 => "Into Detected Overflow",
        5 => "Out of Bounds",
        6 => "Invalid Opcode",
        7 => "No Coprocessor",
        8 => "Double Fault",
        9 => "Coprocessor Segment",
        10 => "Bad TSS",
        11 => "Segment Not Present",
        12 => "Stack Fault",
        13 => "General Protection Fault",
        14 => "Page Fault",
        16 => "Coprocessor Fault",
        17 => "Alignment Check",
        18 => "Machine Check",
        19 => "SIMD Floating Point",
        _ => "Unknown",
    }
}

/// Dump the interrupted register state (the print-regs debug syscall and
/// the exception path share this).
pub fn dump_current_registers() {
    // SAFETY: the snapshot was just written by the trap stub and nothing
    // mutates it while this handler runs.
    let regs = unsafe { *context::current_registers() };
    crate::println!(
        "  rip={:#018x} rsp={:#018x} rbp={:#018x} rflags={:#x}",
        regs.rip,
        regs.rsp,
        regs.rbp,
        regs.rflags
    );
    crate::println!(
        "  rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
        regs.rax,
        regs.rbx,
        regs.rcx,
        regs.rdx
    );
    crate::println!(
        "  rsi={:#018x} rdi={:#018x} r8 ={:#018x} r9 ={:#018x}",
        regs.rsi,
        regs.rdi,
        regs.r8,
        regs.r9
    );
    crate::println!(
        "  r10={:#018x} r11={:#018x} r12={:#018x} r13={:#018x}",
        regs.r10,
        regs.r11,
        regs.r12,
        regs.r13
    );
    crate::println!(
        "  r14={:#018x} r15={:#018x} cs={:#x} ss={:#x}",
        regs.r14,
        regs.r15,
        regs.cs,
        regs.ss
    );
    dump_stack_window(regs.rsp);
}

/// Print the top words of the interrupted stack, reading through the
/// owning address space so an unmapped stack cannot fault the kernel.
fn dump_stack_window(rsp: u64) {
    const WORDS: u64 = 8;

    let process = match sched::running_thread().and_then(|t| t.process.upgrade()) {
        Some(process) => process,
        None => return,
    };
    let space = process.address_space.lock();

    crate::println!("  stack:");
    for i in 0..WORDS {
        let address = match rsp.checked_add(i * 8) {
            Some(address) => address,
            None => break,
        };
        let page = mm::round_down_to_page(address);
        let phys = match space.translate(page, false) {
            Some(phys) => phys,
            None => break,
        };
        // SAFETY: the frame is mapped read-only through a scratch slot for
        // the duration of this read.
        let value = unsafe {
            let ptr = crate::mm::temp_map::map(phys, 7).add((address - page) as usize);
            (ptr as *const u64).read_unaligned()
        };
        crate::println!("    [{:#018x}] {:#018x}", address, value);
    }
}

fn handle_exception(vector: u64, error_code: u64, cr2: u64) {
    // Lazy shared-memory faults resolve without anyone noticing.
    if vector == PAGE_FAULT_VECTOR
        && sched::running_thread().is_some()
        && ipc::shared_memory::handle_page_fault(cr2)
    {
        return;
    }

    let running = sched::running_thread();
    // SAFETY: read-only peek at the snapshot the stub just filled.
    let faulting_rip = unsafe { (*context::current_registers()).rip };
    let in_kernel = running.is_none() || mm::is_kernel_address(faulting_rip);

    crate::println!();
    match &running {
        Some(thread) if !in_kernel => {
            let name = thread
                .process
                .upgrade()
                .map(|p| p.name)
                .unwrap_or_else(|| process::ProcessName::from_str("?"));
            let pid = thread
                .process
                .upgrade()
                .map(|p| p.pid.0)
                .unwrap_or_default();
            crate::println!(
                "Exception: {} ({}) by PID {} ({}) in TID {}",
                exception_name(vector),
                vector,
                pid,
                name,
                thread.id
            );
        }
        _ => {
            crate::println!("Exception: {} ({}) in kernel", exception_name(vector), vector);
        }
    }
    if vector == PAGE_FAULT_VECTOR {
        crate::println!("  while accessing {:#x}", cr2);
    }
    crate::println!("  error code {}", error_code);
    dump_current_registers();

    if in_kernel {
        // A kernel fault is unrecoverable; stop with the dump on the
        // console.
        arch::disable_interrupts();
        arch::halt_loop();
    }

    // A faulting user process dies; everyone else keeps running.
    if vector == PAGE_FAULT_VECTOR {
        if let Some(thread) = &running {
            if let Some(process) = thread.process.upgrade() {
                process.address_space.lock().log_free_ranges();
            }
        }
    }
    if let Some(thread) = running {
        if let Some(process) = thread.process.upgrade() {
            process::destroy_process(&process);
        }
    }
}
