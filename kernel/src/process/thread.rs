//! Threads: schedulable units inside a process.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::{
    arch::context::{FpuState, Registers},
    error::{KernelError, KernelResult},
    mm::{temp_map, PAGE_SIZE},
    process::Process,
};

/// Number of 4 KiB pages in a thread stack.
pub const STACK_PAGES: u64 = 8;

/// Thread ID type. Ids are globally unique, not reused across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// A sequence of execution inside a process.
pub struct Thread {
    pub id: ThreadId,
    pub process: Weak<Process>,

    /// Register snapshot. Live CPU registers while the thread runs; the
    /// trap stubs write it back on the next kernel entry.
    pub regs: Mutex<Registers>,
    /// FXSAVE area, saved and restored on context switch.
    pub fpu: Mutex<FpuState>,
    pub uses_fpu: AtomicBool,

    /// Base of the thread's stack in its process's address space.
    pub stack: u64,

    pub awake: AtomicBool,
    pub waiting_for_message: AtomicBool,
    /// `(region id, page)` while blocked on an unbacked lazy shared-memory
    /// slot.
    pub waiting_for_shared_page: Mutex<Option<(u64, usize)>>,
    /// Time slices this thread has been given. Partial slices count whole.
    pub time_slices: AtomicU64,

    /// FS segment base (thread-local storage).
    pub fs_base: AtomicU64,
    /// If nonzero, an 8-byte-aligned user address zeroed when the thread
    /// dies (TLS cleanup for user libc).
    pub clear_on_termination: AtomicU64,
}

/// Build the initial register snapshot: entry point, one argument, stack
/// top, user selectors, and flags (interrupts on, CPUID usable, IOPL for
/// drivers).
fn initial_registers(process: &Process, entry_point: u64, param: u64, stack: u64) -> Registers {
    const USER_CS: u64 = 0x20 | 3;
    const USER_SS: u64 = 0x18 | 3;
    const RFLAGS_INTERRUPTS_ENABLED: u64 = 1 << 9;
    const RFLAGS_IOPL_RING3: u64 = (1 << 12) | (1 << 13);
    const RFLAGS_CAN_CPUID: u64 = 1 << 21;

    let mut regs = Registers::default();
    regs.rdi = param;
    regs.rip = entry_point;
    let stack_top = stack + PAGE_SIZE as u64 * STACK_PAGES;
    regs.rsp = stack_top;
    regs.rbp = stack_top;
    regs.cs = USER_CS;
    regs.ss = USER_SS;
    regs.rflags = RFLAGS_INTERRUPTS_ENABLED
        | RFLAGS_CAN_CPUID
        | if process.is_driver { RFLAGS_IOPL_RING3 } else { 0 };
    regs
}

/// Create a thread with a fresh stack. The caller schedules it.
pub fn create_thread(
    process: &Arc<Process>,
    entry_point: u64,
    param: u64,
) -> KernelResult<Arc<Thread>> {
    let stack = process
        .address_space
        .lock()
        .allocate_pages(STACK_PAGES)
        .ok_or(KernelError::OutOfMemory)?;

    let thread = Arc::new(Thread {
        id: ThreadId(NEXT_TID.fetch_add(1, Ordering::Relaxed)),
        process: Arc::downgrade(process),
        regs: Mutex::new(initial_registers(process, entry_point, param, stack)),
        fpu: Mutex::new(FpuState::default()),
        uses_fpu: AtomicBool::new(true),
        stack,
        awake: AtomicBool::new(false),
        waiting_for_message: AtomicBool::new(false),
        waiting_for_shared_page: Mutex::new(None),
        time_slices: AtomicU64::new(0),
        fs_base: AtomicU64::new(0),
        clear_on_termination: AtomicU64::new(0),
    });

    process.threads.lock().push(thread.clone());
    Ok(thread)
}

/// The thread with this id inside `process`.
pub fn thread_from_tid(process: &Arc<Process>, tid: ThreadId) -> Option<Arc<Thread>> {
    process
        .threads
        .lock()
        .iter()
        .find(|t| t.id == tid)
        .cloned()
}

/// Set a thread's FS base, loading it immediately if the thread runs.
pub fn set_thread_segment(thread: &Arc<Thread>, address: u64) {
    thread.fs_base.store(address, Ordering::Release);
    if let Some(running) = crate::sched::running_thread() {
        if Arc::ptr_eq(&running, thread) {
            crate::arch::context::write_fs_base(address);
        }
    }
}

/// Destroy one thread. With `process_being_destroyed` the caller is
/// already tearing the whole process down, so an empty thread list does
/// not trigger process destruction again.
pub fn destroy_thread(thread: &Arc<Thread>, process_being_destroyed: bool) {
    crate::sched::unschedule_thread(thread);

    let process = match thread.process.upgrade() {
        Some(process) => process,
        None => return,
    };

    // Free the stack range and its frames.
    process
        .address_space
        .lock()
        .free_pages(thread.stack, STACK_PAGES);

    if thread.waiting_for_message.load(Ordering::Acquire) {
        process
            .sleeping_for_message
            .lock()
            .retain(|t| !Arc::ptr_eq(t, thread));
        thread.waiting_for_message.store(false, Ordering::Release);
    }

    if thread.waiting_for_shared_page.lock().is_some() {
        crate::ipc::shared_memory::remove_waiter(thread);
    }

    // TLS cleanup: zero the word the thread registered, if it still maps
    // to an owned page.
    let clear_address = thread.clear_on_termination.load(Ordering::Acquire);
    if clear_address != 0 {
        let offset_in_page = clear_address & (PAGE_SIZE as u64 - 1);
        let page = clear_address - offset_in_page;
        if let Some(phys) = process.address_space.lock().translate(page, true) {
            // SAFETY: the frame is mapped for this write only; the address
            // was 8-byte aligned when registered.
            unsafe {
                let ptr = temp_map::map(phys, 7).add(offset_in_page as usize) as *mut u64;
                ptr.write_volatile(0);
            }
        }
    }

    process.threads.lock().retain(|t| !Arc::ptr_eq(t, thread));

    if process.thread_count() == 0 && !process_being_destroyed {
        crate::process::destroy_process(&process);
    }
}

/// Destroy every thread of a process.
pub fn destroy_threads_for_process(process: &Arc<Process>, process_being_destroyed: bool) {
    loop {
        let thread = match process.threads.lock().first() {
            Some(thread) => thread.clone(),
            None => break,
        };
        destroy_thread(&thread, process_being_destroyed);
    }
}
