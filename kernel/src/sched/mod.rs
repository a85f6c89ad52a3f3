//! Round-robin scheduler.
//!
//! Single CPU, preemptive in user mode via the timer IRQ, cooperative in
//! the kernel (handlers run to completion). The scheduler keeps a circular
//! order of awake threads and a `running_thread` that is `None` while the
//! system idles in the kmain HLT loop.
//!
//! A context switch never happens "now": handlers retarget the snapshot
//! pointer the trap exit path restores from, so the switch takes effect on
//! the way back to user mode.

use alloc::{collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::{
    arch::context::{self, Registers},
    process::Thread,
};

/// Order-preserving queue of awake threads. Separated from the globals so
/// the rotation logic is testable with plain values.
pub struct RunQueue<T> {
    items: VecDeque<T>,
}

/// Identity for queue membership. `Arc<Thread>` compares by pointer.
pub trait QueueItem: Clone {
    fn same(&self, other: &Self) -> bool;
}

impl QueueItem for Arc<Thread> {
    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

impl<T: QueueItem> RunQueue<T> {
    pub const fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn remove(&mut self, item: &T) {
        if let Some(pos) = self.items.iter().position(|t| t.same(item)) {
            self.items.remove(pos);
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.iter().any(|t| t.same(item))
    }

    pub fn first(&self) -> Option<T> {
        self.items.front().cloned()
    }

    /// The item after `item` in insertion order, or `None` at the end of
    /// the line (the caller wraps to `first`).
    pub fn next_after(&self, item: &T) -> Option<T> {
        let pos = self.items.iter().position(|t| t.same(item))?;
        self.items.get(pos + 1).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

impl<T: QueueItem> Default for RunQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

static AWAKE_THREADS: Mutex<RunQueue<Arc<Thread>>> = Mutex::new(RunQueue::new());
static RUNNING_THREAD: Mutex<Option<Arc<Thread>>> = Mutex::new(None);

/// Register snapshot of the idle flow (the kmain HLT loop). Restored when
/// no thread is awake.
static IDLE_REGISTERS: Mutex<Registers> = Mutex::new(Registers {
    r15: 0,
    r14: 0,
    r13: 0,
    r12: 0,
    r11: 0,
    r10: 0,
    r9: 0,
    r8: 0,
    rsi: 0,
    rdx: 0,
    rcx: 0,
    rbx: 0,
    rax: 0,
    rdi: 0,
    rbp: 0,
    rip: 0,
    cs: 0,
    rflags: 0,
    rsp: 0,
    ss: 0,
});

/// Cycle count at the last context switch, for the profiler.
static LAST_SWITCH_CYCLES: AtomicU64 = AtomicU64::new(0);

/// Point the trap exit path at the idle snapshot; the first trap taken
/// from the boot flow fills it in.
pub fn init() {
    context::set_current_registers(IDLE_REGISTERS.as_mut_ptr());
    LAST_SWITCH_CYCLES.store(context::read_cycle_counter(), Ordering::Relaxed);
}

/// The thread whose registers are live on the CPU, or `None` while idle.
pub fn running_thread() -> Option<Arc<Thread>> {
    RUNNING_THREAD.lock().clone()
}

/// Credit the outgoing thread's process with the cycles it just consumed,
/// if it is being profiled.
fn account_cycles(outgoing: &Arc<Thread>) {
    let now = context::read_cycle_counter();
    let last = LAST_SWITCH_CYCLES.swap(now, Ordering::Relaxed);
    if let Some(process) = outgoing.process.upgrade() {
        if process.profiling_enabled.load(Ordering::Relaxed) > 0 {
            process
                .profiled_cycles
                .fetch_add(now.saturating_sub(last), Ordering::Relaxed);
        }
    }
}

/// Mark a thread awake and append it to the circular order. No-op if it is
/// already awake.
pub fn schedule_thread(thread: &Arc<Thread>) {
    if thread.awake.swap(true, Ordering::AcqRel) {
        return;
    }
    AWAKE_THREADS.lock().push_back(thread.clone());
}

/// Take a thread off the awake order. If it is the running thread, a
/// successor is picked first; when it is the only awake thread it may get
/// re-selected, so the step repeats after removal.
pub fn unschedule_thread(thread: &Arc<Thread>) {
    if !thread.awake.load(Ordering::Acquire) {
        return;
    }

    let is_running = running_thread().is_some_and(|t| Arc::ptr_eq(&t, thread));
    if is_running {
        schedule_next_thread();
    }
    AWAKE_THREADS.lock().remove(thread);
    thread.awake.store(false, Ordering::Release);
    // The rotation above may have landed back on this thread if nothing
    // else was awake; now that it is off the list, rotate again.
    if running_thread().is_some_and(|t| Arc::ptr_eq(&t, thread)) {
        schedule_next_thread();
    }
}

/// Rotate to the next awake thread (or idle) and arrange for the trap
/// return path to restore its context.
pub fn schedule_next_thread() {
    let outgoing = running_thread();

    let next = match &outgoing {
        Some(current) => {
            if current.uses_fpu.load(Ordering::Relaxed) {
                context::fxsave(&mut current.fpu.lock());
            }
            account_cycles(current);
            let queue = AWAKE_THREADS.lock();
            queue.next_after(current).or_else(|| queue.first())
        }
        None => AWAKE_THREADS.lock().first(),
    };

    let next = match next {
        Some(next) => next,
        None => {
            // Nothing awake: return to the idle HLT loop in the kernel's
            // own address space.
            *RUNNING_THREAD.lock() = None;
            context::set_current_registers(IDLE_REGISTERS.as_mut_ptr());
            crate::mm::address_space::switch_to_kernel_space();
            return;
        }
    };

    let process = match next.process.upgrade() {
        Some(process) => process,
        None => {
            // The owning process died under us; drop the stale entry and
            // try again.
            AWAKE_THREADS.lock().remove(&next);
            return schedule_next_thread();
        }
    };

    next.time_slices.fetch_add(1, Ordering::Relaxed);
    *RUNNING_THREAD.lock() = Some(next.clone());

    process.address_space.lock().switch_to();
    if next.uses_fpu.load(Ordering::Relaxed) {
        context::fxrstor(&next.fpu.lock());
    }
    context::write_fs_base(next.fs_base.load(Ordering::Acquire));
    context::set_current_registers(next.regs.as_mut_ptr());
}

/// If the CPU is idle and a thread became runnable (an interrupt woke
/// one), switch into it on the way out of the interrupt.
pub fn schedule_thread_if_idle() {
    if running_thread().is_none() && !AWAKE_THREADS.lock().is_empty() {
        schedule_next_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl QueueItem for u32 {
        fn same(&self, other: &Self) -> bool {
            self == other
        }
    }

    #[test]
    fn rotation_preserves_insertion_order() {
        let mut queue: RunQueue<u32> = RunQueue::new();
        queue.push_back(1);
        queue.push_back(2);
        queue.push_back(3);

        assert_eq!(queue.first(), Some(1));
        assert_eq!(queue.next_after(&1), Some(2));
        assert_eq!(queue.next_after(&2), Some(3));
        // End of the line: caller wraps to first.
        assert_eq!(queue.next_after(&3), None);
        assert_eq!(queue.first(), Some(1));
    }

    #[test]
    fn remove_keeps_relative_order() {
        let mut queue: RunQueue<u32> = RunQueue::new();
        for t in [1, 2, 3, 4] {
            queue.push_back(t);
        }
        queue.remove(&2);
        assert_eq!(queue.next_after(&1), Some(3));
        assert_eq!(queue.next_after(&3), Some(4));
        assert_eq!(queue.len(), 3);
        assert!(!queue.contains(&2));
    }

    #[test]
    fn successor_of_sole_item_wraps_to_itself() {
        // The unschedule subtlety: a thread scheduling itself out while it
        // is the only awake thread gets re-selected via first().
        let mut queue: RunQueue<u32> = RunQueue::new();
        queue.push_back(7);
        assert_eq!(queue.next_after(&7), None);
        assert_eq!(queue.first(), Some(7));
        queue.remove(&7);
        assert!(queue.is_empty());
        assert_eq!(queue.first(), None);
    }

    #[test]
    fn removing_missing_item_is_noop() {
        let mut queue: RunQueue<u32> = RunQueue::new();
        queue.push_back(1);
        queue.remove(&9);
        assert_eq!(queue.len(), 1);
    }
}
