//! Processes: protection domains owning an address space, threads, message
//! queues, services, and every other per-domain kernel resource.
//!
//! Processes are kept in a global table keyed by pid. A process is either
//! *creating* (being populated by its parent, unable to run, destroyed with
//! the parent) or *running* (independent lifetime, destroyed explicitly or
//! when its last thread exits).

pub mod thread;

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    ipc::{queue::MessageQueue, shared_memory},
    mm::AddressSpace,
};

pub use thread::{Thread, ThreadId};

/// Process names are 11 machine words (88 bytes), the unit the syscall
/// marshaling moves them in.
pub const PROCESS_NAME_WORDS: usize = 11;
pub const PROCESS_NAME_LENGTH: usize = PROCESS_NAME_WORDS * 8;

/// Process ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bounded process name, stored as the words it is marshaled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessName([u64; PROCESS_NAME_WORDS]);

impl ProcessName {
    pub const fn from_words(words: [u64; PROCESS_NAME_WORDS]) -> Self {
        Self(words)
    }

    pub fn words(&self) -> &[u64; PROCESS_NAME_WORDS] {
        &self.0
    }

    /// Build a name from a string, truncating to the fixed width.
    pub fn from_str(name: &str) -> Self {
        let mut bytes = [0u8; PROCESS_NAME_LENGTH];
        let len = name.len().min(PROCESS_NAME_LENGTH);
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        let mut words = [0u64; PROCESS_NAME_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *word = u64::from_le_bytes(chunk);
        }
        Self(words)
    }

    /// The name bytes up to the first NUL, for diagnostics.
    pub fn bytes(&self) -> [u8; PROCESS_NAME_LENGTH] {
        let mut bytes = [0u8; PROCESS_NAME_LENGTH];
        for (i, word) in self.0.iter().enumerate() {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}

impl core::fmt::Display for ProcessName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let bytes = self.bytes();
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        for &b in &bytes[..len] {
            let c = if b.is_ascii() && !b.is_ascii_control() {
                b as char
            } else {
                '?'
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Being set up by its parent; cannot run and dies with the parent.
    Creating { parent: ProcessId },
    /// Started; independent lifetime.
    Running,
}

/// A subscriber to this process's death.
#[derive(Debug, Clone, Copy)]
pub struct DeathSubscription {
    pub notifyee: ProcessId,
    pub message_id: u64,
}

/// A protection domain.
pub struct Process {
    pub pid: ProcessId,
    pub name: ProcessName,
    /// Drivers may use I/O instructions and bind hardware interrupts.
    pub is_driver: bool,
    pub can_create_processes: bool,
    pub state: Mutex<ProcessState>,
    pub address_space: Mutex<AddressSpace>,

    /// Live threads. The last one leaving destroys the process.
    pub threads: Mutex<Vec<Arc<Thread>>>,
    /// Queued messages waiting to be consumed.
    pub messages: Mutex<MessageQueue>,
    /// Threads parked in sleep-for-message order.
    pub sleeping_for_message: Mutex<alloc::collections::VecDeque<Arc<Thread>>>,

    /// Children still in the creating state.
    pub children: Mutex<Vec<ProcessId>>,
    /// Shared memory regions mapped into this process.
    pub joined_shared_memories: Mutex<Vec<shared_memory::SharedMemoryJoin>>,
    /// Who to tell when this process dies.
    pub death_subscribers: Mutex<Vec<DeathSubscription>>,
    /// Death notifications this process asked for, as (target, message id);
    /// kept for cancellation and cleanup.
    pub watched_targets: Mutex<Vec<(ProcessId, u64)>>,
    /// Interrupt bindings this process registered, as (irq, message id).
    pub interrupt_bindings: Mutex<Vec<(u8, u64)>>,

    /// Nested enable-profiling count.
    pub profiling_enabled: AtomicU64,
    /// Cycles spent executing while profiled.
    pub profiled_cycles: AtomicU64,

    /// Set for the duration of destroy_process so thread teardown does not
    /// re-enter it.
    being_destroyed: AtomicBool,
}

impl Process {
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    pub fn is_creating(&self) -> bool {
        matches!(self.state(), ProcessState::Creating { .. })
    }
}

static PROCESSES: Mutex<BTreeMap<u64, Arc<Process>>> = Mutex::new(BTreeMap::new());
static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Create a process in the given state and link it into the table.
pub fn create_process(
    name: ProcessName,
    is_driver: bool,
    can_create_processes: bool,
    state: ProcessState,
) -> KernelResult<Arc<Process>> {
    let address_space = AddressSpace::new_user()?;
    let pid = ProcessId(NEXT_PID.fetch_add(1, Ordering::Relaxed));

    let process = Arc::new(Process {
        pid,
        name,
        is_driver,
        can_create_processes,
        state: Mutex::new(state),
        address_space: Mutex::new(address_space),
        threads: Mutex::new(Vec::new()),
        messages: Mutex::new(MessageQueue::new()),
        sleeping_for_message: Mutex::new(alloc::collections::VecDeque::new()),
        children: Mutex::new(Vec::new()),
        joined_shared_memories: Mutex::new(Vec::new()),
        death_subscribers: Mutex::new(Vec::new()),
        watched_targets: Mutex::new(Vec::new()),
        interrupt_bindings: Mutex::new(Vec::new()),
        profiling_enabled: AtomicU64::new(0),
        profiled_cycles: AtomicU64::new(0),
        being_destroyed: AtomicBool::new(false),
    });

    PROCESSES.lock().insert(pid.0, process.clone());
    Ok(process)
}

/// The process with this pid, if it is live.
pub fn process_from_pid(pid: ProcessId) -> Option<Arc<Process>> {
    PROCESSES.lock().get(&pid.0).cloned()
}

/// The process with this pid, or the one with the next higher pid.
pub fn process_or_next_from_pid(pid: ProcessId) -> Option<Arc<Process>> {
    PROCESSES
        .lock()
        .range(pid.0..)
        .next()
        .map(|(_, p)| p.clone())
}

/// The next process after `pid` when iterating all processes in id order.
pub fn next_process(pid: ProcessId) -> Option<Arc<Process>> {
    PROCESSES
        .lock()
        .range(pid.0 + 1..)
        .next()
        .map(|(_, p)| p.clone())
}

/// Pids of every live process with this exact name, starting from
/// `min_pid`, in id order.
pub fn pids_with_name(name: &ProcessName, min_pid: ProcessId) -> Vec<ProcessId> {
    PROCESSES
        .lock()
        .range(min_pid.0..)
        .filter(|(_, p)| p.name == *name)
        .map(|(_, p)| p.pid)
        .collect()
}

/// Register a death notification: `notifyee` gets a message with
/// `event_id` when `target` dies.
pub fn notify_on_death(target: &Arc<Process>, notifyee: &Arc<Process>, event_id: u64) {
    target.death_subscribers.lock().push(DeathSubscription {
        notifyee: notifyee.pid,
        message_id: event_id,
    });
    notifyee.watched_targets.lock().push((target.pid, event_id));
}

/// Cancel every death notification `notifyee` registered with `event_id`.
pub fn stop_notifying_on_death(notifyee: &Arc<Process>, event_id: u64) {
    let mut watched = notifyee.watched_targets.lock();
    let mut removed = Vec::new();
    watched.retain(|&(target_pid, mid)| {
        if mid == event_id {
            removed.push(target_pid);
            false
        } else {
            true
        }
    });
    drop(watched);

    for target_pid in removed {
        if let Some(target) = process_from_pid(target_pid) {
            target
                .death_subscribers
                .lock()
                .retain(|s| !(s.notifyee == notifyee.pid && s.message_id == event_id));
        }
    }
}

/// Whether `child` is a creating-state child of `parent`.
pub fn is_child_of(parent: &Arc<Process>, child: &Arc<Process>) -> bool {
    matches!(child.state(), ProcessState::Creating { parent: p } if p == parent.pid)
}

/// Create a child in the creating state. The bitfield carries the letter
/// flags of the module command line: bit 0 driver, bit 1 may create
/// processes.
pub fn create_child_process(
    parent: &Arc<Process>,
    name: ProcessName,
    bitfield: u64,
) -> KernelResult<Arc<Process>> {
    if !parent.can_create_processes {
        return Err(KernelError::PermissionDenied {
            operation: "create child process",
        });
    }
    let child = create_process(
        name,
        bitfield & 1 != 0,
        bitfield & 2 != 0,
        ProcessState::Creating { parent: parent.pid },
    )?;
    parent.children.lock().push(child.pid);
    Ok(child)
}

/// Move a page from the parent into a specific child virtual address. The
/// page leaves the parent regardless of whether the child side succeeds;
/// if the child address is occupied nothing else happens.
pub fn set_child_process_memory_page(
    parent: &Arc<Process>,
    child: &Arc<Process>,
    source_address: u64,
    destination_address: u64,
) {
    if !is_child_of(parent, child) {
        return;
    }

    let mut parent_space = parent.address_space.lock();
    let phys = match parent_space.translate(source_address, true) {
        Some(phys) => phys,
        None => return,
    };
    parent_space.release_pages(source_address, 1);
    drop(parent_space);

    let mut child_space = child.address_space.lock();
    if !child_space.reserve_at(destination_address, 1) {
        // Destination occupied: the page is lost to the parent and its
        // frame goes back to the pool.
        crate::mm::frame_allocator::free(phys);
        return;
    }
    if child_space
        .map_page_at(destination_address, phys, true, true, false)
        .is_err()
    {
        child_space.mark_free(destination_address, 1);
        crate::mm::frame_allocator::free(phys);
    }
}

/// Start a creating child: give it its first thread at `(entry, param)`.
/// From here on the child's lifetime is independent of the parent.
pub fn start_executing_child_process(
    parent: &Arc<Process>,
    child: &Arc<Process>,
    entry_address: u64,
    param: u64,
) {
    if !is_child_of(parent, child) {
        return;
    }
    *child.state.lock() = ProcessState::Running;
    parent.children.lock().retain(|&pid| pid != child.pid);

    match thread::create_thread(child, entry_address, param) {
        Ok(thread) => crate::sched::schedule_thread(&thread),
        Err(e) => {
            log::error!("starting child {} failed: {}", child.pid, e);
            destroy_process(child);
        }
    }
}

/// Destroy a creating-state child explicitly.
pub fn destroy_child_process(parent: &Arc<Process>, child: &Arc<Process>) {
    if !is_child_of(parent, child) {
        return;
    }
    destroy_process(child);
}

/// Tear a process down: threads, services, shared memory joins, timer
/// events, interrupt bindings, subscriptions, children, table entry,
/// address space.
pub fn destroy_process(process: &Arc<Process>) {
    if process.being_destroyed.swap(true, Ordering::AcqRel) {
        return;
    }

    // Threads first; they unschedule themselves and free their stacks.
    thread::destroy_threads_for_process(process, true);

    // Services disappear (with notifications), and this process's own
    // service subscriptions go away.
    let notifications = crate::ipc::registry::with_directory(|directory| {
        directory.remove_process(process.pid.0)
    });
    crate::ipc::registry::dispatch(notifications);

    // Drop shared memory joins.
    shared_memory::leave_all(process);

    // Cancel pending timer events and interrupt bindings.
    crate::timer::cancel_for_process(process.pid);
    crate::interrupts::unregister_all_for_process(process);

    // Fire death notifications.
    let subscribers = core::mem::take(&mut *process.death_subscribers.lock());
    for subscription in subscribers {
        if let Some(notifyee) = process_from_pid(subscription.notifyee) {
            notifyee
                .watched_targets
                .lock()
                .retain(|&(t, mid)| !(t == process.pid && mid == subscription.message_id));
            crate::ipc::send_kernel_message_to_process(
                &notifyee,
                subscription.message_id,
                process.pid.0,
                0,
                0,
                0,
                0,
            );
        }
    }
    // And stop watching others.
    let watched = core::mem::take(&mut *process.watched_targets.lock());
    for (target_pid, event_id) in watched {
        if let Some(target) = process_from_pid(target_pid) {
            target
                .death_subscribers
                .lock()
                .retain(|s| !(s.notifyee == process.pid && s.message_id == event_id));
        }
    }

    // Children still in the creating state die with us; unlink from our
    // parent if we are such a child ourselves.
    let children = core::mem::take(&mut *process.children.lock());
    for child_pid in children {
        if let Some(child) = process_from_pid(child_pid) {
            destroy_process(&child);
        }
    }
    if let ProcessState::Creating { parent } = process.state() {
        if let Some(parent) = process_from_pid(parent) {
            parent.children.lock().retain(|&pid| pid != process.pid);
        }
    }

    PROCESSES.lock().remove(&process.pid.0);

    // Release the address space now rather than waiting for the last Arc:
    // it walks the tables freeing every owned frame.
    process.address_space.lock().release_all();

    log::info!("process {} ({}) destroyed", process.pid, process.name);
}

/// Number of live processes, for diagnostics.
pub fn process_count() -> usize {
    PROCESSES.lock().len()
}
