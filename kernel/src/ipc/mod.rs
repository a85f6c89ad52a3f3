//! Message IPC.
//!
//! Every process owns a bounded FIFO of messages and a list of threads
//! sleeping for one. Sends either wake a sleeper directly (copying the
//! message into its register snapshot) or queue the envelope. A send may
//! also transfer memory pages: the named pages move atomically from the
//! sender's address space into a freshly reserved range of the receiver's.

pub mod queue;
pub mod registry;
pub mod shared_memory;

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::{
    arch::context::Registers,
    mm::{self, PAGE_SIZE},
    process::{self, Process, Thread},
    sched,
};

pub use queue::{Message, MessageQueue, MAX_QUEUED_MESSAGES, NO_MESSAGE_SENTINEL};

/// Status codes a send writes back to the caller's rax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SendStatus {
    Success = 0,
    ProcessDoesntExist = 1,
    OutOfMemory = 2,
    ReceiversQueueIsFull = 3,
}

/// Copy a message into a thread's register snapshot, the shape both poll
/// and wake-from-sleep return it in.
fn load_message_into_registers(message: &Message, regs: &mut Registers) {
    regs.rax = message.message_id;
    regs.rbx = message.sender_pid;
    regs.rdx = message.metadata;
    regs.rsi = message.params[0];
    regs.r8 = message.params[1];
    regs.r9 = message.params[2];
    regs.r10 = message.params[3];
    regs.r12 = message.params[4];
}

/// Hand a message to a receiver whose queue has room: wake a sleeper if
/// one exists, otherwise enqueue.
fn deliver(receiver: &Arc<Process>, message: Message) {
    let sleeper = receiver.sleeping_for_message.lock().pop_front();
    match sleeper {
        None => {
            if receiver.messages.lock().push(message).is_err() {
                // Callers check for room first; losing a message here
                // would be a kernel bug worth shouting about.
                log::error!("message queue of process {} overflowed on delivery", receiver.pid);
            }
        }
        Some(thread) => {
            if !receiver.messages.lock().is_empty() {
                log::warn!("a thread slept for messages while messages were queued");
            }
            if !thread.waiting_for_message.load(Ordering::Acquire) {
                log::warn!("sleeping thread was not marked waiting-for-message");
            }
            load_message_into_registers(&message, &mut thread.regs.lock());
            thread.waiting_for_message.store(false, Ordering::Release);
            sched::schedule_thread(&thread);
        }
    }
}

/// Send a message from the kernel itself. Errors (full queue, dead pid)
/// drop the message; kernel notifications are best effort.
pub fn send_kernel_message_to_process(
    receiver: &Arc<Process>,
    message_id: u64,
    param1: u64,
    param2: u64,
    param3: u64,
    param4: u64,
    param5: u64,
) {
    if !receiver.messages.lock().has_room() {
        return;
    }
    deliver(
        receiver,
        Message {
            message_id,
            sender_pid: 0,
            metadata: 0,
            params: [param1, param2, param3, param4, param5],
        },
    );
}

/// The send syscall: arguments and the status reply both live in the
/// sender's register snapshot.
pub fn send_message_from_thread(sender_thread: &Arc<Thread>) {
    let sender_process = match sender_thread.process.upgrade() {
        Some(process) => process,
        None => return,
    };

    let mut regs = sender_thread.regs.lock();
    let target_pid = process::ProcessId(regs.rbx);

    let receiver = if target_pid == sender_process.pid {
        sender_process.clone()
    } else {
        match process::process_from_pid(target_pid) {
            Some(process) => process,
            None => {
                regs.rax = SendStatus::ProcessDoesntExist as u64;
                return;
            }
        }
    };

    if !receiver.messages.lock().has_room() {
        regs.rax = SendStatus::ReceiversQueueIsFull as u64;
        return;
    }

    let mut message = Message {
        message_id: regs.rax,
        sender_pid: sender_process.pid.0,
        metadata: regs.rdx,
        params: [regs.rsi, regs.r8, regs.r9, regs.r10, regs.r12],
    };

    if message.is_paging_message() && !Arc::ptr_eq(&receiver, &sender_process) {
        // Param 4 names the first page in the sender, param 5 the page
        // count; the pages move to the receiver and param 4 is rewritten
        // to the receiver-side address.
        let pages = regs.r12;
        let mut source = regs.r10;
        if !mm::is_page_aligned(source) {
            log::warn!("send with non-page-aligned source address {:#x}", source);
            source = mm::round_down_to_page(source);
        }

        let destination = match receiver.address_space.lock().reserve_range(pages) {
            Some(destination) => destination,
            None => {
                regs.rax = SendStatus::OutOfMemory as u64;
                return;
            }
        };

        for page in 0..pages {
            let source_page = source + page * PAGE_SIZE as u64;
            let phys = sender_process
                .address_space
                .lock()
                .translate(source_page, true);
            let phys = match phys {
                Some(phys) => phys,
                None => {
                    // A page in the range is unmapped or not owned by the
                    // sender: undo the whole transfer. The sender loses
                    // the range; pages already moved go back to the frame
                    // pool.
                    sender_process
                        .address_space
                        .lock()
                        .release_pages(source, pages);
                    let mut receiver_space = receiver.address_space.lock();
                    receiver_space.free_pages(destination, page);
                    receiver_space
                        .mark_free(destination + page * PAGE_SIZE as u64, pages - page);
                    regs.rax = SendStatus::OutOfMemory as u64;
                    return;
                }
            };

            sender_process
                .address_space
                .lock()
                .release_pages(source_page, 1);
            let mapped = receiver.address_space.lock().map_page_at(
                destination + page * PAGE_SIZE as u64,
                phys,
                true,
                true,
                false,
            );
            if mapped.is_err() {
                log::error!("mapping transferred page into receiver failed");
            }
        }

        message.params[3] = destination;
        message.params[4] = pages;
    }

    regs.rax = SendStatus::Success as u64;
    drop(regs);
    deliver(&receiver, message);
}

/// Non-blocking poll: pop the oldest message into the thread's registers,
/// or return the sentinel id leaving everything else untouched.
pub fn load_next_message_into_thread(thread: &Arc<Thread>) {
    let process = match thread.process.upgrade() {
        Some(process) => process,
        None => return,
    };
    let message = process.messages.lock().pop();
    let mut regs = thread.regs.lock();
    match message {
        None => regs.rax = NO_MESSAGE_SENTINEL,
        Some(message) => load_message_into_registers(&message, &mut regs),
    }
}

/// Sleep the thread until a message arrives. Returns whether the thread is
/// now asleep; `false` means a queued message was delivered immediately.
pub fn sleep_thread_until_message(thread: &Arc<Thread>) -> bool {
    if !thread.awake.load(Ordering::Acquire) || thread.waiting_for_message.load(Ordering::Acquire)
    {
        log::warn!("cannot sleep a thread that is already asleep");
        return false;
    }
    let process = match thread.process.upgrade() {
        Some(process) => process,
        None => return false,
    };

    if !process.messages.lock().is_empty() {
        load_next_message_into_thread(thread);
        return false;
    }

    process.sleeping_for_message.lock().push_back(thread.clone());
    thread.waiting_for_message.store(true, Ordering::Release);
    sched::unschedule_thread(thread);
    true
}
