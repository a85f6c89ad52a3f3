//! The programmable interval timer: preemption heartbeat, microsecond
//! clock, and the timer-event queue behind the send-message-at-timestamp
//! surface.

use alloc::{collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::process::ProcessId;

/// Tick rate the PIT is programmed to.
pub const TIMER_HZ: u64 = 1000;

/// Microseconds that pass per tick.
const MICROSECONDS_PER_TICK: u64 = 1_000_000 / TIMER_HZ;

/// The PIT's input clock.
const PIT_FREQUENCY_HZ: u64 = 1_193_182;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// A message to deliver when the clock reaches `timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub pid: ProcessId,
    pub message_id: u64,
    pub timestamp: u64,
}

/// Pending timer events ordered by timestamp. The sequence number keeps
/// same-timestamp events distinct and in insertion order.
pub struct TimerQueue {
    events: BTreeMap<(u64, u64), TimerEvent>,
    next_sequence: u64,
}

impl TimerQueue {
    pub const fn new() -> Self {
        Self {
            events: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    pub fn insert(&mut self, event: TimerEvent) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.events.insert((event.timestamp, sequence), event);
    }

    /// Remove and return every event due at or before `now`, in order.
    pub fn pop_due(&mut self, now: u64) -> Vec<TimerEvent> {
        let mut due = Vec::new();
        while let Some((&key, event)) = self.events.iter().next() {
            if event.timestamp > now {
                break;
            }
            due.push(*event);
            self.events.remove(&key);
        }
        due
    }

    /// Drop every event a dying process scheduled.
    pub fn cancel_for_process(&mut self, pid: ProcessId) {
        self.events.retain(|_, event| event.pid != pid);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

static TIMER_QUEUE: Mutex<TimerQueue> = Mutex::new(TimerQueue::new());

/// Program the PIT to [`TIMER_HZ`] in rate-generator mode.
pub fn init() {
    let divisor = (PIT_FREQUENCY_HZ / TIMER_HZ) as u16;
    crate::arch::x86_64::port::write_io_byte(0x43, 0x36);
    crate::arch::x86_64::port::write_io_byte(0x40, (divisor & 0xFF) as u8);
    crate::arch::x86_64::port::write_io_byte(0x40, (divisor >> 8) as u8);
    log::info!("timer: PIT programmed to {} Hz", TIMER_HZ);
}

/// Microseconds since the kernel started.
pub fn current_timestamp_micros() -> u64 {
    TICKS.load(Ordering::Relaxed) * MICROSECONDS_PER_TICK
}

/// One timer IRQ: advance the clock and fire every due event. The caller
/// rotates the scheduler afterwards.
pub fn handle_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    let now = current_timestamp_micros();

    let due = TIMER_QUEUE.lock().pop_due(now);
    for event in due {
        if let Some(receiver) = crate::process::process_from_pid(event.pid) {
            crate::ipc::send_kernel_message_to_process(
                &receiver,
                event.message_id,
                0,
                0,
                0,
                0,
                0,
            );
        }
    }
}

/// Deliver `message_id` to the process at (or as soon after as the tick
/// granularity allows) `timestamp` microseconds since boot.
pub fn send_message_at(pid: ProcessId, timestamp: u64, message_id: u64) {
    TIMER_QUEUE.lock().insert(TimerEvent {
        pid,
        message_id,
        timestamp,
    });
}

/// Cancel all timer events scheduled for a process.
pub fn cancel_for_process(pid: ProcessId) {
    TIMER_QUEUE.lock().cancel_for_process(pid);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(pid: u64, mid: u64, ts: u64) -> TimerEvent {
        TimerEvent {
            pid: ProcessId(pid),
            message_id: mid,
            timestamp: ts,
        }
    }

    #[test]
    fn events_fire_in_timestamp_order() {
        let mut queue = TimerQueue::new();
        queue.insert(event(1, 10, 300));
        queue.insert(event(1, 11, 100));
        queue.insert(event(2, 12, 200));

        assert!(queue.pop_due(50).is_empty());
        let due = queue.pop_due(250);
        let mids: Vec<u64> = due.iter().map(|e| e.message_id).collect();
        assert_eq!(mids, alloc::vec![11, 12]);
        assert_eq!(queue.len(), 1);

        let due = queue.pop_due(1000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message_id, 10);
        assert!(queue.is_empty());
    }

    #[test]
    fn same_timestamp_events_keep_insertion_order() {
        let mut queue = TimerQueue::new();
        queue.insert(event(1, 1, 100));
        queue.insert(event(1, 2, 100));
        queue.insert(event(1, 3, 100));

        let mids: Vec<u64> = queue.pop_due(100).iter().map(|e| e.message_id).collect();
        assert_eq!(mids, alloc::vec![1, 2, 3]);
    }

    #[test]
    fn cancel_removes_only_that_process() {
        let mut queue = TimerQueue::new();
        queue.insert(event(1, 1, 100));
        queue.insert(event(2, 2, 100));
        queue.insert(event(1, 3, 200));

        queue.cancel_for_process(ProcessId(1));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_due(1000)[0].pid, ProcessId(2));
    }

    #[test]
    fn due_boundary_is_inclusive() {
        let mut queue = TimerQueue::new();
        queue.insert(event(1, 1, 100));
        assert_eq!(queue.pop_due(100).len(), 1);
    }
}
