//! Bounded per-process message queue.

use alloc::collections::VecDeque;

use crate::error::IpcError;

/// Maximum number of messages a process may have queued. Senders observe
/// overflow; the kernel never drops a queued message silently.
pub const MAX_QUEUED_MESSAGES: usize = 1024;

/// The reserved message id returned by a poll on an empty queue.
pub const NO_MESSAGE_SENTINEL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// An envelope: interpreted entirely by the receiver, except for the
/// paging bit of `metadata` which the kernel acts on during send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub message_id: u64,
    pub sender_pid: u64,
    pub metadata: u64,
    pub params: [u64; 5],
}

impl Message {
    /// Whether this message transfers memory pages (metadata bit 0).
    pub fn is_paging_message(&self) -> bool {
        self.metadata & 1 == 1
    }
}

/// FIFO of queued messages, bounded at [`MAX_QUEUED_MESSAGES`].
pub struct MessageQueue {
    messages: VecDeque<Message>,
}

impl MessageQueue {
    pub const fn new() -> Self {
        Self {
            messages: VecDeque::new(),
        }
    }

    /// Whether another message fits.
    pub fn has_room(&self) -> bool {
        self.messages.len() < MAX_QUEUED_MESSAGES
    }

    /// Append a message, or report the queue full.
    pub fn push(&mut self, message: Message) -> Result<(), IpcError> {
        if !self.has_room() {
            return Err(IpcError::QueueFull {
                capacity: MAX_QUEUED_MESSAGES,
            });
        }
        self.messages.push_back(message);
        Ok(())
    }

    /// Pop the oldest message.
    pub fn pop(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: u64) -> Message {
        Message {
            message_id: id,
            sender_pid: 1,
            metadata: 0,
            params: [id, 0, 0, 0, 0],
        }
    }

    #[test]
    fn messages_come_back_in_send_order() {
        let mut queue = MessageQueue::new();
        for id in 0..10 {
            queue.push(message(id)).unwrap();
        }
        for id in 0..10 {
            assert_eq!(queue.pop().unwrap().message_id, id);
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn queue_refuses_message_1025_then_recovers() {
        let mut queue = MessageQueue::new();
        for id in 0..MAX_QUEUED_MESSAGES as u64 {
            queue.push(message(id)).unwrap();
        }
        // The 1025th send is refused and the sender observes it.
        assert_eq!(
            queue.push(message(9999)),
            Err(IpcError::QueueFull {
                capacity: MAX_QUEUED_MESSAGES,
            })
        );
        assert_eq!(queue.len(), MAX_QUEUED_MESSAGES);

        // Draining yields every message in send order, then the queue is
        // usable again.
        for id in 0..MAX_QUEUED_MESSAGES as u64 {
            assert_eq!(queue.pop().unwrap().message_id, id);
        }
        assert!(queue.pop().is_none());
        assert!(queue.push(message(1)).is_ok());
    }

    #[test]
    fn queued_count_is_accurate() {
        let mut queue = MessageQueue::new();
        assert!(queue.is_empty());
        for id in 0..5 {
            queue.push(message(id)).unwrap();
        }
        assert_eq!(queue.len(), 5);
        queue.pop();
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn paging_bit_is_metadata_bit_zero() {
        let mut m = message(1);
        assert!(!m.is_paging_message());
        m.metadata = 0b11;
        assert!(m.is_paging_message());
    }
}
