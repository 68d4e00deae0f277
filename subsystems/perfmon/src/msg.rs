//! # Notification Messages
//!
//! Overflow notifications are queued per context and drained by the
//! controller one message per read, in arrival order. The queue is a
//! fixed-capacity array so the overflow path can push without allocating.

use arrayvec::ArrayVec;

use crate::bitmap::RegMask;
use crate::{CpuId, SetId};

/// Depth of the per-context message queue
pub const MSG_QUEUE_DEPTH: usize = 32;

/// Notification delivered to the controlling thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// One or more counters overflowed and notification was requested
    Overflow {
        /// Set that was active when the overflow happened
        set_id: SetId,
        /// Registers with a confirmed 64-bit overflow
        ovfl_pmds: RegMask,
        /// Interrupted instruction pointer
        ip: u64,
        /// Timestamp of the interrupt (ns)
        timestamp: u64,
        /// Processor that took the interrupt
        cpu: CpuId,
    },
    /// The monitored thread exited while the context was attached
    End,
}

/// Bounded FIFO of pending messages
#[derive(Debug, Default)]
pub struct MessageQueue {
    queue: ArrayVec<Message, MSG_QUEUE_DEPTH>,
    head: usize,
    dropped: u64,
}

impl MessageQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message; returns false (and counts a drop) when full
    pub fn push(&mut self, msg: Message) -> bool {
        if self.queue.is_full() {
            self.compact();
        }
        match self.queue.try_push(msg) {
            Ok(()) => true,
            Err(_) => {
                self.dropped += 1;
                false
            },
        }
    }

    /// Oldest message
    pub fn pop(&mut self) -> Option<Message> {
        let msg = self.queue.get(self.head).copied()?;
        self.head += 1;
        if self.head == self.queue.len() {
            self.queue.clear();
            self.head = 0;
        }
        Some(msg)
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.queue.len() - self.head
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages lost to a full queue
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Discard everything
    pub fn clear(&mut self) {
        self.queue.clear();
        self.head = 0;
    }

    fn compact(&mut self) {
        if self.head > 0 {
            self.queue.drain(..self.head);
            self.head = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ovfl(set_id: SetId) -> Message {
        Message::Overflow {
            set_id,
            ovfl_pmds: RegMask::from_bits(&[0]),
            ip: 0,
            timestamp: 0,
            cpu: CpuId(0),
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut q = MessageQueue::new();
        q.push(ovfl(1));
        q.push(Message::End);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(ovfl(1)));
        assert_eq!(q.pop(), Some(Message::End));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_full_queue_drops() {
        let mut q = MessageQueue::new();
        for i in 0..MSG_QUEUE_DEPTH {
            assert!(q.push(ovfl(i as SetId)));
        }
        assert!(!q.push(Message::End));
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.pop(), Some(ovfl(0)));
        // the freed slot is reusable
        assert!(q.push(Message::End));
        assert_eq!(q.len(), MSG_QUEUE_DEPTH);
    }
}
