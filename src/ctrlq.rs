//! Outbound control queue.
//!
//! Producers (tracing hooks, the host notifier, the RX handler acking a
//! batch) push messages here and the communicator worker drains them into the
//! TX ring. Ordinary traffic is FIFO; `enqueue_front` is a priority lane for
//! the READY handshake and is never refused for capacity, otherwise a full
//! queue could starve the very message that unblocks it.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::QueueError;
use crate::wire::ControlMessage;

#[derive(Debug, Default)]
struct Lanes {
    entries: VecDeque<ControlMessage>,
    // Places promised to callers of `reserve` but not yet filled.
    reserved: usize,
}

#[derive(Debug, Default)]
pub struct ControlQueue {
    lanes: Mutex<Lanes>,
    // 0 means unbounded.
    capacity: usize,
}

impl ControlQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn check_room(&self, lanes: &Lanes) -> Result<(), QueueError> {
        if self.capacity > 0 && lanes.entries.len() + lanes.reserved >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Append to the tail. Fails only when a capacity is configured and reached.
    pub fn enqueue(&self, msg: ControlMessage) -> Result<(), QueueError> {
        let mut lanes = self.lanes.lock().unwrap();
        self.check_room(&lanes)?;
        lanes.entries.push_back(msg);
        Ok(())
    }

    /// Hold a place at the tail for a later [`ControlQueue::enqueue_reserved`].
    pub fn reserve(&self) -> Result<(), QueueError> {
        let mut lanes = self.lanes.lock().unwrap();
        self.check_room(&lanes)?;
        lanes.reserved += 1;
        Ok(())
    }

    /// Fill a place taken with [`ControlQueue::reserve`]. Never refused.
    pub fn enqueue_reserved(&self, msg: ControlMessage) {
        let mut lanes = self.lanes.lock().unwrap();
        lanes.reserved = lanes.reserved.saturating_sub(1);
        lanes.entries.push_back(msg);
    }

    /// Give back a reserved place that will not be used.
    pub fn release(&self) {
        let mut lanes = self.lanes.lock().unwrap();
        lanes.reserved = lanes.reserved.saturating_sub(1);
    }

    /// Prepend to the head, jumping ahead of everything already queued.
    pub fn enqueue_front(&self, msg: ControlMessage) {
        self.lanes.lock().unwrap().entries.push_front(msg);
    }

    pub fn dequeue(&self) -> Option<ControlMessage> {
        self.lanes.lock().unwrap().entries.pop_front()
    }

    /// Pop the head only if `pred` accepts it.
    pub fn dequeue_if<F>(&self, pred: F) -> Option<ControlMessage>
    where
        F: FnOnce(&ControlMessage) -> bool,
    {
        let mut lanes = self.lanes.lock().unwrap();
        if lanes.entries.front().is_some_and(pred) {
            lanes.entries.pop_front()
        } else {
            None
        }
    }

    /// Put a message back at the head after a failed transmit.
    pub fn requeue_front(&self, msg: ControlMessage) {
        self.enqueue_front(msg);
    }

    /// True if the head of the queue satisfies `pred`.
    pub fn head_matches<F>(&self, pred: F) -> bool
    where
        F: FnOnce(&ControlMessage) -> bool,
    {
        self.lanes.lock().unwrap().entries.front().is_some_and(pred)
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.lock().unwrap().entries.is_empty()
    }

    pub fn count(&self) -> usize {
        self.lanes.lock().unwrap().entries.len()
    }

    /// Drop everything still queued; returns how many entries were discarded.
    pub fn clear(&self) -> usize {
        let mut lanes = self.lanes.lock().unwrap();
        let n = lanes.entries.len();
        lanes.entries.clear();
        n
    }
}
