//! Descriptor lifecycle on top of the raw rings.
//!
//! [`RxVq`] keeps the receive ring stocked with zeroed, device-writable
//! buffers and recycles them after each message. [`TxVq`] turns outbound
//! control messages into one-shot device-readable buffers and frees them
//! once the peer has consumed them. Both sides can be drained at teardown
//! any number of times.

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::virtqueue::{Doorbell, RxRing, TxRing};
use crate::wire::{ControlMessage, CONTROL_MSG_SIZE};

/// Direction of a descriptor segment, as seen by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// The peer reads it (our transmissions).
    Readable,
    /// The peer writes it (our receive buffers).
    Writable,
}

impl Segment {
    fn name(self) -> &'static str {
        match self {
            Segment::Readable => "readable",
            Segment::Writable => "writable",
        }
    }
}

fn check_len(buf: &[u8]) -> Result<(), TransportError> {
    if buf.len() != CONTROL_MSG_SIZE {
        return Err(TransportError::BadLength {
            got: buf.len(),
            need: CONTROL_MSG_SIZE,
        });
    }
    Ok(())
}

fn alloc_ctrl_buf() -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(CONTROL_MSG_SIZE).ok()?;
    buf.resize(CONTROL_MSG_SIZE, 0);
    Some(buf)
}

/// Receive side of an endpoint.
pub struct RxVq {
    ring: RxRing,
}

impl RxVq {
    pub fn new(ring: RxRing) -> Self {
        RxVq { ring }
    }

    pub fn slots(&self) -> usize {
        self.ring.slots()
    }

    /// Buffers currently owned by the ring.
    pub fn outstanding(&self) -> usize {
        self.ring.outstanding()
    }

    /// Fill every free slot with a zeroed buffer and notify the peer once.
    /// Returns how many buffers were added. Fails only if slots were free
    /// and not a single buffer could be allocated.
    pub fn populate(&self) -> Result<usize, TransportError> {
        let free = self.ring.slots().saturating_sub(self.ring.outstanding());
        let mut added = 0;
        for _ in 0..free {
            let Some(buf) = alloc_ctrl_buf() else {
                warn!("Out of memory after {} receive descriptors", added);
                break;
            };
            if self.enqueue_ctrl(buf, Segment::Writable).is_err() {
                break;
            }
            added += 1;
        }

        if free > 0 && added == 0 {
            return Err(TransportError::NoDescriptors);
        }
        if added > 0 {
            self.ring.kick();
        }
        debug!("Populated {}/{} receive descriptors", added, free);
        Ok(added)
    }

    /// Post one buffer. Receive buffers must be writable by the peer.
    pub fn enqueue_ctrl(&self, buf: Vec<u8>, segment: Segment) -> Result<(), TransportError> {
        if segment != Segment::Writable {
            return Err(TransportError::WrongDirection(segment.name()));
        }
        check_len(&buf)?;
        self.ring.post(buf).map_err(|_| TransportError::RingFull {
            slots: self.ring.slots(),
        })
    }

    /// Zero a consumed buffer and hand it back to the peer.
    pub fn requeue_ctrl(&self, mut buf: Vec<u8>) -> Result<(), TransportError> {
        buf.fill(0);
        self.enqueue_ctrl(buf, Segment::Writable)?;
        self.ring.kick();
        Ok(())
    }

    /// Next filled buffer and the number of bytes written into it.
    pub fn dequeue(&self) -> Option<(Vec<u8>, usize)> {
        self.ring.take_used()
    }

    pub fn set_doorbell(&self, doorbell: Option<Doorbell>) {
        self.ring.set_doorbell(doorbell);
    }

    /// Re-arm notifications. True means buffers are already waiting.
    pub fn enable_intr(&self) -> bool {
        self.ring.enable_intr()
    }

    pub fn disable_intr(&self) {
        self.ring.disable_intr();
    }

    /// Release every buffer still in the ring. Returns how many were freed.
    pub fn drain(&self) -> usize {
        let n = self.ring.drain().len();
        trace!("Drained {} receive descriptors", n);
        n
    }
}

/// Transmit side of an endpoint.
///
/// The underlying ring carries one slot more than `data_slots`; that spare
/// slot is only ever used for the EOF terminator, so a batch that fills
/// every data slot can still be closed off.
pub struct TxVq {
    ring: TxRing,
    data_slots: usize,
}

impl TxVq {
    pub fn new(ring: TxRing) -> Self {
        let data_slots = ring.slots().saturating_sub(1);
        TxVq { ring, data_slots }
    }

    pub fn data_slots(&self) -> usize {
        self.data_slots
    }

    pub fn outstanding(&self) -> usize {
        self.ring.outstanding()
    }

    /// True when no data slot is left for another message.
    pub fn is_full(&self) -> bool {
        self.ring.outstanding() >= self.data_slots
    }

    /// Submit one buffer. Transmit buffers must be readable by the peer.
    pub fn enqueue_ctrl(&self, buf: Vec<u8>, segment: Segment) -> Result<(), TransportError> {
        if segment != Segment::Readable {
            return Err(TransportError::WrongDirection(segment.name()));
        }
        check_len(&buf)?;
        if self.is_full() {
            return Err(TransportError::RingFull {
                slots: self.data_slots,
            });
        }
        self.ring.submit(buf).map_err(|_| TransportError::RingFull {
            slots: self.data_slots,
        })
    }

    /// Serialize `msg` into a fresh buffer and submit it.
    pub fn send(&self, msg: &ControlMessage) -> Result<(), TransportError> {
        self.enqueue_ctrl(msg.to_bytes(), Segment::Readable)
    }

    /// Submit the batch terminator into the reserved slot.
    pub fn enqueue_eof(&self) -> Result<(), TransportError> {
        self.ring
            .submit(ControlMessage::Eof.to_bytes())
            .map_err(|_| TransportError::RingFull {
                slots: self.ring.slots(),
            })
    }

    pub fn notify(&self) -> usize {
        self.ring.kick()
    }

    /// Wait for the peer to take everything submitted, then free the spent
    /// buffers. Returns false if `timeout` expired first.
    pub fn poll(&self, timeout: Duration) -> bool {
        let flushed = self.ring.wait_flushed(timeout);
        let freed = self.ring.reclaim().len();
        trace!("Reclaimed {} transmit descriptors", freed);
        flushed
    }

    /// Release every buffer still in the ring. Returns how many were freed.
    pub fn drain(&self) -> usize {
        let n = self.ring.drain().len();
        trace!("Drained {} transmit descriptors", n);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtqueue::link;

    fn pair(data_slots: usize) -> (TxVq, RxVq) {
        let (guest, host) = link(data_slots + 1);
        (TxVq::new(guest.tx), RxVq::new(host.rx))
    }

    #[test]
    fn test_populate_fills_free_slots_once() {
        let (_tx, rx) = pair(4);
        assert_eq!(rx.populate().unwrap(), 5);
        assert_eq!(rx.outstanding(), 5);
        assert_eq!(rx.populate().unwrap(), 0);
    }

    #[test]
    fn test_direction_is_enforced() {
        let (tx, rx) = pair(2);
        assert_eq!(
            rx.enqueue_ctrl(vec![0; CONTROL_MSG_SIZE], Segment::Readable),
            Err(TransportError::WrongDirection("readable"))
        );
        assert_eq!(
            tx.enqueue_ctrl(vec![0; CONTROL_MSG_SIZE], Segment::Writable),
            Err(TransportError::WrongDirection("writable"))
        );
        assert_eq!(
            tx.enqueue_ctrl(vec![0; 10], Segment::Readable),
            Err(TransportError::BadLength {
                got: 10,
                need: CONTROL_MSG_SIZE
            })
        );
    }

    #[test]
    fn test_requeue_zeroes_buffer() {
        let (tx, rx) = pair(1);
        rx.populate().unwrap();
        tx.send(&ControlMessage::ProbeInstall { probe_id: 9 }).unwrap();
        tx.notify();

        let (buf, len) = rx.dequeue().unwrap();
        assert_eq!(len, CONTROL_MSG_SIZE);
        assert!(buf.iter().any(|&b| b != 0));
        rx.requeue_ctrl(buf).unwrap();

        let drained = rx.ring.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|b| b.iter().all(|&x| x == 0)));
    }

    #[test]
    fn test_eof_uses_reserved_slot() {
        let (tx, rx) = pair(2);
        rx.populate().unwrap();
        tx.send(&ControlMessage::ProbeInstall { probe_id: 1 }).unwrap();
        tx.send(&ControlMessage::ProbeInstall { probe_id: 2 }).unwrap();
        assert!(tx.is_full());
        assert!(matches!(
            tx.send(&ControlMessage::ProbeInstall { probe_id: 3 }),
            Err(TransportError::RingFull { slots: 2 })
        ));
        tx.enqueue_eof().unwrap();
        assert_eq!(tx.notify(), 3);
        assert!(tx.poll(Duration::from_millis(10)));
        assert_eq!(tx.outstanding(), 0);
    }

    #[test]
    fn test_drain_twice_leaves_nothing() {
        let (tx, rx) = pair(4);
        rx.populate().unwrap();
        tx.send(&ControlMessage::DeviceReady).unwrap();
        tx.send(&ControlMessage::Eof).unwrap();
        tx.notify();

        assert_eq!(tx.drain(), 2);
        assert_eq!(rx.drain(), 5);
        assert_eq!(tx.drain(), 0);
        assert_eq!(rx.drain(), 0);
        assert_eq!(tx.outstanding(), 0);
        assert_eq!(rx.outstanding(), 0);
    }
}
