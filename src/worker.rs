//! Communicator worker.
//!
//! One thread per endpoint owns every write to the transmit ring. It sleeps
//! until there is something it is allowed to send (or shutdown), moves as
//! much of the control queue as fits into the ring, terminates the batch
//! with EOF when it drained everything sendable, and then waits for the
//! peer to take the batch before going round again.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::ctrlq::ControlQueue;
use crate::endpoint::Shared;
use crate::transport::TxVq;

/// Result of one [`transmit_batch`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub sent: usize,
    pub eof_sent: bool,
    /// Every message sent was a READY handshake.
    pub all_ready: bool,
}

/// Move queued messages into the ring, one at a time, until it is full or
/// nothing sendable is left. While the peer is not ready only READY
/// messages may go. EOF is appended when the batch ended for lack of
/// sendable messages rather than lack of ring space.
pub fn transmit_batch(queue: &ControlQueue, txq: &TxVq, peer_ready: bool) -> BatchOutcome {
    let mut out = BatchOutcome {
        sent: 0,
        eof_sent: false,
        all_ready: true,
    };
    let mut ring_full = false;

    loop {
        if txq.is_full() {
            ring_full = true;
            break;
        }
        let next = if peer_ready {
            queue.dequeue()
        } else {
            queue.dequeue_if(|m| m.is_ready())
        };
        let Some(msg) = next else {
            break;
        };
        match txq.send(&msg) {
            Ok(()) => {
                trace!("TX {}", msg.event());
                out.sent += 1;
                out.all_ready &= msg.is_ready();
            }
            Err(e) => {
                warn!("Failed to submit {}: {}", msg.event(), e);
                queue.requeue_front(msg);
                ring_full = true;
                break;
            }
        }
    }

    if out.sent > 0 && !ring_full {
        match txq.enqueue_eof() {
            Ok(()) => out.eof_sent = true,
            Err(e) => warn!("Failed to terminate batch: {}", e),
        }
    }
    out
}

/// True if the worker has something it may send right now.
fn sendable(queue: &ControlQueue, peer_ready: bool) -> bool {
    !queue.is_empty() && (peer_ready || queue.head_matches(|m| m.is_ready()))
}

pub(crate) fn run(shared: Arc<Shared>) {
    let name = shared.role.name();
    debug!("{} communicator started", name);

    let mut state = shared.state.lock().unwrap();
    loop {
        state = shared
            .cond
            .wait_while(state, |st| {
                !st.shutdown && !sendable(&shared.queue, st.peer_ready)
            })
            .unwrap();
        if state.shutdown {
            break;
        }

        let batch = transmit_batch(&shared.queue, &shared.txq, state.peer_ready);
        if batch.sent > 0 && !batch.all_ready {
            // Hold off until the peer acknowledges this batch with READY.
            state.peer_ready = false;
        }
        drop(state);

        if batch.sent > 0 {
            let stats = &shared.stats;
            stats.messages_sent.fetch_add(batch.sent as u64, Ordering::Relaxed);
            stats.batches.fetch_add(1, Ordering::Relaxed);
            if batch.eof_sent {
                stats.eofs_sent.fetch_add(1, Ordering::Relaxed);
            }
            trace!(
                "{} batch: {} sent, eof {}",
                name,
                batch.sent,
                batch.eof_sent
            );
        }

        shared.txq.notify();
        if !shared.txq.poll(shared.flush_timeout) {
            warn!(
                "{} transmit ring not flushed after {:?} ({} outstanding)",
                name,
                shared.flush_timeout,
                shared.txq.outstanding()
            );
        }
        state = shared.state.lock().unwrap();
    }
    drop(state);

    debug!("{} communicator stopped", name);
}
