//! In-memory descriptor rings connecting two endpoints.
//!
//! This stands in for the hypervisor's virtqueue transport: a bounded,
//! reliable, in-order ring per direction with a doorbell callback. Each
//! direction is one [`Link`]. The receiving side posts empty device-writable
//! buffers (`avail`); the sending side submits device-readable buffers
//! (`pending`) and kicks. A kick (or a fresh post) copies pending payloads into
//! avail buffers, moves the filled buffers onto the receiver's `used` list and
//! the spent sender buffers onto `completed`, then rings the receiver's
//! doorbell if its interrupts are enabled.
//!
//! ```text
//!   sender                   Link                    receiver
//!   submit() ──► pending ──┐        ┌── avail ◄── post()
//!                           └─copy──┴─► used ───► take_used()
//!   reclaim() ◄── completed ◄┘
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Interrupt callback invoked when a receiver gains used buffers.
pub type Doorbell = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct LinkState {
    // Receiver buffers waiting to be written into.
    avail: VecDeque<Vec<u8>>,
    // Filled receiver buffers and the number of bytes written.
    used: VecDeque<(Vec<u8>, usize)>,
    // Sender buffers not yet copied across.
    pending: VecDeque<Vec<u8>>,
    // Sender buffers already copied, waiting to be reclaimed.
    completed: VecDeque<Vec<u8>>,
    intr_enabled: bool,
    doorbell: Option<Doorbell>,
}

struct Link {
    state: Mutex<LinkState>,
    flushed: Condvar,
    slots: usize,
}

impl Link {
    fn new(slots: usize) -> Self {
        Link {
            state: Mutex::new(LinkState::default()),
            flushed: Condvar::new(),
            slots,
        }
    }

    /// Move as many pending payloads as there are posted buffers.
    fn pump(&self) -> usize {
        let (moved, bell) = {
            let mut st = self.state.lock().unwrap();
            let mut moved = 0;
            loop {
                let Some(mut dst) = st.avail.pop_front() else {
                    break;
                };
                let Some(src) = st.pending.pop_front() else {
                    st.avail.push_front(dst);
                    break;
                };
                let n = src.len().min(dst.len());
                dst[..n].copy_from_slice(&src[..n]);
                st.used.push_back((dst, n));
                st.completed.push_back(src);
                moved += 1;
            }
            let bell = if moved > 0 && st.intr_enabled {
                st.doorbell.clone()
            } else {
                None
            };
            (moved, bell)
        };

        if moved > 0 {
            self.flushed.notify_all();
        }
        // Never ring the doorbell with the ring lock held: the callback may
        // come straight back into this link.
        if let Some(bell) = bell {
            bell();
        }
        moved
    }
}

/// Sending half of one direction.
pub struct TxRing {
    link: Arc<Link>,
}

impl TxRing {
    pub fn slots(&self) -> usize {
        self.link.slots
    }

    /// Descriptors submitted and not yet reclaimed.
    pub fn outstanding(&self) -> usize {
        let st = self.link.state.lock().unwrap();
        st.pending.len() + st.completed.len()
    }

    /// Hand a device-readable buffer to the ring. Gives the buffer back if
    /// every slot is in use.
    pub fn submit(&self, buf: Vec<u8>) -> Result<(), Vec<u8>> {
        let mut st = self.link.state.lock().unwrap();
        if st.pending.len() + st.completed.len() >= self.link.slots {
            return Err(buf);
        }
        st.pending.push_back(buf);
        Ok(())
    }

    /// Notify the peer. Returns how many descriptors crossed over.
    pub fn kick(&self) -> usize {
        self.link.pump()
    }

    /// Take back buffers the peer has consumed.
    pub fn reclaim(&self) -> Vec<Vec<u8>> {
        self.link.state.lock().unwrap().completed.drain(..).collect()
    }

    /// Block until nothing is pending or `timeout` expires. Returns true if
    /// the ring flushed.
    pub fn wait_flushed(&self, timeout: Duration) -> bool {
        let st = self.link.state.lock().unwrap();
        let (st, _) = self
            .link
            .flushed
            .wait_timeout_while(st, timeout, |st| !st.pending.is_empty())
            .unwrap();
        st.pending.is_empty()
    }

    /// Pull every descriptor out of the ring, consumed or not.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        let mut st = self.link.state.lock().unwrap();
        let mut bufs: Vec<Vec<u8>> = st.pending.drain(..).collect();
        bufs.extend(st.completed.drain(..));
        bufs
    }
}

/// Receiving half of one direction.
pub struct RxRing {
    link: Arc<Link>,
}

impl RxRing {
    pub fn slots(&self) -> usize {
        self.link.slots
    }

    /// Posted buffers, filled or not.
    pub fn outstanding(&self) -> usize {
        let st = self.link.state.lock().unwrap();
        st.avail.len() + st.used.len()
    }

    /// Post an empty device-writable buffer without notifying.
    pub fn post(&self, buf: Vec<u8>) -> Result<(), Vec<u8>> {
        let mut st = self.link.state.lock().unwrap();
        if st.avail.len() + st.used.len() >= self.link.slots {
            return Err(buf);
        }
        st.avail.push_back(buf);
        Ok(())
    }

    /// Tell the peer new buffers are posted; any payloads it was holding
    /// back for lack of space cross over now.
    pub fn kick(&self) -> usize {
        self.link.pump()
    }

    /// Next filled buffer and the number of bytes the peer wrote.
    pub fn take_used(&self) -> Option<(Vec<u8>, usize)> {
        self.link.state.lock().unwrap().used.pop_front()
    }

    pub fn set_doorbell(&self, doorbell: Option<Doorbell>) {
        self.link.state.lock().unwrap().doorbell = doorbell;
    }

    /// Re-arm the doorbell. Returns true if used buffers arrived while it
    /// was disarmed, in which case the caller must go round again.
    pub fn enable_intr(&self) -> bool {
        let mut st = self.link.state.lock().unwrap();
        st.intr_enabled = true;
        !st.used.is_empty()
    }

    pub fn disable_intr(&self) {
        self.link.state.lock().unwrap().intr_enabled = false;
    }

    /// Pull every posted buffer out of the ring, filled or not.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        let mut st = self.link.state.lock().unwrap();
        let mut bufs: Vec<Vec<u8>> = st.avail.drain(..).collect();
        bufs.extend(st.used.drain(..).map(|(buf, _)| buf));
        bufs
    }
}

/// The two rings one endpoint sees.
pub struct QueuePair {
    pub rx: RxRing,
    pub tx: TxRing,
}

/// Build both directions between a guest and a host, each ring having
/// `slots` descriptors. Returns `(guest, host)`.
pub fn link(slots: usize) -> (QueuePair, QueuePair) {
    let to_host = Arc::new(Link::new(slots));
    let to_guest = Arc::new(Link::new(slots));
    let guest = QueuePair {
        rx: RxRing {
            link: to_guest.clone(),
        },
        tx: TxRing {
            link: to_host.clone(),
        },
    };
    let host = QueuePair {
        rx: RxRing { link: to_host },
        tx: TxRing { link: to_guest },
    };
    (guest, host)
}
