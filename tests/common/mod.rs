//! Common test utilities for vtdtr integration tests.

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use vtdtr::transport::{RxVq, TxVq};
use vtdtr::virtqueue::QueuePair;
use vtdtr::wire::ControlMessage;
use vtdtr::{EndpointConfig, Loopback};

/// Generous upper bound for anything asynchronous to happen.
pub const SETTLE: Duration = Duration::from_secs(5);

/// Poll `cond` until it holds or [`SETTLE`] runs out.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + SETTLE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

pub fn config(instance: &str, ring_size: usize) -> EndpointConfig {
    EndpointConfig {
        ring_size,
        flush_timeout_ms: 50,
        ..EndpointConfig::with_instance(instance)
    }
}

/// A connected guest/host pair that has completed its handshake.
pub fn connect(instance: &str, ring_size: usize) -> Loopback {
    let cfg = config(instance, ring_size);
    let session = Loopback::connect(&cfg, &cfg).expect("failed to connect loopback");
    assert!(
        wait_for(|| session.guest.endpoint().is_peer_ready()
            && session.host.endpoint().is_peer_ready()),
        "handshake did not complete"
    );
    session
}

/// A hand-driven peer: the rings of one side, with no endpoint behind them.
pub struct RawPeer {
    pub rx: RxVq,
    pub tx: TxVq,
}

impl RawPeer {
    pub fn new(queues: QueuePair) -> Self {
        let peer = RawPeer {
            rx: RxVq::new(queues.rx),
            tx: TxVq::new(queues.tx),
        };
        peer.rx.populate().expect("failed to populate raw peer");
        peer
    }

    /// Every message received so far, recycling the buffers.
    pub fn recv_all(&self) -> Vec<ControlMessage> {
        let mut out = Vec::new();
        while let Some((buf, len)) = self.rx.dequeue() {
            out.push(ControlMessage::decode(&buf[..len]).expect("peer sent garbage"));
            self.rx.requeue_ctrl(buf).expect("requeue failed");
        }
        out
    }

    /// Wait until at least `n` messages arrived and return them all.
    pub fn recv_at_least(&self, n: usize) -> Vec<ControlMessage> {
        let mut out = Vec::new();
        wait_for(|| {
            out.extend(self.recv_all());
            out.len() >= n
        });
        out
    }

    /// Send `msgs` as one batch terminated by EOF.
    pub fn send_batch(&self, msgs: &[ControlMessage]) {
        for msg in msgs {
            self.tx.send(msg).expect("raw peer ring full");
        }
        self.tx.enqueue_eof().expect("no room for EOF");
        self.tx.notify();
        assert!(self.tx.poll(SETTLE), "endpoint did not take batch");
    }

    pub fn send_raw(&self, bytes: Vec<u8>) {
        self.tx
            .enqueue_ctrl(bytes, vtdtr::transport::Segment::Readable)
            .expect("raw peer ring full");
        self.tx.notify();
        assert!(self.tx.poll(SETTLE), "endpoint did not take buffer");
    }
}
