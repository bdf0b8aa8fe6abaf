//! One side of the control protocol.
//!
//! An [`Endpoint`] ties together the outbound control queue, the receive
//! and transmit rings, the event processor and the communicator thread.
//! The guest driver and the host device are both thin roles on top of it.
//!
//! Inbound traffic is handled by an RX task scheduled on a single-thread
//! pool whenever the receive ring rings its doorbell. Outbound traffic goes
//! through [`Endpoint::post`] into the control queue, where the
//! communicator picks it up.
//!
//! Lock order is endpoint state, then control queue, then registry or ring.
//! Nothing is held across calls into the tracing framework.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};
use workerpool::thunk::{Thunk, ThunkWorker};
use workerpool::Pool;

use crate::config::EndpointConfig;
use crate::ctrlq::ControlQueue;
use crate::error::{AttachError, ProcessError, QueueError};
use crate::features::Features;
use crate::framework::TracingFramework;
use crate::processor::{Disposition, EventProcessor};
use crate::registry::ProbeRegistry;
use crate::transport::{RxVq, TxVq};
use crate::virtqueue::{Doorbell, QueuePair};
use crate::wire::{ControlMessage, Nack, ProbeId, PROBE_NARGS};
use crate::worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Host,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Host => "host",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Default)]
pub(crate) struct EndpointState {
    /// The peer has buffers for us and has acknowledged our last batch.
    pub(crate) peer_ready: bool,
    /// The peer's first READY has been seen.
    pub(crate) session: bool,
    pub(crate) shutdown: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub(crate) messages_sent: AtomicU64,
    pub(crate) messages_received: AtomicU64,
    pub(crate) eofs_sent: AtomicU64,
    pub(crate) batches: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) nacks_sent: AtomicU64,
    pub(crate) nacks_received: AtomicU64,
}

/// Counters for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub eofs_sent: u64,
    pub batches: u64,
    /// Inbound messages that were malformed or could not be applied.
    pub dropped: u64,
    pub nacks_sent: u64,
    pub nacks_received: u64,
}

impl Stats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            eofs_sent: self.eofs_sent.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            nacks_sent: self.nacks_sent.load(Ordering::Relaxed),
            nacks_received: self.nacks_received.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct Shared {
    pub(crate) role: Role,
    pub(crate) state: Mutex<EndpointState>,
    pub(crate) cond: Condvar,
    pub(crate) queue: ControlQueue,
    pub(crate) txq: TxVq,
    pub(crate) rxq: RxVq,
    pub(crate) processor: EventProcessor,
    pub(crate) stats: Stats,
    pub(crate) flush_timeout: Duration,
    nacks: Mutex<Vec<Nack>>,
    rx_pool: Mutex<Pool<ThunkWorker<()>>>,
}

impl Shared {
    /// Queue a message for the communicator.
    pub(crate) fn post(&self, msg: ControlMessage) -> Result<(), QueueError> {
        let state = self.state.lock().unwrap();
        if state.shutdown {
            return Err(QueueError::Shutdown);
        }
        self.queue.enqueue(msg)?;
        self.cond.notify_all();
        Ok(())
    }

    fn post_front(&self, msg: ControlMessage) {
        let state = self.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        self.queue.enqueue_front(msg);
        self.cond.notify_all();
    }

    /// Doorbell handler: run the RX task on the pool unless shutting down.
    fn schedule_rx(self: &Arc<Self>) {
        let state = self.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        let shared = self.clone();
        self.rx_pool
            .lock()
            .unwrap()
            .execute(Thunk::of(move || shared.rx_task()));
        drop(state);
    }

    fn rx_task(&self) {
        loop {
            let (ack, hit_eof) = self.rx_batch();
            if ack {
                self.post_front(ControlMessage::DeviceReady);
            }
            if !hit_eof {
                break;
            }
        }
    }

    /// Consume one receive batch. Returns whether it needs acknowledging
    /// and whether it ended with EOF.
    fn rx_batch(&self) -> (bool, bool) {
        let mut ack = false;
        while let Some((buf, len)) = self.rxq.dequeue() {
            let decoded = ControlMessage::decode(&buf[..len]);
            if let Err(e) = self.rxq.requeue_ctrl(buf) {
                warn!("{} failed to requeue receive descriptor: {}", self.role, e);
            }

            let msg = match decoded {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("{} dropping malformed control message: {}", self.role, e);
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
            trace!("{} RX {}", self.role, msg.event());

            let disposition = self.dispatch(&msg);
            // Messages refused for arriving before the handshake go unacknowledged.
            if msg.needs_ack() && self.state.lock().unwrap().session {
                ack = true;
            }
            if disposition == Some(Disposition::EndOfBatch) {
                return (ack, true);
            }
        }
        (ack, false)
    }

    fn dispatch(&self, msg: &ControlMessage) -> Option<Disposition> {
        let in_session = self.state.lock().unwrap().session;
        match self.processor.process(msg, in_session) {
            Ok(Disposition::PeerReady) => {
                let mut state = self.state.lock().unwrap();
                if !state.session {
                    info!("{} session established", self.role);
                }
                state.peer_ready = true;
                state.session = true;
                self.cond.notify_all();
                Some(Disposition::PeerReady)
            }
            Ok(Disposition::Nacked(nack)) => {
                self.stats.nacks_received.fetch_add(1, Ordering::Relaxed);
                self.nacks.lock().unwrap().push(nack.clone());
                Some(Disposition::Nacked(nack))
            }
            Ok(Disposition::Destroyed(gone)) => {
                for pv in &gone {
                    if let Err(e) = self.post(ControlMessage::Unregister(pv.clone())) {
                        warn!(
                            "{} could not announce removal of provider {}: {}",
                            self.role, pv.uuid, e
                        );
                    }
                }
                Some(Disposition::Destroyed(gone))
            }
            Ok(d) => Some(d),
            Err(e) => {
                self.reject(msg, &e);
                None
            }
        }
    }

    fn reject(&self, msg: &ControlMessage, err: &ProcessError) {
        match err {
            ProcessError::Framework(_) => {
                error!("{} could not apply {}: {}", self.role, msg.event(), err)
            }
            _ => warn!("{} dropping {}: {}", self.role, msg.event(), err),
        }
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);

        if let Some(nack) = self.processor.nack_for(msg, err) {
            match self.post(nack) {
                Ok(()) => {
                    self.stats.nacks_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("{} could not queue NACK: {}", self.role, e),
            }
        }
    }
}

/// A place held in the outbound queue. Dropping it unused gives it back.
pub struct QueueSlot<'a> {
    shared: &'a Shared,
    filled: bool,
}

impl QueueSlot<'_> {
    /// Queue `msg` in the held place. Only fails if the endpoint started
    /// shutting down after the place was taken.
    pub fn post(mut self, msg: ControlMessage) -> Result<(), QueueError> {
        self.filled = true;
        let state = self.shared.state.lock().unwrap();
        if state.shutdown {
            self.shared.queue.release();
            return Err(QueueError::Shutdown);
        }
        self.shared.queue.enqueue_reserved(msg);
        self.shared.cond.notify_all();
        Ok(())
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if !self.filled {
            self.shared.queue.release();
        }
    }
}

/// A running endpoint.
pub struct Endpoint {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    detached: bool,
}

impl Endpoint {
    /// Bring an endpoint up on `queues` with the negotiated `features`.
    ///
    /// Fills the receive ring, starts the communicator and queues the READY
    /// handshake. Any failure unwinds what was already set up.
    pub fn attach(
        role: Role,
        config: &EndpointConfig,
        features: Features,
        queues: QueuePair,
        framework: Arc<dyn TracingFramework>,
        registry: Arc<ProbeRegistry>,
    ) -> Result<Self, AttachError> {
        config.validate()?;
        registry
            .attach_instance(&config.instance)
            .map_err(AttachError::Registry)?;

        let rxq = RxVq::new(queues.rx);
        let txq = TxVq::new(queues.tx);
        if let Err(e) = rxq.populate() {
            registry.detach_instance(&config.instance);
            return Err(AttachError::Populate(e));
        }

        let shared = Arc::new(Shared {
            role,
            state: Mutex::new(EndpointState::default()),
            cond: Condvar::new(),
            queue: ControlQueue::new(config.queue_capacity),
            txq,
            rxq,
            processor: EventProcessor::new(&config.instance, features, framework, registry.clone()),
            stats: Stats::default(),
            flush_timeout: config.flush_timeout(),
            nacks: Mutex::new(Vec::new()),
            rx_pool: Mutex::new(Pool::<ThunkWorker<()>>::new(1)),
        });

        let worker_shared = shared.clone();
        let worker = match thread::Builder::new()
            .name(format!("vtdtr-{}-tx", role))
            .spawn(move || worker::run(worker_shared))
        {
            Ok(handle) => handle,
            Err(e) => {
                shared.rxq.drain();
                registry.detach_instance(&config.instance);
                return Err(AttachError::Spawn(e));
            }
        };

        let weak = Arc::downgrade(&shared);
        let doorbell: Doorbell = Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.schedule_rx();
            }
        });
        shared.rxq.set_doorbell(Some(doorbell));
        shared.post_front(ControlMessage::DeviceReady);
        if shared.rxq.enable_intr() {
            shared.schedule_rx();
        }

        info!(
            "{} endpoint attached: instance {}, features {}, {} slots",
            role,
            config.instance,
            features,
            shared.txq.data_slots()
        );
        Ok(Endpoint {
            shared,
            worker: Some(worker),
            detached: false,
        })
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn instance(&self) -> &str {
        self.shared.processor.instance()
    }

    pub fn features(&self) -> Features {
        self.shared.processor.features()
    }

    pub fn registry(&self) -> &Arc<ProbeRegistry> {
        self.shared.processor.registry()
    }

    pub(crate) fn processor(&self) -> &EventProcessor {
        &self.shared.processor
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Queue a message for the peer.
    pub fn post(&self, msg: ControlMessage) -> Result<(), QueueError> {
        self.shared.post(msg)
    }

    /// Claim a place in the outbound queue before changing local state, so
    /// the change can always be announced.
    pub fn reserve(&self) -> Result<QueueSlot<'_>, QueueError> {
        let state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return Err(QueueError::Shutdown);
        }
        self.shared.queue.reserve()?;
        Ok(QueueSlot {
            shared: &self.shared,
            filled: false,
        })
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.count()
    }

    pub fn is_peer_ready(&self) -> bool {
        self.shared.state.lock().unwrap().peer_ready
    }

    pub fn in_session(&self) -> bool {
        self.shared.state.lock().unwrap().session
    }

    /// Fire probe `id` for this endpoint's instance. Returns true if it was
    /// installed and enabled and the event was committed.
    pub fn fire(&self, id: ProbeId, args: [u64; PROBE_NARGS]) -> bool {
        self.shared.processor.fire(id, args)
    }

    pub fn arg_value(&self, id: ProbeId, index: usize) -> u64 {
        self.shared.processor.arg_value(id, index)
    }

    pub fn set_enabled(&self, id: ProbeId, enabled: bool) -> bool {
        self.registry().set_enabled(self.instance(), id, enabled)
    }

    /// NACKs received from the peer since the last call.
    pub fn take_nacks(&self) -> Vec<Nack> {
        std::mem::take(&mut *self.shared.nacks.lock().unwrap())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Wait until the outbound queue is empty and the transmit ring has
    /// been taken by the peer. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.queue.is_empty() && self.shared.txq.outstanding() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Tear the endpoint down and return its final counters.
    pub fn detach(mut self) -> StatsSnapshot {
        self.shutdown()
    }

    fn shutdown(&mut self) -> StatsSnapshot {
        if self.detached {
            return self.stats();
        }
        self.detached = true;
        let shared = &self.shared;

        {
            let mut state = shared.state.lock().unwrap();
            shared.rxq.disable_intr();
            state.shutdown = true;
            shared.cond.notify_all();
        }
        shared.rxq.set_doorbell(None);

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("{} communicator thread panicked", shared.role);
            }
        }
        shared.rx_pool.lock().unwrap().join();

        let tx = shared.txq.drain();
        let rx = shared.rxq.drain();
        let unsent = shared.queue.clear();
        debug!(
            "{} drained {} tx / {} rx descriptors, {} unsent messages",
            shared.role, tx, rx, unsent
        );

        let providers = shared.processor.cleanup();
        let probes = shared
            .processor
            .registry()
            .detach_instance(shared.processor.instance())
            .unwrap_or(0);

        let stats = self.stats();
        info!(
            "{} endpoint detached: {} providers, {} probes released; {:?}",
            shared.role, providers, probes, stats
        );
        stats
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::MemoryFramework;
    use crate::virtqueue::link;

    fn attach_pair() -> (Endpoint, Endpoint, Arc<ProbeRegistry>) {
        let cfg = EndpointConfig::default();
        let (gq, hq) = link(cfg.ring_size + 1);
        let host_reg = Arc::new(ProbeRegistry::with_capacity(4));
        let host = Endpoint::attach(
            Role::Host,
            &cfg,
            Features::all(),
            hq,
            Arc::new(MemoryFramework::new()),
            host_reg.clone(),
        )
        .unwrap();
        let guest = Endpoint::attach(
            Role::Guest,
            &cfg,
            Features::all(),
            gq,
            Arc::new(MemoryFramework::new()),
            Arc::new(ProbeRegistry::with_capacity(4)),
        )
        .unwrap();
        (guest, host, host_reg)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_handshake_establishes_session() {
        let (guest, host, _) = attach_pair();
        assert!(wait_for(|| guest.in_session() && host.in_session()));
        assert!(wait_for(|| guest.is_peer_ready() && host.is_peer_ready()));
    }

    #[test]
    fn test_install_reaches_peer_registry() {
        let (guest, host, host_reg) = attach_pair();
        guest
            .post(ControlMessage::ProbeInstall { probe_id: 42 })
            .unwrap();
        assert!(wait_for(|| host_reg.is_enabled("vm0", 42)));
        assert!(host.stats().messages_received >= 2);
    }

    #[test]
    fn test_detach_releases_everything() {
        let (guest, host, host_reg) = attach_pair();
        assert!(wait_for(|| host.in_session()));
        let stats = host.detach();
        assert!(stats.messages_sent >= 1);
        assert!(!host_reg.is_attached("vm0"));
        drop(guest);
    }

    #[test]
    fn test_post_after_shutdown_is_refused() {
        let (guest, _host, _) = attach_pair();
        let shared = guest.shared().clone();
        drop(guest);
        assert_eq!(
            shared.post(ControlMessage::ProbeInstall { probe_id: 1 }),
            Err(QueueError::Shutdown)
        );
    }

    #[test]
    fn test_second_attach_of_instance_fails() {
        let cfg = EndpointConfig::default();
        let reg = Arc::new(ProbeRegistry::with_capacity(4));
        let fw: Arc<dyn TracingFramework> = Arc::new(MemoryFramework::new());
        let (_g1, h1) = link(cfg.ring_size + 1);
        let (_g2, h2) = link(cfg.ring_size + 1);
        let _first = Endpoint::attach(
            Role::Host,
            &cfg,
            Features::all(),
            h1,
            fw.clone(),
            reg.clone(),
        )
        .unwrap();
        assert!(matches!(
            Endpoint::attach(Role::Host, &cfg, Features::all(), h2, fw, reg),
            Err(AttachError::Registry(_))
        ));
    }
}
