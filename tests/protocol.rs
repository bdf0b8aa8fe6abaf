//! Protocol conformance tests against a hand-driven peer.
//!
//! The peer here is just a pair of rings: the test decides what it sends
//! and inspects exactly what the endpoint under test puts on the wire.

mod common;

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{config, wait_for, RawPeer};
use tempfile::NamedTempFile;
use vtdtr::ctrlq::ControlQueue;
use vtdtr::transport::{RxVq, TxVq};
use vtdtr::virtqueue::link;
use vtdtr::wire::{ControlMessage, CONTROL_MSG_SIZE};
use vtdtr::worker::transmit_batch;
use vtdtr::{
    EndpointConfig, Features, GuestDriver, HostDevice, Loopback, MemoryFramework, ProbeRegistry,
    ScriptRunner, SessionScript,
};

const QUIET: Duration = Duration::from_millis(50);

struct Harness {
    guest: GuestDriver,
    peer: RawPeer,
    registry: Arc<ProbeRegistry>,
}

/// A guest driver whose host side is a [`RawPeer`]. Consumes the guest's
/// opening handshake.
fn guest_with_raw_host(ring_size: usize) -> Harness {
    let cfg = config("vm0", ring_size);
    let (gq, hq) = link(ring_size + 1);
    let peer = RawPeer::new(hq);
    let registry = Arc::new(ProbeRegistry::with_capacity(4));
    let guest = GuestDriver::attach(
        &cfg,
        Features::all(),
        gq,
        Arc::new(MemoryFramework::new()),
        registry.clone(),
    )
    .unwrap();

    assert_eq!(
        peer.recv_at_least(2),
        vec![ControlMessage::DeviceReady, ControlMessage::Eof]
    );
    Harness {
        guest,
        peer,
        registry,
    }
}

fn install(id: u32) -> ControlMessage {
    ControlMessage::ProbeInstall { probe_id: id }
}

#[test]
fn test_nothing_but_ready_goes_out_until_peer_is_ready() {
    let h = guest_with_raw_host(8);

    h.guest.install_probe(1).unwrap();
    thread::sleep(QUIET);
    assert!(h.peer.recv_all().is_empty());

    h.peer.send_batch(&[ControlMessage::DeviceReady]);
    assert_eq!(
        h.peer.recv_at_least(2),
        vec![install(1), ControlMessage::Eof]
    );

    // The data batch cleared readiness; the next message waits for a fresh READY.
    h.guest.install_probe(2).unwrap();
    thread::sleep(QUIET);
    assert!(h.peer.recv_all().is_empty());

    h.peer.send_batch(&[ControlMessage::DeviceReady]);
    assert_eq!(
        h.peer.recv_at_least(2),
        vec![install(2), ControlMessage::Eof]
    );
}

#[test]
fn test_applied_batch_is_acknowledged_with_ready() {
    let h = guest_with_raw_host(8);
    h.peer
        .send_batch(&[ControlMessage::DeviceReady, install(4)]);

    assert!(wait_for(|| h.registry.is_enabled("vm0", 4)));
    assert_eq!(
        h.peer.recv_at_least(2),
        vec![ControlMessage::DeviceReady, ControlMessage::Eof]
    );
}

#[test]
fn test_messages_before_handshake_are_dropped() {
    let h = guest_with_raw_host(8);

    h.peer.send_batch(&[install(5)]);
    assert!(wait_for(|| h.guest.endpoint().stats().dropped == 1));
    assert!(!h.registry.is_enabled("vm0", 5));
    assert!(!h.guest.endpoint().in_session());

    // A refused batch is not acknowledged.
    thread::sleep(QUIET);
    assert!(h.peer.recv_all().is_empty());

    h.peer
        .send_batch(&[ControlMessage::DeviceReady, install(5)]);
    assert!(wait_for(|| h.registry.is_enabled("vm0", 5)));
    assert!(h.guest.endpoint().in_session());
    assert_eq!(h.peer.recv_at_least(1)[0], ControlMessage::DeviceReady);
}

#[test]
fn test_malformed_message_does_not_end_session() {
    let h = guest_with_raw_host(8);
    h.peer.send_batch(&[ControlMessage::DeviceReady]);

    let mut garbage = vec![0u8; CONTROL_MSG_SIZE];
    garbage[0] = 0x42;
    h.peer.send_raw(garbage);
    assert!(wait_for(|| h.guest.endpoint().stats().dropped == 1));

    h.peer.send_batch(&[install(6)]);
    assert!(wait_for(|| h.registry.is_enabled("vm0", 6)));
}

#[test]
fn test_full_ring_batch_defers_eof_until_queue_drains() {
    let (guest, host) = link(33);
    let tx = TxVq::new(guest.tx);
    let rx = RxVq::new(host.rx);
    rx.populate().unwrap();

    let queue = ControlQueue::new(0);
    for id in 0..64 {
        queue.enqueue(install(id)).unwrap();
    }

    let first = transmit_batch(&queue, &tx, true);
    assert_eq!(first.sent, 32);
    assert!(!first.eof_sent);
    tx.notify();

    let mut received = Vec::new();
    while let Some((buf, len)) = rx.dequeue() {
        received.push(ControlMessage::decode(&buf[..len]).unwrap());
        rx.requeue_ctrl(buf).unwrap();
    }
    assert!(tx.poll(Duration::from_millis(100)));
    assert_eq!(received.len(), 32);
    assert!(received.iter().all(|m| *m != ControlMessage::Eof));

    let second = transmit_batch(&queue, &tx, true);
    assert_eq!(second.sent, 32);
    assert!(second.eof_sent);
    tx.notify();

    received.clear();
    while let Some((buf, len)) = rx.dequeue() {
        received.push(ControlMessage::decode(&buf[..len]).unwrap());
        rx.requeue_ctrl(buf).unwrap();
    }
    assert_eq!(received.len(), 33);
    assert_eq!(received[0], install(32));
    assert_eq!(received[32], ControlMessage::Eof);
}

#[test]
fn test_shutdown_while_waiting_for_peer_sends_nothing() {
    let h = guest_with_raw_host(8);
    h.guest.install_probe(1).unwrap();
    h.guest.install_probe(2).unwrap();
    thread::sleep(QUIET);

    let start = Instant::now();
    let stats = h.guest.detach();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(stats.messages_sent, 1);
    assert!(h.peer.recv_all().is_empty());
    assert!(!h.registry.is_attached("vm0"));
}

#[test]
fn test_host_changes_nothing_when_queue_is_full() {
    let cfg = EndpointConfig {
        queue_capacity: 1,
        ..config("vm0", 8)
    };
    let (gq, hq) = link(cfg.ring_size + 1);
    let peer = RawPeer::new(gq);
    let framework = Arc::new(MemoryFramework::new());
    let host = HostDevice::attach(
        &cfg,
        Features::all(),
        hq,
        framework.clone(),
        Arc::new(ProbeRegistry::with_capacity(4)),
    )
    .unwrap();
    assert_eq!(
        peer.recv_at_least(2),
        vec![ControlMessage::DeviceReady, ControlMessage::Eof]
    );

    // The peer has not said READY, so this sits in the only queue place.
    host.install_probe(1).unwrap();
    let err = host.register_provider("syscall").unwrap_err();
    assert!(format!("{err:#}").contains("control queue full"));
    assert!(host.providers().is_empty());
    assert_eq!(framework.provider_count(), 0);

    peer.send_batch(&[ControlMessage::DeviceReady]);
    assert_eq!(peer.recv_at_least(2), vec![install(1), ControlMessage::Eof]);
    let uuid = host.register_provider("syscall").unwrap();
    assert!(framework.has_provider(uuid));

    // The REGISTER now holds the place; removal must not happen silently.
    let err = host.unregister_provider(uuid).unwrap_err();
    assert!(format!("{err:#}").contains("control queue full"));
    assert!(framework.has_provider(uuid));
    assert_eq!(host.providers().len(), 1);
}

#[test]
fn test_script_file_runs_end_to_end() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "guest": {{ "instance": "vm0", "flush_timeout_ms": 50 }},
            "host": {{ "instance": "vm0", "flush_timeout_ms": 50 }},
            "steps": [
                {{ "host_register": {{ "provider": "syscall" }} }},
                {{ "host_create": {{ "probe": "syscall:vmm:run:entry" }} }},
                {{ "host_install": {{ "probe_id": 1 }} }},
                {{ "guest_install": {{ "probe_id": 42 }} }},
                {{ "settle": {{ "ms": 100 }} }},
                {{ "guest_fire": {{ "probe_id": 1, "args": [1, 2, 3] }} }}
            ]
        }}"#
    )
    .unwrap();

    let script = SessionScript::load(file.path()).unwrap();
    let session = Loopback::connect(&script.guest, &script.host).unwrap();
    let fired = {
        let mut runner = ScriptRunner::new(&session);
        runner.run(&script.steps).unwrap();
        runner.into_fired()
    };
    assert_eq!(fired.len(), 1);
    assert!(fired[0].committed);
    assert!(session.host_registry.is_enabled("vm0", 42));
    assert_eq!(session.guest_framework.commits()[0].args, [1, 2, 3, 0, 0]);
}

#[test]
fn test_script_errors_carry_context() {
    let err = SessionScript::load(std::path::Path::new("/nonexistent/script.json")).unwrap_err();
    assert!(format!("{err:#}").contains("failed to read script"));

    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{ "steps": [ {{ "warp_drive": {{}} }} ] }}"#).unwrap();
    let err = SessionScript::load(file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("failed to parse script"));

    let cfg = config("vm0", 64);
    let session = Loopback::connect(&cfg, &cfg).unwrap();
    let mut runner = ScriptRunner::new(&session);
    let err = runner
        .run(&[vtdtr::Step::HostCreate {
            probe: "nosuch:a:b:c".into(),
        }])
        .unwrap_err();
    assert!(format!("{err:#}").contains("was not registered"));
}
