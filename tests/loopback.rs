//! End-to-end tests: a guest driver and a host device talking over an
//! in-memory link.

mod common;

use common::{connect, wait_for};
use vtdtr::error::errno;
use vtdtr::wire::{BoundedName, ControlEvent, ControlMessage, ProbeCreate, ProbeDesc};
use vtdtr::{ProbeChange, ProbeNotification, ProviderId};

#[test]
fn test_guest_install_reaches_host_registry() {
    let session = connect("vm0", 64);
    session.guest.install_probe(42).unwrap();

    assert!(wait_for(|| session.host_registry.is_enabled("vm0", 42)));
    let rec = session.host_registry.probe("vm0", 42).unwrap();
    assert_eq!(rec.id, 42);
    assert!(rec.enabled);
}

#[test]
fn test_register_then_create_applies_in_order() {
    let session = connect("vm0", 64);
    let uuid = session.host.register_provider("syscall").unwrap();
    let id = session
        .host
        .create_probe(uuid, "vmm", "run", "entry")
        .unwrap();

    assert!(wait_for(|| session.guest_registry.local_id("vm0", id).is_some()));
    assert!(session.guest_framework.has_provider(uuid));
    let local = session.guest_framework.find_probe("vmm", "run", "entry");
    assert_eq!(session.guest_registry.local_id("vm0", id), local);
    assert!(session.host.endpoint().take_nacks().is_empty());
}

#[test]
fn test_host_install_lets_guest_probe_fire() {
    let session = connect("vm0", 64);
    let uuid = session.host.register_provider("io").unwrap();
    let id = session.host.create_probe(uuid, "blk", "read", "start").unwrap();
    session.host.install_probe(id).unwrap();

    assert!(wait_for(|| session.guest_registry.is_enabled("vm0", id)));
    assert!(session.guest.fire(id, [10, 20, 30, 40, 50]));

    let local = session.guest_registry.local_id("vm0", id).unwrap();
    let commits = session.guest_framework.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].probe_id, local);
    assert_eq!(commits[0].instance, "vm0");
    assert_eq!(session.guest.endpoint().arg_value(id, 1), 20);

    session.host.uninstall_probe(id).unwrap();
    assert!(wait_for(|| !session.guest_registry.is_enabled("vm0", id)));
    assert!(!session.guest.fire(id, [0; 5]));
    assert_eq!(session.guest_framework.commits().len(), 1);
}

#[test]
fn test_disabled_probe_is_not_committed() {
    let session = connect("vm0", 64);
    session.host.install_probe(7).unwrap();
    assert!(wait_for(|| session.guest_registry.is_enabled("vm0", 7)));

    assert!(session.guest.endpoint().set_enabled(7, false));
    assert!(!session.guest.fire(7, [1; 5]));
    assert!(session.guest.endpoint().set_enabled(7, true));
    assert!(session.guest.fire(7, [1; 5]));
}

#[test]
fn test_notifier_filters_by_instance() {
    let session = connect("vm0", 64);
    let notifier = session.host.notifier();

    let other = ProbeNotification {
        instance: "vm1".into(),
        change: ProbeChange::Installed,
        probe_id: 5,
    };
    assert!(!notifier.notify(&other).unwrap());

    let mine = ProbeNotification {
        instance: "vm0".into(),
        ..other
    };
    assert!(notifier.clone().notify(&mine).unwrap());
    assert!(wait_for(|| session.guest_registry.is_enabled("vm0", 5)));
}

#[test]
fn test_repeated_install_keeps_one_record() {
    let session = connect("vm0", 64);
    session.guest.install_probe(3).unwrap();
    session.guest.install_probe(3).unwrap();
    session.guest.uninstall_probe(9).unwrap();
    session.guest.install_probe(4).unwrap();

    assert!(wait_for(|| session.host_registry.is_enabled("vm0", 4)));
    assert_eq!(session.host_registry.probe_count("vm0"), 2);
}

#[test]
fn test_create_under_unknown_provider_is_nacked() {
    let session = connect("vm0", 64);
    let bogus = ProviderId::generate();
    let create = ControlMessage::ProbeCreate(ProbeCreate {
        probe_id: 77,
        desc: ProbeDesc {
            provider: bogus,
            module: BoundedName::new("vmm").unwrap(),
            function: BoundedName::new("exit").unwrap(),
            name: BoundedName::new("return").unwrap(),
        },
    });
    session.host.endpoint().post(create).unwrap();

    let mut nacks = Vec::new();
    assert!(wait_for(|| {
        nacks.extend(session.host.endpoint().take_nacks());
        !nacks.is_empty()
    }));
    assert_eq!(nacks[0].failed, ControlEvent::ProbeCreate);
    assert_eq!(nacks[0].probe_id, 77);
    assert_eq!(nacks[0].uuid, bogus);
    assert_eq!(nacks[0].status, errno::ESRCH);
    assert!(wait_for(|| session.guest.endpoint().stats().nacks_sent == 1));
}

#[test]
fn test_unregister_is_mirrored() {
    let session = connect("vm0", 64);
    let uuid = session.host.register_provider("sched").unwrap();
    assert!(wait_for(|| session.guest_framework.has_provider(uuid)));

    session.host.unregister_provider(uuid).unwrap();
    assert!(wait_for(|| !session.guest_framework.has_provider(uuid)));
    assert!(!session.host_framework.has_provider(uuid));

    let err = session.host.unregister_provider(uuid).unwrap_err();
    assert!(format!("{err:#}").contains("not known"));
}

#[test]
fn test_guest_destroy_tears_down_host_side() {
    let session = connect("vm0", 64);
    let uuid = session.host.register_provider("syscall").unwrap();
    let id = session.host.create_probe(uuid, "vmm", "run", "entry").unwrap();
    session.host.install_probe(id).unwrap();
    session.guest.install_probe(11).unwrap();
    assert!(wait_for(|| session.host_registry.is_enabled("vm0", 11)));
    assert!(wait_for(|| session.guest_registry.is_enabled("vm0", id)));
    assert!(session.guest.fire(id, [1; 5]));

    session.guest.destroy().unwrap();
    assert!(wait_for(|| session.host.providers().is_empty()));
    assert!(!session.host_framework.has_provider(uuid));
    assert_eq!(session.host_registry.probe_count("vm0"), 0);
    assert!(session.host_registry.is_attached("vm0"));

    // The host tells the guest which providers went away.
    assert!(wait_for(|| session.guest_registry.local_id("vm0", id).is_none()));
    assert!(!session.guest_framework.has_provider(uuid));
    assert!(!session.guest.fire(id, [1; 5]));
    assert_eq!(session.guest_framework.commits().len(), 1);
}

#[test]
fn test_small_ring_carries_long_backlog() {
    let session = connect("vm0", 4);
    for id in 0..100 {
        session.guest.install_probe(id).unwrap();
    }
    assert!(wait_for(|| session.host_registry.probe_count("vm0") == 100));

    let stats = session.guest.endpoint().stats();
    assert!(stats.batches >= 25);
    assert!(stats.messages_sent >= 101);
}

#[test]
fn test_finish_detaches_both_sides() {
    let session = connect("vm0", 64);
    let uuid = session.host.register_provider("syscall").unwrap();
    session.guest.install_probe(1).unwrap();
    assert!(wait_for(|| session.host_registry.is_enabled("vm0", 1)));
    assert!(wait_for(|| session.guest_framework.has_provider(uuid)));

    let host_registry = session.host_registry.clone();
    let host_framework = session.host_framework.clone();
    let report = session.finish();

    assert_eq!(report.host.registry[0].probes.len(), 1);
    assert_eq!(report.host.framework.providers.len(), 1);
    assert!(report.guest.stats.messages_received >= 2);
    assert!(!host_registry.is_attached("vm0"));
    assert_eq!(host_framework.provider_count(), 0);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["host"]["features"], "PROBE|PROV|NACK");
}
