//! Integration tests for the interface manager
//!
//! Drive the full engine (registry, reconciliation, naming, notifications)
//! against the simulated kernel.

use ifmgrd::netlink::mock::SimulatedKernel;
use ifmgrd::shell::{ExecResult, RecordingRunner};
use ifmgrd::*;
use pretty_assertions::assert_eq;
use serde_json::{Map, json};
use std::collections::BTreeSet;
use std::sync::Arc;

// ============================================================================
// TEST HELPERS
// ============================================================================

struct Harness {
    manager: InterfaceManager,
    kernel: SimulatedKernel,
    events: MemoryNotifier,
    runner: RecordingRunner,
}

fn harness_with_reserved(reserved: &[&str]) -> Harness {
    let kernel = SimulatedKernel::new();
    let events = MemoryNotifier::new();
    let runner = RecordingRunner::new();
    let manager = InterfaceManager::new(Box::new(kernel.clone()), Box::new(events.clone()))
        .with_runner(Arc::new(runner.clone()))
        .with_reserved_names(Box::new(StaticReservedNames::new(reserved.iter().copied())));
    Harness {
        manager,
        kernel,
        events,
        runner,
    }
}

fn harness() -> Harness {
    harness_with_reserved(&[])
}

fn link(ifindex: u32, name: &str) -> LinkInfo {
    LinkInfo::new(ifindex, name)
}

fn addr(s: &str) -> IfAddress {
    s.parse().unwrap()
}

fn live_indices(manager: &InterfaceManager) -> Vec<u32> {
    manager.registry().indices()
}

// ============================================================================
// FULL RESYNC
// ============================================================================

#[test]
fn test_resync_discovers_devices_disabled() {
    let mut h = harness();
    h.kernel.set_link(link(1, "eth0"), vec![]);
    h.kernel.set_link(link(2, "eth1"), vec![]);

    h.manager.rescan().unwrap();

    assert_eq!(h.events.created(), vec![1, 2]);
    assert!(h.events.deleted().is_empty());
    assert_eq!(live_indices(&h.manager), vec![1, 2]);
    for device in h.manager.registry().iter() {
        assert!(!device.is_enabled(), "{} should be disabled", device.name());
        assert!(!device.is_managed());
    }
}

#[test]
fn test_resync_removes_vanished_devices() {
    let mut h = harness();
    h.kernel.set_link(link(1, "eth0"), vec![]);
    h.manager.rescan().unwrap();
    h.events.take();

    h.kernel.unset_link(1);
    h.manager.rescan().unwrap();

    assert_eq!(h.events.events(), vec![ControllerEvent::DevDeleted { ifindex: 1 }]);
    assert!(h.manager.registry().is_empty());
}

#[test]
fn test_resync_is_idempotent() {
    let mut h = harness();
    h.kernel.set_link(link(1, "lo"), vec![addr("127.0.0.1/8")]);
    h.kernel.set_link(link(3, "eth0"), vec![addr("192.0.2.1/24")]);
    h.manager.rescan().unwrap();
    assert_eq!(h.events.take().len(), 2);

    h.manager.rescan().unwrap();
    h.manager.rescan().unwrap();
    assert!(h.events.events().is_empty());
}

#[test]
fn test_resync_replaces_addresses() {
    let mut h = harness();
    h.kernel
        .set_link(link(2, "eth0"), vec![addr("10.0.0.1/24"), addr("10.0.0.2/24")]);
    h.manager.rescan().unwrap();

    h.kernel.set_link(link(2, "eth0"), vec![addr("10.0.0.3/24")]);
    h.manager.rescan().unwrap();

    let addrs: Vec<IfAddress> = h
        .manager
        .registry()
        .get(2)
        .unwrap()
        .addresses()
        .copied()
        .collect();
    assert_eq!(addrs, vec![addr("10.0.0.3/24")]);
}

#[test]
fn test_resync_applies_rename() {
    let mut h = harness();
    h.kernel.set_link(link(4, "eth0"), vec![]);
    h.manager.rescan().unwrap();

    h.kernel.set_link(link(4, "ens4").with_mtu(9000), vec![]);
    let device = h.manager.get_device(4).unwrap();
    assert_eq!(device.name(), "ens4");
    assert_eq!(device.mtu(), Some(9000));
}

#[test]
fn test_resync_discards_stale_notifications() {
    let mut h = harness();
    h.kernel.set_link(link(1, "eth0"), vec![]);
    // Queued before the dump, refers to a link the dump no longer reports
    h.kernel.push(KernelMessage::NewLink(link(8, "gone0")));

    h.manager.rescan().unwrap();
    assert_eq!(h.kernel.pending(), 0);

    h.manager.handle_pending_messages().unwrap();
    assert_eq!(live_indices(&h.manager), vec![1]);
    assert_eq!(h.events.created(), vec![1]);
}

// ============================================================================
// INCREMENTAL APPLY
// ============================================================================

#[test]
fn test_link_notification_creates_device() {
    let mut h = harness();
    h.kernel.link_added(link(5, "veth0"));

    h.manager.handle_pending_messages().unwrap();

    let device = h.manager.registry().get(5).unwrap();
    assert_eq!(device.name(), "veth0");
    assert!(!device.is_enabled());
    assert_eq!(h.events.created(), vec![5]);
}

#[test]
fn test_duplicate_notifications_emit_once() {
    let mut h = harness();
    h.kernel.link_added(link(5, "veth0"));
    h.kernel.link_added(link(5, "veth0"));
    h.manager.handle_pending_messages().unwrap();

    h.kernel.link_removed(5);
    h.kernel.push(KernelMessage::DelLink(link(5, "veth0")));
    h.manager.handle_pending_messages().unwrap();

    assert_eq!(h.events.created(), vec![5]);
    assert_eq!(h.events.deleted(), vec![5]);
}

#[test]
fn test_address_update_for_removed_device_is_ignored() {
    let mut h = harness();
    h.kernel.link_added(link(6, "dummy0"));
    h.kernel.link_removed(6);
    h.kernel
        .push(KernelMessage::NewAddress(ifmgrd::types::AddressInfo::new(6, addr("10.1.1.1/32"))));
    h.kernel.push(KernelMessage::Other(24));

    h.manager.handle_pending_messages().unwrap();
    assert!(h.manager.registry().is_empty());
    assert_eq!(h.events.events().len(), 2);
}

#[test]
fn test_live_set_follows_notification_fold() {
    let mut h = harness();
    let sequence: &[(bool, u32)] = &[
        (true, 1),
        (true, 2),
        (true, 3),
        (false, 2),
        (true, 4),
        (false, 1),
        (false, 9),
        (true, 2),
        (false, 4),
        (true, 3),
    ];

    let mut expected = BTreeSet::new();
    for &(added, ifindex) in sequence {
        if added {
            h.kernel.link_added(link(ifindex, &format!("if{}", ifindex)));
            expected.insert(ifindex);
        } else {
            h.kernel.link_removed(ifindex);
            expected.remove(&ifindex);
        }
    }

    h.manager.handle_pending_messages().unwrap();
    assert_eq!(
        live_indices(&h.manager),
        expected.into_iter().collect::<Vec<_>>()
    );
}

#[test]
fn test_reconnect_forces_resync() {
    let mut h = harness();
    h.kernel.link_added(link(1, "eth0"));
    h.manager.handle_pending_messages().unwrap();
    let scans_before = h.kernel.scans();

    // The notification for eth1 is lost with the socket
    h.kernel.link_added(link(2, "eth1"));
    h.kernel.fail_next_drain();
    h.manager.handle_pending_messages().unwrap();

    assert_eq!(h.kernel.reconnects(), 1);
    assert_eq!(h.kernel.scans(), scans_before + 1);
    assert_eq!(live_indices(&h.manager), vec![1, 2]);
    assert_eq!(h.events.created(), vec![1, 2]);
}

#[test]
fn test_reconnect_resync_survives_failed_scan() {
    let mut h = harness();
    h.kernel.link_added(link(1, "eth0"));
    h.manager.handle_pending_messages().unwrap();

    // The DELLINK is lost with the socket and the forced dump fails too
    h.kernel.link_removed(1);
    h.kernel.fail_next_drain();
    h.kernel.fail_next_scan();
    assert!(h.manager.handle_pending_messages().is_err());
    assert_eq!(live_indices(&h.manager), vec![1]);

    // Nothing new is queued, yet the next pass still resyncs
    let scans_before = h.kernel.scans();
    h.manager.handle_pending_messages().unwrap();
    assert_eq!(h.kernel.scans(), scans_before + 1);
    assert!(live_indices(&h.manager).is_empty());
    assert_eq!(h.events.deleted(), vec![1]);

    // Once resynced, drains go back to incremental processing
    h.manager.handle_pending_messages().unwrap();
    assert_eq!(h.kernel.scans(), scans_before + 1);
}

// ============================================================================
// LOOKUPS
// ============================================================================

#[test]
fn test_lookup_by_name_and_hwaddr() {
    let mut h = harness();
    let hw = HwAddress::parse("52:54:00:12:34:56").unwrap();
    h.kernel.set_link(link(2, "eth0").with_hwaddr(hw), vec![]);
    h.kernel.set_link(link(3, "eth1"), vec![]);

    assert_eq!(h.manager.get_device_by_name("eth1").unwrap().ifindex(), 3);
    assert_eq!(
        h.manager
            .get_device_by_hwaddr("52:54:00:12:34:56")
            .unwrap()
            .ifindex(),
        2
    );
    assert_eq!(
        h.manager
            .get_device_by_hwaddr("52-54-00-12-34-56")
            .unwrap()
            .ifindex(),
        2
    );
    assert!(h.manager.get_device_by_name("eth9").unwrap_err().is_not_found());
    assert!(
        h.manager
            .get_device_by_hwaddr("00:00:00:00:00:01")
            .unwrap_err()
            .is_not_found()
    );
}

#[test]
fn test_lookup_forces_resync() {
    let mut h = harness();
    h.kernel.set_link(link(7, "br0"), vec![]);
    assert_eq!(h.manager.get_device(7).unwrap().name(), "br0");
    assert_eq!(h.manager.get_devices().unwrap().len(), 1);
}

#[test]
fn test_lookup_by_params() {
    let mut h = harness();
    h.kernel.set_link(link(2, "eth0").with_mtu(1500), vec![]);
    h.kernel.set_link(link(3, "eth1").with_mtu(9000), vec![]);

    let mut params = Map::new();
    params.insert("mtu".into(), json!(9000));
    assert_eq!(
        h.manager.get_device_by_params(&params).unwrap().unwrap().name(),
        "eth1"
    );

    params.insert("name".into(), json!("eth0"));
    assert!(h.manager.get_device_by_params(&params).unwrap().is_none());
}

#[test]
fn test_tombstoned_device_is_never_returned() {
    let mut h = harness();
    h.kernel.set_link(link(4, "veth0"), vec![]);
    let handle = h.manager.get_device(4).unwrap().handle();

    h.kernel.link_removed(4);
    h.manager.handle_pending_messages().unwrap();

    assert!(h.manager.get_device(4).unwrap_err().is_not_found());
    assert!(h.manager.resolve(handle).unwrap_err().is_not_found());

    // Same ifindex reused by a new link: the old handle still does not resolve
    h.kernel.set_link(link(4, "veth9"), vec![]);
    assert_eq!(h.manager.get_device(4).unwrap().name(), "veth9");
    assert!(h.manager.resolve(handle).is_err());
}

// ============================================================================
// DEVICE CREATION
// ============================================================================

#[tokio::test]
async fn test_create_generic_binds_by_name() {
    let mut h = harness();
    h.kernel.set_link(link(7, "veth0"), vec![]);

    let handle = h
        .manager
        .create_device(DeviceKind::Generic, &DeviceArgs::positional(["veth0"]))
        .await
        .unwrap()
        .expect("device should be bound");

    assert_eq!(handle.ifindex, 7);
    let device = h.manager.resolve(handle).unwrap();
    assert!(device.is_managed());
    assert_eq!(device.kind(), DeviceKind::Generic);
    assert!(h.runner.commands().is_empty());
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn test_create_veth_runs_ip_link() {
    let mut h = harness();
    h.kernel.set_link(link(12, "veth0").with_link_kind("veth"), vec![]);

    let args = DeviceArgs::positional(["veth0", "veth1"]);
    let handle = h
        .manager
        .create_device(DeviceKind::Veth, &args)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        h.runner.commands(),
        vec!["/sbin/ip link add name \"veth0\" type veth peer name \"veth1\"".to_string()]
    );
    let snapshot = h.manager.resolve(handle).unwrap().snapshot();
    assert_eq!(snapshot["kind"], json!("VethDevice"));
    assert_eq!(snapshot["peer"], json!("veth1"));
    assert_eq!(snapshot["managed"], json!(true));
}

#[tokio::test]
async fn test_create_without_kernel_match_returns_none() {
    let mut h = harness();
    let result = h
        .manager
        .create_device(DeviceKind::Dummy, &DeviceArgs::positional(["dummy0"]))
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(h.manager.registry().is_empty());
}

#[tokio::test]
async fn test_create_missing_argument_is_configuration_error() {
    let mut h = harness();
    let err = h
        .manager
        .create_device(DeviceKind::Vlan, &DeviceArgs::positional(["eth0.10"]))
        .await
        .unwrap_err();
    assert!(matches!(err, IfmgrError::Configuration(_)));
    assert!(h.runner.commands().is_empty());
}

#[tokio::test]
async fn test_create_command_failure_propagates() {
    let mut h = harness();
    h.runner.respond(
        "/sbin/ip link add name \"br0\" type bridge",
        ExecResult {
            exit_code: 2,
            stdout: String::new(),
            stderr: "RTNETLINK answers: File exists".to_string(),
        },
    );
    let err = h
        .manager
        .create_device(DeviceKind::Bridge, &DeviceArgs::positional(["br0"]))
        .await
        .unwrap_err();
    assert!(matches!(err, IfmgrError::Command { exit_code: 2, .. }));
}

#[tokio::test]
async fn test_create_replaces_discovered_entry() {
    let mut h = harness();
    h.kernel.set_link(link(9, "dummy0"), vec![]);
    h.manager.rescan().unwrap();
    let discovered = h.manager.registry().get(9).unwrap().handle();

    let handle = h
        .manager
        .create_device(DeviceKind::Dummy, &DeviceArgs::positional(["dummy0"]))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(handle.ifindex, 9);
    assert_ne!(handle, discovered);
    assert_eq!(h.manager.registry().len(), 1);
    assert!(h.manager.resolve(handle).unwrap().is_managed());
}

#[test]
fn test_device_class_registration() {
    let mut h = harness();
    let err = h
        .manager
        .add_device_class(Box::new(LinkFactory(DeviceKind::Bridge)))
        .unwrap_err();
    assert!(matches!(err, IfmgrError::Configuration(_)));

    h.manager.clear_device_classes();
    h.manager
        .add_device_class(Box::new(LinkFactory(DeviceKind::Bridge)))
        .unwrap();
}

#[tokio::test]
async fn test_cleared_classes_reject_creation() {
    let mut h = harness();
    h.manager.clear_device_classes();
    let err = h
        .manager
        .create_device(DeviceKind::Dummy, &DeviceArgs::positional(["dummy0"]))
        .await
        .unwrap_err();
    assert!(matches!(err, IfmgrError::Configuration(_)));
}

// ============================================================================
// REGISTRY SURGERY
// ============================================================================

#[test]
fn test_replace_device() {
    let mut h = harness();
    h.kernel.set_link(link(3, "eth0"), vec![]);
    let old = h.manager.get_device(3).unwrap().handle();

    let replacement = Device::discovered(&link(3, "eth0"));
    let new = h.manager.replace(3, replacement).unwrap();

    assert_ne!(old, new);
    assert!(h.manager.resolve(old).is_err());
    assert!(h.manager.resolve(new).is_ok());
    assert!(
        h.manager
            .replace(42, Device::discovered(&link(42, "x")))
            .unwrap_err()
            .is_not_found()
    );
}

#[test]
fn test_untracked_device_is_rediscovered() {
    let mut h = harness();
    h.kernel.set_link(link(3, "eth0"), vec![]);
    let handle = h.manager.get_device(3).unwrap().handle();
    h.events.take();

    h.manager.untrack(handle).unwrap();
    assert!(h.events.events().is_empty());

    // Still in the kernel, so the next resync picks it up again
    h.manager.rescan().unwrap();
    assert_eq!(h.events.created(), vec![3]);
}

// ============================================================================
// NAME ALLOCATION
// ============================================================================

#[tokio::test]
async fn test_assign_name_skips_used_and_reserved() {
    let mut h = harness_with_reserved(&["veth1"]);
    h.kernel.set_link(link(2, "veth0"), vec![]);
    h.kernel.set_link(link(3, "veth2"), vec![]);

    assert_eq!(h.manager.assign_name("veth").await.unwrap(), "veth3");
    assert_eq!(h.manager.assign_name("br").await.unwrap(), "br0");
}

#[tokio::test]
async fn test_assign_name_pair_is_ordered() {
    let mut h = harness_with_reserved(&["t1", "t3"]);
    h.kernel.set_link(link(2, "t2"), vec![]);

    let (first, second) = h.manager.assign_name_pair("t").await.unwrap();
    assert_eq!((first.as_str(), second.as_str()), ("t0", "t4"));

    let mut h = harness_with_reserved(&["t0"]);
    let (first, second) = h.manager.assign_name_pair("t").await.unwrap();
    assert_eq!((first.as_str(), second.as_str()), ("t1", "t2"));
}

#[tokio::test]
async fn test_assign_name_queries_ovs_once() {
    let kernel = SimulatedKernel::new();
    let runner = RecordingRunner::new();
    let ovs = OvsInterfaceNames::new(Arc::new(runner.clone()));
    runner.respond(ovs.command(), ExecResult::ok("name : \"ovs0\"\nname : \"ovs1\""));
    let mut manager = InterfaceManager::new(Box::new(kernel), Box::new(MemoryNotifier::new()))
        .with_runner(Arc::new(runner.clone()))
        .with_reserved_names(Box::new(ovs));

    let (a, b) = manager.assign_name_pair("ovs").await.unwrap();
    assert_eq!((a.as_str(), b.as_str()), ("ovs2", "ovs3"));
    assert_eq!(runner.commands().len(), 1);
}

// ============================================================================
// NOTIFICATION FORMAT
// ============================================================================

#[test]
fn test_created_event_carries_snapshot() {
    let mut h = harness();
    h.kernel.set_link(
        link(2, "eth0").with_hwaddr(HwAddress::parse("52:54:00:aa:bb:cc").unwrap()),
        vec![addr("192.0.2.5/24")],
    );
    h.manager.rescan().unwrap();

    let events = h.events.events();
    let ControllerEvent::DevCreated { dev_data } = &events[0] else {
        panic!("expected dev_created, got {:?}", events[0]);
    };
    assert_eq!(dev_data["ifindex"], json!(2));
    assert_eq!(dev_data["name"], json!("eth0"));
    assert_eq!(dev_data["hwaddr"], json!("52:54:00:aa:bb:cc"));
    assert_eq!(dev_data["ip_addrs"], json!(["192.0.2.5/24"]));
    assert_eq!(dev_data["managed"], json!(false));
}

#[test]
fn test_json_lines_output() {
    let kernel = SimulatedKernel::new();
    kernel.set_link(link(1, "lo"), vec![]);
    let mut manager = InterfaceManager::new(
        Box::new(kernel.clone()),
        Box::new(JsonLinesNotifier::new(std::io::sink())),
    )
    .with_reserved_names(Box::new(StaticReservedNames::default()));
    manager.rescan().unwrap();
    assert_eq!(manager.registry().len(), 1);
}
