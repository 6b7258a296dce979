//! Bond activation through the device manager
//!
//! Exercises bonds together with their Ethernet slaves on the in-memory
//! kernel: creation, option programming, enslavement ordering, queued
//! slaves, teardown, reconciliation and snapshots.

use std::sync::Arc;
use std::time::Duration;

use netdev_bond::{opts, BondClass};
use netdev_core::{
    ActivationOutcome, DeviceClass, DeviceError, DeviceState, EthernetClass, StateReason,
};
use netdev_platform::{InMemoryPlatform, PlatformOp};
use netdev_test::{
    fixtures::{bond_fixtures, ethernet_fixtures},
    OpLog, TestNetwork,
};
use pretty_assertions::assert_eq;

fn classes() -> Vec<Arc<dyn DeviceClass>> {
    vec![Arc::new(EthernetClass::new()), Arc::new(BondClass::new())]
}

async fn network(nics: &[&str]) -> TestNetwork {
    TestNetwork::new(classes())
        .with_nics(nics)
        .await
        .expect("discovery failed")
}

/// Scenario:
/// 1. Activate an active-backup bond that does not exist in the kernel yet
/// 2. Verify the link is created and programmed in dependency order
#[tokio::test]
async fn test_active_backup_bond_is_created_and_programmed() {
    let net = network(&[]).await;

    let outcome = net
        .manager
        .activate(bond_fixtures::active_backup("bond0", "eth0"))
        .await
        .unwrap();

    assert_eq!(outcome, ActivationOutcome::Activated);
    let bond = net.device("bond0").unwrap();
    assert_eq!(bond.state(), DeviceState::Activated);
    let ifindex = net.ifindex("bond0").unwrap();

    let log = OpLog::capture(&net.platform);
    assert!(matches!(
        log.ops().first(),
        Some(PlatformOp::CreateLink { name, .. }) if name == "bond0"
    ));
    log.assert_write_order(
        ifindex,
        &[
            (opts::MODE, "active-backup"),
            (opts::MIIMON, "100"),
            (opts::ARP_VALIDATE, "active"),
            (opts::PRIMARY, "eth0"),
        ],
    )
    .unwrap();
    log.assert_op_after(&PlatformOp::LinkDown { ifindex }, &PlatformOp::LinkUp { ifindex })
        .unwrap();
    assert!(bond.diagnostics().is_empty());
}

#[tokio::test]
async fn test_creation_failure_surfaces_message() {
    let net = network(&[]).await;
    net.platform.fail_create(true);

    let err = net
        .manager
        .activate(bond_fixtures::bond_profile("bond0"))
        .await
        .unwrap_err();

    assert!(matches!(err, DeviceError::CreationFailed { .. }));
    assert!(err
        .to_string()
        .starts_with("Failed to create bond interface 'bond0' for 'bond0'"));
    let bond = net.device("bond0").unwrap();
    assert_eq!(bond.state(), DeviceState::Failed);
    assert_eq!(bond.state_reason(), StateReason::CreationFailed);
}

#[tokio::test]
async fn test_unknown_mode_fails_without_programming() {
    let net = network(&[]).await;

    let outcome = net
        .manager
        .activate(bond_fixtures::bond_with_options("bond0", &[("mode", "fastest")]))
        .await
        .unwrap();

    assert_eq!(outcome, ActivationOutcome::Failed(StateReason::ConfigFailed));
    let ifindex = net.ifindex("bond0").unwrap();
    assert!(OpLog::capture(&net.platform)
        .attribute_writes(ifindex)
        .is_empty());
}

#[tokio::test]
async fn test_profile_without_bond_setting_is_rejected_up_front() {
    let net = network(&[]).await;
    let mut profile = bond_fixtures::bond_profile("bond0");
    profile.bond = None;

    let err = net.manager.activate(profile).await.unwrap_err();

    assert!(matches!(err, DeviceError::IncompatibleProfile { .. }));
    assert!(net.platform.ops().is_empty());
}

/// Scenario:
/// 1. Activate bond0, then eth0 and eth1 as its slaves
/// 2. Verify each slave is taken down, enslaved and brought back up
/// 3. Verify slave profiles are stamped with the master
#[tokio::test]
async fn test_slaves_are_enslaved_down_attach_up() {
    let net = network(&["eth0", "eth1"]).await;
    net.manager
        .activate(bond_fixtures::active_backup("bond0", "eth0"))
        .await
        .unwrap();
    let bond_index = net.ifindex("bond0").unwrap();
    net.platform.clear_ops();

    for slave in ["eth0", "eth1"] {
        let outcome = net
            .manager
            .activate(ethernet_fixtures::bond_slave(slave, "bond0"))
            .await
            .unwrap();
        assert_eq!(outcome, ActivationOutcome::Activated);
    }

    let eth0 = net.ifindex("eth0").unwrap();
    let eth1 = net.ifindex("eth1").unwrap();
    assert_eq!(
        net.platform.ops(),
        vec![
            PlatformOp::LinkDown { ifindex: eth0 },
            PlatformOp::Enslave {
                master: bond_index,
                slave: eth0
            },
            PlatformOp::LinkUp { ifindex: eth0 },
            PlatformOp::LinkDown { ifindex: eth1 },
            PlatformOp::Enslave {
                master: bond_index,
                slave: eth1
            },
            PlatformOp::LinkUp { ifindex: eth1 },
        ]
    );

    let bond = net.device("bond0").unwrap();
    let slaves: Vec<String> = bond.slaves().iter().map(|s| s.iface().to_string()).collect();
    assert_eq!(slaves, vec!["eth0".to_string(), "eth1".to_string()]);

    let applied = net.device("eth0").unwrap().applied_profile().unwrap();
    assert_eq!(applied.master(), Some("bond0"));
    assert_eq!(applied.connection.slave_type.as_deref(), Some("bond"));
}

#[tokio::test]
async fn test_slave_waits_for_master() {
    let net = network(&["eth0"]).await;

    let outcome = net
        .manager
        .activate(ethernet_fixtures::bond_slave("eth0", "bond0"))
        .await
        .unwrap();
    assert_eq!(outcome, ActivationOutcome::Queued);
    assert_eq!(net.manager.pending_count(), 1);

    net.manager
        .activate(bond_fixtures::bond_profile("bond0"))
        .await
        .unwrap();
    assert_eq!(net.settle().await, 1);

    assert_eq!(net.device("eth0").unwrap().state(), DeviceState::Activated);
    assert!(net.device("bond0").unwrap().has_slave("eth0"));
    assert_eq!(net.manager.pending_count(), 0);
}

#[tokio::test]
async fn test_enslave_failure_fails_only_the_slave() {
    let net = network(&["eth0"]).await;
    net.manager
        .activate(bond_fixtures::bond_profile("bond0"))
        .await
        .unwrap();
    net.platform.fail_enslave(true);

    let outcome = net
        .manager
        .activate(ethernet_fixtures::bond_slave("eth0", "bond0"))
        .await
        .unwrap();

    assert_eq!(outcome, ActivationOutcome::Failed(StateReason::AttachFailed));
    let eth0 = net.ifindex("eth0").unwrap();
    assert_eq!(
        OpLog::capture(&net.platform).ops().last(),
        Some(&PlatformOp::LinkUp { ifindex: eth0 })
    );
    assert_eq!(net.device("bond0").unwrap().state(), DeviceState::Activated);
}

/// Scenario:
/// 1. Bond with two slaves is active
/// 2. Deactivate the bond; release of eth0 fails in the kernel
/// 3. Verify every released slave is brought back up and disconnected
#[tokio::test]
async fn test_deactivating_bond_releases_and_restores_slaves() {
    let net = network(&["eth0", "eth1"]).await;
    net.manager
        .activate(bond_fixtures::bond_profile("bond0"))
        .await
        .unwrap();
    for slave in ["eth0", "eth1"] {
        net.manager
            .activate(ethernet_fixtures::bond_slave(slave, "bond0"))
            .await
            .unwrap();
    }
    net.platform.clear_ops();
    net.platform.fail_release(true);

    net.manager.deactivate("bond0").await.unwrap();

    let log = OpLog::capture(&net.platform);
    let bond_index = net.ifindex("bond0").unwrap();
    for slave in ["eth0", "eth1"] {
        let ifindex = net.ifindex(slave).unwrap();
        log.assert_op_after(
            &PlatformOp::Release {
                master: bond_index,
                slave: ifindex,
            },
            &PlatformOp::LinkUp { ifindex },
        )
        .unwrap();
        let device = net.device(slave).unwrap();
        assert_eq!(device.state(), DeviceState::Disconnected);
        assert_eq!(device.state_reason(), StateReason::DependencyFailed);
    }
    let bond = net.device("bond0").unwrap();
    assert_eq!(bond.state(), DeviceState::Disconnected);
    assert!(bond.slaves().is_empty());
    assert_eq!(
        log.ops().last(),
        Some(&PlatformOp::LinkDown {
            ifindex: bond_index
        })
    );
}

#[tokio::test]
async fn test_concurrent_activations_never_overlap() {
    let net = TestNetwork::with_platform(
        InMemoryPlatform::new().with_latency(Duration::from_millis(5)),
        classes(),
    );
    let profile = bond_fixtures::active_backup("bond0", "eth0");

    let (first, second) = tokio::join!(
        net.manager.activate(profile.clone()),
        net.manager.activate(profile.clone())
    );

    let results = [first, second];
    let activated = results
        .iter()
        .filter(|r| matches!(r, Ok(ActivationOutcome::Activated)))
        .count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(DeviceError::Busy { .. })))
        .count();
    assert_eq!((activated, busy), (1, 1));

    let ifindex = net.ifindex("bond0").unwrap();
    let log = OpLog::capture(&net.platform);
    assert_eq!(log.values_of(ifindex, opts::MODE), vec!["active-backup".to_string()]);
    let creates = log
        .ops()
        .iter()
        .filter(|op| matches!(op, PlatformOp::CreateLink { .. }))
        .count();
    assert_eq!(creates, 1);
    assert_eq!(net.manager.pending_count(), 1);
}

#[tokio::test]
async fn test_reconcile_repairs_drift() {
    let net = network(&[]).await;
    net.manager
        .activate(bond_fixtures::active_backup("bond0", "eth0"))
        .await
        .unwrap();
    let ifindex = net.ifindex("bond0").unwrap();

    let report = net.manager.reconcile("bond0").await.unwrap();
    assert!(report.in_sync());

    net.platform.seed_attribute(ifindex, opts::PRIMARY, "eth7");
    let report = net.manager.reconcile("bond0").await.unwrap();

    assert_eq!(report.drifted, vec![opts::PRIMARY.to_string()]);
    assert_eq!(report.result.map(|r| r.is_success()), Some(true));
    assert_eq!(
        net.platform.attribute(ifindex, opts::PRIMARY).as_deref(),
        Some("eth0")
    );
    assert!(net.manager.reconcile("bond0").await.unwrap().in_sync());
}

#[tokio::test]
async fn test_snapshot_carries_reconciled_profile() {
    let net = network(&["eth0"]).await;
    net.manager
        .activate(bond_fixtures::lacp("bond0"))
        .await
        .unwrap();
    net.manager
        .activate(ethernet_fixtures::bond_slave("eth0", "bond0"))
        .await
        .unwrap();

    let snapshot = net.manager.snapshot("bond0").await.unwrap();

    assert_eq!(snapshot.device_type, "bond");
    assert_eq!(snapshot.slaves, vec!["eth0".to_string()]);
    let reconciled = snapshot.reconciled.unwrap().bond.unwrap();
    let options: Vec<(&str, &str)> = reconciled.iter().collect();
    assert_eq!(
        options,
        vec![
            (opts::LACP_RATE, "fast"),
            (opts::MODE, "802.3ad"),
            (opts::XMIT_HASH_POLICY, "layer3+4"),
        ]
    );

    let json = serde_json::to_value(net.manager.snapshot("eth0").await.unwrap()).unwrap();
    assert_eq!(json["master"], "bond0");
    assert_eq!(json["state"], "activated");
}

#[tokio::test]
async fn test_complete_connection_for_new_bond() {
    let net = network(&[]).await;
    let existing = vec![bond_fixtures::bond_profile("bond0")];
    let mut partial = netdev_core::ConnectionProfile::new("", "bond");
    partial.connection.uuid.clear();

    let completed = net
        .manager
        .complete_connection(partial, &existing)
        .unwrap();

    assert_eq!(completed.id(), "Bond connection 1");
    assert_eq!(completed.interface_name(), Some("bond1"));
    assert!(completed.bond.is_some());
}
