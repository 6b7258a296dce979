//! Test fixtures for common activation scenarios
//!
//! Profile builders plus a small harness that wires an in-memory kernel to a
//! device manager.

use std::sync::Arc;

use netdev_core::{
    ConnectionProfile, Device, DeviceClass, DeviceManager, DeviceResult, IpMethod,
    BOND_CONNECTION_TYPE, ETHERNET_CONNECTION_TYPE,
};
use netdev_platform::{InMemoryPlatform, LinkType};

/// Bond master profiles
pub mod bond_fixtures {
    use super::*;

    /// Bond bound to `iface` with an empty bond setting and no IP
    /// configuration.
    pub fn bond_profile(iface: &str) -> ConnectionProfile {
        let mut profile = ConnectionProfile::new(iface, BOND_CONNECTION_TYPE)
            .with_interface_name(iface)
            .with_ip_method(IpMethod::Disabled);
        profile.bond = Some(Default::default());
        profile
    }

    /// Bond with the given options declared.
    pub fn bond_with_options(iface: &str, options: &[(&str, &str)]) -> ConnectionProfile {
        options
            .iter()
            .fold(bond_profile(iface), |profile, (name, value)| {
                profile.with_bond_option(*name, *value)
            })
    }

    /// Active-backup bond preferring `primary`, with ARP validation.
    pub fn active_backup(iface: &str, primary: &str) -> ConnectionProfile {
        bond_with_options(
            iface,
            &[
                ("mode", "active-backup"),
                ("arp_validate", "active"),
                ("primary", primary),
            ],
        )
    }

    /// 802.3ad bond with fast LACP and a layer3+4 hash.
    pub fn lacp(iface: &str) -> ConnectionProfile {
        bond_with_options(
            iface,
            &[
                ("mode", "802.3ad"),
                ("lacp_rate", "fast"),
                ("xmit_hash_policy", "layer3+4"),
                ("miimon", "100"),
            ],
        )
    }
}

/// Ethernet profiles
pub mod ethernet_fixtures {
    use super::*;

    /// Standalone Ethernet profile waiting for autoconfig.
    pub fn ethernet_profile(iface: &str) -> ConnectionProfile {
        ConnectionProfile::new(iface, ETHERNET_CONNECTION_TYPE).with_interface_name(iface)
    }

    /// Ethernet profile enslaved to a bond.
    pub fn bond_slave(iface: &str, master: &str) -> ConnectionProfile {
        ethernet_profile(iface).with_master(master, "bond")
    }
}

/// In-memory kernel plus a device manager driving it.
pub struct TestNetwork {
    /// The simulated kernel.
    pub platform: Arc<InMemoryPlatform>,
    /// The manager under test.
    pub manager: DeviceManager,
}

impl TestNetwork {
    /// Creates an empty network with the given device classes registered.
    pub fn new(classes: Vec<Arc<dyn DeviceClass>>) -> Self {
        Self::with_platform(InMemoryPlatform::new(), classes)
    }

    /// Creates a network on a preconfigured simulation (e.g. with latency).
    pub fn with_platform(platform: InMemoryPlatform, classes: Vec<Arc<dyn DeviceClass>>) -> Self {
        let platform = Arc::new(platform);
        let manager = DeviceManager::new(platform.clone());
        for class in classes {
            manager.register_class(class);
        }
        Self { platform, manager }
    }

    /// Seeds physical NICs in the kernel and discovers them.
    pub async fn with_nics(self, names: &[&str]) -> DeviceResult<Self> {
        for name in names {
            self.platform.add_link(name, LinkType::Ethernet);
        }
        self.manager.discover().await?;
        Ok(self)
    }

    /// Returns a managed device.
    pub fn device(&self, iface: &str) -> Option<Arc<Device>> {
        self.manager.device(iface)
    }

    /// Returns the kernel ifindex of a managed device.
    pub fn ifindex(&self, iface: &str) -> Option<i32> {
        self.device(iface).and_then(|d| d.ifindex())
    }

    /// Re-activates every queued request whose constraints are satisfied,
    /// until the queue stops producing work. Returns the number of requests
    /// processed.
    pub async fn settle(&self) -> usize {
        let mut processed = 0;
        loop {
            let ready = self.manager.take_ready_activations();
            if ready.is_empty() {
                return processed;
            }
            for profile in ready {
                processed += 1;
                let _ = self.manager.activate((*profile).clone()).await;
            }
        }
    }
}
