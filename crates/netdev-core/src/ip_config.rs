//! IP configuration delivered by the autoconfig collaborator.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static NEXT_CONFIG_ID: AtomicU64 = AtomicU64::new(1);

/// Origin of a configuration value. Higher variants take precedence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IpConfigSource {
    /// Not set.
    #[default]
    Unknown,
    /// Read back from the kernel.
    Kernel,
    /// Supplied by DHCP or another autoconfig method.
    Dhcp,
    /// Declared in the profile.
    User,
}

/// An address with prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IpAddress {
    /// The address.
    pub address: IpAddr,
    /// Prefix length.
    pub prefix: u8,
}

/// A computed IP configuration about to be committed to a device.
///
/// The `id` is assigned at construction and survives any mutation, so hooks
/// that tweak the configuration keep its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpConfig {
    id: u64,
    /// Assigned addresses.
    pub addresses: Vec<IpAddress>,
    /// Default gateway.
    pub gateway: Option<IpAddr>,
    mtu: Option<u32>,
    mtu_source: IpConfigSource,
}

impl IpConfig {
    /// Creates an empty configuration with a fresh identity.
    pub fn new() -> Self {
        Self {
            id: NEXT_CONFIG_ID.fetch_add(1, Ordering::Relaxed),
            addresses: Vec::new(),
            gateway: None,
            mtu: None,
            mtu_source: IpConfigSource::Unknown,
        }
    }

    /// Returns the identity of this configuration.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Adds an address.
    pub fn with_address(mut self, address: IpAddr, prefix: u8) -> Self {
        self.addresses.push(IpAddress { address, prefix });
        self
    }

    /// Sets the gateway.
    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Returns the MTU, if any source set one.
    pub fn mtu(&self) -> Option<u32> {
        self.mtu
    }

    /// Returns where the MTU came from.
    pub fn mtu_source(&self) -> IpConfigSource {
        self.mtu_source
    }

    /// Sets the MTU unless a higher-precedence source already did.
    ///
    /// Returns true if the value was taken.
    pub fn set_mtu(&mut self, mtu: u32, source: IpConfigSource) -> bool {
        if source < self.mtu_source {
            return false;
        }
        self.mtu = Some(mtu);
        self.mtu_source = source;
        true
    }
}

impl Default for IpConfig {
    fn default() -> Self {
        Self::new()
    }
}
