//! Connection profile model.
//!
//! A profile is the declarative description of how one device should be
//! configured. Profiles are read-only to the engine: anything that derives a
//! profile from running state returns a new value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, DeviceResult};

/// Connection type of bond master profiles.
pub const BOND_CONNECTION_TYPE: &str = "bond";

/// Connection type of wired Ethernet profiles.
pub const ETHERNET_CONNECTION_TYPE: &str = "802-3-ethernet";

fn default_true() -> bool {
    true
}

fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The `connection` setting every profile carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectionSetting {
    /// Human-readable identifier.
    pub id: String,
    /// Stable unique identifier.
    #[serde(default = "generate_uuid")]
    pub uuid: String,
    /// Profile type, e.g. `bond` or `802-3-ethernet`.
    #[serde(rename = "type")]
    pub connection_type: String,
    /// Interface the profile is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,
    /// Interface name of the master, for slave profiles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
    /// Slave type marker, e.g. `bond`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_type: Option<String>,
    /// Whether the controller activates this profile on its own.
    #[serde(default = "default_true")]
    pub autoconnect: bool,
}

/// Bonding options as declared: option name to string value.
///
/// The map guarantees at most one value per option name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondSetting {
    /// Declared options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl BondSetting {
    /// Returns the declared value of an option.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    /// Declares an option, replacing any earlier value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.options.insert(name.into(), value.into());
    }

    /// Removes an option declaration.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.options.remove(name)
    }

    /// Returns true if the option is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    /// Iterates declared options in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Wired (link-layer) settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiredSetting {
    /// Requested MTU. `None` or `0` leaves the MTU alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

/// How IP configuration is obtained once the link layer is up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpMethod {
    /// Delegate to the autoconfig collaborator and wait for its result.
    #[default]
    Auto,
    /// No IP configuration; the link layer is the whole activation.
    Disabled,
}

/// IP settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSetting {
    /// Configuration method.
    #[serde(default)]
    pub method: IpMethod,
}

/// A connection profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Identity and topology.
    pub connection: ConnectionSetting,
    /// Bonding options, for bond profiles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bond: Option<BondSetting>,
    /// Wired settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wired: Option<WiredSetting>,
    /// IP settings.
    #[serde(default)]
    pub ip: IpSetting,
}

impl ConnectionProfile {
    /// Creates a profile with a fresh UUID.
    pub fn new(id: impl Into<String>, connection_type: impl Into<String>) -> Self {
        Self {
            connection: ConnectionSetting {
                id: id.into(),
                uuid: generate_uuid(),
                connection_type: connection_type.into(),
                interface_name: None,
                master: None,
                slave_type: None,
                autoconnect: true,
            },
            bond: None,
            wired: None,
            ip: IpSetting::default(),
        }
    }

    /// Sets the interface name.
    pub fn with_interface_name(mut self, name: impl Into<String>) -> Self {
        self.connection.interface_name = Some(name.into());
        self
    }

    /// Marks the profile as a slave of `master`.
    pub fn with_master(mut self, master: impl Into<String>, slave_type: impl Into<String>) -> Self {
        self.connection.master = Some(master.into());
        self.connection.slave_type = Some(slave_type.into());
        self
    }

    /// Declares a bonding option, creating the bond setting if needed.
    pub fn with_bond_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.bond.get_or_insert_with(BondSetting::default).set(name, value);
        self
    }

    /// Sets the wired MTU.
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.wired.get_or_insert_with(WiredSetting::default).mtu = Some(mtu);
        self
    }

    /// Sets the IP method.
    pub fn with_ip_method(mut self, method: IpMethod) -> Self {
        self.ip.method = method;
        self
    }

    /// Returns the connection id.
    pub fn id(&self) -> &str {
        &self.connection.id
    }

    /// Returns the connection UUID.
    pub fn uuid(&self) -> &str {
        &self.connection.uuid
    }

    /// Returns the connection type.
    pub fn connection_type(&self) -> &str {
        &self.connection.connection_type
    }

    /// Returns the bound interface name.
    pub fn interface_name(&self) -> Option<&str> {
        self.connection.interface_name.as_deref()
    }

    /// Returns the master interface name for slave profiles.
    pub fn master(&self) -> Option<&str> {
        self.connection.master.as_deref()
    }

    /// Returns true if this profile describes a slave.
    pub fn is_slave(&self) -> bool {
        self.connection.master.is_some()
    }

    /// Returns the declared MTU, ignoring zero.
    pub fn mtu(&self) -> Option<u32> {
        self.wired.as_ref().and_then(|w| w.mtu).filter(|mtu| *mtu != 0)
    }

    /// Structural checks shared by every device type.
    pub fn verify(&self) -> DeviceResult<()> {
        if self.connection.id.trim().is_empty() {
            return Err(DeviceError::invalid_profile("connection id is empty"));
        }
        if self.connection.uuid.is_empty() {
            return Err(DeviceError::invalid_profile(format!(
                "connection '{}' has no uuid",
                self.connection.id
            )));
        }
        if uuid::Uuid::parse_str(&self.connection.uuid).is_err() {
            return Err(DeviceError::invalid_profile(format!(
                "connection '{}' has malformed uuid '{}'",
                self.connection.id, self.connection.uuid
            )));
        }
        if self.connection.connection_type.is_empty() {
            return Err(DeviceError::invalid_profile(format!(
                "connection '{}' has no type",
                self.connection.id
            )));
        }
        if self.connection.master.is_some() && self.connection.slave_type.is_none() {
            return Err(DeviceError::invalid_profile(format!(
                "connection '{}' has a master but no slave type",
                self.connection.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let profile = ConnectionProfile::new("bond0", BOND_CONNECTION_TYPE)
            .with_interface_name("bond0")
            .with_bond_option("mode", "active-backup")
            .with_bond_option("mode", "802.3ad")
            .with_mtu(9000);

        assert_eq!(profile.interface_name(), Some("bond0"));
        assert_eq!(profile.bond.as_ref().and_then(|b| b.get("mode")), Some("802.3ad"));
        assert_eq!(profile.mtu(), Some(9000));
        assert!(!profile.is_slave());
        assert!(profile.verify().is_ok());
    }

    #[test]
    fn test_zero_mtu_is_unset() {
        let profile = ConnectionProfile::new("eth0", ETHERNET_CONNECTION_TYPE).with_mtu(0);
        assert_eq!(profile.mtu(), None);
    }

    #[test]
    fn test_verify_rejects_missing_fields() {
        let mut profile = ConnectionProfile::new("", BOND_CONNECTION_TYPE);
        assert!(matches!(
            profile.verify(),
            Err(DeviceError::InvalidProfile { .. })
        ));

        profile.connection.id = "bond0".to_string();
        profile.connection.uuid = "not-a-uuid".to_string();
        assert!(profile.verify().is_err());

        profile.connection.uuid = generate_uuid();
        profile.connection.connection_type.clear();
        assert!(profile.verify().is_err());
    }

    #[test]
    fn test_slave_requires_slave_type() {
        let mut profile =
            ConnectionProfile::new("eth0", ETHERNET_CONNECTION_TYPE).with_master("bond0", "bond");
        assert!(profile.is_slave());
        assert!(profile.verify().is_ok());

        profile.connection.slave_type = None;
        assert!(profile.verify().is_err());
    }

    #[test]
    fn test_deserialize_from_toml_shape() {
        let json = r#"{
            "connection": {"id": "office", "type": "bond", "interface-name": "bond0"},
            "bond": {"options": {"mode": "active-backup", "miimon": "100"}},
            "ip": {"method": "disabled"}
        }"#;
        let profile: ConnectionProfile = serde_json::from_str(json).unwrap();

        assert_eq!(profile.id(), "office");
        assert!(profile.connection.autoconnect);
        assert!(uuid::Uuid::parse_str(profile.uuid()).is_ok());
        assert_eq!(profile.ip.method, IpMethod::Disabled);
        assert_eq!(profile.bond.unwrap().options.len(), 2);
    }
}
