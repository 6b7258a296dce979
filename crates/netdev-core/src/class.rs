//! Capability-set dispatch for device types.
//!
//! Every device type implements [`DeviceClass`]. Stage hooks have default
//! bodies that forward to the [`base`] module; a specialization that needs
//! more calls the `base` function first and then adds its own checks, so the
//! generic behaviour is extended rather than replaced.

use std::sync::Arc;

use async_trait::async_trait;
use netdev_platform::{LinkType, Platform, PlatformLink};

use crate::device::{Device, DeviceCapabilities};
use crate::error::{DeviceError, DeviceResult};
use crate::ip_config::IpConfig;
use crate::profile::ConnectionProfile;
use crate::stage::{ActStageReturn, Diagnostics};

/// Everything a stage hook may touch.
pub struct StageContext<'a> {
    /// Kernel link operations.
    pub platform: &'a dyn Platform,
    /// The device being activated.
    pub device: &'a Arc<Device>,
    /// The profile being applied.
    pub profile: &'a ConnectionProfile,
}

/// Type-specific behaviour of a device.
///
/// # Stage hooks
///
/// 1. [`act_stage1_prepare`](Self::act_stage1_prepare): validation, may
///    return `Postpone`
/// 2. [`act_stage2_config`](Self::act_stage2_config): link-layer configuration
/// 3. [`ip_config_pre_commit`](Self::ip_config_pre_commit): last look at an
///    IP configuration before it is committed
///
/// Masters also implement the enslavement hooks. Slave attach and detach
/// always go through them so the down/attach/up discipline lives in one place.
#[async_trait]
pub trait DeviceClass: Send + Sync {
    /// Human-readable type name used in logs and errors.
    fn type_description(&self) -> &'static str;

    /// Kernel link type handled by this class.
    fn link_type(&self) -> LinkType;

    /// Connection type of profiles this class accepts.
    fn connection_type(&self) -> &'static str;

    /// Capabilities every device of this class has.
    fn generic_capabilities(&self) -> DeviceCapabilities;

    /// Returns true if devices of this class can have slaves.
    fn is_master(&self) -> bool {
        false
    }

    /// Returns true if the device can be activated right now.
    fn is_available(&self, device: &Device) -> bool {
        base::is_available(device)
    }

    /// Returns true if `profile` can be activated on `device` right now.
    fn check_connection_available(&self, _device: &Device, _profile: &ConnectionProfile) -> bool {
        true
    }

    /// Checks that `profile` may be applied to `device`.
    fn check_connection_compatible(
        &self,
        device: &Device,
        profile: &ConnectionProfile,
    ) -> DeviceResult<()> {
        base::check_connection_compatible(self, device, profile)
    }

    /// Fills in a partially specified profile for a new device.
    fn complete_connection(
        &self,
        _profile: ConnectionProfile,
        _existing: &[ConnectionProfile],
    ) -> DeviceResult<ConnectionProfile> {
        Err(DeviceError::not_supported(
            "complete_connection",
            self.type_description(),
        ))
    }

    /// Derives a refreshed profile from the running device. Never mutates
    /// `profile`.
    async fn update_connection(
        &self,
        _platform: &dyn Platform,
        _device: &Device,
        profile: &ConnectionProfile,
    ) -> DeviceResult<ConnectionProfile> {
        Ok(profile.clone())
    }

    /// Stamps a slave profile with this master's topology.
    fn master_update_slave_connection(
        &self,
        master: &Device,
        _slave_profile: &ConnectionProfile,
    ) -> DeviceResult<ConnectionProfile> {
        Err(DeviceError::NotAMaster {
            iface: master.iface().to_string(),
        })
    }

    /// Creates the kernel link for a software device.
    async fn create_and_realize(
        &self,
        _platform: &dyn Platform,
        _device: &Device,
        _profile: &ConnectionProfile,
    ) -> DeviceResult<PlatformLink> {
        Err(DeviceError::not_supported(
            "create_and_realize",
            self.type_description(),
        ))
    }

    /// Stage 1.
    async fn act_stage1_prepare(
        &self,
        ctx: &StageContext<'_>,
        _diagnostics: &mut Diagnostics,
    ) -> ActStageReturn {
        base::act_stage1_prepare(self, ctx)
    }

    /// Stage 2.
    async fn act_stage2_config(
        &self,
        _ctx: &StageContext<'_>,
        _diagnostics: &mut Diagnostics,
    ) -> ActStageReturn {
        ActStageReturn::Success
    }

    /// Adjusts `config` before commit. Must keep its identity.
    fn ip_config_pre_commit(
        &self,
        _device: &Device,
        _profile: &ConnectionProfile,
        _config: &mut IpConfig,
    ) {
    }

    /// Attaches `slave` to `master`.
    ///
    /// With `configure` the call performs the kernel mutation; without it the
    /// kernel relationship already exists and only bookkeeping happens.
    async fn enslave_slave(
        &self,
        _platform: &dyn Platform,
        master: &Arc<Device>,
        _slave: &Arc<Device>,
        _profile: Option<&ConnectionProfile>,
        _configure: bool,
    ) -> DeviceResult<()> {
        Err(DeviceError::NotAMaster {
            iface: master.iface().to_string(),
        })
    }

    /// Detaches `slave` from `master`.
    async fn release_slave(
        &self,
        _platform: &dyn Platform,
        master: &Arc<Device>,
        _slave: &Arc<Device>,
        _configure: bool,
    ) -> DeviceResult<()> {
        Err(DeviceError::NotAMaster {
            iface: master.iface().to_string(),
        })
    }

    /// Lists settings whose kernel state no longer matches `applied`.
    async fn detect_drift(
        &self,
        _platform: &dyn Platform,
        _device: &Device,
        _applied: &ConnectionProfile,
    ) -> DeviceResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Generic behaviour shared by all device classes.
pub mod base {
    use tracing::{debug, warn};

    use super::*;

    /// A device is available once a kernel link backs it.
    pub fn is_available(device: &Device) -> bool {
        device.is_realized()
    }

    /// Structural checks, then type and interface-name matching.
    pub fn check_connection_compatible<C: DeviceClass + ?Sized>(
        class: &C,
        device: &Device,
        profile: &ConnectionProfile,
    ) -> DeviceResult<()> {
        profile.verify()?;

        if profile.connection_type() != class.connection_type() {
            return Err(DeviceError::incompatible(
                device.iface(),
                profile.id(),
                format!(
                    "connection type '{}' is not '{}'",
                    profile.connection_type(),
                    class.connection_type()
                ),
            ));
        }

        if let Some(name) = profile.interface_name() {
            if name != device.iface() {
                return Err(DeviceError::incompatible(
                    device.iface(),
                    profile.id(),
                    format!("connection is bound to interface '{}'", name),
                ));
            }
        }

        Ok(())
    }

    /// Compatibility, then availability.
    pub fn act_stage1_prepare<C: DeviceClass + ?Sized>(
        class: &C,
        ctx: &StageContext<'_>,
    ) -> ActStageReturn {
        if let Err(e) = class.check_connection_compatible(ctx.device, ctx.profile) {
            warn!(device = %ctx.device.iface(), error = %e, "prepare failed");
            return ActStageReturn::from(&e);
        }

        if !class.is_available(ctx.device)
            || !class.check_connection_available(ctx.device, ctx.profile)
        {
            debug!(device = %ctx.device.iface(), "device not available yet, postponing");
            return ActStageReturn::Postpone;
        }

        ActStageReturn::Success
    }

    /// Fills in id, uuid, interface name and type without overwriting
    /// anything already present.
    ///
    /// Ids are `"<id_prefix> N"` for the first unused `N >= 1`; interface
    /// names are `<ifname_prefix>N` for the first unused `N >= 0`.
    pub fn complete_generic(
        mut profile: ConnectionProfile,
        connection_type: &str,
        existing: &[ConnectionProfile],
        id_prefix: &str,
        ifname_prefix: &str,
    ) -> ConnectionProfile {
        if profile.connection.connection_type.is_empty() {
            profile.connection.connection_type = connection_type.to_string();
        }

        if profile.connection.id.trim().is_empty() {
            let id = (1..)
                .map(|n| format!("{} {}", id_prefix, n))
                .find(|candidate| !existing.iter().any(|p| p.id() == candidate))
                .unwrap_or_default();
            profile.connection.id = id;
        }

        if uuid::Uuid::parse_str(&profile.connection.uuid).is_err() {
            profile.connection.uuid = uuid::Uuid::new_v4().to_string();
        }

        if profile.connection.interface_name.is_none() {
            let name = (0..)
                .map(|n| format!("{}{}", ifname_prefix, n))
                .find(|candidate| {
                    !existing
                        .iter()
                        .any(|p| p.interface_name() == Some(candidate.as_str()))
                })
                .unwrap_or_default();
            profile.connection.interface_name = Some(name);
        }

        profile
    }

    /// Warns when `slave` shares a physical port with a current slave of
    /// `master`. Returns false on conflict.
    pub fn check_slave_physical_port(master: &Device, slave: &Device) -> bool {
        let Some(port_id) = slave.physical_port_id() else {
            return true;
        };

        for other in master.slaves() {
            if other.iface() == slave.iface() {
                continue;
            }
            if other.physical_port_id().as_deref() == Some(port_id.as_str()) {
                warn!(
                    master = %master.iface(),
                    slave = %slave.iface(),
                    other = %other.iface(),
                    port_id = %port_id,
                    "slave shares a physical port with another slave"
                );
                return false;
            }
        }
        true
    }

    /// Records a completed enslavement on both sides.
    pub fn record_enslaved(master: &Arc<Device>, slave: &Arc<Device>) {
        master.add_slave(slave);
    }

    /// Records a release on both sides.
    pub fn record_released(master: &Arc<Device>, slave: &Arc<Device>) {
        master.remove_slave(slave);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethernet::EthernetClass;
    use crate::profile::{BOND_CONNECTION_TYPE, ETHERNET_CONNECTION_TYPE};
    use crate::state::{DeviceState, StateReason};
    use netdev_platform::InMemoryPlatform;

    fn device(name: &str) -> Arc<Device> {
        let device = Device::new(name, Arc::new(EthernetClass::new()));
        device.set_state(DeviceState::Disconnected, StateReason::NowManaged);
        device
    }

    #[test]
    fn test_compatible_requires_matching_type() {
        let class = EthernetClass::new();
        let eth0 = device("eth0");

        let good = ConnectionProfile::new("eth0", ETHERNET_CONNECTION_TYPE);
        assert!(class.check_connection_compatible(&eth0, &good).is_ok());

        let wrong = ConnectionProfile::new("eth0", BOND_CONNECTION_TYPE);
        assert!(matches!(
            class.check_connection_compatible(&eth0, &wrong),
            Err(DeviceError::IncompatibleProfile { .. })
        ));
    }

    #[test]
    fn test_compatible_checks_interface_name() {
        let class = EthernetClass::new();
        let eth0 = device("eth0");
        let profile =
            ConnectionProfile::new("eth1", ETHERNET_CONNECTION_TYPE).with_interface_name("eth1");
        assert!(class.check_connection_compatible(&eth0, &profile).is_err());
    }

    #[test]
    fn test_structural_check_runs_first() {
        let class = EthernetClass::new();
        let eth0 = device("eth0");
        let mut profile = ConnectionProfile::new("eth0", "bogus");
        profile.connection.uuid.clear();
        assert!(matches!(
            class.check_connection_compatible(&eth0, &profile),
            Err(DeviceError::InvalidProfile { .. })
        ));
    }

    #[tokio::test]
    async fn test_prepare_postpones_unrealized_device() {
        let platform = InMemoryPlatform::new();
        let class = EthernetClass::new();
        let eth0 = device("eth0");
        let profile = ConnectionProfile::new("eth0", ETHERNET_CONNECTION_TYPE);
        let ctx = StageContext {
            platform: &platform,
            device: &eth0,
            profile: &profile,
        };
        let mut diag = Diagnostics::new();

        assert_eq!(
            class.act_stage1_prepare(&ctx, &mut diag).await,
            ActStageReturn::Postpone
        );

        eth0.realize(2, None);
        assert_eq!(
            class.act_stage1_prepare(&ctx, &mut diag).await,
            ActStageReturn::Success
        );
    }

    #[test]
    fn test_complete_generic_fills_gaps() {
        let existing = vec![
            ConnectionProfile::new("Bond connection 1", BOND_CONNECTION_TYPE)
                .with_interface_name("bond0"),
        ];
        let mut partial = ConnectionProfile::new("", "");
        partial.connection.uuid.clear();

        let done =
            base::complete_generic(partial, BOND_CONNECTION_TYPE, &existing, "Bond connection", "bond");

        assert_eq!(done.id(), "Bond connection 2");
        assert_eq!(done.interface_name(), Some("bond1"));
        assert_eq!(done.connection_type(), BOND_CONNECTION_TYPE);
        assert!(uuid::Uuid::parse_str(done.uuid()).is_ok());
    }

    #[test]
    fn test_complete_generic_keeps_existing_values() {
        let partial = ConnectionProfile::new("office", BOND_CONNECTION_TYPE)
            .with_interface_name("bond7");
        let uuid = partial.uuid().to_string();

        let done = base::complete_generic(partial, BOND_CONNECTION_TYPE, &[], "Bond connection", "bond");

        assert_eq!(done.id(), "office");
        assert_eq!(done.uuid(), uuid);
        assert_eq!(done.interface_name(), Some("bond7"));
    }

    #[test]
    fn test_physical_port_conflict() {
        let master = device("bond0");
        let eth0 = device("eth0");
        let eth1 = device("eth1");
        eth0.realize(2, Some("port-a".to_string()));
        eth1.realize(3, Some("port-a".to_string()));

        assert!(base::check_slave_physical_port(&master, &eth0));
        base::record_enslaved(&master, &eth0);
        assert!(!base::check_slave_physical_port(&master, &eth1));
    }
}
