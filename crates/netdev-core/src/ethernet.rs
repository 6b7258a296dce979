//! Wired Ethernet devices.

use async_trait::async_trait;
use netdev_platform::LinkType;
use tracing::warn;

use crate::class::{DeviceClass, StageContext};
use crate::device::{Device, DeviceCapabilities};
use crate::ip_config::{IpConfig, IpConfigSource};
use crate::profile::{ConnectionProfile, ETHERNET_CONNECTION_TYPE};
use crate::stage::{ActStageReturn, DiagnosticKind, Diagnostics};

/// Physical Ethernet NICs. Hardware links are discovered, never created.
#[derive(Debug, Default)]
pub struct EthernetClass;

impl EthernetClass {
    /// Creates the class.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceClass for EthernetClass {
    fn type_description(&self) -> &'static str {
        "ethernet"
    }

    fn link_type(&self) -> LinkType {
        LinkType::Ethernet
    }

    fn connection_type(&self) -> &'static str {
        ETHERNET_CONNECTION_TYPE
    }

    fn generic_capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities::CARRIER_DETECT
    }

    async fn act_stage2_config(
        &self,
        ctx: &StageContext<'_>,
        diagnostics: &mut Diagnostics,
    ) -> ActStageReturn {
        // Slaves are brought up by their master's enslave step.
        if ctx.profile.is_slave() {
            return ActStageReturn::Success;
        }
        if let Err(e) = ctx.device.bring_up(ctx.platform).await {
            warn!(device = %ctx.device.iface(), error = %e, "failed to bring link up");
            diagnostics.push(DiagnosticKind::LinkUpFailed, ctx.device.iface(), e.to_string());
        }
        ActStageReturn::Success
    }

    fn ip_config_pre_commit(
        &self,
        _device: &Device,
        profile: &ConnectionProfile,
        config: &mut IpConfig,
    ) {
        if let Some(mtu) = profile.mtu() {
            config.set_mtu(mtu, IpConfigSource::User);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DeviceState, StateReason};
    use netdev_platform::{InMemoryPlatform, PlatformOp};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_config_brings_link_up() {
        let platform = InMemoryPlatform::new();
        let ifindex = platform.add_link("eth0", LinkType::Ethernet);
        let device = Device::new("eth0", Arc::new(EthernetClass::new()));
        device.realize(ifindex, None);
        device.set_state(DeviceState::Disconnected, StateReason::NowManaged);

        let profile = ConnectionProfile::new("eth0", ETHERNET_CONNECTION_TYPE);
        let ctx = StageContext {
            platform: &platform,
            device: &device,
            profile: &profile,
        };
        let mut diag = Diagnostics::new();

        let result = EthernetClass::new().act_stage2_config(&ctx, &mut diag).await;

        assert_eq!(result, ActStageReturn::Success);
        assert_eq!(platform.ops(), vec![PlatformOp::LinkUp { ifindex }]);
        assert!(diag.is_empty());
    }

    #[test]
    fn test_pre_commit_applies_mtu() {
        let device = Device::new("eth0", Arc::new(EthernetClass::new()));
        let profile = ConnectionProfile::new("eth0", ETHERNET_CONNECTION_TYPE).with_mtu(9000);
        let mut config = IpConfig::new();
        config.set_mtu(1500, IpConfigSource::Dhcp);

        EthernetClass::new().ip_config_pre_commit(&device, &profile, &mut config);

        assert_eq!(config.mtu(), Some(9000));
        assert_eq!(config.mtu_source(), IpConfigSource::User);
    }
}
