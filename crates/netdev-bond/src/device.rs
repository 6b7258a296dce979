//! Bond master device class.

use std::sync::Arc;

use async_trait::async_trait;
use netdev_core::class::base;
use netdev_core::{
    ActStageReturn, BondSetting, ConnectionProfile, Device, DeviceCapabilities, DeviceClass,
    DeviceError, DeviceResult, DiagnosticKind, Diagnostics, IpConfig, IpConfigSource,
    StageContext, StateReason, BOND_CONNECTION_TYPE,
};
use netdev_platform::{LinkType, Platform, PlatformLink};
use tracing::{debug, info, instrument, warn};

use crate::options::{self, opts, BondMode};
use crate::plan::{self, AttrWrite, WriteOrigin};
use crate::reconcile;

/// Slave type marker stamped on bond slave profiles.
pub const BOND_SLAVE_TYPE: &str = "bond";

/// Linux bonding masters.
#[derive(Debug, Default)]
pub struct BondClass;

impl BondClass {
    /// Creates the class.
    pub fn new() -> Self {
        Self
    }
}

/// Writes one planned attribute if the mode supports it.
///
/// Returns true if the kernel accepted the write. Rejections are recorded
/// in `diagnostics` and never abort the caller.
async fn set_bond_attr(
    platform: &dyn Platform,
    iface: &str,
    ifindex: i32,
    mode: BondMode,
    write: &AttrWrite,
    diagnostics: &mut Diagnostics,
) -> bool {
    if !options::option_supported(write.name, mode) {
        if write.origin == WriteOrigin::Declared {
            diagnostics.push(
                DiagnosticKind::Unsupported,
                write.name,
                format!("'{}' is not supported in mode {}", write.name, mode),
            );
        }
        debug!(device = %iface, attr = %write.name, mode = %mode, "skipping option unsupported in mode");
        return false;
    }

    match platform
        .set_master_attribute(ifindex, write.name, &write.value)
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!(
                device = %iface,
                attr = %write.name,
                value = %write.value,
                error = %e,
                "failed to set bonding attribute"
            );
            diagnostics.kernel_rejected(write.name, &write.value, e.to_string());
            false
        }
    }
}

/// Programs `setting` onto the bond master in dependency order.
///
/// The mode must already be resolved so an unknown mode is caught before
/// anything is written. Returns the number of writes the kernel accepted.
#[instrument(skip(platform, setting, diagnostics))]
pub async fn apply_bonding_config(
    platform: &dyn Platform,
    iface: &str,
    ifindex: i32,
    setting: &BondSetting,
    mode: BondMode,
    diagnostics: &mut Diagnostics,
) -> usize {
    let kernel_targets = match platform
        .get_master_attribute(ifindex, opts::ARP_IP_TARGET)
        .await
    {
        Ok(value) => value,
        Err(e) => {
            warn!(device = %iface, error = %e, "failed to read current ARP targets");
            String::new()
        }
    };

    let writes = plan::build_write_plan(setting, mode, &kernel_targets);
    let mut applied = 0;
    for write in &writes {
        if set_bond_attr(platform, iface, ifindex, mode, write, diagnostics).await {
            applied += 1;
        }
    }

    debug!(device = %iface, planned = writes.len(), applied, "bonding options applied");
    applied
}

#[async_trait]
impl DeviceClass for BondClass {
    fn type_description(&self) -> &'static str {
        "bond"
    }

    fn link_type(&self) -> LinkType {
        LinkType::Bond
    }

    fn connection_type(&self) -> &'static str {
        BOND_CONNECTION_TYPE
    }

    fn generic_capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities::CARRIER_DETECT | DeviceCapabilities::IS_SOFTWARE
    }

    fn is_master(&self) -> bool {
        true
    }

    // Software link: created on demand, carrier follows the slaves.
    fn is_available(&self, _device: &Device) -> bool {
        true
    }

    fn check_connection_available(&self, _device: &Device, _profile: &ConnectionProfile) -> bool {
        true
    }

    fn check_connection_compatible(
        &self,
        device: &Device,
        profile: &ConnectionProfile,
    ) -> DeviceResult<()> {
        base::check_connection_compatible(self, device, profile)?;

        if profile.bond.is_none() {
            return Err(DeviceError::incompatible(
                device.iface(),
                profile.id(),
                "connection has no bond setting",
            ));
        }
        Ok(())
    }

    fn complete_connection(
        &self,
        profile: ConnectionProfile,
        existing: &[ConnectionProfile],
    ) -> DeviceResult<ConnectionProfile> {
        let mut profile = base::complete_generic(
            profile,
            BOND_CONNECTION_TYPE,
            existing,
            "Bond connection",
            "bond",
        );
        profile.bond.get_or_insert_with(BondSetting::default);
        Ok(profile)
    }

    async fn update_connection(
        &self,
        platform: &dyn Platform,
        device: &Device,
        profile: &ConnectionProfile,
    ) -> DeviceResult<ConnectionProfile> {
        reconcile::update_connection(platform, device, profile).await
    }

    fn master_update_slave_connection(
        &self,
        master: &Device,
        slave_profile: &ConnectionProfile,
    ) -> DeviceResult<ConnectionProfile> {
        let mut stamped = slave_profile.clone();
        stamped.connection.master = Some(master.iface().to_string());
        stamped.connection.slave_type = Some(BOND_SLAVE_TYPE.to_string());
        Ok(stamped)
    }

    async fn create_and_realize(
        &self,
        platform: &dyn Platform,
        device: &Device,
        profile: &ConnectionProfile,
    ) -> DeviceResult<PlatformLink> {
        let link = platform
            .create_master_link(device.iface(), LinkType::Bond)
            .await
            .map_err(|e| DeviceError::CreationFailed {
                iface: device.iface().to_string(),
                message: format!(
                    "Failed to create bond interface '{}' for '{}': {}",
                    device.iface(),
                    profile.id(),
                    e
                ),
            })?;
        info!(device = %device.iface(), ifindex = link.ifindex, "created bond interface");
        Ok(link)
    }

    async fn act_stage1_prepare(
        &self,
        ctx: &StageContext<'_>,
        diagnostics: &mut Diagnostics,
    ) -> ActStageReturn {
        let ret = base::act_stage1_prepare(self, ctx);
        if !ret.is_success() {
            return ret;
        }

        let Some(setting) = ctx.profile.bond.as_ref() else {
            warn!(device = %ctx.device.iface(), "connection has no bond setting");
            return ActStageReturn::Failure(StateReason::ConnectionIncompatible);
        };

        // mode is resolved by the config stage
        for (name, value) in setting.iter().filter(|(name, _)| *name != opts::MODE) {
            if let Err(e) = options::validate_option(name, value) {
                warn!(device = %ctx.device.iface(), error = %e, "invalid bond option");
                diagnostics.push(DiagnosticKind::Warning, name, e.to_string());
                return ActStageReturn::Failure(StateReason::ConnectionIncompatible);
            }
        }

        ActStageReturn::Success
    }

    async fn act_stage2_config(
        &self,
        ctx: &StageContext<'_>,
        diagnostics: &mut Diagnostics,
    ) -> ActStageReturn {
        let iface = ctx.device.iface();
        let Some(setting) = ctx.profile.bond.as_ref() else {
            return ActStageReturn::Failure(StateReason::ConfigFailed);
        };

        let mode = match plan::resolve_mode(setting) {
            Ok(mode) => mode,
            Err(e) => {
                warn!(device = %iface, error = %e, "unknown bond mode");
                diagnostics.push(DiagnosticKind::Warning, opts::MODE, e.to_string());
                return ActStageReturn::Failure(StateReason::ConfigFailed);
            }
        };
        let ifindex = match ctx.device.require_ifindex() {
            Ok(ifindex) => ifindex,
            Err(e) => {
                warn!(device = %iface, error = %e, "bond has no kernel link");
                return ActStageReturn::Failure(StateReason::ConfigFailed);
            }
        };

        if let Err(e) = ctx.device.take_down(ctx.platform).await {
            warn!(device = %iface, error = %e, "failed to take bond down");
        }
        apply_bonding_config(ctx.platform, iface, ifindex, setting, mode, diagnostics).await;
        if let Err(e) = ctx.device.bring_up(ctx.platform).await {
            warn!(device = %iface, error = %e, "failed to bring bond up");
            diagnostics.push(DiagnosticKind::LinkUpFailed, iface, e.to_string());
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

    #[instrument(skip_all, fields(master = %master.iface(), slave = %slave.iface()))]
    async fn enslave_slave(
        &self,
        platform: &dyn Platform,
        master: &Arc<Device>,
        slave: &Arc<Device>,
        _profile: Option<&ConnectionProfile>,
        configure: bool,
    ) -> DeviceResult<()> {
        base::check_slave_physical_port(master, slave);

        if configure {
            let master_index = master.require_ifindex()?;
            let slave_index = slave.require_ifindex()?;

            if let Err(e) = slave.take_down(platform).await {
                warn!(error = %e, "failed to take slave down");
            }
            let result = platform.enslave(master_index, slave_index).await;
            if let Err(e) = slave.bring_up(platform).await {
                warn!(error = %e, "failed to bring slave up");
            }

            if let Err(e) = result {
                return Err(DeviceError::AttachFailed {
                    master: master.iface().to_string(),
                    slave: slave.iface().to_string(),
                    message: e.to_string(),
                });
            }
            info!("enslaved bond slave {}", slave.iface());
        } else {
            info!("bond slave {} was enslaved", slave.iface());
        }

        base::record_enslaved(master, slave);
        Ok(())
    }

    #[instrument(skip_all, fields(master = %master.iface(), slave = %slave.iface()))]
    async fn release_slave(
        &self,
        platform: &dyn Platform,
        master: &Arc<Device>,
        slave: &Arc<Device>,
        configure: bool,
    ) -> DeviceResult<()> {
        let result = if configure {
            let released = match (master.require_ifindex(), slave.require_ifindex()) {
                (Ok(master_index), Ok(slave_index)) => platform
                    .release(master_index, slave_index)
                    .await
                    .map_err(|e| e.to_string()),
                (Err(e), _) | (_, Err(e)) => Err(e.to_string()),
            };
            match &released {
                Ok(()) => info!("released bond slave {}", slave.iface()),
                Err(message) => warn!(error = %message, "failed to release bond slave {}", slave.iface()),
            }

            // The kernel closes a port when it leaves the bond.
            if let Err(e) = slave.bring_up(platform).await {
                warn!(error = %e, "failed to bring released slave up");
            }

            released.map_err(|message| DeviceError::DetachFailed {
                master: master.iface().to_string(),
                slave: slave.iface().to_string(),
                message,
            })
        } else {
            info!("bond slave {} was released", slave.iface());
            Ok(())
        };

        base::record_released(master, slave);
        result
    }

    async fn detect_drift(
        &self,
        platform: &dyn Platform,
        device: &Device,
        applied: &ConnectionProfile,
    ) -> DeviceResult<Vec<String>> {
        reconcile::detect_drift(platform, device, applied).await
    }
}
