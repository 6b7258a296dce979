//! Kernel-to-profile direction of bond option reconciliation.

use std::collections::BTreeSet;

use netdev_core::{BondSetting, ConnectionProfile, Device, DeviceResult};
use netdev_platform::Platform;
use tracing::{debug, instrument};

use crate::options::{self, OptionKind};
use crate::plan::{self, WriteOrigin, ZERO_MEANS_DISABLED};

/// Reads every known option from the kernel and keeps the ones that deviate
/// from their defaults.
pub async fn read_bond_options(platform: &dyn Platform, ifindex: i32) -> DeviceResult<BondSetting> {
    let mut setting = BondSetting::default();

    for def in options::OPTIONS {
        let raw = platform.get_master_attribute(ifindex, def.name).await?;
        let value = options::decode_kernel_value(def, &raw);

        if value.is_empty()
            || (ZERO_MEANS_DISABLED.contains(&def.name) && value == "0")
            || options::is_default(def, &value)
        {
            continue;
        }
        setting.set(def.name, value);
    }

    Ok(setting)
}

/// Returns a copy of `profile` whose bond setting reflects the kernel.
///
/// The bond setting is rebuilt from scratch, so declarations equal to their
/// defaults are dropped.
pub async fn update_connection(
    platform: &dyn Platform,
    device: &Device,
    profile: &ConnectionProfile,
) -> DeviceResult<ConnectionProfile> {
    let ifindex = device.require_ifindex()?;
    let mut updated = profile.clone();
    updated.bond = Some(read_bond_options(platform, ifindex).await?);
    Ok(updated)
}

fn target_set(value: &str) -> BTreeSet<&str> {
    options::split_targets(value).into_iter().collect()
}

/// Lists the explicit non-default options of `applied` whose kernel value
/// differs from what activation wrote.
///
/// Options the write plan overrides (for example `arp_interval` next to a
/// non-zero `miimon`) or that the mode does not support are not compared.
#[instrument(skip_all, fields(device = %device.iface()))]
pub async fn detect_drift(
    platform: &dyn Platform,
    device: &Device,
    applied: &ConnectionProfile,
) -> DeviceResult<Vec<String>> {
    let Some(setting) = applied.bond.as_ref() else {
        return Ok(Vec::new());
    };
    let ifindex = device.require_ifindex()?;
    let mode = plan::resolve_mode(setting)?;
    let planned = plan::build_write_plan(setting, mode, "");
    let mut drifted = Vec::new();

    for (name, declared) in setting.iter() {
        let Some(def) = options::lookup(name) else {
            continue;
        };
        if options::is_default(def, declared) || !options::option_supported(name, mode) {
            continue;
        }

        let raw = platform.get_master_attribute(ifindex, name).await?;
        let in_sync = if def.kind == OptionKind::IpList {
            target_set(declared) == target_set(&raw)
        } else {
            let Some(expected) = planned
                .iter()
                .find(|w| w.name == name && w.origin == WriteOrigin::Declared)
            else {
                continue;
            };
            let actual = options::decode_kernel_value(def, &raw);
            options::encode_value(def, &actual) == expected.value
        };

        if !in_sync {
            debug!(option = %name, declared = %declared, kernel = %raw.trim(), "bond option drifted");
            drifted.push(name.to_string());
        }
    }

    if !drifted.is_empty() {
        debug!(count = drifted.len(), "bond options out of sync");
    }
    Ok(drifted)
}
