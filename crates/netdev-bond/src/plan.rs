//! Ordered kernel write plan for a bonding setting.
//!
//! Building the plan is pure: it takes the declared options, the resolved
//! mode and the ARP targets the kernel currently holds, and returns the
//! attribute writes in the order they must reach the kernel. Mode gating and
//! error handling happen when the plan is applied.

use std::collections::HashSet;

use netdev_core::{BondSetting, DeviceResult};

use crate::options::{self, opts, BondMode};

/// Where a planned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOrigin {
    /// Declared in the profile.
    Declared,
    /// Forced by a dependency between options.
    Derived,
    /// Type default for an undeclared option.
    Default,
}

/// One planned attribute write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrWrite {
    /// Attribute name.
    pub name: &'static str,
    /// Value to write.
    pub value: String,
    /// Where the value came from.
    pub origin: WriteOrigin,
}

impl AttrWrite {
    fn new(name: &'static str, value: impl Into<String>, origin: WriteOrigin) -> Self {
        Self {
            name,
            value: value.into(),
            origin,
        }
    }
}

/// Independent options written last, in this order.
pub const SIMPLE_OPTIONS: &[&str] = &[
    opts::ACTIVE_SLAVE,
    opts::AD_ACTOR_SYS_PRIO,
    opts::AD_SELECT,
    opts::AD_USER_PORT_KEY,
    opts::ALL_SLAVES_ACTIVE,
    opts::ARP_ALL_TARGETS,
    opts::FAIL_OVER_MAC,
    opts::LACP_RATE,
    opts::LP_INTERVAL,
    opts::NUM_GRAT_ARP,
    opts::NUM_UNSOL_NA,
    opts::MIN_LINKS,
    opts::PACKETS_PER_SLAVE,
    opts::PRIMARY_RESELECT,
    opts::RESEND_IGMP,
    opts::TLB_DYNAMIC_LB,
    opts::USE_CARRIER,
    opts::XMIT_HASH_POLICY,
];

/// Options for which `"0"` means disabled, the kernel's own default.
pub const ZERO_MEANS_DISABLED: &[&str] = &[
    opts::ARP_INTERVAL,
    opts::DOWNDELAY,
    opts::MIIMON,
    opts::UPDELAY,
];

/// Resolves the bonding mode, defaulting to `balance-rr`.
pub fn resolve_mode(setting: &BondSetting) -> DeviceResult<BondMode> {
    setting
        .get(opts::MODE)
        .unwrap_or(BondMode::default().as_str())
        .parse()
}

fn int_or_zero(value: Option<&str>) -> u64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

struct PlanBuilder<'a> {
    setting: &'a BondSetting,
    writes: Vec<AttrWrite>,
}

impl<'a> PlanBuilder<'a> {
    fn declared(&self, name: &str) -> Option<String> {
        let def = options::lookup(name)?;
        self.setting
            .get(name)
            .map(|value| options::encode_value(def, value))
    }

    fn push(&mut self, name: &'static str, value: impl Into<String>, origin: WriteOrigin) {
        self.writes.push(AttrWrite::new(name, value, origin));
    }

    /// Declared value or default; disabled intervals are left alone.
    fn simple(&mut self, name: &'static str) {
        let (value, origin) = match self.declared(name) {
            Some(value) => (value, WriteOrigin::Declared),
            None => (options::default_value(name).to_string(), WriteOrigin::Default),
        };
        if ZERO_MEANS_DISABLED.contains(&name) && value == "0" {
            return;
        }
        self.push(name, value, origin);
    }
}

/// Builds the ordered write sequence for `setting` in `mode`.
///
/// `kernel_targets` is the current `arp_ip_target` value as the kernel
/// reports it (space or newline separated).
///
/// Order:
///
/// 1. `mode`
/// 2. link monitoring: a non-zero `miimon` forces `arp_interval` to `0`
///    and brings `updelay`/`downdelay`; without `miimon` and without an
///    enabled `arp_interval`, `miimon` defaults to `100`; otherwise
///    `arp_interval` is written
/// 3. `arp_validate`, non-zero only in active-backup
/// 4. `primary`, empty clears it
/// 5. `arp_ip_target` edits: removals first, then additions
/// 6. `ad_actor_system`, only when declared
/// 7. the remaining independent options
pub fn build_write_plan(
    setting: &BondSetting,
    mode: BondMode,
    kernel_targets: &str,
) -> Vec<AttrWrite> {
    let mut plan = PlanBuilder {
        setting,
        writes: Vec::new(),
    };

    let mode_origin = if setting.contains(opts::MODE) {
        WriteOrigin::Declared
    } else {
        WriteOrigin::Default
    };
    plan.push(opts::MODE, mode.as_str(), mode_origin);

    let miimon = plan.declared(opts::MIIMON);
    let mut write_arp_interval = true;
    match miimon {
        Some(value) if int_or_zero(Some(&value)) != 0 => {
            plan.push(opts::ARP_INTERVAL, "0", WriteOrigin::Derived);
            write_arp_interval = false;
            plan.push(opts::MIIMON, value, WriteOrigin::Declared);
            plan.simple(opts::UPDELAY);
            plan.simple(opts::DOWNDELAY);
        }
        None => {
            if int_or_zero(setting.get(opts::ARP_INTERVAL)) == 0 {
                plan.push(opts::MIIMON, "100", WriteOrigin::Derived);
            }
        }
        Some(_) => {}
    }
    if write_arp_interval {
        plan.simple(opts::ARP_INTERVAL);
    }

    match plan.declared(opts::ARP_VALIDATE) {
        Some(value) if value != "0" && value != "none" && mode == BondMode::ActiveBackup => {
            plan.push(opts::ARP_VALIDATE, value, WriteOrigin::Declared);
        }
        Some(_) => plan.push(opts::ARP_VALIDATE, "0", WriteOrigin::Derived),
        None => plan.push(opts::ARP_VALIDATE, "0", WriteOrigin::Default),
    }

    match setting.get(opts::PRIMARY) {
        Some(value) => plan.push(opts::PRIMARY, value, WriteOrigin::Declared),
        None => plan.push(opts::PRIMARY, "", WriteOrigin::Default),
    }

    for write in arp_target_edits(kernel_targets, setting.get(opts::ARP_IP_TARGET)) {
        plan.writes.push(write);
    }

    // empty has no kernel default to restore
    if let Some(value) = plan
        .declared(opts::AD_ACTOR_SYSTEM)
        .filter(|v| !v.is_empty())
    {
        plan.push(opts::AD_ACTOR_SYSTEM, value, WriteOrigin::Declared);
    }

    for name in SIMPLE_OPTIONS.iter().copied() {
        plan.simple(name);
    }

    plan.writes
}

/// Edits that turn the kernel's target set into the declared one.
///
/// Targets held by both sides are left untouched.
pub fn arp_target_edits(kernel: &str, declared: Option<&str>) -> Vec<AttrWrite> {
    let current: Vec<&str> = options::split_targets(kernel);
    let mut wanted: Vec<&str> = Vec::new();
    for target in declared.map(options::split_targets).unwrap_or_default() {
        if !wanted.contains(&target) {
            wanted.push(target);
        }
    }
    let current_set: HashSet<&str> = current.iter().copied().collect();
    let wanted_set: HashSet<&str> = wanted.iter().copied().collect();
    let origin = if declared.is_some() {
        WriteOrigin::Declared
    } else {
        WriteOrigin::Default
    };

    let removals = current
        .iter()
        .filter(|t| !wanted_set.contains(*t))
        .map(|t| AttrWrite::new(opts::ARP_IP_TARGET, format!("-{}", t), origin));
    let additions = wanted
        .iter()
        .filter(|t| !current_set.contains(*t))
        .map(|t| AttrWrite::new(opts::ARP_IP_TARGET, format!("+{}", t), origin));
    removals.chain(additions).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn setting(options: &[(&str, &str)]) -> BondSetting {
        let mut setting = BondSetting::default();
        for (name, value) in options {
            setting.set(*name, *value);
        }
        setting
    }

    fn values<'a>(plan: &'a [AttrWrite], name: &str) -> Vec<&'a str> {
        plan.iter()
            .filter(|w| w.name == name)
            .map(|w| w.value.as_str())
            .collect()
    }

    fn position(plan: &[AttrWrite], name: &str) -> usize {
        plan.iter()
            .position(|w| w.name == name)
            .unwrap_or_else(|| panic!("{} not planned", name))
    }

    #[test]
    fn test_mode_is_first_and_defaults_to_round_robin() {
        let plan = build_write_plan(&BondSetting::default(), BondMode::RoundRobin, "");
        assert_eq!(plan[0], AttrWrite::new(opts::MODE, "balance-rr", WriteOrigin::Default));
    }

    #[test]
    fn test_resolve_mode() {
        assert_eq!(resolve_mode(&BondSetting::default()).unwrap(), BondMode::RoundRobin);
        assert_eq!(
            resolve_mode(&setting(&[(opts::MODE, "1")])).unwrap(),
            BondMode::ActiveBackup
        );
        assert!(resolve_mode(&setting(&[(opts::MODE, "turbo")])).is_err());
    }

    #[test]
    fn test_miimon_forces_arp_interval_off() {
        for miimon in ["1", "100", "2000"] {
            let plan = build_write_plan(
                &setting(&[
                    (opts::MIIMON, miimon),
                    (opts::ARP_INTERVAL, "250"),
                    (opts::UPDELAY, "200"),
                ]),
                BondMode::ActiveBackup,
                "",
            );
            assert_eq!(values(&plan, opts::ARP_INTERVAL), vec!["0"]);
            assert!(position(&plan, opts::ARP_INTERVAL) < position(&plan, opts::MIIMON));
            assert_eq!(values(&plan, opts::MIIMON), vec![miimon]);
            assert_eq!(values(&plan, opts::UPDELAY), vec!["200"]);
        }
    }

    #[test]
    fn test_miimon_defaults_to_100() {
        let plan = build_write_plan(&BondSetting::default(), BondMode::RoundRobin, "");
        assert_eq!(values(&plan, opts::MIIMON), vec!["100"]);
        assert!(values(&plan, opts::ARP_INTERVAL).is_empty());

        let plan = build_write_plan(
            &setting(&[(opts::ARP_INTERVAL, "0")]),
            BondMode::RoundRobin,
            "",
        );
        assert_eq!(values(&plan, opts::MIIMON), vec!["100"]);
    }

    #[test]
    fn test_arp_interval_without_miimon() {
        let plan = build_write_plan(
            &setting(&[(opts::ARP_INTERVAL, "500")]),
            BondMode::ActiveBackup,
            "",
        );
        assert!(values(&plan, opts::MIIMON).is_empty());
        assert_eq!(values(&plan, opts::ARP_INTERVAL), vec!["500"]);
    }

    #[test]
    fn test_zero_miimon_declared_leaves_miimon_alone() {
        let plan = build_write_plan(
            &setting(&[(opts::MIIMON, "0"), (opts::UPDELAY, "100")]),
            BondMode::RoundRobin,
            "",
        );
        assert!(values(&plan, opts::MIIMON).is_empty());
        assert!(values(&plan, opts::UPDELAY).is_empty());
    }

    #[test]
    fn test_arp_validate_gated_on_active_backup() {
        let declared = setting(&[(opts::ARP_VALIDATE, "all")]);
        for mode in BondMode::ALL {
            let plan = build_write_plan(&declared, mode, "");
            let expected = if mode == BondMode::ActiveBackup { "all" } else { "0" };
            assert_eq!(values(&plan, opts::ARP_VALIDATE), vec![expected], "{}", mode);
        }

        let plan = build_write_plan(
            &setting(&[(opts::ARP_VALIDATE, "none")]),
            BondMode::ActiveBackup,
            "",
        );
        assert_eq!(values(&plan, opts::ARP_VALIDATE), vec!["0"]);
    }

    #[test]
    fn test_primary_written_verbatim_or_cleared() {
        let plan = build_write_plan(&BondSetting::default(), BondMode::ActiveBackup, "");
        assert_eq!(values(&plan, opts::PRIMARY), vec![""]);

        let plan = build_write_plan(
            &setting(&[(opts::PRIMARY, "eth1")]),
            BondMode::ActiveBackup,
            "",
        );
        assert_eq!(values(&plan, opts::PRIMARY), vec!["eth1"]);
    }

    #[test]
    fn test_arp_targets_edit_only_the_difference() {
        let plan = build_write_plan(
            &setting(&[(opts::ARP_IP_TARGET, "2.2.2.2,3.3.3.3")]),
            BondMode::ActiveBackup,
            "1.1.1.1 2.2.2.2\n",
        );
        assert_eq!(values(&plan, opts::ARP_IP_TARGET), vec!["-1.1.1.1", "+3.3.3.3"]);
    }

    #[test]
    fn test_arp_targets_cleared_when_undeclared() {
        let edits = arp_target_edits("10.0.0.1\n10.0.0.2", None);
        let values: Vec<&str> = edits.iter().map(|w| w.value.as_str()).collect();
        assert_eq!(values, vec!["-10.0.0.1", "-10.0.0.2"]);
    }

    #[test]
    fn test_ad_actor_system_only_when_declared() {
        let plan = build_write_plan(&BondSetting::default(), BondMode::Lacp, "");
        assert!(values(&plan, opts::AD_ACTOR_SYSTEM).is_empty());

        let plan = build_write_plan(
            &setting(&[(opts::AD_ACTOR_SYSTEM, "02:00:00:00:00:01")]),
            BondMode::Lacp,
            "",
        );
        assert_eq!(values(&plan, opts::AD_ACTOR_SYSTEM), vec!["02:00:00:00:00:01"]);
    }

    #[test]
    fn test_empty_ad_actor_system_is_left_alone() {
        let plan = build_write_plan(
            &setting(&[(opts::MODE, "802.3ad"), (opts::AD_ACTOR_SYSTEM, "")]),
            BondMode::Lacp,
            "",
        );
        assert!(values(&plan, opts::AD_ACTOR_SYSTEM).is_empty());
        assert_eq!(values(&plan, opts::MODE), vec!["802.3ad"]);
    }

    #[test]
    fn test_simple_options_use_defaults() {
        let plan = build_write_plan(
            &setting(&[(opts::XMIT_HASH_POLICY, "1"), (opts::LACP_RATE, "fast")]),
            BondMode::Lacp,
            "",
        );
        assert_eq!(values(&plan, opts::XMIT_HASH_POLICY), vec!["layer3+4"]);
        assert_eq!(values(&plan, opts::LACP_RATE), vec!["fast"]);
        assert_eq!(values(&plan, opts::MIN_LINKS), vec!["0"]);
        assert_eq!(values(&plan, opts::USE_CARRIER), vec!["1"]);

        let tail: Vec<&str> = plan[plan.len() - SIMPLE_OPTIONS.len()..]
            .iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(tail, SIMPLE_OPTIONS.to_vec());
    }

    #[test]
    fn test_active_backup_scenario_order() {
        let plan = build_write_plan(
            &setting(&[
                (opts::MODE, "active-backup"),
                (opts::ARP_VALIDATE, "active"),
                (opts::PRIMARY, "eth0"),
            ]),
            BondMode::ActiveBackup,
            "",
        );
        let head: Vec<(&str, &str)> = plan
            .iter()
            .take(4)
            .map(|w| (w.name, w.value.as_str()))
            .collect();
        assert_eq!(
            head,
            vec![
                (opts::MODE, "active-backup"),
                (opts::MIIMON, "100"),
                (opts::ARP_VALIDATE, "active"),
                (opts::PRIMARY, "eth0"),
            ]
        );
    }
}
