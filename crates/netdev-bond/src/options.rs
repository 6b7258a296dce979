//! Typed bonding option table.
//!
//! The kernel exposes bonding configuration as string attributes with a few
//! format quirks: enumerations are reported as `"name index"`, target lists
//! are space separated while profiles use commas, and several attributes
//! only apply in some modes. This module keeps those rules in one table with
//! encode/decode helpers so the reconciliation code never parses strings.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use netdev_core::DeviceError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Option names.
pub mod opts {
    /// Bonding policy.
    pub const MODE: &str = "mode";
    /// MII link monitoring interval (ms).
    pub const MIIMON: &str = "miimon";
    /// Delay before disabling a slave after link failure (ms).
    pub const DOWNDELAY: &str = "downdelay";
    /// Delay before enabling a slave after link recovery (ms).
    pub const UPDELAY: &str = "updelay";
    /// ARP link monitoring interval (ms).
    pub const ARP_INTERVAL: &str = "arp_interval";
    /// ARP monitoring targets.
    pub const ARP_IP_TARGET: &str = "arp_ip_target";
    /// ARP probe validation.
    pub const ARP_VALIDATE: &str = "arp_validate";
    /// Preferred slave.
    pub const PRIMARY: &str = "primary";
    /// Reselection policy for the primary slave.
    pub const PRIMARY_RESELECT: &str = "primary_reselect";
    /// MAC address policy on failover.
    pub const FAIL_OVER_MAC: &str = "fail_over_mac";
    /// Carrier detection method.
    pub const USE_CARRIER: &str = "use_carrier";
    /// 802.3ad aggregator selection logic.
    pub const AD_SELECT: &str = "ad_select";
    /// Transmit hash policy.
    pub const XMIT_HASH_POLICY: &str = "xmit_hash_policy";
    /// IGMP reports issued after failover.
    pub const RESEND_IGMP: &str = "resend_igmp";
    /// LACPDU rate.
    pub const LACP_RATE: &str = "lacp_rate";
    /// Currently active slave.
    pub const ACTIVE_SLAVE: &str = "active_slave";
    /// 802.3ad system priority.
    pub const AD_ACTOR_SYS_PRIO: &str = "ad_actor_sys_prio";
    /// 802.3ad system MAC address.
    pub const AD_ACTOR_SYSTEM: &str = "ad_actor_system";
    /// 802.3ad user port key.
    pub const AD_USER_PORT_KEY: &str = "ad_user_port_key";
    /// Deliver duplicate frames on inactive slaves.
    pub const ALL_SLAVES_ACTIVE: &str = "all_slaves_active";
    /// ARP targets that must be reachable.
    pub const ARP_ALL_TARGETS: &str = "arp_all_targets";
    /// Minimum active links before asserting carrier.
    pub const MIN_LINKS: &str = "min_links";
    /// Gratuitous ARPs after failover.
    pub const NUM_GRAT_ARP: &str = "num_grat_arp";
    /// Unsolicited IPv6 NAs after failover.
    pub const NUM_UNSOL_NA: &str = "num_unsol_na";
    /// Packets per slave in balance-rr.
    pub const PACKETS_PER_SLAVE: &str = "packets_per_slave";
    /// Dynamic shuffling in balance-tlb.
    pub const TLB_DYNAMIC_LB: &str = "tlb_dynamic_lb";
    /// Learning packet interval (s).
    pub const LP_INTERVAL: &str = "lp_interval";
}

/// Bonding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BondMode {
    /// Round-robin.
    #[default]
    #[serde(rename = "balance-rr")]
    RoundRobin,
    /// One active slave, others standby.
    #[serde(rename = "active-backup")]
    ActiveBackup,
    /// Transmit hash.
    #[serde(rename = "balance-xor")]
    Xor,
    /// Transmit on all slaves.
    #[serde(rename = "broadcast")]
    Broadcast,
    /// IEEE 802.3ad dynamic link aggregation.
    #[serde(rename = "802.3ad")]
    Lacp,
    /// Adaptive transmit load balancing.
    #[serde(rename = "balance-tlb")]
    Tlb,
    /// Adaptive load balancing.
    #[serde(rename = "balance-alb")]
    Alb,
}

impl BondMode {
    /// All modes in kernel index order.
    pub const ALL: [BondMode; 7] = [
        BondMode::RoundRobin,
        BondMode::ActiveBackup,
        BondMode::Xor,
        BondMode::Broadcast,
        BondMode::Lacp,
        BondMode::Tlb,
        BondMode::Alb,
    ];

    /// Returns the kernel name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            BondMode::RoundRobin => "balance-rr",
            BondMode::ActiveBackup => "active-backup",
            BondMode::Xor => "balance-xor",
            BondMode::Broadcast => "broadcast",
            BondMode::Lacp => "802.3ad",
            BondMode::Tlb => "balance-tlb",
            BondMode::Alb => "balance-alb",
        }
    }

    /// Returns the kernel index.
    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|m| m == self).unwrap_or_default()
    }
}

impl fmt::Display for BondMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BondMode {
    type Err = DeviceError;

    /// Accepts the kernel name or its numeric index.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(mode) = BondMode::ALL.iter().find(|m| m.as_str() == s) {
            return Ok(*mode);
        }
        s.parse::<usize>()
            .ok()
            .and_then(|idx| BondMode::ALL.get(idx).copied())
            .ok_or_else(|| DeviceError::UnknownMode {
                mode: s.to_string(),
            })
    }
}

/// How an option's value is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// Unsigned integer within bounds.
    Int {
        /// Lowest accepted value.
        min: u64,
        /// Highest accepted value.
        max: u64,
    },
    /// Enumeration the kernel reports as `"name index"`. Values are in index
    /// order.
    Both(&'static [&'static str]),
    /// Comma-separated IPv4 addresses.
    IpList,
    /// Interface name, empty allowed.
    Ifname,
    /// MAC address.
    Mac,
}

/// Modes in which an option may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSupport {
    /// Every mode.
    All,
    /// Only these modes.
    Only(&'static [BondMode]),
    /// Every mode except these.
    Except(&'static [BondMode]),
}

impl ModeSupport {
    /// Returns true if `mode` is covered.
    pub fn allows(&self, mode: BondMode) -> bool {
        match self {
            ModeSupport::All => true,
            ModeSupport::Only(modes) => modes.contains(&mode),
            ModeSupport::Except(modes) => !modes.contains(&mode),
        }
    }
}

/// One row of the option table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionDef {
    /// Option name.
    pub name: &'static str,
    /// Value used when the profile does not declare one.
    pub default: &'static str,
    /// Value representation.
    pub kind: OptionKind,
    /// Modes the kernel accepts the option in.
    pub modes: ModeSupport,
}

const U32_MAX: u64 = u32::MAX as u64;
const ALL_MODES: [BondMode; 7] = BondMode::ALL;
const NO_ARP_MON: &[BondMode] = &[BondMode::Lacp, BondMode::Tlb, BondMode::Alb];
const PRIMARY_MODES: &[BondMode] = &[BondMode::ActiveBackup, BondMode::Tlb, BondMode::Alb];
const LACP_ONLY: &[BondMode] = &[BondMode::Lacp];

const MODE_NAMES: [&str; 7] = [
    ALL_MODES[0].as_str(),
    ALL_MODES[1].as_str(),
    ALL_MODES[2].as_str(),
    ALL_MODES[3].as_str(),
    ALL_MODES[4].as_str(),
    ALL_MODES[5].as_str(),
    ALL_MODES[6].as_str(),
];

/// Every option the bonding setting model recognizes.
pub static OPTIONS: &[OptionDef] = &[
    OptionDef {
        name: opts::MODE,
        default: "balance-rr",
        kind: OptionKind::Both(&MODE_NAMES),
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::MIIMON,
        default: "100",
        kind: OptionKind::Int { min: 0, max: U32_MAX },
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::DOWNDELAY,
        default: "0",
        kind: OptionKind::Int { min: 0, max: U32_MAX },
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::UPDELAY,
        default: "0",
        kind: OptionKind::Int { min: 0, max: U32_MAX },
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::ARP_INTERVAL,
        default: "0",
        kind: OptionKind::Int { min: 0, max: U32_MAX },
        modes: ModeSupport::Except(NO_ARP_MON),
    },
    OptionDef {
        name: opts::ARP_IP_TARGET,
        default: "",
        kind: OptionKind::IpList,
        modes: ModeSupport::Except(NO_ARP_MON),
    },
    OptionDef {
        name: opts::ARP_VALIDATE,
        default: "none",
        kind: OptionKind::Both(&[
            "none",
            "active",
            "backup",
            "all",
            "filter",
            "filter_active",
            "filter_backup",
        ]),
        modes: ModeSupport::Except(NO_ARP_MON),
    },
    OptionDef {
        name: opts::PRIMARY,
        default: "",
        kind: OptionKind::Ifname,
        modes: ModeSupport::Only(PRIMARY_MODES),
    },
    OptionDef {
        name: opts::PRIMARY_RESELECT,
        default: "always",
        kind: OptionKind::Both(&["always", "better", "failure"]),
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::FAIL_OVER_MAC,
        default: "none",
        kind: OptionKind::Both(&["none", "active", "follow"]),
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::USE_CARRIER,
        default: "1",
        kind: OptionKind::Int { min: 0, max: 1 },
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::AD_SELECT,
        default: "stable",
        kind: OptionKind::Both(&["stable", "bandwidth", "count"]),
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::XMIT_HASH_POLICY,
        default: "layer2",
        kind: OptionKind::Both(&["layer2", "layer3+4", "layer2+3", "encap2+3", "encap3+4"]),
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::RESEND_IGMP,
        default: "1",
        kind: OptionKind::Int { min: 0, max: 255 },
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::LACP_RATE,
        default: "slow",
        kind: OptionKind::Both(&["slow", "fast"]),
        modes: ModeSupport::Only(LACP_ONLY),
    },
    OptionDef {
        name: opts::ACTIVE_SLAVE,
        default: "",
        kind: OptionKind::Ifname,
        modes: ModeSupport::Only(PRIMARY_MODES),
    },
    OptionDef {
        name: opts::AD_ACTOR_SYS_PRIO,
        default: "65535",
        kind: OptionKind::Int { min: 1, max: 65535 },
        modes: ModeSupport::Only(LACP_ONLY),
    },
    OptionDef {
        name: opts::AD_ACTOR_SYSTEM,
        default: "00:00:00:00:00:00",
        kind: OptionKind::Mac,
        modes: ModeSupport::Only(LACP_ONLY),
    },
    OptionDef {
        name: opts::AD_USER_PORT_KEY,
        default: "0",
        kind: OptionKind::Int { min: 0, max: 1023 },
        modes: ModeSupport::Only(LACP_ONLY),
    },
    OptionDef {
        name: opts::ALL_SLAVES_ACTIVE,
        default: "0",
        kind: OptionKind::Int { min: 0, max: 1 },
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::ARP_ALL_TARGETS,
        default: "any",
        kind: OptionKind::Both(&["any", "all"]),
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::MIN_LINKS,
        default: "0",
        kind: OptionKind::Int { min: 0, max: U32_MAX },
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::NUM_GRAT_ARP,
        default: "1",
        kind: OptionKind::Int { min: 0, max: 255 },
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::NUM_UNSOL_NA,
        default: "1",
        kind: OptionKind::Int { min: 0, max: 255 },
        modes: ModeSupport::All,
    },
    OptionDef {
        name: opts::PACKETS_PER_SLAVE,
        default: "1",
        kind: OptionKind::Int { min: 0, max: 65535 },
        modes: ModeSupport::Only(&[BondMode::RoundRobin]),
    },
    OptionDef {
        name: opts::TLB_DYNAMIC_LB,
        default: "1",
        kind: OptionKind::Int { min: 0, max: 1 },
        modes: ModeSupport::Only(&[BondMode::Tlb]),
    },
    OptionDef {
        name: opts::LP_INTERVAL,
        default: "1",
        kind: OptionKind::Int { min: 1, max: U32_MAX },
        modes: ModeSupport::All,
    },
];

/// A declared value that does not fit its option.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    /// The name is not a bonding option.
    #[error("unknown bond option '{name}'")]
    UnknownOption {
        /// Option name.
        name: String,
    },
    /// The value does not match the option's kind.
    #[error("invalid value '{value}' for bond option '{name}': expected {expected}")]
    InvalidValue {
        /// Option name.
        name: String,
        /// Declared value.
        value: String,
        /// What was expected.
        expected: String,
    },
}

/// Looks up an option by name.
pub fn lookup(name: &str) -> Option<&'static OptionDef> {
    OPTIONS.iter().find(|def| def.name == name)
}

/// Returns the default value of an option, or `""` for unknown names.
pub fn default_value(name: &str) -> &'static str {
    lookup(name).map(|def| def.default).unwrap_or("")
}

/// Returns true if the kernel accepts `name` in `mode`. Unknown names are
/// never supported.
pub fn option_supported(name: &str, mode: BondMode) -> bool {
    lookup(name).is_some_and(|def| def.modes.allows(mode))
}

fn is_ifname(value: &str) -> bool {
    value.len() < 16
        && !value.contains(|c: char| c.is_whitespace() || c == '/' || c == ':')
        && value != "."
        && value != ".."
}

fn is_mac(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Splits a target list on commas, spaces or newlines, dropping empties.
pub fn split_targets(value: &str) -> Vec<&str> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Checks a declared value against its option.
pub fn validate_option(name: &str, value: &str) -> Result<(), OptionError> {
    let def = lookup(name).ok_or_else(|| OptionError::UnknownOption {
        name: name.to_string(),
    })?;
    let invalid = |expected: String| OptionError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
        expected,
    };

    match def.kind {
        OptionKind::Int { min, max } => match value.trim().parse::<u64>() {
            Ok(n) if n >= min && n <= max => Ok(()),
            _ => Err(invalid(format!("an integer in {}..={}", min, max))),
        },
        OptionKind::Both(values) => {
            if decode_choice(values, value).is_some() {
                Ok(())
            } else {
                Err(invalid(format!("one of {}", values.join(", "))))
            }
        }
        OptionKind::IpList => {
            if split_targets(value)
                .iter()
                .all(|t| t.parse::<Ipv4Addr>().is_ok())
            {
                Ok(())
            } else {
                Err(invalid("comma-separated IPv4 addresses".to_string()))
            }
        }
        OptionKind::Ifname => {
            if value.is_empty() || is_ifname(value) {
                Ok(())
            } else {
                Err(invalid("an interface name".to_string()))
            }
        }
        OptionKind::Mac => {
            if value.is_empty() || is_mac(value) {
                Ok(())
            } else {
                Err(invalid("a MAC address".to_string()))
            }
        }
    }
}

/// Maps a name or bare index to the canonical name.
fn decode_choice(values: &'static [&'static str], raw: &str) -> Option<&'static str> {
    let token = raw.split_whitespace().next().unwrap_or("");
    if let Some(name) = values.iter().find(|v| **v == token) {
        return Some(*name);
    }
    token
        .parse::<usize>()
        .ok()
        .and_then(|idx| values.get(idx).copied())
}

/// Canonical form of a declared value, used for writes and comparisons.
///
/// Enumerations become names, integers lose leading zeros, MAC addresses are
/// lowercased and target lists become comma separated.
pub fn encode_value(def: &OptionDef, value: &str) -> String {
    let value = value.trim();
    match def.kind {
        OptionKind::Int { .. } => value
            .parse::<u64>()
            .map(|n| n.to_string())
            .unwrap_or_else(|_| value.to_string()),
        OptionKind::Both(values) => decode_choice(values, value)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        OptionKind::IpList => split_targets(value).join(","),
        OptionKind::Mac => value.to_ascii_lowercase(),
        OptionKind::Ifname => value.to_string(),
    }
}

/// Converts a kernel-reported value to profile form.
///
/// For enumerations only the first token is kept and a bare index is mapped
/// back to its name; target lists switch from spaces to commas.
pub fn decode_kernel_value(def: &OptionDef, raw: &str) -> String {
    let raw = raw.trim();
    match def.kind {
        OptionKind::Both(values) => {
            let token = raw.split_whitespace().next().unwrap_or("");
            decode_choice(values, token)
                .map(str::to_string)
                .unwrap_or_else(|| token.to_string())
        }
        OptionKind::IpList => split_targets(raw).join(","),
        _ => raw.to_string(),
    }
}

/// Returns true if `value` equals the option's default.
pub fn is_default(def: &OptionDef, value: &str) -> bool {
    encode_value(def, value) == encode_value(def, def.default)
}
