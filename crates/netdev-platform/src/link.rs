//! Kernel link model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kernel link type.
///
/// A device's link type is fixed at creation and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    /// Physical Ethernet NIC.
    #[default]
    Ethernet,
    /// Bonding master.
    Bond,
    /// Team master.
    Team,
    /// Linux bridge.
    Bridge,
    /// Loopback.
    Loopback,
    /// Anything the platform could not classify.
    Unknown,
}

impl LinkType {
    /// Returns the `ip link ... type <kind>` keyword, if the link can be created
    /// as a software link.
    pub fn kind(&self) -> Option<&'static str> {
        match self {
            Self::Bond => Some("bond"),
            Self::Team => Some("team"),
            Self::Bridge => Some("bridge"),
            Self::Ethernet | Self::Loopback | Self::Unknown => None,
        }
    }

    /// Returns true for link types that only exist in software.
    pub fn is_software(&self) -> bool {
        self.kind().is_some()
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ethernet => write!(f, "ethernet"),
            Self::Bond => write!(f, "bond"),
            Self::Team => write!(f, "team"),
            Self::Bridge => write!(f, "bridge"),
            Self::Loopback => write!(f, "loopback"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ethernet" | "ether" => Ok(Self::Ethernet),
            "bond" => Ok(Self::Bond),
            "team" => Ok(Self::Team),
            "bridge" => Ok(Self::Bridge),
            "loopback" => Ok(Self::Loopback),
            _ => Err(format!("Unknown link type: {}", s)),
        }
    }
}

/// Snapshot of one kernel link as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformLink {
    /// Kernel-assigned interface index.
    pub ifindex: i32,
    /// Interface name.
    pub name: String,
    /// Link type.
    pub link_type: LinkType,
    /// Interface index of the master this link is enslaved to.
    pub master: Option<i32>,
    /// Administrative up flag (IFF_UP).
    pub up: bool,
    /// Physical port identifier (shared by ports of one multi-port NIC).
    pub physical_port_id: Option<String>,
}

impl PlatformLink {
    /// Creates a link snapshot with no master that is administratively down.
    pub fn new(ifindex: i32, name: impl Into<String>, link_type: LinkType) -> Self {
        Self {
            ifindex,
            name: name.into(),
            link_type,
            master: None,
            up: false,
            physical_port_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_type_round_trip_names() {
        for lt in [
            LinkType::Ethernet,
            LinkType::Bond,
            LinkType::Team,
            LinkType::Bridge,
            LinkType::Loopback,
        ] {
            assert_eq!(lt.to_string().parse::<LinkType>().unwrap(), lt);
        }
        assert!("vxlan".parse::<LinkType>().is_err());
    }

    #[test]
    fn test_software_kinds() {
        assert_eq!(LinkType::Bond.kind(), Some("bond"));
        assert!(LinkType::Bond.is_software());
        assert!(!LinkType::Ethernet.is_software());
    }

    #[test]
    fn test_platform_link_new() {
        let link = PlatformLink::new(4, "eth0", LinkType::Ethernet);
        assert_eq!(link.ifindex, 4);
        assert!(link.master.is_none());
        assert!(!link.up);
    }
}
