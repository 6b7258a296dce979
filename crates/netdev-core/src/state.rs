//! Device activation states and state-change reasons.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Activation state of a managed device.
///
/// States advance strictly forward through the activation stages. The only
/// way back is deactivation (`Deactivating -> Disconnected`) or re-arming a
/// failed device (`Failed -> Disconnected`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceState {
    /// Not under management.
    #[default]
    Unmanaged,
    /// Managed, no active connection.
    Disconnected,
    /// Stage 1: validating the profile and device availability.
    Prepare,
    /// Stage 2: link-layer configuration.
    Config,
    /// Waiting for the autoconfig collaborator to deliver an IP configuration.
    IpConfig,
    /// Fully configured.
    Activated,
    /// Tearing down the active connection.
    Deactivating,
    /// The last activation attempt failed.
    Failed,
}

impl DeviceState {
    /// Returns true while an activation attempt owns the device.
    pub fn is_activating(&self) -> bool {
        matches!(self, Self::Prepare | Self::Config | Self::IpConfig)
    }

    /// Returns true if a stage sequence or teardown is in flight.
    pub fn is_busy(&self) -> bool {
        self.is_activating() || *self == Self::Deactivating
    }

    /// Returns true if the device may start a new activation attempt.
    pub fn can_activate(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: DeviceState) -> bool {
        use DeviceState::*;

        // Losing the kernel link or management is always possible.
        if next == Unmanaged {
            return true;
        }
        match (*self, next) {
            (Unmanaged, Disconnected) => true,
            (Disconnected, Prepare) => true,
            (Prepare, Config | Failed | Deactivating) => true,
            (Config, IpConfig | Activated | Failed | Deactivating) => true,
            (IpConfig, Activated | Failed | Deactivating) => true,
            (Activated, Deactivating | Failed) => true,
            (Deactivating, Disconnected) => true,
            (Failed, Disconnected | Deactivating) => true,
            _ => false,
        }
    }

    /// Returns the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmanaged => "unmanaged",
            Self::Disconnected => "disconnected",
            Self::Prepare => "prepare",
            Self::Config => "config",
            Self::IpConfig => "ip-config",
            Self::Activated => "activated",
            Self::Deactivating => "deactivating",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-visible reason attached to a state change.
///
/// Codes are stable and may be exported to management front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateReason {
    /// No reason given.
    #[default]
    None,
    /// The device became managed.
    NowManaged,
    /// The kernel link went away or management was dropped.
    NowUnmanaged,
    /// The profile failed compatibility checks.
    ConnectionIncompatible,
    /// Link-layer configuration failed.
    ConfigFailed,
    /// The software link could not be created.
    CreationFailed,
    /// IP configuration was not delivered.
    IpConfigUnavailable,
    /// Attaching to the master failed.
    AttachFailed,
    /// The master device failed or went away.
    DependencyFailed,
    /// Deactivation was requested.
    UserRequested,
    /// The device was removed.
    Removed,
}

impl StateReason {
    /// Returns the stable numeric code for this reason.
    pub fn code(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::NowManaged => 2,
            Self::NowUnmanaged => 3,
            Self::ConnectionIncompatible => 10,
            Self::ConfigFailed => 11,
            Self::CreationFailed => 12,
            Self::IpConfigUnavailable => 13,
            Self::AttachFailed => 14,
            Self::DependencyFailed => 15,
            Self::UserRequested => 39,
            Self::Removed => 36,
        }
    }
}

impl fmt::Display for StateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::NowManaged => "now-managed",
            Self::NowUnmanaged => "now-unmanaged",
            Self::ConnectionIncompatible => "connection-incompatible",
            Self::ConfigFailed => "config-failed",
            Self::CreationFailed => "creation-failed",
            Self::IpConfigUnavailable => "ip-config-unavailable",
            Self::AttachFailed => "attach-failed",
            Self::DependencyFailed => "dependency-failed",
            Self::UserRequested => "user-requested",
            Self::Removed => "removed",
        };
        write!(f, "{} ({})", name, self.code())
    }
}
