//! Error types for device management.

use netdev_platform::PlatformError;
use thiserror::Error;

use crate::state::StateReason;

/// Result type alias for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors surfaced by the device state machine and its specializations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The profile failed compatibility checks. Surfaced before any kernel
    /// mutation and never retried.
    #[error("Connection '{connection}' is incompatible with device '{iface}': {message}")]
    IncompatibleProfile {
        /// Device interface name.
        iface: String,
        /// Connection id.
        connection: String,
        /// What did not match.
        message: String,
    },

    /// The profile is structurally invalid (missing id, uuid or type).
    #[error("Invalid connection profile: {message}")]
    InvalidProfile {
        /// What is missing or malformed.
        message: String,
    },

    /// Unrecognized bonding mode string.
    #[error("Unknown bond mode '{mode}'")]
    UnknownMode {
        /// The mode string from the profile.
        mode: String,
    },

    /// The kernel refused one attribute write. Non-fatal.
    #[error("Kernel rejected {attribute}={value:?}: {message}")]
    KernelRejected {
        /// Attribute name.
        attribute: String,
        /// Value written.
        value: String,
        /// Why it was rejected.
        message: String,
    },

    /// Enslaving a slave failed at the platform layer.
    #[error("Failed to attach '{slave}' to '{master}': {message}")]
    AttachFailed {
        /// Master interface name.
        master: String,
        /// Slave interface name.
        slave: String,
        /// Platform error text.
        message: String,
    },

    /// Releasing a slave failed at the platform layer.
    #[error("Failed to release '{slave}' from '{master}': {message}")]
    DetachFailed {
        /// Master interface name.
        master: String,
        /// Slave interface name.
        slave: String,
        /// Platform error text.
        message: String,
    },

    /// The kernel link could not be created.
    #[error("{message}")]
    CreationFailed {
        /// Interface name.
        iface: String,
        /// Full caller-visible message including the platform error text.
        message: String,
    },

    /// An activation attempt or teardown is already in flight.
    #[error("Device '{iface}' is busy ({state})")]
    Busy {
        /// Interface name.
        iface: String,
        /// Current state name.
        state: String,
    },

    /// The device is not under management.
    #[error("Device '{iface}' is unmanaged")]
    Unmanaged {
        /// Interface name.
        iface: String,
    },

    /// No device with this interface name.
    #[error("Device '{iface}' not found")]
    DeviceNotFound {
        /// Interface name.
        iface: String,
    },

    /// No registered device class handles this link or connection type.
    #[error("No device class for {kind} '{name}'")]
    UnsupportedType {
        /// "link type" or "connection type".
        kind: String,
        /// The type name.
        name: String,
    },

    /// A master-only operation was invoked on a device that is not a master.
    #[error("Device '{iface}' cannot have slaves")]
    NotAMaster {
        /// Interface name.
        iface: String,
    },

    /// The operation does not apply in the device's current state.
    #[error("Cannot {operation} device '{iface}' in state {state}")]
    WrongState {
        /// Interface name.
        iface: String,
        /// The operation.
        operation: String,
        /// Current state name.
        state: String,
    },

    /// The requested operation is not implemented by this device class.
    #[error("{operation} is not supported by {device_type} devices")]
    NotSupported {
        /// The operation.
        operation: String,
        /// Device type description.
        device_type: String,
    },

    /// A platform call failed outside of a best-effort path.
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl DeviceError {
    /// Creates an incompatible-profile error.
    pub fn incompatible(
        iface: impl Into<String>,
        connection: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::IncompatibleProfile {
            iface: iface.into(),
            connection: connection.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid-profile error.
    pub fn invalid_profile(message: impl Into<String>) -> Self {
        Self::InvalidProfile {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(iface: impl Into<String>) -> Self {
        Self::DeviceNotFound {
            iface: iface.into(),
        }
    }

    /// Creates a not-supported error.
    pub fn not_supported(operation: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
            device_type: device_type.into(),
        }
    }

    /// Maps this error to the reason code reported with the resulting state.
    pub fn reason(&self) -> StateReason {
        match self {
            DeviceError::IncompatibleProfile { .. } | DeviceError::InvalidProfile { .. } => {
                StateReason::ConnectionIncompatible
            }
            DeviceError::UnknownMode { .. } | DeviceError::KernelRejected { .. } => {
                StateReason::ConfigFailed
            }
            DeviceError::AttachFailed { .. } | DeviceError::DetachFailed { .. } => {
                StateReason::AttachFailed
            }
            DeviceError::CreationFailed { .. } => StateReason::CreationFailed,
            DeviceError::Unmanaged { .. } => StateReason::NowUnmanaged,
            DeviceError::Busy { .. }
            | DeviceError::DeviceNotFound { .. }
            | DeviceError::UnsupportedType { .. }
            | DeviceError::NotAMaster { .. }
            | DeviceError::WrongState { .. }
            | DeviceError::NotSupported { .. }
            | DeviceError::Platform(_) => StateReason::None,
        }
    }

    /// Returns true if a later attempt may succeed without changing the
    /// profile.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeviceError::Busy { .. }
            | DeviceError::AttachFailed { .. }
            | DeviceError::DetachFailed { .. } => true,
            DeviceError::Platform(e) => e.is_retryable(),
            _ => false,
        }
    }
}
