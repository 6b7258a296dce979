//! Device activation engine.
//!
//! This crate drives network devices from "discovered" to "configured" and
//! back:
//!
//! - [`Device`]: one managed interface; its state field is the activation
//!   token
//! - [`DeviceClass`]: the capability set a device type implements, with
//!   generic behaviour in [`class::base`]
//! - [`ActivationAttempt`]: runs the stage hooks in order
//! - [`DeviceManager`]: registry, activation entry points, pending and
//!   postponed attempts, reconciliation and snapshots
//! - [`ConnectionProfile`]: the declarative configuration being applied
//!
//! # Stages
//!
//! ```text
//! Unmanaged -> Disconnected -> Prepare -> Config -> IpConfig -> Activated
//!                                  \          \          \
//!                                   +----------+----------+--> Failed
//! ```
//!
//! Any activating state can move to `Deactivating`, which always ends in
//! `Disconnected`.
//!
//! # Example
//!
//! ```ignore
//! use netdev_core::{ConnectionProfile, DeviceManager, EthernetClass};
//!
//! let manager = DeviceManager::new(platform);
//! manager.register_class(Arc::new(EthernetClass::new()));
//! manager.discover().await?;
//! let outcome = manager.activate(profile).await?;
//! ```

pub mod activation;
pub mod class;
pub mod device;
pub mod error;
pub mod ethernet;
pub mod ip_config;
pub mod manager;
pub mod pending;
pub mod profile;
pub mod stage;
pub mod state;

pub use activation::{ActivationAttempt, ActivationOutcome, ActivationStage};
pub use class::{DeviceClass, StageContext};
pub use device::{DeactivationRequest, Device, DeviceCapabilities};
pub use error::{DeviceError, DeviceResult};
pub use ethernet::EthernetClass;
pub use ip_config::{IpAddress, IpConfig, IpConfigSource};
pub use manager::{DeviceManager, DeviceSnapshot, ReconcileReport};
pub use pending::{Constraint, PendingActivations};
pub use profile::{
    BondSetting, ConnectionProfile, ConnectionSetting, IpMethod, IpSetting, WiredSetting,
    BOND_CONNECTION_TYPE, ETHERNET_CONNECTION_TYPE,
};
pub use stage::{ActStageReturn, Diagnostic, DiagnosticKind, Diagnostics};
pub use state::{DeviceState, StateReason};
