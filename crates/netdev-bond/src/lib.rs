//! Bonding (link aggregation) device class.
//!
//! Translates a declarative bond setting into the ordered sequence of kernel
//! master-attribute writes, and rebuilds a minimal bond setting from live
//! kernel values:
//!
//! - [`options`]: typed option table, mode enum, value encode/decode
//! - [`plan`]: the pure write planner with the inter-option dependency rules
//! - [`BondClass`]: the [`DeviceClass`](netdev_core::DeviceClass)
//!   implementation, including slave enslave/release orchestration
//! - [`reconcile`]: kernel-to-profile direction and drift detection

pub mod device;
pub mod options;
pub mod plan;
pub mod reconcile;

pub use device::{apply_bonding_config, BondClass, BOND_SLAVE_TYPE};
pub use options::{opts, BondMode, ModeSupport, OptionError, OptionKind, OptionDef, OPTIONS};
pub use plan::{build_write_plan, resolve_mode, AttrWrite, WriteOrigin};
pub use reconcile::{detect_drift, read_bond_options, update_connection};
