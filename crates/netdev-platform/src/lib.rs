//! Kernel link platform abstraction for the netdev device-activation engine.
//!
//! The device state machine never touches the kernel directly. Every link
//! mutation goes through a [`Platform`] handle that is passed explicitly into
//! the call that needs it:
//!
//! - [`Platform`]: the link-mutation contract (create, enslave, release,
//!   up/down, master attribute get/set)
//! - [`LinuxPlatform`]: `ip link` commands plus the bonding sysfs tree
//! - [`InMemoryPlatform`]: a kernel simulation that records every call, used
//!   for dry runs and tests
//! - [`shell`]: command execution with proper quoting
//! - [`error`]: error types for platform operations
//!
//! # Example
//!
//! ```ignore
//! use netdev_platform::{InMemoryPlatform, LinkType, Platform};
//!
//! let platform = InMemoryPlatform::new();
//! let bond = platform.create_master_link("bond0", LinkType::Bond).await?;
//! platform.set_master_attribute(bond.ifindex, "mode", "active-backup").await?;
//! ```

pub mod error;
pub mod link;
pub mod linux;
pub mod memory;
pub mod platform;
pub mod shell;

// Re-export commonly used items at crate root
pub use error::{PlatformError, PlatformResult};
pub use link::{LinkType, PlatformLink};
pub use linux::LinuxPlatform;
pub use memory::{InMemoryPlatform, PlatformOp};
pub use platform::Platform;
