//! The platform contract consumed by the device state machine.
//!
//! Calls are blocking from the caller's point of view: a stage awaits each
//! one before issuing the next, so kernel mutations for one device are never
//! interleaved.

use async_trait::async_trait;

use crate::error::PlatformResult;
use crate::link::{LinkType, PlatformLink};

/// Link-mutation contract of the kernel networking layer.
///
/// # Example
///
/// ```ignore
/// use netdev_platform::{LinkType, Platform};
///
/// async fn make_bond(platform: &dyn Platform) -> PlatformResult<i32> {
///     let link = platform.create_master_link("bond0", LinkType::Bond).await?;
///     platform.set_master_attribute(link.ifindex, "miimon", "100").await?;
///     Ok(link.ifindex)
/// }
/// ```
#[async_trait]
pub trait Platform: Send + Sync {
    /// Returns the name of this backend (for logging).
    fn name(&self) -> &str;

    /// Lists all kernel links.
    async fn links(&self) -> PlatformResult<Vec<PlatformLink>>;

    /// Looks up a link by interface name.
    async fn link_get(&self, name: &str) -> PlatformResult<Option<PlatformLink>>;

    /// Looks up a link by interface index.
    async fn link_get_by_index(&self, ifindex: i32) -> PlatformResult<Option<PlatformLink>>;

    /// Creates a software master link (bond, team, bridge).
    async fn create_master_link(&self, name: &str, link_type: LinkType)
        -> PlatformResult<PlatformLink>;

    /// Deletes a link.
    async fn link_delete(&self, ifindex: i32) -> PlatformResult<()>;

    /// Attaches `slave` under `master`.
    async fn enslave(&self, master: i32, slave: i32) -> PlatformResult<()>;

    /// Detaches `slave` from `master`.
    async fn release(&self, master: i32, slave: i32) -> PlatformResult<()>;

    /// Writes a master attribute (sysfs-style key/value).
    async fn set_master_attribute(&self, ifindex: i32, name: &str, value: &str)
        -> PlatformResult<()>;

    /// Reads a master attribute. An attribute the kernel does not report reads
    /// as an empty string.
    async fn get_master_attribute(&self, ifindex: i32, name: &str) -> PlatformResult<String>;

    /// Sets the link administratively up.
    async fn link_set_up(&self, ifindex: i32) -> PlatformResult<()>;

    /// Sets the link administratively down.
    async fn link_set_down(&self, ifindex: i32) -> PlatformResult<()>;
}
