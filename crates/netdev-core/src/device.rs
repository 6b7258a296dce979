//! The managed device and its activation-state field.

use std::fmt;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use netdev_platform::{LinkType, Platform, PlatformError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::class::DeviceClass;
use crate::error::{DeviceError, DeviceResult};
use crate::ip_config::IpConfig;
use crate::profile::ConnectionProfile;
use crate::stage::Diagnostics;
use crate::state::{DeviceState, StateReason};

bitflags! {
    /// Capability flags exported with the device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DeviceCapabilities: u32 {
        /// The device reports carrier changes.
        const CARRIER_DETECT = 1 << 0;
        /// The device is a software link the daemon can create and delete.
        const IS_SOFTWARE = 1 << 1;
        /// The device can have slaves.
        const IS_MASTER = 1 << 2;
    }
}

/// What a deactivation request found when it took the state token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivationRequest {
    /// A stage sequence is running; it will observe `Deactivating` at its
    /// next stage boundary and finish the teardown.
    Deferred,
    /// Nothing is running; the caller must tear down now.
    Immediate,
    /// The device had no active connection.
    Idle,
}

struct DeviceInner {
    ifindex: Option<i32>,
    state: DeviceState,
    reason: StateReason,
    running: bool,
    slaves: Vec<Arc<Device>>,
    master: Weak<Device>,
    applied: Option<Arc<ConnectionProfile>>,
    ip_config: Option<IpConfig>,
    physical_port_id: Option<String>,
    diagnostics: Diagnostics,
    last_change: DateTime<Utc>,
}

/// One kernel network interface under management.
///
/// The link type and class never change after construction. All mutable
/// state sits behind one lock; the state field doubles as the token that
/// keeps a second activation attempt out while one is in flight.
pub struct Device {
    iface: String,
    link_type: LinkType,
    class: Arc<dyn DeviceClass>,
    capabilities: DeviceCapabilities,
    inner: RwLock<DeviceInner>,
    slave_ops: tokio::sync::Mutex<()>,
}

impl Device {
    /// Creates an unmanaged, unrealized device.
    pub fn new(iface: impl Into<String>, class: Arc<dyn DeviceClass>) -> Arc<Self> {
        let mut capabilities = class.generic_capabilities();
        if class.is_master() {
            capabilities |= DeviceCapabilities::IS_MASTER;
        }
        Arc::new(Self {
            iface: iface.into(),
            link_type: class.link_type(),
            class,
            capabilities,
            inner: RwLock::new(DeviceInner {
                ifindex: None,
                state: DeviceState::Unmanaged,
                reason: StateReason::None,
                running: false,
                slaves: Vec::new(),
                master: Weak::new(),
                applied: None,
                ip_config: None,
                physical_port_id: None,
                diagnostics: Diagnostics::new(),
                last_change: Utc::now(),
            }),
            slave_ops: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns the interface name.
    pub fn iface(&self) -> &str {
        &self.iface
    }

    /// Returns the link type.
    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// Returns the device class.
    pub fn class(&self) -> &Arc<dyn DeviceClass> {
        &self.class
    }

    /// Returns the capability flags.
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    /// Returns true if the device can have slaves.
    pub fn is_master(&self) -> bool {
        self.capabilities.contains(DeviceCapabilities::IS_MASTER)
    }

    /// Returns true if the device is a software link.
    pub fn is_software(&self) -> bool {
        self.capabilities.contains(DeviceCapabilities::IS_SOFTWARE)
    }

    /// Returns the kernel interface index while the link exists.
    pub fn ifindex(&self) -> Option<i32> {
        self.inner.read().ifindex
    }

    /// Returns the interface index or a not-found error.
    pub fn require_ifindex(&self) -> DeviceResult<i32> {
        self.ifindex().ok_or_else(|| {
            DeviceError::Platform(PlatformError::LinkNameNotFound {
                name: self.iface.clone(),
            })
        })
    }

    /// Returns true if a kernel link backs this device.
    pub fn is_realized(&self) -> bool {
        self.ifindex().is_some()
    }

    /// Binds the device to a kernel link.
    pub fn realize(&self, ifindex: i32, physical_port_id: Option<String>) {
        let mut inner = self.inner.write();
        inner.ifindex = Some(ifindex);
        inner.physical_port_id = physical_port_id;
        debug!(device = %self.iface, ifindex, "device realized");
    }

    /// Forgets the kernel link.
    pub fn unrealize(&self) {
        let mut inner = self.inner.write();
        inner.ifindex = None;
        inner.physical_port_id = None;
    }

    /// Returns the physical port id reported by the kernel.
    pub fn physical_port_id(&self) -> Option<String> {
        self.inner.read().physical_port_id.clone()
    }

    /// Returns the current state.
    pub fn state(&self) -> DeviceState {
        self.inner.read().state
    }

    /// Returns the reason attached to the last state change.
    pub fn state_reason(&self) -> StateReason {
        self.inner.read().reason
    }

    /// Returns when the state last changed.
    pub fn last_state_change(&self) -> DateTime<Utc> {
        self.inner.read().last_change
    }

    fn apply_state(&self, inner: &mut DeviceInner, next: DeviceState, reason: StateReason) {
        let old = inner.state;
        inner.state = next;
        inner.reason = reason;
        inner.last_change = Utc::now();
        info!(
            device = %self.iface,
            from = %old,
            to = %next,
            reason = %reason,
            "device state changed"
        );
    }

    /// Moves to `next` if the transition is legal.
    ///
    /// Returns false and leaves the state alone otherwise.
    pub fn set_state(&self, next: DeviceState, reason: StateReason) -> bool {
        let mut inner = self.inner.write();
        if inner.state == next {
            return true;
        }
        if !inner.state.can_transition_to(next) {
            warn!(
                device = %self.iface,
                from = %inner.state,
                to = %next,
                "illegal state transition ignored"
            );
            return false;
        }
        self.apply_state(&mut inner, next, reason);
        true
    }

    /// Moves from `from` to `to` only if the device is still in `from`.
    ///
    /// Stage runners use this at every stage boundary; it fails when a
    /// deactivation took the state in the meantime.
    pub fn advance(&self, from: DeviceState, to: DeviceState, reason: StateReason) -> bool {
        let mut inner = self.inner.write();
        if inner.state != from || !from.can_transition_to(to) {
            return false;
        }
        self.apply_state(&mut inner, to, reason);
        true
    }

    /// Takes the activation token: moves an idle device into `Prepare` and
    /// records the profile being applied.
    ///
    /// A failed device is re-armed through `Disconnected` first.
    pub fn try_begin_activation(&self, profile: Arc<ConnectionProfile>) -> DeviceResult<()> {
        let mut inner = self.inner.write();
        let current = inner.state;
        match current {
            DeviceState::Unmanaged => {
                return Err(DeviceError::Unmanaged {
                    iface: self.iface.clone(),
                })
            }
            state if !state.can_activate() || inner.running => {
                return Err(DeviceError::Busy {
                    iface: self.iface.clone(),
                    state: state.to_string(),
                })
            }
            DeviceState::Failed => {
                self.apply_state(&mut inner, DeviceState::Disconnected, StateReason::None);
            }
            _ => {}
        }
        self.apply_state(&mut inner, DeviceState::Prepare, StateReason::None);
        inner.running = true;
        inner.applied = Some(profile);
        inner.ip_config = None;
        inner.diagnostics = Diagnostics::new();
        Ok(())
    }

    /// Re-takes the running flag for a postponed attempt.
    ///
    /// Returns false if the device left the activation stages or something
    /// else is running.
    pub fn resume_activation(&self) -> bool {
        let mut inner = self.inner.write();
        if !matches!(inner.state, DeviceState::Prepare | DeviceState::Config) || inner.running {
            return false;
        }
        inner.running = true;
        true
    }

    /// Releases the running flag at the end of a stage sequence.
    pub fn finish_run(&self) {
        self.inner.write().running = false;
    }

    /// Returns true while a stage sequence executes.
    pub fn is_running(&self) -> bool {
        self.inner.read().running
    }

    /// Requests deactivation.
    pub fn request_deactivation(&self, reason: StateReason) -> DeactivationRequest {
        let mut inner = self.inner.write();
        let current = inner.state;
        match current {
            DeviceState::Unmanaged | DeviceState::Disconnected => DeactivationRequest::Idle,
            DeviceState::Deactivating if inner.running => DeactivationRequest::Deferred,
            DeviceState::Deactivating => DeactivationRequest::Immediate,
            _ => {
                self.apply_state(&mut inner, DeviceState::Deactivating, reason);
                if inner.running {
                    DeactivationRequest::Deferred
                } else {
                    DeactivationRequest::Immediate
                }
            }
        }
    }

    /// Returns the profile of the current or last activation.
    pub fn applied_profile(&self) -> Option<Arc<ConnectionProfile>> {
        self.inner.read().applied.clone()
    }

    /// Replaces the applied profile.
    pub fn set_applied_profile(&self, profile: Option<Arc<ConnectionProfile>>) {
        self.inner.write().applied = profile;
    }

    /// Returns the committed IP configuration.
    pub fn ip_config(&self) -> Option<IpConfig> {
        self.inner.read().ip_config.clone()
    }

    /// Commits an IP configuration.
    pub fn set_ip_config(&self, config: Option<IpConfig>) {
        self.inner.write().ip_config = config;
    }

    /// Returns diagnostics of the last attempt.
    pub fn diagnostics(&self) -> Diagnostics {
        self.inner.read().diagnostics.clone()
    }

    /// Stores diagnostics of the last attempt.
    pub fn set_diagnostics(&self, diagnostics: Diagnostics) {
        self.inner.write().diagnostics = diagnostics;
    }

    /// Returns the current slaves in enslavement order.
    pub fn slaves(&self) -> Vec<Arc<Device>> {
        self.inner.read().slaves.clone()
    }

    /// Returns true if `iface` is a slave of this device.
    pub fn has_slave(&self, iface: &str) -> bool {
        self.inner.read().slaves.iter().any(|s| s.iface() == iface)
    }

    /// Records `slave` as enslaved to this device.
    pub fn add_slave(self: &Arc<Self>, slave: &Arc<Device>) {
        {
            let mut inner = self.inner.write();
            if !inner.slaves.iter().any(|s| Arc::ptr_eq(s, slave)) {
                inner.slaves.push(slave.clone());
            }
        }
        slave.inner.write().master = Arc::downgrade(self);
    }

    /// Forgets `slave`.
    pub fn remove_slave(&self, slave: &Arc<Device>) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            let before = inner.slaves.len();
            inner.slaves.retain(|s| !Arc::ptr_eq(s, slave));
            inner.slaves.len() != before
        };
        let mut slave_inner = slave.inner.write();
        if slave_inner
            .master
            .upgrade()
            .is_some_and(|m| std::ptr::eq(Arc::as_ptr(&m), self))
        {
            slave_inner.master = Weak::new();
        }
        removed
    }

    /// Returns the master, if this device is enslaved.
    pub fn master(&self) -> Option<Arc<Device>> {
        self.inner.read().master.upgrade()
    }

    /// Serializes enslave/release steps on a master so one slave's
    /// down/attach/up sequence completes before the next one starts.
    pub async fn lock_slave_ops(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.slave_ops.lock().await
    }

    /// Sets the link administratively up.
    pub async fn bring_up(&self, platform: &dyn Platform) -> DeviceResult<()> {
        let ifindex = self.require_ifindex()?;
        platform.link_set_up(ifindex).await?;
        Ok(())
    }

    /// Sets the link administratively down.
    pub async fn take_down(&self, platform: &dyn Platform) -> DeviceResult<()> {
        let ifindex = self.require_ifindex()?;
        platform.link_set_down(ifindex).await?;
        Ok(())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Device")
            .field("iface", &self.iface)
            .field("type", &self.class.type_description())
            .field("ifindex", &inner.ifindex)
            .field("state", &inner.state)
            .field("slaves", &inner.slaves.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethernet::EthernetClass;
    use crate::profile::{ConnectionProfile, ETHERNET_CONNECTION_TYPE};

    fn ethernet(name: &str) -> Arc<Device> {
        let device = Device::new(name, Arc::new(EthernetClass::new()));
        device.set_state(DeviceState::Disconnected, StateReason::NowManaged);
        device
    }

    fn profile(name: &str) -> Arc<ConnectionProfile> {
        Arc::new(ConnectionProfile::new(name, ETHERNET_CONNECTION_TYPE).with_interface_name(name))
    }

    #[test]
    fn test_capabilities_from_class() {
        let device = ethernet("eth0");
        assert!(device
            .capabilities()
            .contains(DeviceCapabilities::CARRIER_DETECT));
        assert!(!device.is_master());
        assert_eq!(device.link_type(), LinkType::Ethernet);
    }

    #[test]
    fn test_begin_activation_is_exclusive() {
        let device = ethernet("eth0");

        device.try_begin_activation(profile("eth0")).unwrap();
        assert_eq!(device.state(), DeviceState::Prepare);

        let second = device.try_begin_activation(profile("eth0"));
        assert!(matches!(second, Err(DeviceError::Busy { .. })));
    }

    #[test]
    fn test_begin_activation_rejects_unmanaged() {
        let device = Device::new("eth0", Arc::new(EthernetClass::new()));
        assert!(matches!(
            device.try_begin_activation(profile("eth0")),
            Err(DeviceError::Unmanaged { .. })
        ));
    }

    #[test]
    fn test_failed_device_rearms() {
        let device = ethernet("eth0");
        device.try_begin_activation(profile("eth0")).unwrap();
        assert!(device.advance(
            DeviceState::Prepare,
            DeviceState::Failed,
            StateReason::ConfigFailed
        ));
        device.finish_run();

        device.try_begin_activation(profile("eth0")).unwrap();
        assert_eq!(device.state(), DeviceState::Prepare);
    }

    #[test]
    fn test_advance_observes_deactivation() {
        let device = ethernet("eth0");
        device.try_begin_activation(profile("eth0")).unwrap();

        assert_eq!(
            device.request_deactivation(StateReason::UserRequested),
            DeactivationRequest::Deferred
        );
        assert!(!device.advance(DeviceState::Prepare, DeviceState::Config, StateReason::None));
        assert_eq!(device.state(), DeviceState::Deactivating);
    }

    #[test]
    fn test_deactivation_of_idle_device() {
        let device = ethernet("eth0");
        assert_eq!(
            device.request_deactivation(StateReason::UserRequested),
            DeactivationRequest::Idle
        );

        device.try_begin_activation(profile("eth0")).unwrap();
        device.finish_run();
        assert_eq!(
            device.request_deactivation(StateReason::UserRequested),
            DeactivationRequest::Immediate
        );
    }

    #[test]
    fn test_slave_bookkeeping() {
        let master = ethernet("bond0");
        let slave = ethernet("eth0");

        master.add_slave(&slave);
        master.add_slave(&slave);
        assert_eq!(master.slaves().len(), 1);
        assert_eq!(slave.master().map(|m| m.iface().to_string()), Some("bond0".into()));

        assert!(master.remove_slave(&slave));
        assert!(slave.master().is_none());
        assert!(!master.has_slave("eth0"));
    }

    #[test]
    fn test_illegal_transition_is_ignored() {
        let device = ethernet("eth0");
        assert!(!device.set_state(DeviceState::Activated, StateReason::None));
        assert_eq!(device.state(), DeviceState::Disconnected);
    }
}
