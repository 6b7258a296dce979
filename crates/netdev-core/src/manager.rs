//! Device registry and activation entry points.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use netdev_platform::{LinkType, Platform, PlatformLink};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::activation::{ActivationAttempt, ActivationOutcome};
use crate::class::{DeviceClass, StageContext};
use crate::device::{DeactivationRequest, Device, DeviceCapabilities};
use crate::error::{DeviceError, DeviceResult};
use crate::ip_config::IpConfig;
use crate::pending::{Constraint, PendingActivations};
use crate::profile::ConnectionProfile;
use crate::stage::{ActStageReturn, Diagnostics};
use crate::state::{DeviceState, StateReason};

/// Read-only view of one device for management front ends.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    /// Interface name.
    pub iface: String,
    /// Kernel interface index.
    pub ifindex: Option<i32>,
    /// Device type description.
    pub device_type: String,
    /// Kernel link type.
    pub link_type: LinkType,
    /// Activation state.
    pub state: DeviceState,
    /// Reason of the last state change.
    pub state_reason: StateReason,
    /// Capability flags.
    pub capabilities: DeviceCapabilities,
    /// Master interface, for slaves.
    pub master: Option<String>,
    /// Slave interfaces, in enslavement order.
    pub slaves: Vec<String>,
    /// Profile of the current or last activation.
    pub applied: Option<ConnectionProfile>,
    /// Profile derived from the kernel.
    pub reconciled: Option<ConnectionProfile>,
    /// Committed IP configuration.
    pub ip_config: Option<IpConfig>,
    /// Diagnostics of the last attempt.
    pub diagnostics: Diagnostics,
    /// When the state last changed.
    pub last_state_change: DateTime<Utc>,
}

/// Result of one reconciliation pass over a device.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    /// Interface name.
    pub iface: String,
    /// Settings whose kernel value differed from the applied profile.
    pub drifted: Vec<String>,
    /// Result of re-running the config stage, if it ran.
    pub result: Option<ActStageReturn>,
    /// Diagnostics of the re-run.
    pub diagnostics: Diagnostics,
}

impl ReconcileReport {
    /// Returns true if the kernel matched the applied profile.
    pub fn in_sync(&self) -> bool {
        self.drifted.is_empty()
    }
}

/// Owns every managed device and drives activations.
///
/// Each device runs at most one stage sequence at a time. Different devices
/// are independent; the only cross-device serialization is the per-master
/// slave lock taken around enslave and release.
pub struct DeviceManager {
    platform: Arc<dyn Platform>,
    classes: RwLock<Vec<Arc<dyn DeviceClass>>>,
    devices: DashMap<String, Arc<Device>>,
    pending: Mutex<PendingActivations>,
    postponed: Mutex<HashMap<String, ActivationAttempt>>,
}

impl DeviceManager {
    /// Creates a manager with no device classes registered.
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            classes: RwLock::new(Vec::new()),
            devices: DashMap::new(),
            pending: Mutex::new(PendingActivations::new()),
            postponed: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the platform handle.
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Registers a device class. Later registrations for the same link or
    /// connection type take precedence.
    pub fn register_class(&self, class: Arc<dyn DeviceClass>) {
        info!(
            device_type = class.type_description(),
            connection_type = class.connection_type(),
            "registered device class"
        );
        self.classes.write().insert(0, class);
    }

    fn class_for_link(&self, link_type: LinkType) -> Option<Arc<dyn DeviceClass>> {
        self.classes
            .read()
            .iter()
            .find(|c| c.link_type() == link_type)
            .cloned()
    }

    fn class_for_connection(&self, connection_type: &str) -> Option<Arc<dyn DeviceClass>> {
        self.classes
            .read()
            .iter()
            .find(|c| c.connection_type() == connection_type)
            .cloned()
    }

    /// Returns the device with this interface name.
    pub fn device(&self, iface: &str) -> Option<Arc<Device>> {
        self.devices.get(iface).map(|d| d.value().clone())
    }

    fn require_device(&self, iface: &str) -> DeviceResult<Arc<Device>> {
        self.device(iface).ok_or_else(|| DeviceError::not_found(iface))
    }

    /// Returns the device bound to a kernel interface index.
    pub fn device_by_ifindex(&self, ifindex: i32) -> Option<Arc<Device>> {
        self.devices
            .iter()
            .find(|d| d.value().ifindex() == Some(ifindex))
            .map(|d| d.value().clone())
    }

    /// Returns all devices sorted by interface name.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<_> = self.devices.iter().map(|d| d.value().clone()).collect();
        devices.sort_by(|a, b| a.iface().cmp(b.iface()));
        devices
    }

    /// Returns the number of queued activation requests.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns the number of postponed attempts.
    pub fn postponed_count(&self) -> usize {
        self.postponed.lock().len()
    }

    /// Takes existing kernel links under management and records kernel-level
    /// enslavements that already exist.
    ///
    /// Returns the names of newly managed devices.
    #[instrument(skip(self))]
    pub async fn discover(&self) -> DeviceResult<Vec<String>> {
        let links = self.platform.links().await?;
        let mut added = Vec::new();

        for link in &links {
            if self.manage_link(link).is_some() {
                added.push(link.name.clone());
            }
        }

        for link in &links {
            let Some(master_index) = link.master else {
                continue;
            };
            let (Some(master), Some(slave)) =
                (self.device_by_ifindex(master_index), self.device(&link.name))
            else {
                continue;
            };
            if !master.is_master() || master.has_slave(slave.iface()) {
                continue;
            }

            let _guard = master.lock_slave_ops().await;
            if let Err(e) = master
                .class()
                .enslave_slave(self.platform.as_ref(), &master, &slave, None, false)
                .await
            {
                warn!(master = %master.iface(), slave = %slave.iface(), error = %e, "failed to record existing slave");
            }
        }

        info!(count = added.len(), "discovered devices");
        Ok(added)
    }

    /// Takes one kernel link under management. Returns the new device, or
    /// `None` if the link is already managed or no class handles its type.
    pub fn manage_link(&self, link: &PlatformLink) -> Option<Arc<Device>> {
        if let Some(existing) = self.device(&link.name) {
            if !existing.is_realized() {
                existing.realize(link.ifindex, link.physical_port_id.clone());
            }
            return None;
        }

        let Some(class) = self.class_for_link(link.link_type) else {
            debug!(link = %link.name, link_type = %link.link_type, "no device class for link");
            return None;
        };

        let device = Device::new(&link.name, class);
        device.realize(link.ifindex, link.physical_port_id.clone());
        device.set_state(DeviceState::Disconnected, StateReason::NowManaged);
        self.devices.insert(link.name.clone(), device.clone());
        Some(device)
    }

    /// Fills in a partially specified profile using the class for its type.
    pub fn complete_connection(
        &self,
        profile: ConnectionProfile,
        existing: &[ConnectionProfile],
    ) -> DeviceResult<ConnectionProfile> {
        let class = self
            .class_for_connection(profile.connection_type())
            .ok_or_else(|| DeviceError::UnsupportedType {
                kind: "connection type".to_string(),
                name: profile.connection_type().to_string(),
            })?;
        class.complete_connection(profile, existing)
    }

    /// Activates `profile` on the device named by its interface name.
    ///
    /// Profile and compatibility errors are returned before anything is
    /// touched. A device with an attempt in flight yields `Busy` and the
    /// request is queued until the device is idle. A slave whose master is not
    /// ready is queued and reported as [`ActivationOutcome::Queued`].
    #[instrument(skip(self, profile), fields(connection = %profile.id()))]
    pub async fn activate(&self, profile: ConnectionProfile) -> DeviceResult<ActivationOutcome> {
        profile.verify()?;
        let iface = profile
            .interface_name()
            .ok_or_else(|| {
                DeviceError::invalid_profile(format!(
                    "connection '{}' has no interface name",
                    profile.id()
                ))
            })?
            .to_string();
        let class = self
            .class_for_connection(profile.connection_type())
            .ok_or_else(|| DeviceError::UnsupportedType {
                kind: "connection type".to_string(),
                name: profile.connection_type().to_string(),
            })?;
        let profile = Arc::new(profile);

        let master = match profile.master() {
            Some(master_iface) => match self.device(master_iface) {
                Some(master) if !master.is_master() => {
                    return Err(DeviceError::NotAMaster {
                        iface: master_iface.to_string(),
                    })
                }
                Some(master) if is_master_ready(&master) => Some(master),
                master => {
                    info!(device = %iface, master = %master_iface, "master not ready, queueing slave");
                    self.pending.lock().add(
                        profile.clone(),
                        [Constraint::MasterReady(master_iface.to_string())],
                    );
                    if let Some(master) = master {
                        self.notify(&master);
                    }
                    return Ok(ActivationOutcome::Queued);
                }
            },
            None => None,
        };

        let device = match self.device(&iface) {
            Some(device) => device,
            None if class
                .generic_capabilities()
                .contains(DeviceCapabilities::IS_SOFTWARE) =>
            {
                self.devices
                    .entry(iface.clone())
                    .or_insert_with(|| {
                        let device = Device::new(&iface, class.clone());
                        device.set_state(DeviceState::Disconnected, StateReason::NowManaged);
                        device
                    })
                    .clone()
            }
            None => return Err(DeviceError::not_found(&iface)),
        };

        device
            .class()
            .check_connection_compatible(&device, &profile)?;

        if !device.is_running()
            && matches!(
                device.state(),
                DeviceState::Activated | DeviceState::IpConfig
            )
        {
            info!(device = %iface, "device is active, deactivating before reactivation");
            self.deactivate_device(&device, StateReason::UserRequested)
                .await;
        }

        if let Err(e) = device.try_begin_activation(profile.clone()) {
            if matches!(e, DeviceError::Busy { .. }) {
                info!(device = %iface, "device busy, queueing activation");
                self.pending
                    .lock()
                    .add(profile.clone(), [Constraint::DeviceIdle(iface.clone())]);
                self.notify(&device);
            }
            return Err(e);
        }
        self.pending.lock().remove(profile.uuid());

        if device.is_software() && !device.is_realized() {
            match device
                .class()
                .create_and_realize(self.platform.as_ref(), &device, &profile)
                .await
            {
                Ok(link) => device.realize(link.ifindex, link.physical_port_id),
                Err(e) => {
                    warn!(device = %iface, error = %e, "failed to realize device");
                    device.advance(DeviceState::Prepare, DeviceState::Failed, e.reason());
                    device.finish_run();
                    self.notify(&device);
                    return Err(e);
                }
            }
        }

        let attempt = ActivationAttempt::new(device, profile, master);
        Ok(self.run_attempt(attempt).await)
    }

    async fn run_attempt(&self, mut attempt: ActivationAttempt) -> ActivationOutcome {
        let device = attempt.device().clone();
        let outcome = attempt.run(self.platform.as_ref()).await;

        if !self.is_managed(&device) {
            debug!(device = %device.iface(), outcome = ?outcome, "device forgotten during activation");
            return outcome;
        }

        match outcome {
            ActivationOutcome::Postponed => {
                debug!(device = %device.iface(), stage = ?attempt.stage(), "activation postponed");
                self.postponed
                    .lock()
                    .insert(device.iface().to_string(), attempt);
            }
            ActivationOutcome::Cancelled => {
                info!(device = %device.iface(), "activation cancelled");
                self.teardown(&device).await;
            }
            ActivationOutcome::Failed(reason) => {
                warn!(device = %device.iface(), reason = %reason, "activation failed");
            }
            _ => {}
        }

        self.notify(&device);
        outcome
    }

    /// Re-runs every postponed attempt whose device is still waiting.
    pub async fn retry_postponed(&self) -> Vec<(String, ActivationOutcome)> {
        let attempts: Vec<ActivationAttempt> =
            self.postponed.lock().drain().map(|(_, a)| a).collect();
        let mut results = Vec::new();

        for attempt in attempts {
            let device = attempt.device().clone();
            if !device.resume_activation() {
                debug!(device = %device.iface(), "dropping stale postponed attempt");
                continue;
            }
            let outcome = self.run_attempt(attempt).await;
            results.push((device.iface().to_string(), outcome));
        }
        results
    }

    /// Removes and returns queued requests whose constraints are satisfied.
    pub fn take_ready_activations(&self) -> Vec<Arc<ConnectionProfile>> {
        self.pending.lock().drain_ready()
    }

    /// Deactivates a device.
    ///
    /// An idle device is torn down before this returns. An in-flight attempt
    /// is marked `Deactivating` and finishes the teardown at its next stage
    /// boundary.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, iface: &str) -> DeviceResult<()> {
        let device = self.require_device(iface)?;
        self.deactivate_device(&device, StateReason::UserRequested)
            .await;
        Ok(())
    }

    async fn deactivate_device(&self, device: &Arc<Device>, reason: StateReason) -> DeactivationRequest {
        let request = device.request_deactivation(reason);
        match request {
            DeactivationRequest::Immediate => {
                self.postponed.lock().remove(device.iface());
                self.teardown(device).await;
            }
            DeactivationRequest::Deferred => {
                info!(device = %device.iface(), "deactivation deferred to next stage boundary");
            }
            DeactivationRequest::Idle => {}
        }
        request
    }

    /// Releases slaves, detaches from the master, takes the link down and
    /// returns the device to `Disconnected`.
    async fn teardown(&self, device: &Arc<Device>) {
        let platform = self.platform.as_ref();
        let reason = device.state_reason();

        if device.is_master() {
            for slave in device.slaves() {
                let result = {
                    let _guard = device.lock_slave_ops().await;
                    device
                        .class()
                        .release_slave(platform, device, &slave, true)
                        .await
                };
                if let Err(e) = result {
                    warn!(master = %device.iface(), slave = %slave.iface(), error = %e, "failed to release slave");
                }
                if slave.request_deactivation(StateReason::DependencyFailed)
                    == DeactivationRequest::Immediate
                {
                    self.postponed.lock().remove(slave.iface());
                    slave.set_ip_config(None);
                    slave.set_state(DeviceState::Disconnected, StateReason::DependencyFailed);
                    self.notify(&slave);
                }
            }
        }

        if let Some(master) = device.master() {
            let result = {
                let _guard = master.lock_slave_ops().await;
                master
                    .class()
                    .release_slave(platform, &master, device, true)
                    .await
            };
            if let Err(e) = result {
                warn!(master = %master.iface(), slave = %device.iface(), error = %e, "failed to detach from master");
            }
        }

        if device.is_realized() {
            if let Err(e) = device.take_down(platform).await {
                warn!(device = %device.iface(), error = %e, "failed to take link down");
            }
        }

        device.set_ip_config(None);
        device.set_state(DeviceState::Disconnected, reason);
        self.notify(device);
    }

    /// Tears the device down, deletes its kernel link if it is a software
    /// link, and forgets it.
    #[instrument(skip(self))]
    pub async fn remove(&self, iface: &str) -> DeviceResult<()> {
        let device = self.require_device(iface)?;
        if self.deactivate_device(&device, StateReason::Removed).await
            == DeactivationRequest::Deferred
        {
            return Err(DeviceError::Busy {
                iface: iface.to_string(),
                state: device.state().to_string(),
            });
        }

        if device.is_software() {
            if let Some(ifindex) = device.ifindex() {
                self.platform.link_delete(ifindex).await?;
            }
        }

        self.forget(&device);
        info!(device = %iface, "device removed");
        Ok(())
    }

    /// Handles a kernel link disappearing. Returns the name of the device
    /// that was bound to it.
    pub async fn link_removed(&self, ifindex: i32) -> Option<String> {
        let device = self.device_by_ifindex(ifindex)?;
        let platform = self.platform.as_ref();
        info!(device = %device.iface(), ifindex, "kernel link removed");

        if let Some(master) = device.master() {
            let _guard = master.lock_slave_ops().await;
            if let Err(e) = master
                .class()
                .release_slave(platform, &master, &device, false)
                .await
            {
                debug!(master = %master.iface(), error = %e, "failed to record release");
            }
        }
        if device.is_master() {
            for slave in device.slaves() {
                let _guard = device.lock_slave_ops().await;
                if let Err(e) = device
                    .class()
                    .release_slave(platform, &device, &slave, false)
                    .await
                {
                    debug!(master = %device.iface(), error = %e, "failed to record release");
                }
            }
        }

        device.request_deactivation(StateReason::Removed);
        self.forget(&device);
        Some(device.iface().to_string())
    }

    /// True while `device` is the registered instance for its interface.
    fn is_managed(&self, device: &Arc<Device>) -> bool {
        device.state() != DeviceState::Unmanaged
            && self
                .devices
                .get(device.iface())
                .is_some_and(|d| Arc::ptr_eq(d.value(), device))
    }

    fn forget(&self, device: &Arc<Device>) {
        self.postponed.lock().remove(device.iface());
        self.pending.lock().remove_for_interface(device.iface());
        device.unrealize();
        device.set_state(DeviceState::Unmanaged, StateReason::Removed);
        self.devices.remove(device.iface());
        self.notify(device);
    }

    /// Commits an IP configuration delivered by the autoconfig collaborator.
    #[instrument(skip(self, config))]
    pub async fn ip_config_completed(&self, iface: &str, mut config: IpConfig) -> DeviceResult<()> {
        let device = self.require_device(iface)?;
        let wrong_state = || DeviceError::WrongState {
            iface: iface.to_string(),
            operation: "commit IP configuration to".to_string(),
            state: device.state().to_string(),
        };
        if device.state() != DeviceState::IpConfig {
            return Err(wrong_state());
        }
        let profile = device.applied_profile().ok_or_else(wrong_state)?;

        device
            .class()
            .ip_config_pre_commit(&device, &profile, &mut config);
        device.set_ip_config(Some(config));

        if !device.advance(
            DeviceState::IpConfig,
            DeviceState::Activated,
            StateReason::None,
        ) {
            device.set_ip_config(None);
            return Err(wrong_state());
        }
        self.notify(&device);
        Ok(())
    }

    /// Fails a device waiting for IP configuration.
    #[instrument(skip(self))]
    pub async fn ip_config_failed(&self, iface: &str) -> DeviceResult<()> {
        let device = self.require_device(iface)?;
        if !device.advance(
            DeviceState::IpConfig,
            DeviceState::Failed,
            StateReason::IpConfigUnavailable,
        ) {
            return Err(DeviceError::WrongState {
                iface: iface.to_string(),
                operation: "fail IP configuration of".to_string(),
                state: device.state().to_string(),
            });
        }
        self.notify(&device);
        Ok(())
    }

    /// Compares the applied profile with the kernel and re-runs the config
    /// stage when they differ.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, iface: &str) -> DeviceResult<ReconcileReport> {
        let device = self.require_device(iface)?;
        let state = device.state();
        let applied = match device.applied_profile() {
            Some(applied)
                if !device.is_running()
                    && matches!(state, DeviceState::Activated | DeviceState::IpConfig) =>
            {
                applied
            }
            _ => {
                return Err(DeviceError::WrongState {
                    iface: iface.to_string(),
                    operation: "reconcile".to_string(),
                    state: state.to_string(),
                })
            }
        };

        let drifted = device
            .class()
            .detect_drift(self.platform.as_ref(), &device, &applied)
            .await?;
        let mut report = ReconcileReport {
            iface: iface.to_string(),
            drifted,
            result: None,
            diagnostics: Diagnostics::new(),
        };
        if report.in_sync() {
            debug!(device = %iface, "kernel state in sync");
            return Ok(report);
        }

        info!(device = %iface, drifted = ?report.drifted, "kernel state drifted, re-applying link configuration");
        let ctx = StageContext {
            platform: self.platform.as_ref(),
            device: &device,
            profile: &applied,
        };
        let result = device
            .class()
            .act_stage2_config(&ctx, &mut report.diagnostics)
            .await;
        if let ActStageReturn::Failure(reason) = result {
            warn!(device = %iface, reason = %reason, "re-applying link configuration failed");
        }
        report.result = Some(result);
        Ok(report)
    }

    /// Reconciles every activated device.
    pub async fn reconcile_all(&self) -> Vec<ReconcileReport> {
        let mut reports = Vec::new();
        for device in self.devices() {
            if device.state() != DeviceState::Activated || device.is_running() {
                continue;
            }
            match self.reconcile(device.iface()).await {
                Ok(report) => reports.push(report),
                Err(e) => debug!(device = %device.iface(), error = %e, "reconcile skipped"),
            }
        }
        reports
    }

    /// Returns a read-only view of one device, including the profile derived
    /// from the kernel.
    pub async fn snapshot(&self, iface: &str) -> DeviceResult<DeviceSnapshot> {
        let device = self.require_device(iface)?;
        let applied = device.applied_profile();

        let reconciled = match &applied {
            Some(profile) if device.is_realized() => match device
                .class()
                .update_connection(self.platform.as_ref(), &device, profile)
                .await
            {
                Ok(profile) => Some(profile),
                Err(e) => {
                    warn!(device = %iface, error = %e, "failed to read running configuration");
                    None
                }
            },
            _ => None,
        };

        Ok(DeviceSnapshot {
            iface: device.iface().to_string(),
            ifindex: device.ifindex(),
            device_type: device.class().type_description().to_string(),
            link_type: device.link_type(),
            state: device.state(),
            state_reason: device.state_reason(),
            capabilities: device.capabilities(),
            master: device.master().map(|m| m.iface().to_string()),
            slaves: device
                .slaves()
                .iter()
                .map(|s| s.iface().to_string())
                .collect(),
            applied: applied.map(|p| p.as_ref().clone()),
            reconciled,
            ip_config: device.ip_config(),
            diagnostics: device.diagnostics(),
            last_state_change: device.last_state_change(),
        })
    }

    /// Returns snapshots of all devices.
    pub async fn snapshot_all(&self) -> Vec<DeviceSnapshot> {
        let mut snapshots = Vec::new();
        for device in self.devices() {
            if let Ok(snapshot) = self.snapshot(device.iface()).await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    fn notify(&self, device: &Device) {
        let state = device.state();
        let mut pending = self.pending.lock();

        let idle = !device.is_running()
            && (state.can_activate()
                || matches!(state, DeviceState::Activated | DeviceState::IpConfig));
        if idle {
            pending.satisfy(&Constraint::DeviceIdle(device.iface().to_string()));
        }
        if is_master_ready(device) {
            pending.satisfy(&Constraint::MasterReady(device.iface().to_string()));
        }
    }
}

fn is_master_ready(device: &Device) -> bool {
    device.is_master()
        && !device.is_running()
        && matches!(
            device.state(),
            DeviceState::IpConfig | DeviceState::Activated
        )
}
