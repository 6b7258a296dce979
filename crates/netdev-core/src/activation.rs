//! One activation attempt and its stage runner.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use netdev_platform::Platform;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::class::StageContext;
use crate::device::Device;
use crate::profile::{ConnectionProfile, IpMethod};
use crate::stage::{ActStageReturn, DiagnosticKind, Diagnostics};
use crate::state::{DeviceState, StateReason};

/// Stage an attempt resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationStage {
    /// Stage 1.
    Prepare,
    /// Stage 2, including slave attachment.
    Config,
    /// Waiting for the autoconfig collaborator.
    IpConfig,
}

/// Where an activation request ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationOutcome {
    /// Fully configured.
    Activated,
    /// Link layer done; waiting for an IP configuration.
    WaitingForIpConfig,
    /// A stage postponed; the attempt is kept for `retry_postponed`.
    Postponed,
    /// The request waits in the pending queue.
    Queued,
    /// The attempt failed.
    Failed(StateReason),
    /// A deactivation took over at a stage boundary.
    Cancelled,
}

/// Transient context of one try at activating a profile on a device.
#[derive(Debug)]
pub struct ActivationAttempt {
    device: Arc<Device>,
    profile: Arc<ConnectionProfile>,
    master: Option<Arc<Device>>,
    stage: ActivationStage,
    failure: Option<StateReason>,
    retry_eligible: bool,
    diagnostics: Diagnostics,
    started_at: DateTime<Utc>,
}

impl ActivationAttempt {
    /// Starts an attempt at stage 1. `master` is set for slave profiles.
    pub fn new(
        device: Arc<Device>,
        profile: Arc<ConnectionProfile>,
        master: Option<Arc<Device>>,
    ) -> Self {
        Self {
            device,
            profile,
            master,
            stage: ActivationStage::Prepare,
            failure: None,
            retry_eligible: false,
            diagnostics: Diagnostics::new(),
            started_at: Utc::now(),
        }
    }

    /// Returns the target device.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Returns the profile being applied.
    pub fn profile(&self) -> &Arc<ConnectionProfile> {
        &self.profile
    }

    /// Returns the stage the attempt is at.
    pub fn stage(&self) -> ActivationStage {
        self.stage
    }

    /// Returns the failure reason, once failed.
    pub fn failure(&self) -> Option<StateReason> {
        self.failure
    }

    /// Returns true if the attempt postponed and may be resumed.
    pub fn is_retry_eligible(&self) -> bool {
        self.retry_eligible
    }

    /// Returns the diagnostics collected so far.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Returns when the attempt started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Runs stages from the current one until the attempt completes, waits,
    /// postpones, fails or is cancelled.
    ///
    /// The caller must hold the device's running flag; it is released here.
    #[instrument(skip_all, fields(device = %self.device.iface(), connection = %self.profile.id()))]
    pub async fn run(&mut self, platform: &dyn Platform) -> ActivationOutcome {
        self.retry_eligible = false;
        let outcome = self.run_stages(platform).await;
        self.device.set_diagnostics(self.diagnostics.clone());
        self.device.finish_run();
        debug!(outcome = ?outcome, "activation run finished");
        outcome
    }

    async fn run_stages(&mut self, platform: &dyn Platform) -> ActivationOutcome {
        let device = self.device.clone();
        let profile = self.profile.clone();
        let class = device.class().clone();

        loop {
            if device.state() == DeviceState::Deactivating {
                return ActivationOutcome::Cancelled;
            }
            let ctx = StageContext {
                platform,
                device: &device,
                profile: &profile,
            };

            match self.stage {
                ActivationStage::Prepare => {
                    match class.act_stage1_prepare(&ctx, &mut self.diagnostics).await {
                        ActStageReturn::Success => {
                            if !device.advance(
                                DeviceState::Prepare,
                                DeviceState::Config,
                                StateReason::None,
                            ) {
                                return ActivationOutcome::Cancelled;
                            }
                            self.stage = ActivationStage::Config;
                        }
                        ActStageReturn::Postpone => {
                            self.retry_eligible = true;
                            return ActivationOutcome::Postponed;
                        }
                        ActStageReturn::Failure(reason) => {
                            return self.fail(DeviceState::Prepare, reason);
                        }
                    }
                }
                ActivationStage::Config => {
                    match class.act_stage2_config(&ctx, &mut self.diagnostics).await {
                        ActStageReturn::Success => {}
                        ActStageReturn::Postpone => {
                            self.retry_eligible = true;
                            return ActivationOutcome::Postponed;
                        }
                        ActStageReturn::Failure(reason) => {
                            return self.fail(DeviceState::Config, reason);
                        }
                    }

                    if let Some(master) = self.master.clone() {
                        if device.state() == DeviceState::Deactivating {
                            return ActivationOutcome::Cancelled;
                        }
                        if let Some(reason) = self.attach_to_master(platform, &master).await {
                            return self.fail(DeviceState::Config, reason);
                        }
                    }

                    let skip_ip = self.master.is_some() || profile.ip.method == IpMethod::Disabled;
                    if skip_ip {
                        if !device.advance(
                            DeviceState::Config,
                            DeviceState::Activated,
                            StateReason::None,
                        ) {
                            return ActivationOutcome::Cancelled;
                        }
                        return ActivationOutcome::Activated;
                    }

                    if !device.advance(DeviceState::Config, DeviceState::IpConfig, StateReason::None)
                    {
                        return ActivationOutcome::Cancelled;
                    }
                    self.stage = ActivationStage::IpConfig;
                    return ActivationOutcome::WaitingForIpConfig;
                }
                ActivationStage::IpConfig => return ActivationOutcome::WaitingForIpConfig,
            }
        }
    }

    async fn attach_to_master(
        &mut self,
        platform: &dyn Platform,
        master: &Arc<Device>,
    ) -> Option<StateReason> {
        let result = {
            let _guard = master.lock_slave_ops().await;
            master
                .class()
                .enslave_slave(platform, master, &self.device, Some(&self.profile), true)
                .await
        };
        if let Err(e) = result {
            self.diagnostics
                .push(DiagnosticKind::Warning, master.iface(), e.to_string());
            return Some(e.reason());
        }

        match master
            .class()
            .master_update_slave_connection(master, &self.profile)
        {
            Ok(stamped) => self.device.set_applied_profile(Some(Arc::new(stamped))),
            Err(e) => warn!(master = %master.iface(), error = %e, "failed to update slave connection"),
        }
        None
    }

    fn fail(&mut self, from: DeviceState, reason: StateReason) -> ActivationOutcome {
        self.failure = Some(reason);
        if !self.device.advance(from, DeviceState::Failed, reason) {
            return ActivationOutcome::Cancelled;
        }
        ActivationOutcome::Failed(reason)
    }
}
