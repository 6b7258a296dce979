//! Activation controller
//!
//! Owns the device manager and drives it: startup discovery, autoconnect of
//! configured profiles, periodic retry of postponed and queued activations,
//! and periodic reconciliation of activated devices against the kernel.

use std::future::Future;
use std::sync::Arc;

use netdev_bond::BondClass;
use netdev_core::{
    ActivationOutcome, ConnectionProfile, DeviceManager, DeviceResult, EthernetClass,
    ReconcileReport, ETHERNET_CONNECTION_TYPE,
};
use netdev_platform::{InMemoryPlatform, LinkType, LinuxPlatform, Platform};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::{NetdevdConfig, PlatformBackend};

/// Builds the kernel backend selected by the configuration.
///
/// `dry_run` forces the in-memory backend. The simulated kernel is seeded
/// with an Ethernet link for every Ethernet profile so autoconnect has
/// something to act on.
pub fn build_platform(config: &NetdevdConfig, dry_run: bool) -> Arc<dyn Platform> {
    let backend = if dry_run {
        PlatformBackend::Memory
    } else {
        config.platform.backend
    };

    match backend {
        PlatformBackend::Linux => {
            let platform = match &config.platform.sysfs_root {
                Some(root) => LinuxPlatform::with_sysfs_root(root),
                None => LinuxPlatform::new(),
            };
            Arc::new(platform)
        }
        PlatformBackend::Memory => {
            let platform = InMemoryPlatform::new();
            let mut seeded = 0;
            for profile in &config.profiles {
                if profile.connection_type() != ETHERNET_CONNECTION_TYPE {
                    continue;
                }
                if let Some(iface) = profile.interface_name() {
                    platform.add_link(iface, LinkType::Ethernet);
                    seeded += 1;
                }
            }
            info!(links = seeded, "using in-memory platform");
            Arc::new(platform)
        }
    }
}

/// Result of daemon startup
#[derive(Debug, Default)]
pub struct StartupReport {
    /// Devices taken under management by discovery
    pub discovered: Vec<String>,
    /// Autoconnect result per connection id, in activation order
    pub autoconnect: Vec<(String, DeviceResult<ActivationOutcome>)>,
}

/// Work done by one controller tick
#[derive(Debug, Default)]
pub struct TickReport {
    /// Postponed attempts re-run
    pub retried: usize,
    /// Queued requests re-submitted
    pub resubmitted: usize,
    /// Reconciliation reports, empty when no pass was due
    pub reconciled: Vec<ReconcileReport>,
}

impl TickReport {
    /// Returns true if the tick did nothing.
    pub fn is_idle(&self) -> bool {
        self.retried == 0 && self.resubmitted == 0 && self.reconciled.is_empty()
    }
}

/// The netdevd controller
pub struct NetdevDaemon {
    config: NetdevdConfig,
    manager: DeviceManager,
    last_reconcile: Instant,
}

impl NetdevDaemon {
    /// Creates a controller with the Ethernet and bond device classes
    /// registered.
    pub fn new(config: NetdevdConfig, platform: Arc<dyn Platform>) -> Self {
        let manager = DeviceManager::new(platform);
        manager.register_class(Arc::new(EthernetClass::new()));
        manager.register_class(Arc::new(BondClass::new()));

        Self {
            config,
            manager,
            last_reconcile: Instant::now(),
        }
    }

    /// The device manager being driven.
    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    /// The configuration in effect.
    pub fn config(&self) -> &NetdevdConfig {
        &self.config
    }

    /// Discovers existing links (if configured) and activates every
    /// autoconnect profile, masters before slaves.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> DeviceResult<StartupReport> {
        let mut report = StartupReport::default();

        if self.config.daemon.discover_existing {
            report.discovered = self.manager.discover().await?;
        }

        for profile in self.autoconnect_order() {
            let id = profile.id().to_string();
            let result = self.manager.activate(profile).await;
            match &result {
                Ok(outcome) => info!(connection = %id, outcome = ?outcome, "autoconnect"),
                Err(e) => warn!(connection = %id, error = %e, "autoconnect failed"),
            }
            report.autoconnect.push((id, result));
        }

        self.last_reconcile = Instant::now();
        Ok(report)
    }

    fn autoconnect_order(&self) -> Vec<ConnectionProfile> {
        let mut profiles: Vec<ConnectionProfile> = self
            .config
            .profiles
            .iter()
            .filter(|p| p.connection.autoconnect)
            .cloned()
            .collect();
        // Stable: masters keep their relative order, then slaves.
        profiles.sort_by_key(|p| p.is_slave());
        profiles
    }

    /// Runs one controller pass: retries postponed attempts, re-submits
    /// queued requests whose constraints are satisfied, and reconciles when
    /// the reconcile interval has elapsed.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        for (iface, outcome) in self.manager.retry_postponed().await {
            debug!(device = %iface, outcome = ?outcome, "retried postponed activation");
            report.retried += 1;
        }

        for profile in self.manager.take_ready_activations() {
            report.resubmitted += 1;
            let profile = profile.as_ref().clone();
            let id = profile.id().to_string();
            match self.manager.activate(profile).await {
                Ok(outcome) => info!(connection = %id, outcome = ?outcome, "queued activation ran"),
                Err(e) => warn!(connection = %id, error = %e, "queued activation failed"),
            }
        }

        if let Some(interval) = self.config.daemon.reconcile_interval() {
            if self.last_reconcile.elapsed() >= interval {
                report.reconciled = self.reconcile().await;
            }
        }

        report
    }

    /// Reconciles every activated device now.
    pub async fn reconcile(&mut self) -> Vec<ReconcileReport> {
        let reports = self.manager.reconcile_all().await;
        for report in reports.iter().filter(|r| !r.in_sync()) {
            warn!(device = %report.iface, drifted = ?report.drifted, result = ?report.result, "repaired kernel drift");
        }
        self.last_reconcile = Instant::now();
        reports
    }

    /// Ticks at the retry interval until `shutdown` completes.
    ///
    /// Devices are left configured on exit.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = time::interval(self.config.daemon.retry_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            retry_interval_ms = self.config.daemon.retry_interval_ms,
            reconcile_interval_secs = self.config.daemon.reconcile_interval_secs,
            "controller loop started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if !report.is_idle() {
                        debug!(
                            retried = report.retried,
                            resubmitted = report.resubmitted,
                            reconciled = report.reconciled.len(),
                            "controller tick"
                        );
                    }
                }
            }
        }
    }

    /// Snapshots of every managed device as pretty-printed JSON.
    pub async fn status_json(&self) -> serde_json::Result<String> {
        let snapshots = self.manager.snapshot_all().await;
        serde_json::to_string_pretty(&snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netdev_core::{DeviceState, IpMethod, BOND_CONNECTION_TYPE};
    use pretty_assertions::assert_eq;

    fn bond(iface: &str) -> ConnectionProfile {
        ConnectionProfile::new(iface, BOND_CONNECTION_TYPE)
            .with_interface_name(iface)
            .with_ip_method(IpMethod::Disabled)
            .with_bond_option("mode", "active-backup")
            .with_bond_option("primary", "eth0")
    }

    fn slave(iface: &str, master: &str) -> ConnectionProfile {
        ConnectionProfile::new(iface, ETHERNET_CONNECTION_TYPE)
            .with_interface_name(iface)
            .with_master(master, "bond")
    }

    fn config(profiles: Vec<ConnectionProfile>) -> NetdevdConfig {
        let mut config = NetdevdConfig::default();
        config.platform.backend = PlatformBackend::Memory;
        config.profiles = profiles;
        config
    }

    fn daemon_with(
        config: NetdevdConfig,
        nics: &[&str],
    ) -> (NetdevDaemon, Arc<InMemoryPlatform>) {
        let platform = Arc::new(InMemoryPlatform::new());
        for nic in nics {
            platform.add_link(nic, LinkType::Ethernet);
        }
        (NetdevDaemon::new(config, platform.clone()), platform)
    }

    #[tokio::test]
    async fn test_autoconnect_activates_masters_first() {
        let cfg = config(vec![slave("eth0", "bond0"), slave("eth1", "bond0"), bond("bond0")]);
        let (mut daemon, _platform) = daemon_with(cfg, &["eth0", "eth1"]);

        let report = daemon.start().await.unwrap();

        assert_eq!(report.discovered.len(), 2);
        let order: Vec<&str> = report.autoconnect.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["bond0", "eth0", "eth1"]);
        assert!(report
            .autoconnect
            .iter()
            .all(|(_, r)| matches!(r, Ok(ActivationOutcome::Activated))));

        let bond = daemon.manager().device("bond0").unwrap();
        assert_eq!(bond.state(), DeviceState::Activated);
        assert_eq!(bond.slaves().len(), 2);
    }

    #[tokio::test]
    async fn test_tick_runs_queued_slave_once_master_is_up() {
        let mut master = bond("bond0");
        master.connection.autoconnect = false;
        let cfg = config(vec![slave("eth0", "bond0"), master.clone()]);
        let (mut daemon, _platform) = daemon_with(cfg, &["eth0"]);

        let report = daemon.start().await.unwrap();
        assert!(matches!(
            report.autoconnect.as_slice(),
            [(_, Ok(ActivationOutcome::Queued))]
        ));

        daemon.manager().activate(master).await.unwrap();
        let tick = daemon.tick().await;

        assert_eq!(tick.resubmitted, 1);
        assert_eq!(
            daemon.manager().device("eth0").unwrap().state(),
            DeviceState::Activated
        );
        assert!(daemon.tick().await.is_idle());
    }

    #[tokio::test]
    async fn test_reconcile_repairs_drift() {
        let cfg = config(vec![bond("bond0")]);
        let (mut daemon, platform) = daemon_with(cfg, &[]);
        daemon.start().await.unwrap();
        let ifindex = daemon.manager().device("bond0").unwrap().ifindex().unwrap();

        platform.seed_attribute(ifindex, "primary", "eth3");
        let reports = daemon.reconcile().await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].drifted, vec!["primary".to_string()]);
        assert_eq!(platform.attribute(ifindex, "primary").as_deref(), Some("eth0"));
    }

    #[tokio::test]
    async fn test_tick_skips_reconcile_when_disabled() {
        let mut cfg = config(vec![bond("bond0")]);
        cfg.daemon.reconcile_interval_secs = 0;
        let (mut daemon, platform) = daemon_with(cfg, &[]);
        daemon.start().await.unwrap();
        let ifindex = daemon.manager().device("bond0").unwrap().ifindex().unwrap();

        platform.seed_attribute(ifindex, "primary", "eth3");
        let tick = daemon.tick().await;

        assert!(tick.reconciled.is_empty());
        assert_eq!(platform.attribute(ifindex, "primary").as_deref(), Some("eth3"));
    }

    #[tokio::test]
    async fn test_dry_run_seeds_ethernet_links() {
        let mut cfg = config(vec![bond("bond0"), slave("eth0", "bond0")]);
        cfg.platform.backend = PlatformBackend::Linux;

        let platform = build_platform(&cfg, true);
        let names: Vec<String> = platform
            .links()
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.name)
            .collect();

        assert_eq!(names, vec!["eth0".to_string()]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (mut daemon, _platform) = daemon_with(config(Vec::new()), &[]);
        daemon.run(async {}).await;
    }

    #[tokio::test]
    async fn test_status_json_lists_devices() {
        let cfg = config(vec![bond("bond0")]);
        let (mut daemon, _platform) = daemon_with(cfg, &[]);
        daemon.start().await.unwrap();

        let status: serde_json::Value =
            serde_json::from_str(&daemon.status_json().await.unwrap()).unwrap();

        assert_eq!(status[0]["iface"], "bond0");
        assert_eq!(status[0]["state"], "activated");
    }
}
