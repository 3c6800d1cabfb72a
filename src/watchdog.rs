//! Periodic health supervision
//!
//! Each pass runs under the mutation lock and goes, in order, through:
//! the loaded ruleset, management access, the gateway's services, the
//! client-side address, the default route and the VPN session. The mode
//! is read back from the kernel at the start of every pass, so changes an
//! operator made in between are followed rather than undone. While an
//! emergency allow-all is loaded only services and management access are
//! looked after. Every
//! recovery draws from a per-key budget in the state store, so a broken
//! component is retried a bounded number of times per day and then left
//! for the operator.

use crate::config::Config;
use crate::connectivity::{ConnectivityResolver, ResolverSettings, candidates};
use crate::firewall::compose::base_rules;
use crate::firewall::{CaptiveDns, Layout, Posture};
use crate::gateway::sync_dns_redirect;
use crate::lock::{LockError, MutationLock};
use crate::mode::{ModeController, Reconciled};
use crate::ports::{LinkControl, LinkProbe, PacketFilter, Ports, ServiceSupervisor, VpnClient};
use crate::shutdown::Shutdown;
use crate::state::{StateStore, now_epoch, today};
use crate::types::{NetworkMode, Service, UpstreamLink};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub const CLIENT_ADDRESS_KEY: &str = "client-address";
pub const UPSTREAM_KEY: &str = "upstream";
pub const VPN_KEY: &str = "vpn";

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub interval: Duration,
    pub lock_timeout: Duration,
    pub recovery_cap: u32,
    pub client_iface: String,
    pub portal_address: Ipv4Addr,
    pub client_prefix: u8,
    pub candidates: Vec<UpstreamLink>,
    pub servers: Vec<String>,
}

impl From<&Config> for SupervisorSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.watchdog.interval(),
            lock_timeout: config.watchdog.lock_timeout(),
            recovery_cap: config.watchdog.recovery_cap,
            client_iface: config.network.client_iface.clone(),
            portal_address: config.network.portal_address,
            client_prefix: config.network.client_prefix,
            candidates: candidates(config),
            servers: config.vpn.servers.clone(),
        }
    }
}

/// What one pass found and did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub mode: NetworkMode,
    pub drift_repaired: bool,
    /// Emergency allow-all was loaded; modes were left alone
    pub emergency: bool,
    pub management_restored: usize,
    pub recovered: Vec<String>,
    pub failed: Vec<String>,
    /// Keys whose budget was already spent; nothing was attempted
    pub exhausted: Vec<String>,
    pub route_changed: bool,
}

impl PassReport {
    fn new(mode: NetworkMode) -> Self {
        Self {
            mode,
            drift_repaired: false,
            emergency: false,
            management_restored: 0,
            recovered: Vec::new(),
            failed: Vec::new(),
            exhausted: Vec::new(),
            route_changed: false,
        }
    }

    pub fn is_quiet(&self) -> bool {
        !self.drift_repaired
            && self.management_restored == 0
            && self.recovered.is_empty()
            && self.failed.is_empty()
            && self.exhausted.is_empty()
            && !self.route_changed
    }
}

pub struct HealthSupervisor<F, S, L, V> {
    ports: Ports<F, S, L, V>,
    controller: ModeController<F>,
    resolver: ConnectivityResolver<L, V>,
    store: StateStore,
    lock: MutationLock,
    dns: CaptiveDns,
    vpn_interface: String,
    settings: SupervisorSettings,
}

impl<F, S, L, V> HealthSupervisor<F, S, L, V>
where
    F: PacketFilter,
    S: ServiceSupervisor,
    L: LinkProbe + LinkControl,
    V: VpnClient,
{
    pub fn new(ports: Ports<F, S, L, V>, config: &Config) -> Self {
        let store = StateStore::new(&config.paths.state_file, config.watchdog.counter_reset);
        let controller = ModeController::new(
            ports.filter.clone(),
            Layout::from(&config.network),
            config.vpn.loss_policy,
            store.clone(),
        );
        let resolver = ConnectivityResolver::new(
            ports.links.clone(),
            ports.vpn.clone(),
            store.clone(),
            ResolverSettings::from(config),
        );
        Self {
            ports,
            controller,
            resolver,
            store,
            lock: MutationLock::new(&config.paths.lock_file),
            dns: CaptiveDns::new(&config.paths.dns_redirect_file, config.network.portal_address),
            vpn_interface: config.vpn.interface.clone(),
            settings: SupervisorSettings::from(config),
        }
    }

    pub fn mode(&self) -> NetworkMode {
        self.controller.mode()
    }

    /// Read the loaded ruleset back and line the held mode up with it
    async fn reconcile(&mut self) -> Option<Reconciled> {
        let upstream = self.ports.links.default_route_interface().await;
        let tunnel = match self.ports.vpn.status().await {
            Ok(status) => status.interface.unwrap_or_else(|| self.vpn_interface.clone()),
            Err(_) => self.vpn_interface.clone(),
        };
        match self.controller.reconcile(upstream.as_deref(), &tunnel).await {
            Ok(live) => Some(live),
            Err(e) => {
                error!("Could not reconcile loaded ruleset: {}", e);
                None
            }
        }
    }

    /// Run passes on the configured cadence until `shutdown` fires
    pub async fn run(&mut self, mut shutdown: Shutdown) {
        info!("Watchdog running every {}s", self.settings.interval.as_secs());
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.run_pass().await {
                    Ok(report) if report.is_quiet() => debug!("Watchdog pass: healthy"),
                    Ok(report) => info!("Watchdog pass: {:?}", report),
                    Err(e) => warn!("Watchdog pass skipped: {}", e),
                },
                _ = shutdown.wait() => {
                    info!("Watchdog stopping");
                    break;
                }
            }
        }
    }

    /// One supervision pass. Only a busy lock aborts it; every other
    /// failure is logged and the pass moves on.
    pub async fn run_pass(&mut self) -> Result<PassReport, LockError> {
        let _guard = match self.lock.acquire(self.settings.lock_timeout).await {
            Ok(guard) => guard,
            Err(e) => {
                self.stamp_liveness(None);
                return Err(e);
            }
        };

        let today = today();
        let live = self.reconcile().await;
        let start_mode = self.controller.mode();
        let mut report = PassReport::new(start_mode);
        report.drift_repaired = live == Some(Reconciled::Repaired);
        report.emergency = live == Some(Reconciled::Open);

        let base = base_rules(self.controller.layout());
        match self.ports.filter.ensure_rules(&base).await {
            Ok(0) => {}
            Ok(n) => {
                warn!("Restored {} missing management rule(s)", n);
                report.management_restored = n;
            }
            Err(e) => error!("Could not verify management rules: {}", e),
        }

        for service in Service::ALL {
            if self.ports.services.is_active(service).await {
                continue;
            }
            warn!("Service {} is down", service);
            if let Some(attempt) = self.budget(&mut report, service.key(), &today) {
                let ok = self.restore_service(service, attempt).await;
                self.settle(&mut report, service.key(), ok);
            }
        }

        if !self.ports.links.has_address(&self.settings.client_iface).await {
            warn!("{} lost its address", self.settings.client_iface);
            if let Some(attempt) = self.budget(&mut report, CLIENT_ADDRESS_KEY, &today) {
                let ok = self.restore_client_address(attempt).await;
                self.settle(&mut report, CLIENT_ADDRESS_KEY, ok);
            }
        }

        if live.is_none() || report.emergency {
            if report.emergency {
                info!("Emergency allow-all loaded, leaving network modes alone");
            }
            let route = self.ports.links.default_route_interface().await;
            self.stamp_liveness(Some(route));
            return Ok(report);
        }

        let route = self.supervise_upstream(&mut report, &today).await;

        match self.controller.mode() {
            NetworkMode::Vpn => self.supervise_vpn(&mut report, route.as_deref(), &today).await,
            NetworkMode::Internet => self.follow_route(route.as_deref()).await,
            NetworkMode::Captive => {}
        }

        report.mode = self.controller.mode();
        if report.mode != start_mode || report.drift_repaired {
            sync_dns_redirect(&self.dns, self.ports.services.as_ref(), report.mode).await;
        }

        self.stamp_liveness(Some(route));
        Ok(report)
    }

    fn budget(&self, report: &mut PassReport, key: &str, today: &str) -> Option<u32> {
        match self
            .store
            .try_consume(key, self.settings.recovery_cap, today)
        {
            Ok(Some(attempt)) => {
                info!(key, attempt, "Attempting recovery");
                Some(attempt)
            }
            Ok(None) => {
                warn!(key, "Recovery budget spent, leaving it for the operator");
                report.exhausted.push(key.to_string());
                None
            }
            Err(e) => {
                error!("Could not update recovery counter for {}: {}", key, e);
                None
            }
        }
    }

    fn settle(&self, report: &mut PassReport, key: &str, ok: bool) {
        if ok {
            info!(key, "Recovered");
            report.recovered.push(key.to_string());
            if let Err(e) = self.store.reset_counter(key) {
                warn!("Could not clear recovery counter for {}: {}", key, e);
            }
        } else {
            warn!(key, "Recovery attempt failed");
            report.failed.push(key.to_string());
        }
    }

    async fn restore_service(&self, service: Service, attempt: u32) -> bool {
        if let Err(e) = self.ports.services.restart(service).await {
            warn!("Restart of {} failed: {}", service, e);
        }
        // Second time round the access point also gets its address back
        if service == Service::AccessPoint && attempt >= 2 {
            self.assign_client_address().await;
        }
        self.ports.services.is_active(service).await
    }

    async fn restore_client_address(&self, attempt: u32) -> bool {
        if attempt >= 2 {
            if let Err(e) = self.ports.services.restart(Service::AccessPoint).await {
                warn!("Restart of {} failed: {}", Service::AccessPoint, e);
            }
        }
        self.assign_client_address().await;
        self.ports.links.has_address(&self.settings.client_iface).await
    }

    async fn assign_client_address(&self) {
        let result = self
            .ports
            .links
            .assign_address(
                &self.settings.client_iface,
                self.settings.portal_address,
                self.settings.client_prefix,
            )
            .await;
        if let Err(e) = result {
            warn!("Could not assign {}: {}", self.settings.portal_address, e);
        }
    }

    /// Current default-route interface, re-acquiring an upstream when one
    /// was established before and is gone now
    async fn supervise_upstream(&mut self, report: &mut PassReport, today: &str) -> Option<String> {
        let state = self.store.load_or_default();
        let previous = state.last_default_route;
        let mut route = self.ports.links.default_route_interface().await;

        let established = previous.is_some() || state.last_upstream_kind.is_some();
        if route.is_none() && established {
            warn!("Default route is gone");
            if self.budget(report, UPSTREAM_KEY, today).is_some() {
                match self
                    .resolver
                    .acquire_upstream(&self.settings.candidates, None)
                    .await
                {
                    Ok(link) => {
                        self.settle(report, UPSTREAM_KEY, true);
                        route = self
                            .ports
                            .links
                            .default_route_interface()
                            .await
                            .or(Some(link.iface));
                    }
                    Err(e) => {
                        warn!("{}", e);
                        self.settle(report, UPSTREAM_KEY, false);
                    }
                }
            }
        }

        if previous.is_some() && route != previous {
            info!(
                "Default route moved from {} to {}",
                previous.as_deref().unwrap_or("none"),
                route.as_deref().unwrap_or("none")
            );
            report.route_changed = true;
        }
        route
    }

    /// Keep VPN mode honest: a changed route or a dead session means a
    /// fresh acquisition, and failing that, the loss policy
    async fn supervise_vpn(&mut self, report: &mut PassReport, route: Option<&str>, today: &str) {
        let session = self.resolver.check_vpn(route).await;
        let bound_elsewhere = self.controller.posture().upstream() != route;
        let lost = match session {
            Ok(session) if !report.route_changed && !bound_elsewhere => {
                debug!("VPN healthy via {}", session.interface);
                return;
            }
            Ok(_) => None,
            Err(lost) => {
                warn!("VPN session lost: {}", lost.reason());
                Some(lost)
            }
        };

        let Some(upstream) = route else {
            let lost = lost.unwrap_or_else(|| self.resolver.vpn_lost(None, "no upstream"));
            self.fall_back(lost).await;
            return;
        };

        if self.budget(report, VPN_KEY, today).is_none() {
            let lost = lost.unwrap_or_else(|| {
                self.resolver
                    .vpn_lost(Some(upstream), "VPN recovery budget spent")
            });
            self.fall_back(lost).await;
            return;
        }

        info!("Re-establishing VPN over {}", upstream);
        match self.resolver.acquire_vpn(&self.settings.servers).await {
            Ok(session) => {
                self.settle(report, VPN_KEY, true);
                if let Err(e) = self.controller.transition_vpn(upstream, &session).await {
                    error!("Could not re-apply VPN ruleset: {}", e);
                }
            }
            Err(e) => {
                self.settle(report, VPN_KEY, false);
                let lost = self.resolver.vpn_lost(Some(upstream), &e.to_string());
                self.fall_back(lost).await;
            }
        }
    }

    async fn fall_back(&mut self, lost: crate::connectivity::VpnLost) {
        if let Err(e) = self.controller.on_vpn_lost(lost).await {
            error!("Could not leave VPN mode: {}", e);
        }
    }

    /// Re-bind INTERNET mode to whichever interface now carries the route
    async fn follow_route(&mut self, route: Option<&str>) {
        let Some(route) = route else {
            warn!("INTERNET mode has no upstream right now");
            return;
        };
        if self.controller.posture().upstream() == Some(route) {
            return;
        }
        let target = Posture::Internet {
            upstream: route.to_string(),
        };
        if let Err(e) = self.controller.transition(target).await {
            error!("Could not re-bind INTERNET mode to {}: {}", route, e);
        }
    }

    fn stamp_liveness(&self, route: Option<Option<String>>) {
        let result = self.store.update(|state| {
            state.last_watchdog_success_epoch = Some(now_epoch());
            if let Some(route) = route {
                state.last_default_route = route;
            }
        });
        if let Err(e) = result {
            warn!("Could not record watchdog liveness: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{AppliedPosture, Protocol, compose};
    use crate::gateway::Gateway;
    use crate::recovery::EmergencyOverride;
    use crate::testing::{FakePorts, fake_ports, test_config};
    use crate::testing::{FakeFilter, FakeLinks, FakeServices, FakeVpn};
    use crate::types::VpnLossPolicy;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: Config,
        ports: FakePorts,
        store: StateStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let ports = fake_ports();
        ports.links.address("wlan1");
        let store = StateStore::new(&config.paths.state_file, config.watchdog.counter_reset);
        Fixture {
            _dir: dir,
            config,
            ports,
            store,
        }
    }

    impl Fixture {
        fn supervisor(&self) -> HealthSupervisor<FakeFilter, FakeServices, FakeLinks, FakeVpn> {
            HealthSupervisor::new(self.ports.clone(), &self.config)
        }

        /// Kernel and state as a previous process left them in VPN mode
        fn leave_in_vpn(&self, upstream: &str) {
            self.ports.links.connect(upstream);
            self.ports.vpn.set_connected(true);
            let layout = Layout::from(&self.config.network);
            self.ports.filter.install(Some(compose(
                &layout,
                &Posture::Vpn {
                    upstream: upstream.to_string(),
                    tunnel: "nordlynx".to_string(),
                },
            )));
            self.store
                .update(|s| s.last_default_route = Some(upstream.to_string()))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_healthy_pass_is_quiet_and_stamps_liveness() {
        let f = fixture();
        let mut supervisor = f.supervisor();
        f.ports
            .filter
            .install(Some(compose(&Layout::from(&f.config.network), &Posture::Captive)));

        let report = supervisor.run_pass().await.unwrap();
        assert!(report.is_quiet(), "{report:?}");
        assert!(f.store.load().unwrap().last_watchdog_success_epoch.is_some());
    }

    #[tokio::test]
    async fn test_flushed_ruleset_and_management_are_restored() {
        let f = fixture();
        let mut supervisor = f.supervisor();
        let report = supervisor.run_pass().await.unwrap();
        assert!(report.drift_repaired);

        let current = f.ports.filter.current().unwrap();
        assert_eq!(current.posture(), AppliedPosture::Mode(NetworkMode::Captive));
        assert!(current.admits_input("eth0", Protocol::Tcp, 22));
    }

    #[tokio::test]
    async fn test_service_recovery_is_capped() {
        let f = fixture();
        f.ports.services.set_stuck(Service::Portal);
        let mut supervisor = f.supervisor();

        for _ in 0..f.config.watchdog.recovery_cap {
            let report = supervisor.run_pass().await.unwrap();
            assert_eq!(report.failed, vec!["portal".to_string()]);
        }
        let report = supervisor.run_pass().await.unwrap();
        assert_eq!(report.exhausted, vec!["portal".to_string()]);
        assert_eq!(
            f.ports.services.starts(Service::Portal),
            f.config.watchdog.recovery_cap as usize
        );
    }

    #[tokio::test]
    async fn test_successful_recovery_clears_budget() {
        let f = fixture();
        f.ports.services.set_down(Service::DhcpDns);
        let mut supervisor = f.supervisor();
        let report = supervisor.run_pass().await.unwrap();
        assert_eq!(report.recovered, vec!["dhcp-dns".to_string()]);
        assert_eq!(f.store.attempts_used("dhcp-dns", &today()), 0);
    }

    #[tokio::test]
    async fn test_client_address_escalates_to_ap_restart() {
        let f = fixture();
        let mut supervisor = f.supervisor();

        f.ports.links.unaddress("wlan1");
        supervisor.run_pass().await.unwrap();
        assert_eq!(f.ports.services.starts(Service::AccessPoint), 0);

        // Counter was cleared by the success, so simulate a second loss
        // on the same day with a budget already partly used
        f.store.try_consume(CLIENT_ADDRESS_KEY, 5, &today()).unwrap();
        f.ports.links.unaddress("wlan1");
        supervisor.run_pass().await.unwrap();
        assert_eq!(f.ports.services.starts(Service::AccessPoint), 1);
    }

    #[tokio::test]
    async fn test_boot_without_upstream_stays_captive() {
        let f = fixture();
        let mut supervisor = f.supervisor();
        let report = supervisor.run_pass().await.unwrap();
        assert_eq!(report.mode, NetworkMode::Captive);
        // Nothing was ever established, so no upstream recovery either
        assert!(f.ports.links.actions().is_empty());
    }

    #[tokio::test]
    async fn test_captive_stays_captive_when_upstream_appears() {
        let f = fixture();
        let mut supervisor = f.supervisor();
        supervisor.run_pass().await.unwrap();
        f.ports.links.connect("eth0");
        let report = supervisor.run_pass().await.unwrap();
        assert_eq!(report.mode, NetworkMode::Captive);
        assert!(!f.ports.filter.forwarding());
    }

    #[tokio::test]
    async fn test_route_change_in_vpn_reacquires_and_keeps_kill_switch() {
        let f = fixture();
        f.leave_in_vpn("eth0");
        f.ports.vpn.succeed_on("auto", 1);
        let mut supervisor = f.supervisor();

        f.ports.links.drop_link("eth0");
        f.ports.links.connect("wlan0");
        let report = supervisor.run_pass().await.unwrap();

        assert!(report.route_changed);
        assert_eq!(report.mode, NetworkMode::Vpn);
        assert_eq!(f.ports.vpn.attempts(), vec!["auto".to_string()]);
        for ruleset in f.ports.filter.history() {
            assert!(!ruleset.permits_forward("wlan1", "eth0"));
            assert!(!ruleset.permits_forward("wlan1", "wlan0"));
        }
        assert!(f.ports.filter.current().unwrap().permits_forward("wlan1", "nordlynx"));
    }

    #[tokio::test]
    async fn test_vpn_loss_without_recovery_falls_back_to_captive() {
        let f = fixture();
        f.leave_in_vpn("eth0");
        let mut supervisor = f.supervisor();

        f.ports.vpn.set_connected(false);
        let report = supervisor.run_pass().await.unwrap();
        assert_eq!(report.mode, NetworkMode::Captive);
        assert_eq!(report.failed, vec![VPN_KEY.to_string()]);
        assert!(!f.ports.filter.forwarding());
        assert_eq!(
            f.ports.filter.current().unwrap().posture(),
            AppliedPosture::Mode(NetworkMode::Captive)
        );
        // The captive DNS redirect is back in place
        assert!(f.config.paths.dns_redirect_file.exists());
    }

    #[tokio::test]
    async fn test_vpn_loss_with_internet_policy() {
        let mut f = fixture();
        f.config.vpn.loss_policy = VpnLossPolicy::Internet;
        f.leave_in_vpn("eth0");
        let mut supervisor = f.supervisor();

        f.ports.vpn.set_connected(false);
        let report = supervisor.run_pass().await.unwrap();
        assert_eq!(report.mode, NetworkMode::Internet);
        assert!(f.ports.filter.current().unwrap().permits_forward("wlan1", "eth0"));
    }

    #[tokio::test]
    async fn test_internet_mode_follows_new_route() {
        let f = fixture();
        f.ports.links.connect("eth0");
        let mut supervisor = f.supervisor();
        supervisor
            .controller
            .transition(Posture::Internet {
                upstream: "eth0".to_string(),
            })
            .await
            .unwrap();
        supervisor.run_pass().await.unwrap();

        f.ports.links.drop_link("eth0");
        f.ports.links.connect("wlan0");
        let report = supervisor.run_pass().await.unwrap();
        assert!(report.route_changed);
        assert!(f.ports.filter.current().unwrap().permits_forward("wlan1", "wlan0"));
    }

    #[tokio::test]
    async fn test_operator_mode_changes_are_followed() {
        let f = fixture();
        let mut supervisor = f.supervisor();
        supervisor.run_pass().await.unwrap();

        let mut gateway = Gateway::new(f.ports.clone(), &f.config);
        f.ports.links.connect("eth0");
        gateway.set_mode(NetworkMode::Internet).await.unwrap();
        let report = supervisor.run_pass().await.unwrap();
        assert_eq!(report.mode, NetworkMode::Internet);
        assert!(!report.drift_repaired);

        f.ports.vpn.succeed_on("auto", 1);
        gateway.connect_vpn(&Shutdown::never()).await.unwrap();
        let applied = f.ports.filter.history().len();
        let report = supervisor.run_pass().await.unwrap();

        assert_eq!(report.mode, NetworkMode::Vpn);
        assert!(!report.drift_repaired);
        assert_eq!(f.ports.filter.history().len(), applied);
        assert_eq!(
            f.ports.filter.current().unwrap().posture(),
            AppliedPosture::Mode(NetworkMode::Vpn)
        );
        assert_eq!(f.ports.vpn.attempts(), vec!["auto".to_string()]);
        assert!(!f.config.paths.dns_redirect_file.exists());
    }

    #[tokio::test]
    async fn test_emergency_allow_all_is_left_in_place() {
        let f = fixture();
        f.leave_in_vpn("eth0");
        let mut supervisor = f.supervisor();
        assert_eq!(supervisor.run_pass().await.unwrap().mode, NetworkMode::Vpn);

        EmergencyOverride::new(f.ports.clone(), &f.config)
            .vpn_off()
            .await
            .unwrap();
        f.ports.services.set_down(Service::Portal);
        let report = supervisor.run_pass().await.unwrap();

        assert!(report.emergency);
        assert!(report.failed.is_empty());
        assert_eq!(report.recovered, vec!["portal".to_string()]);
        assert_eq!(f.ports.filter.current().unwrap().posture(), AppliedPosture::Open);
        assert!(f.ports.vpn.attempts().is_empty());
        assert_eq!(f.store.attempts_used(VPN_KEY, &today()), 0);
    }

    #[tokio::test]
    async fn test_busy_lock_skips_pass_but_records_liveness() {
        let f = fixture();
        let mut supervisor = f.supervisor();
        let other = MutationLock::new(&f.config.paths.lock_file);
        let _held = other.try_acquire().unwrap().unwrap();

        let err = supervisor.run_pass().await.unwrap_err();
        assert!(matches!(err, LockError::Busy { .. }));
        assert!(f.store.load().unwrap().last_watchdog_success_epoch.is_some());
        assert!(f.ports.filter.history().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let mut supervisor = f.supervisor();
        let (trigger, shutdown) = Shutdown::channel();
        trigger.fire();
        tokio::time::timeout(Duration::from_secs(2), supervisor.run(shutdown))
            .await
            .unwrap();
    }
}
