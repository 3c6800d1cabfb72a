//! Operator-driven flows
//!
//! Every flow here takes the mutation lock for its whole duration, reads
//! the loaded mode back from the kernel, asks the resolver for
//! connectivity and hands the result to the mode controller. Long waits race the shutdown signal; an interrupted flow
//! puts the gateway back in its last safe mode before returning.

use crate::config::Config;
use crate::connectivity::{ConnectivityResolver, ResolveError, ResolverSettings, candidates};
use crate::error::GatewayError;
use crate::firewall::{CaptiveDns, Layout, Posture};
use crate::lock::{LockGuard, MutationLock};
use crate::mode::ModeController;
use crate::ports::{LinkControl, LinkProbe, PacketFilter, Ports, ServiceSupervisor, VpnClient};
use crate::shutdown::Shutdown;
use crate::state::StateStore;
use crate::types::{NetworkMode, Service, UpstreamKind, UpstreamLink, VpnSession, WifiCredentials};
use std::future::Future;
use tracing::{error, info, warn};

/// Point the captive DNS redirect at the new mode, restarting the DNS
/// server when the drop-in changed
pub(crate) async fn sync_dns_redirect<S: ServiceSupervisor>(
    dns: &CaptiveDns,
    services: &S,
    mode: NetworkMode,
) {
    match dns.sync(mode) {
        Ok(true) => {
            if let Err(e) = services.restart(Service::DhcpDns).await {
                warn!("DNS server restart after redirect change failed: {}", e);
            }
        }
        Ok(false) => {}
        Err(e) => error!("{}", e),
    }
}

/// Run `work` unless `shutdown` fires first
async fn interruptible<T>(shutdown: &Shutdown, work: impl Future<Output = T>) -> Option<T> {
    let mut shutdown = shutdown.clone();
    if shutdown.is_fired() {
        return None;
    }
    tokio::select! {
        out = work => Some(out),
        _ = shutdown.wait() => None,
    }
}

pub struct Gateway<F, S, L, V> {
    ports: Ports<F, S, L, V>,
    config: Config,
    controller: ModeController<F>,
    resolver: ConnectivityResolver<L, V>,
    lock: MutationLock,
    dns: CaptiveDns,
}

impl<F, S, L, V> Gateway<F, S, L, V>
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
            store,
            ResolverSettings::from(config),
        );
        Self {
            ports,
            config: config.clone(),
            controller,
            resolver,
            lock: MutationLock::new(&config.paths.lock_file),
            dns: CaptiveDns::new(&config.paths.dns_redirect_file, config.network.portal_address),
        }
    }

    pub fn mode(&self) -> NetworkMode {
        self.controller.mode()
    }

    /// Take the mutation lock and pick up whatever mode is loaded now
    async fn lock(&mut self) -> Result<LockGuard, GatewayError> {
        let guard = self.lock.acquire(self.config.watchdog.lock_timeout()).await?;
        self.resume().await?;
        Ok(guard)
    }

    async fn tunnel_name(&self) -> String {
        match self.ports.vpn.status().await {
            Ok(status) => status
                .interface
                .unwrap_or_else(|| self.config.vpn.interface.clone()),
            Err(_) => self.config.vpn.interface.clone(),
        }
    }

    /// Recover the mode a previous process left loaded
    pub async fn resume(&mut self) -> Result<NetworkMode, GatewayError> {
        let upstream = self.ports.links.default_route_interface().await;
        let tunnel = self.tunnel_name().await;
        Ok(self.controller.resume(upstream.as_deref(), &tunnel).await?)
    }

    /// Boot reconciliation: CAPTIVE first, then straight to VPN when a
    /// session already exists over a live upstream
    pub async fn boot(&mut self) -> Result<NetworkMode, GatewayError> {
        let _guard = self.lock().await?;
        info!("Boot: entering captive mode");
        self.controller.transition(Posture::Captive).await?;

        let route = self.ports.links.default_route_interface().await;
        if let (Some(upstream), Ok(session)) =
            (route.as_deref(), self.resolver.check_vpn(route.as_deref()).await)
        {
            info!("Boot: VPN already up via {}, entering VPN mode", session.interface);
            if let Err(e) = self.controller.transition_vpn(upstream, &session).await {
                warn!("Boot: staying captive: {}", e);
            }
        }

        self.sync_dns().await;
        Ok(self.mode())
    }

    /// Acquire an upstream and, unless already in VPN mode, open INTERNET
    /// forwarding over it
    pub async fn connect_upstream(
        &mut self,
        named: Option<&str>,
        shutdown: &Shutdown,
    ) -> Result<UpstreamLink, GatewayError> {
        let _guard = self.lock().await?;
        let safe = self.controller.safe_posture();
        let list = candidates(&self.config);

        let link = match interruptible(shutdown, self.resolver.acquire_upstream(&list, named)).await
        {
            Some(result) => result?,
            None => return Err(self.restore(safe).await),
        };

        if self.mode() == NetworkMode::Vpn {
            info!("Upstream {} ready; VPN mode unchanged", link.iface);
            return Ok(link);
        }
        self.controller
            .transition(Posture::Internet {
                upstream: link.iface.clone(),
            })
            .await?;
        self.sync_dns().await;
        Ok(link)
    }

    /// Associate the WiFi upstream with new credentials; the mode is left
    /// as it is
    pub async fn connect_wifi(
        &mut self,
        creds: &WifiCredentials,
        shutdown: &Shutdown,
    ) -> Result<UpstreamLink, GatewayError> {
        let iface = self
            .config
            .network
            .upstream_candidates
            .iter()
            .find(|c| c.kind == UpstreamKind::Wifi)
            .map(|c| c.iface.clone())
            .ok_or_else(|| GatewayError::Usage("no WiFi upstream configured".to_string()))?;

        let _guard = self.lock().await?;
        let safe = self.controller.safe_posture();
        match interruptible(shutdown, self.resolver.connect_wifi(&iface, creds)).await {
            Some(result) => Ok(result?),
            None => Err(self.restore(safe).await),
        }
    }

    /// Connect the VPN and switch to VPN mode over the current upstream
    pub async fn connect_vpn(&mut self, shutdown: &Shutdown) -> Result<VpnSession, GatewayError> {
        let _guard = self.lock().await?;
        let upstream = match self.ports.links.default_route_interface().await {
            Some(iface) => iface,
            None => return Err(ResolveError::NoUpstreamAvailable("none".to_string()).into()),
        };
        let safe = self.controller.safe_posture();

        let servers = self.config.vpn.servers.clone();
        let session = match interruptible(shutdown, self.resolver.acquire_vpn(&servers)).await {
            Some(result) => result?,
            None => {
                self.resolver.disconnect_vpn().await;
                return Err(self.restore(safe).await);
            }
        };

        self.controller.transition_vpn(&upstream, &session).await?;
        self.sync_dns().await;
        Ok(session)
    }

    /// Operator-requested CAPTIVE or INTERNET. Leaving VPN for INTERNET is
    /// refused.
    pub async fn set_mode(&mut self, mode: NetworkMode) -> Result<NetworkMode, GatewayError> {
        let _guard = self.lock().await?;
        match mode {
            NetworkMode::Captive => {
                let leaving_vpn = self.mode() == NetworkMode::Vpn;
                self.controller.transition(Posture::Captive).await?;
                if leaving_vpn {
                    self.resolver.disconnect_vpn().await;
                }
            }
            NetworkMode::Internet => {
                let upstream = self
                    .ports
                    .links
                    .default_route_interface()
                    .await
                    .ok_or_else(|| ResolveError::NoUpstreamAvailable("none".to_string()))?;
                self.controller
                    .transition(Posture::Internet { upstream })
                    .await?;
            }
            NetworkMode::Vpn => {
                return Err(GatewayError::Usage(
                    "VPN mode is entered with connect-vpn".to_string(),
                ));
            }
        }
        self.sync_dns().await;
        Ok(self.mode())
    }

    async fn restore(&mut self, safe: Posture) -> GatewayError {
        warn!("Interrupted, restoring {} mode", safe.mode());
        if let Err(e) = self.controller.transition(safe).await {
            error!("Could not restore safe mode: {}", e);
        }
        self.sync_dns().await;
        GatewayError::Interrupted(self.mode())
    }

    async fn sync_dns(&self) {
        sync_dns_redirect(&self.dns, self.ports.services.as_ref(), self.mode()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ModeError;
    use crate::status;
    use crate::testing::{FakeFilter, FakeLinks, FakePorts, FakeServices, FakeVpn, fake_ports, test_config};
    use tempfile::TempDir;

    type TestGateway = Gateway<FakeFilter, FakeServices, FakeLinks, FakeVpn>;

    fn setup(dir: &TempDir) -> (Config, FakePorts, TestGateway) {
        let config = test_config(dir.path());
        let ports = fake_ports();
        ports.links.address("wlan1");
        let gateway = Gateway::new(ports.clone(), &config);
        (config, ports, gateway)
    }

    #[tokio::test]
    async fn test_boot_without_upstream_is_captive() {
        let dir = TempDir::new().unwrap();
        let (config, ports, mut gateway) = setup(&dir);

        assert_eq!(gateway.boot().await.unwrap(), NetworkMode::Captive);
        assert!(config.paths.dns_redirect_file.exists());
        assert!(!ports.filter.forwarding());

        let snapshot = status::collect(&ports, &config).await;
        assert_eq!(snapshot.mode, "captive");
        assert!(snapshot.to_string().contains("upstream:  none"));
    }

    #[tokio::test]
    async fn test_boot_with_live_vpn_enters_vpn() {
        let dir = TempDir::new().unwrap();
        let (config, ports, mut gateway) = setup(&dir);
        ports.links.connect("eth0");
        ports.vpn.set_connected(true);

        assert_eq!(gateway.boot().await.unwrap(), NetworkMode::Vpn);
        assert!(!config.paths.dns_redirect_file.exists());
        // Captive was applied first
        let history = ports.filter.history();
        assert_eq!(history.len(), 2);
        assert!(!history[0].permits_forward("wlan1", "eth0"));
        assert!(history[1].permits_forward("wlan1", "nordlynx"));
    }

    #[tokio::test]
    async fn test_connect_upstream_opens_internet() {
        let dir = TempDir::new().unwrap();
        let (config, ports, mut gateway) = setup(&dir);
        gateway.boot().await.unwrap();
        ports.links.heal_after("eth0", 1);

        let link = gateway
            .connect_upstream(None, &Shutdown::never())
            .await
            .unwrap();
        assert_eq!(link.iface, "eth0");
        assert_eq!(gateway.mode(), NetworkMode::Internet);
        assert!(ports.filter.forwarding());
        assert!(!config.paths.dns_redirect_file.exists());
    }

    #[tokio::test]
    async fn test_connect_upstream_failure_stays_captive() {
        let dir = TempDir::new().unwrap();
        let (_config, _ports, mut gateway) = setup(&dir);
        gateway.boot().await.unwrap();

        let err = gateway
            .connect_upstream(None, &Shutdown::never())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 30);
        assert_eq!(gateway.mode(), NetworkMode::Captive);
    }

    #[tokio::test]
    async fn test_connect_vpn_from_internet() {
        let dir = TempDir::new().unwrap();
        let (_config, ports, mut gateway) = setup(&dir);
        ports.links.connect("eth0");
        gateway.set_mode(NetworkMode::Internet).await.unwrap();
        ports.vpn.succeed_on("us", 1);

        let session = gateway.connect_vpn(&Shutdown::never()).await.unwrap();
        assert_eq!(session.hint, "us");
        assert_eq!(gateway.mode(), NetworkMode::Vpn);
        let current = ports.filter.current().unwrap();
        assert!(current.permits_forward("wlan1", "nordlynx"));
        assert!(!current.permits_forward("wlan1", "eth0"));
    }

    #[tokio::test]
    async fn test_interrupted_vpn_connect_restores_safe_mode() {
        let dir = TempDir::new().unwrap();
        let (_config, ports, mut gateway) = setup(&dir);
        ports.links.connect("eth0");
        gateway.set_mode(NetworkMode::Internet).await.unwrap();

        let (trigger, shutdown) = Shutdown::channel();
        trigger.fire();
        let err = gateway.connect_vpn(&shutdown).await.unwrap_err();
        assert!(matches!(err, GatewayError::Interrupted(NetworkMode::Internet)));
        assert_eq!(err.exit_code(), 130);
        assert_eq!(ports.vpn.disconnects(), 1);
        assert_eq!(gateway.mode(), NetworkMode::Internet);
    }

    #[tokio::test]
    async fn test_internet_request_refused_in_vpn() {
        let dir = TempDir::new().unwrap();
        let (_config, ports, mut gateway) = setup(&dir);
        ports.links.connect("eth0");
        ports.vpn.set_connected(true);
        gateway.boot().await.unwrap();

        let err = gateway.set_mode(NetworkMode::Internet).await.unwrap_err();
        assert!(matches!(err, GatewayError::Mode(ModeError::DowngradeRefused)));
        assert_eq!(err.exit_code(), 32);
        assert_eq!(gateway.mode(), NetworkMode::Vpn);

        assert_eq!(gateway.set_mode(NetworkMode::Captive).await.unwrap(), NetworkMode::Captive);
        assert_eq!(ports.vpn.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_flows_start_from_loaded_mode() {
        let dir = TempDir::new().unwrap();
        let (config, ports, mut first) = setup(&dir);
        ports.links.connect("eth0");
        ports.vpn.set_connected(true);
        assert_eq!(first.boot().await.unwrap(), NetworkMode::Vpn);

        // A later invocation starts out holding CAPTIVE
        let mut second = Gateway::new(ports.clone(), &config);
        let err = second.set_mode(NetworkMode::Internet).await.unwrap_err();
        assert!(matches!(err, GatewayError::Mode(ModeError::DowngradeRefused)));
        assert_eq!(second.mode(), NetworkMode::Vpn);
        assert!(ports.filter.current().unwrap().permits_forward("wlan1", "nordlynx"));
    }

    #[tokio::test]
    async fn test_connect_wifi_keeps_mode() {
        let dir = TempDir::new().unwrap();
        let (config, ports, mut gateway) = setup(&dir);
        gateway.boot().await.unwrap();
        ports.links.heal_after("wlan0", 1);

        let creds = WifiCredentials {
            ssid: "Hotel-Guest".to_string(),
            secret: None,
        };
        let link = gateway
            .connect_wifi(&creds, &Shutdown::never())
            .await
            .unwrap();
        assert_eq!(link.iface, "wlan0");
        assert_eq!(gateway.mode(), NetworkMode::Captive);

        let store = StateStore::new(&config.paths.state_file, config.watchdog.counter_reset);
        assert_eq!(store.load().unwrap().last_wifi_ssid.as_deref(), Some("Hotel-Guest"));
    }
}
