//! Upstream and VPN acquisition
//!
//! The resolver decides *which* link and *which* VPN server to use and
//! drives the link/VPN ports to get there. It never touches the packet
//! filter: the mode controller applies whatever the resolver finds.

use crate::config::Config;
use crate::ports::{LinkControl, LinkProbe, VpnClient};
use crate::state::StateStore;
use crate::types::{UpstreamKind, UpstreamLink, VpnSession, WifiCredentials};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Recovery tiers tried per upstream link before moving on
pub const LINK_TIERS: u32 = 3;

const WIFI_DISCONNECT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("No upstream link available (tried: {0})")]
    NoUpstreamAvailable(String),
    #[error("VPN unavailable after trying {tried} server hint(s)")]
    VpnUnavailable { tried: usize },
    #[error("Unknown upstream interface {0}")]
    UnknownInterface(String),
}

/// Evidence that the VPN session is gone, handed to the mode controller.
/// Only the resolver creates one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnLost {
    upstream: Option<String>,
    reason: String,
}

impl VpnLost {
    /// Upstream still usable for a plain-internet fallback, if any
    pub fn upstream(&self) -> Option<&str> {
        self.upstream.as_deref()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub link_settle: Duration,
    pub vpn_settle: Duration,
    pub vpn_attempts: u32,
    pub vpn_interface: String,
    pub wifi_pause: Duration,
}

impl From<&Config> for ResolverSettings {
    fn from(config: &Config) -> Self {
        Self {
            link_settle: Duration::from_secs(config.watchdog.link_settle_secs),
            vpn_settle: Duration::from_secs(config.vpn.settle_secs),
            vpn_attempts: config.vpn.connect_attempts.max(1),
            vpn_interface: config.vpn.interface.clone(),
            wifi_pause: if config.watchdog.link_settle_secs == 0 {
                Duration::ZERO
            } else {
                WIFI_DISCONNECT_PAUSE
            },
        }
    }
}

/// Configured upstream candidates as unprobed links
pub fn candidates(config: &Config) -> Vec<UpstreamLink> {
    config
        .network
        .upstream_candidates
        .iter()
        .map(|c| UpstreamLink::candidate(c.iface.clone(), c.kind))
        .collect()
}

/// Put the preferred hint first, keeping the rest in configured order
pub fn prioritize_hints(servers: &[String], preferred: Option<&str>) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::with_capacity(servers.len() + 1);
    if let Some(hint) = preferred.filter(|h| !h.is_empty()) {
        ordered.push(hint.to_string());
    }
    for server in servers {
        if !ordered.contains(server) {
            ordered.push(server.clone());
        }
    }
    ordered
}

pub struct ConnectivityResolver<L, V> {
    links: Arc<L>,
    vpn: Arc<V>,
    store: StateStore,
    settings: ResolverSettings,
}

impl<L, V> ConnectivityResolver<L, V>
where
    L: LinkProbe + LinkControl,
    V: VpnClient,
{
    pub fn new(links: Arc<L>, vpn: Arc<V>, store: StateStore, settings: ResolverSettings) -> Self {
        Self {
            links,
            vpn,
            store,
            settings,
        }
    }

    /// Fill in the live `up`/`has_address` flags of a candidate
    pub async fn probe(&self, candidate: &UpstreamLink) -> UpstreamLink {
        let mut link = candidate.clone();
        link.up = self.links.is_up(&link.iface).await;
        link.has_address = link.up && self.links.has_address(&link.iface).await;
        link
    }

    /// Find a usable upstream, escalating recovery on each candidate in
    /// priority order. Long-range links are only considered when `named`.
    pub async fn acquire_upstream(
        &self,
        candidates: &[UpstreamLink],
        named: Option<&str>,
    ) -> Result<UpstreamLink, ResolveError> {
        if let Some(name) = named {
            if !candidates.iter().any(|c| c.iface == name) {
                return Err(ResolveError::UnknownInterface(name.to_string()));
            }
        }

        let mut ordered: Vec<&UpstreamLink> = candidates
            .iter()
            .filter(|c| match named {
                Some(name) => c.iface == name,
                None => !c.manual_only,
            })
            .collect();
        ordered.sort_by_key(|c| c.kind.priority());

        let wifi = self.store.load_or_default().wifi_credentials();
        let mut tried = Vec::new();

        for candidate in ordered {
            tried.push(candidate.iface.clone());

            let probed = self.probe(candidate).await;
            if probed.usable() {
                debug!("Upstream {} already usable", probed.iface);
                self.remember(&probed);
                return Ok(probed);
            }

            for tier in 1..=LINK_TIERS {
                info!(iface = %candidate.iface, tier, "Recovering upstream");
                let creds = (candidate.kind == UpstreamKind::Wifi)
                    .then_some(wifi.as_ref())
                    .flatten();
                if let Err(e) = self.run_tier(&candidate.iface, tier, creds).await {
                    warn!(iface = %candidate.iface, tier, "Recovery step failed: {}", e);
                }
                tokio::time::sleep(self.settings.link_settle).await;

                let probed = self.probe(candidate).await;
                if probed.usable() {
                    info!("Upstream {} ({}) is usable", probed.iface, probed.kind);
                    self.remember(&probed);
                    return Ok(probed);
                }
            }
            warn!("Giving up on upstream {}", candidate.iface);
        }

        Err(ResolveError::NoUpstreamAvailable(if tried.is_empty() {
            "none".to_string()
        } else {
            tried.join(", ")
        }))
    }

    async fn run_tier(
        &self,
        iface: &str,
        tier: u32,
        wifi: Option<&WifiCredentials>,
    ) -> Result<(), crate::ports::LinkError> {
        match tier {
            1 => self.links.bring_up(iface).await,
            2 => {
                self.links.rescan(iface).await?;
                self.links.reconnect(iface, wifi).await
            }
            _ => {
                self.links.reset(iface).await?;
                self.links.rescan(iface).await?;
                self.links.reconnect(iface, wifi).await
            }
        }
    }

    fn remember(&self, link: &UpstreamLink) {
        let result = self.store.update(|state| {
            state.last_upstream_kind = Some(link.kind);
            state.last_upstream_iface = Some(link.iface.clone());
        });
        if let Err(e) = result {
            warn!("Could not persist upstream choice: {}", e);
        }
    }

    /// Associate the WiFi upstream with new credentials. The credentials
    /// are only persisted once the link has an address.
    pub async fn connect_wifi(
        &self,
        iface: &str,
        creds: &WifiCredentials,
    ) -> Result<UpstreamLink, ResolveError> {
        info!("Connecting {} to WiFi network {}", iface, creds.ssid);
        if let Err(e) = self.links.disconnect(iface).await {
            debug!("Disconnect before association failed: {}", e);
        }
        tokio::time::sleep(self.settings.wifi_pause).await;

        if let Err(e) = self.links.reconnect(iface, Some(creds)).await {
            warn!("Association with {} failed: {}", creds.ssid, e);
            return Err(ResolveError::NoUpstreamAvailable(iface.to_string()));
        }
        tokio::time::sleep(self.settings.link_settle).await;

        let link = self
            .probe(&UpstreamLink::candidate(iface, UpstreamKind::Wifi))
            .await;
        if !link.usable() {
            return Err(ResolveError::NoUpstreamAvailable(iface.to_string()));
        }

        let result = self.store.update(|state| {
            state.last_wifi_ssid = Some(creds.ssid.clone());
            state.last_wifi_secret = creds.secret.clone();
            state.last_upstream_kind = Some(UpstreamKind::Wifi);
            state.last_upstream_iface = Some(iface.to_string());
        });
        if let Err(e) = result {
            warn!("Could not persist WiFi credentials: {}", e);
        }
        Ok(link)
    }

    /// Connect the VPN, walking the server hints with bounded attempts
    /// each. The last hint that worked is tried first.
    pub async fn acquire_vpn(&self, servers: &[String]) -> Result<VpnSession, ResolveError> {
        let preferred = self.store.load_or_default().last_vpn_hint;
        let hints = prioritize_hints(servers, preferred.as_deref());

        for hint in &hints {
            for attempt in 1..=self.settings.vpn_attempts {
                info!(hint = %hint, attempt, "Connecting VPN");
                if let Err(e) = self.vpn.connect(hint).await {
                    warn!(hint = %hint, attempt, "VPN connect failed: {}", e);
                }
                tokio::time::sleep(self.settings.vpn_settle).await;

                match self.vpn.status().await {
                    Ok(status) if status.connected => {
                        let session = VpnSession {
                            method: self.vpn.method(),
                            hint: hint.clone(),
                            interface: status
                                .interface
                                .unwrap_or_else(|| self.settings.vpn_interface.clone()),
                            connected: true,
                        };
                        info!("VPN connected via {} on {}", session.hint, session.interface);
                        if let Err(e) = self.store.update(|s| s.last_vpn_hint = Some(hint.clone())) {
                            warn!("Could not persist VPN hint: {}", e);
                        }
                        return Ok(session);
                    }
                    Ok(_) => debug!(hint = %hint, attempt, "VPN not connected yet"),
                    Err(e) => debug!("VPN status failed: {}", e),
                }
            }
            if let Err(e) = self.vpn.disconnect().await {
                debug!("Cleanup disconnect after {} failed: {}", hint, e);
            }
        }

        Err(ResolveError::VpnUnavailable { tried: hints.len() })
    }

    /// Current VPN session, or the evidence that it is gone
    pub async fn check_vpn(&self, upstream: Option<&str>) -> Result<VpnSession, VpnLost> {
        match self.vpn.status().await {
            Ok(status) if status.connected => Ok(VpnSession {
                method: self.vpn.method(),
                hint: self.store.load_or_default().last_vpn_hint.unwrap_or_default(),
                interface: status
                    .interface
                    .unwrap_or_else(|| self.settings.vpn_interface.clone()),
                connected: true,
            }),
            Ok(_) => Err(self.vpn_lost(upstream, "VPN client reports disconnected")),
            Err(e) => Err(self.vpn_lost(upstream, &e.to_string())),
        }
    }

    pub fn vpn_lost(&self, upstream: Option<&str>, reason: &str) -> VpnLost {
        VpnLost {
            upstream: upstream.map(String::from),
            reason: reason.to_string(),
        }
    }

    pub async fn disconnect_vpn(&self) {
        if let Err(e) = self.vpn.disconnect().await {
            warn!("VPN disconnect failed: {}", e);
        }
    }
}
