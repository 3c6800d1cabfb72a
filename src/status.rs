//! Operator-facing status snapshot

use crate::config::Config;
use crate::ports::{LinkProbe, PacketFilter, Ports, ServiceSupervisor, VpnClient};
use crate::state::{StateStore, now_epoch, today};
use crate::types::{Service, UpstreamKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::debug;

const PUBLIC_IP_URL: &str = "https://api.ipify.org";
pub const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(5);

/// The watchdog is considered stale after this many missed cadences
pub const STALE_CADENCES: u64 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub iface: String,
    pub kind: Option<UpstreamKind>,
    pub address: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VpnStatusReport {
    pub connected: bool,
    pub interface: Option<String>,
    pub last_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub hostname: String,
    /// Posture marker of the loaded ruleset: captive, internet, vpn, open
    /// or unknown
    pub mode: String,
    pub upstream: Option<UpstreamStatus>,
    pub vpn: VpnStatusReport,
    pub services: BTreeMap<String, bool>,
    pub client_iface: String,
    pub client_address: Option<Ipv4Addr>,
    pub last_watchdog_epoch: Option<u64>,
    pub watchdog_stale: bool,
    /// Recovery attempts used in the current period, non-zero keys only
    pub recovery_attempts: BTreeMap<String, u32>,
    pub recovery_cap: u32,
    pub public_ip: Option<String>,
}

pub async fn collect<F, S, L, V>(ports: &Ports<F, S, L, V>, config: &Config) -> GatewayStatus
where
    F: PacketFilter,
    S: ServiceSupervisor,
    L: LinkProbe,
    V: VpnClient,
{
    let store = StateStore::new(&config.paths.state_file, config.watchdog.counter_reset);
    let state = store.load_or_default();

    let mode = match ports.filter.query().await {
        Ok(Some(posture)) => posture.label().to_string(),
        Ok(None) => "unknown".to_string(),
        Err(e) => {
            debug!("Could not read packet filter: {}", e);
            "unknown".to_string()
        }
    };

    let upstream = match ports.links.default_route_interface().await {
        Some(iface) => {
            let kind = config
                .network
                .upstream_candidates
                .iter()
                .find(|c| c.iface == iface)
                .map(|c| c.kind)
                .or_else(|| {
                    (state.last_upstream_iface.as_deref() == Some(iface.as_str()))
                        .then_some(state.last_upstream_kind)
                        .flatten()
                });
            let address = ports.links.address(&iface).await;
            Some(UpstreamStatus {
                iface,
                kind,
                address,
            })
        }
        None => None,
    };

    let vpn_status = ports.vpn.status().await.unwrap_or_else(|e| {
        debug!("Could not read VPN status: {}", e);
        crate::ports::VpnStatus::disconnected()
    });

    let mut services = BTreeMap::new();
    for service in Service::ALL {
        services.insert(
            service.key().to_string(),
            ports.services.is_active(service).await,
        );
    }

    let today = today();
    let recovery_attempts = state
        .counters
        .iter()
        .map(|(key, counter)| (key.clone(), counter.used(&today, store.reset_policy())))
        .filter(|(_, used)| *used > 0)
        .collect();

    let stale_after = config.watchdog.interval().as_secs() * STALE_CADENCES;
    let watchdog_stale = state
        .last_watchdog_success_epoch
        .is_none_or(|last| now_epoch().saturating_sub(last) > stale_after);

    GatewayStatus {
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string()),
        mode,
        upstream,
        vpn: VpnStatusReport {
            connected: vpn_status.connected,
            interface: vpn_status.interface,
            last_hint: state.last_vpn_hint,
        },
        services,
        client_iface: config.network.client_iface.clone(),
        client_address: ports.links.address(&config.network.client_iface).await,
        last_watchdog_epoch: state.last_watchdog_success_epoch,
        watchdog_stale,
        recovery_attempts,
        recovery_cap: config.watchdog.recovery_cap,
        public_ip: None,
    }
}

/// Ask an external echo service for the address the world sees
pub async fn public_ip(timeout: Duration) -> Option<String> {
    match fetch_public_ip(timeout).await {
        Ok(ip) => ip,
        Err(e) => {
            debug!("Public IP lookup failed: {}", e);
            None
        }
    }
}

async fn fetch_public_ip(timeout: Duration) -> Result<Option<String>, reqwest::Error> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let body = client
        .get(PUBLIC_IP_URL)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let body = body.trim();
    Ok(body.parse::<IpAddr>().is_ok().then(|| body.to_string()))
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "hostname:  {}", self.hostname)?;
        writeln!(f, "mode:      {}", self.mode)?;
        match &self.upstream {
            Some(up) => {
                write!(f, "upstream:  {}", up.iface)?;
                if let Some(kind) = up.kind {
                    write!(f, " ({kind})")?;
                }
                if let Some(address) = up.address {
                    write!(f, " {address}")?;
                }
                writeln!(f)?;
            }
            None => writeln!(f, "upstream:  none")?,
        }
        if self.vpn.connected {
            write!(
                f,
                "vpn:       connected via {}",
                self.vpn.interface.as_deref().unwrap_or("?")
            )?;
            if let Some(hint) = &self.vpn.last_hint {
                write!(f, " ({hint})")?;
            }
            writeln!(f)?;
        } else {
            writeln!(f, "vpn:       disconnected")?;
        }
        let services: Vec<String> = self
            .services
            .iter()
            .map(|(name, up)| format!("{name} {}", if *up { "up" } else { "DOWN" }))
            .collect();
        writeln!(f, "services:  {}", services.join(", "))?;
        match self.client_address {
            Some(address) => writeln!(f, "client:    {} {}", self.client_iface, address)?,
            None => writeln!(f, "client:    {} NO ADDRESS", self.client_iface)?,
        }
        match self.last_watchdog_epoch {
            Some(last) => {
                let ago = now_epoch().saturating_sub(last);
                let note = if self.watchdog_stale { " (stale)" } else { "" };
                writeln!(f, "watchdog:  last pass {ago}s ago{note}")?;
            }
            None => writeln!(f, "watchdog:  never ran")?,
        }
        if !self.recovery_attempts.is_empty() {
            let used: Vec<String> = self
                .recovery_attempts
                .iter()
                .map(|(key, n)| format!("{key} {n}/{}", self.recovery_cap))
                .collect();
            writeln!(f, "recovery:  {}", used.join(", "))?;
        }
        if let Some(ip) = &self.public_ip {
            writeln!(f, "public ip: {ip}")?;
        }
        Ok(())
    }
}
