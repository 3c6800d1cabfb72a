//! Configuration handling for the gateway
//!
//! Settings come from a TOML file (when one exists) with `VPNAP_*`
//! environment-style overrides applied on top, once, at startup.

use crate::types::{CounterReset, UpstreamKind, VpnLossPolicy, VpnMethod};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Invalid value for {key}: {message}")]
    InvalidOverride { key: String, message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub vpn: VpnConfig,
    pub watchdog: WatchdogConfig,
    pub services: ServiceUnits,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface hosting the access point
    pub client_iface: String,
    /// Address of the gateway on the client network (portal + DNS)
    pub portal_address: Ipv4Addr,
    pub client_prefix: u8,
    /// Upstream candidates, tried wired before wireless
    pub upstream_candidates: Vec<UpstreamCandidate>,
    pub ssh_port: u16,
    pub portal_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamCandidate {
    pub iface: String,
    pub kind: UpstreamKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    pub method: VpnMethod,
    /// Tunnel interface the client network is forwarded into
    pub interface: String,
    /// Fallback list of server hints, tried in order
    pub servers: Vec<String>,
    pub loss_policy: VpnLossPolicy,
    pub connect_attempts: u32,
    pub settle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_secs: u64,
    /// Recovery attempts allowed per service per day
    pub recovery_cap: u32,
    pub counter_reset: CounterReset,
    pub command_timeout_secs: u64,
    pub wifi_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    pub link_settle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceUnits {
    pub access_point: String,
    pub dhcp_dns: String,
    pub portal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub dns_redirect_file: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            client_iface: "wlan1".to_string(),
            portal_address: Ipv4Addr::new(192, 168, 4, 1),
            client_prefix: 24,
            upstream_candidates: vec![
                UpstreamCandidate {
                    iface: "eth0".to_string(),
                    kind: UpstreamKind::Ethernet,
                },
                UpstreamCandidate {
                    iface: "wlan0".to_string(),
                    kind: UpstreamKind::Wifi,
                },
            ],
            ssh_port: 22,
            portal_port: 80,
        }
    }
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            method: VpnMethod::ProviderCli,
            interface: "nordlynx".to_string(),
            servers: ["auto", "us", "uk", "de"].map(String::from).to_vec(),
            loss_policy: VpnLossPolicy::Captive,
            connect_attempts: 3,
            settle_secs: 5,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            recovery_cap: 5,
            counter_reset: CounterReset::Daily,
            command_timeout_secs: 30,
            wifi_timeout_secs: 45,
            lock_timeout_secs: 20,
            link_settle_secs: 3,
        }
    }
}

impl Default for ServiceUnits {
    fn default() -> Self {
        Self {
            access_point: "hostapd".to_string(),
            dhcp_dns: "dnsmasq".to_string(),
            portal: "vpn-ap-portal".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("/var/lib/vpn-ap/state.json"),
            lock_file: PathBuf::from("/run/vpn-ap/firewall.lock"),
            dns_redirect_file: PathBuf::from("/etc/dnsmasq.d/captive-portal.conf"),
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn wifi_timeout(&self) -> Duration {
        Duration::from_secs(self.wifi_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from an explicit path or the default locations, then apply
    /// `VPNAP_*` overrides from the process environment.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Config::load(path)?,
            None => match default_locations().into_iter().find(|p| p.exists()) {
                Some(path) => {
                    debug!("Loading config from {}", path.display());
                    Config::load(&path)?
                }
                None => {
                    info!("No config file found, using defaults");
                    Config::default()
                }
            },
        };
        config.apply_overrides(std::env::vars())?;
        Ok(config)
    }

    /// Apply environment-style overrides. Unknown keys are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref().trim();
            match key {
                "VPNAP_UPSTREAM_CANDIDATES" => {
                    self.network.upstream_candidates = parse_candidates(value)
                        .map_err(|message| invalid(key, message))?;
                }
                "VPNAP_CLIENT_IFACE" => self.network.client_iface = value.to_string(),
                "VPNAP_PORTAL_ADDRESS" => {
                    self.network.portal_address =
                        value.parse().map_err(|_| invalid(key, "not an IPv4 address"))?;
                }
                "VPNAP_VPN_INTERFACE" => self.vpn.interface = value.to_string(),
                "VPNAP_VPN_METHOD" => {
                    self.vpn.method = value.parse().map_err(|e: String| invalid(key, e))?;
                }
                "VPNAP_VPN_SERVERS" => {
                    self.vpn.servers = split_list(value);
                }
                "VPNAP_VPN_LOSS_POLICY" => {
                    self.vpn.loss_policy = value.parse().map_err(|e: String| invalid(key, e))?;
                }
                "VPNAP_WATCHDOG_INTERVAL_SECS" => {
                    self.watchdog.interval_secs = parse_number(key, value)?;
                }
                "VPNAP_RECOVERY_CAP" => {
                    self.watchdog.recovery_cap = parse_number(key, value)?;
                }
                "VPNAP_COUNTER_RESET" => {
                    self.watchdog.counter_reset =
                        value.parse().map_err(|e: String| invalid(key, e))?;
                }
                "VPNAP_COMMAND_TIMEOUT_SECS" => {
                    self.watchdog.command_timeout_secs = parse_number(key, value)?;
                }
                "VPNAP_STATE_FILE" => self.paths.state_file = PathBuf::from(value),
                "VPNAP_LOCK_FILE" => self.paths.lock_file = PathBuf::from(value),
                _ => {}
            }
        }
        Ok(())
    }
}

fn default_locations() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("vpn-ap.toml"),
        PathBuf::from("/etc/vpn-ap/config.toml"),
    ];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("vpn-ap").join("config.toml"));
    }
    paths
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidOverride {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, "not a number"))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse `eth0:ethernet,wlan0:wifi` into candidates
fn parse_candidates(value: &str) -> Result<Vec<UpstreamCandidate>, String> {
    split_list(value)
        .into_iter()
        .map(|entry| -> Result<UpstreamCandidate, String> {
            let (iface, kind) = entry
                .split_once(':')
                .ok_or_else(|| format!("expected iface:kind, got {entry}"))?;
            Ok(UpstreamCandidate {
                iface: iface.trim().to_string(),
                kind: kind.parse()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_deployed_gateway() {
        let config = Config::default();
        assert_eq!(config.network.client_iface, "wlan1");
        assert_eq!(config.network.portal_address, Ipv4Addr::new(192, 168, 4, 1));
        assert_eq!(config.vpn.servers, vec!["auto", "us", "uk", "de"]);
        assert_eq!(config.watchdog.recovery_cap, 5);
        assert_eq!(config.vpn.loss_policy, VpnLossPolicy::Captive);
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = Config::default();
        config
            .apply_overrides([
                ("VPNAP_UPSTREAM_CANDIDATES", "eth1:ethernet, wlan0:wifi,wlan2:long-range"),
                ("VPNAP_VPN_SERVERS", "auto,ch"),
                ("VPNAP_VPN_LOSS_POLICY", "internet"),
                ("VPNAP_RECOVERY_CAP", "2"),
                ("VPNAP_COUNTER_RESET", "never"),
                ("VPNAP_VPN_METHOD", "protocol-tunnel"),
                ("HOME", "/root"),
            ])
            .unwrap();

        assert_eq!(config.network.upstream_candidates.len(), 3);
        assert_eq!(config.network.upstream_candidates[0].iface, "eth1");
        assert_eq!(
            config.network.upstream_candidates[2].kind,
            UpstreamKind::LongRange
        );
        assert_eq!(config.vpn.servers, vec!["auto", "ch"]);
        assert_eq!(config.vpn.loss_policy, VpnLossPolicy::Internet);
        assert_eq!(config.vpn.method, VpnMethod::ProtocolTunnel);
        assert_eq!(config.watchdog.recovery_cap, 2);
        assert_eq!(config.watchdog.counter_reset, CounterReset::Never);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides([("VPNAP_RECOVERY_CAP", "lots")])
            .unwrap_err();
        assert!(err.to_string().contains("VPNAP_RECOVERY_CAP"));

        let err = config
            .apply_overrides([("VPNAP_UPSTREAM_CANDIDATES", "eth0")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn test_save_and_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        Config::default().save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.network.ssh_port, 22);

        std::fs::write(&path, "[watchdog]\ninterval_secs = 30\n").unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.watchdog.interval_secs, 30);
        assert_eq!(loaded.watchdog.recovery_cap, 5);
        assert_eq!(loaded.services.access_point, "hostapd");
    }
}
