//! Shared domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Forwarding posture of the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// Client DNS redirected to the portal, no forwarding
    Captive,
    /// Client traffic NATed straight out of the upstream link
    Internet,
    /// Client traffic forwarded only into the VPN tunnel
    Vpn,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Captive => "captive",
            NetworkMode::Internet => "internet",
            NetworkMode::Vpn => "vpn",
        }
    }

    /// Whether the kernel should forward packets in this mode
    pub fn forwards(&self) -> bool {
        !matches!(self, NetworkMode::Captive)
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "captive" => Ok(NetworkMode::Captive),
            "internet" => Ok(NetworkMode::Internet),
            "vpn" => Ok(NetworkMode::Vpn),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// Physical kind of an upstream link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamKind {
    Ethernet,
    Wifi,
    LongRange,
}

impl UpstreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamKind::Ethernet => "ethernet",
            UpstreamKind::Wifi => "wifi",
            UpstreamKind::LongRange => "long-range",
        }
    }

    /// Selection priority, lower is tried first
    pub fn priority(&self) -> u8 {
        match self {
            UpstreamKind::Ethernet => 0,
            UpstreamKind::Wifi => 1,
            UpstreamKind::LongRange => 2,
        }
    }

    /// Long-range links are never picked automatically
    pub fn manual_only(&self) -> bool {
        matches!(self, UpstreamKind::LongRange)
    }
}

impl fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpstreamKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ethernet" | "eth" | "wired" => Ok(UpstreamKind::Ethernet),
            "wifi" | "wireless" => Ok(UpstreamKind::Wifi),
            "long-range" | "longrange" | "lora" => Ok(UpstreamKind::LongRange),
            other => Err(format!("unknown upstream kind: {other}")),
        }
    }
}

/// A candidate path to the outside world, as probed this cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamLink {
    pub iface: String,
    pub kind: UpstreamKind,
    pub up: bool,
    pub has_address: bool,
    pub manual_only: bool,
}

impl UpstreamLink {
    pub fn candidate(iface: impl Into<String>, kind: UpstreamKind) -> Self {
        Self {
            iface: iface.into(),
            kind,
            up: false,
            has_address: false,
            manual_only: kind.manual_only(),
        }
    }

    pub fn usable(&self) -> bool {
        self.up && self.has_address
    }
}

/// How the VPN session is established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VpnMethod {
    /// Vendor command-line client (nordvpn)
    ProviderCli,
    /// Plain tunnel configuration brought up with wg-quick
    ProtocolTunnel,
}

impl FromStr for VpnMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "provider-cli" | "cli" | "nordvpn" => Ok(VpnMethod::ProviderCli),
            "protocol-tunnel" | "tunnel" | "wireguard" => Ok(VpnMethod::ProtocolTunnel),
            other => Err(format!("unknown vpn method: {other}")),
        }
    }
}

/// Result of a VPN connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnSession {
    pub method: VpnMethod,
    pub hint: String,
    pub interface: String,
    pub connected: bool,
}

/// Credentials for associating a WiFi upstream
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub secret: Option<String>,
}

impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Services kept alive by the health supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Service {
    AccessPoint,
    DhcpDns,
    Portal,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::AccessPoint, Service::DhcpDns, Service::Portal];

    /// Stable key used for recovery counters and logs
    pub fn key(&self) -> &'static str {
        match self {
            Service::AccessPoint => "access-point",
            Service::DhcpDns => "dhcp-dns",
            Service::Portal => "portal",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Where the controller lands when the VPN session is lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VpnLossPolicy {
    /// Block clients until the operator acts again
    #[default]
    Captive,
    /// Keep clients online without encryption
    Internet,
}

impl FromStr for VpnLossPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "captive" => Ok(VpnLossPolicy::Captive),
            "internet" => Ok(VpnLossPolicy::Internet),
            other => Err(format!("unknown vpn loss policy: {other}")),
        }
    }
}

/// When recovery counters start over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CounterReset {
    /// A new local calendar day clears every counter
    #[default]
    Daily,
    /// Counters clear only after a successful recovery
    Never,
}

impl FromStr for CounterReset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(CounterReset::Daily),
            "never" | "manual" => Ok(CounterReset::Never),
            other => Err(format!("unknown counter reset policy: {other}")),
        }
    }
}
