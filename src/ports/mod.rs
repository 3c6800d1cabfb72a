//! Capability ports around the external systems the gateway drives
//!
//! The core logic only sees these traits. Linux implementations live in
//! `platform`; in-memory fakes for tests live in `testing`.
//!
//! Probes answer plain booleans: a probe that errors or times out reads as
//! "not healthy" rather than propagating.

#![allow(async_fn_in_trait)]

pub mod command;

pub use command::{CommandError, CommandOutput, CommandRunner};

use crate::firewall::{AppliedPosture, Rule, Ruleset};
use crate::types::{Service, VpnMethod, WifiCredentials};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Packet filter command failed: {0}")]
    CommandError(#[from] CommandError),
    #[error("Packet filter rejected ruleset: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Service manager command failed: {0}")]
    CommandError(#[from] CommandError),
    #[error("Service {0} did not come back")]
    NotActive(Service),
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link command failed: {0}")]
    CommandError(#[from] CommandError),
    #[error("Interface {0} has no address")]
    NoAddress(String),
}

#[derive(Error, Debug)]
pub enum VpnError {
    #[error("VPN client command failed: {0}")]
    CommandError(#[from] CommandError),
    #[error("VPN client reports no connection")]
    NotConnected,
}

/// The kernel packet filter, replaced as a whole
pub trait PacketFilter {
    /// Replace every chain with `ruleset` in one atomic commit
    async fn apply(&self, ruleset: &Ruleset) -> Result<(), FilterError>;

    async fn set_forwarding(&self, enabled: bool) -> Result<(), FilterError>;

    /// Insert any of `rules` that are missing, leaving the rest untouched.
    /// Returns how many were inserted.
    async fn ensure_rules(&self, rules: &[Rule]) -> Result<usize, FilterError>;

    /// Posture marker of the ruleset currently loaded, if any
    async fn query(&self) -> Result<Option<AppliedPosture>, FilterError>;
}

/// systemd-style supervision of the gateway's own services
pub trait ServiceSupervisor {
    async fn is_active(&self, service: Service) -> bool;

    async fn start(&self, service: Service) -> Result<(), ServiceError>;

    async fn stop(&self, service: Service) -> Result<(), ServiceError>;

    /// Stop-then-start; a failed stop does not prevent the start
    async fn restart(&self, service: Service) -> Result<(), ServiceError> {
        if let Err(e) = self.stop(service).await {
            debug!(service = %service, "stop before restart failed: {}", e);
        }
        self.start(service).await
    }
}

pub trait LinkProbe {
    async fn is_up(&self, iface: &str) -> bool;

    async fn has_address(&self, iface: &str) -> bool;

    async fn default_route_interface(&self) -> Option<String>;

    /// First IPv4 address on `iface`, for status reporting
    async fn address(&self, iface: &str) -> Option<Ipv4Addr>;
}

/// Actions used to bring an upstream or the client side back
pub trait LinkControl {
    async fn bring_up(&self, iface: &str) -> Result<(), LinkError>;

    async fn rescan(&self, iface: &str) -> Result<(), LinkError>;

    /// Reconnect the link, associating with `wifi` when given
    async fn reconnect(&self, iface: &str, wifi: Option<&WifiCredentials>)
    -> Result<(), LinkError>;

    /// Administratively down then up
    async fn reset(&self, iface: &str) -> Result<(), LinkError>;

    async fn disconnect(&self, iface: &str) -> Result<(), LinkError>;

    async fn assign_address(&self, iface: &str, address: Ipv4Addr, prefix: u8)
    -> Result<(), LinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnStatus {
    pub connected: bool,
    pub interface: Option<String>,
}

impl VpnStatus {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            interface: None,
        }
    }
}

pub trait VpnClient {
    fn method(&self) -> VpnMethod;

    async fn connect(&self, hint: &str) -> Result<(), VpnError>;

    async fn disconnect(&self) -> Result<(), VpnError>;

    async fn status(&self) -> Result<VpnStatus, VpnError>;
}

/// One handle on each external system, shared by every component
pub struct Ports<F, S, L, V> {
    pub filter: Arc<F>,
    pub services: Arc<S>,
    pub links: Arc<L>,
    pub vpn: Arc<V>,
}

impl<F, S, L, V> Ports<F, S, L, V> {
    pub fn new(filter: F, services: S, links: L, vpn: V) -> Self {
        Self {
            filter: Arc::new(filter),
            services: Arc::new(services),
            links: Arc::new(links),
            vpn: Arc::new(vpn),
        }
    }
}

impl<F, S, L, V> Clone for Ports<F, S, L, V> {
    fn clone(&self) -> Self {
        Self {
            filter: Arc::clone(&self.filter),
            services: Arc::clone(&self.services),
            links: Arc::clone(&self.links),
            vpn: Arc::clone(&self.vpn),
        }
    }
}
