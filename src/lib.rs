//! vpn-ap - network mode controller and watchdog for a travel router
//!
//! The router hosts an access point for its clients and reaches the
//! internet over whatever upstream is available (wired, hotel WiFi, a
//! long-range adapter). It keeps clients in one of three modes:
//!
//! - CAPTIVE: clients only reach the local portal
//! - INTERNET: clients are NATed straight out of the upstream
//! - VPN: clients are forwarded only into the VPN tunnel, with a kill
//!   switch against the raw upstream
//!
//! # Architecture
//!
//! - `ports`: traits for the packet filter, services, links and VPN client
//! - `platform`: Linux implementations of the ports
//! - `firewall`: ruleset model, per-mode composition, captive DNS redirect
//! - `connectivity`: upstream and VPN acquisition
//! - `mode`: the mode state machine, sole applier of rulesets
//! - `watchdog`: periodic health supervision with bounded recovery
//! - `recovery`: emergency allow-all and service restarts
//! - `gateway`: operator flows (boot, connect, mode changes)
//! - `state`: persistent state for crash and reboot continuity
//! - `config`: configuration file handling (TOML)
//!
//! # Usage
//!
//! ```bash
//! sudo vpn-ap boot              # at startup
//! sudo vpn-ap watchdog          # long-running supervisor
//! sudo vpn-ap connect-vpn
//! sudo vpn-ap full              # last resort
//! ```

pub mod config;
pub mod connectivity;
pub mod error;
pub mod firewall;
pub mod gateway;
pub mod lock;
pub mod mode;
pub mod platform;
pub mod ports;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod status;
pub mod types;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::GatewayError;
pub use gateway::Gateway;
pub use recovery::EmergencyOverride;
pub use types::NetworkMode;
pub use watchdog::HealthSupervisor;
