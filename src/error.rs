//! Top-level error and the CLI exit codes derived from it

use crate::config::ConfigError;
use crate::connectivity::ResolveError;
use crate::firewall::dns::DnsRedirectError;
use crate::lock::LockError;
use crate::mode::ModeError;
use crate::platform::PlatformError;
use crate::ports::{FilterError, LinkError, ServiceError, VpnError};
use crate::state::StateError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Mode(#[from] ModeError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Vpn(#[from] VpnError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Dns(#[from] DnsRedirectError),
    #[error("Interrupted, restored {0} mode")]
    Interrupted(crate::types::NetworkMode),
    #[error("Failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("Failed to render output: {0}")]
    Render(#[from] serde_json::Error),
    #[error("{0}")]
    Usage(String),
}

impl GatewayError {
    /// Stable process exit code per failure kind
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::Signal(_) | GatewayError::Render(_) => 1,
            GatewayError::Usage(_) => 2,
            GatewayError::Config(_) | GatewayError::Platform(_) => 10,
            GatewayError::Lock(_) => 11,
            GatewayError::State(_) | GatewayError::Mode(ModeError::StateError(_)) => 12,
            GatewayError::Filter(_)
            | GatewayError::Dns(_)
            | GatewayError::Mode(ModeError::ApplyError { .. })
            | GatewayError::Mode(ModeError::QueryError(_)) => 20,
            GatewayError::Service(_) => 21,
            GatewayError::Link(_) => 22,
            GatewayError::Resolve(ResolveError::NoUpstreamAvailable(_))
            | GatewayError::Resolve(ResolveError::UnknownInterface(_))
            | GatewayError::Mode(ModeError::NoUpstream(_)) => 30,
            GatewayError::Vpn(_)
            | GatewayError::Resolve(ResolveError::VpnUnavailable { .. })
            | GatewayError::Mode(ModeError::VpnNotConnected) => 31,
            GatewayError::Mode(ModeError::DowngradeRefused) => 32,
            GatewayError::Interrupted(_) => 130,
        }
    }
}
