//! Platform-specific implementations of the capability ports

pub mod linux;

use crate::config::Config;
use crate::ports::Ports;
use thiserror::Error;

pub use linux::{IptablesFilter, SystemLinks, SystemVpn, SystemdSupervisor};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Must run as root (effective uid {0})")]
    NotRoot(u32),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

pub type SystemPorts = Ports<IptablesFilter, SystemdSupervisor, SystemLinks, SystemVpn>;

/// Ports backed by the real system tools for the current platform
pub fn system_ports(config: &Config) -> Result<SystemPorts, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        Ok(linux::ports(config))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Err(PlatformError::UnsupportedPlatform)
    }
}

/// Packet filter and link changes need root
pub fn require_root() -> Result<(), PlatformError> {
    #[cfg(unix)]
    {
        let euid = nix::unistd::geteuid();
        if euid.is_root() {
            Ok(())
        } else {
            Err(PlatformError::NotRoot(euid.as_raw()))
        }
    }

    #[cfg(not(unix))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}
