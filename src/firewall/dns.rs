//! Captive DNS redirect drop-in for the DHCP/DNS server
//!
//! While captive, every name resolves to the portal address. The drop-in
//! file is owned entirely by this module; callers restart the DHCP/DNS
//! service when `enable`/`disable` report a change.

use crate::types::NetworkMode;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DnsRedirectError {
    #[error("Failed to update DNS redirect file {path}: {source}")]
    WriteError { path: PathBuf, source: io::Error },
}

const HEADER: &str = "# Managed by vpn-ap: captive portal DNS redirect";

pub struct CaptiveDns {
    path: PathBuf,
    portal: Ipv4Addr,
}

impl CaptiveDns {
    pub fn new(path: impl Into<PathBuf>, portal: Ipv4Addr) -> Self {
        Self {
            path: path.into(),
            portal,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn content(&self) -> String {
        format!("{HEADER}\naddress=/#/{}\n", self.portal)
    }

    pub fn is_enabled(&self) -> bool {
        fs::read_to_string(&self.path)
            .map(|c| c == self.content())
            .unwrap_or(false)
    }

    /// Write the redirect. Returns true when the file changed.
    pub fn enable(&self) -> Result<bool, DnsRedirectError> {
        if self.is_enabled() {
            return Ok(false);
        }
        let wrap = |source| DnsRedirectError::WriteError {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(wrap)?;
        }
        fs::write(&self.path, self.content()).map_err(wrap)?;
        debug!("DNS redirect enabled in {}", self.path.display());
        Ok(true)
    }

    /// Remove the redirect. Returns true when a file was removed.
    pub fn disable(&self) -> Result<bool, DnsRedirectError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("DNS redirect removed from {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(DnsRedirectError::WriteError {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Redirect only while captive. Returns true when the file changed.
    pub fn sync(&self, mode: NetworkMode) -> Result<bool, DnsRedirectError> {
        match mode {
            NetworkMode::Captive => self.enable(),
            NetworkMode::Internet | NetworkMode::Vpn => self.disable(),
        }
    }
}
