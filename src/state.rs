//! Persistent state for crash and reboot continuity
//!
//! One JSON document holds the last-known-good upstream, WiFi and VPN
//! choices, the watchdog liveness stamp and the per-service recovery
//! counters. Writes go to a temp file that is renamed over the original,
//! so a power cut leaves either the old or the new document, never a
//! truncated one.
//!
//! The network mode stored here is informational only; the live mode is
//! always recomputed from the packet filter.

use crate::types::{CounterReset, NetworkMode, UpstreamKind, WifiCredentials};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to access state file: {0}")]
    IoError(#[from] io::Error),
    #[error("Failed to parse state file: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("State file schema {found} is newer than supported {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },
}

/// Attempt budget for one recovery key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryCounter {
    pub count: u32,
    /// Local calendar day (`YYYY-MM-DD`) the count belongs to
    pub day: String,
}

impl RecoveryCounter {
    /// Take one attempt from the budget. Returns the attempt number, or
    /// `None` when the cap is already reached.
    pub fn consume(&mut self, today: &str, cap: u32, reset: CounterReset) -> Option<u32> {
        if reset == CounterReset::Daily && self.day != today {
            self.count = 0;
        }
        self.day = today.to_string();
        if self.count >= cap {
            return None;
        }
        self.count += 1;
        Some(self.count)
    }

    /// Attempts already used today
    pub fn used(&self, today: &str, reset: CounterReset) -> u32 {
        if reset == CounterReset::Daily && self.day != today {
            0
        } else {
            self.count
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub schema_version: u32,
    pub last_upstream_kind: Option<UpstreamKind>,
    pub last_upstream_iface: Option<String>,
    pub last_wifi_ssid: Option<String>,
    pub last_wifi_secret: Option<String>,
    pub last_vpn_hint: Option<String>,
    pub last_watchdog_success_epoch: Option<u64>,
    /// Default-route interface seen by the previous watchdog pass
    pub last_default_route: Option<String>,
    pub last_mode: Option<NetworkMode>,
    pub last_transition_epoch: Option<u64>,
    pub counters: BTreeMap<String, RecoveryCounter>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            last_upstream_kind: None,
            last_upstream_iface: None,
            last_wifi_ssid: None,
            last_wifi_secret: None,
            last_vpn_hint: None,
            last_watchdog_success_epoch: None,
            last_default_route: None,
            last_mode: None,
            last_transition_epoch: None,
            counters: BTreeMap::new(),
        }
    }
}

impl PersistedState {
    pub fn wifi_credentials(&self) -> Option<WifiCredentials> {
        self.last_wifi_ssid.as_ref().map(|ssid| WifiCredentials {
            ssid: ssid.clone(),
            secret: self.last_wifi_secret.clone(),
        })
    }
}

/// File-backed store for [`PersistedState`]
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    reset: CounterReset,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, reset: CounterReset) -> Self {
        Self {
            path: path.into(),
            reset,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reset_policy(&self) -> CounterReset {
        self.reset
    }

    /// Missing file reads as the default state
    pub fn load(&self) -> Result<PersistedState, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(PersistedState::default());
            }
            Err(e) => return Err(e.into()),
        };
        let state: PersistedState = serde_json::from_str(&content)?;
        if state.schema_version > SCHEMA_VERSION {
            return Err(StateError::UnsupportedSchema {
                found: state.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(state)
    }

    /// Like `load`, but a damaged file is logged and replaced by defaults
    pub fn load_or_default(&self) -> PersistedState {
        match self.load() {
            Ok(state) => state,
            Err(e) => {
                warn!("Ignoring unreadable state file {}: {}", self.path.display(), e);
                PersistedState::default()
            }
        }
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let mut state = state.clone();
        state.schema_version = SCHEMA_VERSION;
        let body = serde_json::to_vec_pretty(&state)?;
        write_atomic(&self.path, &body)?;
        debug!("State saved to {}", self.path.display());
        Ok(())
    }

    /// Load, modify, save
    pub fn update<F>(&self, change: F) -> Result<PersistedState, StateError>
    where
        F: FnOnce(&mut PersistedState),
    {
        let mut state = self.load_or_default();
        change(&mut state);
        self.save(&state)?;
        Ok(state)
    }

    /// Take one recovery attempt for `key`. `Ok(None)` means the cap for
    /// the current period is already used up.
    pub fn try_consume(&self, key: &str, cap: u32, today: &str) -> Result<Option<u32>, StateError> {
        let mut granted = None;
        let reset = self.reset;
        self.update(|state| {
            granted = state
                .counters
                .entry(key.to_string())
                .or_default()
                .consume(today, cap, reset);
        })?;
        Ok(granted)
    }

    /// Successful recovery clears the key's budget
    pub fn reset_counter(&self, key: &str) -> Result<(), StateError> {
        let state = self.load_or_default();
        if state.counters.get(key).is_none_or(|c| c.count == 0) {
            return Ok(());
        }
        self.update(|state| {
            if let Some(counter) = state.counters.get_mut(key) {
                counter.count = 0;
            }
        })?;
        Ok(())
    }

    pub fn attempts_used(&self, key: &str, today: &str) -> u32 {
        self.load_or_default()
            .counters
            .get(key)
            .map(|c| c.used(today, self.reset))
            .unwrap_or(0)
    }
}

/// Current local calendar day, the unit recovery budgets are counted in
pub fn today() -> String {
    chrono::Local::now().date_naive().to_string()
}

pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp, path)?;
    Ok(())
}
