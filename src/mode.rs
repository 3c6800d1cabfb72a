//! Network mode state machine
//!
//! The controller is the only place a full ruleset gets applied. Each
//! transition composes the target ruleset from scratch and replaces the
//! loaded one atomically, so the firewall is either entirely in the old
//! mode or entirely in the new one.
//!
//! ```text
//!   CAPTIVE --connect_upstream--> INTERNET --connect_vpn--> VPN
//!      ^                                                     |
//!      +------------- VPN lost (policy) / restore -----------+
//! ```
//!
//! VPN never drops to INTERNET on request; only a `VpnLost` from the
//! resolver can cause that, and only when the loss policy allows it.

use crate::connectivity::VpnLost;
use crate::firewall::{AppliedPosture, Layout, Posture, compose};
use crate::ports::{FilterError, PacketFilter};
use crate::state::{StateError, StateStore, now_epoch};
use crate::types::{NetworkMode, VpnLossPolicy, VpnSession};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ModeError {
    #[error("Failed to apply {mode} ruleset: {source}")]
    ApplyError {
        mode: NetworkMode,
        #[source]
        source: FilterError,
    },
    #[error("Refusing to drop from VPN to unencrypted internet")]
    DowngradeRefused,
    #[error("VPN session is not connected")]
    VpnNotConnected,
    #[error("{0} mode needs an upstream interface")]
    NoUpstream(NetworkMode),
    #[error("Failed to read packet filter state: {0}")]
    QueryError(#[source] FilterError),
    #[error("State error: {0}")]
    StateError(#[from] StateError),
}

/// What `reconcile` found loaded in the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    InSync,
    /// Another process moved the gateway to this mode; taken over as is
    Adopted(NetworkMode),
    /// Marker missing or unreadable; the held posture was re-applied
    Repaired,
    /// Emergency allow-all, left alone
    Open,
}

pub struct ModeController<F> {
    filter: Arc<F>,
    layout: Layout,
    policy: VpnLossPolicy,
    store: StateStore,
    posture: Posture,
}

impl<F: PacketFilter> ModeController<F> {
    /// A controller that assumes CAPTIVE until told otherwise
    pub fn new(filter: Arc<F>, layout: Layout, policy: VpnLossPolicy, store: StateStore) -> Self {
        Self {
            filter,
            layout,
            policy,
            store,
            posture: Posture::Captive,
        }
    }

    pub fn mode(&self) -> NetworkMode {
        self.posture.mode()
    }

    pub fn posture(&self) -> &Posture {
        &self.posture
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Recompute the live mode from the loaded ruleset. An unmarked,
    /// unknown or emergency ruleset reads as CAPTIVE. Nothing is applied.
    pub async fn resume(
        &mut self,
        upstream: Option<&str>,
        tunnel: &str,
    ) -> Result<NetworkMode, ModeError> {
        let live = self.filter.query().await.map_err(ModeError::QueryError)?;
        let upstream = upstream
            .map(String::from)
            .or_else(|| self.store.load_or_default().last_upstream_iface);

        self.posture = match live {
            Some(AppliedPosture::Mode(mode)) => posture_for(mode, upstream, tunnel),
            _ => Posture::Captive,
        };
        debug!("Resumed in {} mode (loaded: {:?})", self.mode(), live);
        Ok(self.mode())
    }

    /// Move to CAPTIVE or INTERNET. VPN to INTERNET is refused, and VPN
    /// itself is only entered through `transition_vpn`.
    pub async fn transition(&mut self, target: Posture) -> Result<(), ModeError> {
        if target.mode() == NetworkMode::Vpn {
            return Err(ModeError::VpnNotConnected);
        }
        if self.mode() == NetworkMode::Vpn && target.mode() == NetworkMode::Internet {
            return Err(ModeError::DowngradeRefused);
        }
        self.apply(target).await
    }

    /// Enter (or re-enter) VPN mode through a connected session
    pub async fn transition_vpn(
        &mut self,
        upstream: &str,
        session: &VpnSession,
    ) -> Result<(), ModeError> {
        if !session.connected {
            return Err(ModeError::VpnNotConnected);
        }
        self.apply(Posture::Vpn {
            upstream: upstream.to_string(),
            tunnel: session.interface.clone(),
        })
        .await
    }

    /// Leave VPN mode after the session is gone, per the loss policy
    pub async fn on_vpn_lost(&mut self, lost: VpnLost) -> Result<NetworkMode, ModeError> {
        let target = match (self.policy, lost.upstream()) {
            (VpnLossPolicy::Internet, Some(upstream)) => Posture::Internet {
                upstream: upstream.to_string(),
            },
            _ => Posture::Captive,
        };
        warn!(
            "VPN lost ({}), falling back to {} mode",
            lost.reason(),
            target.mode()
        );
        self.apply(target).await?;
        Ok(self.mode())
    }

    /// Last mode that is safe to return to after an interrupted request
    pub fn safe_posture(&self) -> Posture {
        match &self.posture {
            Posture::Vpn { .. } => Posture::Captive,
            other => other.clone(),
        }
    }

    /// Line the held posture up with the loaded ruleset. A ruleset another
    /// process applied is adopted; only a missing or unknown marker counts
    /// as drift and gets the held posture re-applied. An emergency
    /// allow-all is left alone.
    pub async fn reconcile(
        &mut self,
        upstream: Option<&str>,
        tunnel: &str,
    ) -> Result<Reconciled, ModeError> {
        let live = self.filter.query().await.map_err(ModeError::QueryError)?;
        match live {
            Some(AppliedPosture::Open) => Ok(Reconciled::Open),
            Some(AppliedPosture::Mode(mode)) if mode == self.mode() => Ok(Reconciled::InSync),
            Some(AppliedPosture::Mode(mode)) => {
                let upstream = self
                    .store
                    .load_or_default()
                    .last_upstream_iface
                    .or_else(|| upstream.map(String::from));
                let adopted = posture_for(mode, upstream, tunnel);
                if adopted.mode() == mode {
                    info!("Loaded ruleset moved {} -> {}, following it", self.mode(), mode);
                    self.posture = adopted;
                    return Ok(Reconciled::Adopted(mode));
                }
                warn!("{} ruleset loaded with no known upstream, re-applying {}", mode, self.mode());
                self.apply(self.posture.clone()).await?;
                Ok(Reconciled::Repaired)
            }
            None => {
                warn!("Loaded ruleset lost its marker, re-applying {} mode", self.mode());
                self.apply(self.posture.clone()).await?;
                Ok(Reconciled::Repaired)
            }
        }
    }

    async fn apply(&mut self, target: Posture) -> Result<(), ModeError> {
        let mode = target.mode();
        if target.upstream().is_some_and(str::is_empty) {
            return Err(ModeError::NoUpstream(mode));
        }

        let ruleset = compose(&self.layout, &target);
        let apply_error = |source| ModeError::ApplyError { mode, source };
        let was_forwarding = self.mode().forwards();

        // Forwarding goes off before a restrictive ruleset and on only
        // after a permissive one
        if !mode.forwards() {
            self.filter.set_forwarding(false).await.map_err(apply_error)?;
        }
        if let Err(e) = self.filter.apply(&ruleset).await {
            if !mode.forwards() && was_forwarding {
                if let Err(restore) = self.filter.set_forwarding(true).await {
                    warn!("Could not restore forwarding: {}", restore);
                }
            }
            return Err(apply_error(e));
        }
        if mode.forwards() {
            if let Err(e) = self.filter.set_forwarding(true).await {
                let previous = compose(&self.layout, &self.posture);
                if let Err(restore) = self.filter.apply(&previous).await {
                    warn!("Could not restore {} ruleset: {}", self.mode(), restore);
                }
                return Err(apply_error(e));
            }
        }

        let previous = self.mode();
        self.posture = target;
        info!("Network mode {} -> {}", previous, mode);

        let upstream = self.posture.upstream().map(String::from);
        let persisted = self.store.update(|state| {
            state.last_mode = Some(mode);
            state.last_transition_epoch = Some(now_epoch());
            if upstream.is_some() {
                state.last_upstream_iface = upstream;
            }
        });
        if let Err(e) = persisted {
            warn!("Could not persist mode transition: {}", e);
        }
        Ok(())
    }
}

/// Posture for a marker read back from the kernel. INTERNET and VPN need
/// an upstream; without one the gateway is treated as CAPTIVE.
fn posture_for(mode: NetworkMode, upstream: Option<String>, tunnel: &str) -> Posture {
    match (mode, upstream) {
        (NetworkMode::Internet, Some(upstream)) => Posture::Internet { upstream },
        (NetworkMode::Vpn, Some(upstream)) => Posture::Vpn {
            upstream,
            tunnel: tunnel.to_string(),
        },
        _ => Posture::Captive,
    }
}
