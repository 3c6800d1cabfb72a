//! Emergency override
//!
//! Last-resort operations for when the mode state machine itself cannot
//! be trusted. They bypass the mode controller entirely: the allow-all
//! ruleset is applied directly and nothing here consults the current mode.
//! A busy mutation lock is waited on briefly and then ignored.

use crate::config::Config;
use crate::error::GatewayError;
use crate::firewall::allow_all;
use crate::lock::{LockGuard, MutationLock};
use crate::ports::{LinkProbe, PacketFilter, Ports, ServiceError, ServiceSupervisor, VpnClient};
use crate::status::{self, GatewayStatus};
use crate::types::Service;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// `None` when no disconnect was attempted
    pub vpn_disconnected: Option<bool>,
    pub firewall_reset: bool,
    /// Service key -> active after restart
    pub services: BTreeMap<String, bool>,
    pub status: Option<GatewayStatus>,
}

pub struct EmergencyOverride<F, S, L, V> {
    ports: Ports<F, S, L, V>,
    config: Config,
    lock: MutationLock,
    lock_timeout: Duration,
}

impl<F, S, L, V> EmergencyOverride<F, S, L, V>
where
    F: PacketFilter,
    S: ServiceSupervisor,
    L: LinkProbe,
    V: VpnClient,
{
    pub fn new(ports: Ports<F, S, L, V>, config: &Config) -> Self {
        Self {
            ports,
            config: config.clone(),
            lock: MutationLock::new(&config.paths.lock_file),
            lock_timeout: config.watchdog.lock_timeout(),
        }
    }

    async fn hold_lock(&self) -> Option<LockGuard> {
        match self.lock.acquire(self.lock_timeout).await {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!("{}; proceeding without the lock", e);
                None
            }
        }
    }

    /// Load the allow-all ruleset and nothing else
    pub async fn reset_firewall_only(&self) -> Result<RecoveryReport, GatewayError> {
        let _guard = self.hold_lock().await;
        self.open_firewall().await?;
        Ok(RecoveryReport {
            firewall_reset: true,
            ..Default::default()
        })
    }

    /// Stop-then-start every supervised service
    pub async fn restart_services(&self) -> Result<RecoveryReport, GatewayError> {
        let mut report = RecoveryReport::default();
        let failed = self.restart_all(&mut report).await;
        match failed {
            Some(service) => Err(ServiceError::NotActive(service).into()),
            None => Ok(report),
        }
    }

    /// Disconnect the VPN, open the firewall, restart every service and
    /// report where that left the gateway
    pub async fn full_recovery(&self) -> Result<RecoveryReport, GatewayError> {
        let guard = self.hold_lock().await;
        let mut report = RecoveryReport {
            vpn_disconnected: Some(self.disconnect_vpn().await),
            ..Default::default()
        };

        let firewall = self.open_firewall().await;
        report.firewall_reset = firewall.is_ok();
        drop(guard);

        let failed = self.restart_all(&mut report).await;
        report.status = Some(status::collect(&self.ports, &self.config).await);

        firewall?;
        match failed {
            Some(service) => Err(ServiceError::NotActive(service).into()),
            None => Ok(report),
        }
    }

    /// Disconnect the VPN and open the firewall
    pub async fn vpn_off(&self) -> Result<RecoveryReport, GatewayError> {
        let _guard = self.hold_lock().await;
        let disconnected = self.disconnect_vpn().await;
        self.open_firewall().await?;
        Ok(RecoveryReport {
            vpn_disconnected: Some(disconnected),
            firewall_reset: true,
            ..Default::default()
        })
    }

    async fn open_firewall(&self) -> Result<(), GatewayError> {
        warn!("Loading allow-all ruleset");
        if let Err(e) = self.ports.filter.apply(&allow_all()).await {
            error!("Allow-all ruleset failed: {}", e);
            return Err(e.into());
        }
        // Allow-all carries no NAT, so nothing should be routed through it
        if let Err(e) = self.ports.filter.set_forwarding(false).await {
            warn!("Could not disable forwarding: {}", e);
        }
        Ok(())
    }

    async fn disconnect_vpn(&self) -> bool {
        match self.ports.vpn.disconnect().await {
            Ok(()) => true,
            Err(e) => {
                warn!("VPN disconnect failed (ignored): {}", e);
                false
            }
        }
    }

    /// Returns the first service that did not come back
    async fn restart_all(&self, report: &mut RecoveryReport) -> Option<Service> {
        let mut failed = None;
        for service in Service::ALL {
            if let Err(e) = self.ports.services.restart(service).await {
                warn!("Restart of {} failed: {}", service, e);
            }
            let active = self.ports.services.is_active(service).await;
            if active {
                info!("{} restarted", service);
            } else {
                failed.get_or_insert(service);
            }
            report.services.insert(service.key().to_string(), active);
        }
        failed
    }
}
