//! Linux implementations: iptables, systemd, iproute2/NetworkManager and
//! the VPN client tools

use crate::config::{Config, ServiceUnits};
use crate::firewall::{AppliedPosture, Rule, Ruleset};
use crate::ports::{
    CommandError, CommandRunner, FilterError, LinkControl, LinkError, LinkProbe, PacketFilter,
    Ports, ServiceError, ServiceSupervisor, VpnClient, VpnError, VpnStatus,
};
use crate::state::now_epoch;
use crate::types::{Service, VpnMethod, WifiCredentials};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;

/// A WireGuard peer with no handshake for this long is considered down
const HANDSHAKE_FRESHNESS_SECS: u64 = 180;

pub(crate) fn ports(config: &Config) -> Ports<IptablesFilter, SystemdSupervisor, SystemLinks, SystemVpn> {
    let runner = CommandRunner::new(config.watchdog.command_timeout());
    Ports::new(
        IptablesFilter::new(runner.clone()),
        SystemdSupervisor::new(runner.clone(), config.services.clone()),
        SystemLinks::new(runner.clone(), config.watchdog.wifi_timeout()),
        SystemVpn::new(runner, config.vpn.method, &config.vpn.interface),
    )
}

pub struct IptablesFilter {
    runner: CommandRunner,
}

impl IptablesFilter {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

impl PacketFilter for IptablesFilter {
    async fn apply(&self, ruleset: &Ruleset) -> Result<(), FilterError> {
        let text = ruleset.render();
        debug!("iptables-restore input:\n{}", text);
        match self
            .runner
            .run_with_stdin("iptables-restore", &["-w"], &text)
            .await
        {
            Ok(_) => Ok(()),
            Err(CommandError::Failed { stderr, .. }) => Err(FilterError::Rejected(stderr)),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_forwarding(&self, enabled: bool) -> Result<(), FilterError> {
        let setting = if enabled {
            "net.ipv4.ip_forward=1"
        } else {
            "net.ipv4.ip_forward=0"
        };
        self.runner.run("sysctl", &["-q", "-w", setting]).await?;
        Ok(())
    }

    async fn ensure_rules(&self, rules: &[Rule]) -> Result<usize, FilterError> {
        let mut inserted = 0;
        // Inserting at position 1 in reverse keeps the given order at the head
        for rule in rules.iter().rev() {
            let table = rule.chain.table().as_str();
            let chain = rule.chain.as_str();
            let spec = rule.args();

            let mut check = vec!["-w", "-t", table, "-C", chain];
            check.extend(spec.iter().map(String::as_str));
            if self.runner.succeeds("iptables", &check).await {
                continue;
            }

            let mut insert = vec!["-w", "-t", table, "-I", chain, "1"];
            insert.extend(spec.iter().map(String::as_str));
            self.runner.run("iptables", &insert).await?;
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn query(&self) -> Result<Option<AppliedPosture>, FilterError> {
        let output = self.runner.run("iptables", &["-w", "-S", "OUTPUT"]).await?;
        Ok(AppliedPosture::from_listing(&output.stdout))
    }
}

pub struct SystemdSupervisor {
    runner: CommandRunner,
    units: ServiceUnits,
}

impl SystemdSupervisor {
    pub fn new(runner: CommandRunner, units: ServiceUnits) -> Self {
        Self { runner, units }
    }

    fn unit(&self, service: Service) -> &str {
        match service {
            Service::AccessPoint => &self.units.access_point,
            Service::DhcpDns => &self.units.dhcp_dns,
            Service::Portal => &self.units.portal,
        }
    }
}

impl ServiceSupervisor for SystemdSupervisor {
    async fn is_active(&self, service: Service) -> bool {
        self.runner
            .succeeds("systemctl", &["is-active", "--quiet", self.unit(service)])
            .await
    }

    async fn start(&self, service: Service) -> Result<(), ServiceError> {
        self.runner
            .run("systemctl", &["start", self.unit(service)])
            .await?;
        Ok(())
    }

    async fn stop(&self, service: Service) -> Result<(), ServiceError> {
        self.runner
            .run("systemctl", &["stop", self.unit(service)])
            .await?;
        Ok(())
    }
}

pub struct SystemLinks {
    runner: CommandRunner,
    wifi_timeout: Duration,
}

impl SystemLinks {
    pub fn new(runner: CommandRunner, wifi_timeout: Duration) -> Self {
        Self {
            runner,
            wifi_timeout,
        }
    }
}

/// Interface carrying the first default route in `ip route` output
pub fn parse_default_route(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.starts_with("default"))
        .find_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|w| *w == "dev")?;
            words.next().map(String::from)
        })
}

/// First IPv4 address in `ip -4 -o addr show` output
pub fn parse_ipv4_address(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        words.find(|w| *w == "inet")?;
        words.next()?.split('/').next()?.parse().ok()
    })
}

impl LinkProbe for SystemLinks {
    async fn is_up(&self, iface: &str) -> bool {
        let path = format!("/sys/class/net/{iface}/operstate");
        match tokio::fs::read_to_string(&path).await {
            // Tunnels and some drivers never report "up"
            Ok(state) => matches!(state.trim(), "up" | "unknown"),
            Err(_) => false,
        }
    }

    async fn has_address(&self, iface: &str) -> bool {
        self.address(iface).await.is_some()
    }

    async fn default_route_interface(&self) -> Option<String> {
        match self.runner.run("ip", &["-4", "route", "show", "default"]).await {
            Ok(output) => parse_default_route(&output.stdout),
            Err(e) => {
                debug!("{}", e);
                None
            }
        }
    }

    async fn address(&self, iface: &str) -> Option<Ipv4Addr> {
        match self
            .runner
            .run("ip", &["-4", "-o", "addr", "show", "dev", iface])
            .await
        {
            Ok(output) => parse_ipv4_address(&output.stdout),
            Err(e) => {
                debug!("{}", e);
                None
            }
        }
    }
}

impl LinkControl for SystemLinks {
    async fn bring_up(&self, iface: &str) -> Result<(), LinkError> {
        self.runner
            .run("ip", &["link", "set", "dev", iface, "up"])
            .await?;
        self.runner.run("nmcli", &["device", "connect", iface]).await?;
        Ok(())
    }

    async fn rescan(&self, iface: &str) -> Result<(), LinkError> {
        // Only meaningful on wireless links
        if !self
            .runner
            .succeeds("nmcli", &["device", "wifi", "rescan", "ifname", iface])
            .await
        {
            debug!("No rescan on {}", iface);
        }
        Ok(())
    }

    async fn reconnect(
        &self,
        iface: &str,
        wifi: Option<&WifiCredentials>,
    ) -> Result<(), LinkError> {
        let Some(creds) = wifi else {
            self.runner.run("nmcli", &["device", "connect", iface]).await?;
            return Ok(());
        };

        let wait = self.wifi_timeout.as_secs().to_string();
        let mut args = vec![
            "--wait",
            wait.as_str(),
            "device",
            "wifi",
            "connect",
            creds.ssid.as_str(),
        ];
        if let Some(secret) = creds.secret.as_deref() {
            args.extend(["password", secret]);
        }
        args.extend(["ifname", iface]);

        // nmcli enforces --wait itself; leave it a little headroom
        self.runner
            .with_timeout(self.wifi_timeout + Duration::from_secs(5))
            .run("nmcli", &args)
            .await?;
        Ok(())
    }

    async fn reset(&self, iface: &str) -> Result<(), LinkError> {
        self.runner
            .run("ip", &["link", "set", "dev", iface, "down"])
            .await?;
        self.runner
            .run("ip", &["link", "set", "dev", iface, "up"])
            .await?;
        Ok(())
    }

    async fn disconnect(&self, iface: &str) -> Result<(), LinkError> {
        self.runner
            .run("nmcli", &["device", "disconnect", iface])
            .await?;
        Ok(())
    }

    async fn assign_address(
        &self,
        iface: &str,
        address: Ipv4Addr,
        prefix: u8,
    ) -> Result<(), LinkError> {
        let cidr = format!("{address}/{prefix}");
        self.runner
            .run("ip", &["addr", "replace", cidr.as_str(), "dev", iface])
            .await?;
        self.runner
            .run("ip", &["link", "set", "dev", iface, "up"])
            .await?;
        Ok(())
    }
}

/// Does `nordvpn status` report a live session?
pub fn parse_provider_status(output: &str) -> bool {
    output.lines().any(|line| {
        let line = line.trim().trim_start_matches(|c: char| !c.is_ascii_alphabetic());
        line.strip_prefix("Status:")
            .is_some_and(|rest| rest.trim().eq_ignore_ascii_case("connected"))
    })
}

/// Is any handshake in `wg show <iface> latest-handshakes` recent enough?
pub fn handshake_is_fresh(output: &str, now: u64) -> bool {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1)?.parse::<u64>().ok())
        .any(|at| at > 0 && now.saturating_sub(at) <= HANDSHAKE_FRESHNESS_SECS)
}

pub struct SystemVpn {
    runner: CommandRunner,
    method: VpnMethod,
    interface: String,
}

impl SystemVpn {
    pub fn new(runner: CommandRunner, method: VpnMethod, interface: &str) -> Self {
        Self {
            runner,
            method,
            interface: interface.to_string(),
        }
    }

    /// wg-quick config name for a hint; "auto" means the configured one
    fn tunnel_config<'a>(&'a self, hint: &'a str) -> &'a str {
        if hint.is_empty() || hint == "auto" {
            &self.interface
        } else {
            hint
        }
    }

    async fn active_tunnels(&self) -> Result<Vec<String>, VpnError> {
        let output = self.runner.run("wg", &["show", "interfaces"]).await?;
        Ok(output.stdout.split_whitespace().map(String::from).collect())
    }
}

impl VpnClient for SystemVpn {
    fn method(&self) -> VpnMethod {
        self.method
    }

    async fn connect(&self, hint: &str) -> Result<(), VpnError> {
        match self.method {
            VpnMethod::ProviderCli => {
                let mut args = vec!["connect"];
                if !hint.is_empty() && hint != "auto" {
                    args.push(hint);
                }
                self.runner.run("nordvpn", &args).await?;
            }
            VpnMethod::ProtocolTunnel => {
                for active in self.active_tunnels().await.unwrap_or_default() {
                    if let Err(e) = self.runner.run("wg-quick", &["down", active.as_str()]).await {
                        debug!("wg-quick down {} failed: {}", active, e);
                    }
                }
                self.runner
                    .run("wg-quick", &["up", self.tunnel_config(hint)])
                    .await?;
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), VpnError> {
        match self.method {
            VpnMethod::ProviderCli => {
                self.runner.run("nordvpn", &["disconnect"]).await?;
            }
            VpnMethod::ProtocolTunnel => {
                for active in self.active_tunnels().await? {
                    self.runner.run("wg-quick", &["down", active.as_str()]).await?;
                }
            }
        }
        Ok(())
    }

    async fn status(&self) -> Result<VpnStatus, VpnError> {
        match self.method {
            VpnMethod::ProviderCli => {
                let output = self.runner.run("nordvpn", &["status"]).await?;
                if parse_provider_status(&output.stdout) {
                    Ok(VpnStatus {
                        connected: true,
                        interface: Some(self.interface.clone()),
                    })
                } else {
                    Ok(VpnStatus::disconnected())
                }
            }
            VpnMethod::ProtocolTunnel => {
                let Some(iface) = self.active_tunnels().await?.into_iter().next() else {
                    return Ok(VpnStatus::disconnected());
                };
                let output = self
                    .runner
                    .run("wg", &["show", iface.as_str(), "latest-handshakes"])
                    .await?;
                if handshake_is_fresh(&output.stdout, now_epoch()) {
                    Ok(VpnStatus {
                        connected: true,
                        interface: Some(iface),
                    })
                } else {
                    Ok(VpnStatus::disconnected())
                }
            }
        }
    }
}
