//! In-memory port fakes for unit tests

use crate::config::{Config, UpstreamCandidate};
use crate::firewall::{AppliedPosture, Rule, Ruleset, allow_all};
use crate::ports::{
    FilterError, LinkControl, LinkError, LinkProbe, PacketFilter, Ports, ServiceError,
    ServiceSupervisor, VpnClient, VpnError, VpnStatus,
};
use crate::types::{Service, UpstreamKind, VpnMethod, WifiCredentials};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Mutex;

/// Config pointing every file into `dir`, with no settle delays
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.paths.state_file = dir.join("state.json");
    config.paths.lock_file = dir.join("firewall.lock");
    config.paths.dns_redirect_file = dir.join("dnsmasq.d").join("captive-portal.conf");
    config.vpn.settle_secs = 0;
    config.watchdog.link_settle_secs = 0;
    config.watchdog.lock_timeout_secs = 1;
    config.network.upstream_candidates = vec![
        UpstreamCandidate {
            iface: "eth0".to_string(),
            kind: UpstreamKind::Ethernet,
        },
        UpstreamCandidate {
            iface: "wlan0".to_string(),
            kind: UpstreamKind::Wifi,
        },
    ];
    config
}

pub type FakePorts = Ports<FakeFilter, FakeServices, FakeLinks, FakeVpn>;

pub fn fake_ports() -> FakePorts {
    Ports::new(
        FakeFilter::default(),
        FakeServices::default(),
        FakeLinks::default(),
        FakeVpn::new("nordlynx"),
    )
}

#[derive(Default)]
struct FilterState {
    current: Option<Ruleset>,
    history: Vec<Ruleset>,
    forwarding: bool,
    fail_apply: bool,
    fail_forwarding: bool,
}

#[derive(Default)]
pub struct FakeFilter {
    state: Mutex<FilterState>,
}

impl FakeFilter {
    pub fn current(&self) -> Option<Ruleset> {
        self.state.lock().unwrap().current.clone()
    }

    /// Every ruleset successfully applied, in order
    pub fn history(&self) -> Vec<Ruleset> {
        self.state.lock().unwrap().history.clone()
    }

    pub fn forwarding(&self) -> bool {
        self.state.lock().unwrap().forwarding
    }

    pub fn fail_apply(&self, fail: bool) {
        self.state.lock().unwrap().fail_apply = fail;
    }

    pub fn fail_forwarding(&self, fail: bool) {
        self.state.lock().unwrap().fail_forwarding = fail;
    }

    /// Pretend something outside the crate loaded (or flushed) the tables
    pub fn install(&self, ruleset: Option<Ruleset>) {
        self.state.lock().unwrap().current = ruleset;
    }
}

impl PacketFilter for FakeFilter {
    async fn apply(&self, ruleset: &Ruleset) -> Result<(), FilterError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_apply {
            return Err(FilterError::Rejected("simulated failure".to_string()));
        }
        state.current = Some(ruleset.clone());
        state.history.push(ruleset.clone());
        Ok(())
    }

    async fn set_forwarding(&self, enabled: bool) -> Result<(), FilterError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_forwarding {
            return Err(FilterError::Rejected("simulated sysctl failure".to_string()));
        }
        state.forwarding = enabled;
        Ok(())
    }

    async fn ensure_rules(&self, rules: &[Rule]) -> Result<usize, FilterError> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .current
            .get_or_insert_with(allow_all)
            .ensure_rules(rules))
    }

    async fn query(&self) -> Result<Option<AppliedPosture>, FilterError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .map(Ruleset::posture))
    }
}

#[derive(Default)]
struct ServicesState {
    down: HashSet<Service>,
    stuck: HashSet<Service>,
    starts: Vec<Service>,
    stops: Vec<Service>,
}

/// Services are healthy unless marked down; a stuck service never comes back
#[derive(Default)]
pub struct FakeServices {
    state: Mutex<ServicesState>,
}

impl FakeServices {
    pub fn set_down(&self, service: Service) {
        self.state.lock().unwrap().down.insert(service);
    }

    pub fn set_stuck(&self, service: Service) {
        let mut state = self.state.lock().unwrap();
        state.down.insert(service);
        state.stuck.insert(service);
    }

    pub fn starts(&self, service: Service) -> usize {
        let state = self.state.lock().unwrap();
        state.starts.iter().filter(|s| **s == service).count()
    }

    pub fn stops(&self, service: Service) -> usize {
        let state = self.state.lock().unwrap();
        state.stops.iter().filter(|s| **s == service).count()
    }
}

impl ServiceSupervisor for FakeServices {
    async fn is_active(&self, service: Service) -> bool {
        !self.state.lock().unwrap().down.contains(&service)
    }

    async fn start(&self, service: Service) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.starts.push(service);
        if state.stuck.contains(&service) {
            return Err(ServiceError::NotActive(service));
        }
        state.down.remove(&service);
        Ok(())
    }

    async fn stop(&self, service: Service) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.stops.push(service);
        state.down.insert(service);
        Ok(())
    }
}

#[derive(Default)]
struct LinksState {
    up: HashSet<String>,
    addressed: HashSet<String>,
    default_route: Option<String>,
    actions: Vec<String>,
    /// iface -> number of completed bring-up/reconnect tiers before it heals
    heal_after: HashMap<String, usize>,
    completed: HashMap<String, usize>,
    associations: Vec<WifiCredentials>,
}

#[derive(Default)]
pub struct FakeLinks {
    state: Mutex<LinksState>,
}

impl FakeLinks {
    /// Link up with an address and the default route
    pub fn connect(&self, iface: &str) {
        let mut state = self.state.lock().unwrap();
        state.up.insert(iface.to_string());
        state.addressed.insert(iface.to_string());
        state.default_route = Some(iface.to_string());
    }

    pub fn drop_link(&self, iface: &str) {
        let mut state = self.state.lock().unwrap();
        state.up.remove(iface);
        state.addressed.remove(iface);
        if state.default_route.as_deref() == Some(iface) {
            state.default_route = None;
        }
    }

    /// Mark the client-facing side (or any iface) as addressed
    pub fn address(&self, iface: &str) {
        let mut state = self.state.lock().unwrap();
        state.up.insert(iface.to_string());
        state.addressed.insert(iface.to_string());
    }

    pub fn unaddress(&self, iface: &str) {
        self.state.lock().unwrap().addressed.remove(iface);
    }

    pub fn set_default_route(&self, iface: Option<&str>) {
        self.state.lock().unwrap().default_route = iface.map(String::from);
    }

    /// Heal `iface` after `tiers` recovery tiers complete
    pub fn heal_after(&self, iface: &str, tiers: usize) {
        self.state
            .lock()
            .unwrap()
            .heal_after
            .insert(iface.to_string(), tiers);
    }

    pub fn actions(&self) -> Vec<String> {
        self.state.lock().unwrap().actions.clone()
    }

    pub fn associations(&self) -> Vec<WifiCredentials> {
        self.state.lock().unwrap().associations.clone()
    }

    fn record(&self, action: &str, iface: &str, completes_tier: bool) {
        let mut state = self.state.lock().unwrap();
        state.actions.push(format!("{action}:{iface}"));
        if !completes_tier {
            return;
        }
        let done = {
            let count = state.completed.entry(iface.to_string()).or_default();
            *count += 1;
            *count
        };
        if state.heal_after.get(iface).is_some_and(|n| done >= *n) {
            state.up.insert(iface.to_string());
            state.addressed.insert(iface.to_string());
            if state.default_route.is_none() {
                state.default_route = Some(iface.to_string());
            }
        }
    }
}

impl LinkProbe for FakeLinks {
    async fn is_up(&self, iface: &str) -> bool {
        self.state.lock().unwrap().up.contains(iface)
    }

    async fn has_address(&self, iface: &str) -> bool {
        self.state.lock().unwrap().addressed.contains(iface)
    }

    async fn default_route_interface(&self) -> Option<String> {
        self.state.lock().unwrap().default_route.clone()
    }

    async fn address(&self, iface: &str) -> Option<Ipv4Addr> {
        self.state
            .lock()
            .unwrap()
            .addressed
            .contains(iface)
            .then_some(Ipv4Addr::new(10, 0, 0, 2))
    }
}

impl LinkControl for FakeLinks {
    async fn bring_up(&self, iface: &str) -> Result<(), LinkError> {
        self.record("bring_up", iface, true);
        Ok(())
    }

    async fn rescan(&self, iface: &str) -> Result<(), LinkError> {
        self.record("rescan", iface, false);
        Ok(())
    }

    async fn reconnect(
        &self,
        iface: &str,
        wifi: Option<&WifiCredentials>,
    ) -> Result<(), LinkError> {
        if let Some(creds) = wifi {
            self.state.lock().unwrap().associations.push(creds.clone());
        }
        self.record("reconnect", iface, true);
        Ok(())
    }

    async fn reset(&self, iface: &str) -> Result<(), LinkError> {
        self.record("reset", iface, false);
        Ok(())
    }

    async fn disconnect(&self, iface: &str) -> Result<(), LinkError> {
        self.record("disconnect", iface, false);
        Ok(())
    }

    async fn assign_address(
        &self,
        iface: &str,
        _address: Ipv4Addr,
        _prefix: u8,
    ) -> Result<(), LinkError> {
        self.record("assign_address", iface, false);
        self.state
            .lock()
            .unwrap()
            .addressed
            .insert(iface.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct VpnState {
    connected: bool,
    /// hint -> attempt number (1-based) on which connect succeeds
    succeed_on: HashMap<String, u32>,
    per_hint: HashMap<String, u32>,
    attempts: Vec<String>,
    disconnects: u32,
}

pub struct FakeVpn {
    interface: String,
    state: Mutex<VpnState>,
}

impl FakeVpn {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            state: Mutex::new(VpnState::default()),
        }
    }

    /// `hint` connects on its `attempt`-th try; other hints never connect
    pub fn succeed_on(&self, hint: &str, attempt: u32) {
        self.state
            .lock()
            .unwrap()
            .succeed_on
            .insert(hint.to_string(), attempt);
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().unwrap().connected = connected;
    }

    pub fn attempts(&self) -> Vec<String> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn disconnects(&self) -> u32 {
        self.state.lock().unwrap().disconnects
    }
}

impl VpnClient for FakeVpn {
    fn method(&self) -> VpnMethod {
        VpnMethod::ProviderCli
    }

    async fn connect(&self, hint: &str) -> Result<(), VpnError> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push(hint.to_string());
        let tries = {
            let count = state.per_hint.entry(hint.to_string()).or_default();
            *count += 1;
            *count
        };
        if state.succeed_on.get(hint).is_some_and(|n| tries >= *n) {
            state.connected = true;
            Ok(())
        } else {
            Err(VpnError::NotConnected)
        }
    }

    async fn disconnect(&self) -> Result<(), VpnError> {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }

    async fn status(&self) -> Result<VpnStatus, VpnError> {
        let connected = self.state.lock().unwrap().connected;
        Ok(VpnStatus {
            connected,
            interface: connected.then(|| self.interface.clone()),
        })
    }
}
