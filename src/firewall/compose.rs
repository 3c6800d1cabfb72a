//! Ruleset composition per posture
//!
//! Every ruleset starts with the same head: loopback, established/related,
//! then the management rules. Mode-specific forwarding and NAT rules are
//! appended after it, so management access is already present in whatever
//! prefix of the ruleset the kernel sees.

use super::{AppliedPosture, Chain, Protocol, Rule, Ruleset, Target, Verdict};
use crate::config::NetworkConfig;
use crate::types::NetworkMode;
use std::net::Ipv4Addr;

const DNS_PORT: u16 = 53;
const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// Fixed facts about the client-facing side of the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub client_iface: String,
    pub portal_address: Ipv4Addr,
    pub ssh_port: u16,
    pub portal_port: u16,
}

impl From<&NetworkConfig> for Layout {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            client_iface: network.client_iface.clone(),
            portal_address: network.portal_address,
            ssh_port: network.ssh_port,
            portal_port: network.portal_port,
        }
    }
}

/// A mode together with the interfaces its rules are bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Posture {
    Captive,
    Internet { upstream: String },
    Vpn { upstream: String, tunnel: String },
}

impl Posture {
    pub fn mode(&self) -> NetworkMode {
        match self {
            Posture::Captive => NetworkMode::Captive,
            Posture::Internet { .. } => NetworkMode::Internet,
            Posture::Vpn { .. } => NetworkMode::Vpn,
        }
    }

    pub fn upstream(&self) -> Option<&str> {
        match self {
            Posture::Captive => None,
            Posture::Internet { upstream } | Posture::Vpn { upstream, .. } => Some(upstream),
        }
    }
}

/// Management access: SSH everywhere, DHCP/DNS/portal on the client side
pub fn management_rules(layout: &Layout) -> Vec<Rule> {
    let client = layout.client_iface.as_str();
    vec![
        Rule::new(Chain::Input, Target::Accept)
            .proto(Protocol::Tcp)
            .dport(layout.ssh_port)
            .tagged("mgmt"),
        Rule::new(Chain::Input, Target::Accept)
            .input(client)
            .proto(Protocol::Udp)
            .dport(DHCP_SERVER_PORT)
            .tagged("mgmt"),
        Rule::new(Chain::Input, Target::Accept)
            .input(client)
            .proto(Protocol::Udp)
            .dport(DNS_PORT)
            .tagged("mgmt"),
        Rule::new(Chain::Input, Target::Accept)
            .input(client)
            .proto(Protocol::Tcp)
            .dport(DNS_PORT)
            .tagged("mgmt"),
        Rule::new(Chain::Input, Target::Accept)
            .input(client)
            .proto(Protocol::Tcp)
            .dport(layout.portal_port)
            .tagged("mgmt"),
    ]
}

/// Loopback + established head, followed by the management rules
pub fn base_rules(layout: &Layout) -> Vec<Rule> {
    let mut rules = vec![
        Rule::new(Chain::Input, Target::Accept)
            .input("lo")
            .tagged("base"),
        Rule::new(Chain::Input, Target::Accept)
            .established()
            .tagged("base"),
    ];
    rules.extend(management_rules(layout));
    rules
}

/// Build the complete ruleset for a posture
pub fn compose(layout: &Layout, posture: &Posture) -> Ruleset {
    let mut ruleset = Ruleset::new(AppliedPosture::Mode(posture.mode()), Verdict::Drop);
    ruleset.extend(base_rules(layout));

    // DHCP leases for the gateway itself on its upstream links
    ruleset.push(
        Rule::new(Chain::Input, Target::Accept)
            .proto(Protocol::Udp)
            .sport(DHCP_SERVER_PORT)
            .dport(DHCP_CLIENT_PORT)
            .tagged("host"),
    );

    let client = layout.client_iface.as_str();
    match posture {
        Posture::Captive => {
            for protocol in [Protocol::Udp, Protocol::Tcp] {
                ruleset.push(
                    Rule::new(
                        Chain::Prerouting,
                        Target::Dnat {
                            to: layout.portal_address,
                            port: DNS_PORT,
                        },
                    )
                    .input(client)
                    .proto(protocol)
                    .dport(DNS_PORT)
                    .tagged("captive"),
                );
            }
            ruleset.push(
                Rule::new(
                    Chain::Prerouting,
                    Target::Dnat {
                        to: layout.portal_address,
                        port: layout.portal_port,
                    },
                )
                .input(client)
                .proto(Protocol::Tcp)
                .dport(80)
                .tagged("captive"),
            );
        }
        Posture::Internet { upstream } => {
            ruleset.extend(forward_through(client, upstream, "internet"));
        }
        Posture::Vpn { upstream, tunnel } => {
            ruleset.extend(forward_through(client, tunnel, "vpn"));
            ruleset.push(
                Rule::new(Chain::Forward, Target::Drop)
                    .input(client)
                    .output(upstream)
                    .tagged("killswitch"),
            );
            ruleset.push(
                Rule::new(Chain::Forward, Target::Drop)
                    .input(client)
                    .tagged("killswitch"),
            );
        }
    }
    ruleset
}

fn forward_through(client: &str, egress: &str, tag: &str) -> Vec<Rule> {
    vec![
        Rule::new(Chain::Forward, Target::Accept)
            .input(client)
            .output(egress)
            .tagged(tag),
        Rule::new(Chain::Forward, Target::Accept)
            .input(egress)
            .output(client)
            .established()
            .tagged(tag),
        Rule::new(Chain::Postrouting, Target::Masquerade)
            .output(egress)
            .tagged(tag),
    ]
}

/// Emergency allow-all: accept policies everywhere, empty NAT table
pub fn allow_all() -> Ruleset {
    Ruleset::new(AppliedPosture::Open, Verdict::Accept)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::from(&NetworkConfig::default())
    }

    fn postures() -> Vec<Posture> {
        vec![
            Posture::Captive,
            Posture::Internet {
                upstream: "eth0".to_string(),
            },
            Posture::Vpn {
                upstream: "eth0".to_string(),
                tunnel: "nordlynx".to_string(),
            },
        ]
    }

    fn assert_management_reachable(ruleset: &Ruleset, upstreams: &[&str]) {
        let client = "wlan1";
        assert!(ruleset.admits_input(client, Protocol::Tcp, 22));
        assert!(ruleset.admits_input(client, Protocol::Udp, 67));
        assert!(ruleset.admits_input(client, Protocol::Udp, 53));
        assert!(ruleset.admits_input(client, Protocol::Tcp, 53));
        assert!(ruleset.admits_input(client, Protocol::Tcp, 80));
        for upstream in upstreams {
            assert!(ruleset.admits_input(upstream, Protocol::Tcp, 22));
        }
    }

    #[test]
    fn test_management_reachable_in_every_posture() {
        for posture in postures() {
            let ruleset = compose(&layout(), &posture);
            assert_management_reachable(&ruleset, &["eth0", "wlan0", "nordlynx"]);
        }
        assert_management_reachable(&allow_all(), &["eth0", "wlan0"]);
    }

    #[test]
    fn test_management_precedes_mode_rules() {
        let ruleset = compose(
            &layout(),
            &Posture::Vpn {
                upstream: "eth0".to_string(),
                tunnel: "nordlynx".to_string(),
            },
        );
        let head = base_rules(&layout());
        assert_eq!(&ruleset.rules()[..head.len()], head.as_slice());
    }

    #[test]
    fn test_upstream_does_not_reach_portal_or_dns() {
        let ruleset = compose(
            &layout(),
            &Posture::Internet {
                upstream: "eth0".to_string(),
            },
        );
        assert!(!ruleset.admits_input("eth0", Protocol::Udp, 53));
        assert!(!ruleset.admits_input("eth0", Protocol::Tcp, 80));
    }

    #[test]
    fn test_captive_has_no_forwarding_path() {
        let ruleset = compose(&layout(), &Posture::Captive);
        for upstream in ["eth0", "wlan0", "nordlynx"] {
            assert!(!ruleset.permits_forward("wlan1", upstream));
            assert!(!ruleset.permits_forward(upstream, "wlan1"));
        }
        assert!(ruleset.render().contains("--to-destination 192.168.4.1:53"));
    }

    #[test]
    fn test_internet_forwards_to_selected_upstream_only() {
        let ruleset = compose(
            &layout(),
            &Posture::Internet {
                upstream: "wlan0".to_string(),
            },
        );
        assert!(ruleset.permits_forward("wlan1", "wlan0"));
        assert!(!ruleset.permits_forward("wlan1", "eth0"));
        assert!(ruleset.render().contains("-A POSTROUTING -o wlan0"));
    }

    #[test]
    fn test_vpn_kill_switch() {
        let ruleset = compose(
            &layout(),
            &Posture::Vpn {
                upstream: "eth0".to_string(),
                tunnel: "nordlynx".to_string(),
            },
        );
        assert!(ruleset.permits_forward("wlan1", "nordlynx"));
        for raw in ["eth0", "wlan0", "wlan2"] {
            assert!(!ruleset.permits_forward("wlan1", raw));
        }
        // No forward rule ever pairs the client side with the raw upstream
        // as an accept.
        assert!(!ruleset.rules().iter().any(|r| {
            r.chain == Chain::Forward
                && r.target == Target::Accept
                && (r.in_iface.as_deref() == Some("eth0") || r.out_iface.as_deref() == Some("eth0"))
        }));
        let text = ruleset.render();
        assert!(text.contains("-A POSTROUTING -o nordlynx"));
        assert!(!text.contains("-A POSTROUTING -o eth0"));
    }

    #[test]
    fn test_compose_is_deterministic() {
        for posture in postures() {
            assert_eq!(
                compose(&layout(), &posture).render(),
                compose(&layout(), &posture).render()
            );
        }
    }
}
