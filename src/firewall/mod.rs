//! Value-typed packet filter rulesets
//!
//! A [`Ruleset`] is built once per posture and handed to the packet filter
//! as a whole; nothing mutates the live tables rule by rule except the
//! idempotent management re-assertion.
//!
//! - `compose`: builds the ruleset for each posture
//! - `dns`: captive DNS redirect drop-in for the DHCP/DNS server

pub mod compose;
pub mod dns;

pub use compose::{Layout, Posture, allow_all, compose, management_rules};
pub use dns::CaptiveDns;

use crate::types::NetworkMode;
use std::fmt;
use std::net::Ipv4Addr;

/// Comment prefix on every rule this crate installs
pub const COMMENT_PREFIX: &str = "vpn-ap";
const MARKER_PREFIX: &str = "vpn-ap:posture=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Input,
    Forward,
    Output,
    Prerouting,
    Postrouting,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
            Chain::Output => "OUTPUT",
            Chain::Prerouting => "PREROUTING",
            Chain::Postrouting => "POSTROUTING",
        }
    }

    pub fn table(&self) -> Table {
        match self {
            Chain::Input | Chain::Forward | Chain::Output => Table::Filter,
            Chain::Prerouting | Chain::Postrouting => Table::Nat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Accept,
    Drop,
    Return,
    Masquerade,
    Dnat { to: Ipv4Addr, port: u16 },
}

/// Default verdict of a built-in filter chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

impl Verdict {
    fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
        }
    }
}

/// Which posture an applied ruleset belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedPosture {
    Mode(NetworkMode),
    /// Emergency allow-all
    Open,
}

impl AppliedPosture {
    pub fn label(&self) -> &'static str {
        match self {
            AppliedPosture::Mode(mode) => mode.as_str(),
            AppliedPosture::Open => "open",
        }
    }

    pub fn marker(&self) -> String {
        format!("{MARKER_PREFIX}{}", self.label())
    }

    /// Find the posture marker in `iptables -S` style output
    pub fn from_listing(listing: &str) -> Option<Self> {
        let start = listing.find(MARKER_PREFIX)? + MARKER_PREFIX.len();
        let label: String = listing[start..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        match label.as_str() {
            "open" => Some(AppliedPosture::Open),
            other => other.parse().ok().map(AppliedPosture::Mode),
        }
    }
}

impl fmt::Display for AppliedPosture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single rule in a built-in chain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub chain: Chain,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    pub protocol: Option<Protocol>,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
    /// Only matches packets of established/related connections
    pub established: bool,
    pub comment: Option<String>,
    pub target: Target,
}

impl Rule {
    pub fn new(chain: Chain, target: Target) -> Self {
        Self {
            chain,
            in_iface: None,
            out_iface: None,
            protocol: None,
            sport: None,
            dport: None,
            established: false,
            comment: None,
            target,
        }
    }

    pub fn input(mut self, iface: &str) -> Self {
        self.in_iface = Some(iface.to_string());
        self
    }

    pub fn output(mut self, iface: &str) -> Self {
        self.out_iface = Some(iface.to_string());
        self
    }

    pub fn proto(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn sport(mut self, port: u16) -> Self {
        self.sport = Some(port);
        self
    }

    pub fn dport(mut self, port: u16) -> Self {
        self.dport = Some(port);
        self
    }

    pub fn established(mut self) -> Self {
        self.established = true;
        self
    }

    pub fn tagged(mut self, tag: &str) -> Self {
        self.comment = Some(format!("{COMMENT_PREFIX}:{tag}"));
        self
    }

    /// Match/target arguments, without the `-A CHAIN` prefix
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(iface) = &self.in_iface {
            args.extend(["-i".to_string(), iface.clone()]);
        }
        if let Some(iface) = &self.out_iface {
            args.extend(["-o".to_string(), iface.clone()]);
        }
        if let Some(protocol) = self.protocol {
            args.extend(["-p".to_string(), protocol.as_str().to_string()]);
        }
        if self.established {
            args.extend(
                ["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED"].map(String::from),
            );
        }
        if let Some(port) = self.sport {
            args.extend(["--sport".to_string(), port.to_string()]);
        }
        if let Some(port) = self.dport {
            args.extend(["--dport".to_string(), port.to_string()]);
        }
        if let Some(comment) = &self.comment {
            args.extend(["-m".to_string(), "comment".to_string()]);
            args.extend(["--comment".to_string(), comment.clone()]);
        }
        match self.target {
            Target::Accept => args.extend(["-j", "ACCEPT"].map(String::from)),
            Target::Drop => args.extend(["-j", "DROP"].map(String::from)),
            Target::Return => args.extend(["-j", "RETURN"].map(String::from)),
            Target::Masquerade => args.extend(["-j", "MASQUERADE"].map(String::from)),
            Target::Dnat { to, port } => {
                args.extend(["-j".to_string(), "DNAT".to_string()]);
                args.extend(["--to-destination".to_string(), format!("{to}:{port}")]);
            }
        }
        args
    }

    fn matches_ifaces(&self, in_iface: &str, out_iface: Option<&str>) -> bool {
        let in_ok = self.in_iface.as_deref().is_none_or(|i| i == in_iface);
        let out_ok = match (self.out_iface.as_deref(), out_iface) {
            (None, _) => true,
            (Some(want), Some(have)) => want == have,
            (Some(_), None) => false,
        };
        in_ok && out_ok
    }

    /// True when the rule has no match beyond interfaces
    fn unconditional(&self) -> bool {
        self.protocol.is_none() && self.sport.is_none() && self.dport.is_none() && !self.established
    }
}

/// A complete filter + nat configuration, applied as one atomic replace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ruleset {
    posture: AppliedPosture,
    input_policy: Verdict,
    forward_policy: Verdict,
    rules: Vec<Rule>,
}

impl Ruleset {
    pub fn new(posture: AppliedPosture, policy: Verdict) -> Self {
        Self {
            posture,
            input_policy: policy,
            forward_policy: policy,
            rules: Vec::new(),
        }
    }

    pub fn posture(&self) -> AppliedPosture {
        self.posture
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn extend(&mut self, rules: impl IntoIterator<Item = Rule>) {
        self.rules.extend(rules);
    }

    pub fn contains(&self, rule: &Rule) -> bool {
        self.rules.contains(rule)
    }

    /// Insert any missing rule at the head of its chain, keeping the
    /// given order. Returns how many were inserted.
    pub fn ensure_rules(&mut self, rules: &[Rule]) -> usize {
        let mut inserted = 0;
        for rule in rules.iter().rev() {
            if !self.contains(rule) {
                self.rules.insert(0, rule.clone());
                inserted += 1;
            }
        }
        inserted
    }

    fn chain_rules(&self, chain: Chain) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.chain == chain)
    }

    /// Can any packet from `in_iface` be forwarded out of `out_iface`?
    pub fn permits_forward(&self, in_iface: &str, out_iface: &str) -> bool {
        for rule in self.chain_rules(Chain::Forward) {
            if !rule.matches_ifaces(in_iface, Some(out_iface)) {
                continue;
            }
            match rule.target {
                Target::Accept => return true,
                Target::Drop if rule.unconditional() => return false,
                _ => {}
            }
        }
        self.forward_policy == Verdict::Accept
    }

    /// Would a new connection to `port` arriving on `iface` be accepted?
    pub fn admits_input(&self, iface: &str, protocol: Protocol, port: u16) -> bool {
        for rule in self.chain_rules(Chain::Input) {
            if rule.established || !rule.matches_ifaces(iface, None) {
                continue;
            }
            if rule.protocol.is_some_and(|p| p != protocol)
                || rule.dport.is_some_and(|p| p != port)
                || rule.sport.is_some()
            {
                continue;
            }
            match rule.target {
                Target::Accept => return true,
                Target::Drop => return false,
                _ => {}
            }
        }
        self.input_policy == Verdict::Accept
    }

    /// Render as `iptables-restore` input. Every table listed is flushed
    /// and replaced in one commit.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("*filter\n");
        out.push_str(&format!(":INPUT {} [0:0]\n", self.input_policy.as_str()));
        out.push_str(&format!(":FORWARD {} [0:0]\n", self.forward_policy.as_str()));
        out.push_str(":OUTPUT ACCEPT [0:0]\n");
        self.render_table(&mut out, Table::Filter);
        out.push_str(&format!(
            "-A OUTPUT -m comment --comment {} -j RETURN\n",
            self.posture.marker()
        ));
        out.push_str("COMMIT\n");
        out.push_str("*nat\n");
        for chain in ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"] {
            out.push_str(&format!(":{chain} ACCEPT [0:0]\n"));
        }
        self.render_table(&mut out, Table::Nat);
        out.push_str("COMMIT\n");
        out
    }

    fn render_table(&self, out: &mut String, table: Table) {
        for rule in self.rules.iter().filter(|r| r.chain.table() == table) {
            out.push_str("-A ");
            out.push_str(rule.chain.as_str());
            for arg in rule.args() {
                out.push(' ');
                out.push_str(&arg);
            }
            out.push('\n');
        }
    }
}
