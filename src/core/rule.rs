//! Low-level rule data structures
//!
//! A [`Rule`] is one concrete iptables instruction: the table it lives in, the
//! chain it is inserted into, and the ordered match/target arguments. Rules are
//! compared structurally, so the same triple always names the same rule on the
//! host.
//!
//! [`ChainLayout`] knows the node's VPN interface and custom chain names and
//! builds every rule meshfw ever installs:
//!
//! - static jump rules wiring `FORWARD`/`POSTROUTING` into the custom chains
//! - per-peer `ACCEPT` rules in the custom filter chain
//! - per-client `MASQUERADE` rules in the custom NAT chain
//!
//! # Example
//!
//! ```
//! use meshfw::core::rule::{ChainLayout, PeerAddress, Table};
//!
//! let layout = ChainLayout::new("meshvpn0", "meshfwfilter", "meshfwnat");
//! let client: PeerAddress = "10.24.52.252/32".parse().unwrap();
//! let peer: PeerAddress = "10.24.52.1".parse().unwrap();
//!
//! let rule = layout.session_allow_rule(&client, &peer);
//! assert_eq!(rule.table, Table::Filter);
//! assert_eq!(rule.args, ["-s", "10.24.52.252/32", "-d", "10.24.52.1/32", "-j", "ACCEPT"]);
//! ```

use crate::core::error::{Error, Result};
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Built-in filter chain that carries routed traffic
pub const FORWARD_CHAIN: &str = "FORWARD";

/// Built-in NAT chain evaluated after routing
pub const POSTROUTING_CHAIN: &str = "POSTROUTING";

/// Default custom filter chain name
pub const DEFAULT_FILTER_CHAIN: &str = "meshfwfilter";

/// Default custom NAT chain name
pub const DEFAULT_NAT_CHAIN: &str = "meshfwnat";

/// Address family, selecting the iptables or ip6tables backend
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[strum(serialize = "ipv4")]
    V4,
    #[strum(serialize = "ipv6")]
    V6,
}

impl Family {
    /// Name of the backend binary for this family
    pub const fn binary(self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }

    pub const fn of(network: &IpNetwork) -> Self {
        match network {
            IpNetwork::V4(_) => Family::V4,
            IpNetwork::V6(_) => Family::V6,
        }
    }
}

/// iptables table a rule belongs to
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
}

impl Table {
    /// Chains the kernel creates for this table; these are never flushed or deleted.
    pub const fn builtin_chains(self) -> &'static [&'static str] {
        match self {
            Table::Filter => &["INPUT", "FORWARD", "OUTPUT"],
            Table::Nat => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
        }
    }
}

/// Where a rule lands in its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Insert at position 1, ahead of everything already in the chain
    Top,
    /// Append after everything already in the chain
    Bottom,
}

/// One concrete low-level rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub table: Table,
    pub chain: String,
    pub args: Vec<String>,
}

impl Rule {
    pub fn new<I, S>(table: Table, chain: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table,
            chain: chain.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Addresses this rule matches on (`-s` / `-d` operands).
    pub fn addresses(&self) -> impl Iterator<Item = IpNetwork> + '_ {
        self.args
            .windows(2)
            .filter(|pair| pair[0] == "-s" || pair[0] == "-d")
            .filter_map(|pair| pair[1].parse().ok())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {} {}", self.table, self.chain, self.args.join(" "))
    }
}

/// Rules installed on behalf of one (client, peer) relationship
pub type RuleGroup = Vec<Rule>;

/// A VPN address with its prefix, normalized so IPv4-mapped IPv6 is plain IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(IpNetwork);

impl PeerAddress {
    pub fn parse(value: &str) -> Result<Self> {
        let network: IpNetwork = value
            .trim()
            .parse()
            .map_err(|e: ipnetwork::IpNetworkError| Error::InvalidAddress {
                value: value.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self(unmap(network)))
    }

    pub fn family(&self) -> Family {
        Family::of(&self.0)
    }

    pub fn network(&self) -> IpNetwork {
        self.0
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn unmap(network: IpNetwork) -> IpNetwork {
    if let IpNetwork::V6(v6) = network
        && v6.prefix() >= 96
        && let Some(v4) = v6.ip().to_ipv4_mapped()
        && let Ok(mapped) = Ipv4Network::new(v4, v6.prefix() - 96)
    {
        return IpNetwork::V4(mapped);
    }
    network
}

/// Interface and chain names for one node, and the rules derived from them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLayout {
    pub interface: String,
    pub filter_chain: String,
    pub nat_chain: String,
}

impl ChainLayout {
    pub fn new(
        interface: impl Into<String>,
        filter_chain: impl Into<String>,
        nat_chain: impl Into<String>,
    ) -> Self {
        Self {
            interface: interface.into(),
            filter_chain: filter_chain.into(),
            nat_chain: nat_chain.into(),
        }
    }

    /// Jump into the custom filter chain, then its drop and return tail.
    ///
    /// Appended in this order; per-peer allow rules are inserted at the top
    /// of the custom chain so they always precede the drop.
    pub fn filter_jump_rules(&self) -> [Rule; 3] {
        let iface = self.interface.as_str();
        [
            Rule::new(
                Table::Filter,
                FORWARD_CHAIN,
                ["-i", iface, "-j", self.filter_chain.as_str()],
            ),
            Rule::new(Table::Filter, &self.filter_chain, ["-i", iface, "-j", "DROP"]),
            Rule::new(
                Table::Filter,
                &self.filter_chain,
                ["-i", iface, "-j", "RETURN"],
            ),
        ]
    }

    pub fn nat_jump_rules(&self) -> [Rule; 2] {
        [
            Rule::new(
                Table::Nat,
                POSTROUTING_CHAIN,
                ["-o", self.interface.as_str(), "-j", self.nat_chain.as_str()],
            ),
            Rule::new(Table::Nat, &self.nat_chain, ["-j", "RETURN"]),
        ]
    }

    /// Every static jump rule, filter set first.
    pub fn jump_rules(&self) -> Vec<Rule> {
        let mut rules = Vec::with_capacity(5);
        rules.extend(self.filter_jump_rules());
        rules.extend(self.nat_jump_rules());
        rules
    }

    /// Custom chains owned by meshfw, per table
    pub fn custom_chains(&self) -> [(Table, &str); 2] {
        [
            (Table::Filter, self.filter_chain.as_str()),
            (Table::Nat, self.nat_chain.as_str()),
        ]
    }

    /// Allow traffic towards a single peer.
    pub fn peer_allow_rule(&self, peer: &PeerAddress) -> Rule {
        Rule::new(
            Table::Filter,
            &self.filter_chain,
            ["-d".to_string(), peer.to_string(), "-j".into(), "ACCEPT".into()],
        )
    }

    /// Allow traffic from a client to one of its authorized peers.
    pub fn session_allow_rule(&self, client: &PeerAddress, peer: &PeerAddress) -> Rule {
        Rule::new(
            Table::Filter,
            &self.filter_chain,
            [
                "-s".to_string(),
                client.to_string(),
                "-d".into(),
                peer.to_string(),
                "-j".into(),
                "ACCEPT".into(),
            ],
        )
    }

    /// Masquerade the client in both directions over the VPN interface.
    pub fn masquerade_rules(&self, client: &PeerAddress) -> [Rule; 2] {
        let masquerade = |direction: &str| {
            Rule::new(
                Table::Nat,
                &self.nat_chain,
                [
                    direction.to_string(),
                    client.to_string(),
                    "-o".into(),
                    self.interface.clone(),
                    "-j".into(),
                    "MASQUERADE".into(),
                ],
            )
        };
        [masquerade("-s"), masquerade("-d")]
    }
}
