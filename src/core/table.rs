//! In-memory index of every rule meshfw has installed
//!
//! Nesting is rule-table kind → server → client key → [`PeerRuleIndex`], and
//! inside the index peer key → [`RuleGroup`]. The table never talks to the
//! backend and never interprets rules; [`crate::core::manager::RoutingManager`]
//! owns it behind its lock and is the only writer.

use crate::core::error::{Error, Result};
use crate::core::rule::{Family, Rule, RuleGroup};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Logical rule-table namespace. Only ingress routing exists today.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum RuleTableKind {
    #[strum(serialize = "ingress")]
    Ingress,
}

/// Rule groups recorded for one client, keyed by peer key.
///
/// Every rule stored here matches addresses of `family` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRuleIndex {
    family: Family,
    groups: BTreeMap<String, RuleGroup>,
}

impl PeerRuleIndex {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            groups: BTreeMap::new(),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Replaces the group recorded under `peer_key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::FamilyMismatch` if any rule matches an address of the
    /// other family; the index is left unchanged.
    pub fn insert_group(&mut self, peer_key: impl Into<String>, group: RuleGroup) -> Result<()> {
        let peer_key = peer_key.into();
        if let Some(addr) = group
            .iter()
            .flat_map(Rule::addresses)
            .find(|addr| Family::of(addr) != self.family)
        {
            return Err(Error::FamilyMismatch {
                key: peer_key,
                expected: self.family,
                actual: Family::of(&addr),
            });
        }
        self.groups.insert(peer_key, group);
        Ok(())
    }

    pub fn group(&self, peer_key: &str) -> Option<&RuleGroup> {
        self.groups.get(peer_key)
    }

    pub fn remove_group(&mut self, peer_key: &str) -> Option<RuleGroup> {
        self.groups.remove(peer_key)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &RuleGroup)> {
        self.groups.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// All rules across all groups, in peer-key order.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.groups.values().flatten()
    }

    pub fn rule_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Client key → rules recorded for that client, for one server.
pub type ServerRules = HashMap<String, PeerRuleIndex>;

/// Every rule recorded per server, per rule-table kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleTable {
    tables: HashMap<RuleTableKind, HashMap<String, ServerRules>>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the server's rules, or an empty map. Never mutates the table.
    pub fn fetch(&self, kind: RuleTableKind, server: &str) -> ServerRules {
        self.tables
            .get(&kind)
            .and_then(|servers| servers.get(server))
            .cloned()
            .unwrap_or_default()
    }

    /// Replaces the stored rules for the server wholesale.
    pub fn save(&mut self, kind: RuleTableKind, server: &str, rules: ServerRules) {
        self.tables
            .entry(kind)
            .or_default()
            .insert(server.to_string(), rules);
    }

    pub fn lookup(&self, kind: RuleTableKind, server: &str, client: &str) -> Option<&PeerRuleIndex> {
        self.tables.get(&kind)?.get(server)?.get(client)
    }

    pub fn remove(
        &mut self,
        kind: RuleTableKind,
        server: &str,
        client: &str,
    ) -> Option<PeerRuleIndex> {
        self.tables.get_mut(&kind)?.get_mut(server)?.remove(client)
    }

    /// Drops everything recorded for the server.
    pub fn drop_server(&mut self, kind: RuleTableKind, server: &str) -> Option<ServerRules> {
        self.tables.get_mut(&kind)?.remove(server)
    }

    pub fn servers(&self, kind: RuleTableKind) -> Vec<String> {
        let mut servers: Vec<String> = self
            .tables
            .get(&kind)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        servers.sort();
        servers
    }
}
