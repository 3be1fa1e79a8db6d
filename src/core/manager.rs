//! Routing rule manager
//!
//! [`RoutingManager`] turns authorization events into concrete rules, drives
//! the per-family [`RuleActuator`]s, and records what it installed in the
//! [`RuleTable`] so any subset can be removed later without re-deriving it.
//!
//! # Consistency
//!
//! One `tokio::sync::Mutex` guards the rule table and is held across every
//! backend call an operation makes, so concurrent authorization handlers are
//! fully serialized and nobody observes a half-updated table.
//!
//! # Failure policy
//!
//! - Applying a rule is best effort: failures are logged and the remaining
//!   rules of the batch are still applied.
//! - Removing a rule is not: the first failure aborts the operation and is
//!   returned, leaving the client's entry in place for a retry.
//! - Keys and addresses are validated before the lock is taken, so a bad
//!   input never leaves partial state behind.
//!
//! # Example
//!
//! ```no_run
//! use meshfw::config::NodeConfig;
//! use meshfw::core::manager::{ClientSession, PeerInfo, RoutingManager};
//!
//! # async fn example() -> meshfw::Result<()> {
//! let manager = RoutingManager::from_config(&NodeConfig::default())?;
//! manager.initialize_chains().await?;
//!
//! let session = ClientSession {
//!     client_key: "ext-client-1".into(),
//!     client_addr: "10.24.52.252/32".into(),
//!     masquerade: true,
//!     peers: vec![PeerInfo::new("peer-a", "10.24.52.1/32", true)],
//! };
//! manager.authorize_client_session("mesh-server", &session).await?;
//! manager.remove_client_session("mesh-server", "ext-client-1").await?;
//! # Ok(())
//! # }
//! ```

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::config::NodeConfig;
use crate::core::actuator::{IptablesActuator, RuleActuator, is_iptables_supported};
use crate::core::bootstrap::ChainBootstrapper;
use crate::core::error::{Error, Result};
use crate::core::rule::{ChainLayout, Family, PeerAddress, Position, Rule, Table};
use crate::core::table::{PeerRuleIndex, RuleTable, RuleTableKind};
use crate::validators::validate_key;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const INGRESS: RuleTableKind = RuleTableKind::Ingress;

/// One peer a client may (or may not) reach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_key: String,
    pub peer_addr: String,
    pub allow: bool,
}

impl PeerInfo {
    pub fn new(peer_key: impl Into<String>, peer_addr: impl Into<String>, allow: bool) -> Self {
        Self {
            peer_key: peer_key.into(),
            peer_addr: peer_addr.into(),
            allow,
        }
    }
}

/// A client session with its authorized peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub client_key: String,
    pub client_addr: String,
    /// Masquerade the client's traffic over the VPN interface
    #[serde(default)]
    pub masquerade: bool,
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

/// Reconciles authorization state with the host firewall
pub struct RoutingManager<A: RuleActuator> {
    layout: ChainLayout,
    v4: A,
    v6: A,
    table: Mutex<RuleTable>,
    audit: Option<AuditLog>,
}

impl RoutingManager<IptablesActuator> {
    /// Manager driving the real iptables/ip6tables binaries.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a bad config, `Error::BackendUnavailable`
    /// when either binary is missing, or an elevation error.
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        config.validate()?;
        if !is_iptables_supported() {
            return Err(Error::BackendUnavailable(
                "iptables and ip6tables must both be installed".to_string(),
            ));
        }

        let mut manager = Self::new(
            config.layout(),
            IptablesActuator::new(Family::V4)?,
            IptablesActuator::new(Family::V6)?,
        );
        if config.audit_log {
            manager = manager.with_audit(AuditLog::new()?);
        }
        Ok(manager)
    }
}

impl<A: RuleActuator> RoutingManager<A> {
    pub fn new(layout: ChainLayout, v4: A, v6: A) -> Self {
        debug_assert_eq!(v4.family(), Family::V4);
        debug_assert_eq!(v6.family(), Family::V6);
        Self {
            layout,
            v4,
            v6,
            table: Mutex::new(RuleTable::new()),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn layout(&self) -> &ChainLayout {
        &self.layout
    }

    fn backend(&self, family: Family) -> &A {
        match family {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        }
    }

    fn bootstrapper(&self) -> ChainBootstrapper<'_, A> {
        ChainBootstrapper::new(&self.layout, &self.v4, &self.v6)
    }

    /// Resets and rebuilds the custom chains and jump rules for both families.
    ///
    /// Leaves the rule table alone; callers re-drive authorization afterwards.
    pub async fn initialize_chains(&self) -> Result<()> {
        let result = {
            let _table = self.table.lock().await;
            info!("Creating chains on {}", self.layout.interface);
            self.bootstrapper().initialize().await
        };
        self.audit(EventType::InitializeChains, json!({}), &result).await;
        result
    }

    /// Allows traffic to a single peer and records it under the client.
    pub async fn authorize_peer(
        &self,
        server: &str,
        client_key: &str,
        peer_key: &str,
        peer_addr: &str,
    ) -> Result<()> {
        let result = self
            .authorize_peer_locked(server, client_key, peer_key, peer_addr)
            .await;
        self.audit(
            EventType::AuthorizePeer,
            json!({ "server": server, "client": client_key, "peer": peer_key }),
            &result,
        )
        .await;
        result
    }

    async fn authorize_peer_locked(
        &self,
        server: &str,
        client_key: &str,
        peer_key: &str,
        peer_addr: &str,
    ) -> Result<()> {
        check_keys(&[("server", server), ("client_key", client_key), ("peer_key", peer_key)])?;
        let peer = PeerAddress::parse(peer_addr)?;
        let family = peer.family();

        let mut table = self.table.lock().await;
        let mut rules = table.fetch(INGRESS, server);
        let mut index = rules
            .remove(client_key)
            .unwrap_or_else(|| PeerRuleIndex::new(family));
        if index.family() != family {
            return Err(Error::FamilyMismatch {
                key: client_key.to_string(),
                expected: index.family(),
                actual: family,
            });
        }

        // Only the filter part belongs to the peer; masquerade rules stored under
        // the same key (peer key equal to client key) stay with the client
        let (stale, kept): (Vec<Rule>, Vec<Rule>) = index
            .remove_group(peer_key)
            .unwrap_or_default()
            .into_iter()
            .partition(|rule| rule.table == Table::Filter);
        self.remove_rules(family, &stale, client_key).await?;

        let rule = self.layout.peer_allow_rule(&peer);
        self.apply_best_effort(family, &rule).await;
        let mut group = vec![rule];
        group.extend(kept);
        index.insert_group(peer_key, group)?;

        rules.insert(client_key.to_string(), index);
        table.save(INGRESS, server, rules);
        Ok(())
    }

    /// Installs the allow rules (and optionally masquerade rules) for a client session.
    ///
    /// Peers with `allow = false` get nothing; the chain's trailing drop denies
    /// them. Re-authorizing a known client replaces its previous rules.
    pub async fn authorize_client_session(
        &self,
        server: &str,
        session: &ClientSession,
    ) -> Result<()> {
        let result = self.authorize_client_session_locked(server, session).await;
        self.audit(
            EventType::AuthorizeClientSession,
            json!({
                "server": server,
                "client": session.client_key,
                "peers": session.peers.iter().filter(|p| p.allow).count(),
                "masquerade": session.masquerade,
            }),
            &result,
        )
        .await;
        result
    }

    async fn authorize_client_session_locked(
        &self,
        server: &str,
        session: &ClientSession,
    ) -> Result<()> {
        let client_key = session.client_key.as_str();
        check_keys(&[("server", server), ("client_key", client_key)])?;
        let client = PeerAddress::parse(&session.client_addr)?;
        let family = client.family();

        // Parse everything up front; later duplicates of a peer key win
        let mut planned: Vec<(&str, PeerAddress)> = Vec::new();
        for peer in session.peers.iter().filter(|p| p.allow) {
            check_keys(&[("peer_key", peer.peer_key.as_str())])?;
            let addr = PeerAddress::parse(&peer.peer_addr)?;
            if addr.family() != family {
                return Err(Error::FamilyMismatch {
                    key: peer.peer_key.clone(),
                    expected: family,
                    actual: addr.family(),
                });
            }
            match planned.iter_mut().find(|(key, _)| *key == peer.peer_key) {
                Some(slot) => slot.1 = addr,
                None => planned.push((peer.peer_key.as_str(), addr)),
            }
        }

        let mut table = self.table.lock().await;
        let mut rules = table.fetch(INGRESS, server);
        info!("Adding ingress rules for client {client_key} on server {server}");

        if let Some(previous) = rules.get(client_key) {
            let stale: Vec<Rule> = previous.rules().cloned().collect();
            debug!("Replacing {} existing rule(s) for {client_key}", stale.len());
            self.remove_rules(previous.family(), &stale, client_key).await?;
        }

        let mut index = PeerRuleIndex::new(family);
        for (peer_key, peer) in &planned {
            let rule = self.layout.session_allow_rule(&client, peer);
            self.apply_best_effort(family, &rule).await;
            index.insert_group(*peer_key, vec![rule])?;
        }

        if session.masquerade {
            // Stored under the client's own key so they go away with the session
            let mut group = index.remove_group(client_key).unwrap_or_default();
            for rule in self.layout.masquerade_rules(&client) {
                self.apply_best_effort(family, &rule).await;
                group.push(rule);
            }
            index.insert_group(client_key, group)?;
        }

        rules.insert(client_key.to_string(), index);
        table.save(INGRESS, server, rules);
        Ok(())
    }

    /// Removes every rule recorded for the client and forgets the client.
    ///
    /// # Errors
    ///
    /// `Error::ClientNotFound` if nothing is recorded (no backend calls are
    /// made), or the first removal failure.
    pub async fn remove_client_session(&self, server: &str, client_key: &str) -> Result<()> {
        let result = self.remove_client_session_locked(server, client_key).await;
        self.audit(
            EventType::RemoveClientSession,
            json!({ "server": server, "client": client_key }),
            &result,
        )
        .await;
        result
    }

    async fn remove_client_session_locked(&self, server: &str, client_key: &str) -> Result<()> {
        let mut table = self.table.lock().await;
        let Some(index) = table.lookup(INGRESS, server, client_key) else {
            return Err(client_not_found(server, client_key));
        };

        let family = index.family();
        let recorded: Vec<Rule> = index.rules().cloned().collect();
        self.remove_rules(family, &recorded, client_key).await?;

        table.remove(INGRESS, server, client_key);
        info!("Removed {} rule(s) for client {client_key} on server {server}", recorded.len());
        Ok(())
    }

    /// Removes only the rules recorded for one peer of the client.
    ///
    /// The client's other peer groups and its masquerade rules stay in place.
    pub async fn remove_peer_pairing(
        &self,
        server: &str,
        client_key: &str,
        peer_key: &str,
    ) -> Result<()> {
        let result = self
            .remove_peer_pairing_locked(server, client_key, peer_key)
            .await;
        self.audit(
            EventType::RemovePeerPairing,
            json!({ "server": server, "client": client_key, "peer": peer_key }),
            &result,
        )
        .await;
        result
    }

    async fn remove_peer_pairing_locked(
        &self,
        server: &str,
        client_key: &str,
        peer_key: &str,
    ) -> Result<()> {
        let mut table = self.table.lock().await;
        let mut rules = table.fetch(INGRESS, server);
        let Some(index) = rules.get_mut(client_key) else {
            return Err(client_not_found(server, client_key));
        };
        let Some(group) = index.group(peer_key) else {
            return Err(Error::PeerNotFound {
                server: server.to_string(),
                client: client_key.to_string(),
                peer: peer_key.to_string(),
            });
        };

        let group = group.clone();
        self.remove_rules(index.family(), &group, client_key).await?;
        index.remove_group(peer_key);

        table.save(INGRESS, server, rules);
        Ok(())
    }

    /// Removes every rule recorded for `server` and drops the server's entry.
    ///
    /// Best effort: individual failures are logged and counted, not returned.
    pub async fn clean_server_rules(&self, server: &str) -> usize {
        let (failed, removed) = {
            let mut table = self.table.lock().await;
            let rules = table.fetch(INGRESS, server);
            let mut failed = 0;
            let mut removed = 0;
            for (client_key, index) in &rules {
                let backend = self.backend(index.family());
                for rule in index.rules() {
                    match backend.delete_if_exists(rule).await {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            error!("failed to remove rule {rule} for {client_key}: {e}");
                            failed += 1;
                        }
                    }
                }
            }
            table.drop_server(INGRESS, server);
            (failed, removed)
        };

        info!("Cleaned {removed} rule(s) for server {server}, {failed} failure(s)");
        let result: Result<()> = if failed == 0 {
            Ok(())
        } else {
            Err(Error::Internal(format!("{failed} rule(s) could not be removed")))
        };
        self.audit(
            EventType::CleanServerRules,
            json!({ "server": server, "removed": removed }),
            &result,
        )
        .await;
        failed
    }

    /// Removes the jump rules and both custom chains for both families.
    ///
    /// The rule table is kept as is; call [`Self::initialize_chains`] and
    /// re-authorize before relying on it again. Returns the number of steps
    /// that failed.
    pub async fn flush_all(&self) -> usize {
        let failed = {
            let _table = self.table.lock().await;
            info!("Flushing all meshfw chains");
            self.bootstrapper().teardown().await
        };
        let result: Result<()> = if failed == 0 {
            Ok(())
        } else {
            Err(Error::Internal(format!("{failed} teardown step(s) failed")))
        };
        self.audit(EventType::FlushAll, json!({}), &result).await;
        failed
    }

    /// Copy of the rules recorded for one client.
    pub async fn client_rules(&self, server: &str, client_key: &str) -> Option<PeerRuleIndex> {
        self.table
            .lock()
            .await
            .lookup(INGRESS, server, client_key)
            .cloned()
    }

    /// Copy of the whole rule table, for diagnostics.
    pub async fn snapshot(&self) -> RuleTable {
        self.table.lock().await.clone()
    }

    async fn apply_best_effort(&self, family: Family, rule: &Rule) {
        debug!("[{family}] adding rule: {rule}");
        if let Err(e) = self.backend(family).apply(rule, Position::Top).await {
            warn!("[{family}] failed to add rule: {rule}, Err: {e}");
        }
    }

    async fn remove_rules(&self, family: Family, rules: &[Rule], key: &str) -> Result<()> {
        let backend = self.backend(family);
        for rule in rules {
            if let Err(e) = backend.delete_if_exists(rule).await {
                error!("error while removing existing {} rule [{rule}] for {key}: {e}", rule.table);
                return Err(e);
            }
            debug!("[{family}] removed rule: {rule}");
        }
        Ok(())
    }

    async fn audit(&self, event_type: EventType, details: serde_json::Value, result: &Result<()>) {
        let Some(audit) = &self.audit else {
            return;
        };
        let event = AuditEvent::new(
            event_type,
            result.is_ok(),
            details,
            result.as_ref().err().map(ToString::to_string),
        );
        if let Err(e) = audit.log(event).await {
            warn!("Failed to write audit log: {e}");
        }
    }
}

fn check_keys(keys: &[(&str, &str)]) -> Result<()> {
    for (field, value) in keys {
        validate_key(value).map_err(|message| Error::Validation {
            field: (*field).to_string(),
            message,
        })?;
    }
    Ok(())
}

fn client_not_found(server: &str, client_key: &str) -> Error {
    Error::ClientNotFound {
        server: server.to_string(),
        client: client_key.to_string(),
    }
}
