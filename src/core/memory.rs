//! In-memory firewall backend
//!
//! [`MemoryActuator`] models the chains of one address family as ordered rule
//! lists and records every call it receives. Clones share state, so a test can
//! hand one clone to a [`crate::core::manager::RoutingManager`] and inspect the
//! other. Failures can be injected per operation kind.

use crate::core::actuator::RuleActuator;
use crate::core::error::{Error, Result};
use crate::core::rule::{Family, Position, Rule, Table};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// One call received by the fake backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    EnsureChain(Table, String),
    ClearAndDeleteChain(Table, String),
    Apply(Rule, Position),
    Delete(Rule),
}

/// Operation kinds that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailOn {
    EnsureChain,
    ClearAndDeleteChain,
    Apply,
    Delete,
}

#[derive(Debug)]
struct State {
    chains: BTreeMap<(Table, String), Vec<Vec<String>>>,
    calls: Vec<Call>,
    failing: HashSet<FailOn>,
    unavailable: bool,
}

impl State {
    fn new() -> Self {
        let mut chains = BTreeMap::new();
        for table in [Table::Filter, Table::Nat] {
            for chain in table.builtin_chains() {
                chains.insert((table, (*chain).to_string()), Vec::new());
            }
        }
        Self {
            chains,
            calls: Vec::new(),
            failing: HashSet::new(),
            unavailable: false,
        }
    }
}

/// Fake actuator backed by shared in-memory state
#[derive(Debug, Clone)]
pub struct MemoryActuator {
    family: Family,
    state: Arc<Mutex<State>>,
}

impl MemoryActuator {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Makes every subsequent call of `op` fail.
    pub fn fail_on(&self, op: FailOn) {
        self.lock().failing.insert(op);
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Simulates the backend binary being absent.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Rules currently in `chain`, top first; `None` if the chain does not exist.
    pub fn chain_rules(&self, table: Table, chain: &str) -> Option<Vec<Vec<String>>> {
        self.lock().chains.get(&(table, chain.to_string())).cloned()
    }

    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.lock().chains.contains_key(&(table, chain.to_string()))
    }

    pub fn contains(&self, rule: &Rule) -> bool {
        self.chain_rules(rule.table, &rule.chain)
            .is_some_and(|rules| rules.contains(&rule.args))
    }

    /// Full image of every chain, for before/after comparisons.
    pub fn dump(&self) -> BTreeMap<(Table, String), Vec<Vec<String>>> {
        self.lock().chains.clone()
    }

    fn check(&self, state: &State, op: FailOn) -> Result<()> {
        if state.unavailable {
            return Err(Error::BackendUnavailable(format!(
                "{} not found",
                self.family.binary()
            )));
        }
        if state.failing.contains(&op) {
            return Err(Error::Iptables {
                family: self.family,
                message: format!("injected {op:?} failure"),
                stderr: None,
                exit_code: Some(1),
            });
        }
        Ok(())
    }
}

impl RuleActuator for MemoryActuator {
    fn family(&self) -> Family {
        self.family
    }

    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .calls
            .push(Call::EnsureChain(table, chain.to_string()));
        self.check(&state, FailOn::EnsureChain)?;
        state.chains.entry((table, chain.to_string())).or_default();
        Ok(())
    }

    async fn clear_and_delete_chain(&self, table: Table, chain: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .calls
            .push(Call::ClearAndDeleteChain(table, chain.to_string()));
        self.check(&state, FailOn::ClearAndDeleteChain)?;
        if table.builtin_chains().iter().any(|builtin| *builtin == chain) {
            return Err(Error::Internal(format!("refusing to delete built-in chain {chain}")));
        }
        state.chains.remove(&(table, chain.to_string()));
        Ok(())
    }

    async fn apply(&self, rule: &Rule, position: Position) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::Apply(rule.clone(), position));
        self.check(&state, FailOn::Apply)?;
        let Some(rules) = state.chains.get_mut(&(rule.table, rule.chain.clone())) else {
            return Err(Error::Iptables {
                family: self.family,
                message: format!("chain {} does not exist", rule.chain),
                stderr: Some("iptables: No chain/target/match by that name.".into()),
                exit_code: Some(1),
            });
        };
        match position {
            Position::Top => rules.insert(0, rule.args.clone()),
            Position::Bottom => rules.push(rule.args.clone()),
        }
        Ok(())
    }

    async fn delete_if_exists(&self, rule: &Rule) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::Delete(rule.clone()));
        self.check(&state, FailOn::Delete)?;
        if let Some(rules) = state.chains.get_mut(&(rule.table, rule.chain.clone()))
            && let Some(pos) = rules.iter().position(|args| *args == rule.args)
        {
            rules.remove(pos);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(chain: &str, target: &str) -> Rule {
        Rule::new(Table::Filter, chain, ["-j", target])
    }

    #[tokio::test]
    async fn test_apply_requires_chain() {
        let fw = MemoryActuator::new(Family::V4);
        assert!(fw.apply(&rule("custom", "DROP"), Position::Bottom).await.is_err());
        fw.ensure_chain(Table::Filter, "custom").await.unwrap();
        fw.apply(&rule("custom", "DROP"), Position::Bottom).await.unwrap();
        assert!(fw.contains(&rule("custom", "DROP")));
    }

    #[tokio::test]
    async fn test_top_insert_precedes_existing() {
        let fw = MemoryActuator::new(Family::V4);
        fw.ensure_chain(Table::Filter, "custom").await.unwrap();
        fw.apply(&rule("custom", "DROP"), Position::Bottom).await.unwrap();
        fw.apply(&rule("custom", "ACCEPT"), Position::Top).await.unwrap();
        let rules = fw.chain_rules(Table::Filter, "custom").unwrap();
        assert_eq!(rules[0], ["-j", "ACCEPT"]);
        assert_eq!(rules[1], ["-j", "DROP"]);
    }

    #[tokio::test]
    async fn test_ensure_chain_keeps_rules() {
        let fw = MemoryActuator::new(Family::V6);
        fw.ensure_chain(Table::Nat, "n").await.unwrap();
        fw.apply(&Rule::new(Table::Nat, "n", ["-j", "RETURN"]), Position::Bottom)
            .await
            .unwrap();
        fw.ensure_chain(Table::Nat, "n").await.unwrap();
        assert_eq!(fw.chain_rules(Table::Nat, "n").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_if_exists_is_idempotent() {
        let fw = MemoryActuator::new(Family::V4);
        fw.delete_if_exists(&rule("missing", "DROP")).await.unwrap();
        fw.ensure_chain(Table::Filter, "custom").await.unwrap();
        fw.apply(&rule("custom", "DROP"), Position::Bottom).await.unwrap();
        fw.delete_if_exists(&rule("custom", "DROP")).await.unwrap();
        fw.delete_if_exists(&rule("custom", "DROP")).await.unwrap();
        assert!(fw.chain_rules(Table::Filter, "custom").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_builtin_chains_cannot_be_deleted() {
        let fw = MemoryActuator::new(Family::V4);
        assert!(fw.clear_and_delete_chain(Table::Filter, "FORWARD").await.is_err());
        assert!(fw.has_chain(Table::Filter, "FORWARD"));
    }

    #[tokio::test]
    async fn test_injected_failures_are_recorded() {
        let fw = MemoryActuator::new(Family::V4);
        fw.fail_on(FailOn::Delete);
        assert!(fw.delete_if_exists(&rule("x", "DROP")).await.is_err());
        assert_eq!(fw.calls().len(), 1);

        fw.set_unavailable(true);
        let err = fw.ensure_chain(Table::Filter, "x").await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let fw = MemoryActuator::new(Family::V4);
        let observer = fw.clone();
        fw.ensure_chain(Table::Filter, "shared").await.unwrap();
        assert!(observer.has_chain(Table::Filter, "shared"));
    }

    #[tokio::test]
    async fn test_dump_orders_by_table_then_chain() {
        let fw = MemoryActuator::new(Family::V4);
        fw.ensure_chain(Table::Nat, "meshfwnat").await.unwrap();
        fw.ensure_chain(Table::Filter, "meshfwfilter").await.unwrap();

        let keys: Vec<(Table, String)> = fw.dump().into_keys().collect();
        let first_nat = keys.iter().position(|(t, _)| *t == Table::Nat).unwrap();
        assert!(keys[..first_nat].iter().all(|(t, _)| *t == Table::Filter));
        assert!(keys[first_nat..].iter().all(|(t, _)| *t == Table::Nat));
        assert!(keys.contains(&(Table::Filter, "meshfwfilter".to_string())));
        assert!(Table::Filter < Table::Nat);
    }
}
