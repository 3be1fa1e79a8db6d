//! Custom chain setup and teardown
//!
//! For both address families meshfw owns one custom filter chain and one
//! custom NAT chain, reached through static jump rules appended to the
//! built-in `FORWARD` and `POSTROUTING` chains. Those jump rules live for the
//! whole process and are never recorded in the rule table.

use crate::core::actuator::RuleActuator;
use crate::core::error::Result;
use crate::core::rule::{ChainLayout, Position};
use tracing::{error, info, warn};

/// Builds and removes the custom chains and jump rules for both families
pub struct ChainBootstrapper<'a, A: RuleActuator> {
    layout: &'a ChainLayout,
    backends: [&'a A; 2],
}

impl<'a, A: RuleActuator> ChainBootstrapper<'a, A> {
    pub fn new(layout: &'a ChainLayout, v4: &'a A, v6: &'a A) -> Self {
        Self {
            layout,
            backends: [v4, v6],
        }
    }

    /// Resets, then creates both custom chains per family and appends the jump rules.
    ///
    /// Safe to call repeatedly: the reset removes jump rules left by an earlier
    /// run so they never accumulate.
    ///
    /// # Errors
    ///
    /// Returns the first chain creation failure. Jump rule failures are logged only.
    pub async fn initialize(&self) -> Result<()> {
        let leftovers = self.teardown().await;
        if leftovers > 0 {
            warn!("{leftovers} step(s) failed while resetting chains, continuing");
        }

        for backend in self.backends {
            for (table, chain) in self.layout.custom_chains() {
                if let Err(e) = backend.ensure_chain(table, chain).await {
                    error!("failed to create [{}] chain {chain} in {table} table: {e}", backend.family());
                    return Err(e);
                }
            }
        }

        let failed = self.add_jump_rules().await;
        if failed > 0 {
            warn!("{failed} jump rule(s) could not be added");
        }
        info!(
            "Chains {} and {} ready on {}",
            self.layout.filter_chain, self.layout.nat_chain, self.layout.interface
        );
        Ok(())
    }

    /// Removes the jump rules, then flushes and deletes both custom chains.
    ///
    /// Every step is attempted; returns how many failed.
    pub async fn teardown(&self) -> usize {
        let mut failed = self.remove_jump_rules().await;
        for (table, chain) in self.layout.custom_chains() {
            for backend in self.backends {
                if let Err(e) = backend.clear_and_delete_chain(table, chain).await {
                    error!("[{}] failed to clear chain: {table} {chain}: {e}", backend.family());
                    failed += 1;
                }
            }
        }
        failed
    }

    async fn add_jump_rules(&self) -> usize {
        let mut failed = 0;
        for rule in self.layout.jump_rules() {
            for backend in self.backends {
                if let Err(e) = backend.apply(&rule, Position::Bottom).await {
                    error!("[{}] failed to add rule: {rule}, Err: {e}", backend.family());
                    failed += 1;
                }
            }
        }
        failed
    }

    async fn remove_jump_rules(&self) -> usize {
        let mut failed = 0;
        for rule in self.layout.jump_rules() {
            for backend in self.backends {
                if let Err(e) = backend.delete_if_exists(&rule).await {
                    error!("[{}] failed to rm rule: {rule}, Err: {e}", backend.family());
                    failed += 1;
                }
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::{FailOn, MemoryActuator};
    use crate::core::rule::{Family, FORWARD_CHAIN, POSTROUTING_CHAIN, Table};

    fn layout() -> ChainLayout {
        ChainLayout::new("meshvpn0", "meshfwfilter", "meshfwnat")
    }

    #[tokio::test]
    async fn test_initialize_creates_chains_and_jumps() {
        let layout = layout();
        let (v4, v6) = (MemoryActuator::new(Family::V4), MemoryActuator::new(Family::V6));
        ChainBootstrapper::new(&layout, &v4, &v6).initialize().await.unwrap();

        for fw in [&v4, &v6] {
            assert_eq!(
                fw.chain_rules(Table::Filter, "meshfwfilter").unwrap(),
                vec![
                    vec!["-i", "meshvpn0", "-j", "DROP"],
                    vec!["-i", "meshvpn0", "-j", "RETURN"],
                ]
            );
            assert_eq!(
                fw.chain_rules(Table::Filter, FORWARD_CHAIN).unwrap(),
                vec![vec!["-i", "meshvpn0", "-j", "meshfwfilter"]]
            );
            assert_eq!(
                fw.chain_rules(Table::Nat, POSTROUTING_CHAIN).unwrap(),
                vec![vec!["-o", "meshvpn0", "-j", "meshfwnat"]]
            );
            assert_eq!(
                fw.chain_rules(Table::Nat, "meshfwnat").unwrap(),
                vec![vec!["-j", "RETURN"]]
            );
        }
    }

    #[tokio::test]
    async fn test_initialize_twice_matches_once() {
        let layout = layout();
        let (v4, v6) = (MemoryActuator::new(Family::V4), MemoryActuator::new(Family::V6));
        let boot = ChainBootstrapper::new(&layout, &v4, &v6);

        boot.initialize().await.unwrap();
        let once = (v4.dump(), v6.dump());
        boot.initialize().await.unwrap();
        assert_eq!((v4.dump(), v6.dump()), once);
    }

    #[tokio::test]
    async fn test_teardown_removes_everything() {
        let layout = layout();
        let (v4, v6) = (MemoryActuator::new(Family::V4), MemoryActuator::new(Family::V6));
        let pristine = v4.dump();
        let boot = ChainBootstrapper::new(&layout, &v4, &v6);

        boot.initialize().await.unwrap();
        assert_eq!(boot.teardown().await, 0);
        assert_eq!(v4.dump(), pristine);
        assert!(!v6.has_chain(Table::Nat, "meshfwnat"));
    }

    #[tokio::test]
    async fn test_chain_creation_failure_is_fatal() {
        let layout = layout();
        let (v4, v6) = (MemoryActuator::new(Family::V4), MemoryActuator::new(Family::V6));
        v6.fail_on(FailOn::EnsureChain);

        let result = ChainBootstrapper::new(&layout, &v4, &v6).initialize().await;
        assert!(result.is_err());
        // No jump rules once a chain is missing
        assert!(v4.chain_rules(Table::Filter, FORWARD_CHAIN).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jump_rule_failure_is_tolerated() {
        let layout = layout();
        let (v4, v6) = (MemoryActuator::new(Family::V4), MemoryActuator::new(Family::V6));
        v4.fail_on(FailOn::Apply);

        ChainBootstrapper::new(&layout, &v4, &v6).initialize().await.unwrap();
        assert!(v4.has_chain(Table::Filter, "meshfwfilter"));
        assert_eq!(v6.chain_rules(Table::Nat, "meshfwnat").unwrap().len(), 1);
    }
}
