//! Shared test utilities for core module tests
//!
//! Provides a manager wired to two in-memory backends plus small builders for
//! sessions. This module is only compiled in test mode.

use crate::core::manager::{ClientSession, PeerInfo, RoutingManager};
use crate::core::memory::{Call, MemoryActuator};
use crate::core::rule::{ChainLayout, Family, Rule};
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("MESHFW_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("MESHFW_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

pub const SERVER: &str = "mesh-server";
pub const IFACE: &str = "meshvpn0";
pub const FILTER: &str = "meshfwfilter";
pub const NAT: &str = "meshfwnat";

pub fn test_layout() -> ChainLayout {
    ChainLayout::new(IFACE, FILTER, NAT)
}

/// Manager over two fake backends, with observer handles on both.
pub struct Harness {
    pub manager: RoutingManager<MemoryActuator>,
    pub v4: MemoryActuator,
    pub v6: MemoryActuator,
}

impl Harness {
    pub fn new() -> Self {
        let v4 = MemoryActuator::new(Family::V4);
        let v6 = MemoryActuator::new(Family::V6);
        let manager = RoutingManager::new(test_layout(), v4.clone(), v6.clone());
        Self { manager, v4, v6 }
    }

    /// Harness with chains already initialized and the call logs cleared.
    pub async fn initialized() -> Self {
        let harness = Self::new();
        harness
            .manager
            .initialize_chains()
            .await
            .expect("initialize chains");
        harness.clear_calls();
        harness
    }

    pub fn clear_calls(&self) {
        self.v4.clear_calls();
        self.v6.clear_calls();
    }

    pub fn total_calls(&self) -> usize {
        self.v4.calls().len() + self.v6.calls().len()
    }
}

/// Builds a session from `(peer_key, peer_addr, allow)` triples.
pub fn session(
    client_key: &str,
    client_addr: &str,
    masquerade: bool,
    peers: &[(&str, &str, bool)],
) -> ClientSession {
    ClientSession {
        client_key: client_key.to_string(),
        client_addr: client_addr.to_string(),
        masquerade,
        peers: peers
            .iter()
            .map(|(key, addr, allow)| PeerInfo::new(*key, *addr, *allow))
            .collect(),
    }
}

pub fn applied(calls: &[Call]) -> Vec<Rule> {
    calls
        .iter()
        .filter_map(|call| match call {
            Call::Apply(rule, _) => Some(rule.clone()),
            _ => None,
        })
        .collect()
}

pub fn deleted(calls: &[Call]) -> Vec<Rule> {
    calls
        .iter()
        .filter_map(|call| match call {
            Call::Delete(rule) => Some(rule.clone()),
            _ => None,
        })
        .collect()
}
