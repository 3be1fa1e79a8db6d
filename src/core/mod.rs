//! Core rule reconciliation
//!
//! This module contains the types and logic that keep the host firewall in
//! step with mesh authorization state:
//!
//! - [`rule`]: Rules, address families, addresses and the chain layout
//! - [`actuator`]: Backend trait and the iptables implementation
//! - [`memory`]: In-memory backend for tests and dry runs
//! - [`bootstrap`]: Custom chain and jump rule setup/teardown
//! - [`table`]: Index of installed rules per server, client and peer
//! - [`manager`]: The authorization-change API
//! - [`error`]: Error types

pub mod actuator;
pub mod bootstrap;
pub mod error;
pub mod manager;
pub mod memory;
pub mod rule;
pub mod table;

#[cfg(test)]
pub mod test_helpers;
