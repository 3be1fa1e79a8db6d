//! meshfw - mesh VPN firewall rule reconciliation
//!
//! Maintains the iptables rules that let authorized VPN clients reach their
//! peers through a mesh proxy node, and removes exactly those rules when the
//! authorization goes away.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, backends, chain bootstrap, rule table, manager
//! - [`audit`] - Audit logging of every rule change
//! - [`validators`] - Input validation for names and keys
//! - [`config`] - Node configuration persistence
//! - [`elevation`] - How the iptables binaries are invoked
//! - [`utils`] - XDG directories, interface discovery
//!
//! # Safety Features
//!
//! - Allow rules always sit above the custom chain's trailing drop
//! - Removal failures are surfaced, never swallowed
//! - One lock serializes every table update with its backend calls

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::manager::{ClientSession, PeerInfo, RoutingManager};
pub use core::rule::{Family, Rule, Table};
