//! Firewall backend abstraction
//!
//! [`RuleActuator`] is the only way meshfw touches the host firewall. There is
//! one actuator per address family. [`IptablesActuator`] shells out to
//! `iptables`/`ip6tables`; [`crate::core::memory::MemoryActuator`] keeps an
//! in-memory model for tests.
//!
//! # Semantics
//!
//! - `ensure_chain` lists the table's chains first and only creates when absent
//! - `clear_and_delete_chain` is a no-op for a chain that does not exist
//! - `delete_if_exists` succeeds when the rule was already gone
//! - `apply` never deduplicates; callers track what they installed

use crate::core::error::{Error, Result};
use crate::core::rule::{Family, Position, Rule, Table};
use crate::elevation::{BackendCommand, backend_available, backend_binary};
use std::future::Future;
use std::io::ErrorKind;
use std::process::{Output, Stdio};
use tracing::debug;

/// Applies and removes low-level rules for one address family
pub trait RuleActuator: Send + Sync {
    fn family(&self) -> Family;

    /// Creates `chain` in `table` unless it already exists.
    fn ensure_chain(&self, table: Table, chain: &str) -> impl Future<Output = Result<()>> + Send;

    /// Flushes and deletes `chain` if it exists.
    fn clear_and_delete_chain(
        &self,
        table: Table,
        chain: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn apply(&self, rule: &Rule, position: Position) -> impl Future<Output = Result<()>> + Send;

    fn delete_if_exists(&self, rule: &Rule) -> impl Future<Output = Result<()>> + Send;
}

/// Returns true when the backend binaries for both families can be found.
pub fn is_iptables_supported() -> bool {
    [Family::V4, Family::V6]
        .into_iter()
        .all(|family| backend_available(&backend_binary(family)))
}

/// Actuator backed by the `iptables`/`ip6tables` command line tools
#[derive(Debug, Clone)]
pub struct IptablesActuator {
    family: Family,
    command: BackendCommand,
}

impl IptablesActuator {
    /// Resolves the backend command for `family` (elevation, overrides).
    pub fn new(family: Family) -> Result<Self> {
        Ok(Self {
            family,
            command: BackendCommand::resolve(family)?,
        })
    }

    /// Uses an explicit command, e.g. a mock script in tests.
    pub fn with_command(family: Family, command: BackendCommand) -> Self {
        Self { family, command }
    }

    async fn run(&self, table: Table, args: &[&str]) -> Result<Output> {
        let mut cmd = self.command.to_command();
        cmd.args(["-w", "-t", table.as_ref()])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("[{}] {} -t {} {}", self.family, self.command, table, args.join(" "));

        cmd.output().await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::PermissionDenied {
                Error::BackendUnavailable(format!("{}: {e}", self.command))
            } else {
                Error::Io(e)
            }
        })
    }

    async fn run_checked(&self, table: Table, args: &[&str]) -> Result<Output> {
        let output = self.run(table, args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(self.failure(&output, table, args))
        }
    }

    fn failure(&self, output: &Output, table: Table, args: &[&str]) -> Error {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Error::Iptables {
            family: self.family,
            message: format!(
                "running [-t {table} {}] failed: {}",
                args.join(" "),
                if stderr.is_empty() {
                    output.status.to_string()
                } else {
                    stderr.clone()
                }
            ),
            stderr: (!stderr.is_empty()).then_some(stderr),
            exit_code: output.status.code(),
        }
    }

    /// Chain names in `table`, built-in and user-defined.
    pub async fn list_chains(&self, table: Table) -> Result<Vec<String>> {
        let output = self.run_checked(table, &["-S"]).await?;
        Ok(parse_chain_listing(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn chain_exists(&self, table: Table, chain: &str) -> Result<bool> {
        Ok(self.list_chains(table).await?.iter().any(|c| c == chain))
    }
}

impl RuleActuator for IptablesActuator {
    fn family(&self) -> Family {
        self.family
    }

    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<()> {
        if self.chain_exists(table, chain).await? {
            return Ok(());
        }
        self.run_checked(table, &["-N", chain]).await?;
        Ok(())
    }

    async fn clear_and_delete_chain(&self, table: Table, chain: &str) -> Result<()> {
        if !self.chain_exists(table, chain).await? {
            return Ok(());
        }
        self.run_checked(table, &["-F", chain]).await?;
        self.run_checked(table, &["-X", chain]).await?;
        Ok(())
    }

    async fn apply(&self, rule: &Rule, position: Position) -> Result<()> {
        let mut args: Vec<&str> = match position {
            Position::Top => vec!["-I", rule.chain.as_str(), "1"],
            Position::Bottom => vec!["-A", rule.chain.as_str()],
        };
        args.extend(rule.args.iter().map(String::as_str));
        self.run_checked(rule.table, &args).await?;
        Ok(())
    }

    async fn delete_if_exists(&self, rule: &Rule) -> Result<()> {
        let mut check: Vec<&str> = vec!["-C", rule.chain.as_str()];
        check.extend(rule.args.iter().map(String::as_str));

        let output = self.run(rule.table, &check).await?;
        match output.status.code() {
            Some(0) => {}
            // Elevation wrappers also exit 1 (sudo auth failure), so the code alone proves nothing
            Some(1) if reports_missing_rule(&String::from_utf8_lossy(&output.stderr)) => {
                return Ok(());
            }
            _ => return Err(self.failure(&output, rule.table, &check)),
        }

        check[0] = "-D";
        self.run_checked(rule.table, &check).await?;
        Ok(())
    }
}

/// True when `-C` stderr is iptables saying the rule or its chain is not there.
pub fn reports_missing_rule(stderr: &str) -> bool {
    const ABSENT: [&str; 4] = [
        "bad rule",
        "does a matching rule exist",
        "no chain/target/match",
        "does not exist",
    ];
    let lower = stderr.to_lowercase();
    ABSENT.iter().any(|pattern| lower.contains(pattern))
}

/// Extracts chain names from `iptables -S` output (`-P` and `-N` lines).
pub fn parse_chain_listing(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("-P" | "-N") => parts.next().map(String::from),
                _ => None,
            }
        })
        .collect()
}
