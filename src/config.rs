use crate::core::error::{Error, Result};
use crate::core::rule::{ChainLayout, DEFAULT_FILTER_CHAIN, DEFAULT_NAT_CHAIN, Table};
use crate::utils::get_config_dir;
use crate::validators::{validate_chain, validate_interface};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default VPN interface name
pub const DEFAULT_INTERFACE: &str = "meshvpn0";

/// Node configuration: which interface and chains meshfw manages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// VPN interface used in jump rules and NAT output matches
    #[serde(default = "default_interface")]
    pub interface_name: String,
    /// Custom chain in the filter table holding per-peer allow rules
    #[serde(default = "default_filter_chain")]
    pub filter_chain: String,
    /// Custom chain in the nat table holding masquerade rules
    #[serde(default = "default_nat_chain")]
    pub nat_chain: String,
    /// Append every rule change to the audit log (opt-in)
    #[serde(default)]
    pub audit_log: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            interface_name: default_interface(),
            filter_chain: default_filter_chain(),
            nat_chain: default_nat_chain(),
            audit_log: false,
        }
    }
}

impl NodeConfig {
    /// Checks interface and chain names before any of them reach iptables.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, message: String| Error::Validation {
            field: field.to_string(),
            message,
        };

        validate_interface(&self.interface_name).map_err(|m| invalid("interface_name", m))?;
        validate_chain(&self.filter_chain, Table::Filter).map_err(|m| invalid("filter_chain", m))?;
        validate_chain(&self.nat_chain, Table::Nat).map_err(|m| invalid("nat_chain", m))?;

        if self.filter_chain == self.nat_chain {
            return Err(invalid(
                "nat_chain",
                "filter and NAT chains must have different names".to_string(),
            ));
        }
        Ok(())
    }

    pub fn layout(&self) -> ChainLayout {
        ChainLayout::new(&self.interface_name, &self.filter_chain, &self.nat_chain)
    }
}

fn default_interface() -> String {
    DEFAULT_INTERFACE.to_string()
}

fn default_filter_chain() -> String {
    DEFAULT_FILTER_CHAIN.to_string()
}

fn default_nat_chain() -> String {
    DEFAULT_NAT_CHAIN.to_string()
}

/// `config.json` in the user's config directory
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads the config from `path`.
///
/// # Errors
///
/// Returns `Err` if the file cannot be read or is not valid JSON.
pub async fn load_config_from(path: &Path) -> Result<NodeConfig> {
    let json = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&json)?)
}

/// Loads the config from the default location, or returns defaults if not found.
pub async fn load_config() -> NodeConfig {
    if let Some(path) = default_config_path()
        && let Ok(config) = load_config_from(&path).await
    {
        return config;
    }
    NodeConfig::default()
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file next to the target.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config_to(config: &NodeConfig, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("json.tmp");

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600) // Set permissions BEFORE any data is written
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}
