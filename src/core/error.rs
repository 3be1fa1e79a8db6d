use crate::core::rule::Family;
use thiserror::Error;

/// Core error types for meshfw
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// iptables/ip6tables ran but reported a failure
    #[error("{family} backend error: {message}")]
    Iptables {
        family: Family,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// The firewall engine could not be invoked at all
    #[error("Firewall backend unavailable: {0}")]
    BackendUnavailable(String),

    /// No rules are recorded for this client on this server
    #[error("peer not found in rule table: {client} (server {server})")]
    ClientNotFound { server: String, client: String },

    /// The client is known but holds no rules for this peer
    #[error("rules not found for: {peer} (client {client}, server {server})")]
    PeerNotFound {
        server: String,
        client: String,
        peer: String,
    },

    /// Address could not be parsed as an IP prefix
    #[error("Invalid address '{value}': {reason}")]
    InvalidAddress { value: String, reason: String },

    /// An address of one family was routed at state recorded for the other
    #[error("Address family mismatch for {key}: expected {expected}, got {actual}")]
    FamilyMismatch {
        key: String,
        expected: Family,
        actual: Family,
    },

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the distinct "nothing recorded" kind returned by removals.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ClientNotFound { .. } | Error::PeerNotFound { .. })
    }

    /// Raw backend stderr, when the failure came from iptables itself.
    pub fn backend_stderr(&self) -> Option<&str> {
        match self {
            Error::Iptables { stderr, .. } => stderr.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known iptables failure messages and what an operator should do about them
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches backend output against known patterns and returns a translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run meshfw as root or with CAP_NET_ADMIN")
                .with_suggestion("Or set MESHFW_ELEVATION_METHOD=sudo with a NOPASSWD rule");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables-nft  (Fedora/RHEL)")
                .with_suggestion("Both iptables and ip6tables are required");
        }

        if lower.contains("another app is currently holding the xtables lock")
            || lower.contains("resource temporarily unavailable")
        {
            return ErrorTranslation::new("The xtables lock is held by another process")
                .with_suggestion("Another firewall manager may be running")
                .with_suggestion("Check: sudo systemctl status firewalld ufw");
        }

        if lower.contains("too many links") || lower.contains("directory not empty") {
            return ErrorTranslation::new("Chain is still referenced and cannot be deleted")
                .with_suggestion("Remove jump rules into the chain first (meshfw flush)");
        }

        if lower.contains("no chain/target/match by that name")
            || (lower.contains("chain") && lower.contains("does not exist"))
        {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Initialize the chains first: meshfw init");
        }

        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("Rule does not exist in the chain")
                .with_suggestion("The rule may have been removed by another tool");
        }

        if lower.contains("host/network") && lower.contains("not found") {
            return ErrorTranslation::new("Invalid IP address or network")
                .with_suggestion("Use CIDR notation: 10.24.0.2/32 or fd00::2/128");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Verify iptables works: sudo iptables -S")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iptables_missing_command() {
        let translation = IptablesErrorPattern::match_error("command not found: iptables");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 3);
    }

    #[test]
    fn test_permission_denied() {
        let translation = IptablesErrorPattern::match_error(
            "iptables v1.8.9 (nf_tables): Could not fetch rule set generation id: Permission denied (you must be root)",
        );
        assert!(translation.user_message.contains("permissions"));
    }

    #[test]
    fn test_xtables_lock() {
        let translation = IptablesErrorPattern::match_error(
            "Another app is currently holding the xtables lock. Perhaps you want to use the -w option?",
        );
        assert!(translation.user_message.contains("xtables lock"));
    }

    #[test]
    fn test_missing_chain() {
        let translation =
            IptablesErrorPattern::match_error("iptables: No chain/target/match by that name.");
        assert!(translation.user_message.contains("chain"));
        assert!(translation.suggestions.iter().any(|s| s.contains("meshfw init")));
    }

    #[test]
    fn test_fallback_keeps_raw_message() {
        let translation = IptablesErrorPattern::match_error("something odd");
        assert!(translation.user_message.contains("something odd"));
    }

    #[test]
    fn test_not_found_kind() {
        let err = Error::ClientNotFound {
            server: "srv".into(),
            client: "c1".into(),
        };
        assert!(err.is_not_found());
        assert!(!Error::Internal("x".into()).is_not_found());
    }

    #[test]
    fn test_backend_stderr_accessor() {
        let err = Error::Iptables {
            family: Family::V4,
            message: "exit status 1".into(),
            stderr: Some("Bad rule".into()),
            exit_code: Some(1),
        };
        assert_eq!(err.backend_stderr(), Some("Bad rule"));
        assert!(err.to_string().starts_with("ipv4"));
    }
}
