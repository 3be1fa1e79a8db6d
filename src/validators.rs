//! Input validation for meshfw
//!
//! Everything that ends up as an iptables argument or a rule-table key passes
//! through here first. Arguments are never interpreted by a shell, but a
//! stray space or leading dash in an interface or chain name would still
//! change what iptables parses.

use crate::core::rule::Table;

/// Longest chain name iptables accepts
pub const MAX_CHAIN_NAME: usize = 28;

/// Longest server, client or peer key accepted
pub const MAX_KEY_LEN: usize = 256;

/// Validates a network interface name.
///
/// # Errors
///
/// Returns `Err` if:
/// - Name is empty or exceeds 15 characters (Linux IFNAMSIZ - 1)
/// - Name is `.` or `..`
/// - Name contains characters other than ASCII alphanumeric, `.`, `-`, `_`
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name is required".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a custom chain name for `table`.
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long, starts with `-`, contains
/// whitespace, or collides with one of the table's built-in chains.
pub fn validate_chain(name: &str, table: Table) -> Result<String, String> {
    if name.is_empty() {
        return Err("Chain name is required".to_string());
    }

    if name.len() > MAX_CHAIN_NAME {
        return Err(format!("Chain name too long (max {MAX_CHAIN_NAME} characters)"));
    }

    if name.starts_with('-') {
        return Err("Chain name must not start with '-'".to_string());
    }

    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("Chain name must not contain whitespace".to_string());
    }

    if table
        .builtin_chains()
        .iter()
        .any(|builtin| builtin.eq_ignore_ascii_case(name))
    {
        return Err(format!("'{name}' is a built-in {table} chain"));
    }

    Ok(name.to_string())
}

/// Validates a server, client or peer key used to index the rule table.
///
/// # Errors
///
/// Returns `Err` if the key is empty, longer than [`MAX_KEY_LEN`] bytes, or
/// contains control characters.
pub fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("Key must not be empty".to_string());
    }

    if key.len() > MAX_KEY_LEN {
        return Err(format!("Key too long (max {MAX_KEY_LEN} bytes)"));
    }

    if key.chars().any(char::is_control) {
        return Err("Key contains control characters".to_string());
    }

    Ok(())
}
