//! Privilege elevation for firewall backend invocations
//!
//! iptables needs `CAP_NET_ADMIN`. A node daemon normally runs as root and
//! invokes the backend directly; the operator CLI may run unprivileged and
//! elevates only the backend binary.
//!
//! # Elevation Strategy
//!
//! - **Root or test mode**: run the backend binary directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **CLI fallback**: `sudo` for terminal environments
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `MESHFW_ELEVATION_METHOD`: Force `sudo`, `run0`, or `pkexec`.
//! - `MESHFW_TEST_NO_ELEVATION`: Bypass elevation entirely (testing only).
//! - `MESHFW_IPTABLES_COMMAND` / `MESHFW_IP6TABLES_COMMAND`: Replace the
//!   backend binary (e.g. `iptables-legacy`).
//!
//! # Security
//!
//! - Only the iptables family binaries are ever elevated
//! - Arguments are passed as an argv vector, never through a shell

use crate::core::rule::Family;
use std::fmt;
use std::path::Path;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `MESHFW_ELEVATION_METHOD`
    #[error("Invalid MESHFW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),
}

/// Admin directories that an unprivileged user's PATH often omits
const SBIN_DIRS: [&str; 2] = ["/usr/sbin", "/sbin"];

/// Checks whether the backend binary can be found.
///
/// A path is checked as is. A bare name is looked up on PATH and then in the
/// sbin directories, where the elevated command will still find it.
pub fn backend_available(binary: &str) -> bool {
    if binary.contains('/') {
        return Path::new(binary).is_file();
    }
    binary_exists(binary) || SBIN_DIRS.iter().any(|dir| Path::new(dir).join(binary).is_file())
}

/// Checks if a binary exists in PATH
pub fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Program plus fixed leading arguments used to reach the backend.
///
/// For `sudo iptables -w -t nat ...` the program is `sudo` and the leading
/// arguments are `["iptables"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCommand {
    program: String,
    leading_args: Vec<String>,
}

impl BackendCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn leading_args(&self) -> &[String] {
        &self.leading_args
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args);
        cmd
    }

    /// Resolves how to invoke the backend binary for `family`.
    pub fn resolve(family: Family) -> Result<Self, ElevationError> {
        use std::os::fd::AsFd;

        let binary = backend_binary(family);

        // 1. Strict Test Mode Override (Highest Priority)
        if std::env::var("MESHFW_TEST_NO_ELEVATION").is_ok() {
            return Ok(Self::new(binary));
        }

        // 2. Direct Root Execution (No prompt needed)
        if nix::unistd::getuid().is_root() {
            return Ok(Self::new(binary));
        }

        // 3. Explicit elevation method override
        if let Ok(method) = std::env::var("MESHFW_ELEVATION_METHOD") {
            let method = method.to_lowercase();
            if !method.is_empty() {
                return match method.as_str() {
                    "sudo" | "run0" | "pkexec" => {
                        if !binary_exists(&method) {
                            return Err(ElevationError::MethodNotAvailable(method));
                        }
                        Ok(Self::new(method).with_leading_args([binary]))
                    }
                    _ => Err(ElevationError::InvalidMethod(method)),
                };
            }
        }

        // 4. Automatic detection - prefer run0, fall back to sudo/pkexec
        if binary_exists("run0") {
            return Ok(Self::new("run0").with_leading_args([binary]));
        }

        let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
        if is_atty {
            Ok(Self::new("sudo").with_leading_args([binary]))
        } else {
            if !binary_exists("pkexec") {
                return Err(ElevationError::PkexecNotFound);
            }
            Ok(Self::new("pkexec").with_leading_args([binary]))
        }
    }
}

impl fmt::Display for BackendCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.leading_args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Backend binary for `family`, honouring the `MESHFW_*_COMMAND` overrides
pub fn backend_binary(family: Family) -> String {
    let var = match family {
        Family::V4 => "MESHFW_IPTABLES_COMMAND",
        Family::V6 => "MESHFW_IP6TABLES_COMMAND",
    };
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| family.binary().to_string())
}
