//! Utility functions for directory management and system integration
//!
//! Follows the XDG Base Directory specification:
//!
//! - Config: `~/.config/meshfw/` - node configuration (`config.json`)
//! - State: `~/.local/state/meshfw/` - audit log, CLI log file
//!
//! When running as root these resolve under `/root`.

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "meshfw", "meshfw")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        if let Some(dir) = get_config_dir() {
            builder.create(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_config_dir() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}

/// Network interfaces present on the host, sorted, loopback excluded
pub fn list_interfaces() -> Vec<String> {
    let mut interfaces = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
        for entry in entries.flatten() {
            if let Ok(name) = entry.file_name().into_string()
                && name != "lo"
            {
                interfaces.push(name);
            }
        }
    }
    interfaces.sort();
    interfaces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_interfaces_sorted_without_loopback() {
        let interfaces = list_interfaces();
        assert!(!interfaces.iter().any(|i| i == "lo"));
        assert!(interfaces.windows(2).all(|w| w[0] <= w[1]));
    }
}
