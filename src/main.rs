//! meshfw - operator CLI
//!
//! Thin front end over [`meshfw::RoutingManager`] for bringing a node's
//! firewall chains up and down by hand. Per-client authorization is driven by
//! the proxy through the library, not from here.
//!
//! # Usage
//!
//! ```bash
//! meshfw check                       # Backend, config and interface sanity
//! meshfw init                        # (Re)create chains and jump rules
//! meshfw flush                       # Remove chains and jump rules
//! meshfw config                      # Print the effective config
//! meshfw config --write              # Persist it to the config path
//! meshfw --config ./node.json init   # Use an explicit config file
//! meshfw --log-file init             # Log to ~/.local/state/meshfw/meshfw.log
//! ```

use clap::{Parser, Subcommand};
use meshfw::config::{self, NodeConfig};
use meshfw::core::actuator::is_iptables_supported;
use meshfw::core::error::IptablesErrorPattern;
use meshfw::elevation::BackendCommand;
use meshfw::{Error, Family, Result, RoutingManager};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "meshfw")]
#[command(about = "Firewall rule reconciliation for mesh VPN proxy nodes", long_about = None)]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs to meshfw.log in the state directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reset and create the custom chains and jump rules for both families
    Init,
    /// Remove the jump rules and custom chains for both families
    Flush,
    /// Check that iptables is usable and the config is valid
    Check,
    /// Print the effective configuration
    Config {
        /// Save the effective configuration to the config path
        #[arg(short, long)]
        write: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_file);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            print_hint(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(to_file: bool) {
    if to_file
        && let Some(mut log_path) = meshfw::utils::get_state_dir()
        && meshfw::utils::ensure_dirs().is_ok()
    {
        log_path.push("meshfw.log");
        if let Ok(file) = std::fs::File::create(log_path) {
            tracing_subscriber::fmt().with_writer(file).init();
            return;
        }
    }
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
}

/// Translated hint for backend failures
fn print_hint(err: &Error) {
    let raw = match err {
        Error::Iptables { .. } => err.backend_stderr().map_or_else(|| err.to_string(), String::from),
        Error::BackendUnavailable(_) | Error::Elevation(_) => err.to_string(),
        _ => return,
    };
    let translation = IptablesErrorPattern::match_error(&raw);
    eprintln!("{}", translation.user_message);
    for suggestion in translation.suggestions {
        eprintln!("  - {suggestion}");
    }
}

async fn resolve_config(path: Option<&Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => config::load_config_from(path).await,
        None => Ok(config::load_config().await),
    }
}

async fn handle_cli(cli: Cli) -> Result<()> {
    let node = resolve_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Init => {
            let manager = RoutingManager::from_config(&node)?;
            manager.initialize_chains().await?;
            println!(
                "✓ Chains {} / {} ready on {}",
                node.filter_chain, node.nat_chain, node.interface_name
            );
        }
        Commands::Flush => {
            let manager = RoutingManager::from_config(&node)?;
            let failed = manager.flush_all().await;
            if failed > 0 {
                return Err(Error::Internal(format!(
                    "{failed} teardown step(s) failed, see log for details"
                )));
            }
            println!("✓ meshfw chains removed");
        }
        Commands::Check => check(&node)?,
        Commands::Config { write } => {
            println!("{}", serde_json::to_string_pretty(&node)?);
            if write {
                let path = cli
                    .config
                    .or_else(config::default_config_path)
                    .ok_or_else(|| Error::Internal("config directory not found".to_string()))?;
                node.validate()?;
                config::save_config_to(&node, &path).await?;
                println!("✓ Saved to {}", path.display());
            }
        }
    }
    Ok(())
}

fn check(node: &NodeConfig) -> Result<()> {
    node.validate()?;
    println!("✓ Config valid");

    if !is_iptables_supported() {
        return Err(Error::BackendUnavailable(
            "iptables and ip6tables must both be installed".to_string(),
        ));
    }
    let command = BackendCommand::resolve(Family::V4)?;
    println!("✓ iptables available (invoked as: {command})");

    if meshfw::utils::list_interfaces().contains(&node.interface_name) {
        println!("✓ Interface {} present", node.interface_name);
    } else {
        // Chains can be created before the VPN interface comes up
        println!("! Interface {} not found", node.interface_name);
    }
    Ok(())
}
