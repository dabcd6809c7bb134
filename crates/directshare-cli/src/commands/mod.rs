//! CLI command definitions and handlers.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Load configuration with graceful fallback to defaults.
///
/// If the config file doesn't exist or can't be parsed, it falls back to defaults.
pub fn load_config() -> directshare_core::config::Config {
    directshare_core::config::Config::load().unwrap_or_else(|e| {
        tracing::warn!("Ignoring configuration file: {}", e);
        directshare_core::config::Config::default()
    })
}

/// Start a node, explaining failures the user can act on.
pub async fn start_node(node: &directshare_core::node::Node) -> anyhow::Result<()> {
    use anyhow::Context;

    if let Err(e) = node.start().await {
        if !e.is_recoverable() {
            eprintln!("  Is another DirectShare instance using these ports?");
            eprintln!("  Ports can be changed in {}", directshare_core::config::Config::config_path().display());
        }
        return Err(e).context("Failed to start");
    }
    Ok(())
}

pub mod config;
pub mod host;
pub mod join;
pub mod scan;

/// DirectShare - ad-hoc local network file sharing
#[derive(Parser)]
#[command(name = "directshare")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Listen for devices announcing themselves on the network
    Scan(ScanArgs),

    /// Create a group and receive files from whoever joins it
    Host(HostArgs),

    /// Join a group and send files to its owner
    Join(JoinArgs),

    /// Inspect or reset configuration
    Config(ConfigArgs),
}

/// Arguments for the scan command
#[derive(Parser)]
pub struct ScanArgs {
    /// Duration to scan (e.g., 5s, 10s, 1m)
    #[arg(short, long, default_value = "10s")]
    pub duration: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the host command
#[derive(Parser)]
pub struct HostArgs {
    /// Output directory (defaults to the configured download directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the join command
#[derive(Parser)]
pub struct JoinArgs {
    /// Address of the group owner (IP or IP:PORT)
    pub address: String,

    /// Files to send, in order
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show all configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Reset to defaults
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_join_requires_files() {
        assert!(Cli::try_parse_from(["directshare", "join", "10.0.0.2"]).is_err());

        let cli = Cli::try_parse_from(["directshare", "join", "10.0.0.2:9000", "a.txt", "b.txt"])
            .expect("valid join");
        match cli.command {
            Command::Join(args) => {
                assert_eq!(args.address, "10.0.0.2:9000");
                assert_eq!(args.files.len(), 2);
            }
            _ => panic!("expected join"),
        }
    }

    #[test]
    fn test_scan_default_duration() {
        let cli = Cli::try_parse_from(["directshare", "scan"]).expect("valid scan");
        match cli.command {
            Command::Scan(args) => {
                assert_eq!(args.duration, "10s");
                assert!(!args.json);
            }
            _ => panic!("expected scan"),
        }
    }
}
