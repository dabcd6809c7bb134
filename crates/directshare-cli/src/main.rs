//! DirectShare CLI - ad-hoc local network file sharing
//!
//! Devices find each other by broadcasting on the local network, one of them
//! hosts a group, and files flow over the single group connection.
//!
//! ## Quick Start
//!
//! ```bash
//! # Receive files (host a group)
//! directshare host --output ./incoming
//!
//! # Send files (on another device)
//! directshare join 192.168.1.20 ./document.pdf ./photo.jpg
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Scan(args) => commands::scan::run(args).await,
        Command::Host(args) => commands::host::run(args).await,
        Command::Join(args) => commands::join::run(args).await,
        Command::Config(args) => commands::config::run(&args),
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,directshare=info,directshare_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
