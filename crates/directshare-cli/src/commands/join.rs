//! Join command implementation.

use anyhow::{bail, Context, Result};

use directshare_core::node::Node;

use super::JoinArgs;
use crate::ui;

/// Run the join command.
pub async fn run(args: JoinArgs) -> Result<()> {
    for file in &args.files {
        if !file.is_file() {
            bail!("Not a file: {}", file.display());
        }
    }

    let node = Node::new(super::load_config());
    if !args.quiet {
        node.events().on_transfer_progress(ui::print_progress);
    }

    super::start_node(&node).await?;

    let result = send_all(&node, &args).await;
    node.stop().await;
    result
}

async fn send_all(node: &Node, args: &JoinArgs) -> Result<()> {
    let connection = node
        .join_group(&args.address)
        .await
        .with_context(|| format!("Failed to join {}", args.address))?;

    if !args.quiet {
        println!();
        println!("  Joined group at {}", connection.peer_addr());
        println!("  Sending {} file(s)...", args.files.len());
        println!();
    }

    for file in &args.files {
        let result = node
            .send_file(file)
            .await
            .with_context(|| format!("Failed to send {}", file.display()))?;
        if !args.quiet {
            ui::print_result(&result);
        }
    }

    if !args.quiet {
        println!();
        println!("  Done.");
    }

    node.leave_group().await;
    Ok(())
}
