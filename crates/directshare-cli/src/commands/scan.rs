//! Scan command implementation.

use anyhow::{Context, Result};

use directshare_core::node::Node;
use directshare_core::peer::PeerDevice;

use super::ScanArgs;
use crate::ui::{parse_duration, truncate_string};

/// Run the scan command.
pub async fn run(args: ScanArgs) -> Result<()> {
    let config = super::load_config();

    let duration = parse_duration(&args.duration)
        .context("Invalid duration format. Use formats like '5s', '10s', '1m'")?;

    if !args.json {
        println!();
        println!("Scanning for devices ({})...", args.duration);
        println!();
    }

    let node = Node::new(config);
    if !args.json {
        node.events().on_peer_discovered(|peer| {
            println!("  found {} at {}", peer.name, peer.address);
        });
    }

    super::start_node(&node).await?;
    tokio::time::sleep(duration).await;
    let peers = node.peers();
    node.stop().await;

    if args.json {
        output_json_peers(&peers)?;
    } else {
        println!();
        display_peers(&peers);
    }

    Ok(())
}

/// Output peers as JSON.
fn output_json_peers(peers: &[PeerDevice]) -> Result<()> {
    let output = serde_json::json!({
        "peers": peers.iter().map(|p| serde_json::json!({
            "name": p.name,
            "address": p.address,
            "discovered_at": p.discovery_time.to_rfc3339(),
        })).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Display peers as text table.
fn display_peers(peers: &[PeerDevice]) {
    println!("Devices on Network:");
    println!("{}", "─".repeat(60));
    println!("  {:24}  {:16}  {:10}", "Device", "Address", "Seen");
    println!("{}", "─".repeat(60));

    if peers.is_empty() {
        println!("  (no devices found)");
        println!("{}", "─".repeat(60));
        return;
    }

    for peer in peers {
        println!(
            "  {:24}  {:16}  {:10}",
            truncate_string(&peer.name, 24),
            peer.address,
            peer.discovery_time.format("%H:%M:%S").to_string(),
        );
    }

    println!("{}", "─".repeat(60));
}
