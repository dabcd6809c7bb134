//! Host command implementation.

use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

use directshare_core::connection::GroupConnection;
use directshare_core::events::Event;
use directshare_core::node::Node;
use directshare_core::Error;

use super::HostArgs;
use crate::ui::{self, AddressBox};

/// Run the host command.
pub async fn run(args: HostArgs) -> Result<()> {
    let config = super::load_config();
    let output_dir = args
        .output
        .clone()
        .unwrap_or_else(|| config.general.download_dir.clone());

    let node = Node::new(config);
    if !args.quiet {
        node.events().on_transfer_progress(ui::print_progress);
    }
    let mut feed = node.events().subscribe();

    super::start_node(&node).await?;
    node.create_group().await.context("Failed to create group")?;

    let port = node.listen_addr().map_or(node.config().network.transfer_port, |a| a.port());
    let address = format!("{}:{}", node.local_device().address, port);

    if !args.quiet {
        println!();
        println!("DirectShare - Hosting a group");
        println!();
        AddressBox::new(&address)
            .with_device(&node.local_device().name)
            .display();
        println!();
        println!("  Saving to {}", output_dir.display());
        println!("  Waiting for a device to join... (Ctrl+C to stop)");
        println!();
    }

    let outcome = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            None
        }
        connection = wait_for_joiner(&mut feed) => connection,
    };

    if let Some(connection) = outcome {
        if !args.quiet {
            println!("  {} joined from {}", connection.peer_name(), connection.peer_addr().ip());
            println!();
        }

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
            }
            received = receive_until_closed(&node, &output_dir, args.quiet) => {
                if !args.quiet {
                    println!();
                    println!("  Connection closed, {received} file(s) received.");
                }
            }
        }
    }

    node.stop().await;
    Ok(())
}

async fn wait_for_joiner(feed: &mut Receiver<Event>) -> Option<GroupConnection> {
    loop {
        match feed.recv().await {
            Ok(Event::ConnectionEstablished(connection)) => return Some(connection),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return None,
        }
    }
}

/// What the host session does after a receive fails.
#[derive(Debug, PartialEq, Eq)]
enum AfterFailure {
    /// The whole file was consumed, the stream is still in step
    KeepReceiving,
    /// The peer closed the connection
    PeerGone,
    /// Bytes may be left half read; the connection cannot carry another file
    CloseGroup,
}

fn after_failure(error: &Error) -> AfterFailure {
    match error {
        Error::IntegrityCheckFailed { .. } => AfterFailure::KeepReceiving,
        Error::NotConnected => AfterFailure::PeerGone,
        Error::Io(e) if e.kind() == ErrorKind::UnexpectedEof => AfterFailure::PeerGone,
        _ => AfterFailure::CloseGroup,
    }
}

/// Receive files until the peer goes away. Returns how many were saved.
async fn receive_until_closed(node: &Node, output_dir: &Path, quiet: bool) -> usize {
    let mut received = 0;

    loop {
        let error = match node.receive_file_into(output_dir).await {
            Ok(result) => {
                received += 1;
                if !quiet {
                    ui::print_result(&result);
                }
                continue;
            }
            Err(e) => e,
        };

        match after_failure(&error) {
            AfterFailure::PeerGone => return received,
            AfterFailure::KeepReceiving => {
                if !quiet {
                    println!();
                }
                eprintln!("  Transfer failed: {error}");
            }
            AfterFailure::CloseGroup => {
                if !quiet {
                    println!();
                }
                match error {
                    Error::Timeout(secs) => eprintln!("  Peer idle for {secs}s, closing the group."),
                    other => eprintln!("  Transfer failed: {other}"),
                }
                node.leave_group().await;
                return received;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_closes_the_group() {
        assert_eq!(after_failure(&Error::Timeout(300)), AfterFailure::CloseGroup);
        assert_eq!(
            after_failure(&Error::ProtocolError("negative file size: -1".into())),
            AfterFailure::CloseGroup
        );
        assert_eq!(after_failure(&Error::TransferCancelled), AfterFailure::CloseGroup);
    }

    #[test]
    fn test_checksum_mismatch_keeps_receiving() {
        let error = Error::IntegrityCheckFailed {
            file: "a.bin".into(),
            expected: 1,
            actual: 2,
        };
        assert_eq!(after_failure(&error), AfterFailure::KeepReceiving);
    }

    #[test]
    fn test_closed_connection_ends_quietly() {
        let eof = std::io::Error::new(ErrorKind::UnexpectedEof, "early eof");
        assert_eq!(after_failure(&Error::Io(eof)), AfterFailure::PeerGone);
        assert_eq!(after_failure(&Error::NotConnected), AfterFailure::PeerGone);

        let reset = std::io::Error::new(ErrorKind::ConnectionReset, "reset");
        assert_eq!(after_failure(&Error::Io(reset)), AfterFailure::CloseGroup);
    }
}
