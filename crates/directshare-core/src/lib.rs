//! # DirectShare Core Library
//!
//! `directshare-core` lets hosts on the same local network find each other,
//! pair up into an ad-hoc one-to-one "group", and push files across that
//! connection with progress reporting, cancellation and CRC-32 verification.
//!
//! ## Features
//!
//! - **Broadcast discovery**: periodic UDP beacons on a fixed port, with a
//!   multicast group joined for hosts that relay announcements that way
//! - **Group formation**: one side creates a group, the other joins it over
//!   TCP with a short textual handshake
//! - **Chunked transfers**: 128 KiB chunks, throttled progress events and
//!   cooperative cancellation
//! - **Bounded concurrency**: asynchronous submissions share a fixed-size
//!   worker pool
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`connection`] - The active group connection handle and address parsing
//! - [`discovery`] - Peer announcements and the discovery receive loop
//! - [`events`] - Listener registration and event fan-out
//! - [`mod@file`] - Checksums, file name sanitization and size formatting
//! - [`group`] - Group creation, joining and the handshake accept loop
//! - [`node`] - The context object tying everything together
//! - [`peer`] - Registry of discovered peers
//! - [`protocol`] - Datagram, handshake and transfer header formats
//! - [`transfer`] - File transfer engine
//!
//! ## Example
//!
//! ```rust,ignore
//! use directshare_core::config::Config;
//! use directshare_core::node::Node;
//!
//! let node = Node::new(Config::load()?);
//! node.events().on_peer_discovered(|peer| println!("found {}", peer.name));
//! node.start().await?;
//! node.join_group("192.168.1.20").await?;
//! node.send_file("report.pdf").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod file;
pub mod group;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod transfer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name carried in discovery announcements
pub const SERVICE_NAME: &str = "WiFiDirectFileShare";

/// Default discovery port (UDP)
pub const DEFAULT_DISCOVERY_PORT: u16 = 8888;

/// Default transfer and handshake port (TCP)
pub const DEFAULT_TRANSFER_PORT: u16 = 8889;

/// Multicast group joined by the discovery socket
pub const DEFAULT_MULTICAST_GROUP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(230, 0, 0, 1);

/// Interval between self-announcements in seconds
pub const DEFAULT_ANNOUNCE_INTERVAL_SECS: u64 = 5;

/// Default chunk size for file transfers (128 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Maximum number of transfers running at once
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 4;

/// Idle timeout for transfer reads and writes in seconds
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 300;
