//! Common test utilities for DirectShare integration tests.
//!
//! This module provides shared functionality for integration tests.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use directshare_core::config::Config;
use directshare_core::discovery::LocalDevice;
use directshare_core::events::EventBus;
use directshare_core::node::Node;
use directshare_core::transfer::TransferProgress;

/// Base port for tests, incremented for each test to avoid conflicts.
static TEST_PORT_COUNTER: AtomicU16 = AtomicU16::new(47600);

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &std::path::Path, path2: &std::path::Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1, content2, "File contents differ");
}

/// Get unique ports for a test to avoid conflicts between parallel tests.
/// Returns (`discovery_port`, `transfer_port`).
pub fn get_test_ports() -> (u16, u16) {
    let base = TEST_PORT_COUNTER.fetch_add(2, Ordering::SeqCst);
    (base, base + 1)
}

/// Configuration bound to loopback on fresh ports, announcing to loopback.
pub fn loopback_config(name: &str) -> Config {
    let (discovery_port, transfer_port) = get_test_ports();
    let mut config = Config::default();
    config.general.device_name = name.to_string();
    config.network.discovery_port = discovery_port;
    config.network.transfer_port = transfer_port;
    config.network.announce_address = Ipv4Addr::LOCALHOST;
    config.network.connect_timeout = Duration::from_secs(2);
    config.network.handshake_timeout = Duration::from_secs(2);
    config
}

/// Node with a fixed advertised address so self-filtering is predictable.
pub fn loopback_node(name: &str, advertised: Ipv4Addr) -> Node {
    Node::with_identity(loopback_config(name), LocalDevice::new(name, advertised))
}

/// Record every progress event published on `events`.
pub fn record_progress(events: &EventBus) -> Arc<Mutex<Vec<TransferProgress>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    events.on_transfer_progress(move |progress| {
        sink.lock().unwrap().push(progress.clone());
    });
    seen
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
