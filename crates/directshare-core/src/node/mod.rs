//! The explicit context object owning every DirectShare service.
//!
//! A [`Node`] is created from a [`Config`], started once, and then used to
//! form a group and move files over it. Nothing is global: two nodes in one
//! process are fully independent as long as their ports differ.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::connection::{local_ipv4, GroupConnection};
use crate::discovery::{DiscoveryService, LocalDevice};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::group::{GroupCoordinator, GroupRole, NodeState};
use crate::peer::{PeerDevice, PeerRegistry};
use crate::transfer::{TransferEngine, TransferProgress, TransferResult, TransferStatistics, TransferTask};

/// One DirectShare participant.
#[derive(Debug)]
pub struct Node {
    config: Config,
    events: Arc<EventBus>,
    registry: Arc<PeerRegistry>,
    discovery: Arc<DiscoveryService>,
    group: GroupCoordinator,
    engine: TransferEngine,
}

impl Node {
    /// Build a stopped node.
    ///
    /// The advertised address is `network.local_address` when set, otherwise
    /// the address of the interface holding the default route.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let address = config.network.local_address.unwrap_or_else(local_ipv4);
        let local = LocalDevice::new(config.general.device_name.clone(), address);
        Self::with_identity(config, local)
    }

    /// Build a stopped node announcing an explicit identity.
    #[must_use]
    pub fn with_identity(config: Config, local: LocalDevice) -> Self {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(PeerRegistry::new());
        let discovery = Arc::new(DiscoveryService::new(
            config.network.clone(),
            local,
            Arc::clone(&registry),
            Arc::clone(&events),
        ));
        let group = GroupCoordinator::new(
            config.network.clone(),
            Arc::clone(&discovery),
            Arc::clone(&events),
        );
        let engine = TransferEngine::new(config.transfer.clone(), Arc::clone(&events));

        Self {
            config,
            events,
            registry,
            discovery,
            group,
            engine,
        }
    }

    /// Start discovery and the group listener.
    ///
    /// # Errors
    ///
    /// Returns `Error::Bind` if any socket cannot be bound; nothing is left
    /// running in that case.
    pub async fn start(&self) -> Result<()> {
        self.discovery.start()?;
        if let Err(e) = self.group.start().await {
            self.discovery.stop().await;
            return Err(e);
        }
        tracing::info!("Node {} started", self.discovery.local_device().name);
        Ok(())
    }

    /// Cancel transfers, close the group connection and stop all loops.
    pub async fn stop(&self) {
        let active = self.engine.active_transfers();
        for transfer in &active {
            self.engine.cancel(&transfer.transfer_id);
        }
        self.group.stop().await;
        self.discovery.stop().await;
        tracing::info!("Node stopped");
    }

    /// Create a group and wait for a joiner.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotRunning` if the node is not started.
    pub async fn create_group(&self) -> Result<()> {
        self.group.create_group().await
    }

    /// Join the group owned by `peer_address`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotRunning` if the node is not started, or
    /// `Error::HandshakeFailed` if the owner cannot be reached.
    pub async fn join_group(&self, peer_address: &str) -> Result<GroupConnection> {
        self.group.join_group(peer_address).await
    }

    /// Close the group connection, keeping discovery running.
    pub async fn leave_group(&self) {
        self.group.disconnect().await;
    }

    /// Send a file over the group connection and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` without a group connection, otherwise
    /// whatever the transfer failed with.
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<TransferResult> {
        let connection = self.connection()?;
        self.engine.send_over(path, &connection).await
    }

    /// Receive one file over the group connection into the download
    /// directory and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` without a group connection, otherwise
    /// whatever the transfer failed with.
    pub async fn receive_file(&self) -> Result<TransferResult> {
        self.receive_file_into(&self.config.general.download_dir).await
    }

    /// Receive one file over the group connection into `save_dir`.
    ///
    /// # Errors
    ///
    /// As [`receive_file`](Self::receive_file).
    pub async fn receive_file_into(&self, save_dir: impl AsRef<Path>) -> Result<TransferResult> {
        let connection = self.connection()?;
        self.engine.receive_over(&connection, save_dir).await
    }

    /// Queue a send over the group connection on the transfer pool.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` without a group connection.
    pub fn send_file_async(&self, path: impl Into<PathBuf>) -> Result<TransferTask> {
        let connection = self.connection()?;
        Ok(self.engine.send_over_async(path, connection))
    }

    /// Queue a receive over the group connection on the transfer pool.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` without a group connection.
    pub fn receive_file_async(&self, save_dir: impl Into<PathBuf>) -> Result<TransferTask> {
        let connection = self.connection()?;
        Ok(self.engine.receive_over_async(connection, save_dir))
    }

    /// Request cancellation of a transfer.
    pub fn cancel_transfer(&self, transfer_id: &str) -> bool {
        self.engine.cancel(transfer_id)
    }

    /// Progress of one active transfer.
    pub fn transfer_progress(&self, transfer_id: &str) -> Option<TransferProgress> {
        self.engine.transfer_progress(transfer_id)
    }

    /// Progress of every active transfer.
    pub fn active_transfers(&self) -> Vec<TransferProgress> {
        self.engine.active_transfers()
    }

    /// Transfer totals.
    pub fn statistics(&self) -> TransferStatistics {
        self.engine.statistics()
    }

    /// Every peer seen so far.
    pub fn peers(&self) -> Vec<PeerDevice> {
        self.registry.peers()
    }

    /// Listener registration and event subscription.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The transfer engine, for streams other than the group connection.
    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    /// Identity this node announces.
    pub fn local_device(&self) -> &LocalDevice {
        self.discovery.local_device()
    }

    /// Configuration the node was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether a group connection is open.
    pub fn is_connected(&self) -> bool {
        self.group.is_connected()
    }

    /// Whether discovery is running.
    pub fn is_discovering(&self) -> bool {
        self.discovery.is_running()
    }

    /// The open group connection, if any.
    pub fn group_connection(&self) -> Option<GroupConnection> {
        self.group.connection()
    }

    /// Group role.
    pub fn role(&self) -> GroupRole {
        self.group.role()
    }

    /// Lifecycle state.
    pub fn state(&self) -> NodeState {
        self.group.state()
    }

    /// Address the transfer listener is bound to, once started.
    pub fn listen_addr(&self) -> Option<std::net::SocketAddr> {
        self.group.listen_addr()
    }

    fn connection(&self) -> Result<GroupConnection> {
        self.group.connection().ok_or(Error::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_new_node_is_stopped() {
        let node = Node::with_identity(
            Config::default(),
            LocalDevice::new("unit", Ipv4Addr::new(10, 1, 1, 1)),
        );

        assert_eq!(node.state(), NodeState::Stopped);
        assert_eq!(node.role(), GroupRole::None);
        assert!(!node.is_connected());
        assert!(!node.is_discovering());
        assert!(node.peers().is_empty());
        assert_eq!(node.local_device().address, Ipv4Addr::new(10, 1, 1, 1));
    }

    #[tokio::test]
    async fn test_transfers_need_connection() {
        let node = Node::with_identity(
            Config::default(),
            LocalDevice::new("unit", Ipv4Addr::new(10, 1, 1, 1)),
        );

        assert!(matches!(node.send_file("x").await, Err(Error::NotConnected)));
        assert!(matches!(node.receive_file_into("/tmp").await, Err(Error::NotConnected)));
        assert!(matches!(node.send_file_async("x"), Err(Error::NotConnected)));
        assert!(matches!(node.receive_file_async("/tmp"), Err(Error::NotConnected)));
        assert!(!node.cancel_transfer("nope"));
    }

    #[test]
    fn test_local_address_override() {
        let mut config = Config::default();
        config.network.local_address = Some(Ipv4Addr::new(192, 168, 77, 5));
        let node = Node::new(config);
        assert_eq!(node.local_device().address, Ipv4Addr::new(192, 168, 77, 5));
    }
}
