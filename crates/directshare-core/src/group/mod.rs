//! Group formation.
//!
//! A group is one TCP connection between two nodes. The owner advertises the
//! group over discovery and waits; the joiner connects to the owner's
//! transfer port and writes a single unframed handshake:
//!
//! ```text
//! JOIN:<name>:<address>
//! ```
//!
//! Either side ends up with a [`GroupConnection`]. A node holds at most one;
//! installing a new connection closes the previous one.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::NetworkConfig;
use crate::connection::{parse_host_address, GroupConnection};
use crate::discovery::{DiscoveryService, LocalDevice};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::protocol::{JoinMessage, MAX_MESSAGE_SIZE};

/// Which side of the group this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupRole {
    /// Not part of a group
    #[default]
    None,
    /// Created the group and accepts the joiner
    Owner,
    /// Connected to an owner
    Joiner,
}

/// Lifecycle of a node's group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    /// Nothing running
    #[default]
    Stopped,
    /// Listening and announcing, no group
    Discovering,
    /// Group created, waiting for a joiner
    OwnerWaiting,
    /// Connecting to an owner
    Joining,
    /// A group connection is up
    Connected,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Discovering => "discovering",
            Self::OwnerWaiting => "waiting for a peer",
            Self::Joining => "joining",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct GroupState {
    role: GroupRole,
    state: NodeState,
    connection: Option<GroupConnection>,
}

struct Shared {
    config: NetworkConfig,
    local: LocalDevice,
    events: Arc<EventBus>,
    group: Mutex<GroupState>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Turns a discovered peer into the node's single group connection.
pub struct GroupCoordinator {
    shared: Arc<Shared>,
    discovery: Arc<DiscoveryService>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for GroupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCoordinator")
            .field("role", &self.role())
            .field("state", &self.state())
            .field("listen_addr", &self.listen_addr())
            .finish_non_exhaustive()
    }
}

impl GroupCoordinator {
    /// Create a stopped coordinator.
    #[must_use]
    pub fn new(config: NetworkConfig, discovery: Arc<DiscoveryService>, events: Arc<EventBus>) -> Self {
        let local = discovery.local_device().clone();
        Self {
            shared: Arc::new(Shared {
                config,
                local,
                events,
                group: Mutex::new(GroupState::default()),
            }),
            discovery,
            running: Mutex::new(None),
        }
    }

    /// Bind the transfer listener and spawn the accept loop.
    ///
    /// Starting an already running coordinator does nothing.
    ///
    /// # Errors
    ///
    /// Returns `Error::Bind` if the listener cannot be bound.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let addr = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            self.shared.config.transfer_port,
        ));
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            what: "transfer listener",
            addr,
            source,
        })?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            shutdown.clone(),
        ));

        let mut running = self.lock_running();
        if running.is_some() {
            // Lost a race with a concurrent start; keep the first listener.
            shutdown.cancel();
            return Ok(());
        }
        *running = Some(Running {
            local_addr,
            shutdown,
            task,
        });
        drop(running);

        self.shared.with_group(|group| {
            if group.state == NodeState::Stopped {
                group.state = NodeState::Discovering;
            }
        });
        tracing::info!("Listening for group connections on {local_addr}");
        Ok(())
    }

    /// Stop accepting, close the active connection and reset the role.
    pub async fn stop(&self) {
        let running = self.lock_running().take();
        if let Some(running) = running {
            running.shutdown.cancel();
            if let Err(e) = running.task.await {
                tracing::warn!("Accept loop ended abnormally: {e}");
            }
        }

        let previous = self.shared.with_group(|group| {
            group.role = GroupRole::None;
            group.state = NodeState::Stopped;
            group.connection.take()
        });
        if let Some(connection) = previous {
            connection.close().await;
        }
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Address the transfer listener is bound to.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.lock_running().as_ref().map(|running| running.local_addr)
    }

    /// Become a group owner and advertise it.
    ///
    /// No connection is opened; the joiner connects to us.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotRunning` if discovery is stopped.
    pub async fn create_group(&self) -> Result<()> {
        if !self.discovery.is_running() {
            return Err(Error::NotRunning("creating a group"));
        }

        self.shared.with_group(|group| {
            group.role = GroupRole::Owner;
            group.state = NodeState::OwnerWaiting;
        });
        tracing::info!("Created group as {}", self.shared.local.name);

        self.discovery.broadcast_group_created().await
    }

    /// Connect to a group owner and perform the handshake.
    ///
    /// `peer_address` is an IP, optionally with a port; the configured
    /// transfer port is used when none is given.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotRunning` if discovery or the listener is stopped
    /// (including a stop that lands mid-join), `Error::InvalidInput` if the
    /// address cannot be parsed, and
    /// `Error::HandshakeFailed` if the connection or handshake fails.
    pub async fn join_group(&self, peer_address: &str) -> Result<GroupConnection> {
        if !self.discovery.is_running() {
            return Err(Error::NotRunning("joining a group"));
        }
        let shutdown = self
            .shutdown_token()
            .ok_or(Error::NotRunning("joining a group"))?;
        let addr = parse_host_address(peer_address, self.shared.config.transfer_port)?;

        let claimed = self.shared.with_group(|group| {
            if shutdown.is_cancelled() {
                return false;
            }
            group.role = GroupRole::Joiner;
            group.state = NodeState::Joining;
            true
        });
        if !claimed {
            return Err(Error::NotRunning("joining a group"));
        }
        tracing::info!("Joining group at {addr}");

        let attempt = tokio::select! {
            biased;
            () = shutdown.cancelled() => Err(Error::NotRunning("joining a group")),
            attempt = self.connect_and_handshake(addr) => attempt,
        };

        match attempt {
            Ok(connection) => {
                let status = addr.ip().to_string();
                if self.shared.install(connection.clone(), status, &shutdown).await {
                    Ok(connection)
                } else {
                    Err(Error::NotRunning("joining a group"))
                }
            }
            Err(e @ Error::NotRunning(_)) => {
                tracing::info!("Join to {addr} abandoned, coordinator stopped");
                Err(e)
            }
            Err(e) => {
                tracing::warn!("Failed to join group at {addr}: {e}");
                self.shared.with_group(|group| {
                    if group.state == NodeState::Joining {
                        group.role = GroupRole::None;
                        group.state = NodeState::Discovering;
                    }
                });
                self.shared
                    .events
                    .connection_status(false, format!("Failed to connect: {e}"));
                Err(Error::HandshakeFailed(e.to_string()))
            }
        }
    }

    async fn connect_and_handshake(&self, addr: SocketAddr) -> Result<GroupConnection> {
        let connect_timeout = self.shared.config.connect_timeout;
        let mut stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::PeerUnreachable {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::Timeout(connect_timeout.as_secs())),
        };

        let join = JoinMessage::new(&self.shared.local.name, self.shared.local.address.to_string());
        write_handshake(&mut stream, &join, self.shared.config.handshake_timeout).await?;

        GroupConnection::new(stream, addr.ip().to_string())
    }

    /// Close the active connection but keep listening.
    pub async fn disconnect(&self) {
        let previous = self.shared.with_group(|group| {
            group.role = GroupRole::None;
            if group.state != NodeState::Stopped {
                group.state = NodeState::Discovering;
            }
            group.connection.take()
        });

        if let Some(connection) = previous {
            connection.close().await;
            self.shared.events.connection_status(false, "Disconnected");
        }
    }

    /// Whether an open group connection exists.
    pub fn is_connected(&self) -> bool {
        self.shared
            .with_group(|group| group.connection.as_ref().is_some_and(|c| !c.is_closed()))
    }

    /// The active group connection, if open.
    pub fn connection(&self) -> Option<GroupConnection> {
        self.shared.with_group(|group| {
            group
                .connection
                .as_ref()
                .filter(|c| !c.is_closed())
                .cloned()
        })
    }

    /// Current group role.
    pub fn role(&self) -> GroupRole {
        self.shared.with_group(|group| group.role)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.shared.with_group(|group| group.state)
    }

    fn shutdown_token(&self) -> Option<CancellationToken> {
        self.lock_running()
            .as_ref()
            .map(|running| running.shutdown.clone())
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for GroupCoordinator {
    fn drop(&mut self) {
        if let Some(running) = self.lock_running().take() {
            running.shutdown.cancel();
        }
    }
}

impl Shared {
    fn with_group<T>(&self, f: impl FnOnce(&mut GroupState) -> T) -> T {
        let mut group = self.group.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut group)
    }

    /// Make `connection` the active one, closing whatever it replaces.
    ///
    /// Refuses and closes `connection` once `shutdown` has fired, so nothing
    /// is installed on a stopped coordinator. `stop` cancels before it clears
    /// the group state, and the check happens under the same lock.
    async fn install(&self, connection: GroupConnection, status: String, shutdown: &CancellationToken) -> bool {
        let installed = self.with_group(|group| {
            if shutdown.is_cancelled() {
                return None;
            }
            if group.role == GroupRole::None {
                group.role = GroupRole::Owner;
            }
            group.state = NodeState::Connected;
            Some(group.connection.replace(connection.clone()))
        });
        let Some(previous) = installed else {
            tracing::debug!("Dropping connection from {}, coordinator stopped", connection.peer_addr());
            connection.close().await;
            return false;
        };

        if let Some(previous) = previous {
            tracing::info!("Replacing connection to {}", previous.peer_addr());
            previous.close().await;
        }

        tracing::info!(
            "Group connection established with {} ({})",
            connection.peer_name(),
            connection.peer_addr()
        );
        self.events.connection_established(&connection);
        self.events.connection_status(true, status);
        true
    }
}

async fn write_handshake(stream: &mut TcpStream, join: &JoinMessage, limit: Duration) -> Result<()> {
    let payload = join.to_string();
    timeout(limit, async {
        stream.write_all(payload.as_bytes()).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| Error::Timeout(limit.as_secs()))??;
    Ok(())
}

async fn read_handshake(stream: &mut TcpStream, limit: Duration) -> Result<JoinMessage> {
    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    let n = timeout(limit, stream.read(&mut buf))
        .await
        .map_err(|_| Error::Timeout(limit.as_secs()))??;
    if n == 0 {
        return Err(Error::ProtocolError("connection closed before handshake".to_string()));
    }
    JoinMessage::parse(&String::from_utf8_lossy(&buf[..n]))
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                tracing::debug!("Incoming connection from {addr}");
                tokio::spawn(handle_incoming(Arc::clone(&shared), stream, addr, shutdown.clone()));
            }
            Err(e) => {
                tracing::warn!("Error accepting connection: {e}");
                // Avoid spinning when the listener keeps failing (e.g. EMFILE).
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    tracing::debug!("Accept loop stopped");
}

async fn handle_incoming(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr, shutdown: CancellationToken) {
    let handshake = tokio::select! {
        biased;
        () = shutdown.cancelled() => {
            tracing::debug!("Abandoning handshake from {addr}, coordinator stopped");
            return;
        }
        handshake = read_handshake(&mut stream, shared.config.handshake_timeout) => handshake,
    };
    let join = match handshake {
        Ok(join) => join,
        Err(e) => {
            tracing::warn!("Rejected connection from {addr}: {e}");
            return;
        }
    };

    tracing::info!("Peer {} ({}) joined from {addr}", join.name, join.address);
    match GroupConnection::new(stream, join.name) {
        Ok(connection) => {
            shared.install(connection, join.address, &shutdown).await;
        }
        Err(e) => tracing::warn!("Failed to set up connection from {addr}: {e}"),
    }
}
