//! Peer discovery over UDP.
//!
//! Every running node periodically broadcasts a self-announcement and
//! listens for everyone else's. The receive socket also joins a multicast
//! group so that announcements relayed by multicast are seen too.
//!
//! ## Protocol
//!
//! - Port: 8888 (UDP)
//! - Multicast group: 230.0.0.1
//! - Announce interval: every 5 seconds, first one immediately
//!
//! ## Datagrams
//!
//! ```text
//! DISCOVER:WiFiDirectFileShare:Marcus-Laptop:192.168.1.20
//! GROUP_CREATED:Marcus-Laptop:192.168.1.20
//! ```
//!
//! A peer is identified by the address in the datagram, not the source
//! address of the packet. Announcements carrying our own address or another
//! service name are ignored.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::peer::{PeerRegistry, Upsert};
use crate::protocol::{DiscoveryMessage, MAX_MESSAGE_SIZE};

/// How this node presents itself to others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDevice {
    /// Announced device name
    pub name: String,
    /// Announced IPv4 address
    pub address: Ipv4Addr,
}

impl LocalDevice {
    /// Create a local identity.
    #[must_use]
    pub fn new(name: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

struct Shared {
    config: NetworkConfig,
    local: LocalDevice,
    registry: Arc<PeerRegistry>,
    events: Arc<EventBus>,
}

struct Running {
    send_socket: Arc<UdpSocket>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Announces this node and populates the peer registry from others'
/// announcements.
pub struct DiscoveryService {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("local", &self.shared.local)
            .field("discovery_port", &self.shared.config.discovery_port)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl DiscoveryService {
    /// Create a stopped discovery service.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        local: LocalDevice,
        registry: Arc<PeerRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                local,
                registry,
                events,
            }),
            running: Mutex::new(None),
        }
    }

    /// The identity this service announces.
    pub fn local_device(&self) -> &LocalDevice {
        &self.shared.local
    }

    /// Bind the sockets and spawn the receive and announce loops.
    ///
    /// Starting an already running service does nothing. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::Bind` if either socket cannot be bound.
    pub fn start(&self) -> Result<()> {
        let mut running = self.lock();
        if running.is_some() {
            return Ok(());
        }

        let config = &self.shared.config;
        let recv_socket = Arc::new(bind_receive_socket(config)?);
        let send_socket = Arc::new(bind_send_socket()?);
        let shutdown = CancellationToken::new();

        let receive_task = tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            recv_socket,
            shutdown.clone(),
        ));
        let announce_task = tokio::spawn(announce_loop(
            Arc::clone(&self.shared),
            Arc::clone(&send_socket),
            shutdown.clone(),
        ));

        tracing::info!(
            "Discovery started on port {} as {} ({})",
            config.discovery_port,
            self.shared.local.name,
            self.shared.local.address
        );

        *running = Some(Running {
            send_socket,
            shutdown,
            tasks: vec![receive_task, announce_task],
        });
        Ok(())
    }

    /// Stop both loops and release the sockets. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.lock().take() else {
            return;
        };

        running.shutdown.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                tracing::warn!("Discovery task ended abnormally: {e}");
            }
        }
        tracing::info!("Discovery stopped");
    }

    /// Whether the loops are running.
    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Send one self-announcement now.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotRunning` if the service is stopped, or an I/O error
    /// if the datagram cannot be sent.
    pub async fn announce(&self) -> Result<()> {
        let socket = self.send_socket("announcing")?;
        send_message(&self.shared, &socket, &self.shared.announcement()).await
    }

    /// Tell the network that this node created a group.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotRunning` if the service is stopped, or an I/O error
    /// if the datagram cannot be sent.
    pub async fn broadcast_group_created(&self) -> Result<()> {
        let socket = self.send_socket("creating a group")?;
        let message = DiscoveryMessage::GroupCreated {
            name: self.shared.local.name.clone(),
            address: self.shared.local.address.to_string(),
        };
        send_message(&self.shared, &socket, &message).await?;
        tracing::info!("Group creation broadcast sent");
        Ok(())
    }

    /// Apply one received datagram to the registry.
    ///
    /// Returns what happened to the registry; announcements that are ignored
    /// report [`Upsert::Unchanged`].
    ///
    /// # Errors
    ///
    /// Returns `Error::ProtocolError` if the datagram cannot be parsed.
    pub fn handle_datagram(&self, payload: &[u8]) -> Result<Upsert> {
        self.shared.handle_datagram(payload)
    }

    fn send_socket(&self, action: &'static str) -> Result<Arc<UdpSocket>> {
        self.lock()
            .as_ref()
            .map(|running| Arc::clone(&running.send_socket))
            .ok_or(Error::NotRunning(action))
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        if let Some(running) = self.lock().take() {
            running.shutdown.cancel();
        }
    }
}

impl Shared {
    fn announcement(&self) -> DiscoveryMessage {
        DiscoveryMessage::Discover {
            service: self.config.service_name.clone(),
            name: self.local.name.clone(),
            address: self.local.address.to_string(),
        }
    }

    fn handle_datagram(&self, payload: &[u8]) -> Result<Upsert> {
        let text = String::from_utf8_lossy(payload);
        let message = DiscoveryMessage::parse(&text)?;

        if let DiscoveryMessage::Discover { service, .. } = &message {
            if *service != self.config.service_name {
                tracing::debug!("Ignoring announcement for service {service}");
                return Ok(Upsert::Unchanged);
            }
        }

        if message.address() == self.local.address.to_string() {
            return Ok(Upsert::Unchanged);
        }

        let outcome = self.registry.upsert(message.name(), message.address());
        match &outcome {
            Upsert::Inserted(peer) => {
                tracing::info!("Discovered peer: {peer}");
                self.events.peer_discovered(peer);
            }
            Upsert::Renamed {
                peer,
                previous_name,
            } => {
                tracing::debug!("Peer {} renamed from {previous_name} to {}", peer.address, peer.name);
            }
            Upsert::Unchanged => {}
        }
        Ok(outcome)
    }
}

fn bind_receive_socket(config: &NetworkConfig) -> Result<UdpSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.discovery_port);
    let bind_err = |source: std::io::Error| Error::Bind {
        what: "discovery socket",
        addr: SocketAddr::V4(addr),
        source,
    };

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(bind_err)?;

    socket.set_reuse_address(true).map_err(bind_err)?;

    #[cfg(target_os = "macos")]
    socket.set_reuse_port(true).map_err(bind_err)?;

    socket.bind(&addr.into()).map_err(bind_err)?;

    if let Err(e) = socket.join_multicast_v4(&config.multicast_group, &Ipv4Addr::UNSPECIFIED) {
        tracing::warn!(
            "Failed to join multicast group {}, relying on broadcast only: {e}",
            config.multicast_group
        );
    }

    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_err)
}

fn bind_send_socket() -> Result<UdpSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    let bind_err = |source: std::io::Error| Error::Bind {
        what: "announce socket",
        addr: SocketAddr::V4(addr),
        source,
    };

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(bind_err)?;

    socket.set_broadcast(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_err)
}

async fn send_message(shared: &Shared, socket: &UdpSocket, message: &DiscoveryMessage) -> Result<()> {
    let target = shared.config.announce_target();
    socket.send_to(message.to_string().as_bytes(), target).await?;
    tracing::debug!("Sent {message} to {target}");
    Ok(())
}

async fn receive_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>, shutdown: CancellationToken) {
    let mut buf = [0u8; MAX_MESSAGE_SIZE];

    loop {
        let received = tokio::select! {
            () = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        match received {
            Ok((len, source)) => {
                if let Err(e) = shared.handle_datagram(&buf[..len]) {
                    tracing::debug!("Ignoring datagram from {source}: {e}");
                }
            }
            Err(e) => {
                tracing::warn!("Error receiving discovery datagram: {e}");
            }
        }
    }

    tracing::debug!("Discovery receive loop stopped");
}

async fn announce_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.announce_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let message = shared.announcement();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = send_message(&shared, &socket, &message).await {
                    tracing::warn!("Failed to send announcement: {e}");
                }
            }
        }
    }

    tracing::debug!("Announce loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> (DiscoveryService, Arc<PeerRegistry>, Arc<AtomicUsize>) {
        let registry = Arc::new(PeerRegistry::new());
        let events = Arc::new(EventBus::new());
        let discovered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&discovered);
        events.on_peer_discovered(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let service = DiscoveryService::new(
            NetworkConfig::default(),
            LocalDevice::new("me", Ipv4Addr::new(192, 168, 1, 2)),
            Arc::clone(&registry),
            events,
        );
        (service, registry, discovered)
    }

    #[test]
    fn test_duplicate_announcements_notify_once() {
        let (service, registry, discovered) = service();
        let datagram = b"DISCOVER:WiFiDirectFileShare:tablet:192.168.1.7";

        assert!(matches!(service.handle_datagram(datagram), Ok(Upsert::Inserted(_))));
        assert!(matches!(service.handle_datagram(datagram), Ok(Upsert::Unchanged)));

        assert_eq!(registry.len(), 1);
        assert_eq!(discovered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rename_is_silent() {
        let (service, registry, discovered) = service();
        service
            .handle_datagram(b"DISCOVER:WiFiDirectFileShare:old:192.168.1.7")
            .unwrap();
        let outcome = service
            .handle_datagram(b"DISCOVER:WiFiDirectFileShare:new:192.168.1.7")
            .unwrap();

        assert!(matches!(outcome, Upsert::Renamed { .. }));
        assert_eq!(registry.get("192.168.1.7").unwrap().name, "new");
        assert_eq!(discovered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_group_created_registers_peer() {
        let (service, registry, discovered) = service();
        service
            .handle_datagram(b"GROUP_CREATED:owner:192.168.1.30")
            .unwrap();

        assert_eq!(registry.get("192.168.1.30").unwrap().name, "owner");
        assert_eq!(discovered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ignores_self_and_foreign_service() {
        let (service, registry, discovered) = service();

        service
            .handle_datagram(b"DISCOVER:WiFiDirectFileShare:me:192.168.1.2")
            .unwrap();
        service
            .handle_datagram(b"GROUP_CREATED:me:192.168.1.2")
            .unwrap();
        service
            .handle_datagram(b"DISCOVER:SomethingElse:other:192.168.1.9")
            .unwrap();

        assert!(registry.is_empty());
        assert_eq!(discovered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_malformed_datagram_is_error() {
        let (service, registry, _) = service();
        assert!(service.handle_datagram(b"JOIN:x:1.2.3.4").is_err());
        assert!(service.handle_datagram(&[0xff, 0xfe, 0x00]).is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_announce_requires_running() {
        let (service, _, _) = service();
        assert!(!service.is_running());
        assert!(matches!(service.announce().await, Err(Error::NotRunning(_))));
        assert!(matches!(
            service.broadcast_group_created().await,
            Err(Error::NotRunning(_))
        ));
        service.stop().await;
    }
}
