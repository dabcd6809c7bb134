//! The active group connection and address helpers.
//!
//! A [`GroupConnection`] is a cheap, cloneable handle around one TCP stream.
//! The stream sits behind an async mutex so that exactly one task reads or
//! writes it at a time. Closing the handle cancels anything waiting on it and
//! shuts the socket down; transfers running over it observe the close as a
//! cancellation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Enable TCP keep-alive so a vanished peer is noticed while idle.
///
/// Probing starts after 10 seconds of idle time and repeats every 5 seconds.
pub(crate) fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    tracing::debug!("TCP keep-alive enabled on socket");
    Ok(())
}

struct Inner {
    peer_addr: SocketAddr,
    peer_name: String,
    established_at: DateTime<Utc>,
    stream: Arc<Mutex<TcpStream>>,
    closed: CancellationToken,
}

/// Handle to the single bidirectional connection of a group.
#[derive(Clone)]
pub struct GroupConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GroupConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupConnection")
            .field("peer_addr", &self.inner.peer_addr)
            .field("peer_name", &self.inner.peer_name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl GroupConnection {
    /// Wrap a connected stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer address of the stream cannot be read.
    pub fn new(stream: TcpStream, peer_name: impl Into<String>) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        if let Err(e) = configure_tcp_keepalive(&stream) {
            tracing::warn!("Failed to enable keep-alive for {peer_addr}: {e}");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                peer_addr,
                peer_name: peer_name.into(),
                established_at: Utc::now(),
                stream: Arc::new(Mutex::new(stream)),
                closed: CancellationToken::new(),
            }),
        })
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Name the peer gave during the handshake, or its address when unknown.
    pub fn peer_name(&self) -> &str {
        &self.inner.peer_name
    }

    /// When the connection was established.
    pub fn established_at(&self) -> DateTime<Utc> {
        self.inner.established_at
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Token cancelled when the connection is closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Whether two handles refer to the same connection.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Take exclusive use of the stream.
    ///
    /// Waits while another task holds it.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` if the connection is or becomes closed
    /// before the stream is available.
    pub async fn lock(&self) -> Result<OwnedMutexGuard<TcpStream>> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }

        let stream = Arc::clone(&self.inner.stream);
        tokio::select! {
            () = self.inner.closed.cancelled() => Err(Error::NotConnected),
            guard = stream.lock_owned() => {
                if self.is_closed() {
                    Err(Error::NotConnected)
                } else {
                    Ok(guard)
                }
            }
        }
    }

    /// Close the connection.
    ///
    /// Transfers using it are cancelled; once the stream is free its write
    /// half is shut down. Calling this more than once is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();

        let mut stream = self.inner.stream.lock().await;
        if let Err(e) = stream.shutdown().await {
            tracing::debug!("Shutdown of connection to {} failed: {e}", self.inner.peer_addr);
        }
        tracing::info!("Closed connection to {}", self.inner.peer_addr);
    }
}

/// Parse a host address string into a `SocketAddr`.
///
/// Accepts formats:
/// - `IP` (e.g., `192.168.1.100`) - uses `default_port`
/// - `IP:PORT` (e.g., `192.168.1.100:9000`) - uses specified port
/// - `[IPv6]` and `[IPv6]:PORT`
///
/// # Examples
///
/// ```
/// use directshare_core::connection::parse_host_address;
///
/// let addr = parse_host_address("192.168.1.100", 8889).unwrap();
/// assert_eq!(addr.port(), 8889);
///
/// let addr = parse_host_address("192.168.1.100:9000", 8889).unwrap();
/// assert_eq!(addr.port(), 9000);
/// ```
///
/// # Errors
///
/// Returns an error if the host string cannot be parsed.
pub fn parse_host_address(host: &str, default_port: u16) -> Result<SocketAddr> {
    let host = host.trim();
    let invalid = || {
        Error::InvalidInput(format!(
            "Invalid host format '{host}'. Use IP or IP:PORT (e.g., 192.168.1.100 or 192.168.1.100:{default_port})"
        ))
    };

    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Some(ip_str) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        let ip: IpAddr = ip_str.parse().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Some((ip_part, port_part)) = host.rsplit_once(':') {
        if !ip_part.contains(':') {
            let ip: IpAddr = ip_part.parse().map_err(|_| invalid())?;
            let port: u16 = port_part.parse().map_err(|_| {
                Error::InvalidInput(format!(
                    "Invalid port '{port_part}'. Port must be a number between 1 and 65535"
                ))
            })?;
            return Ok(SocketAddr::new(ip, port));
        }
    }

    Err(invalid())
}

/// Best guess at the IPv4 address other hosts on the LAN reach us on.
///
/// Asks the routing table which interface would carry traffic to a public
/// address; nothing is actually sent. Falls back to loopback when the host
/// has no route.
pub fn local_ipv4() -> Ipv4Addr {
    let detect = || -> std::io::Result<Ipv4Addr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 53))?;
        match socket.local_addr()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
            other => Err(std::io::Error::other(format!("unexpected local address {other}"))),
        }
    };

    detect().unwrap_or_else(|e| {
        tracing::warn!("Could not determine local address, using loopback: {e}");
        Ipv4Addr::LOCALHOST
    })
}
