//! Registry of discovered peers.
//!
//! Peers are keyed by their network address. A peer announcing itself again
//! under a different name keeps its entry; only the name changes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

/// A peer seen on the network.
#[derive(Debug, Clone, Eq)]
pub struct PeerDevice {
    /// Display name announced by the peer
    pub name: String,
    /// IPv4 address the peer announced for itself
    pub address: String,
    /// When the peer was first discovered
    pub discovery_time: DateTime<Utc>,
}

impl PeerDevice {
    /// Create a peer discovered now.
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            discovery_time: Utc::now(),
        }
    }
}

impl PartialEq for PeerDevice {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl std::hash::Hash for PeerDevice {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl std::fmt::Display for PeerDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// What an upsert did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    /// The address was not known; the peer was added
    Inserted(PeerDevice),
    /// The address was known under another name; the name was replaced
    Renamed {
        /// The updated peer
        peer: PeerDevice,
        /// Name it was known under before
        previous_name: String,
    },
    /// The address was already known under this name
    Unchanged,
}

/// Thread-safe map of peers keyed by address.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerDevice>>,
}

impl PeerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer or refresh its name.
    ///
    /// The lookup and the write happen under one lock, so two concurrent
    /// announcements of the same new address yield exactly one
    /// [`Upsert::Inserted`].
    pub fn upsert(&self, name: &str, address: &str) -> Upsert {
        let mut peers = self.lock();
        match peers.get_mut(address) {
            None => {
                let peer = PeerDevice::new(name, address);
                peers.insert(address.to_string(), peer.clone());
                Upsert::Inserted(peer)
            }
            Some(existing) if existing.name != name => {
                let previous_name = std::mem::replace(&mut existing.name, name.to_string());
                Upsert::Renamed {
                    peer: existing.clone(),
                    previous_name,
                }
            }
            Some(_) => Upsert::Unchanged,
        }
    }

    /// Look up a peer by address.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<PeerDevice> {
        self.lock().get(address).cloned()
    }

    /// Snapshot of every known peer, oldest discovery first.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerDevice> {
        let mut peers: Vec<PeerDevice> = self.lock().values().cloned().collect();
        peers.sort_by_key(|p| p.discovery_time);
        peers
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no peer has been discovered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PeerDevice>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
