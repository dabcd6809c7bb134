//! Listener registration and event fan-out.
//!
//! Listeners run synchronously on the task that raised the event, in
//! registration order. A consumer that owns a UI thread must hop onto it
//! itself. A panicking listener is logged and skipped; it never stops the
//! remaining listeners or the network operation that published the event.
//!
//! Async consumers can instead [`EventBus::subscribe`] to a broadcast feed of
//! every [`Event`]. That feed is bounded: a receiver that falls more than
//! [`EVENT_CHANNEL_CAPACITY`] events behind skips the oldest ones.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::connection::GroupConnection;
use crate::peer::PeerDevice;
use crate::transfer::{TransferProgress, TransferResult};

/// Capacity of the broadcast feed returned by [`EventBus::subscribe`].
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Whether a group connection is now up
    pub connected: bool,
    /// Peer address when connected, otherwise a human-readable reason
    pub detail: String,
}

/// Everything the bus can publish.
#[derive(Debug, Clone)]
pub enum Event {
    /// A peer was seen for the first time
    PeerDiscovered(PeerDevice),
    /// The group connection went up or down
    ConnectionStatus(ConnectionStatus),
    /// A new group connection replaced the previous one
    ConnectionEstablished(GroupConnection),
    /// A transfer made progress
    TransferProgress(TransferProgress),
    /// A transfer reached a terminal state
    TransferCompleted(TransferResult),
}

/// Handle returned on registration, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listeners<T> {
    kind: &'static str,
    entries: RwLock<Vec<(ListenerId, Listener<T>)>>,
}

impl<T> Listeners<T> {
    const fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, id: ListenerId, listener: Listener<T>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn dispatch(&self, value: &T) {
        // Listeners may register or remove listeners, so call them outside the lock.
        let snapshot: Vec<Listener<T>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(value))) {
                tracing::error!("Error in {} listener: {}", self.kind, panic_message(&*panic));
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "listener panicked".to_string())
}

/// Publish/subscribe hub shared by discovery, the group coordinator and the
/// transfer engine.
pub struct EventBus {
    next_id: AtomicU64,
    discovery: Listeners<PeerDevice>,
    status: Listeners<ConnectionStatus>,
    established: Listeners<GroupConnection>,
    progress: Listeners<TransferProgress>,
    completion: Listeners<TransferResult>,
    feed: broadcast::Sender<Event>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("discovery", &self.discovery.len())
            .field("status", &self.status.len())
            .field("established", &self.established.len())
            .field("progress", &self.progress.len())
            .field("completion", &self.completion.len())
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with no listeners.
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            discovery: Listeners::new("discovery"),
            status: Listeners::new("connection status"),
            established: Listeners::new("connection"),
            progress: Listeners::new("progress"),
            completion: Listeners::new("completion"),
            feed,
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a listener for newly discovered peers.
    pub fn on_peer_discovered<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PeerDevice) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.discovery.add(id, Arc::new(listener));
        id
    }

    /// Register a listener for connection status changes.
    pub fn on_connection_status<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.status.add(id, Arc::new(listener));
        id
    }

    /// Register a listener for newly established group connections.
    pub fn on_connection_established<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&GroupConnection) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.established.add(id, Arc::new(listener));
        id
    }

    /// Register a listener for transfer progress.
    pub fn on_transfer_progress<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TransferProgress) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.progress.add(id, Arc::new(listener));
        id
    }

    /// Register a listener for finished transfers, successful or not.
    pub fn on_transfer_completed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TransferResult) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.completion.add(id, Arc::new(listener));
        id
    }

    /// Remove a previously registered listener of any kind.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.discovery.remove(id)
            || self.status.remove(id)
            || self.established.remove(id)
            || self.progress.remove(id)
            || self.completion.remove(id)
    }

    /// Receive every published event on an async channel.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.feed.subscribe()
    }

    /// Publish a newly discovered peer.
    pub fn peer_discovered(&self, peer: &PeerDevice) {
        self.discovery.dispatch(peer);
        let _ = self.feed.send(Event::PeerDiscovered(peer.clone()));
    }

    /// Publish a connection status change.
    pub fn connection_status(&self, connected: bool, detail: impl Into<String>) {
        let status = ConnectionStatus {
            connected,
            detail: detail.into(),
        };
        self.status.dispatch(&status);
        let _ = self.feed.send(Event::ConnectionStatus(status));
    }

    /// Publish a new group connection.
    pub fn connection_established(&self, connection: &GroupConnection) {
        self.established.dispatch(connection);
        let _ = self.feed.send(Event::ConnectionEstablished(connection.clone()));
    }

    /// Publish transfer progress.
    pub fn transfer_progress(&self, progress: &TransferProgress) {
        self.progress.dispatch(progress);
        let _ = self.feed.send(Event::TransferProgress(progress.clone()));
    }

    /// Publish a transfer result.
    pub fn transfer_completed(&self, result: &TransferResult) {
        self.completion.dispatch(result);
        let _ = self.feed.send(Event::TransferCompleted(result.clone()));
    }
}
