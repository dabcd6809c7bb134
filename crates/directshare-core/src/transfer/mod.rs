//! Chunked file transfer.
//!
//! One transfer moves one file over a byte stream:
//!
//! 1. header (name, size, CRC-32), see [`FileHeader`]
//! 2. exactly `size` body bytes, in chunks of the configured size
//!
//! The receiver recomputes the CRC-32 of what it wrote and deletes the file
//! on a mismatch. Any failure after the output file was created removes it,
//! so a receive either yields a verified file or nothing.
//!
//! Transfers can run inline on the caller's task ([`TransferEngine::send`],
//! [`TransferEngine::receive`]) or be submitted to a bounded pool
//! ([`TransferEngine::send_async`] and friends). Both register in the active
//! set, publish throttled progress and finish with a completion event.
//!
//! A transfer can also own its socket: [`TransferEngine::send_to_async`]
//! dials the receiver and [`TransferEngine::receive_on_async`] accepts a
//! single sender on a fresh listener.
//!
//! Cancellation is cooperative: [`TransferEngine::cancel`] trips a token the
//! transfer checks before each chunk and while waiting on the network.

mod progress;

pub use progress::{TransferProgress, TransferResult, TransferState, TransferStatistics, TransferType};

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::connection::{configure_tcp_keepalive, GroupConnection};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::file::{crc32_file, output_path};
use crate::protocol::FileHeader;

use progress::ProgressThrottle;

struct ActiveTransfer {
    progress: Mutex<TransferProgress>,
    cancel: CancellationToken,
}

impl ActiveTransfer {
    fn progress(&self) -> MutexGuard<'_, TransferProgress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn id(&self) -> String {
        self.progress().transfer_id.clone()
    }
}

struct Inner {
    config: TransferConfig,
    events: Arc<EventBus>,
    pool: Arc<Semaphore>,
    active: Mutex<HashMap<String, Arc<ActiveTransfer>>>,
    files_transferred: AtomicU64,
    bytes_transferred: AtomicU64,
}

/// Sends and receives files, tracking every transfer it runs.
///
/// Cloning is cheap; clones share the pool, the active set and the
/// statistics.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("config", &self.inner.config)
            .field("statistics", &self.statistics())
            .finish_non_exhaustive()
    }
}

/// Handle to a transfer submitted to the pool.
#[derive(Debug)]
pub struct TransferTask {
    id: String,
    handle: JoinHandle<TransferResult>,
}

impl TransferTask {
    /// Identifier usable with [`TransferEngine::cancel`] and
    /// [`TransferEngine::transfer_progress`].
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the transfer has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the transfer to finish.
    pub async fn join(self) -> TransferResult {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => TransferResult::failure(self.id, format!("transfer task failed: {e}"), 0, None),
        }
    }
}

impl TransferEngine {
    /// Create an engine with a worker pool of `config.max_concurrent_transfers`.
    #[must_use]
    pub fn new(config: TransferConfig, events: Arc<EventBus>) -> Self {
        let workers = config.max_concurrent_transfers.max(1);
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                pool: Arc::new(Semaphore::new(workers)),
                active: Mutex::new(HashMap::new()),
                files_transferred: AtomicU64::new(0),
                bytes_transferred: AtomicU64::new(0),
            }),
        }
    }

    /// The event bus progress and completion events go to.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Send a file over `stream` on the current task.
    ///
    /// # Errors
    ///
    /// Returns `Error::FileNotFound` if the file does not exist,
    /// `Error::TransferCancelled` if cancelled, `Error::Timeout` if the peer
    /// stalls, or an I/O error.
    pub async fn send<S>(&self, path: impl AsRef<Path>, stream: &mut S) -> Result<TransferResult>
    where
        S: AsyncWrite + Unpin,
    {
        let path = path.as_ref().to_path_buf();
        let active = self.register(TransferType::Send, Some(path.clone()), None);
        active.progress().state = TransferState::InProgress;

        let outcome = self.execute_send(&active, &path, stream).await;
        self.finish(&active, outcome)
    }

    /// Receive one file from `stream` into `save_dir` on the current task.
    ///
    /// # Errors
    ///
    /// Returns `Error::IntegrityCheckFailed` if the checksum does not match,
    /// `Error::TransferCancelled` if cancelled, `Error::Timeout` if the peer
    /// stalls, or a protocol or I/O error. No file is left behind on error.
    pub async fn receive<S>(&self, stream: &mut S, save_dir: impl AsRef<Path>) -> Result<TransferResult>
    where
        S: AsyncRead + Unpin,
    {
        let active = self.register(TransferType::Receive, None, None);
        active.progress().state = TransferState::InProgress;

        let outcome = self.execute_receive(&active, stream, save_dir.as_ref()).await;
        self.finish(&active, outcome)
    }

    /// Send a file over the group connection on the current task.
    ///
    /// Waits for exclusive use of the connection. Closing the connection
    /// cancels the transfer.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus `Error::NotConnected` if the connection
    /// is closed.
    pub async fn send_over(&self, path: impl AsRef<Path>, connection: &GroupConnection) -> Result<TransferResult> {
        let path = path.as_ref().to_path_buf();
        let active = self.register(
            TransferType::Send,
            Some(path.clone()),
            Some(&connection.closed_token()),
        );

        let outcome = async {
            let mut stream = self.lock_connection(&active, connection).await?;
            active.progress().state = TransferState::InProgress;
            self.execute_send(&active, &path, &mut *stream).await
        }
        .await;
        self.finish(&active, outcome)
    }

    /// Receive one file from the group connection on the current task.
    ///
    /// # Errors
    ///
    /// As [`receive`](Self::receive), plus `Error::NotConnected` if the
    /// connection is closed.
    pub async fn receive_over(
        &self,
        connection: &GroupConnection,
        save_dir: impl AsRef<Path>,
    ) -> Result<TransferResult> {
        let active = self.register(TransferType::Receive, None, Some(&connection.closed_token()));

        let outcome = async {
            let mut stream = self.lock_connection(&active, connection).await?;
            active.progress().state = TransferState::InProgress;
            self.execute_receive(&active, &mut *stream, save_dir.as_ref()).await
        }
        .await;
        self.finish(&active, outcome)
    }

    /// Submit a send over an owned stream to the pool.
    pub fn send_async<S>(&self, path: impl Into<PathBuf>, mut stream: S) -> TransferTask
    where
        S: AsyncWrite + Unpin + Send + 'static,
    {
        let path = path.into();
        let active = self.register(TransferType::Send, Some(path.clone()), None);
        self.spawn(active, move |engine, active| async move {
            engine.execute_send(&active, &path, &mut stream).await
        })
    }

    /// Submit a receive over an owned stream to the pool.
    pub fn receive_async<S>(&self, mut stream: S, save_dir: impl Into<PathBuf>) -> TransferTask
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let save_dir = save_dir.into();
        let active = self.register(TransferType::Receive, None, None);
        self.spawn(active, move |engine, active| async move {
            engine.execute_receive(&active, &mut stream, &save_dir).await
        })
    }

    /// Submit a send over the group connection to the pool.
    pub fn send_over_async(&self, path: impl Into<PathBuf>, connection: GroupConnection) -> TransferTask {
        let path = path.into();
        let active = self.register(
            TransferType::Send,
            Some(path.clone()),
            Some(&connection.closed_token()),
        );
        self.spawn(active, move |engine, active| async move {
            let mut stream = engine.lock_connection(&active, &connection).await?;
            engine.execute_send(&active, &path, &mut *stream).await
        })
    }

    /// Submit a receive over the group connection to the pool.
    pub fn receive_over_async(&self, connection: GroupConnection, save_dir: impl Into<PathBuf>) -> TransferTask {
        let save_dir = save_dir.into();
        let active = self.register(TransferType::Receive, None, Some(&connection.closed_token()));
        self.spawn(active, move |engine, active| async move {
            let mut stream = engine.lock_connection(&active, &connection).await?;
            engine.execute_receive(&active, &mut *stream, &save_dir).await
        })
    }

    /// Dial `addr` and submit a send over the new connection to the pool.
    ///
    /// The connection is opened once a pool slot is free and closed when the
    /// transfer ends. A receiver that cannot be reached within the idle
    /// timeout fails the transfer with `Error::PeerUnreachable`.
    pub fn send_to_async(&self, path: impl Into<PathBuf>, addr: SocketAddr) -> TransferTask {
        let path = path.into();
        let active = self.register(TransferType::Send, Some(path.clone()), None);
        self.spawn(active, move |engine, active| async move {
            let mut stream = engine.dial(&active, addr).await?;
            engine.execute_send(&active, &path, &mut stream).await
        })
    }

    /// Listen on `port` for one sender and submit the receive to the pool.
    ///
    /// The listener is bound before this returns, so the returned address
    /// carries the real port when `port` is 0. It accepts a single
    /// connection and waits for it until the transfer is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `Error::Bind` if the port cannot be bound.
    pub async fn receive_on_async(
        &self,
        port: u16,
        save_dir: impl Into<PathBuf>,
    ) -> Result<(SocketAddr, TransferTask)> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            what: "receive listener",
            addr,
            source,
        })?;
        let local = listener.local_addr()?;
        tracing::info!("Waiting for a sender on {local}");

        let save_dir = save_dir.into();
        let active = self.register(TransferType::Receive, None, None);
        let task = self.spawn(active, move |engine, active| async move {
            let mut stream = engine.accept_one(&active, listener).await?;
            engine.execute_receive(&active, &mut stream, &save_dir).await
        });
        Ok((local, task))
    }

    /// Request cancellation of a transfer.
    ///
    /// The transfer is removed from the active set immediately and stops at
    /// its next checkpoint. Returns whether the id was active.
    pub fn cancel(&self, transfer_id: &str) -> bool {
        let Some(active) = self.lock_active().remove(transfer_id) else {
            return false;
        };

        active.progress().cancelled = true;
        active.cancel.cancel();
        tracing::info!("Cancelling transfer {transfer_id}");
        true
    }

    /// Cancel every active transfer and refuse further pool submissions.
    pub fn shutdown(&self) {
        self.inner.pool.close();
        let ids: Vec<String> = self.lock_active().keys().cloned().collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    /// Snapshot of every pending or running transfer.
    pub fn active_transfers(&self) -> Vec<TransferProgress> {
        let active: Vec<Arc<ActiveTransfer>> = self.lock_active().values().cloned().collect();
        let mut snapshot: Vec<TransferProgress> = active.iter().map(|a| a.progress().clone()).collect();
        snapshot.sort_by_key(|p| p.start_time);
        snapshot
    }

    /// Snapshot of one active transfer.
    pub fn transfer_progress(&self, transfer_id: &str) -> Option<TransferProgress> {
        let active = self.lock_active().get(transfer_id).cloned()?;
        let progress = active.progress().clone();
        Some(progress)
    }

    /// Lifetime totals.
    pub fn statistics(&self) -> TransferStatistics {
        TransferStatistics {
            total_files_transferred: self.inner.files_transferred.load(Ordering::Relaxed),
            total_bytes_transferred: self.inner.bytes_transferred.load(Ordering::Relaxed),
            active_transfers: self.lock_active().len(),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, Arc<ActiveTransfer>>> {
        self.inner.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        transfer_type: TransferType,
        file_path: Option<PathBuf>,
        parent: Option<&CancellationToken>,
    ) -> Arc<ActiveTransfer> {
        let id = Uuid::new_v4().to_string();
        let active = Arc::new(ActiveTransfer {
            progress: Mutex::new(TransferProgress::new(id.clone(), file_path, transfer_type)),
            cancel: parent.map_or_else(CancellationToken::new, CancellationToken::child_token),
        });
        self.lock_active().insert(id.clone(), Arc::clone(&active));
        tracing::debug!("Registered {transfer_type} transfer {id}");
        active
    }

    fn spawn<F, Fut>(&self, active: Arc<ActiveTransfer>, work: F) -> TransferTask
    where
        F: FnOnce(Self, Arc<ActiveTransfer>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<u64>> + Send + 'static,
    {
        let id = active.id();
        let engine = self.clone();

        let handle = tokio::spawn(async move {
            let outcome = match engine.acquire_slot(&active).await {
                Ok(permit) => {
                    active.progress().state = TransferState::InProgress;
                    let outcome = work(engine.clone(), Arc::clone(&active)).await;
                    drop(permit);
                    outcome
                }
                Err(e) => Err(e),
            };
            engine.complete(&active, &outcome)
        });

        TransferTask { id, handle }
    }

    async fn acquire_slot(&self, active: &ActiveTransfer) -> Result<OwnedSemaphorePermit> {
        let pool = Arc::clone(&self.inner.pool);
        tokio::select! {
            biased;
            () = active.cancel.cancelled() => Err(Error::TransferCancelled),
            permit = pool.acquire_owned() => permit.map_err(|_| Error::TransferCancelled),
        }
    }

    async fn lock_connection(
        &self,
        active: &ActiveTransfer,
        connection: &GroupConnection,
    ) -> Result<tokio::sync::OwnedMutexGuard<tokio::net::TcpStream>> {
        tokio::select! {
            biased;
            () = active.cancel.cancelled() => Err(Error::TransferCancelled),
            stream = connection.lock() => stream,
        }
    }

    async fn dial(&self, active: &ActiveTransfer, addr: SocketAddr) -> Result<TcpStream> {
        let stream = self
            .guarded(active, TcpStream::connect(addr))
            .await
            .map_err(|e| match e {
                Error::TransferCancelled => e,
                other => Error::PeerUnreachable {
                    addr,
                    reason: other.to_string(),
                },
            })?;
        configure_tcp_keepalive(&stream)?;
        tracing::debug!("Connected to receiver at {addr}");
        Ok(stream)
    }

    async fn accept_one(&self, active: &ActiveTransfer, listener: TcpListener) -> Result<TcpStream> {
        let (stream, peer) = tokio::select! {
            biased;
            () = active.cancel.cancelled() => return Err(Error::TransferCancelled),
            accepted = listener.accept() => accepted?,
        };
        drop(listener);
        configure_tcp_keepalive(&stream)?;
        tracing::info!("Accepted sender {peer}");
        Ok(stream)
    }

    /// Run one network operation under the idle timeout, aborting early on
    /// cancellation.
    async fn guarded<T, E, F>(&self, active: &ActiveTransfer, op: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        let limit = self.inner.config.io_timeout;
        tokio::select! {
            biased;
            () = active.cancel.cancelled() => Err(Error::TransferCancelled),
            result = timeout(limit, op) => result
                .map_err(|_| Error::Timeout(limit.as_secs()))?
                .map_err(Into::into),
        }
    }

    fn report(&self, active: &ActiveTransfer, throttle: &mut ProgressThrottle, bytes: u64, total: u64) {
        let update = throttle.observe(bytes, total);
        let snapshot = {
            let mut progress = active.progress();
            progress.bytes_transferred = bytes;
            progress.total_bytes = total;
            progress.progress_percentage = progress::percentage(bytes, total);
            match update {
                Some(update) => {
                    progress.progress_percentage = update.percentage;
                    progress.speed = update.speed;
                    progress.clone()
                }
                None => return,
            }
        };

        tracing::debug!(
            "Transfer {}: {bytes}/{total} bytes ({:.1}%)",
            snapshot.transfer_id,
            snapshot.progress_percentage
        );
        self.inner.events.transfer_progress(&snapshot);
    }

    async fn execute_send<S>(&self, active: &ActiveTransfer, path: &Path, stream: &mut S) -> Result<u64>
    where
        S: AsyncWrite + Unpin,
    {
        let chunk_size = self.inner.config.chunk_size.max(1);

        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(Error::InvalidInput(format!("{} is not a file", path.display())));
        }
        let total = metadata.len();

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidInput(format!("{} has no file name", path.display())))?;
        let checksum = crc32_file(path, chunk_size).await?;

        tracing::info!("Sending {file_name} ({total} bytes, crc32 {checksum:08x})");
        {
            let mut progress = active.progress();
            progress.total_bytes = total;
        }

        let header = FileHeader {
            file_name,
            file_size: total,
            checksum,
        };
        self.guarded(active, header.write_to(stream)).await?;

        let mut throttle = ProgressThrottle::new(self.inner.config.progress_interval);
        let mut buffer = vec![0u8; chunk_size];
        let mut sent: u64 = 0;

        if total == 0 {
            self.report(active, &mut throttle, 0, 0);
        }

        while sent < total {
            if active.cancel.is_cancelled() {
                return Err(Error::TransferCancelled);
            }

            let want = chunk_len(chunk_size, total - sent);
            let n = file.read(&mut buffer[..want]).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} shrank while being sent", path.display()),
                )));
            }

            self.guarded(active, stream.write_all(&buffer[..n])).await?;
            sent += n as u64;
            self.report(active, &mut throttle, sent, total);
        }

        self.guarded(active, stream.flush()).await?;
        Ok(sent)
    }

    async fn execute_receive<S>(&self, active: &ActiveTransfer, stream: &mut S, save_dir: &Path) -> Result<u64>
    where
        S: AsyncRead + Unpin,
    {
        tokio::fs::create_dir_all(save_dir).await?;

        let header = self.guarded(active, FileHeader::read_from(stream)).await?;
        let path = output_path(save_dir, &header.file_name)?;
        let total = header.file_size;

        tracing::info!(
            "Receiving {} ({total} bytes) into {}",
            header.file_name,
            path.display()
        );
        {
            let mut progress = active.progress();
            progress.file_path = Some(path.clone());
            progress.total_bytes = total;
        }

        let file = tokio::fs::File::create(&path).await?;
        match self.receive_body(active, stream, file, total).await {
            Ok(()) => {}
            Err(e) => {
                remove_partial(&path).await;
                return Err(e);
            }
        }

        let actual = match crc32_file(&path, self.inner.config.chunk_size.max(1)).await {
            Ok(actual) => actual,
            Err(e) => {
                remove_partial(&path).await;
                return Err(e);
            }
        };
        if actual != header.checksum {
            remove_partial(&path).await;
            return Err(Error::IntegrityCheckFailed {
                file: header.file_name,
                expected: header.checksum,
                actual,
            });
        }

        Ok(total)
    }

    async fn receive_body<S>(
        &self,
        active: &ActiveTransfer,
        stream: &mut S,
        mut file: tokio::fs::File,
        total: u64,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let chunk_size = self.inner.config.chunk_size.max(1);
        let mut throttle = ProgressThrottle::new(self.inner.config.progress_interval);
        let mut buffer = vec![0u8; chunk_size];
        let mut received: u64 = 0;

        if total == 0 {
            self.report(active, &mut throttle, 0, 0);
        }

        while received < total {
            if active.cancel.is_cancelled() {
                return Err(Error::TransferCancelled);
            }

            let want = chunk_len(chunk_size, total - received);
            let n = self.guarded(active, stream.read(&mut buffer[..want])).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("connection closed after {received} of {total} bytes"),
                )));
            }

            file.write_all(&buffer[..n]).await?;
            received += n as u64;
            self.report(active, &mut throttle, received, total);
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Record a terminal outcome and return the matching result.
    fn complete(&self, active: &ActiveTransfer, outcome: &Result<u64>) -> TransferResult {
        let state = match outcome {
            Ok(_) => TransferState::Completed,
            Err(Error::TransferCancelled) => TransferState::Cancelled,
            Err(_) => TransferState::Failed,
        };

        let snapshot = {
            let mut progress = active.progress();
            progress.state = state;
            if state == TransferState::Cancelled {
                progress.cancelled = true;
            }
            progress.clone()
        };
        self.lock_active().remove(&snapshot.transfer_id);

        let result = match outcome {
            Ok(bytes) => {
                self.inner.files_transferred.fetch_add(1, Ordering::Relaxed);
                self.inner.bytes_transferred.fetch_add(*bytes, Ordering::Relaxed);
                tracing::info!(
                    "Transfer {} completed: {} bytes",
                    snapshot.transfer_id,
                    bytes
                );
                TransferResult::success(snapshot.transfer_id, *bytes, snapshot.file_path)
            }
            Err(e) => {
                if state == TransferState::Cancelled {
                    tracing::info!("Transfer {} cancelled", snapshot.transfer_id);
                } else {
                    tracing::warn!("Transfer {} failed: {e}", snapshot.transfer_id);
                }
                // A failed receive leaves no file behind, so don't point at one.
                let file_path = match snapshot.transfer_type {
                    TransferType::Send => snapshot.file_path,
                    TransferType::Receive => None,
                };
                TransferResult::failure(
                    snapshot.transfer_id,
                    e.to_string(),
                    snapshot.bytes_transferred,
                    file_path,
                )
            }
        };

        self.inner.events.transfer_completed(&result);
        result
    }

    fn finish(&self, active: &ActiveTransfer, outcome: Result<u64>) -> Result<TransferResult> {
        let result = self.complete(active, &outcome);
        outcome.map(|_| result)
    }
}

fn chunk_len(chunk_size: usize, remaining: u64) -> usize {
    usize::try_from(remaining).map_or(chunk_size, |remaining| remaining.min(chunk_size))
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove partial file {}: {e}", path.display()),
    }
}
