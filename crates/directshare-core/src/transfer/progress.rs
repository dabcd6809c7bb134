//! Progress, result and statistics types, plus the notification throttle.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    /// Sending a local file
    Send,
    /// Receiving a file into a directory
    Receive,
}

impl std::fmt::Display for TransferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Receive => f.write_str("receive"),
        }
    }
}

/// Transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Submitted, waiting for a worker slot
    Pending,
    /// Bytes are moving
    InProgress,
    /// Transfer completed successfully
    Completed,
    /// Transfer failed
    Failed,
    /// Transfer was cancelled
    Cancelled,
}

impl TransferState {
    /// Whether no further transitions can happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Progress information for a transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Opaque unique identifier
    pub transfer_id: String,
    /// Local file being sent, or where the received file is written.
    /// Unknown for a receive until the header has been read.
    pub file_path: Option<PathBuf>,
    /// Direction
    pub transfer_type: TransferType,
    /// Current state
    pub state: TransferState,
    /// When the transfer was submitted
    pub start_time: DateTime<Utc>,
    /// Body bytes moved so far
    pub bytes_transferred: u64,
    /// Body size, known once the file is opened or the header is read
    pub total_bytes: u64,
    /// Instantaneous rate in bytes per second
    pub speed: f64,
    /// 0.0 to 100.0
    pub progress_percentage: f64,
    /// Set once cancellation has been requested; never cleared
    pub cancelled: bool,
}

impl TransferProgress {
    /// Create progress for a new transfer.
    #[must_use]
    pub fn new(transfer_id: String, file_path: Option<PathBuf>, transfer_type: TransferType) -> Self {
        Self {
            transfer_id,
            file_path,
            transfer_type,
            state: TransferState::Pending,
            start_time: Utc::now(),
            bytes_transferred: 0,
            total_bytes: 0,
            speed: 0.0,
            progress_percentage: 0.0,
            cancelled: false,
        }
    }

    /// File name without directories, if known.
    #[must_use]
    pub fn file_name(&self) -> Option<String> {
        self.file_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// Outcome of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferResult {
    /// Identifier of the finished transfer
    pub transfer_id: String,
    /// Whether the transfer completed and verified
    pub success: bool,
    /// Present exactly when `success` is false
    pub error_message: Option<String>,
    /// Body bytes moved before the transfer ended
    pub bytes_transferred: u64,
    /// Sent file, or the saved file on a successful receive
    pub file_path: Option<PathBuf>,
}

impl TransferResult {
    /// A successful result.
    #[must_use]
    pub fn success(transfer_id: String, bytes_transferred: u64, file_path: Option<PathBuf>) -> Self {
        Self {
            transfer_id,
            success: true,
            error_message: None,
            bytes_transferred,
            file_path,
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failure(
        transfer_id: String,
        error_message: impl Into<String>,
        bytes_transferred: u64,
        file_path: Option<PathBuf>,
    ) -> Self {
        Self {
            transfer_id,
            success: false,
            error_message: Some(error_message.into()),
            bytes_transferred,
            file_path,
        }
    }
}

/// Lifetime totals of an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStatistics {
    /// Files sent or received successfully
    pub total_files_transferred: u64,
    /// Body bytes of those files
    pub total_bytes_transferred: u64,
    /// Transfers currently pending or running
    pub active_transfers: usize,
}

/// Percentage and rate to publish for one notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ProgressUpdate {
    pub percentage: f64,
    pub speed: f64,
}

/// Limits notifications to one per percent of progress or one per interval,
/// whichever comes first. The final update is never suppressed.
#[derive(Debug)]
pub(crate) struct ProgressThrottle {
    interval: Duration,
    last_percentage: f64,
    last_bytes: u64,
    last_instant: Instant,
    finished: bool,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_percentage: 0.0,
            last_bytes: 0,
            last_instant: Instant::now(),
            finished: false,
        }
    }

    pub fn observe(&mut self, bytes: u64, total: u64) -> Option<ProgressUpdate> {
        self.observe_at(bytes, total, Instant::now())
    }

    fn observe_at(&mut self, bytes: u64, total: u64, now: Instant) -> Option<ProgressUpdate> {
        if self.finished {
            return None;
        }

        let percentage = percentage(bytes, total);
        let elapsed = now.saturating_duration_since(self.last_instant);
        let is_final = bytes >= total;

        if !is_final && percentage - self.last_percentage < 1.0 && elapsed < self.interval {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 {
            bytes.saturating_sub(self.last_bytes) as f64 / secs
        } else {
            0.0
        };

        self.last_percentage = percentage;
        self.last_bytes = bytes;
        self.last_instant = now;
        self.finished = is_final;

        Some(ProgressUpdate { percentage, speed })
    }
}

/// Share of `total` covered by `bytes`; an empty body counts as complete.
pub(crate) fn percentage(bytes: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (bytes.min(total) as f64 / total as f64) * 100.0
    }
}
