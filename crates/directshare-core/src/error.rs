//! Error types for DirectShare.
//!
//! This module provides a unified error type for all DirectShare operations,
//! with specific error variants for different failure modes.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// A specialized `Result` type for DirectShare operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for DirectShare.
#[derive(Error, Debug)]
pub enum Error {
    /// A socket could not be bound at startup
    #[error("failed to bind {what} on {addr}: {source}")]
    Bind {
        /// Which socket failed ("discovery socket", "transfer listener", ...)
        what: &'static str,
        /// Address that was requested
        addr: SocketAddr,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The remote peer could not be reached
    #[error("peer {addr} is unreachable: {reason}")]
    PeerUnreachable {
        /// Address that was dialed
        addr: SocketAddr,
        /// Why the connection attempt failed
        reason: String,
    },

    /// The group handshake could not be completed
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Transfer was cancelled
    #[error("transfer cancelled")]
    TransferCancelled,

    /// The received content does not match the declared checksum
    #[error("file integrity check failed for '{file}': expected crc32 {expected:08x}, got {actual:08x}")]
    IntegrityCheckFailed {
        /// The file that failed verification
        file: String,
        /// Checksum declared by the sender
        expected: u32,
        /// Checksum of the bytes written to disk
        actual: u32,
    },

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// The discovery service has not been started
    #[error("service must be started before {0}")]
    NotRunning(&'static str),

    /// Invalid protocol message
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Invalid user input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No group connection is active
    #[error("no active group connection")]
    NotConnected,

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns whether this error ends only the operation that raised it.
    ///
    /// Bind failures are fatal to service startup; everything else is local
    /// to a single datagram, connection or transfer.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Bind { .. } | Self::ConfigError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_is_fatal() {
        let err = Error::Bind {
            what: "discovery socket",
            addr: "0.0.0.0:8888".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("discovery socket"));
    }

    #[test]
    fn test_transfer_errors_are_recoverable() {
        assert!(Error::TransferCancelled.is_recoverable());
        assert!(Error::Timeout(300).is_recoverable());
        assert!(Error::HandshakeFailed("refused".into()).is_recoverable());
    }

    #[test]
    fn test_integrity_message_shows_checksums() {
        let err = Error::IntegrityCheckFailed {
            file: "a.bin".into(),
            expected: 0xdead_beef,
            actual: 0x0000_0001,
        };
        let msg = err.to_string();
        assert!(msg.contains("deadbeef"));
        assert!(msg.contains("00000001"));
    }
}
