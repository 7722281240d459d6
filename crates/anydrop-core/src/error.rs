//! Error types for AnyDrop.
//!
//! This module provides a unified error type for all AnyDrop operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

use crate::transfer::FailureKind;

/// A specialized `Result` type for AnyDrop operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for AnyDrop.
#[derive(Error, Debug)]
pub enum Error {
    /// Could not open the signaling socket (E001)
    #[error("failed to connect to {0}")]
    ConnectionFailed(String),

    /// The peer never completed the READY/REGISTERED handshake (E002)
    #[error("connection handshake timed out after {0} seconds")]
    HandshakeTimeout(u64),

    /// The signaling link dropped while a transfer depended on it (E003)
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No open signaling link to send on
    #[error("signaling channel is not connected")]
    NotConnected,

    /// The peer did not accept or reject in time (E004)
    #[error("no response to transfer request after {0} seconds")]
    AcceptTimeout(u64),

    /// Transfer rejected by receiver
    #[error("transfer rejected by receiver")]
    TransferRejected,

    /// Transfer was cancelled
    #[error("transfer cancelled")]
    TransferCancelled,

    /// A transfer with this id is already registered (E005)
    #[error("transfer '{0}' already exists")]
    DuplicateTransfer(String),

    /// A data-plane operation is already running for this id (E006)
    #[error("transfer '{0}' already has an active data-plane operation")]
    TransferActive(String),

    /// No transfer with this id is registered
    #[error("transfer '{0}' not found")]
    UnknownTransfer(String),

    /// The requested transition is not legal from the current state
    #[error("transfer '{transfer_id}' cannot move from {from} to {to}")]
    InvalidState {
        /// Transfer identifier
        transfer_id: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// The connection is still carrying another transfer (E007)
    #[error("connection is busy with {0}")]
    ConnectionBusy(String),

    /// The peer reported an error for this transfer
    #[error("peer reported: {0}")]
    PeerError(String),

    /// Raw HTTP upload failed
    #[error("{0}")]
    UploadFailed(String),

    /// The received byte count disagrees with the announced size
    #[error("size mismatch for '{file}': expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// File name
        file: String,
        /// Announced size
        expected: u64,
        /// Bytes actually received
        actual: u64,
    },

    /// Invalid protocol message
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Invalid path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// mDNS daemon, registration or browse failure
    #[error("mDNS error: {0}")]
    Mdns(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::ConnectionFailed(_) => Some("E001"),
            Self::HandshakeTimeout(_) => Some("E002"),
            Self::ConnectionLost(_) => Some("E003"),
            Self::AcceptTimeout(_) => Some("E004"),
            Self::DuplicateTransfer(_) => Some("E005"),
            Self::TransferActive(_) => Some("E006"),
            Self::ConnectionBusy(_) => Some("E007"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ConnectionLost(_)
                | Self::HandshakeTimeout(_)
                | Self::AcceptTimeout(_)
        )
    }

    /// Classifies the error for transfer failure events.
    #[must_use]
    pub const fn failure_kind(&self) -> FailureKind {
        match self {
            Self::TransferRejected => FailureKind::Rejected,
            Self::TransferCancelled => FailureKind::Cancelled,
            Self::HandshakeTimeout(_) | Self::AcceptTimeout(_) => FailureKind::Timeout,
            Self::PeerError(_) => FailureKind::Peer,
            Self::ProtocolError(_)
            | Self::InvalidState { .. }
            | Self::DuplicateTransfer(_)
            | Self::TransferActive(_)
            | Self::UnknownTransfer(_)
            | Self::ConnectionBusy(_) => FailureKind::Protocol,
            _ => FailureKind::Transport,
        }
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::ConnectionFailed(_) | Self::HandshakeTimeout(_) => Some(
                "Make sure the other device is running `anydrop serve` and that\n\
                 port 8080 is not blocked by a firewall.",
            ),
            Self::AcceptTimeout(_) => {
                Some("The receiver did not answer. Ask them to accept, or raise\n\
                      transfer.accept_timeout in the config file.")
            }
            Self::ConnectionBusy(_) => {
                Some("Wait for the transfers already running on this connection to finish.")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::ConnectionFailed("x".into()).code(), Some("E001"));
        assert_eq!(Error::HandshakeTimeout(5).code(), Some("E002"));
        assert_eq!(Error::ConnectionBusy("t".into()).code(), Some("E007"));
        assert_eq!(Error::TransferRejected.code(), None);
    }

    #[test]
    fn test_failure_kinds() {
        assert_eq!(Error::TransferRejected.failure_kind(), FailureKind::Rejected);
        assert_eq!(Error::TransferCancelled.failure_kind(), FailureKind::Cancelled);
        assert_eq!(Error::AcceptTimeout(120).failure_kind(), FailureKind::Timeout);
        assert_eq!(
            Error::PeerError("disk full".into()).failure_kind(),
            FailureKind::Peer
        );
        assert_eq!(
            Error::UploadFailed("disk full".into()).failure_kind(),
            FailureKind::Transport
        );
    }

    #[test]
    fn test_upload_failed_displays_bare_message() {
        assert_eq!(Error::UploadFailed("disk full".into()).to_string(), "disk full");
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::HandshakeTimeout(5).is_recoverable());
        assert!(!Error::TransferRejected.is_recoverable());
    }

    #[test]
    fn test_suggestions() {
        assert!(Error::ConnectionFailed("x".into())
            .suggestion()
            .is_some_and(|s| s.contains("anydrop serve")));
        assert!(Error::AcceptTimeout(120).suggestion().is_some());
        assert!(Error::TransferRejected.suggestion().is_none());
    }
}
