//! Transfer sessions and their negotiation.
//!
//! A transfer moves one file in one direction. Both sides track it as a
//! [`TransferSession`] held in a shared [`TransferRegistry`]; the
//! [`Negotiator`] drives the initiator half of the handshake and the
//! [`Acceptor`] drives the receiving half.
//!
//! ## Initiator states
//!
//! ```text
//! Idle → MetadataSent → AwaitingAccept ┬→ Accepted → Transferring → Completed
//!                                      └→ Rejected
//! ```
//!
//! ## Acceptor states
//!
//! ```text
//! MetadataReceived → AwaitingUserDecision ┬→ Accepted → Receiving → Completed
//!                                         └→ Rejected
//! ```
//!
//! `Failed` and `Cancelled` are reachable from every non-terminal state.
//! Terminal sessions are removed from the registry.

pub mod acceptor;
pub mod negotiator;
pub mod registry;

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use acceptor::Acceptor;
pub use negotiator::Negotiator;
pub use registry::TransferRegistry;

/// Capacity of every transfer event channel.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// Unique identifier of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("transfer-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TransferId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TransferId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which data plane carries the file bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Binary frames on the signaling socket
    Chunked,
    /// One raw-body `POST /upload` after acceptance
    #[default]
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunked => f.write_str("chunked"),
            Self::Http => f.write_str("http"),
        }
    }
}

/// Which handshake message family a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `READY` / `FILE_METADATA` / `ACCEPT` / `REJECT`
    #[default]
    Direct,
    /// `REGISTER` / `TRANSFER_REQUEST` / `TRANSFER_RESPONSE` / `TRANSFER_FINISH`
    Registry,
}

/// Direction of a transfer relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// This process sends the file
    Outbound,
    /// This process receives the file
    Inbound,
}

/// Transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferState {
    /// Session created, nothing sent yet
    Idle,
    /// Metadata written to the channel
    MetadataSent,
    /// Waiting for the acceptor's decision
    AwaitingAccept,
    /// Metadata received from the initiator
    MetadataReceived,
    /// Waiting for the local user's decision
    AwaitingUserDecision,
    /// Accepted, data plane not started yet
    Accepted,
    /// Sending bytes
    Transferring,
    /// Receiving bytes
    Receiving,
    /// Transfer completed successfully
    Completed,
    /// Transfer failed
    Failed,
    /// Acceptor declined
    Rejected,
    /// Transfer was cancelled
    Cancelled,
}

impl TransferState {
    /// Whether the session ends in this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Rejected | Self::Cancelled
        )
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Self::Failed | Self::Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Self::Idle, Self::MetadataSent)
                | (Self::MetadataSent, Self::AwaitingAccept)
                | (Self::AwaitingAccept | Self::AwaitingUserDecision, Self::Accepted | Self::Rejected)
                | (Self::Accepted, Self::Transferring | Self::Receiving)
                | (Self::Transferring | Self::Receiving, Self::Completed)
                | (Self::MetadataReceived, Self::AwaitingUserDecision)
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::MetadataSent => "metadataSent",
            Self::AwaitingAccept => "awaitingAccept",
            Self::MetadataReceived => "metadataReceived",
            Self::AwaitingUserDecision => "awaitingUserDecision",
            Self::Accepted => "accepted",
            Self::Transferring => "transferring",
            Self::Receiving => "receiving",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One file, one direction, one negotiation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSession {
    /// Transfer identifier
    pub transfer_id: TransferId,
    /// Direction relative to this process
    pub direction: Direction,
    /// Peer device id (or `address:port` when the peer sent none)
    pub peer_id: String,
    /// File name
    pub file_name: String,
    /// Announced size in bytes
    pub file_size: u64,
    /// Current state
    pub state: TransferState,
    /// Data plane in use
    pub transport: TransportKind,
    /// Bytes moved so far
    pub bytes_transferred: u64,
    /// When the session was created
    pub started_at: DateTime<Utc>,
    /// Failure reason, once failed
    pub error: Option<String>,
}

impl TransferSession {
    /// Create an outbound session in [`TransferState::Idle`].
    #[must_use]
    pub fn outbound(
        transfer_id: TransferId,
        peer_id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        transport: TransportKind,
    ) -> Self {
        Self::new(
            transfer_id,
            Direction::Outbound,
            TransferState::Idle,
            peer_id.into(),
            file_name.into(),
            file_size,
            transport,
        )
    }

    /// Create an inbound session in [`TransferState::MetadataReceived`].
    #[must_use]
    pub fn inbound(
        transfer_id: TransferId,
        peer_id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        transport: TransportKind,
    ) -> Self {
        Self::new(
            transfer_id,
            Direction::Inbound,
            TransferState::MetadataReceived,
            peer_id.into(),
            file_name.into(),
            file_size,
            transport,
        )
    }

    fn new(
        transfer_id: TransferId,
        direction: Direction,
        state: TransferState,
        peer_id: String,
        file_name: String,
        file_size: u64,
        transport: TransportKind,
    ) -> Self {
        Self {
            transfer_id,
            direction,
            peer_id,
            file_name,
            file_size,
            state,
            transport,
            bytes_transferred: 0,
            started_at: Utc::now(),
            error: None,
        }
    }

    /// Progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        percentage(self.bytes_transferred, self.file_size)
    }
}

/// Percentage of `done` out of `total`; an empty file counts as complete.
#[must_use]
pub fn percentage(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (done as f64 / total as f64) * 100.0
    }
}

/// Why a transfer ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// The acceptor declined; informational, not an error
    Rejected,
    /// Cancelled on either side
    Cancelled,
    /// A handshake or decision deadline passed
    Timeout,
    /// Socket, HTTP or disk failure
    Transport,
    /// The peer reported an error
    Peer,
    /// Message sequence or state violation
    Protocol,
}

impl FailureKind {
    /// Whether this outcome should be presented as an error.
    #[must_use]
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Rejected | Self::Cancelled)
    }
}

/// A classified failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferFailure {
    /// Classification
    pub kind: FailureKind,
    /// Human-readable message
    pub message: String,
}

impl From<&crate::Error> for TransferFailure {
    fn from(err: &crate::Error) -> Self {
        let kind = err.failure_kind();
        let message = match (kind, err) {
            (_, crate::Error::PeerError(msg)) => msg.clone(),
            (FailureKind::Rejected, _) => "Transfer rejected by receiver".to_string(),
            _ => err.to_string(),
        };
        Self { kind, message }
    }
}

/// An inbound request waiting for the user's decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingTransfer {
    /// Transfer identifier
    pub transfer_id: TransferId,
    /// Announced file name
    pub file_name: String,
    /// Announced size
    pub file_size: u64,
    /// Sender device id
    pub sender_id: String,
    /// Sender display name
    pub sender_name: Option<String>,
    /// Data plane the sender will use
    pub transport: TransportKind,
}

/// Progress snapshot for one transfer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// Transfer identifier
    pub transfer_id: TransferId,
    /// Direction relative to this process
    pub direction: Direction,
    /// Bytes moved so far
    pub bytes_transferred: u64,
    /// Announced size
    pub total_bytes: u64,
}

impl TransferProgress {
    /// Progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        percentage(self.bytes_transferred, self.total_bytes)
    }
}

/// A successfully finished transfer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTransfer {
    /// Transfer identifier
    pub transfer_id: TransferId,
    /// Direction relative to this process
    pub direction: Direction,
    /// File name
    pub file_name: String,
    /// Size in bytes
    pub size: u64,
    /// Where an inbound file was stored
    pub saved_path: Option<PathBuf>,
}

/// A text message received from a peer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedText {
    /// Sender device id
    pub sender_id: String,
    /// Body
    pub text: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// Events published to the UI collaborator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TransferEvent {
    /// An inbound transfer needs an accept/reject decision
    TransferRequested(IncomingTransfer),
    /// A session changed state
    StateChanged {
        /// Transfer identifier
        transfer_id: TransferId,
        /// New state
        state: TransferState,
    },
    /// Bytes moved
    Progress(TransferProgress),
    /// Transfer finished successfully
    Completed(CompletedTransfer),
    /// Transfer ended without completing
    Failed {
        /// Transfer identifier
        transfer_id: TransferId,
        /// Direction relative to this process
        direction: Direction,
        /// Classified reason
        failure: TransferFailure,
    },
    /// A peer sent a text message
    TextReceived(ReceivedText),
}

impl TransferEvent {
    /// The transfer this event concerns, if any.
    #[must_use]
    pub const fn transfer_id(&self) -> Option<&TransferId> {
        match self {
            Self::TransferRequested(req) => Some(&req.transfer_id),
            Self::StateChanged { transfer_id, .. } | Self::Failed { transfer_id, .. } => {
                Some(transfer_id)
            }
            Self::Progress(p) => Some(&p.transfer_id),
            Self::Completed(c) => Some(&c.transfer_id),
            Self::TextReceived(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = TransferId::generate();
        let b = TransferId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("transfer-"));
    }

    #[test]
    fn test_initiator_path() {
        use TransferState::*;
        let path = [
            Idle,
            MetadataSent,
            AwaitingAccept,
            Accepted,
            Transferring,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(AwaitingAccept.can_transition_to(Rejected));
        assert!(!Idle.can_transition_to(Transferring));
        assert!(!AwaitingAccept.can_transition_to(Transferring));
    }

    #[test]
    fn test_acceptor_path() {
        use TransferState::*;
        let path = [
            MetadataReceived,
            AwaitingUserDecision,
            Accepted,
            Receiving,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(AwaitingUserDecision.can_transition_to(Rejected));
        assert!(!MetadataReceived.can_transition_to(Receiving));
    }

    #[test]
    fn test_terminal_states_are_final() {
        use TransferState::*;
        for terminal in [Completed, Failed, Rejected, Cancelled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Failed));
            assert!(!terminal.can_transition_to(Cancelled));
        }
        assert!(Receiving.can_transition_to(Failed));
        assert!(AwaitingAccept.can_transition_to(Cancelled));
    }

    #[test]
    fn test_percentage() {
        assert!((percentage(0, 0) - 100.0).abs() < f64::EPSILON);
        assert!((percentage(50, 200) - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_failure_from_error() {
        let rejected = TransferFailure::from(&crate::Error::TransferRejected);
        assert_eq!(rejected.kind, FailureKind::Rejected);
        assert_eq!(rejected.message, "Transfer rejected by receiver");
        assert!(!rejected.kind.is_error());

        let peer = TransferFailure::from(&crate::Error::PeerError("disk full".into()));
        assert_eq!(peer.message, "disk full");
        assert!(peer.kind.is_error());
    }
}
