//! Signaling wire protocol.
//!
//! Control messages are JSON objects, one per WebSocket text frame, tagged by
//! a `type` field. File bytes in chunked mode travel as WebSocket binary
//! frames on the same connection and carry no envelope.
//!
//! ## Direct handshake
//!
//! ```text
//!   initiator                         acceptor
//!       │ ◄──────────── READY ──────────── │
//!       │ ───────── FILE_METADATA ───────► │
//!       │ ◄──────── ACCEPT / REJECT ────── │
//!       │ ══ binary frames or POST /upload ═► │
//!       │ ◄─────── TRANSFER_COMPLETE ───── │
//! ```
//!
//! ## Registry handshake
//!
//! `REGISTER → REGISTERED`, then `TRANSFER_REQUEST → TRANSFER_RESPONSE`,
//! binary frames and a closing `TRANSFER_FINISH`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transfer::{TransferId, TransportKind};

/// One file announced in `FILE_METADATA`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// File name (no directory components)
    pub name: String,
    /// Size in bytes
    pub size: u64,
}

/// Decision carried by `TRANSFER_RESPONSE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    /// Receiver accepted the transfer
    Accepted,
    /// Receiver declined the transfer
    Rejected,
    /// Receiver is ready for bytes (treated as accepted)
    Ready,
}

impl ResponseStatus {
    /// Whether the initiator should start sending bytes.
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted | Self::Ready)
    }
}

/// A signaling control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalingMessage {
    /// Acceptor is listening on this connection
    Ready {
        /// Role of the sender ("receiver")
        #[serde(default)]
        role: String,
    },

    /// Initiator announces a file
    #[serde(rename_all = "camelCase")]
    FileMetadata {
        /// Transfer identifier
        transfer_id: TransferId,
        /// Announced files; only the first one is transferred
        files: Vec<FileEntry>,
        /// Initiator device id
        sender_id: String,
        /// Initiator display name
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        /// Data plane the initiator will use (absent means HTTP)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transport: Option<TransportKind>,
    },

    /// Acceptor accepted the transfer
    #[serde(rename_all = "camelCase")]
    Accept {
        /// Transfer identifier
        transfer_id: TransferId,
    },

    /// Acceptor declined the transfer
    #[serde(rename_all = "camelCase")]
    Reject {
        /// Transfer identifier
        transfer_id: TransferId,
    },

    /// Receive-side progress
    #[serde(rename_all = "camelCase")]
    Progress {
        /// Transfer identifier
        transfer_id: TransferId,
        /// File name
        file: String,
        /// Percentage in `0..=100`
        percentage: f64,
        /// Bytes received so far
        received_bytes: u64,
        /// Announced size
        total_bytes: u64,
        /// Receive rate in bytes per second
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
    },

    /// File has been fully received and stored
    #[serde(rename_all = "camelCase")]
    TransferComplete {
        /// Transfer identifier
        transfer_id: TransferId,
        /// File name
        file: String,
        /// Stored size in bytes
        size: u64,
        /// Where the stored file can be fetched
        #[serde(default, skip_serializing_if = "Option::is_none")]
        download_url: Option<String>,
        /// Name the file was stored under
        #[serde(default, skip_serializing_if = "Option::is_none")]
        saved_as: Option<String>,
    },

    /// Transfer failed or was cancelled
    #[serde(rename_all = "camelCase")]
    TransferError {
        /// Transfer identifier
        transfer_id: TransferId,
        /// File name, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        /// Human-readable reason
        error: String,
    },

    /// Free-form text between devices
    #[serde(rename_all = "camelCase")]
    TextMessage {
        /// Message body
        text: String,
        /// Sender device id
        sender_id: String,
        /// Milliseconds since the Unix epoch
        timestamp: i64,
    },

    /// Registry dialect: announce this device
    #[serde(rename_all = "camelCase")]
    Register {
        /// Device id
        device_id: String,
        /// Display name
        name: String,
    },

    /// Registry dialect: registration acknowledged
    #[serde(rename_all = "camelCase")]
    Registered {
        /// Id of the acknowledging device
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
    },

    /// Registry dialect: request to send a file
    #[serde(rename_all = "camelCase")]
    TransferRequest {
        /// Receiving device id
        target_id: String,
        /// Sending device id
        sender_id: String,
        /// Transfer identifier
        transfer_id: TransferId,
        /// File name
        file_name: String,
        /// Size in bytes
        size: u64,
    },

    /// Registry dialect: decision on a request
    #[serde(rename_all = "camelCase")]
    TransferResponse {
        /// Transfer identifier
        transfer_id: TransferId,
        /// Device the response is addressed to
        #[serde(default)]
        target_id: String,
        /// Decision
        status: ResponseStatus,
    },

    /// Registry dialect: all binary frames have been sent
    #[serde(rename_all = "camelCase")]
    TransferFinish {
        /// Receiving device id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        /// Transfer identifier
        transfer_id: TransferId,
    },

    /// Registry dialect: aborts the transfer in progress
    Error {
        /// Human-readable reason
        message: String,
    },

    /// Any `type` this build does not recognize
    #[serde(other)]
    Unknown,
}

impl SignalingMessage {
    /// Decode one control message from a text frame.
    ///
    /// Unrecognized `type` values decode to [`SignalingMessage::Unknown`];
    /// malformed JSON and missing fields are errors.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::ProtocolError(e.to_string()))
    }

    /// Encode as a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Wire name of this message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "READY",
            Self::FileMetadata { .. } => "FILE_METADATA",
            Self::Accept { .. } => "ACCEPT",
            Self::Reject { .. } => "REJECT",
            Self::Progress { .. } => "PROGRESS",
            Self::TransferComplete { .. } => "TRANSFER_COMPLETE",
            Self::TransferError { .. } => "TRANSFER_ERROR",
            Self::TextMessage { .. } => "TEXT_MESSAGE",
            Self::Register { .. } => "REGISTER",
            Self::Registered { .. } => "REGISTERED",
            Self::TransferRequest { .. } => "TRANSFER_REQUEST",
            Self::TransferResponse { .. } => "TRANSFER_RESPONSE",
            Self::TransferFinish { .. } => "TRANSFER_FINISH",
            Self::Error { .. } => "ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// The transfer this message is scoped to, if any.
    #[must_use]
    pub const fn transfer_id(&self) -> Option<&TransferId> {
        match self {
            Self::FileMetadata { transfer_id, .. }
            | Self::Accept { transfer_id }
            | Self::Reject { transfer_id }
            | Self::Progress { transfer_id, .. }
            | Self::TransferComplete { transfer_id, .. }
            | Self::TransferError { transfer_id, .. }
            | Self::TransferRequest { transfer_id, .. }
            | Self::TransferResponse { transfer_id, .. }
            | Self::TransferFinish { transfer_id, .. } => Some(transfer_id),
            _ => None,
        }
    }
}

/// Extract the raw `type` field of a frame, for logging frames that did not
/// decode into a known variant.
#[must_use]
pub fn raw_type(text: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Tagged {
        #[serde(rename = "type")]
        kind: String,
    }

    serde_json::from_str::<Tagged>(text).ok().map(|t| t.kind)
}

/// Body of `GET /api/identify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityResponse {
    /// Application identity; must equal [`crate::APP_IDENTITY`]
    pub app: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Device id
    #[serde(default)]
    pub id: Option<String>,
    /// Device id (duplicate kept for older clients)
    #[serde(default)]
    pub device_id: Option<String>,
    /// Icon hint
    #[serde(default)]
    pub icon: Option<String>,
    /// Device class, any case
    #[serde(default, rename = "type")]
    pub device_type: Option<String>,
    /// Application version
    #[serde(default)]
    pub version: Option<String>,
}

impl IdentityResponse {
    /// Whether the body asserts the expected application identity.
    #[must_use]
    pub fn is_anydrop(&self) -> bool {
        self.app == crate::APP_IDENTITY
    }
}

/// Body returned by `POST /upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    /// Always `true` for this body
    pub ok: bool,
    /// `"success"`
    pub status: String,
    /// Human-readable summary
    pub message: String,
    /// Original file name
    pub filename: String,
    /// Stored size
    pub size: u64,
    /// Stored file name
    pub saved_as: String,
    /// Download path on the acceptor host
    pub download_url: String,
}

/// Error body of a failed HTTP request.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    /// Error text
    pub error: Option<String>,
    /// Alternative message field used by some hosts
    pub message: Option<String>,
}
