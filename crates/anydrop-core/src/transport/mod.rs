//! Data-plane transports.
//!
//! Two interchangeable ways of moving file bytes once a transfer has been
//! accepted:
//!
//! - [`chunked`]: fixed-size binary frames on the signaling socket, closed by
//!   `TRANSFER_FINISH`
//! - [`http`]: a single `POST /upload` whose body is the raw file
//!
//! Both report progress through a [`ProgressHandle`] so callers do not care
//! which one ran.

pub mod chunked;
pub mod http;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::protocol::SignalingMessage;

/// One item queued for a socket writer.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// JSON control message (text frame)
    Message(SignalingMessage),
    /// File bytes (binary frame)
    Binary(Bytes),
    /// Close the socket
    Close,
}

/// Bounded queue feeding a signaling channel's writer task.
pub type OutboundSender = mpsc::Sender<Outbound>;

/// Byte counter shared between a transport and whoever watches it.
///
/// Values only ever increase; stale or repeated reports are ignored.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    tx: Arc<watch::Sender<u64>>,
}

impl ProgressHandle {
    /// Create a handle and the receiver that observes it.
    #[must_use]
    pub fn channel() -> (Self, watch::Receiver<u64>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Report `bytes` moved so far.
    pub fn set(&self, bytes: u64) {
        self.tx.send_if_modified(|current| {
            if bytes > *current {
                *current = bytes;
                true
            } else {
                false
            }
        });
    }

    /// Latest reported count.
    pub fn get(&self) -> u64 {
        *self.tx.borrow()
    }
}
