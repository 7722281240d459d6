//! Acceptor half of the transfer handshake.
//!
//! The [`Acceptor`] sits behind the host's `/ws` endpoint. Each socket is
//! registered as a connection with an unbounded outbound queue; control
//! messages and binary frames are fed in by the socket task, and the local
//! user decides through [`Acceptor::accept_transfer`] and
//! [`Acceptor::reject_transfer`]. Nothing is ever accepted automatically.
//!
//! A connection receives at most one chunked transfer at a time. Binary
//! frames carry no transfer id, so they belong to the connection's
//! `active_transfer`, which is set on accept and cleared when that transfer
//! ends.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::negotiator::CANCELLED_MESSAGE;
use super::{
    CompletedTransfer, Dialect, Direction, IncomingTransfer, ReceivedText, TransferEvent,
    TransferFailure, TransferId, TransferProgress, TransferRegistry, TransferSession,
    TransferState, TransportKind, EVENT_CAPACITY,
};
use crate::config::Config;
use crate::discovery::DeviceClass;
use crate::error::{Error, Result};
use crate::file::stored_file_name;
use crate::protocol::{self, IdentityResponse, ResponseStatus, SignalingMessage};
use crate::transport::chunked::ChunkAccumulator;
use crate::transport::Outbound;

/// Role announced in `READY`.
pub const RECEIVER_ROLE: &str = "receiver";

/// Identifies one signaling socket on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Queue feeding one socket's writer.
pub type ConnectionSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug)]
struct Connection {
    tx: ConnectionSender,
    peer: SocketAddr,
    registered_name: Option<String>,
    active_transfer: Option<TransferId>,
}

#[derive(Debug)]
struct Inbound {
    connection: ConnectionId,
    dialect: Dialect,
    transport: TransportKind,
    sender_id: String,
    file_name: String,
    size: u64,
    accumulator: Option<ChunkAccumulator>,
    started: Instant,
}

#[derive(Debug, Default)]
struct HostState {
    connections: HashMap<ConnectionId, Connection>,
    inbound: HashMap<TransferId, Inbound>,
}

impl HostState {
    fn send(&self, connection: ConnectionId, message: SignalingMessage) {
        let Some(conn) = self.connections.get(&connection) else {
            tracing::debug!("{} is gone, dropping {}", connection, message.kind());
            return;
        };
        if conn.tx.send(Outbound::Message(message)).is_err() {
            tracing::debug!("{} writer closed", connection);
        }
    }

    fn release(&mut self, transfer_id: &TransferId) -> Option<Inbound> {
        let inbound = self.inbound.remove(transfer_id)?;
        if let Some(conn) = self.connections.get_mut(&inbound.connection) {
            if conn.active_transfer.as_ref() == Some(transfer_id) {
                conn.active_transfer = None;
            }
        }
        Some(inbound)
    }
}

/// An accepted HTTP upload the host may now stream to disk.
#[derive(Debug, Clone)]
pub struct UploadTicket {
    /// Transfer identifier
    pub transfer_id: TransferId,
    /// Announced file name
    pub file_name: String,
    /// Announced size
    pub size: u64,
    /// Fires when the transfer is cancelled
    pub cancel: CancellationToken,
}

/// Where a received file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Name under the download directory
    pub saved_as: String,
    /// Full path
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
}

impl StoredFile {
    /// Download path served by the host.
    #[must_use]
    pub fn download_url(&self) -> String {
        format!("/api/files/{}", self.saved_as)
    }
}

struct Inner {
    device_id: String,
    device_name: String,
    device_class: DeviceClass,
    download_dir: PathBuf,
    registry: TransferRegistry,
    events: broadcast::Sender<TransferEvent>,
    state: Mutex<HostState>,
    next_connection: AtomicU64,
}

/// Receives transfers on behalf of the local user.
#[derive(Clone)]
pub struct Acceptor {
    inner: Arc<Inner>,
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("device_id", &self.inner.device_id)
            .field("download_dir", &self.inner.download_dir)
            .finish_non_exhaustive()
    }
}

impl Acceptor {
    /// Create an acceptor storing files in the configured download
    /// directory.
    #[must_use]
    pub fn new(config: &Config, registry: TransferRegistry) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                device_id: config.general.resolved_device_id(),
                device_name: config.general.device_name.clone(),
                device_class: config.general.device_class,
                download_dir: config.transfer.resolved_download_dir(),
                registry,
                events,
                state: Mutex::new(HostState::default()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to inbound transfer events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// Registry inbound sessions are recorded in.
    #[must_use]
    pub fn registry(&self) -> &TransferRegistry {
        &self.inner.registry
    }

    /// Directory received files are written to.
    #[must_use]
    pub fn download_dir(&self) -> &Path {
        &self.inner.download_dir
    }

    /// Local device id.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Local display name.
    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.inner.device_name
    }

    /// Body of `GET /api/identify`.
    #[must_use]
    pub fn identity(&self) -> IdentityResponse {
        let class = self.inner.device_class;
        IdentityResponse {
            app: crate::APP_IDENTITY.to_string(),
            name: Some(self.inner.device_name.clone()),
            id: Some(self.inner.device_id.clone()),
            device_id: Some(self.inner.device_id.clone()),
            icon: Some(class.to_string()),
            device_type: Some(class.wire_name().to_string()),
            version: Some(crate::VERSION.to_string()),
        }
    }

    // ========================================================================
    // Socket side
    // ========================================================================

    /// Register a new socket and greet it with `READY`.
    pub async fn open_connection(&self, peer: SocketAddr, tx: ConnectionSender) -> ConnectionId {
        let id = ConnectionId(self.inner.next_connection.fetch_add(1, Ordering::Relaxed));
        let mut state = self.inner.state.lock().await;
        state.connections.insert(
            id,
            Connection {
                tx,
                peer,
                registered_name: None,
                active_transfer: None,
            },
        );
        state.send(
            id,
            SignalingMessage::Ready {
                role: RECEIVER_ROLE.to_string(),
            },
        );
        tracing::info!("Signaling connection from {} ({})", peer, id);
        id
    }

    /// Forget a socket; transfers still bound to it fail.
    pub async fn close_connection(&self, connection: ConnectionId) {
        let orphaned: Vec<TransferId> = {
            let mut state = self.inner.state.lock().await;
            if let Some(conn) = state.connections.remove(&connection) {
                tracing::info!("Signaling connection from {} closed", conn.peer);
            }
            state
                .inbound
                .iter()
                .filter(|(_, inbound)| inbound.connection == connection)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in orphaned {
            let err = Error::ConnectionLost("sender disconnected".into());
            self.fail_inbound(&id, &err).await;
        }
    }

    /// Handle one text frame.
    pub async fn handle_text(&self, connection: ConnectionId, text: &str) {
        match SignalingMessage::decode(text) {
            Ok(SignalingMessage::Unknown) => {
                tracing::debug!(
                    "ignoring unknown message type {:?} on {}",
                    protocol::raw_type(text).unwrap_or_default(),
                    connection
                );
            }
            Ok(message) => self.handle_message(connection, message).await,
            Err(e) => tracing::warn!("ignoring malformed message on {}: {}", connection, e),
        }
    }

    /// Handle one decoded control message.
    pub async fn handle_message(&self, connection: ConnectionId, message: SignalingMessage) {
        match message {
            SignalingMessage::FileMetadata {
                transfer_id,
                files,
                sender_id,
                sender_name,
                transport,
            } => {
                if files.len() > 1 {
                    let reason = format!(
                        "only one file per transfer is supported, got {}",
                        files.len()
                    );
                    self.refuse(connection, transfer_id, &reason).await;
                    return;
                }
                let Some(file) = files.into_iter().next() else {
                    self.refuse(connection, transfer_id, "no files in metadata")
                        .await;
                    return;
                };
                let request = IncomingTransfer {
                    transfer_id,
                    file_name: file.name,
                    file_size: file.size,
                    sender_id,
                    sender_name,
                    transport: transport.unwrap_or_default(),
                };
                self.announce(connection, request, Dialect::Direct).await;
            }
            SignalingMessage::TransferRequest {
                sender_id,
                transfer_id,
                file_name,
                size,
                ..
            } => {
                let sender_name = self.registered_name(connection).await;
                let request = IncomingTransfer {
                    transfer_id,
                    file_name,
                    file_size: size,
                    sender_id,
                    sender_name,
                    transport: TransportKind::Chunked,
                };
                self.announce(connection, request, Dialect::Registry).await;
            }
            SignalingMessage::Register { device_id, name } => {
                let mut state = self.inner.state.lock().await;
                if let Some(conn) = state.connections.get_mut(&connection) {
                    tracing::debug!("{} registered as {} ({})", connection, device_id, name);
                    conn.registered_name = Some(name);
                }
                state.send(
                    connection,
                    SignalingMessage::Registered {
                        device_id: Some(self.inner.device_id.clone()),
                    },
                );
            }
            SignalingMessage::TransferFinish { transfer_id, .. } => {
                self.finish_chunked(connection, &transfer_id).await;
            }
            SignalingMessage::TransferError {
                transfer_id, error, ..
            } => {
                if self.owns(connection, &transfer_id).await {
                    self.drop_inbound(&transfer_id, &Error::PeerError(error)).await;
                }
            }
            SignalingMessage::Error { message } => {
                let active = {
                    let state = self.inner.state.lock().await;
                    state
                        .connections
                        .get(&connection)
                        .and_then(|c| c.active_transfer.clone())
                };
                if let Some(id) = active {
                    self.drop_inbound(&id, &Error::PeerError(message)).await;
                } else {
                    tracing::warn!("peer error on {}: {}", connection, message);
                }
            }
            SignalingMessage::TextMessage {
                text,
                sender_id,
                timestamp,
            } => {
                let _ = self
                    .inner
                    .events
                    .send(TransferEvent::TextReceived(ReceivedText {
                        sender_id,
                        text,
                        timestamp,
                    }));
            }
            other => {
                tracing::debug!("ignoring {} on {}", other.kind(), connection);
            }
        }
    }

    /// Handle one binary frame.
    pub async fn handle_binary(&self, connection: ConnectionId, frame: Bytes) {
        let outcome = {
            let mut state = self.inner.state.lock().await;
            let Some(active) = state
                .connections
                .get(&connection)
                .and_then(|c| c.active_transfer.clone())
            else {
                tracing::warn!(
                    "dropping {} byte frame on {} with no active transfer",
                    frame.len(),
                    connection
                );
                return;
            };
            let Some(accumulator) = state
                .inbound
                .get_mut(&active)
                .and_then(|inbound| inbound.accumulator.as_mut())
            else {
                tracing::warn!("dropping frame for {}: not receiving", active);
                return;
            };
            (active, accumulator.push(frame))
        };

        match outcome {
            (id, Ok(received)) => self.report_progress(&id, received).await,
            (id, Err(e)) => self.fail_inbound(&id, &e).await,
        }
    }

    // ========================================================================
    // User decisions
    // ========================================================================

    /// Accept an announced transfer.
    ///
    /// A chunked transfer becomes its connection's active transfer; if the
    /// connection is already receiving another one this fails with
    /// [`Error::ConnectionBusy`] and the request stays pending.
    pub async fn accept_transfer(&self, transfer_id: &TransferId) -> Result<()> {
        let registry = &self.inner.registry;
        let mut state = self.inner.state.lock().await;
        let inbound = state
            .inbound
            .get(transfer_id)
            .ok_or_else(|| Error::UnknownTransfer(transfer_id.to_string()))?;
        let connection = inbound.connection;
        let transport = inbound.transport;
        let dialect = inbound.dialect;
        let sender_id = inbound.sender_id.clone();

        let conn = state
            .connections
            .get(&connection)
            .ok_or_else(|| Error::ConnectionLost("sender disconnected".into()))?;
        if transport == TransportKind::Chunked {
            if let Some(active) = &conn.active_transfer {
                return Err(Error::ConnectionBusy(format!("transfer '{active}'")));
            }
        }

        registry.transition(transfer_id, TransferState::Accepted).await?;
        self.emit_state(transfer_id, TransferState::Accepted);
        registry
            .transition(transfer_id, TransferState::Receiving)
            .await?;
        self.emit_state(transfer_id, TransferState::Receiving);

        if transport == TransportKind::Chunked {
            registry.begin_data_plane(transfer_id).await?;
            if let Some(inbound) = state.inbound.get_mut(transfer_id) {
                inbound.accumulator = Some(ChunkAccumulator::new(
                    transfer_id.clone(),
                    inbound.file_name.clone(),
                    inbound.size,
                ));
                inbound.started = Instant::now();
            }
            if let Some(conn) = state.connections.get_mut(&connection) {
                conn.active_transfer = Some(transfer_id.clone());
            }
        }

        let reply = match dialect {
            Dialect::Direct => SignalingMessage::Accept {
                transfer_id: transfer_id.clone(),
            },
            Dialect::Registry => SignalingMessage::TransferResponse {
                transfer_id: transfer_id.clone(),
                target_id: sender_id,
                status: ResponseStatus::Accepted,
            },
        };
        state.send(connection, reply);
        tracing::info!("Accepted transfer {} over {}", transfer_id, transport);
        Ok(())
    }

    /// Decline an announced transfer.
    pub async fn reject_transfer(&self, transfer_id: &TransferId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let inbound = state
            .inbound
            .get(transfer_id)
            .ok_or_else(|| Error::UnknownTransfer(transfer_id.to_string()))?;
        let connection = inbound.connection;
        let reply = match inbound.dialect {
            Dialect::Direct => SignalingMessage::Reject {
                transfer_id: transfer_id.clone(),
            },
            Dialect::Registry => SignalingMessage::TransferResponse {
                transfer_id: transfer_id.clone(),
                target_id: inbound.sender_id.clone(),
                status: ResponseStatus::Rejected,
            },
        };

        self.inner
            .registry
            .transition(transfer_id, TransferState::Rejected)
            .await?;
        state.release(transfer_id);
        state.send(connection, reply);
        drop(state);

        self.emit_state(transfer_id, TransferState::Rejected);
        tracing::info!("Rejected transfer {}", transfer_id);
        Ok(())
    }

    /// Cancel an inbound transfer and tell the sender.
    ///
    /// Returns `false` when no such transfer is live.
    pub async fn cancel_transfer(&self, transfer_id: &TransferId) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(inbound) = state.release(transfer_id) else {
            return false;
        };
        self.inner.registry.cancel(transfer_id).await;
        if let Err(e) = self
            .inner
            .registry
            .transition(transfer_id, TransferState::Cancelled)
            .await
        {
            tracing::debug!("cancel {}: {}", transfer_id, e);
        }
        state.send(
            inbound.connection,
            SignalingMessage::TransferError {
                transfer_id: transfer_id.clone(),
                file: Some(inbound.file_name),
                error: CANCELLED_MESSAGE.to_string(),
            },
        );
        drop(state);

        self.emit_failure(transfer_id, &Error::TransferCancelled, TransferState::Cancelled);
        true
    }

    // ========================================================================
    // HTTP data plane
    // ========================================================================

    /// Claim the upload slot of an accepted HTTP transfer.
    ///
    /// Fails with [`Error::TransferActive`] if an upload for the id is
    /// already streaming.
    pub async fn begin_http_upload(&self, transfer_id: &TransferId) -> Result<UploadTicket> {
        let state = self.inner.state.lock().await;
        let inbound = state
            .inbound
            .get(transfer_id)
            .ok_or_else(|| Error::UnknownTransfer(transfer_id.to_string()))?;

        if inbound.transport != TransportKind::Http {
            return Err(Error::ProtocolError(format!(
                "transfer '{transfer_id}' was not announced as an HTTP upload"
            )));
        }
        let session = self
            .inner
            .registry
            .get(transfer_id)
            .await
            .ok_or_else(|| Error::UnknownTransfer(transfer_id.to_string()))?;
        if session.state != TransferState::Receiving {
            return Err(Error::InvalidState {
                transfer_id: transfer_id.to_string(),
                from: session.state.to_string(),
                to: TransferState::Receiving.to_string(),
            });
        }

        let cancel = self.inner.registry.begin_data_plane(transfer_id).await?;
        Ok(UploadTicket {
            transfer_id: transfer_id.clone(),
            file_name: inbound.file_name.clone(),
            size: inbound.size,
            cancel,
        })
    }

    /// Pick the path a received file is stored under.
    #[must_use]
    pub fn storage_path(&self, file_name: &str) -> (String, PathBuf) {
        let saved_as = stored_file_name(file_name, Utc::now().timestamp_millis());
        let path = self.inner.download_dir.join(&saved_as);
        (saved_as, path)
    }

    /// Report receive progress to the sender and to local subscribers.
    pub async fn report_progress(&self, transfer_id: &TransferId, received: u64) {
        let Some(stored) = self
            .inner
            .registry
            .record_progress(transfer_id, received)
            .await
        else {
            return;
        };

        let state = self.inner.state.lock().await;
        let Some(inbound) = state.inbound.get(transfer_id) else {
            return;
        };
        let elapsed = inbound.started.elapsed().as_secs_f64();
        let speed = (elapsed > 0.0).then(|| stored as f64 / elapsed);
        state.send(
            inbound.connection,
            SignalingMessage::Progress {
                transfer_id: transfer_id.clone(),
                file: inbound.file_name.clone(),
                percentage: super::percentage(stored, inbound.size),
                received_bytes: stored,
                total_bytes: inbound.size,
                speed,
            },
        );
        let total = inbound.size;
        drop(state);

        let _ = self
            .inner
            .events
            .send(TransferEvent::Progress(TransferProgress {
                transfer_id: transfer_id.clone(),
                direction: Direction::Inbound,
                bytes_transferred: stored,
                total_bytes: total,
            }));
    }

    /// Finish an inbound transfer whose bytes are on disk.
    pub async fn complete_inbound(&self, transfer_id: &TransferId, stored: &StoredFile) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let inbound = state
            .release(transfer_id)
            .ok_or_else(|| Error::UnknownTransfer(transfer_id.to_string()))?;
        self.inner
            .registry
            .transition(transfer_id, TransferState::Completed)
            .await?;
        state.send(
            inbound.connection,
            SignalingMessage::TransferComplete {
                transfer_id: transfer_id.clone(),
                file: inbound.file_name.clone(),
                size: stored.size,
                download_url: Some(stored.download_url()),
                saved_as: Some(stored.saved_as.clone()),
            },
        );
        drop(state);

        tracing::info!(
            "Received '{}' ({} bytes) -> {}",
            inbound.file_name,
            stored.size,
            stored.path.display()
        );
        self.emit_state(transfer_id, TransferState::Completed);
        let _ = self
            .inner
            .events
            .send(TransferEvent::Completed(CompletedTransfer {
                transfer_id: transfer_id.clone(),
                direction: Direction::Inbound,
                file_name: inbound.file_name,
                size: stored.size,
                saved_path: Some(stored.path.clone()),
            }));
        Ok(())
    }

    /// Fail an inbound transfer and tell the sender why.
    pub async fn fail_inbound(&self, transfer_id: &TransferId, err: &Error) {
        let mut state = self.inner.state.lock().await;
        let Some(inbound) = state.release(transfer_id) else {
            return;
        };
        state.send(
            inbound.connection,
            SignalingMessage::TransferError {
                transfer_id: transfer_id.clone(),
                file: Some(inbound.file_name),
                error: err.to_string(),
            },
        );
        drop(state);

        self.inner.registry.cancel(transfer_id).await;
        self.inner.registry.fail(transfer_id, &err.to_string()).await;
        tracing::warn!("Transfer {} failed: {}", transfer_id, err);
        self.emit_failure(transfer_id, err, TransferState::Failed);
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn announce(&self, connection: ConnectionId, request: IncomingTransfer, dialect: Dialect) {
        let session = TransferSession::inbound(
            request.transfer_id.clone(),
            request.sender_id.clone(),
            request.file_name.clone(),
            request.file_size,
            request.transport,
        );
        if let Err(e) = self.inner.registry.insert(session).await {
            self.refuse(connection, request.transfer_id, &e.to_string())
                .await;
            return;
        }
        if let Err(e) = self
            .inner
            .registry
            .transition(&request.transfer_id, TransferState::AwaitingUserDecision)
            .await
        {
            tracing::warn!("transfer {}: {}", request.transfer_id, e);
            return;
        }

        {
            let mut state = self.inner.state.lock().await;
            if !state.connections.contains_key(&connection) {
                drop(state);
                self.inner
                    .registry
                    .fail(&request.transfer_id, "sender disconnected")
                    .await;
                return;
            }
            state.inbound.insert(
                request.transfer_id.clone(),
                Inbound {
                    connection,
                    dialect,
                    transport: request.transport,
                    sender_id: request.sender_id.clone(),
                    file_name: request.file_name.clone(),
                    size: request.file_size,
                    accumulator: None,
                    started: Instant::now(),
                },
            );
        }

        tracing::info!(
            "Incoming transfer {}: '{}' ({} bytes) from {}",
            request.transfer_id,
            request.file_name,
            request.file_size,
            request
                .sender_name
                .as_deref()
                .unwrap_or(&request.sender_id)
        );
        self.emit_state(&request.transfer_id, TransferState::AwaitingUserDecision);
        let _ = self
            .inner
            .events
            .send(TransferEvent::TransferRequested(request));
    }

    async fn refuse(&self, connection: ConnectionId, transfer_id: TransferId, reason: &str) {
        tracing::warn!("refusing transfer {}: {}", transfer_id, reason);
        let state = self.inner.state.lock().await;
        state.send(
            connection,
            SignalingMessage::TransferError {
                transfer_id,
                file: None,
                error: reason.to_string(),
            },
        );
    }

    async fn finish_chunked(&self, connection: ConnectionId, transfer_id: &TransferId) {
        let accumulator = {
            let mut state = self.inner.state.lock().await;
            let Some(inbound) = state.inbound.get_mut(transfer_id) else {
                tracing::debug!("TRANSFER_FINISH for unknown transfer {}", transfer_id);
                return;
            };
            if inbound.connection != connection {
                tracing::warn!("TRANSFER_FINISH for {} from the wrong connection", transfer_id);
                return;
            }
            inbound.accumulator.take()
        };

        let Some(accumulator) = accumulator else {
            let err = Error::ProtocolError("TRANSFER_FINISH before acceptance".into());
            self.fail_inbound(transfer_id, &err).await;
            return;
        };

        let file_name = {
            let state = self.inner.state.lock().await;
            state
                .inbound
                .get(transfer_id)
                .map(|inbound| inbound.file_name.clone())
        };
        let Some(file_name) = file_name else { return };

        let (saved_as, path) = self.storage_path(&file_name);
        match accumulator.write_to(&path).await {
            Ok(size) => {
                let stored = StoredFile {
                    saved_as,
                    path,
                    size,
                };
                if let Err(e) = self.complete_inbound(transfer_id, &stored).await {
                    tracing::warn!("transfer {} finished late: {}", transfer_id, e);
                }
            }
            Err(e) => self.fail_inbound(transfer_id, &e).await,
        }
    }

    /// Drop a transfer the sender has already given up on.
    async fn drop_inbound(&self, transfer_id: &TransferId, err: &Error) {
        let released = self.inner.state.lock().await.release(transfer_id);
        if released.is_none() {
            return;
        }
        self.inner.registry.cancel(transfer_id).await;
        self.inner.registry.fail(transfer_id, &err.to_string()).await;
        tracing::info!("Transfer {} ended by sender: {}", transfer_id, err);
        self.emit_failure(transfer_id, err, TransferState::Failed);
    }

    async fn owns(&self, connection: ConnectionId, transfer_id: &TransferId) -> bool {
        self.inner
            .state
            .lock()
            .await
            .inbound
            .get(transfer_id)
            .is_some_and(|inbound| inbound.connection == connection)
    }

    async fn registered_name(&self, connection: ConnectionId) -> Option<String> {
        self.inner
            .state
            .lock()
            .await
            .connections
            .get(&connection)
            .and_then(|c| c.registered_name.clone())
    }

    fn emit_state(&self, transfer_id: &TransferId, state: TransferState) {
        let _ = self.inner.events.send(TransferEvent::StateChanged {
            transfer_id: transfer_id.clone(),
            state,
        });
    }

    fn emit_failure(&self, transfer_id: &TransferId, err: &Error, state: TransferState) {
        self.emit_state(transfer_id, state);
        let _ = self.inner.events.send(TransferEvent::Failed {
            transfer_id: transfer_id.clone(),
            direction: Direction::Inbound,
            failure: TransferFailure::from(err),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FileEntry;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn acceptor(dir: &TempDir) -> Acceptor {
        let mut config = Config::default();
        config.general.device_id = Some("acceptor-1".into());
        config.transfer.download_dir = Some(dir.path().to_path_buf());
        Acceptor::new(&config, TransferRegistry::new())
    }

    async fn connect(acceptor: &Acceptor) -> (ConnectionId, UnboundedReceiver<Outbound>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = acceptor
            .open_connection("127.0.0.1:50000".parse().unwrap(), tx)
            .await;
        match rx.recv().await {
            Some(Outbound::Message(SignalingMessage::Ready { role })) => {
                assert_eq!(role, RECEIVER_ROLE);
            }
            other => panic!("expected READY, got {other:?}"),
        }
        (id, rx)
    }

    fn metadata(id: &str, size: u64, transport: TransportKind) -> SignalingMessage {
        SignalingMessage::FileMetadata {
            transfer_id: TransferId::from(id),
            files: vec![FileEntry {
                name: "photo 1.jpg".into(),
                size,
            }],
            sender_id: "sender-1".into(),
            sender_name: Some("Laptop".into()),
            transport: Some(transport),
        }
    }

    fn next_message(rx: &mut UnboundedReceiver<Outbound>) -> SignalingMessage {
        match rx.try_recv() {
            Ok(Outbound::Message(msg)) => msg,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_metadata_waits_for_user_decision() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let mut events = acceptor.subscribe();
        let (conn, mut rx) = connect(&acceptor).await;

        acceptor
            .handle_message(conn, metadata("t1", 3, TransportKind::Chunked))
            .await;

        let session = acceptor.registry().get(&TransferId::from("t1")).await.unwrap();
        assert_eq!(session.state, TransferState::AwaitingUserDecision);
        assert!(rx.try_recv().is_err(), "nothing is sent before the user decides");

        let mut requested = false;
        while let Ok(event) = events.try_recv() {
            if let TransferEvent::TransferRequested(req) = event {
                assert_eq!(req.file_name, "photo 1.jpg");
                assert_eq!(req.sender_name.as_deref(), Some("Laptop"));
                requested = true;
            }
        }
        assert!(requested);
    }

    #[tokio::test]
    async fn test_chunked_receive_writes_file() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let (conn, mut rx) = connect(&acceptor).await;
        let id = TransferId::from("t1");

        acceptor
            .handle_message(conn, metadata("t1", 6, TransportKind::Chunked))
            .await;
        acceptor.accept_transfer(&id).await.expect("accept");
        assert_eq!(
            next_message(&mut rx),
            SignalingMessage::Accept {
                transfer_id: id.clone()
            }
        );

        acceptor.handle_binary(conn, Bytes::from_static(b"abc")).await;
        acceptor.handle_binary(conn, Bytes::from_static(b"def")).await;
        let mut last_percentage = 0.0;
        for _ in 0..2 {
            match next_message(&mut rx) {
                SignalingMessage::Progress { percentage, .. } => {
                    assert!(percentage >= last_percentage);
                    last_percentage = percentage;
                }
                other => panic!("expected PROGRESS, got {other:?}"),
            }
        }
        assert!((last_percentage - 100.0).abs() < f64::EPSILON);

        acceptor
            .handle_message(
                conn,
                SignalingMessage::TransferFinish {
                    target_id: None,
                    transfer_id: id.clone(),
                },
            )
            .await;

        match next_message(&mut rx) {
            SignalingMessage::TransferComplete {
                size,
                saved_as: Some(saved_as),
                download_url: Some(url),
                ..
            } => {
                assert_eq!(size, 6);
                assert!(saved_as.ends_with("-photo_1.jpg"));
                assert_eq!(url, format!("/api/files/{saved_as}"));
                assert_eq!(std::fs::read(dir.path().join(&saved_as)).unwrap(), b"abcdef");
            }
            other => panic!("expected TRANSFER_COMPLETE, got {other:?}"),
        }
        assert!(acceptor.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_second_chunked_accept_is_busy() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let (conn, _rx) = connect(&acceptor).await;

        acceptor
            .handle_message(conn, metadata("t1", 10, TransportKind::Chunked))
            .await;
        acceptor
            .handle_message(conn, metadata("t2", 10, TransportKind::Chunked))
            .await;

        acceptor.accept_transfer(&TransferId::from("t1")).await.unwrap();
        let err = acceptor
            .accept_transfer(&TransferId::from("t2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionBusy(ref what) if what.contains("'t1'")));

        let pending = acceptor.registry().get(&TransferId::from("t2")).await.unwrap();
        assert_eq!(pending.state, TransferState::AwaitingUserDecision);
    }

    #[tokio::test]
    async fn test_overflowing_frame_fails_transfer() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let mut events = acceptor.subscribe();
        let (conn, mut rx) = connect(&acceptor).await;
        let id = TransferId::from("t1");

        acceptor
            .handle_message(conn, metadata("t1", 2, TransportKind::Chunked))
            .await;
        acceptor.accept_transfer(&id).await.unwrap();
        let _accept = next_message(&mut rx);

        acceptor.handle_binary(conn, Bytes::from_static(b"too many")).await;

        assert!(matches!(
            next_message(&mut rx),
            SignalingMessage::TransferError { .. }
        ));
        assert!(acceptor.registry().is_empty().await);

        let failed = std::iter::from_fn(|| events.try_recv().ok()).any(|e| {
            matches!(e, TransferEvent::Failed { ref failure, .. } if failure.kind.is_error())
        });
        assert!(failed);
    }

    #[tokio::test]
    async fn test_frame_without_active_transfer_is_dropped() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let (conn, mut rx) = connect(&acceptor).await;

        acceptor.handle_binary(conn, Bytes::from_static(b"stray")).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_metadata_without_files_or_duplicate_id_is_refused() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let (conn, mut rx) = connect(&acceptor).await;

        acceptor
            .handle_message(
                conn,
                SignalingMessage::FileMetadata {
                    transfer_id: TransferId::from("empty"),
                    files: vec![],
                    sender_id: "s".into(),
                    sender_name: None,
                    transport: None,
                },
            )
            .await;
        assert!(matches!(
            next_message(&mut rx),
            SignalingMessage::TransferError { .. }
        ));

        acceptor
            .handle_message(conn, metadata("dup", 1, TransportKind::Http))
            .await;
        acceptor
            .handle_message(conn, metadata("dup", 1, TransportKind::Http))
            .await;
        match next_message(&mut rx) {
            SignalingMessage::TransferError { error, .. } => assert!(error.contains("already")),
            other => panic!("expected TRANSFER_ERROR, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multi_file_metadata_is_refused() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let mut events = acceptor.subscribe();
        let (conn, mut rx) = connect(&acceptor).await;

        acceptor
            .handle_message(
                conn,
                SignalingMessage::FileMetadata {
                    transfer_id: TransferId::from("many"),
                    files: vec![
                        FileEntry {
                            name: "a.txt".into(),
                            size: 1,
                        },
                        FileEntry {
                            name: "b.txt".into(),
                            size: 2,
                        },
                    ],
                    sender_id: "s".into(),
                    sender_name: None,
                    transport: Some(TransportKind::Chunked),
                },
            )
            .await;

        match next_message(&mut rx) {
            SignalingMessage::TransferError {
                transfer_id, error, ..
            } => {
                assert_eq!(transfer_id.as_str(), "many");
                assert!(error.contains("one file"));
            }
            other => panic!("expected TRANSFER_ERROR, got {other:?}"),
        }
        assert!(acceptor.registry().is_empty().await);
        assert!(events.try_recv().is_err(), "nothing is announced");
    }

    #[tokio::test]
    async fn test_registered_name_labels_requests() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let mut events = acceptor.subscribe();
        let (conn, mut rx) = connect(&acceptor).await;

        acceptor
            .handle_message(
                conn,
                SignalingMessage::Register {
                    device_id: "phone-7".into(),
                    name: "Phone".into(),
                },
            )
            .await;
        let _registered = next_message(&mut rx);

        acceptor
            .handle_message(
                conn,
                SignalingMessage::TransferRequest {
                    target_id: "acceptor-1".into(),
                    sender_id: "phone-7".into(),
                    transfer_id: TransferId::from("r1"),
                    file_name: "a.txt".into(),
                    size: 1,
                },
            )
            .await;

        let request = std::iter::from_fn(|| events.try_recv().ok())
            .find_map(|e| match e {
                TransferEvent::TransferRequested(req) => Some(req),
                _ => None,
            })
            .expect("request announced");
        assert_eq!(request.sender_id, "phone-7");
        assert_eq!(request.sender_name.as_deref(), Some("Phone"));
    }

    #[tokio::test]
    async fn test_reject_and_registry_dialect() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let (conn, mut rx) = connect(&acceptor).await;

        acceptor
            .handle_message(
                conn,
                SignalingMessage::Register {
                    device_id: "phone-7".into(),
                    name: "Phone".into(),
                },
            )
            .await;
        assert_eq!(
            next_message(&mut rx),
            SignalingMessage::Registered {
                device_id: Some("acceptor-1".into())
            }
        );

        acceptor
            .handle_message(
                conn,
                SignalingMessage::TransferRequest {
                    target_id: "acceptor-1".into(),
                    sender_id: "phone-7".into(),
                    transfer_id: TransferId::from("r1"),
                    file_name: "a.txt".into(),
                    size: 1,
                },
            )
            .await;
        acceptor
            .reject_transfer(&TransferId::from("r1"))
            .await
            .expect("reject");

        assert_eq!(
            next_message(&mut rx),
            SignalingMessage::TransferResponse {
                transfer_id: TransferId::from("r1"),
                target_id: "phone-7".into(),
                status: ResponseStatus::Rejected,
            }
        );
        assert!(acceptor.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_notifies_sender() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let (conn, mut rx) = connect(&acceptor).await;
        let id = TransferId::from("t1");

        acceptor
            .handle_message(conn, metadata("t1", 10, TransportKind::Http))
            .await;
        assert!(acceptor.cancel_transfer(&id).await);
        assert!(!acceptor.cancel_transfer(&id).await);

        match next_message(&mut rx) {
            SignalingMessage::TransferError { error, .. } => {
                assert_eq!(error, CANCELLED_MESSAGE);
            }
            other => panic!("expected TRANSFER_ERROR, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_upload_slot_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let (conn, _rx) = connect(&acceptor).await;
        let id = TransferId::from("h1");

        acceptor
            .handle_message(conn, metadata("h1", 10, TransportKind::Http))
            .await;
        assert!(matches!(
            acceptor.begin_http_upload(&id).await,
            Err(Error::InvalidState { .. })
        ));

        acceptor.accept_transfer(&id).await.unwrap();
        let ticket = acceptor.begin_http_upload(&id).await.expect("first upload");
        assert_eq!(ticket.size, 10);
        assert!(matches!(
            acceptor.begin_http_upload(&id).await,
            Err(Error::TransferActive(_))
        ));
    }

    #[tokio::test]
    async fn test_closing_connection_fails_its_transfers() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let mut events = acceptor.subscribe();
        let (conn, _rx) = connect(&acceptor).await;

        acceptor
            .handle_message(conn, metadata("t1", 10, TransportKind::Http))
            .await;
        acceptor.close_connection(conn).await;

        assert!(acceptor.registry().is_empty().await);
        let failed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(TransferEvent::Failed { failure, .. }) = events.recv().await {
                    return failure;
                }
            }
        })
        .await
        .expect("failure event");
        assert_eq!(failed.kind, crate::transfer::FailureKind::Transport);
    }

    #[tokio::test]
    async fn test_closing_connection_cancels_running_upload() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let (conn, _rx) = connect(&acceptor).await;
        let id = TransferId::from("h1");

        acceptor
            .handle_message(conn, metadata("h1", 10, TransportKind::Http))
            .await;
        acceptor.accept_transfer(&id).await.unwrap();
        let ticket = acceptor.begin_http_upload(&id).await.unwrap();
        assert!(!ticket.cancel.is_cancelled());

        acceptor.close_connection(conn).await;
        assert!(ticket.cancel.is_cancelled());
        assert!(acceptor.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_text_message_is_published() {
        let dir = TempDir::new().unwrap();
        let acceptor = acceptor(&dir);
        let mut events = acceptor.subscribe();
        let (conn, _rx) = connect(&acceptor).await;

        acceptor
            .handle_text(
                conn,
                r#"{"type":"TEXT_MESSAGE","text":"hi","senderId":"s","timestamp":1}"#,
            )
            .await;
        acceptor.handle_text(conn, r#"{"type":"NOT_A_THING"}"#).await;
        acceptor.handle_text(conn, "garbage").await;

        match events.try_recv() {
            Ok(TransferEvent::TextReceived(text)) => assert_eq!(text.text, "hi"),
            other => panic!("expected text, got {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }
}
