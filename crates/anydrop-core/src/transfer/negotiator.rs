//! Initiator half of the transfer handshake.
//!
//! [`Negotiator::send_file`] opens (or reuses) a signaling channel to the
//! peer, waits for the handshake, announces the file and returns the
//! transfer id. A spawned task then waits for the decision, runs the
//! configured data plane and finishes the session; everything after the
//! announcement is reported through [`TransferEvent`]s.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::{
    CompletedTransfer, Dialect, Direction, TransferEvent, TransferFailure, TransferId,
    TransferProgress, TransferRegistry, TransferSession, TransferState, TransportKind,
    EVENT_CAPACITY,
};
use crate::channel::{ChannelEvent, SignalingChannel};
use crate::config::Config;
use crate::discovery::Device;
use crate::error::{Error, Result};
use crate::file::file_name_of;
use crate::protocol::{FileEntry, SignalingMessage};
use crate::transport::chunked::{self, ChunkedUpload};
use crate::transport::http::{self, HttpUpload};
use crate::transport::ProgressHandle;

/// Message sent to the peer when a transfer is cancelled locally.
pub const CANCELLED_MESSAGE: &str = "transfer cancelled";

/// Knobs of the initiator side.
#[derive(Debug, Clone)]
pub struct NegotiatorSettings {
    /// Data plane for direct-dialect transfers
    pub transport: TransportKind,
    /// Handshake dialect
    pub dialect: Dialect,
    /// Bytes per chunk in chunked mode
    pub chunk_size: usize,
    /// Pause between chunks
    pub chunk_delay: Duration,
    /// Bound on the READY/REGISTERED wait
    pub ready_timeout: Duration,
    /// Bound on the ACCEPT/REJECT wait; `None` waits forever
    pub accept_timeout: Option<Duration>,
    /// Bound on opening the socket
    pub connect_timeout: Duration,
}

impl NegotiatorSettings {
    /// Settings taken from a loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            transport: config.transfer.transport,
            dialect: config.transfer.dialect,
            chunk_size: config.transfer.chunk_size,
            chunk_delay: config.transfer.chunk_delay,
            ready_timeout: config.transfer.ready_timeout,
            accept_timeout: config.transfer.accept_deadline(),
            connect_timeout: config.network.connect_timeout,
        }
    }

    /// Transport a session will actually use; the registry dialect is
    /// chunked-only.
    #[must_use]
    pub const fn effective_transport(&self) -> TransportKind {
        match self.dialect {
            Dialect::Direct => self.transport,
            Dialect::Registry => TransportKind::Chunked,
        }
    }
}

impl Default for NegotiatorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Default)]
struct Handshake {
    dialect: Option<Dialect>,
    remote_id: Option<String>,
}

/// One signaling socket to a peer. A link connects once; a dead or
/// re-dialected link is replaced by a fresh one.
#[derive(Debug)]
struct PeerLink {
    channel: SignalingChannel,
    handshake: Mutex<Handshake>,
    sessions: AtomicUsize,
}

/// Marks a link as in use for as long as it is held.
#[derive(Debug)]
struct LinkClaim(Arc<PeerLink>);

impl LinkClaim {
    fn new(link: &Arc<PeerLink>) -> Self {
        link.sessions.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(link))
    }
}

impl Deref for LinkClaim {
    type Target = PeerLink;

    fn deref(&self) -> &PeerLink {
        &self.0
    }
}

impl Drop for LinkClaim {
    fn drop(&mut self) {
        self.0.sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inner {
    device_id: String,
    device_name: String,
    settings: NegotiatorSettings,
    registry: TransferRegistry,
    links: Mutex<HashMap<SocketAddr, Arc<PeerLink>>>,
    events: broadcast::Sender<TransferEvent>,
    http: reqwest::Client,
}

/// Drives outbound transfers.
#[derive(Clone)]
pub struct Negotiator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("device_id", &self.inner.device_id)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

/// Everything the session task needs.
struct Outgoing {
    transfer_id: TransferId,
    address: SocketAddr,
    target_id: String,
    path: PathBuf,
    file_name: String,
    size: u64,
    transport: TransportKind,
    dialect: Dialect,
    link: LinkClaim,
    events: broadcast::Receiver<ChannelEvent>,
    cancel: CancellationToken,
}

/// What a peer message means for one outbound session.
enum PeerSignal {
    Complete { saved_as: Option<String> },
    Failed(Error),
    Ignore,
}

impl Negotiator {
    /// Create a negotiator identified by the configured device name and id.
    #[must_use]
    pub fn new(config: &Config, registry: TransferRegistry) -> Self {
        Self::with_settings(
            config.general.resolved_device_id(),
            config.general.device_name.clone(),
            NegotiatorSettings::from_config(config),
            registry,
        )
    }

    /// Create a negotiator with explicit settings.
    #[must_use]
    pub fn with_settings(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        settings: NegotiatorSettings,
        registry: TransferRegistry,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                device_id: device_id.into(),
                device_name: device_name.into(),
                settings,
                registry,
                links: Mutex::new(HashMap::new()),
                events,
                http: http::lan_client(),
            }),
        }
    }

    /// Subscribe to outbound transfer events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// The registry this negotiator records sessions in.
    #[must_use]
    pub fn registry(&self) -> &TransferRegistry {
        &self.inner.registry
    }

    /// Settings in use.
    #[must_use]
    pub fn settings(&self) -> &NegotiatorSettings {
        &self.inner.settings
    }

    /// Offer `path` to `peer`.
    ///
    /// Returns once the file has been announced. Errors returned here
    /// (missing file, duplicate id, handshake failure) are not also
    /// published as events; everything later is.
    pub async fn send_file(
        &self,
        peer: &Device,
        path: &Path,
        transfer_id: Option<TransferId>,
    ) -> Result<TransferId> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        if !metadata.is_file() {
            return Err(Error::InvalidPath(path.display().to_string()));
        }
        let file_name = file_name_of(path)?;
        let size = metadata.len();

        let settings = &self.inner.settings;
        let dialect = settings.dialect;
        let transport = settings.effective_transport();
        let transfer_id = transfer_id.unwrap_or_else(TransferId::generate);
        let address = peer.socket_addr();

        let cancel = self
            .inner
            .registry
            .insert(TransferSession::outbound(
                transfer_id.clone(),
                peer.id.clone(),
                file_name.clone(),
                size,
                transport,
            ))
            .await?;

        let (link, remote_id) = match self.ensure_link(address, dialect).await {
            Ok(link) => link,
            Err(e) => {
                self.inner.registry.fail(&transfer_id, &e.to_string()).await;
                return Err(e);
            }
        };
        let target_id = remote_id.unwrap_or_else(|| peer.id.clone());

        let events = link.channel.subscribe();
        let announce = match dialect {
            Dialect::Direct => SignalingMessage::FileMetadata {
                transfer_id: transfer_id.clone(),
                files: vec![FileEntry {
                    name: file_name.clone(),
                    size,
                }],
                sender_id: self.inner.device_id.clone(),
                sender_name: Some(self.inner.device_name.clone()),
                transport: Some(transport),
            },
            Dialect::Registry => SignalingMessage::TransferRequest {
                target_id: target_id.clone(),
                sender_id: self.inner.device_id.clone(),
                transfer_id: transfer_id.clone(),
                file_name: file_name.clone(),
                size,
            },
        };

        if let Err(e) = link.channel.send(announce).await {
            self.inner.registry.fail(&transfer_id, &e.to_string()).await;
            return Err(e);
        }
        self.set_state(&transfer_id, TransferState::MetadataSent).await?;
        self.set_state(&transfer_id, TransferState::AwaitingAccept).await?;

        tracing::info!(
            "Offered '{}' ({} bytes) to {} as {} over {}",
            file_name,
            size,
            address,
            transfer_id,
            transport
        );

        let session = Outgoing {
            transfer_id: transfer_id.clone(),
            address,
            target_id,
            path: path.to_path_buf(),
            file_name,
            size,
            transport,
            dialect,
            link,
            events,
            cancel,
        };
        let negotiator = self.clone();
        tokio::spawn(async move { negotiator.drive(session).await });

        Ok(transfer_id)
    }

    /// Send a free-form text message to `peer`.
    pub async fn send_text(&self, peer: &Device, text: &str) -> Result<()> {
        let (link, _) = self
            .ensure_link(peer.socket_addr(), self.inner.settings.dialect)
            .await?;
        link.channel
            .send(SignalingMessage::TextMessage {
                text: text.to_string(),
                sender_id: self.inner.device_id.clone(),
                timestamp: Utc::now().timestamp_millis(),
            })
            .await
    }

    /// Cancel an outbound transfer.
    ///
    /// The session task notifies the peer, removes the session and
    /// publishes `Failed` with kind `Cancelled`. Returns `false` when no
    /// such transfer is live.
    pub async fn cancel_transfer(&self, transfer_id: &TransferId) -> bool {
        self.inner.registry.cancel(transfer_id).await
    }

    /// Close every signaling channel.
    pub async fn shutdown(&self) {
        let links: Vec<_> = self.inner.links.lock().await.drain().collect();
        for (_, link) in links {
            link.channel.disconnect().await;
        }
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    /// Return a channel to `address` that has completed the handshake for
    /// `dialect`, plus the id the peer registered under.
    ///
    /// Switching an open link to the other dialect needs a fresh socket, so
    /// it fails with [`Error::ConnectionBusy`] while transfers still run on
    /// the old one.
    async fn ensure_link(
        &self,
        address: SocketAddr,
        dialect: Dialect,
    ) -> Result<(LinkClaim, Option<String>)> {
        loop {
            let link = self.link_to(address).await;
            let mut handshake = link.handshake.lock().await;

            if handshake.dialect.is_none() {
                let result = self.handshake(&link, address, dialect).await;
                return match result {
                    Ok(remote_id) => {
                        handshake.dialect = Some(dialect);
                        handshake.remote_id.clone_from(&remote_id);
                        Ok((LinkClaim::new(&link), remote_id))
                    }
                    Err(e) => {
                        drop(handshake);
                        self.forget_link(address, &link).await;
                        Err(e)
                    }
                };
            }

            let connected = link.channel.is_connected().await;
            if connected && handshake.dialect == Some(dialect) {
                return Ok((LinkClaim::new(&link), handshake.remote_id.clone()));
            }
            if connected {
                let active = link.sessions.load(Ordering::SeqCst);
                if active > 0 {
                    return Err(Error::ConnectionBusy(format!(
                        "{active} transfer(s) to {address}"
                    )));
                }
                // READY is only sent when a socket opens.
                link.channel.disconnect().await;
            }
            drop(handshake);
            self.forget_link(address, &link).await;
        }
    }

    /// Open the link's socket and wait for READY or REGISTERED.
    async fn handshake(
        &self,
        link: &PeerLink,
        address: SocketAddr,
        dialect: Dialect,
    ) -> Result<Option<String>> {
        let mut events = link.channel.subscribe();
        link.channel.connect(address).await?;
        if dialect == Dialect::Registry {
            link.channel
                .send(SignalingMessage::Register {
                    device_id: self.inner.device_id.clone(),
                    name: self.inner.device_name.clone(),
                })
                .await?;
        }

        let ready_timeout = self.inner.settings.ready_timeout;
        match tokio::time::timeout(ready_timeout, await_handshake(&mut events, dialect)).await {
            Ok(Ok(remote_id)) => Ok(remote_id),
            Ok(Err(e)) => {
                link.channel.disconnect().await;
                Err(e)
            }
            Err(_) => {
                tracing::warn!("no handshake from {} within {:?}", address, ready_timeout);
                link.channel.disconnect().await;
                Err(Error::HandshakeTimeout(ready_timeout.as_secs()))
            }
        }
    }

    /// The current link to `address`, created on first use.
    async fn link_to(&self, address: SocketAddr) -> Arc<PeerLink> {
        let mut links = self.inner.links.lock().await;
        if let Some(link) = links.get(&address) {
            return Arc::clone(link);
        }

        let link = Arc::new(PeerLink {
            channel: SignalingChannel::new(self.inner.settings.connect_timeout),
            handshake: Mutex::new(Handshake::default()),
            sessions: AtomicUsize::new(0),
        });
        links.insert(address, Arc::clone(&link));
        self.watch_link(address, &link);
        link
    }

    /// Drop `link` from the map unless it has already been replaced.
    async fn forget_link(&self, address: SocketAddr, link: &Arc<PeerLink>) {
        forget(&self.inner, address, link).await;
    }

    /// Forget the link once its socket closes.
    fn watch_link(&self, address: SocketAddr, link: &Arc<PeerLink>) {
        let mut events = link.channel.subscribe();
        let inner = Arc::downgrade(&self.inner);
        let link = Arc::downgrade(link);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Disconnected) => break,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            if let (Some(inner), Some(link)) = (inner.upgrade(), link.upgrade()) {
                forget(&inner, address, &link).await;
            }
        });
    }

    // ========================================================================
    // Session task
    // ========================================================================

    async fn drive(self, mut session: Outgoing) {
        match self.run(&mut session).await {
            Ok(saved_as) => self.finish_completed(&session, saved_as).await,
            Err(e) => self.finish_failed(&session, e).await,
        }
    }

    async fn run(&self, session: &mut Outgoing) -> Result<Option<String>> {
        let cancel = session.cancel.clone();
        let deadline = self.inner.settings.accept_timeout;

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::TransferCancelled),
            decision = await_decision(&mut session.events, &session.transfer_id, session.dialect, deadline) => decision?,
        }

        self.inner
            .registry
            .begin_data_plane(&session.transfer_id)
            .await?;
        self.set_state(&session.transfer_id, TransferState::Accepted)
            .await?;
        self.set_state(&session.transfer_id, TransferState::Transferring)
            .await?;

        let (progress, mut progress_rx) = ProgressHandle::channel();
        match session.transport {
            TransportKind::Chunked => {
                let outbound = session
                    .link
                    .channel
                    .outbound()
                    .await
                    .ok_or(Error::NotConnected)?;
                let upload = ChunkedUpload {
                    transfer_id: session.transfer_id.clone(),
                    target_id: (session.dialect == Dialect::Registry)
                        .then(|| session.target_id.clone()),
                    path: session.path.clone(),
                    chunk_size: self.inner.settings.chunk_size,
                    chunk_delay: self.inner.settings.chunk_delay,
                };
                let work = chunked::send_file(&outbound, &upload, &progress, &cancel);
                let (_, early) = self.pump(session, work, &mut progress_rx).await?;
                match early {
                    Some(saved_as) => Ok(saved_as),
                    None => {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => Err(Error::TransferCancelled),
                            done = await_completion(&mut session.events, &session.transfer_id, session.dialect) => done,
                        }
                    }
                }
            }
            TransportKind::Http => {
                let upload = HttpUpload {
                    address: session.address,
                    transfer_id: session.transfer_id.clone(),
                    file_name: session.file_name.clone(),
                    sender_id: self.inner.device_id.clone(),
                    path: session.path.clone(),
                };
                let work = http::upload(&self.inner.http, &upload, &progress, &cancel);
                let (receipt, _) = self.pump(session, work, &mut progress_rx).await?;
                Ok(receipt.saved_as)
            }
        }
    }

    /// Run a data-plane future while forwarding its progress and watching
    /// the channel for peer failures. A `TRANSFER_COMPLETE` seen meanwhile is
    /// returned alongside the result.
    async fn pump<T>(
        &self,
        session: &mut Outgoing,
        work: impl Future<Output = Result<T>>,
        progress_rx: &mut watch::Receiver<u64>,
    ) -> Result<(T, Option<Option<String>>)> {
        tokio::pin!(work);
        let mut completed = None;

        loop {
            tokio::select! {
                result = &mut work => {
                    let value = result?;
                    if progress_rx.has_changed().unwrap_or(false) {
                        let bytes = *progress_rx.borrow_and_update();
                        self.report_progress(session, bytes).await;
                    }
                    return Ok((value, completed));
                }
                Ok(()) = progress_rx.changed() => {
                    let bytes = *progress_rx.borrow_and_update();
                    self.report_progress(session, bytes).await;
                }
                event = session.events.recv() => {
                    match classify(event, &session.transfer_id, session.dialect) {
                        PeerSignal::Complete { saved_as } => completed = Some(saved_as),
                        PeerSignal::Failed(e) => return Err(e),
                        PeerSignal::Ignore => {}
                    }
                }
                () = session.cancel.cancelled() => return Err(Error::TransferCancelled),
            }
        }
    }

    async fn report_progress(&self, session: &Outgoing, bytes: u64) {
        let Some(stored) = self
            .inner
            .registry
            .record_progress(&session.transfer_id, bytes)
            .await
        else {
            return;
        };
        let _ = self
            .inner
            .events
            .send(TransferEvent::Progress(TransferProgress {
                transfer_id: session.transfer_id.clone(),
                direction: Direction::Outbound,
                bytes_transferred: stored,
                total_bytes: session.size,
            }));
    }

    async fn finish_completed(&self, session: &Outgoing, saved_as: Option<String>) {
        if let Err(e) = self
            .set_state(&session.transfer_id, TransferState::Completed)
            .await
        {
            tracing::warn!("transfer {} could not complete: {}", session.transfer_id, e);
            return;
        }

        tracing::info!(
            "Sent '{}' to {}{}",
            session.file_name,
            session.address,
            saved_as
                .map(|name| format!(" (stored as {name})"))
                .unwrap_or_default()
        );
        let _ = self
            .inner
            .events
            .send(TransferEvent::Completed(CompletedTransfer {
                transfer_id: session.transfer_id.clone(),
                direction: Direction::Outbound,
                file_name: session.file_name.clone(),
                size: session.size,
                saved_path: None,
            }));
    }

    async fn finish_failed(&self, session: &Outgoing, err: Error) {
        let id = &session.transfer_id;

        match &err {
            Error::TransferCancelled => self.notify_peer(session, CANCELLED_MESSAGE).await,
            Error::TransferRejected | Error::PeerError(_) | Error::ConnectionLost(_) => {}
            other => self.notify_peer(session, &other.to_string()).await,
        }

        let outcome = match &err {
            Error::TransferCancelled => {
                self.inner
                    .registry
                    .transition(id, TransferState::Cancelled)
                    .await
                    .map(|s| s.state)
            }
            Error::TransferRejected => self
                .inner
                .registry
                .transition(id, TransferState::Rejected)
                .await
                .map(|s| s.state),
            other => self
                .inner
                .registry
                .fail(id, &other.to_string())
                .await
                .map(|s| s.state)
                .ok_or_else(|| Error::UnknownTransfer(id.to_string())),
        };

        let state = match outcome {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!("transfer {} already finished: {}", id, e);
                return;
            }
        };

        let failure = TransferFailure::from(&err);
        if failure.kind.is_error() {
            tracing::warn!("Transfer {} failed: {}", id, failure.message);
        } else {
            tracing::info!("Transfer {} {}", id, state);
        }

        let _ = self.inner.events.send(TransferEvent::StateChanged {
            transfer_id: id.clone(),
            state,
        });
        let _ = self.inner.events.send(TransferEvent::Failed {
            transfer_id: id.clone(),
            direction: Direction::Outbound,
            failure,
        });
    }

    async fn notify_peer(&self, session: &Outgoing, reason: &str) {
        let message = SignalingMessage::TransferError {
            transfer_id: session.transfer_id.clone(),
            file: Some(session.file_name.clone()),
            error: reason.to_string(),
        };
        if let Err(e) = session.link.channel.send(message).await {
            tracing::debug!("could not notify peer of {}: {}", session.transfer_id, e);
        }
    }

    async fn set_state(&self, id: &TransferId, state: TransferState) -> Result<()> {
        self.inner.registry.transition(id, state).await?;
        let _ = self.inner.events.send(TransferEvent::StateChanged {
            transfer_id: id.clone(),
            state,
        });
        Ok(())
    }
}

async fn forget(inner: &Inner, address: SocketAddr, link: &Arc<PeerLink>) {
    let mut links = inner.links.lock().await;
    if links.get(&address).is_some_and(|current| Arc::ptr_eq(current, link)) {
        links.remove(&address);
        tracing::debug!("signaling link to {} closed", address);
    }
}

// ============================================================================
// Channel event matching
// ============================================================================

async fn await_handshake(
    events: &mut broadcast::Receiver<ChannelEvent>,
    dialect: Dialect,
) -> Result<Option<String>> {
    loop {
        match events.recv().await {
            Ok(ChannelEvent::Message(SignalingMessage::Ready { .. })) if dialect == Dialect::Direct => {
                return Ok(None);
            }
            Ok(ChannelEvent::Message(SignalingMessage::Registered { device_id }))
                if dialect == Dialect::Registry =>
            {
                return Ok(device_id);
            }
            Ok(ChannelEvent::Message(SignalingMessage::Error { message }))
                if dialect == Dialect::Registry =>
            {
                return Err(Error::PeerError(message));
            }
            Ok(ChannelEvent::Disconnected) => {
                return Err(Error::ConnectionLost(
                    "peer closed the connection during the handshake".into(),
                ));
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return Err(Error::NotConnected),
        }
    }
}

async fn await_decision(
    events: &mut broadcast::Receiver<ChannelEvent>,
    transfer_id: &TransferId,
    dialect: Dialect,
    deadline: Option<Duration>,
) -> Result<()> {
    let wait = async {
        loop {
            let event = events.recv().await;
            match &event {
                Ok(ChannelEvent::Message(SignalingMessage::Accept { transfer_id: id }))
                    if id == transfer_id =>
                {
                    return Ok(());
                }
                Ok(ChannelEvent::Message(SignalingMessage::Reject { transfer_id: id }))
                    if id == transfer_id =>
                {
                    return Err(Error::TransferRejected);
                }
                Ok(ChannelEvent::Message(SignalingMessage::TransferResponse {
                    transfer_id: id,
                    status,
                    ..
                })) if id == transfer_id => {
                    return if status.is_accepted() {
                        Ok(())
                    } else {
                        Err(Error::TransferRejected)
                    };
                }
                _ => {}
            }
            if let PeerSignal::Failed(e) = classify(event, transfer_id, dialect) {
                return Err(e);
            }
        }
    };

    match deadline {
        Some(limit) => tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| Error::AcceptTimeout(limit.as_secs()))?,
        None => wait.await,
    }
}

async fn await_completion(
    events: &mut broadcast::Receiver<ChannelEvent>,
    transfer_id: &TransferId,
    dialect: Dialect,
) -> Result<Option<String>> {
    loop {
        match classify(events.recv().await, transfer_id, dialect) {
            PeerSignal::Complete { saved_as } => return Ok(saved_as),
            PeerSignal::Failed(e) => return Err(e),
            PeerSignal::Ignore => {}
        }
    }
}

fn classify(
    event: std::result::Result<ChannelEvent, broadcast::error::RecvError>,
    transfer_id: &TransferId,
    dialect: Dialect,
) -> PeerSignal {
    match event {
        Ok(ChannelEvent::Message(SignalingMessage::TransferComplete {
            transfer_id: id,
            saved_as,
            ..
        })) if &id == transfer_id => PeerSignal::Complete { saved_as },
        Ok(ChannelEvent::Message(SignalingMessage::TransferError {
            transfer_id: id,
            error,
            ..
        })) if &id == transfer_id => PeerSignal::Failed(Error::PeerError(error)),
        Ok(ChannelEvent::Message(SignalingMessage::Error { message }))
            if dialect == Dialect::Registry =>
        {
            PeerSignal::Failed(Error::PeerError(message))
        }
        Ok(ChannelEvent::Disconnected) | Err(broadcast::error::RecvError::Closed) => {
            PeerSignal::Failed(Error::ConnectionLost("signaling channel closed".into()))
        }
        _ => PeerSignal::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(msg: SignalingMessage) -> std::result::Result<ChannelEvent, broadcast::error::RecvError> {
        Ok(ChannelEvent::Message(msg))
    }

    #[test]
    fn test_classify_matches_only_own_transfer() {
        let mine = TransferId::from("mine");

        let other_error = event(SignalingMessage::TransferError {
            transfer_id: TransferId::from("other"),
            file: None,
            error: "boom".into(),
        });
        assert!(matches!(
            classify(other_error, &mine, Dialect::Direct),
            PeerSignal::Ignore
        ));

        let own_error = event(SignalingMessage::TransferError {
            transfer_id: mine.clone(),
            file: None,
            error: "boom".into(),
        });
        assert!(matches!(
            classify(own_error, &mine, Dialect::Direct),
            PeerSignal::Failed(Error::PeerError(ref m)) if m == "boom"
        ));

        let complete = event(SignalingMessage::TransferComplete {
            transfer_id: mine.clone(),
            file: "a.txt".into(),
            size: 3,
            download_url: None,
            saved_as: Some("1-a.txt".into()),
        });
        assert!(matches!(
            classify(complete, &mine, Dialect::Direct),
            PeerSignal::Complete { saved_as: Some(_) }
        ));
    }

    #[test]
    fn test_generic_error_only_aborts_registry_sessions() {
        let mine = TransferId::from("mine");
        let msg = || {
            event(SignalingMessage::Error {
                message: "target offline".into(),
            })
        };
        assert!(matches!(
            classify(msg(), &mine, Dialect::Direct),
            PeerSignal::Ignore
        ));
        assert!(matches!(
            classify(msg(), &mine, Dialect::Registry),
            PeerSignal::Failed(_)
        ));
        assert!(matches!(
            classify(Ok(ChannelEvent::Disconnected), &mine, Dialect::Direct),
            PeerSignal::Failed(Error::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_decision_ignores_unknown_ids() {
        let (tx, mut rx) = broadcast::channel(16);
        let mine = TransferId::from("mine");

        tx.send(ChannelEvent::Message(SignalingMessage::Accept {
            transfer_id: TransferId::from("someone-else"),
        }))
        .unwrap();
        tx.send(ChannelEvent::Message(SignalingMessage::Reject {
            transfer_id: mine.clone(),
        }))
        .unwrap();

        let err = await_decision(&mut rx, &mine, Dialect::Direct, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransferRejected));
    }

    #[tokio::test]
    async fn test_registry_ready_status_counts_as_accept() {
        let (tx, mut rx) = broadcast::channel(16);
        let mine = TransferId::from("mine");
        tx.send(ChannelEvent::Message(SignalingMessage::TransferResponse {
            transfer_id: mine.clone(),
            target_id: "me".into(),
            status: crate::protocol::ResponseStatus::Ready,
        }))
        .unwrap();

        await_decision(&mut rx, &mine, Dialect::Registry, None)
            .await
            .expect("accepted");
    }

    #[tokio::test]
    async fn test_decision_times_out() {
        let (_tx, mut rx) = broadcast::channel::<ChannelEvent>(16);
        let mine = TransferId::from("mine");

        let err = await_decision(
            &mut rx,
            &mine,
            Dialect::Direct,
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::AcceptTimeout(_)));
    }

    #[tokio::test]
    async fn test_missing_file_is_rejected_before_connecting() {
        let negotiator = Negotiator::with_settings(
            "me",
            "Me",
            NegotiatorSettings::default(),
            TransferRegistry::new(),
        );
        let peer = Device::new(std::net::Ipv4Addr::LOCALHOST, 9, "nobody");

        let err = negotiator
            .send_file(&peer, Path::new("/no/such/file.bin"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
        assert!(negotiator.registry().is_empty().await);
    }

    #[cfg(feature = "web")]
    async fn host() -> (SocketAddr, CancellationToken, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.general.device_id = Some("host-1".into());
        config.transfer.download_dir = Some(dir.path().to_path_buf());
        let acceptor = crate::transfer::Acceptor::new(&config, TransferRegistry::new());

        let server = crate::web::Server::bind((std::net::Ipv4Addr::LOCALHOST, 0).into(), acceptor)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        server.spawn(shutdown.clone());
        (addr, shutdown, dir)
    }

    #[cfg(feature = "web")]
    #[tokio::test]
    async fn test_dialect_switch_waits_for_running_transfers() {
        let (addr, shutdown, _dir) = host().await;
        let negotiator = Negotiator::with_settings(
            "me",
            "Me",
            NegotiatorSettings::default(),
            TransferRegistry::new(),
        );

        let (claim, remote_id) = negotiator.ensure_link(addr, Dialect::Direct).await.unwrap();
        assert_eq!(remote_id, None);

        let err = negotiator
            .ensure_link(addr, Dialect::Registry)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionBusy(_)));
        assert!(claim.channel.is_connected().await, "running link stays open");

        drop(claim);
        let (registered, remote_id) = negotiator
            .ensure_link(addr, Dialect::Registry)
            .await
            .unwrap();
        assert_eq!(remote_id.as_deref(), Some("host-1"));
        assert!(registered.channel.is_connected().await);

        drop(registered);
        negotiator.shutdown().await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_closed_link_is_forgotten() {
        use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
        use axum::routing::get;

        let app = axum::Router::new().route(
            "/ws",
            get(|ws: WebSocketUpgrade| async move {
                ws.on_upgrade(|mut socket| async move {
                    let _ = socket
                        .send(WsMessage::Text(r#"{"type":"READY","role":"receiver"}"#.into()))
                        .await;
                    let _ = socket.send(WsMessage::Close(None)).await;
                })
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let negotiator = Negotiator::with_settings(
            "me",
            "Me",
            NegotiatorSettings::default(),
            TransferRegistry::new(),
        );
        let (claim, _) = negotiator.ensure_link(addr, Dialect::Direct).await.unwrap();
        drop(claim);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !negotiator.inner.links.lock().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("closed link is still registered");
    }
}
