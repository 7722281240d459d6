//! Signaling channel to one peer.
//!
//! A [`SignalingChannel`] owns at most one WebSocket to `ws://{host}:{port}/ws`
//! and exposes it as a stream of [`ChannelEvent`]s plus a send queue. The
//! socket is split into a reader task that decodes frames into events and a
//! writer task that drains an [`Outbound`] queue, so text and binary sends
//! are serialized through a single writer.
//!
//! `Connected` is delivered once per successful open and `Disconnected` once
//! per close, whichever side closes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::{self, SignalingMessage};
use crate::transport::{Outbound, OutboundSender};

const EVENT_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 32;

/// Something that happened on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The socket opened
    Connected,
    /// The socket closed
    Disconnected,
    /// The socket reported an error; a `Disconnected` follows
    Error(String),
    /// A decoded control message
    Message(SignalingMessage),
    /// A binary frame
    Binary(Bytes),
}

#[derive(Debug, Clone)]
struct LinkState {
    open: Arc<AtomicBool>,
    closed: CancellationToken,
    events: broadcast::Sender<ChannelEvent>,
}

impl LinkState {
    fn new(events: broadcast::Sender<ChannelEvent>) -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
            closed: CancellationToken::new(),
            events,
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.closed.cancel();
            let _ = self.events.send(ChannelEvent::Disconnected);
        }
    }
}

#[derive(Debug)]
struct Link {
    outbound: OutboundSender,
    state: LinkState,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn teardown(self) {
        self.state.close();
        self.reader.abort();
        self.writer.abort();
    }
}

/// WebSocket signaling link to a single peer.
#[derive(Debug)]
pub struct SignalingChannel {
    events: broadcast::Sender<ChannelEvent>,
    link: Mutex<Option<Link>>,
    connect_timeout: Duration,
}

impl SignalingChannel {
    /// Create a disconnected channel.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            link: Mutex::new(None),
            connect_timeout,
        }
    }

    /// Subscribe to channel events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Whether the socket is currently open.
    pub async fn is_connected(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .is_some_and(|link| link.state.is_open())
    }

    /// Open the socket to `address`.
    ///
    /// Does nothing when a socket is already open. A previously closed
    /// socket is torn down before reconnecting.
    pub async fn connect(&self, address: SocketAddr) -> Result<()> {
        let mut slot = self.link.lock().await;
        if slot.as_ref().is_some_and(|link| link.state.is_open()) {
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            stale.teardown();
        }

        let url = format!("ws://{address}/ws");
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::ConnectionFailed(format!("{url}: timed out")))?
            .map_err(|e| Error::ConnectionFailed(format!("{url}: {e}")))?;

        let (mut sink, mut source) = stream.split();
        let _ = self.events.send(ChannelEvent::Connected);
        let (outbound, mut queue) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
        let state = LinkState::new(self.events.clone());

        let writer_state = state.clone();
        let writer = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    item = queue.recv() => item,
                    () = writer_state.closed.cancelled() => None,
                };
                let Some(item) = item else { break };

                let frame = match item {
                    Outbound::Message(msg) => match msg.encode() {
                        Ok(text) => WsMessage::text(text),
                        Err(e) => {
                            tracing::warn!("dropping unencodable message: {}", e);
                            continue;
                        }
                    },
                    Outbound::Binary(bytes) => WsMessage::binary(bytes),
                    Outbound::Close => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                };

                if let Err(e) = sink.send(frame).await {
                    tracing::debug!("signaling write failed: {}", e);
                    let _ = writer_state.events.send(ChannelEvent::Error(e.to_string()));
                    break;
                }
            }
            writer_state.close();
        });

        let reader_state = state.clone();
        let reader = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = source.next() => frame,
                    () = reader_state.closed.cancelled() => break,
                };
                let Some(frame) = frame else { break };

                match frame {
                    Ok(WsMessage::Text(text)) => dispatch_text(&reader_state.events, text.as_str()),
                    Ok(WsMessage::Binary(bytes)) => {
                        let _ = reader_state.events.send(ChannelEvent::Binary(bytes));
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = reader_state.events.send(ChannelEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            reader_state.close();
        });

        tracing::debug!("signaling channel open to {}", address);
        *slot = Some(Link {
            outbound,
            state,
            reader,
            writer,
        });
        Ok(())
    }

    /// Queue handle for the open socket, if any.
    pub async fn outbound(&self) -> Option<OutboundSender> {
        self.link
            .lock()
            .await
            .as_ref()
            .filter(|link| link.state.is_open())
            .map(|link| link.outbound.clone())
    }

    /// Send a control message.
    pub async fn send(&self, message: SignalingMessage) -> Result<()> {
        self.enqueue(Outbound::Message(message)).await
    }

    /// Send a binary frame.
    pub async fn send_binary(&self, bytes: Bytes) -> Result<()> {
        self.enqueue(Outbound::Binary(bytes)).await
    }

    async fn enqueue(&self, item: Outbound) -> Result<()> {
        let outbound = self.outbound().await.ok_or(Error::NotConnected)?;
        outbound.send(item).await.map_err(|_| Error::NotConnected)
    }

    /// Close the socket. Safe to call when already closed.
    pub async fn disconnect(&self) {
        let Some(link) = self.link.lock().await.take() else {
            return;
        };
        if link.state.is_open() {
            let _ = link.outbound.try_send(Outbound::Close);
        }
        link.state.close();
    }
}

fn dispatch_text(events: &broadcast::Sender<ChannelEvent>, text: &str) {
    match SignalingMessage::decode(text) {
        Ok(SignalingMessage::Unknown) => {
            tracing::debug!(
                "ignoring unknown message type {:?}",
                protocol::raw_type(text).unwrap_or_default()
            );
        }
        Ok(message) => {
            let _ = events.send(ChannelEvent::Message(message));
        }
        Err(e) => {
            tracing::warn!("ignoring malformed signaling message: {}", e);
        }
    }
}
