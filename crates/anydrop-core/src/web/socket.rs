//! `/ws` signaling endpoint.
//!
//! Each socket is registered with the [`Acceptor`] and greeted with `READY`.
//! A single loop forwards queued outbound items to the socket and inbound
//! frames to the acceptor, so a connection's frames are handled in order.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::SharedState;
use crate::transfer::Acceptor;
use crate::transport::Outbound;

/// GET /ws - Upgrade to a signaling socket.
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let acceptor = state.acceptor.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, acceptor, peer))
}

async fn handle_socket(socket: WebSocket, acceptor: Acceptor, peer: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let connection = acceptor.open_connection(peer, tx).await;

    loop {
        tokio::select! {
            biased;
            Some(item) = rx.recv() => {
                let frame = match item {
                    Outbound::Message(msg) => match msg.encode() {
                        Ok(text) => Message::Text(text.into()),
                        Err(e) => {
                            tracing::warn!("dropping unencodable message: {}", e);
                            continue;
                        }
                    },
                    Outbound::Binary(bytes) => Message::Binary(bytes),
                    Outbound::Close => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                };
                if sender.send(frame).await.is_err() {
                    break;
                }
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        acceptor.handle_text(connection, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        acceptor.handle_binary(connection, bytes).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("signaling socket from {} failed: {}", peer, e);
                        break;
                    }
                }
            }
        }
    }

    acceptor.close_connection(connection).await;
}
