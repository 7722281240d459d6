//! Acceptor host.
//!
//! One axum server per device carries every inbound surface on a single
//! port (8080 by default):
//!
//! ## Endpoints
//!
//! | Method | Endpoint | Description |
//! |--------|----------|-------------|
//! | GET | /api/identify | Identity answered to discovery probes |
//! | GET | /health | Liveness |
//! | WS | /ws | Signaling channel |
//! | POST | /upload?transferId= | Raw-body file upload |
//! | GET | /api/files/{name} | Download a received file |

pub mod error;
pub mod handlers;
pub mod socket;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::error::Result;
use crate::transfer::Acceptor;

/// State shared by every handler.
#[derive(Debug)]
pub struct AppState {
    /// Receives transfers announced over `/ws`
    pub acceptor: Acceptor,
}

/// Handle to the shared state.
pub type SharedState = Arc<AppState>;

/// Build the host's router.
pub fn router(acceptor: Acceptor) -> Router {
    let state = Arc::new(AppState { acceptor });

    Router::new()
        .route("/api/identify", get(handlers::identify))
        .route("/health", get(handlers::health))
        .route("/ws", get(socket::upgrade))
        .route(
            "/upload",
            post(handlers::upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/files/{name}", get(handlers::download))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

/// A bound acceptor host.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    acceptor: Acceptor,
}

impl Server {
    /// Bind the host to `addr`.
    pub async fn bind(addr: SocketAddr, acceptor: Acceptor) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, acceptor })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!("Acceptor host listening on {}", addr);

        let app = router(self.acceptor);
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        tracing::info!("Acceptor host on {} stopped", addr);
        Ok(())
    }

    /// Serve on a background task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }
}

/// Addresses other devices can reach this host on.
pub fn local_addresses() -> Vec<String> {
    let mut addrs = vec![Ipv4Addr::LOCALHOST.to_string()];
    addrs.extend(crate::discovery::local_ipv4().map(|ip| ip.to_string()));
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_addresses_start_with_loopback() {
        let addrs = local_addresses();
        assert_eq!(addrs[0], "127.0.0.1");
        match crate::discovery::local_ipv4() {
            Some(ip) => assert_eq!(addrs, vec!["127.0.0.1".to_string(), ip.to_string()]),
            None => assert_eq!(addrs.len(), 1),
        }
    }
}
