//! Common test utilities for `AnyDrop` integration tests.
//!
//! This module provides shared functionality for integration tests.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use anydrop_core::config::Config;
use anydrop_core::discovery::Device;
use anydrop_core::transfer::negotiator::NegotiatorSettings;
use anydrop_core::transfer::{
    Acceptor, Dialect, Negotiator, TransferEvent, TransferId, TransferRegistry, TransportKind,
};
use anydrop_core::web::Server;

/// Upper bound on any single wait in these tests.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &Path, path2: &Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1, content2, "File contents differ");
}

/// An acceptor host on a loopback port, saving into a temp dir.
pub struct TestHost {
    /// Acceptor behind the host
    pub acceptor: Acceptor,
    /// Bound address
    pub addr: SocketAddr,
    /// Download directory
    pub downloads: TempDir,
    shutdown: CancellationToken,
}

impl TestHost {
    /// Start a host with device id `receiver-1`.
    pub async fn start() -> Self {
        let downloads = create_temp_dir();
        let mut config = Config::default();
        config.general.device_id = Some("receiver-1".to_string());
        config.general.device_name = "Receiver".to_string();
        config.transfer.download_dir = Some(downloads.path().to_path_buf());

        let acceptor = Acceptor::new(&config, TransferRegistry::new());
        let server = Server::bind((Ipv4Addr::LOCALHOST, 0).into(), acceptor.clone())
            .await
            .expect("Failed to bind test host");
        let addr = server.local_addr().expect("bound address");
        let shutdown = CancellationToken::new();
        server.spawn(shutdown.clone());

        Self {
            acceptor,
            addr,
            downloads,
            shutdown,
        }
    }

    /// The host as a discovered device.
    pub fn device(&self) -> Device {
        Device::new(Ipv4Addr::LOCALHOST, self.addr.port(), "Receiver")
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Negotiator settings with short timeouts and no chunk delay.
pub fn fast_settings(transport: TransportKind, dialect: Dialect) -> NegotiatorSettings {
    NegotiatorSettings {
        transport,
        dialect,
        chunk_size: 64 * 1024,
        chunk_delay: Duration::ZERO,
        ready_timeout: Duration::from_secs(2),
        accept_timeout: Some(Duration::from_secs(5)),
        connect_timeout: Duration::from_secs(2),
    }
}

/// A sender with device id `sender-1`.
pub fn sender(settings: NegotiatorSettings) -> Negotiator {
    Negotiator::with_settings("sender-1", "Sender", settings, TransferRegistry::new())
}

/// Wait for the first event matching `pred`, failing the test on timeout.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<TransferEvent>, mut pred: F) -> TransferEvent
where
    F: FnMut(&TransferEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait for the terminal event of `id`.
pub async fn wait_for_outcome(
    rx: &mut broadcast::Receiver<TransferEvent>,
    id: &TransferId,
) -> TransferEvent {
    wait_for(rx, |event| {
        event.transfer_id() == Some(id)
            && matches!(
                event,
                TransferEvent::Completed(_) | TransferEvent::Failed { .. }
            )
    })
    .await
}

/// Wait for the acceptor to announce a transfer and return its id.
pub async fn wait_for_request(rx: &mut broadcast::Receiver<TransferEvent>) -> TransferId {
    match wait_for(rx, |event| {
        matches!(event, TransferEvent::TransferRequested(_))
    })
    .await
    {
        TransferEvent::TransferRequested(request) => request.transfer_id,
        _ => unreachable!(),
    }
}
