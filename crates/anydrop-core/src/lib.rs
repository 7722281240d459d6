//! # AnyDrop Core Library
//!
//! `anydrop-core` lets two devices on the same local network find each
//! other and move a file directly, with an explicit accept/reject handshake
//! and live progress reporting.
//!
//! ## Features
//!
//! - **Subnet discovery**: concurrent identification probes over the local /24
//! - **mDNS discovery**: `_anydrop._tcp` advertising and browsing (`mdns` feature)
//! - **Signaling**: typed JSON control messages over a persistent WebSocket
//! - **Two data planes**: binary frames on the signaling socket, or a raw HTTP upload
//! - **Typed events**: progress and outcomes arrive on `broadcast` channels
//!
//! ## Modules
//!
//! - [`channel`] - Signaling channel to one peer
//! - [`config`] - Configuration management
//! - [`discovery`] - Device prober, subnet scanner and mDNS
//! - [`mod@file`] - File naming, chunked reads and size formatting
//! - [`protocol`] - Signaling message wire format
//! - [`transfer`] - Sessions, registry, initiator and acceptor state machines
//! - [`transport`] - Chunked-over-signaling and raw HTTP data planes
//! - [`web`] - Acceptor host (identify, signaling, upload endpoints)
//!
//! ## Example
//!
//! ```rust,ignore
//! use anydrop_core::config::Config;
//! use anydrop_core::discovery::Scanner;
//! use anydrop_core::transfer::{Negotiator, TransferRegistry};
//!
//! let config = Config::load()?;
//! let scanner = Scanner::from_config(&config);
//! let devices = scanner.scan().await;
//!
//! let negotiator = Negotiator::new(&config, TransferRegistry::new());
//! let id = negotiator.send_file(&devices[0], "report.pdf".as_ref(), None).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

pub mod channel;
pub mod config;
pub mod discovery;
pub mod error;
pub mod file;
pub mod protocol;
pub mod transfer;
pub mod transport;

#[cfg(feature = "web")]
pub mod web;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application identity asserted by `/api/identify`
pub const APP_IDENTITY: &str = "AnyDrop";

/// Default port for the acceptor host (identify, signaling and upload)
pub const DEFAULT_PORT: u16 = 8080;

/// Default chunk size for chunked-over-signaling transfers (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Subnet prefix scanned when no local address can be observed
pub const DEFAULT_SUBNET: &str = "192.168.1";
