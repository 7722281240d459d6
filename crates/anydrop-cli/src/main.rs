//! AnyDrop CLI - LAN device discovery and direct file transfer
//!
//! AnyDrop finds devices on the local /24 subnet and moves files to them
//! over a WebSocket handshake plus either chunked frames or a raw HTTP
//! upload.
//!
//! ## Quick Start
//!
//! ```bash
//! # Receive files (on one device)
//! anydrop serve
//!
//! # Find it and send a file (on another)
//! anydrop scan
//! anydrop send 192.168.1.42 ./document.pdf
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use std::process::ExitCode;

use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::Scan(args) => commands::scan::run(args).await,
        Command::Probe(args) => commands::probe::run(args).await,
        Command::Serve(args) => commands::serve::run(args).await,
        Command::Send(args) => commands::send::run(args).await,
        Command::Text(args) => commands::text::run(args).await,
        Command::Config(args) => commands::config::run(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn report_error(err: &anyhow::Error) {
    eprintln!("Error: {err:#}");

    let Some(core) = core_error(err) else {
        return;
    };
    if let Some(suggestion) = core.suggestion() {
        eprintln!();
        eprintln!("Suggestion:");
        for line in suggestion.lines() {
            eprintln!("  {}", line.trim());
        }
    }
    if core.is_recoverable() {
        eprintln!();
        eprintln!("This may be temporary; running the command again can help.");
    }
}

/// The library error underneath any added context.
fn core_error(err: &anyhow::Error) -> Option<&anydrop_core::Error> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<anydrop_core::Error>())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default_filter = if verbose {
        "warn,anydrop=debug,anydrop_core=debug"
    } else {
        "warn,anydrop=info,anydrop_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_core_error_is_found_under_context() {
        let err = Err::<(), _>(anydrop_core::Error::ConnectionFailed("ws://x/ws".into()))
            .context("Failed to start transfer")
            .unwrap_err();
        let core = core_error(&err).expect("library error in chain");
        assert!(core.suggestion().is_some());
        assert!(core.is_recoverable());

        let plain = anyhow::anyhow!("Transfer failed: disk full");
        assert!(core_error(&plain).is_none());
    }
}
