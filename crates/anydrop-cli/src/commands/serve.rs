//! Serve command implementation.
//!
//! Runs the acceptor host and asks the user about every incoming transfer.
//! Requests queue up; each answer on stdin settles the oldest one.

use std::collections::VecDeque;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use anydrop_core::config::Config;
use anydrop_core::discovery::{self, mdns::MdnsAdvertiser, mdns::MdnsProperties};
use anydrop_core::file::format_size;
use anydrop_core::transfer::{
    Acceptor, Direction, IncomingTransfer, TransferEvent, TransferRegistry,
};
use anydrop_core::web::{self, Server};

use super::ServeArgs;
use crate::ui;

/// Run the serve command.
pub async fn run(args: ServeArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(port) = args.port {
        config.network.port = port;
    }
    if let Some(output) = args.output {
        config.transfer.download_dir = Some(output);
    }

    let acceptor = Acceptor::new(&config, TransferRegistry::new());
    let mut events = acceptor.subscribe();

    let bind = SocketAddr::new(config.network.bind_address, config.network.port);
    let server = Server::bind(bind, acceptor.clone())
        .await
        .with_context(|| format!("Failed to listen on {}", bind))?;
    let port = server.local_addr()?.port();

    let shutdown = CancellationToken::new();
    let host = server.spawn(shutdown.clone());

    let advertiser = if config.network.mdns && !args.no_mdns {
        advertise(&config, &acceptor, port).await
    } else {
        None
    };

    if !args.json {
        println!();
        println!("  {} is ready to receive", acceptor.device_name());
        for addr in web::local_addresses() {
            println!("    {}:{}", addr, port);
        }
        println!("  Saving to {}", acceptor.download_dir().display());
        println!("  Press Ctrl+C to stop.");
        println!();
    }

    let mut pending: VecDeque<IncomingTransfer> = VecDeque::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                break;
            }
            line = stdin.next_line(), if !pending.is_empty() => {
                let Some(request) = pending.pop_front() else { continue };
                let answer = line.context("Failed to read answer")?.unwrap_or_default();
                decide(&acceptor, &request, is_yes(&answer)).await;
                if let Some(next) = pending.front() {
                    prompt(next);
                }
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Skipped {} transfer events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if args.json {
                    println!("{}", serde_json::to_string(&event)?);
                }

                match event {
                    TransferEvent::TransferRequested(request) => {
                        if args.yes {
                            if !args.json {
                                println!(
                                    "  Accepting {} ({}) from {}",
                                    request.file_name,
                                    format_size(request.file_size),
                                    sender_label(&request)
                                );
                            }
                            decide(&acceptor, &request, true).await;
                        } else {
                            if pending.is_empty() {
                                prompt(&request);
                            }
                            pending.push_back(request);
                        }
                    }
                    _ if args.json => {}
                    TransferEvent::Progress(progress) if progress.direction == Direction::Inbound => {
                        ui::redraw(&ui::progress_line(
                            progress.bytes_transferred,
                            progress.total_bytes,
                        ));
                    }
                    TransferEvent::Completed(done) => {
                        println!();
                        match done.saved_path {
                            Some(path) => println!(
                                "  Received {} ({}) -> {}",
                                done.file_name,
                                format_size(done.size),
                                path.display()
                            ),
                            None => println!("  Received {}", done.file_name),
                        }
                    }
                    TransferEvent::Failed { transfer_id, failure, .. } => {
                        pending.retain(|r| r.transfer_id != transfer_id);
                        println!();
                        println!("  Transfer {} ended: {}", transfer_id, failure.message);
                    }
                    TransferEvent::TextReceived(text) => {
                        println!("  Message from {}: {}", text.sender_id, text.text);
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(advertiser) = advertiser {
        if let Err(e) = advertiser.unregister().await {
            tracing::debug!("Failed to withdraw mDNS advertisement: {}", e);
        }
    }

    shutdown.cancel();
    host.await
        .context("Acceptor host task failed")?
        .context("Acceptor host stopped with an error")?;
    Ok(())
}

async fn advertise(config: &Config, acceptor: &Acceptor, port: u16) -> Option<MdnsAdvertiser> {
    let properties = MdnsProperties {
        device_id: acceptor.device_id().to_string(),
        device_name: acceptor.device_name().to_string(),
        class: config.general.device_class,
        port,
        address: discovery::local_ipv4(),
    };
    let advertiser = match MdnsAdvertiser::new() {
        Ok(advertiser) => advertiser,
        Err(e) => {
            tracing::warn!("mDNS advertising unavailable: {}", e);
            return None;
        }
    };
    match advertiser.register(&properties).await {
        Ok(_) => Some(advertiser),
        Err(e) => {
            tracing::warn!("Failed to advertise over mDNS: {}", e);
            None
        }
    }
}

async fn decide(acceptor: &Acceptor, request: &IncomingTransfer, accept: bool) {
    let result = if accept {
        acceptor.accept_transfer(&request.transfer_id).await
    } else {
        acceptor.reject_transfer(&request.transfer_id).await
    };
    if let Err(e) = result {
        eprintln!("  Could not answer {}: {}", request.transfer_id, e);
    }
}

fn prompt(request: &IncomingTransfer) {
    println!(
        "  {} wants to send {} ({}). Accept? [y/N]",
        sender_label(request),
        request.file_name,
        format_size(request.file_size)
    );
}

fn sender_label(request: &IncomingTransfer) -> &str {
    request.sender_name.as_deref().unwrap_or(&request.sender_id)
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y"));
        assert!(is_yes(" YES \n"));
        assert!(!is_yes(""));
        assert!(!is_yes("n"));
        assert!(!is_yes("maybe"));
    }
}
