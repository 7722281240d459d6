//! Send command implementation.

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;

use anydrop_core::file::format_size;
use anydrop_core::transfer::negotiator::NegotiatorSettings;
use anydrop_core::transfer::{Negotiator, TransferEvent, TransferId, TransferRegistry};

use super::SendArgs;
use crate::ui;

/// Run the send command.
pub async fn run(args: SendArgs) -> Result<()> {
    let config = super::load_config();
    let (address, port) = super::parse_peer(&args.address, args.port, config.network.port)?;

    let mut settings = NegotiatorSettings::from_config(&config);
    if let Some(transport) = args.transport {
        settings.transport = transport.into();
    }
    if let Some(dialect) = args.dialect {
        settings.dialect = dialect.into();
    }

    let device = super::resolve_device(&config, address, port).await;
    let negotiator = Negotiator::with_settings(
        config.general.resolved_device_id(),
        config.general.device_name.clone(),
        settings,
        TransferRegistry::new(),
    );
    let mut events = negotiator.subscribe();

    if !args.json {
        println!();
        println!(
            "  Sending {} to {} ({}) over {}...",
            args.file.display(),
            device.display_name,
            device.id,
            negotiator.settings().effective_transport()
        );
    }

    let transfer_id = match negotiator
        .send_file(&device, &args.file, args.id.map(TransferId::from))
        .await
    {
        Ok(id) => id,
        Err(e) => {
            negotiator.shutdown().await;
            return Err(e).context("Failed to start transfer");
        }
    };

    if !args.json {
        println!("  Waiting for {} to accept...", device.display_name);
    }

    let outcome = wait_for_outcome(&negotiator, &mut events, &transfer_id, args.json).await;
    negotiator.shutdown().await;
    outcome
}

async fn wait_for_outcome(
    negotiator: &Negotiator,
    events: &mut tokio::sync::broadcast::Receiver<TransferEvent>,
    transfer_id: &TransferId,
    json: bool,
) -> Result<()> {
    let mut cancelling = false;

    loop {
        let event = tokio::select! {
            result = tokio::signal::ctrl_c(), if !cancelling => {
                result.context("Failed to listen for Ctrl+C")?;
                cancelling = true;
                negotiator.cancel_transfer(transfer_id).await;
                continue;
            }
            event = events.recv() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Skipped {} transfer events", skipped);
                continue;
            }
            Err(RecvError::Closed) => bail!("Transfer events stopped unexpectedly"),
        };
        if event.transfer_id() != Some(transfer_id) {
            continue;
        }

        if json {
            println!("{}", serde_json::to_string(&event)?);
        }

        match event {
            TransferEvent::StateChanged { state, .. } => {
                tracing::debug!("Transfer {} is now {}", transfer_id, state);
            }
            TransferEvent::Progress(progress) if !json => {
                ui::redraw(&ui::progress_line(
                    progress.bytes_transferred,
                    progress.total_bytes,
                ));
            }
            TransferEvent::Completed(done) => {
                if !json {
                    println!();
                    println!();
                    println!("  Sent {} ({})", done.file_name, format_size(done.size));
                }
                return Ok(());
            }
            TransferEvent::Failed { failure, .. } => {
                if !json {
                    println!();
                }
                if failure.kind.is_error() {
                    bail!("Transfer failed: {}", failure.message);
                }
                if !json {
                    println!("  {}", failure.message);
                }
                return Ok(());
            }
            _ => {}
        }
    }
}
