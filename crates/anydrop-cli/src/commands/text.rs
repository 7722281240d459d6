//! Text command implementation.

use anyhow::{Context, Result};

use anydrop_core::transfer::{Negotiator, TransferRegistry};

use super::TextArgs;

/// Run the text command.
pub async fn run(args: TextArgs) -> Result<()> {
    let config = super::load_config();
    let (address, port) = super::parse_peer(&args.address, args.port, config.network.port)?;
    let device = super::resolve_device(&config, address, port).await;

    let negotiator = Negotiator::new(&config, TransferRegistry::new());
    let result = negotiator
        .send_text(&device, &args.message)
        .await
        .with_context(|| format!("Failed to send message to {}", device.id));
    negotiator.shutdown().await;
    result?;

    println!("  Message sent to {}", device.display_name);
    Ok(())
}
