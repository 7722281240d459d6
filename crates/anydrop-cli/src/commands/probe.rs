//! Probe command implementation.

use anyhow::{bail, Result};

use anydrop_core::discovery::Scanner;

use super::ProbeArgs;
use crate::ui;

/// Run the probe command.
pub async fn run(args: ProbeArgs) -> Result<()> {
    let mut config = super::load_config();
    let (address, port) = super::parse_peer(&args.address, args.port, config.network.port)?;
    config.network.port = port;

    let scanner = Scanner::from_config(&config);
    let Some(device) = scanner.add_manual_device(address).await else {
        bail!(
            "No AnyDrop device answered at {}:{} (timeout {:?})",
            address,
            port,
            config.network.probe_timeout
        );
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&device)?);
    } else {
        println!();
        ui::print_device_header();
        ui::print_device_row(&device);
        ui::print_device_footer(1);
    }

    Ok(())
}
