//! Scan command implementation.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Result};

use anydrop_core::discovery::mdns::MdnsBrowser;
use anydrop_core::discovery::{Device, Scanner, Subnet};

use super::ScanArgs;
use crate::ui;

/// Run the scan command.
pub async fn run(args: ScanArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(subnet) = args.subnet {
        if Subnet::parse(&subnet).is_none() {
            bail!("'{}' is not a /24 prefix like 192.168.1", subnet);
        }
        config.network.subnet = Some(subnet);
    }
    if let Some(port) = args.port {
        config.network.port = port;
    }

    let scanner = Scanner::from_config(&config);
    let browser = if config.network.mdns && !args.no_mdns {
        match MdnsBrowser::new() {
            Ok(browser) => Some(browser),
            Err(e) => {
                tracing::warn!("mDNS browsing unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    if !args.json {
        println!();
        println!(
            "Scanning {} on port {}...",
            scanner.subnet(),
            config.network.port
        );
        println!();
        ui::print_device_header();
    }

    let mut updates = scanner.subscribe();
    let mut printed = HashSet::new();
    let scan = async {
        let (_, advertised) = tokio::join!(
            scanner.scan(),
            browse(browser.as_ref(), config.network.mdns_browse)
        );
        for device in advertised {
            scanner.insert_device(device).await;
        }
        scanner.devices().await
    };
    tokio::pin!(scan);

    let devices = loop {
        tokio::select! {
            devices = &mut scan => break devices,
            Ok(update) = updates.recv() => {
                if !args.json {
                    print_new(&update.devices, &mut printed);
                }
            }
        }
    };

    if args.json {
        output_json_devices(&devices)?;
    } else {
        print_new(&devices, &mut printed);
        ui::print_device_footer(devices.len());
    }

    Ok(())
}

async fn browse(browser: Option<&MdnsBrowser>, duration: Duration) -> Vec<Device> {
    match browser {
        Some(browser) => browser.scan(duration).await,
        None => Vec::new(),
    }
}

fn print_new(devices: &[Device], printed: &mut HashSet<String>) {
    for device in devices {
        if printed.insert(device.id.clone()) {
            ui::print_device_row(device);
        }
    }
}

/// Output devices as JSON.
fn output_json_devices(devices: &[Device]) -> Result<()> {
    let output = serde_json::json!({ "devices": devices });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
