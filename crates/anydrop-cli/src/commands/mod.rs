//! CLI command definitions and handlers.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use anydrop_core::config::Config;
use anydrop_core::discovery::{Device, Scanner};
use anydrop_core::transfer::{Dialect, TransportKind};

/// Load configuration with graceful fallback to defaults.
///
/// If the config file doesn't exist or can't be parsed, it falls back to
/// defaults.
pub fn load_config() -> Config {
    match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Using default configuration: {}", e);
            Config::default()
        }
    }
}

/// Split `"A.B.C.D"` or `"A.B.C.D:PORT"` into an address and port.
///
/// An explicit `port` argument wins over one embedded in the address.
pub fn parse_peer(address: &str, port: Option<u16>, default_port: u16) -> Result<(Ipv4Addr, u16)> {
    let (host, embedded) = match address.rsplit_once(':') {
        Some((host, p)) => {
            let p: u16 = p
                .parse()
                .with_context(|| format!("Invalid port in '{}'", address))?;
            (host, Some(p))
        }
        None => (address, None),
    };

    let ip: Ipv4Addr = host
        .trim()
        .parse()
        .with_context(|| format!("'{}' is not an IPv4 address", host))?;
    if ip.is_unspecified() {
        bail!("'{}' is not a usable peer address", ip);
    }

    Ok((ip, port.or(embedded).unwrap_or(default_port)))
}

/// Identify the peer at `address:port`, falling back to a bare record when
/// it does not answer the identity probe.
pub async fn resolve_device(config: &Config, address: Ipv4Addr, port: u16) -> Device {
    let mut config = config.clone();
    config.network.port = port;

    let scanner = Scanner::from_config(&config);
    if let Some(device) = scanner.add_manual_device(address).await {
        return device;
    }

    tracing::debug!("{}:{} did not identify itself", address, port);
    Device::new(address, port, address.to_string())
}

pub mod config;
pub mod probe;
pub mod scan;
pub mod send;
pub mod serve;
pub mod text;

/// AnyDrop - LAN device discovery and direct file transfer
#[derive(Parser)]
#[command(name = "anydrop")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Detailed logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Scan the local subnet for devices
    Scan(ScanArgs),

    /// Identify a single host
    Probe(ProbeArgs),

    /// Receive transfers from other devices
    Serve(ServeArgs),

    /// Send a file to a device
    Send(SendArgs),

    /// Send a text message to a device
    Text(TextArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the scan command
#[derive(Parser)]
pub struct ScanArgs {
    /// Subnet to scan as a /24 prefix (e.g. 192.168.1)
    #[arg(long)]
    pub subnet: Option<String>,

    /// Port to probe
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Skip listening for mDNS advertisements
    #[arg(long)]
    pub no_mdns: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the probe command
#[derive(Parser)]
pub struct ProbeArgs {
    /// Address to probe (A.B.C.D or A.B.C.D:PORT)
    pub address: String,

    /// Port to probe
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the serve command
#[derive(Parser)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Output directory for received files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Accept every incoming transfer without asking
    #[arg(short, long)]
    pub yes: bool,

    /// Do not advertise this host over mDNS
    #[arg(long)]
    pub no_mdns: bool,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// Receiving device (A.B.C.D or A.B.C.D:PORT)
    pub address: String,

    /// File to send
    pub file: PathBuf,

    /// Receiver port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Data plane used for the file bytes
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportArg>,

    /// Handshake dialect
    #[arg(short, long, value_enum)]
    pub dialect: Option<DialectArg>,

    /// Transfer id to use instead of a generated one
    #[arg(long)]
    pub id: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the text command
#[derive(Parser)]
pub struct TextArgs {
    /// Receiving device (A.B.C.D or A.B.C.D:PORT)
    pub address: String,

    /// Message to send
    pub message: String,

    /// Receiver port
    #[arg(short, long)]
    pub port: Option<u16>,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config action
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Print the config file location
    Path,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

/// `--transport` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    /// Binary frames on the signaling socket
    Chunked,
    /// Raw-body HTTP upload
    Http,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Chunked => Self::Chunked,
            TransportArg::Http => Self::Http,
        }
    }
}

/// `--dialect` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DialectArg {
    /// READY / FILE_METADATA / ACCEPT
    Direct,
    /// REGISTER / TRANSFER_REQUEST / TRANSFER_RESPONSE
    Registry,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Direct => Self::Direct,
            DialectArg::Registry => Self::Registry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        let ip = Ipv4Addr::new(192, 168, 1, 42);
        assert_eq!(parse_peer("192.168.1.42", None, 8080).unwrap(), (ip, 8080));
        assert_eq!(parse_peer("192.168.1.42:9000", None, 8080).unwrap(), (ip, 9000));
        assert_eq!(
            parse_peer("192.168.1.42:9000", Some(7000), 8080).unwrap(),
            (ip, 7000)
        );
        assert!(parse_peer("phone.local", None, 8080).is_err());
        assert!(parse_peer("192.168.1.42:http", None, 8080).is_err());
        assert!(parse_peer("0.0.0.0", None, 8080).is_err());
    }

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::try_parse_from([
            "anydrop",
            "send",
            "10.0.0.5",
            "notes.txt",
            "--transport",
            "chunked",
            "--dialect",
            "registry",
            "--id",
            "t-1",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.transport, Some(TransportArg::Chunked));
        assert_eq!(args.dialect, Some(DialectArg::Registry));
        assert_eq!(args.id.as_deref(), Some("t-1"));
    }

    #[test]
    fn test_cli_parses_no_mdns() {
        let cli = Cli::try_parse_from(["anydrop", "serve", "--yes", "--no-mdns"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert!(args.yes);
        assert!(args.no_mdns);

        let cli = Cli::try_parse_from(["anydrop", "scan"]).unwrap();
        let Command::Scan(args) = cli.command else {
            panic!("expected scan");
        };
        assert!(!args.no_mdns);
    }
}
