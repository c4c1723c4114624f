use anyhow::{Context, Result};
use clap::Parser;
use client::{Client, ClientConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use wire::location::{NodeLocation, NodeLocator, StaticNodeLocator};

const DEFAULT_AUTHORITY_PORT: u16 = 9999;

/// Arena client: joins a lobby and plays either over a direct link
/// ("wired") or through the mobile DTN overlay.
#[derive(Debug, Parser)]
#[command(name = "arena-client", version)]
struct ClientArgs {
    /// Node identifier; also the DNS name resolved for this node's own
    /// address when `--address` is not given.
    #[arg(long)]
    id: String,

    /// Literal IPv6 address or DNS name this node is reachable at.
    #[arg(long)]
    address: Option<String>,

    /// Literal IPv6 address or DNS name of the server's front door.
    #[arg(long)]
    authority: String,

    #[arg(long, default_value_t = DEFAULT_AUTHORITY_PORT)]
    port: u16,

    /// Display name sent with JOIN; defaults to `--id`.
    #[arg(long)]
    display_name: Option<String>,

    /// Single-line "x,y" position file, used both for the KALIVE
    /// payload and (mobile mode) the DTN preferred-hop calculation.
    #[arg(long)]
    position_file: Option<PathBuf>,

    /// Join the match over the DTN multicast overlay instead of a
    /// direct link to the server.
    #[arg(long)]
    mobile: bool,

    #[arg(long, default_value = "info")]
    level: Level,
}

fn main() {
    let args = ClientArgs::parse();
    init_tracing(args.level);

    let location = match resolve_location(&args) {
        Ok(location) => location,
        Err(e) => {
            tracing::error!(id = %args.id, error = %e, "could not resolve node location");
            std::process::exit(1);
        }
    };
    let authority = match resolve_authority(&args) {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(authority = %args.authority, error = %e, "could not resolve authority address");
            std::process::exit(1);
        }
    };

    info!(
        id = %args.id,
        address = %location.address,
        mobile = args.mobile,
        %authority,
        "starting arena client",
    );

    if let Err(e) = run(&args, &location, authority) {
        tracing::error!(error = %e, "arena client terminated with a fault");
        std::process::exit(2);
    }
}

fn init_tracing(level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level.to_string()))
        .init();
}

fn resolve_location(args: &ClientArgs) -> Result<NodeLocation> {
    let locator = StaticNodeLocator {
        position_file: args.position_file.clone(),
        address: args.address.clone().unwrap_or_else(|| args.id.clone()),
    };
    locator
        .locate()
        .with_context(|| format!("no address resolvable for node id {}", args.id))
}

fn resolve_authority(args: &ClientArgs) -> Result<SocketAddr> {
    let locator = StaticNodeLocator {
        position_file: None,
        address: args.authority.clone(),
    };
    let location = locator
        .locate()
        .with_context(|| format!("no address resolvable for authority {}", args.authority))?;
    Ok(SocketAddr::new(IpAddr::V6(location.address), args.port))
}

fn run(args: &ClientArgs, location: &NodeLocation, authority: SocketAddr) -> Result<()> {
    let config = ClientConfig {
        node_id: args.id.clone(),
        local_address: location.address,
        authority,
        display_name: args.display_name.clone().unwrap_or_else(|| args.id.clone()),
        mobile: args.mobile,
    };

    let client = Client::connect(config, location.position).context("join handshake failed")?;
    client.run();

    // Blocks for the process lifetime; the loops run until an external
    // signal kills the process (mirroring the server front door, which
    // likewise has no in-band shutdown path).
    client.join();
    Ok(())
}
