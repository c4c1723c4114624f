use anyhow::{Context, Result};
use clap::Parser;
use gateway::{Gateway, GatewayConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use wire::location::{NodeLocation, NodeLocator, StaticNodeLocator};

const DEFAULT_FRONT_DOOR_PORT: u16 = 9999;

/// Bridges mobile clients on the DTN multicast overlay to the
/// authoritative server over a direct link.
#[derive(Debug, Parser)]
#[command(name = "arena-gateway", version)]
struct GatewayArgs {
    /// Node identifier; also the DNS name resolved for this node's own
    /// address when `--address` is not given.
    #[arg(long)]
    id: String,

    /// Literal IPv6 address or DNS name this node is reachable at.
    #[arg(long)]
    address: Option<String>,

    /// Literal IPv6 address or DNS name of the server's front door.
    #[arg(long)]
    front_door: String,

    #[arg(long, default_value_t = DEFAULT_FRONT_DOOR_PORT)]
    port: u16,

    /// Single-line "x,y" position file, used for the gateway's own
    /// preferred-hop distance calculation.
    #[arg(long)]
    position_file: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    level: Level,
}

fn main() {
    let args = GatewayArgs::parse();
    init_tracing(args.level);

    let location = match resolve_location(&args) {
        Ok(location) => location,
        Err(e) => {
            tracing::error!(id = %args.id, error = %e, "could not resolve node location");
            std::process::exit(1);
        }
    };
    let front_door = match resolve_front_door(&args) {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(front_door = %args.front_door, error = %e, "could not resolve front door address");
            std::process::exit(1);
        }
    };

    info!(
        id = %args.id,
        address = %location.address,
        %front_door,
        "starting arena gateway",
    );

    if let Err(e) = run(&args, &location, front_door) {
        tracing::error!(error = %e, "arena gateway terminated with a fault");
        std::process::exit(2);
    }
}

fn init_tracing(level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level.to_string()))
        .init();
}

fn resolve_location(args: &GatewayArgs) -> Result<NodeLocation> {
    let locator = StaticNodeLocator {
        position_file: args.position_file.clone(),
        address: args.address.clone().unwrap_or_else(|| args.id.clone()),
    };
    locator
        .locate()
        .with_context(|| format!("no address resolvable for node id {}", args.id))
}

fn resolve_front_door(args: &GatewayArgs) -> Result<SocketAddr> {
    let locator = StaticNodeLocator {
        position_file: None,
        address: args.front_door.clone(),
    };
    let location = locator
        .locate()
        .with_context(|| format!("no address resolvable for front door {}", args.front_door))?;
    Ok(SocketAddr::new(IpAddr::V6(location.address), args.port))
}

fn run(args: &GatewayArgs, location: &NodeLocation, front_door: SocketAddr) -> Result<()> {
    let config = GatewayConfig {
        node_id: args.id.clone(),
        local_address: location.address,
        front_door,
    };

    let gateway = Gateway::bind(config, location.position).context("failed to bind gateway sockets")?;
    gateway.run();

    // Blocks for the process lifetime, matching the client and server
    // binaries: no in-band shutdown path, external signal only.
    gateway.join();
    Ok(())
}
