use anyhow::{Context, Result};
use clap::Parser;
use server::FrontDoor;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use wire::location::{NodeLocation, NodeLocator, StaticNodeLocator};

const DEFAULT_PORT: u16 = 9999;

/// Authoritative arena server front door.
#[derive(Debug, Parser)]
#[command(name = "arena-server", version)]
struct ServerArgs {
    /// Node identifier; also the DNS name resolved for this node's
    /// address when `--address` is not given.
    #[arg(long)]
    id: String,

    /// Literal IPv6 address or DNS name this node is reachable at.
    #[arg(long)]
    address: Option<String>,

    /// Single-line "x,y" position file (unused by the server itself,
    /// accepted for symmetry with client/gateway).
    #[arg(long)]
    position_file: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    level: Level,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

fn main() {
    let args = ServerArgs::parse();
    init_tracing(args.level);

    let location = match resolve_location(&args) {
        Ok(location) => location,
        Err(e) => {
            tracing::error!(id = %args.id, error = %e, "could not resolve node location");
            std::process::exit(1);
        }
    };

    info!(id = %args.id, address = %location.address, port = args.port, "starting arena server");

    if let Err(e) = run(&args, &location) {
        tracing::error!(error = %e, "arena server terminated with a fault");
        std::process::exit(2);
    }
}

fn init_tracing(level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level.to_string()))
        .init();
}

fn resolve_location(args: &ServerArgs) -> Result<NodeLocation> {
    let locator = StaticNodeLocator {
        position_file: args.position_file.clone(),
        address: args.address.clone().unwrap_or_else(|| args.id.clone()),
    };
    locator
        .locate()
        .with_context(|| format!("no address resolvable for node id {}", args.id))
}

fn run(args: &ServerArgs, location: &NodeLocation) -> Result<()> {
    let front_door = FrontDoor::bind(location.address, args.port)
        .with_context(|| format!("failed to bind front door on port {}", args.port))?;
    front_door.run();
}
