use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use pontium::{MemoryNetwork, NatStatus, Overlay, Relay};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum NatArg {
    Public,
    Private,
}

#[derive(Parser, Debug)]
#[command(name = "pontium")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the WebSocket control channel listens on.
    #[arg(short, long, default_value = "127.0.0.1:8888")]
    bind: SocketAddr,

    /// Reachability to report for the in-process overlay.
    #[arg(long, value_enum, default_value_t = NatArg::Public)]
    nat: NatArg,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let network = MemoryNetwork::new();
    let overlay = network.create_peer().map_err(|e| anyhow::anyhow!("{e}"))?;
    info!("relay peer id: {}", overlay.local_peer());

    let relay = Relay::spawn(overlay.clone());
    overlay.set_nat_status(match args.nat {
        NatArg::Public => NatStatus::Public,
        NatArg::Private => NatStatus::Private,
    });

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("could not bind {}", args.bind))?;
    info!(addr = %args.bind, "control channel listening");

    tokio::select! {
        result = pontium::ws::serve(listener, relay.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting gracefully");
            relay.quit().await;
        }
    }

    Ok(())
}
