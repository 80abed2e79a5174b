use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use tcprelay::{PortRange, RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "tcprelay")]
#[command(author, version, about = "Relays TCP traffic between clients and origin servers")]
struct Args {
    /// The addr:port upon which origin servers communicate with this relay.
    #[arg(long, default_value = ":8000")]
    addr: String,

    /// The addr and port range (inclusive) wherein origins are assigned
    /// public relay ports.
    #[arg(long, default_value = ":8001-9000")]
    ports: PortRange,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let server = RelayServer::bind(RelayConfig {
        addr: args.addr,
        ports: args.ports,
    })
    .await?;
    let shutdown = server.shutdown_token();

    let mut relay = tokio::spawn(server.run());

    // Graceful shutdown on Ctrl+C
    tokio::select! {
        result = &mut relay => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting gracefully");
            shutdown.cancel();
            relay.await??;
        }
    }

    Ok(())
}
