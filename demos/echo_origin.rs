//! Example origin that publishes an echo service through a relay.
//!
//! With `--reverse`, payloads are sent back rune-reversed instead.

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use tcprelay::RelayListener;

#[derive(Parser, Debug)]
#[command(name = "echo-origin")]
#[command(about = "An echo server published through a tcprelay")]
struct Args {
    /// The addr:port of the relay server.
    #[arg(long, default_value = "localhost:8000")]
    relay: String,

    /// Send each payload back in reverse.
    #[arg(long)]
    reverse: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let (listener, public_addr) = RelayListener::dial(&args.relay).await?;
    info!(public = %public_addr, "serving echo");

    loop {
        let mut conn = listener.accept().await?;
        let reverse = args.reverse;
        tokio::spawn(async move {
            info!(client = %conn.remote_addr(), "client connected");
            let mut buf = [0u8; 4096];
            loop {
                let n = match conn.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!(client = %conn.remote_addr(), error = %e, "read failed");
                        break;
                    }
                };
                let reply = if reverse {
                    reverse_runes(&buf[..n])
                } else {
                    buf[..n].to_vec()
                };
                if let Err(e) = conn.write_all(&reply).await {
                    warn!(client = %conn.remote_addr(), error = %e, "write failed");
                    break;
                }
            }
            info!(client = %conn.remote_addr(), "client gone");
        });
    }
}

/// Reverse the payload rune-wise, so multi-byte characters survive.
fn reverse_runes(data: &[u8]) -> Vec<u8> {
    String::from_utf8_lossy(data).chars().rev().collect::<String>().into_bytes()
}
