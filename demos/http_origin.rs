//! Example origin that answers HTTP requests through a relay.
//!
//! Reads one request head per connection and replies with a fixed page; just
//! enough HTTP to point a browser at the advertised address.

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use tcprelay::RelayListener;

#[derive(Parser, Debug)]
#[command(name = "http-origin")]
#[command(about = "A toy HTTP server published through a tcprelay")]
struct Args {
    /// The addr:port of the relay server.
    #[arg(long, default_value = "localhost:8000")]
    relay: String,
}

const BODY: &str = "<html><body><h1>Hello from behind the relay!</h1></body></html>\n";

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
    info!(public = %public_addr, "serving http");

    loop {
        let mut conn = listener.accept().await?;
        tokio::spawn(async move {
            // Consume the request head; the response is the same regardless.
            let mut head = Vec::new();
            let mut buf = [0u8; 4096];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match conn.read(&mut buf).await {
                    Ok(0) => return,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                    Err(e) => {
                        warn!(client = %conn.remote_addr(), error = %e, "read failed");
                        return;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                BODY.len(),
                BODY,
            );
            if let Err(e) = conn.write_all(response.as_bytes()).await {
                warn!(client = %conn.remote_addr(), error = %e, "write failed");
                return;
            }
            let _ = conn.shutdown().await;
        });
    }
}
