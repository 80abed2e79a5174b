//! # Relay Process
//!
//! [`RelayServer`] binds the origin-facing control listener and runs one
//! [`session`](crate::session) per connected origin. Sessions are fully
//! isolated from each other: they share only the process-wide
//! [`PortAllocator`] and the shutdown token, so one origin's failure never
//! disturbs another's clients.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ports::{PortAllocator, PortRange};
use crate::session;

/// Relay configuration, normally taken from the command line.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address for the origin-facing control listener. An empty host
    /// (`:8000`) means all interfaces.
    pub addr: String,
    /// Bind address and inclusive range for public client-facing listeners.
    pub ports: PortRange,
}

/// The relay: accepts origin control connections and multiplexes their
/// clients.
pub struct RelayServer {
    listener: TcpListener,
    allocator: Arc<PortAllocator>,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Bind the control listener. Configuration problems (unbindable
    /// address) are fatal here, before any origin is accepted.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let control_addr = normalize_bind_addr(&config.addr);
        let listener = TcpListener::bind(&control_addr)
            .await
            .with_context(|| format!("binding control listener on {control_addr}"))?;
        info!(
            addr = %control_addr,
            ports = %config.ports,
            "relay listening for origins"
        );
        Ok(RelayServer {
            listener,
            allocator: Arc::new(PortAllocator::new(config.ports)),
            shutdown: CancellationToken::new(),
        })
    }

    /// The control listener's actual address (useful when bound to port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the accept loop and tears down every live session
    /// when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept origins until shut down. Each origin gets its own session task;
    /// accept errors are logged and do not stop the relay.
    pub async fn run(self) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((control, origin)) => {
                    info!(origin = %origin, "origin connected");
                    tokio::spawn(session::run(
                        control,
                        self.allocator.clone(),
                        self.shutdown.child_token(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                }
            }
        }
        info!("relay shutting down");
        Ok(())
    }
}

/// Expand the Go-style empty-host form (`:8000`) into something
/// `TcpListener::bind` accepts.
fn normalize_bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_host_expands() {
        assert_eq!(normalize_bind_addr(":8000"), "0.0.0.0:8000");
        assert_eq!(normalize_bind_addr("127.0.0.1:8000"), "127.0.0.1:8000");
    }
}
