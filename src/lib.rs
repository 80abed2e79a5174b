//! # tcprelay - TCP Reverse Relay
//!
//! tcprelay lets origin servers behind NAT or firewalls publish a TCP service
//! on a publicly reachable address without accepting inbound connections
//! themselves. An origin dials the relay over one long-lived control
//! connection; the relay allocates a public port, accepts end-user clients
//! there, and multiplexes their byte streams over the control connection as
//! framed JSON messages.
//!
//! ## Architecture
//!
//! One origin maps to one control connection, one relay-side session, and one
//! public listener:
//!
//! ```text
//! clients ──► public listener ──► Session ◄══ control ══► RelayListener ──► origin
//!                                  (relay)                  (origin side)
//! ```
//!
//! Every independent socket gets its own task; each side funnels outbound
//! frames through one bounded queue per control connection, which is the only
//! writer to that socket. Failure isolation follows the same shape: a client
//! fault affects that client, a control fault that session, and nothing else.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `server` | Relay process: control listener, one session per origin |
//! | `session` | Relay-side multiplexer for one origin |
//! | `client` | Relay-side per-client socket state |
//! | `ports` | Public-port allocation and `--ports` parsing |
//! | `listener` | Origin-side adapter exposing `accept()` |
//! | `stream` | Origin-side virtual connection (`AsyncRead`/`AsyncWrite`) |
//! | `message` | Wire message type and its JSON shape |
//! | `codec` | Streaming frame reader/writer for control sockets |
//!
//! ## Origin Quick Start
//!
//! ```ignore
//! let (listener, public_addr) = RelayListener::dial("relay.example:8000").await?;
//! println!("serving on {public_addr}");
//! loop {
//!     let mut conn = listener.accept().await?;
//!     tokio::spawn(async move {
//!         // conn is AsyncRead + AsyncWrite
//!     });
//! }
//! ```

mod client;
mod codec;
mod listener;
mod message;
mod ports;
mod server;
mod session;
mod stream;

pub use codec::{FrameReader, write_frame};
pub use listener::RelayListener;
pub use message::{Message, MessageType};
pub use ports::PortRange;
pub use server::{RelayConfig, RelayServer};
pub use stream::RelayStream;
