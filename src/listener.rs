//! # Listener Adapter (origin side)
//!
//! [`RelayListener`] is what an origin links against instead of binding a TCP
//! listener of its own. [`RelayListener::dial`] opens the control connection
//! to the relay, consumes the advertisement frame, and returns a handle whose
//! [`accept`](RelayListener::accept) yields one [`RelayStream`] per end-user
//! client, in the order the relay announced them.
//!
//! Two pump tasks run for the adapter's lifetime:
//!
//! - the **outbound pump** drains the channel shared by all streams and
//!   serializes frames onto the control socket; it also retires a stream's
//!   table entry when its `Close` goes out
//! - the **inbound pump** decodes relay frames and routes them: `Connect`
//!   creates a stream, `Data` feeds one, `Close` closes one
//!
//! A decode failure or control-socket fault cancels the adapter; individual
//! unknown-address frames are logged and dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail, ensure};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{FrameReader, write_frame};
use crate::message::{Message, MessageType};
use crate::stream::{RelayStream, StreamShared};

/// Capacity of the outbound channel shared by all virtual streams.
const OUTBOUND_QUEUE: usize = 256;

/// Capacity of the queue between the inbound pump and `accept`.
const ACCEPT_QUEUE: usize = 16;

type StreamTable = Arc<Mutex<HashMap<String, Arc<StreamShared>>>>;

/// Origin-side handle to a relay session.
#[derive(Debug)]
pub struct RelayListener {
    /// Taken under a lock so `accept` works on `&self` and `close` stays
    /// callable while an accept is parked.
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<RelayStream>>,
    cancel: CancellationToken,
    relay_addr: SocketAddr,
}

impl RelayListener {
    /// Connect to a relay and wait for its advertisement.
    ///
    /// Returns the listener plus the advertised public `host:port` text that
    /// end-user clients should connect to. Fails if the relay's first frame
    /// is anything other than an advertisement.
    pub async fn dial(relay_addr: &str) -> anyhow::Result<(Self, String)> {
        let control = TcpStream::connect(relay_addr)
            .await
            .with_context(|| format!("connecting to relay at {relay_addr}"))?;
        let peer = control.peer_addr().context("reading relay address")?;
        let (read_half, write_half) = control.into_split();

        let mut frames = FrameReader::new(read_half);
        let first = frames
            .read_frame()
            .await
            .context("reading relay advertisement")?
            .context("relay closed the connection before advertising an address")?;
        ensure!(
            first.kind == MessageType::Relay,
            "expected an advertisement as the first frame, got {}",
            first.kind
        );
        let advertised =
            String::from_utf8(first.data).context("advertised address is not valid UTF-8")?;
        info!(relay = %peer, public = %advertised, "connected to relay");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);
        let cancel = CancellationToken::new();
        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(outbound_pump(
            write_half,
            outbound_rx,
            streams.clone(),
            cancel.clone(),
        ));
        tokio::spawn(inbound_pump(
            frames,
            outbound_tx,
            accept_tx,
            streams,
            cancel.clone(),
        ));

        let listener = RelayListener {
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            cancel,
            relay_addr: peer,
        };
        Ok((listener, advertised))
    }

    /// Wait for the next client connection announced by the relay.
    ///
    /// Fails once the adapter has been closed, either explicitly via
    /// [`close`](Self::close) or because the control connection died.
    pub async fn accept(&self) -> anyhow::Result<RelayStream> {
        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => bail!("listener is closed"),
            stream = accept_rx.recv() => {
                stream.ok_or_else(|| anyhow::anyhow!("listener is closed"))
            }
        }
    }

    /// Shut the adapter down: unblocks `accept` and stops both pumps, which
    /// drop their halves of the control socket.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Address of the relay's control endpoint.
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }
}

impl Drop for RelayListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn outbound_pump(
    mut control: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Message>,
    streams: StreamTable,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = outbound_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if msg.kind == MessageType::Close {
            // Retire the table entry before the notification hits the wire so
            // no later inbound frame can resolve to the dead stream.
            let removed = streams
                .lock()
                .expect("stream table poisoned")
                .remove(&msg.remote_addr);
            if removed.is_none() {
                debug!(remote = %msg.remote_addr, "close for untracked stream");
            }
        }
        if let Err(e) = write_frame(&mut control, &msg).await {
            warn!(error = %e, msg = %msg, "control write failed");
            cancel.cancel();
            break;
        }
    }
}

async fn inbound_pump(
    mut frames: FrameReader<OwnedReadHalf>,
    outbound_tx: mpsc::Sender<Message>,
    accept_tx: mpsc::Sender<RelayStream>,
    streams: StreamTable,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.read_frame() => match frame {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!("relay closed the control connection");
                    cancel.cancel();
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "control decode failed");
                    cancel.cancel();
                    break;
                }
            },
        };
        match msg.kind {
            MessageType::Connect => {
                let built =
                    RelayStream::announced(&msg.remote_addr, &msg.local_addr, outbound_tx.clone());
                let (stream, shared) = match built {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, msg = %msg, "dropping connect with bad addresses");
                        continue;
                    }
                };
                debug!(remote = %msg.remote_addr, "client connected");
                streams
                    .lock()
                    .expect("stream table poisoned")
                    .insert(msg.remote_addr.clone(), shared);
                if accept_tx.send(stream).await.is_err() {
                    // Nobody is accepting anymore.
                    cancel.cancel();
                    break;
                }
            }
            MessageType::Data => {
                let shared = lookup(&streams, &msg.remote_addr);
                match shared {
                    Some(shared) => shared.push(&msg.data),
                    None => warn!(remote = %msg.remote_addr, "data for unknown client, dropped"),
                }
            }
            MessageType::Close => {
                let shared = lookup(&streams, &msg.remote_addr);
                match shared {
                    Some(shared) => {
                        debug!(remote = %msg.remote_addr, "client closed by relay");
                        shared.close_remote().await;
                    }
                    None => warn!(remote = %msg.remote_addr, "close for unknown client, dropped"),
                }
            }
            MessageType::Relay | MessageType::Stop => {
                warn!(msg = %msg, "unexpected frame from relay, dropped");
            }
        }
    }
}

fn lookup(streams: &StreamTable, remote_addr: &str) -> Option<Arc<StreamShared>> {
    streams
        .lock()
        .expect("stream table poisoned")
        .get(remote_addr)
        .cloned()
}
