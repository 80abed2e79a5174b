//! Relay-side state for one accepted client connection.
//!
//! Each client socket on a public listener gets a [`ClientHandle`] in the
//! session's client table plus one reader task. The reader turns socket reads
//! into `Data` frames on the session's outbound queue; the handle carries the
//! shared write half so the session's control reader can deliver origin bytes
//! without holding the table lock across I/O.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::message::Message;

/// Size of one read from a client socket; one read maps to one `Data` frame.
pub(crate) const READ_BUFFER: usize = 4096;

/// Per-session map from client-remote-address text to its handle.
///
/// Locked only across map operations, never across I/O.
pub(crate) type ClientTable = Arc<Mutex<HashMap<String, ClientHandle>>>;

#[derive(Clone)]
pub(crate) struct ClientHandle {
    remote_addr: String,
    local_addr: String,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    /// Set when the close came from the origin or session teardown; the
    /// reader then exits without emitting a `Close` of its own.
    origin_closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ClientHandle {
    /// Split an accepted socket into a handle plus the read half for the
    /// reader task. `session_cancel` is the owning session's token; the
    /// per-client child trips with it on teardown.
    pub(crate) fn split(
        socket: TcpStream,
        session_cancel: &CancellationToken,
    ) -> io::Result<(Self, OwnedReadHalf)> {
        let remote_addr = socket.peer_addr()?.to_string();
        let local_addr = socket.local_addr()?.to_string();
        let (read_half, write_half) = socket.into_split();
        let handle = ClientHandle {
            remote_addr,
            local_addr,
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            origin_closed: Arc::new(AtomicBool::new(false)),
            cancel: session_cancel.child_token(),
        };
        Ok((handle, read_half))
    }

    pub(crate) fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub(crate) fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Deliver origin bytes to the client socket.
    pub(crate) async fn write(&self, data: &[u8]) -> io::Result<()> {
        self.writer.lock().await.write_all(data).await
    }

    /// Close initiated by the origin or by session teardown: the reader wakes
    /// and exits without notifying the origin back.
    pub(crate) async fn close(&self) {
        self.origin_closed.store(true, Ordering::Release);
        self.cancel.cancel();
        if let Err(e) = self.writer.lock().await.shutdown().await {
            trace!(client = %self.remote_addr, error = %e, "client shutdown failed");
        }
    }
}

/// Reader task for one client socket.
///
/// Runs until the socket faults, the session's outbound queue closes, or the
/// handle is cancelled. A fault that was not origin-initiated emits exactly
/// one `Close` frame and removes the table entry.
pub(crate) async fn run_reader(
    mut socket: OwnedReadHalf,
    handle: ClientHandle,
    outbound: mpsc::Sender<Message>,
    clients: ClientTable,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let read = tokio::select! {
            _ = handle.cancel.cancelled() => return,
            read = socket.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                trace!(client = %handle.remote_addr, len = n, "client data");
                let msg = Message::data(&handle.remote_addr, &handle.local_addr, buf[..n].to_vec());
                if outbound.send(msg).await.is_err() {
                    // Session is shutting down.
                    return;
                }
            }
            Err(e) => {
                debug!(client = %handle.remote_addr, error = %e, "client read failed");
                break;
            }
        }
    }

    // Socket fault or end-of-stream: tell the origin, unless the origin
    // initiated this close itself.
    if !handle.origin_closed.load(Ordering::Acquire) {
        debug!(client = %handle.remote_addr, "client disconnected");
        let close = Message::close(&handle.remote_addr, &handle.local_addr);
        if outbound.send(close).await.is_err() {
            warn!(client = %handle.remote_addr, "session closed before client close was sent");
        }
    }
    clients
        .lock()
        .expect("client table poisoned")
        .remove(&handle.remote_addr);
}
