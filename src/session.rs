//! # Per-Origin Sessions (relay side)
//!
//! One session runs for each connected origin. It owns the control socket,
//! the public listener on the allocated port, and the client table, and it
//! moves bytes both ways:
//!
//! ```text
//!               ┌──────────── Session ────────────┐
//! clients ──►  acceptor ──► outbound queue ──► control writer ──► origin
//! clients ◄──  client table ◄── control reader ◄─────────────────  origin
//! ```
//!
//! Three concurrent activities cooperate over a bounded outbound queue and a
//! cancellation token: the **control reader** (runs in the session task,
//! dispatches origin frames), the **control writer** (serializes queued
//! frames), and the **client acceptor** (accepts public connections and
//! spawns one reader per client). Client readers block on the queue when it
//! is full, which pushes TCP backpressure onto the clients themselves.
//!
//! Teardown is idempotent and ordered: cancel, close the listener, close all
//! clients, let the queue drain, join every task, release the port last.

use std::sync::{Arc, Mutex};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{self, ClientHandle, ClientTable};
use crate::codec::{FrameReader, write_frame};
use crate::message::{Message, MessageType};
use crate::ports::PortAllocator;

/// Capacity of the outbound queue between client readers and the control
/// writer.
const OUTBOUND_QUEUE: usize = 256;

/// Serve one origin until it stops, faults, or the relay shuts down.
///
/// Allocates a public port, advertises it, then multiplexes client traffic
/// over the control socket. The port is guaranteed released, and all spawned
/// tasks joined, before this returns.
pub(crate) async fn run(
    control: TcpStream,
    allocator: Arc<PortAllocator>,
    shutdown: CancellationToken,
) {
    let origin = match control.peer_addr() {
        Ok(addr) => addr.to_string(),
        Err(e) => {
            warn!(error = %e, "origin address unavailable");
            return;
        }
    };

    let Some(port) = allocator.allocate() else {
        // Dropping the control socket is the only signal we can give.
        warn!(origin = %origin, "no public port available, refusing origin");
        return;
    };

    let public_bind = allocator.range().bind_addr(port);
    let listener = match TcpListener::bind(&public_bind).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(origin = %origin, addr = %public_bind, error = %e, "public listener bind failed");
            allocator.release(port);
            return;
        }
    };

    let public_addr = allocator.range().advertised_addr(port);
    let (read_half, mut write_half) = control.into_split();

    // The advertisement must be the first frame on the wire, ahead of
    // anything the acceptor could enqueue.
    if let Err(e) = write_frame(&mut write_half, &Message::relay(&public_addr)).await {
        warn!(origin = %origin, error = %e, "advertising public address failed");
        allocator.release(port);
        return;
    }
    info!(origin = %origin, public = %public_addr, "session started");

    let cancel = shutdown.child_token();
    let clients: ClientTable = Arc::new(Mutex::new(Default::default()));
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

    let writer = tokio::spawn(control_writer(write_half, outbound_rx, cancel.clone()));
    let acceptor = tokio::spawn(accept_clients(
        listener,
        outbound_tx.clone(),
        clients.clone(),
        cancel.clone(),
    ));

    control_reader(read_half, &clients, &origin, cancel.clone()).await;

    // Teardown. Cancelling wakes the acceptor (which drops the listener) and
    // every client reader; dropping our sender lets the writer drain out.
    cancel.cancel();
    let drained: Vec<ClientHandle> = {
        let mut table = clients.lock().expect("client table poisoned");
        table.drain().map(|(_, handle)| handle).collect()
    };
    for handle in drained {
        handle.close().await;
    }
    drop(outbound_tx);
    if let Err(e) = acceptor.await {
        warn!(origin = %origin, error = %e, "acceptor task failed");
    }
    if let Err(e) = writer.await {
        warn!(origin = %origin, error = %e, "writer task failed");
    }
    allocator.release(port);
    info!(origin = %origin, public = %public_addr, "session ended");
}

/// Decode and dispatch frames from the origin until it stops, faults, or the
/// session is cancelled.
async fn control_reader(
    read_half: OwnedReadHalf,
    clients: &ClientTable,
    origin: &str,
    cancel: CancellationToken,
) {
    let mut frames = FrameReader::new(read_half);
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = frames.read_frame() => match frame {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!(origin = %origin, "origin closed the control connection");
                    return;
                }
                Err(e) => {
                    warn!(origin = %origin, error = %e, "control decode failed");
                    return;
                }
            },
        };
        match msg.kind {
            MessageType::Stop => {
                info!(origin = %origin, "origin requested stop");
                return;
            }
            MessageType::Data => {
                let handle = clients
                    .lock()
                    .expect("client table poisoned")
                    .get(&msg.remote_addr)
                    .cloned();
                match handle {
                    Some(handle) => {
                        if let Err(e) = handle.write(&msg.data).await {
                            // The client reader will observe the fault and
                            // emit the close.
                            debug!(client = %msg.remote_addr, error = %e, "client write failed");
                        }
                    }
                    None => warn!(client = %msg.remote_addr, "data for unknown client, dropped"),
                }
            }
            MessageType::Close => {
                // Remove before closing so no concurrent dispatch can find a
                // half-closed client.
                let handle = clients
                    .lock()
                    .expect("client table poisoned")
                    .remove(&msg.remote_addr);
                match handle {
                    Some(handle) => {
                        debug!(client = %msg.remote_addr, "origin closed client");
                        handle.close().await;
                    }
                    None => warn!(client = %msg.remote_addr, "close for unknown client, dropped"),
                }
            }
            MessageType::Relay | MessageType::Connect => {
                warn!(origin = %origin, msg = %msg, "unexpected frame from origin, dropped");
            }
        }
    }
}

/// Serialize queued frames onto the control socket.
///
/// Exits when the queue closes (teardown) or a write fails; a write failure
/// cancels the session, since nothing can reach the origin anymore.
async fn control_writer(
    mut control: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    while let Some(msg) = outbound_rx.recv().await {
        if let Err(e) = write_frame(&mut control, &msg).await {
            warn!(error = %e, msg = %msg, "control write failed");
            cancel.cancel();
            break;
        }
    }
}

/// Accept clients on the public listener until cancelled or the listener
/// faults. The listener itself is dropped (closing the public port) on exit.
async fn accept_clients(
    listener: TcpListener,
    outbound: mpsc::Sender<Message>,
    clients: ClientTable,
    cancel: CancellationToken,
) {
    let mut readers = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (socket, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "public accept failed");
                break;
            }
        };
        let (handle, read_half) = match ClientHandle::split(socket, &cancel) {
            Ok(split) => split,
            Err(e) => {
                warn!(client = %peer, error = %e, "client setup failed");
                continue;
            }
        };
        debug!(client = %handle.remote_addr(), "client accepted");

        // Table insert precedes the connect announcement, so any origin frame
        // that races the announcement still finds the client; the reader is
        // spawned after it, so per-client frames always trail the connect.
        let connect = Message::connect(handle.remote_addr(), handle.local_addr());
        clients
            .lock()
            .expect("client table poisoned")
            .insert(handle.remote_addr().to_string(), handle.clone());
        if outbound.send(connect).await.is_err() {
            clients
                .lock()
                .expect("client table poisoned")
                .remove(handle.remote_addr());
            break;
        }
        readers.spawn(client::run_reader(
            read_half,
            handle,
            outbound.clone(),
            clients.clone(),
        ));
    }

    // The listener must not outlive the session: drop it before waiting on
    // the readers so the public port closes promptly.
    drop(listener);
    while readers.join_next().await.is_some() {}
}
