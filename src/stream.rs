//! # Virtual Client Connections (origin side)
//!
//! A [`RelayStream`] presents one end-user client, reached through the relay,
//! as an ordinary byte stream: it implements [`AsyncRead`] and [`AsyncWrite`],
//! so origin code can treat it like a `TcpStream`.
//!
//! Reads drain an internal buffer that the listener adapter fills from
//! inbound `Data` frames; writes become outbound `Data` frames on the shared
//! channel to the relay. The buffer state lives behind a plain mutex with a
//! parked waker for reader wakeups; the lock is held only across buffer
//! operations, never across I/O or channel sends.
//!
//! ## Close discipline
//!
//! The stream is `Open` until either the application shuts it down or an
//! inbound `Close` frame arrives; both transitions are final. Whichever side
//! closes first queues exactly one outward `Close` frame, before readers are
//! woken with end-of-stream, so an observer of EOF can rely on the relay
//! having been notified. Writes after close fail with `BrokenPipe`.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use anyhow::Context as _;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::debug;

use crate::message::Message;

/// State shared between a [`RelayStream`] and the adapter that feeds it.
pub(crate) struct StreamShared {
    remote_addr: String,
    local_addr: String,
    state: Mutex<StreamState>,
    /// Set by whichever close path wins; guards the single outward `Close`.
    close_queued: AtomicBool,
    outbound: mpsc::Sender<Message>,
}

struct StreamState {
    buf: VecDeque<u8>,
    closed: bool,
    read_waker: Option<Waker>,
}

impl StreamShared {
    /// Append bytes received from the relay and wake a pending reader.
    pub(crate) fn push(&self, bytes: &[u8]) {
        let waker = {
            let mut state = self.state.lock().expect("stream state poisoned");
            if state.closed {
                debug!(remote = %self.remote_addr, "discarding data for closed stream");
                return;
            }
            state.buf.extend(bytes);
            state.read_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Close in response to an inbound `Close` frame.
    ///
    /// Queues the outward `Close` notification (unless the application closed
    /// first) before readers can observe end-of-stream.
    pub(crate) async fn close_remote(&self) {
        if !self.close_queued.swap(true, Ordering::AcqRel) {
            let close = Message::close(&self.remote_addr, &self.local_addr);
            let _ = self.outbound.send(close).await;
        }
        self.mark_closed();
    }

    fn mark_closed(&self) {
        let waker = {
            let mut state = self.state.lock().expect("stream state poisoned");
            state.closed = true;
            state.read_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().expect("stream state poisoned").closed
    }
}

/// One virtual client connection, handed out by
/// [`RelayListener::accept`](crate::listener::RelayListener::accept).
pub struct RelayStream {
    shared: Arc<StreamShared>,
    outbound: PollSender<Message>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl RelayStream {
    /// Build a stream for the address pair announced in a `Connect` frame.
    ///
    /// Returns the application-facing stream plus the shared state the
    /// adapter keeps for routing inbound frames.
    pub(crate) fn announced(
        remote_addr: &str,
        local_addr: &str,
        outbound: mpsc::Sender<Message>,
    ) -> anyhow::Result<(Self, Arc<StreamShared>)> {
        let remote: SocketAddr = remote_addr.parse().context("invalid remote address")?;
        let local: SocketAddr = local_addr.parse().context("invalid local address")?;
        let shared = Arc::new(StreamShared {
            remote_addr: remote_addr.to_string(),
            local_addr: local_addr.to_string(),
            state: Mutex::new(StreamState {
                buf: VecDeque::new(),
                closed: false,
                read_waker: None,
            }),
            close_queued: AtomicBool::new(false),
            outbound: outbound.clone(),
        });
        let stream = RelayStream {
            shared: shared.clone(),
            outbound: PollSender::new(outbound),
            local_addr: local,
            remote_addr: remote,
        };
        Ok((stream, shared))
    }

    /// The public listener address the client connected to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The client's address as seen by the relay.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// I/O deadlines are not supported; use `tokio::time::timeout` around
    /// individual operations instead.
    pub fn set_read_deadline(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "deadlines are not supported on relayed streams",
        ))
    }

    /// I/O deadlines are not supported; use `tokio::time::timeout` around
    /// individual operations instead.
    pub fn set_write_deadline(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "deadlines are not supported on relayed streams",
        ))
    }
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.shared.state.lock().expect("stream state poisoned");
        if !state.buf.is_empty() {
            let n = buf.remaining().min(state.buf.len());
            let (front, back) = state.buf.as_slices();
            if n <= front.len() {
                buf.put_slice(&front[..n]);
            } else {
                buf.put_slice(front);
                buf.put_slice(&back[..n - front.len()]);
            }
            state.buf.drain(..n);
            return Poll::Ready(Ok(()));
        }
        if state.closed {
            // End-of-stream: leave `buf` empty.
            return Poll::Ready(Ok(()));
        }
        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.shared.is_closed() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream is closed",
            )));
        }
        match this.outbound.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "relay connection is closed",
            ))),
            Poll::Ready(Ok(())) => {
                let msg = Message::data(
                    &this.shared.remote_addr,
                    &this.shared.local_addr,
                    buf.to_vec(),
                );
                if this.outbound.send_item(msg).is_err() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "relay connection is closed",
                    )));
                }
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shared.close_queued.load(Ordering::Acquire) {
            this.shared.mark_closed();
            return Poll::Ready(Ok(()));
        }
        match this.outbound.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => {
                // Adapter is gone; there is no one left to notify.
                this.shared.mark_closed();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(())) => {
                if this.shared.close_queued.swap(true, Ordering::AcqRel) {
                    // Lost the race to an inbound close; release the slot.
                    this.outbound.abort_send();
                } else {
                    let close = Message::close(
                        &this.shared.remote_addr,
                        &this.shared.local_addr,
                    );
                    let _ = this.outbound.send_item(close);
                }
                this.shared.mark_closed();
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream")
            .field("local", &self.local_addr)
            .field("remote", &self.remote_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn stream_pair() -> (RelayStream, Arc<StreamShared>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        let (stream, shared) =
            RelayStream::announced("10.0.0.1:5000", "10.0.0.2:8001", tx).unwrap();
        (stream, shared, rx)
    }

    #[test]
    fn rejects_unparseable_addresses() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(RelayStream::announced("not-an-addr", "10.0.0.2:8001", tx).is_err());
    }

    #[tokio::test]
    async fn read_drains_pushed_bytes_in_order() {
        let (mut stream, shared, _rx) = stream_pair();
        shared.push(b"hel");
        shared.push(b"lo");

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"he");
        let mut rest = [0u8; 3];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"llo");
    }

    #[tokio::test]
    async fn read_blocks_until_push() {
        let (mut stream, shared, _rx) = stream_pair();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            let n = stream.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });
        tokio::task::yield_now().await;
        shared.push(b"ping");
        assert_eq!(reader.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn buffered_bytes_still_readable_after_close() {
        let (mut stream, shared, _rx) = stream_pair();
        shared.push(b"tail");
        shared.close_remote().await;

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_wakes_blocked_reader_with_eof() {
        let (mut stream, shared, _rx) = stream_pair();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            stream.read(&mut buf).await.unwrap()
        });
        tokio::task::yield_now().await;
        shared.close_remote().await;
        assert_eq!(reader.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn write_emits_one_data_frame() {
        let (mut stream, _shared, mut rx) = stream_pair();
        let n = stream.write(b"payload").await.unwrap();
        assert_eq!(n, 7);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.kind, MessageType::Data);
        assert_eq!(msg.remote_addr, "10.0.0.1:5000");
        assert_eq!(msg.local_addr, "10.0.0.2:8001");
        assert_eq!(msg.data, b"payload");
    }

    #[tokio::test]
    async fn shutdown_queues_exactly_one_close() {
        let (mut stream, _shared, mut rx) = stream_pair();
        stream.shutdown().await.unwrap();
        stream.shutdown().await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.kind, MessageType::Close);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn write_after_close_is_an_error() {
        let (mut stream, _shared, _rx) = stream_pair();
        stream.shutdown().await.unwrap();
        let err = stream.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn remote_close_suppresses_local_close_frame() {
        let (mut stream, shared, mut rx) = stream_pair();
        shared.close_remote().await;
        stream.shutdown().await.unwrap();

        // Only the close_remote notification is on the wire.
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.kind, MessageType::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn deadlines_are_unsupported() {
        let (stream, _shared, _rx) = stream_pair();
        assert_eq!(
            stream.set_read_deadline().unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
        assert_eq!(
            stream.set_write_deadline().unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
    }
}
