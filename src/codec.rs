//! # Control-Connection Framing
//!
//! Frames on the control connection are JSON objects written back-to-back
//! with no length prefix or delimiter. [`FrameReader`] is the streaming
//! decoder side: it buffers socket reads and peels off one complete JSON
//! object at a time, tolerating whitespace between objects. [`write_frame`]
//! is the encoder side.
//!
//! Error contract: a malformed frame is fatal to the connection and surfaces
//! as [`std::io::ErrorKind::InvalidData`]; bytes left over mid-frame at EOF
//! surface as [`std::io::ErrorKind::UnexpectedEof`]; a clean EOF between
//! frames decodes as `Ok(None)`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Message;

/// Size of one socket read while filling the decode buffer.
const READ_CHUNK: usize = 4096;

/// Streaming decoder for control-connection frames.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            buf: Vec::new(),
        }
    }

    /// Decode the next frame, reading more bytes as needed.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream (no partial frame
    /// buffered, ignoring trailing whitespace).
    pub async fn read_frame(&mut self) -> io::Result<Option<Message>> {
        loop {
            // Try to peel one complete JSON object off the front of the buffer.
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<Message>();
            match stream.next() {
                Some(Ok(msg)) => {
                    let consumed = stream.byte_offset();
                    self.buf.drain(..consumed);
                    return Ok(Some(msg));
                }
                Some(Err(e)) if e.is_eof() => {
                    // Incomplete object; fall through and read more.
                }
                Some(Err(e)) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
                None => {
                    // Buffer is empty or whitespace only.
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return if self.buf.iter().all(u8::is_ascii_whitespace) {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    ))
                };
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Consume the reader, returning the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Encode one frame and write it to the control connection.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> io::Result<()> {
    let encoded =
        serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&encoded).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    async fn collect(input: &[u8]) -> io::Result<Vec<Message>> {
        let mut reader = FrameReader::new(input);
        let mut out = Vec::new();
        while let Some(msg) = reader.read_frame().await? {
            out.push(msg);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn back_to_back_frames() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Message::connect("c:1", "l:2")).await.unwrap();
        write_frame(&mut wire, &Message::data("c:1", "l:2", b"abc".to_vec()))
            .await
            .unwrap();
        write_frame(&mut wire, &Message::close("c:1", "l:2")).await.unwrap();

        let msgs = collect(&wire).await.unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].kind, MessageType::Connect);
        assert_eq!(msgs[1].kind, MessageType::Data);
        assert_eq!(msgs[1].data, b"abc");
        assert_eq!(msgs[2].kind, MessageType::Close);
    }

    #[tokio::test]
    async fn whitespace_between_frames() {
        let wire = format!(
            "{} \n\t {}",
            serde_json::to_string(&Message::stop()).unwrap(),
            serde_json::to_string(&Message::close("c:1", "l:2")).unwrap(),
        );
        let msgs = collect(wire.as_bytes()).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].kind, MessageType::Stop);
        assert_eq!(msgs[1].kind, MessageType::Close);
    }

    #[tokio::test]
    async fn frame_split_across_reads() {
        // `read` on `&[u8]` consumes the whole slice at once, so drive the
        // reader through a pair of chained half-slices instead.
        let mut wire = Vec::new();
        write_frame(&mut wire, &Message::data("c:1", "l:2", vec![7u8; 600]))
            .await
            .unwrap();
        let mid = wire.len() / 2;
        let (a, b) = wire.split_at(mid);
        let chained = tokio::io::AsyncReadExt::chain(a, b);

        let mut reader = FrameReader::new(chained);
        let msg = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(msg.kind, MessageType::Data);
        assert_eq!(msg.data, vec![7u8; 600]);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_is_invalid_data() {
        let err = collect(b"not json at all").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn partial_frame_at_eof() {
        let wire = serde_json::to_string(&Message::stop()).unwrap();
        let truncated = &wire.as_bytes()[..wire.len() - 2];
        let err = collect(truncated).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn clean_eof() {
        assert!(collect(b"").await.unwrap().is_empty());
        assert!(collect(b"  \n ").await.unwrap().is_empty());
    }
}
