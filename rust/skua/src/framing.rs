//! Frame reader and writer plumbing.
//!
//! The reader owns the socket's read half and parses one frame at a time
//! under the connection's read deadline. Writers are short-lived handles
//! that buffer a single frame and hand it to the connection's writer task,
//! suspending the caller until the socket write outcome is known — that
//! handoff is the only synchronous suspension point handlers see.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use skua_wire::{Cmd, Frame, FrameFlags, HEADER_LEN, decode_header, patch_payload_len, put_header};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};

use crate::errors::{FrameError, WriteError};
use crate::stream::{Stream, StreamTable};

/// Runtime-adjustable read deadline in seconds, shared between the reader
/// task and [`ReaderConfig`] handles. Zero disables the deadline.
#[derive(Debug, Clone)]
pub(crate) struct ReadTimeout(Arc<AtomicU64>);

impl ReadTimeout {
    pub(crate) fn new(secs: u64) -> Self {
        Self(Arc::new(AtomicU64::new(secs)))
    }

    fn get(&self) -> Option<Duration> {
        match self.0.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::Relaxed);
    }
}

/// Handle for adjusting a connection's reader at runtime.
///
/// Obtained via [`ServeConn::reader`](crate::ServeConn::reader).
pub struct ReaderConfig {
    timeout: ReadTimeout,
}

impl ReaderConfig {
    pub(crate) fn new(timeout: ReadTimeout) -> Self {
        Self { timeout }
    }

    /// Change the per-frame read deadline. Zero disables it. Takes effect
    /// from the next frame.
    pub fn set_read_timeout(&self, secs: u64) {
        self.timeout.set(secs);
    }
}

/// Parses frames off a byte stream, one at a time.
pub(crate) struct FrameReader<R> {
    io: R,
    timeout: ReadTimeout,
    max_frame_size: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(io: R, timeout: ReadTimeout, max_frame_size: u32) -> Self {
        Self {
            io,
            timeout,
            max_frame_size,
        }
    }

    /// Parse one frame and bind it to its stream. The deadline covers the
    /// whole frame and resets on every successful read.
    pub(crate) async fn read_frame(
        &mut self,
        streams: &StreamTable,
    ) -> Result<(Frame, Arc<Stream>), FrameError> {
        match self.timeout.get() {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.read_frame_inner(streams)).await {
                    Ok(res) => res,
                    Err(_) => Err(FrameError::Timeout),
                }
            }
            None => self.read_frame_inner(streams).await,
        }
    }

    async fn read_frame_inner(
        &mut self,
        streams: &StreamTable,
    ) -> Result<(Frame, Arc<Stream>), FrameError> {
        let mut raw = [0u8; HEADER_LEN];
        self.io.read_exact(&mut raw).await?;
        let header = decode_header(&raw);

        if header.request_id == 0 {
            return Err(FrameError::InvalidPacket);
        }
        if header.payload_len > self.max_frame_size {
            return Err(FrameError::InvalidPacket);
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        self.io.read_exact(&mut payload).await?;

        let stream = streams.bind_in_frame(header.request_id, header.flags)?;
        Ok((
            Frame {
                request_id: header.request_id,
                cmd: header.cmd,
                flags: header.flags,
                payload: payload.into(),
            },
            stream,
        ))
    }
}

/// One frame handed to the writer task, with a channel for the outcome.
pub(crate) struct WriteFrameRequest {
    pub(crate) request_id: u64,
    pub(crate) flags: FrameFlags,
    /// Full encoded frame, header included.
    pub(crate) buf: Bytes,
    pub(crate) done: oneshot::Sender<Result<(), WriteError>>,
}

/// Buffers one outbound frame and submits it to the connection's writer
/// task, which is the single serializer of socket writes.
///
/// Obtain via [`ServeConn::writer`](crate::ServeConn::writer). A handle may
/// be reused for subsequent frames once `end_write` returns.
pub struct FrameWriter {
    tx: mpsc::Sender<WriteFrameRequest>,
    request_id: u64,
    flags: FrameFlags,
    buf: BytesMut,
}

impl FrameWriter {
    pub(crate) fn new(tx: mpsc::Sender<WriteFrameRequest>) -> Self {
        Self {
            tx,
            request_id: 0,
            flags: FrameFlags::empty(),
            buf: BytesMut::new(),
        }
    }

    /// Begin a new frame, discarding any unfinished one.
    pub fn start_write(&mut self, request_id: u64, cmd: Cmd, flags: FrameFlags) {
        self.request_id = request_id;
        self.flags = flags;
        self.buf.clear();
        put_header(&mut self.buf, 0, request_id, cmd, flags);
    }

    /// Append payload bytes. The slice is copied; the caller may reuse it.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Submit the frame to the writer loop and wait for the outcome: the
    /// socket write result, or a stream-level rejection.
    ///
    /// # Panics
    ///
    /// Panics if called without a preceding [`start_write`](Self::start_write).
    pub async fn end_write(&mut self) -> Result<(), WriteError> {
        assert!(
            self.buf.len() >= HEADER_LEN,
            "end_write called before start_write"
        );
        let payload_len = (self.buf.len() - HEADER_LEN) as u32;
        patch_payload_len(&mut self.buf, payload_len);

        let (done, outcome) = oneshot::channel();
        let request = WriteFrameRequest {
            request_id: self.request_id,
            flags: self.flags,
            buf: self.buf.split().freeze(),
            done,
        };
        self.tx
            .send(request)
            .await
            .map_err(|_| WriteError::ConnectionClosed)?;
        outcome.await.map_err(|_| WriteError::ConnectionClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn frame(request_id: u64, cmd: Cmd, flags: FrameFlags, payload: &[u8]) -> Frame {
        Frame {
            request_id,
            cmd,
            flags,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[tokio::test]
    async fn reads_a_frame() {
        let (mut peer, ours) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(ours, ReadTimeout::new(0), 1024);
        let streams = StreamTable::new();

        let sent = frame(1, 7, FrameFlags::STREAM | FrameFlags::STREAM_END, b"hi");
        peer.write_all(&sent.encode()).await.unwrap();

        let (got, stream) = reader.read_frame(&streams).await.unwrap();
        assert_eq!(got, sent);
        assert_eq!(stream.id(), 1);
    }

    #[tokio::test]
    async fn payload_at_limit_is_accepted_one_past_is_rejected() {
        let max = 64u32;

        let (mut peer, ours) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(ours, ReadTimeout::new(0), max);
        let streams = StreamTable::new();

        let exact = frame(1, 0, FrameFlags::empty(), &vec![0xAB; max as usize]);
        peer.write_all(&exact.encode()).await.unwrap();
        let (got, _) = reader.read_frame(&streams).await.unwrap();
        assert_eq!(got.payload.len(), max as usize);

        // an oversize header is rejected before the payload is read
        let mut header = BytesMut::new();
        put_header(&mut header, max + 1, 2, 0, FrameFlags::empty());
        peer.write_all(&header).await.unwrap();
        assert!(matches!(
            reader.read_frame(&streams).await,
            Err(FrameError::InvalidPacket)
        ));
    }

    #[tokio::test]
    async fn reserved_request_id_is_rejected() {
        let (mut peer, ours) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(ours, ReadTimeout::new(0), 1024);
        let streams = StreamTable::new();

        peer.write_all(&frame(0, 0, FrameFlags::empty(), b"").encode())
            .await
            .unwrap();
        assert!(matches!(
            reader.read_frame(&streams).await,
            Err(FrameError::InvalidPacket)
        ));
    }

    #[tokio::test]
    async fn eof_is_reported() {
        let (peer, ours) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(ours, ReadTimeout::new(0), 1024);
        let streams = StreamTable::new();

        drop(peer);
        assert!(matches!(
            reader.read_frame(&streams).await,
            Err(FrameError::Eof)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_trips_the_read_deadline() {
        let (_peer, ours) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(ours, ReadTimeout::new(3), 1024);
        let streams = StreamTable::new();

        assert!(matches!(
            reader.read_frame(&streams).await,
            Err(FrameError::Timeout)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn set_read_timeout_applies_to_the_next_frame() {
        let (_peer, ours) = tokio::io::duplex(1024);
        let timeout = ReadTimeout::new(0);
        let mut reader = FrameReader::new(ours, timeout.clone(), 1024);
        let streams = StreamTable::new();

        let config = ReaderConfig::new(timeout);
        config.set_read_timeout(1);
        assert!(matches!(
            reader.read_frame(&streams).await,
            Err(FrameError::Timeout)
        ));
    }

    #[tokio::test]
    async fn writer_submits_an_encoded_frame() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut writer = FrameWriter::new(tx);

        writer.start_write(9, 3, FrameFlags::STREAM_END);
        writer.write_bytes(b"pay");
        writer.write_bytes(b"load");

        let submit = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request.request_id, 9);
            assert_eq!(request.flags, FrameFlags::STREAM_END);
            let expected = frame(9, 3, FrameFlags::STREAM_END, b"payload").encode();
            assert_eq!(request.buf, expected);
            request.done.send(Ok(())).unwrap();
        });

        writer.end_write().await.unwrap();
        submit.await.unwrap();
    }

    #[tokio::test]
    async fn writer_reports_closed_connection() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut writer = FrameWriter::new(tx);
        writer.start_write(1, 0, FrameFlags::empty());
        assert!(matches!(
            writer.end_write().await,
            Err(WriteError::ConnectionClosed)
        ));
    }
}
